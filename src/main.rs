mod analyzer;
mod chat;
mod config;
mod gemini;
mod imagegen;
mod keys;
mod markdown;
mod media;
mod router;

use iced::{
    widget::{button, column, container, row, text},
    alignment, time, window, Element, Length, Size, Subscription, Task, Theme,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::gemini::{Collaborator, GeminiClient};
use crate::keys::{FileKeyStore, KeyStore};
use crate::router::ViewSelection;

const LOG_ENV_VAR: &str = "STUDYBAR_LOG";

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new("study_bar=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> iced::Result {
    init_logging();
    let config = Config::load();

    let window_settings = window::Settings {
        size: Size::new(config.window.width as f32, config.window.height as f32),
        min_size: Some(Size::new(
            config.window.min_width as f32,
            config.window.min_height as f32,
        )),
        position: window::Position::Centered,
        ..Default::default()
    };

    iced::application("Study Bar", App::update, App::view)
        .theme(App::theme)
        .subscription(App::subscription)
        .window(window_settings)
        .run_with(move || App::new(config))
}

/// Animated spinner with a caption, shown while a request is outstanding.
pub(crate) fn loading_indicator<'a, M: 'a>(frame: usize, caption: &'a str) -> Element<'a, M> {
    let loading_frames = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
    let spinner_idx = frame % loading_frames.len();

    container(
        row![text(loading_frames[spinner_idx]).size(24), text(caption).size(15)]
            .spacing(10)
            .align_y(alignment::Vertical::Center),
    )
    .padding(10)
    .into()
}

/// What every panel is built from.
struct Services {
    config: Config,
    client: Arc<dyn Collaborator>,
    keys: Arc<dyn KeyStore>,
}

enum Panel {
    Analyzer(analyzer::Analyzer),
    ImageGen(imagegen::ImageGen),
    Chat(chat::Chat),
}

#[derive(Debug, Clone)]
enum PanelMessage {
    Analyzer(analyzer::Message),
    ImageGen(imagegen::Message),
    Chat(chat::Message),
}

impl Panel {
    fn mount(selection: ViewSelection, services: &Services) -> (Self, Task<PanelMessage>) {
        tracing::debug!("Mounting {} panel", selection);
        match selection {
            ViewSelection::Analyzer => (
                Panel::Analyzer(analyzer::Analyzer::new(
                    services.client.clone(),
                    services.config.analyzer.max_image_dimension,
                    services.config.downloads_dir(),
                )),
                Task::none(),
            ),
            ViewSelection::ImageGen => (
                Panel::ImageGen(imagegen::ImageGen::new(
                    services.client.clone(),
                    services.keys.clone(),
                    services.config.downloads_dir(),
                )),
                Task::none(),
            ),
            ViewSelection::Chat => {
                let chat = chat::Chat::new(services.client.clone());
                let focus = chat.focus().map(PanelMessage::Chat);
                (Panel::Chat(chat), focus)
            }
        }
    }

    fn selection(&self) -> ViewSelection {
        match self {
            Panel::Analyzer(_) => ViewSelection::Analyzer,
            Panel::ImageGen(_) => ViewSelection::ImageGen,
            Panel::Chat(_) => ViewSelection::Chat,
        }
    }

    fn is_busy(&self) -> bool {
        match self {
            Panel::Analyzer(analyzer) => analyzer.is_busy(),
            Panel::ImageGen(generator) => generator.is_busy(),
            Panel::Chat(chat) => chat.is_typing(),
        }
    }

    fn update(&mut self, message: PanelMessage) -> Task<PanelMessage> {
        match (self, message) {
            (Panel::Analyzer(analyzer), PanelMessage::Analyzer(message)) => {
                analyzer.update(message).map(PanelMessage::Analyzer)
            }
            (Panel::ImageGen(generator), PanelMessage::ImageGen(message)) => {
                generator.update(message).map(PanelMessage::ImageGen)
            }
            (Panel::Chat(chat), PanelMessage::Chat(message)) => chat.update(message).map(PanelMessage::Chat),
            (panel, message) => {
                tracing::debug!("{} panel ignoring {:?}", panel.selection(), message);
                Task::none()
            }
        }
    }

    fn view(&self, frame: usize) -> Element<PanelMessage> {
        match self {
            Panel::Analyzer(analyzer) => analyzer.view(frame).map(PanelMessage::Analyzer),
            Panel::ImageGen(generator) => generator.view(frame).map(PanelMessage::ImageGen),
            Panel::Chat(chat) => chat.view(frame).map(PanelMessage::Chat),
        }
    }
}

#[derive(Debug, Clone)]
enum Message {
    SelectView(ViewSelection),
    Panel(u64, PanelMessage),
    Tick,
}

struct App {
    services: Services,
    panel: Panel,
    epoch: u64,
    loading_frame: usize,
}

impl App {
    fn new(config: Config) -> (Self, Task<Message>) {
        let keys: Arc<dyn KeyStore> = Arc::new(FileKeyStore::new(
            Config::get_config_dir().join("api_key"),
            config.gemini.api_key.clone(),
        ));
        let client: Arc<dyn Collaborator> = Arc::new(GeminiClient::new(&config.gemini, keys.clone()));

        tracing::info!(
            "Using {} for analysis, {} for images, {} for chat",
            config.gemini.analysis_model,
            config.gemini.image_model,
            config.gemini.chat_model
        );

        Self::with_services(Services { config, client, keys })
    }

    fn with_services(services: Services) -> (Self, Task<Message>) {
        let start = services.config.start_view();
        let (panel, task) = Panel::mount(start, &services);

        let app = App {
            services,
            panel,
            epoch: 0,
            loading_frame: 0,
        };
        (app, task.map(|m| Message::Panel(0, m)))
    }

    fn selection(&self) -> ViewSelection {
        self.panel.selection()
    }

    /// Swaps in a freshly mounted panel. Results still in flight for the old
    /// panel carry the old epoch and are dropped.
    fn select(&mut self, selection: ViewSelection) -> Task<Message> {
        if selection == self.selection() {
            return Task::none();
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let (panel, task) = Panel::mount(selection, &self.services);
        self.panel = panel;
        task.map(move |m| Message::Panel(epoch, m))
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::SelectView(selection) => self.select(selection),
            Message::Panel(epoch, message) => {
                if epoch != self.epoch {
                    tracing::debug!("Dropping message for unmounted panel: {:?}", message);
                    return Task::none();
                }
                self.panel
                    .update(message)
                    .map(move |m| Message::Panel(epoch, m))
            }
            Message::Tick => {
                if self.panel.is_busy() {
                    self.loading_frame = (self.loading_frame + 1) % 80;
                }
                Task::none()
            }
        }
    }

    fn subscription(&self) -> Subscription<Message> {
        if self.panel.is_busy() {
            time::every(Duration::from_millis(80)).map(|_| Message::Tick)
        } else {
            Subscription::none()
        }
    }

    fn view(&self) -> Element<Message> {
        let current = self.selection();
        let nav = ViewSelection::ALL.iter().fold(row![].spacing(8), |nav, selection| {
            let style = if *selection == current {
                button::primary
            } else {
                button::secondary
            };
            nav.push(
                button(text(selection.label()).size(14))
                    .padding([8, 16])
                    .style(style)
                    .on_press(Message::SelectView(*selection)),
            )
        });

        let epoch = self.epoch;
        let panel = self
            .panel
            .view(self.loading_frame)
            .map(move |m| Message::Panel(epoch, m));

        container(column![container(nav).padding(10), panel].spacing(5))
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }

    fn theme(&self) -> Theme {
        Theme::TokyoNight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::testing::FakeCollaborator;
    use crate::keys::testing::MemoryKeyStore;

    fn app_with(client: Arc<FakeCollaborator>, start_view: &str) -> App {
        let mut config = Config::default();
        config.ui.start_view = start_view.to_string();
        let services = Services {
            config,
            client,
            keys: Arc::new(MemoryKeyStore::with_key("k")),
        };
        App::with_services(services).0
    }

    fn chat_transcript_len(app: &App) -> usize {
        match &app.panel {
            Panel::Chat(chat) => chat.transcript().len(),
            _ => panic!("chat panel is not mounted"),
        }
    }

    #[test]
    fn test_starts_on_configured_view() {
        let app = app_with(Arc::new(FakeCollaborator::default()), "");
        assert_eq!(app.selection(), ViewSelection::Analyzer);

        let app = app_with(Arc::new(FakeCollaborator::default()), "chat");
        assert_eq!(app.selection(), ViewSelection::Chat);
    }

    #[test]
    fn test_every_view_is_reachable_from_every_other() {
        let mut app = app_with(Arc::new(FakeCollaborator::default()), "analyzer");
        for from in ViewSelection::ALL {
            for to in ViewSelection::ALL {
                let _ = app.update(Message::SelectView(from));
                assert_eq!(app.selection(), from);
                let _ = app.update(Message::SelectView(to));
                assert_eq!(app.selection(), to);
            }
        }
    }

    #[test]
    fn test_remount_resets_panel_state() {
        let client = Arc::new(FakeCollaborator::with_chat(vec![vec![Ok("hi".to_string())]]));
        let mut app = app_with(client.clone(), "chat");
        let epoch = app.epoch;

        let _ = app.update(Message::Panel(epoch, PanelMessage::Chat(chat::Message::InputChanged("hello".to_string()))));
        let _ = app.update(Message::Panel(epoch, PanelMessage::Chat(chat::Message::Send)));
        assert_eq!(chat_transcript_len(&app), 3);

        let _ = app.update(Message::SelectView(ViewSelection::ImageGen));
        let _ = app.update(Message::SelectView(ViewSelection::Chat));

        assert_eq!(chat_transcript_len(&app), 1);
        assert_eq!(client.chats_started(), 2);
    }

    #[test]
    fn test_reselecting_current_view_keeps_state() {
        let client = Arc::new(FakeCollaborator::with_chat(vec![vec![Ok("hi".to_string())]]));
        let mut app = app_with(client.clone(), "chat");
        let epoch = app.epoch;

        let _ = app.update(Message::Panel(epoch, PanelMessage::Chat(chat::Message::InputChanged("hello".to_string()))));
        let _ = app.update(Message::Panel(epoch, PanelMessage::Chat(chat::Message::Send)));
        let _ = app.update(Message::SelectView(ViewSelection::Chat));

        assert_eq!(app.epoch, epoch);
        assert_eq!(chat_transcript_len(&app), 3);
        assert_eq!(client.chats_started(), 1);
    }

    #[test]
    fn test_results_for_unmounted_panel_are_dropped() {
        let client = Arc::new(FakeCollaborator::with_chat(vec![vec![Ok("hi".to_string())]]));
        let mut app = app_with(client, "chat");
        let old_epoch = app.epoch;

        let _ = app.update(Message::SelectView(ViewSelection::Analyzer));
        let _ = app.update(Message::SelectView(ViewSelection::Chat));
        assert_ne!(app.epoch, old_epoch);

        let _ = app.update(Message::Panel(old_epoch, PanelMessage::Chat(chat::Message::Clear)));
        let stale = chat::Message::InputChanged("stale".to_string());
        let _ = app.update(Message::Panel(old_epoch, PanelMessage::Chat(stale)));
        let _ = app.update(Message::Panel(app.epoch, PanelMessage::Chat(chat::Message::Send)));

        assert_eq!(chat_transcript_len(&app), 1);
    }

    #[test]
    fn test_mismatched_panel_message_is_ignored() {
        let mut app = app_with(Arc::new(FakeCollaborator::default()), "analyzer");
        let epoch = app.epoch;
        let _ = app.update(Message::Panel(epoch, PanelMessage::Chat(chat::Message::Send)));
        assert_eq!(app.selection(), ViewSelection::Analyzer);
    }
}
