use chrono::{DateTime, Local};
use futures_util::StreamExt;
use iced::widget::{button, column, container, row, scrollable, text, text_input};
use iced::{alignment, Element, Length, Task};
use std::sync::Arc;

use crate::gemini::{ChatSession, ClientError, Collaborator, FragmentStream};
use crate::markdown;

pub const SYSTEM_INSTRUCTION: &str = "You are a friendly, encouraging tutor for students. \
Explain ideas step by step, check understanding with short questions, and prefer hints \
over handing out final answers unless the student asks for them. Format replies in \
Markdown with short paragraphs and lists.";

pub const GREETING: &str =
    "Hi! I'm your study tutor. Ask me about any subject and we'll work through it together.";

pub const CHAT_FAILED: &str = "Sorry, I ran into a problem answering that. Please try again.";

/// Correlates a streamed reply with the placeholder it fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub turn: TurnId,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub enum Message {
    InputChanged(String),
    Send,
    Fragment(TurnId, Result<String, Arc<ClientError>>),
    TurnFinished(TurnId),
    Clear,
}

pub struct Chat {
    client: Arc<dyn Collaborator>,
    session: Arc<dyn ChatSession>,
    transcript: Vec<ChatMessage>,
    input: String,
    typing: bool,
    active_turn: Option<TurnId>,
    next_turn: u64,
    input_id: text_input::Id,
}

impl Chat {
    pub fn new(client: Arc<dyn Collaborator>) -> Self {
        let session = client.start_chat(SYSTEM_INSTRUCTION);
        let mut chat = Chat {
            client,
            session,
            transcript: Vec::new(),
            input: String::new(),
            typing: false,
            active_turn: None,
            next_turn: 0,
            input_id: text_input::Id::unique(),
        };
        chat.greet();
        chat
    }

    pub fn focus(&self) -> Task<Message> {
        text_input::focus(self.input_id.clone())
    }

    #[cfg(test)]
    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    pub fn set_input(&mut self, input: String) {
        self.input = input;
    }

    fn allocate_turn(&mut self) -> TurnId {
        self.next_turn += 1;
        TurnId(self.next_turn)
    }

    fn push(&mut self, turn: TurnId, role: Role, text: String) {
        self.transcript.push(ChatMessage {
            turn,
            role,
            text,
            timestamp: Local::now(),
        });
    }

    fn greet(&mut self) {
        let turn = self.allocate_turn();
        self.push(turn, Role::Model, GREETING.to_string());
    }

    /// Sends the current input as one user turn.
    ///
    /// Returns nothing when the trimmed input is empty or a reply is still
    /// streaming. Otherwise the user message and an empty model placeholder
    /// are appended, and the returned stream fills that placeholder.
    pub fn send(&mut self) -> Option<(TurnId, FragmentStream)> {
        if self.typing {
            return None;
        }
        let text = self.input.trim().to_string();
        if text.is_empty() {
            return None;
        }

        let turn = self.allocate_turn();
        self.push(turn, Role::User, text.clone());
        self.input.clear();
        self.typing = true;
        self.push(turn, Role::Model, String::new());
        self.active_turn = Some(turn);

        tracing::debug!("Sending turn {:?} ({} chars)", turn, text.len());
        Some((turn, self.session.send_message_stream(text)))
    }

    /// Applies one streamed item to the placeholder of `turn`.
    pub fn receive(&mut self, turn: TurnId, item: Result<String, Arc<ClientError>>) {
        match item {
            Ok(fragment) => {
                let placeholder = self
                    .transcript
                    .iter_mut()
                    .rev()
                    .find(|m| m.turn == turn && m.role == Role::Model);
                match placeholder {
                    Some(message) => message.text.push_str(&fragment),
                    None => tracing::warn!("Dropping fragment for unknown turn {:?}", turn),
                }
            }
            Err(e) => {
                tracing::error!("Chat turn {:?} failed: {}", turn, e);
                let apology = self.allocate_turn();
                self.push(apology, Role::Model, CHAT_FAILED.to_string());
                self.finish_turn(turn);
            }
        }
    }

    pub fn finish_turn(&mut self, turn: TurnId) {
        if self.active_turn == Some(turn) {
            self.active_turn = None;
            self.typing = false;
        }
    }

    /// Starts over with a fresh conversation handle.
    pub fn clear(&mut self) {
        if self.typing {
            return;
        }
        self.transcript.clear();
        self.session = self.client.start_chat(SYSTEM_INSTRUCTION);
        self.greet();
    }

    pub fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::InputChanged(value) => {
                self.set_input(value);
                Task::none()
            }
            Message::Send => match self.send() {
                Some((turn, stream)) => {
                    let fragments = stream.map(|item| item.map_err(Arc::new));
                    Task::run(fragments, move |item| Message::Fragment(turn, item))
                        .chain(Task::done(Message::TurnFinished(turn)))
                }
                None => Task::none(),
            },
            Message::Fragment(turn, item) => {
                self.receive(turn, item);
                Task::none()
            }
            Message::TurnFinished(turn) => {
                self.finish_turn(turn);
                self.focus()
            }
            Message::Clear => {
                self.clear();
                self.focus()
            }
        }
    }

    fn view_message<'a>(&self, message: &'a ChatMessage, frame: usize) -> Element<'a, Message> {
        let (label, align) = match message.role {
            Role::User => ("You", alignment::Horizontal::Right),
            Role::Model => ("Tutor", alignment::Horizontal::Left),
        };
        let header = text(format!("{} · {}", label, message.timestamp.format("%H:%M"))).size(12);

        let body: Element<'a, Message> = match message.role {
            Role::User => text(&message.text).size(15).into(),
            Role::Model if message.text.is_empty() && self.active_turn == Some(message.turn) => {
                crate::loading_indicator(frame, "Thinking...")
            }
            Role::Model => markdown::view(&message.text),
        };

        container(
            container(column![header, body].spacing(6))
                .padding(12)
                .max_width(640.0)
                .style(container::rounded_box),
        )
        .width(Length::Fill)
        .align_x(align)
        .into()
    }

    pub fn view(&self, frame: usize) -> Element<Message> {
        let messages = self
            .transcript
            .iter()
            .fold(column![].spacing(12), |col, message| col.push(self.view_message(message, frame)));

        let history = scrollable(container(messages).padding(15).width(Length::Fill))
            .anchor_bottom()
            .height(Length::Fill);

        let mut input = text_input("Ask your tutor anything...", &self.input)
            .padding(15)
            .size(16)
            .id(self.input_id.clone());
        if !self.typing {
            input = input.on_input(Message::InputChanged).on_submit(Message::Send);
        }

        let send = button(text("Send").size(14))
            .padding(12)
            .on_press_maybe((!self.typing && !self.input.trim().is_empty()).then_some(Message::Send));

        let clear = button(text("New chat").size(14))
            .padding(12)
            .on_press_maybe((!self.typing).then_some(Message::Clear));

        column![history, row![input, send, clear].spacing(10)]
            .spacing(10)
            .padding(10)
            .into()
    }
}
