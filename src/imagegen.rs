use futures_util::future::{BoxFuture, FutureExt};
use iced::widget::{button, column, container, image, pick_list, row, scrollable, text, text_input};
use iced::{Element, Length, Task};
use std::path::PathBuf;
use std::sync::Arc;

use crate::gemini::{ClientError, Collaborator, ImageOptions, InlineImage, Resolution};
use crate::keys::KeyStore;
use crate::media;

pub const ASPECT_RATIO: &str = "1:1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    KeyMissing,
    Idle,
    Generating,
    Generated,
}

#[derive(Debug, Clone)]
pub struct GalleryItem {
    pub image: InlineImage,
    pub preview: Option<image::Handle>,
}

impl GalleryItem {
    fn new(image: InlineImage) -> Self {
        let preview = match media::decode_inline(&image) {
            Ok(bytes) => Some(image::Handle::from_bytes(bytes)),
            Err(e) => {
                tracing::warn!("Generated image could not be decoded: {:#}", e);
                None
            }
        };
        GalleryItem { image, preview }
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    PromptChanged(String),
    ResolutionSelected(Resolution),
    Generate,
    Generated(Result<Vec<InlineImage>, Arc<ClientError>>),
    Download(usize),
    Downloaded(Result<PathBuf, String>),
    KeyInputChanged(String),
    OpenKeySelection,
    ConnectKey,
}

pub struct ImageGen {
    client: Arc<dyn Collaborator>,
    keys: Arc<dyn KeyStore>,
    downloads_dir: PathBuf,
    phase: Phase,
    prompt: String,
    resolution: Resolution,
    gallery: Vec<GalleryItem>,
    key_input: String,
    status: Option<String>,
}

impl ImageGen {
    pub fn new(client: Arc<dyn Collaborator>, keys: Arc<dyn KeyStore>, downloads_dir: PathBuf) -> Self {
        let phase = if keys.has_selected_api_key() {
            Phase::Idle
        } else {
            tracing::info!("No API key selected; image generation needs one");
            Phase::KeyMissing
        };

        ImageGen {
            client,
            keys,
            downloads_dir,
            phase,
            prompt: String::new(),
            resolution: Resolution::default(),
            gallery: Vec::new(),
            key_input: String::new(),
            status: None,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.phase == Phase::Generating
    }

    #[cfg(test)]
    pub fn gallery(&self) -> &[GalleryItem] {
        &self.gallery
    }

    pub fn set_prompt(&mut self, prompt: String) {
        self.prompt = prompt;
    }

    pub fn set_resolution(&mut self, resolution: Resolution) {
        self.resolution = resolution;
    }

    /// Starts one generation for the current prompt and resolution.
    pub fn generate(&mut self) -> Option<BoxFuture<'static, Result<Vec<InlineImage>, Arc<ClientError>>>> {
        if !matches!(self.phase, Phase::Idle | Phase::Generated) {
            return None;
        }
        let prompt = self.prompt.trim().to_string();
        if prompt.is_empty() {
            return None;
        }

        self.phase = Phase::Generating;
        self.gallery.clear();
        self.status = None;

        let client = self.client.clone();
        let options = ImageOptions {
            aspect_ratio: ASPECT_RATIO.to_string(),
            resolution: self.resolution,
        };
        tracing::info!("Generating {} image for {:?}", options.resolution, prompt);

        let request = async move { client.generate_images(&prompt, &options).await };
        Some(request.map(|result| result.map_err(Arc::new)).boxed())
    }

    pub fn finish_generation(&mut self, result: Result<Vec<InlineImage>, Arc<ClientError>>) {
        if self.phase != Phase::Generating {
            return;
        }

        match result {
            Ok(images) => {
                tracing::info!("Received {} image(s)", images.len());
                self.gallery = images.into_iter().map(GalleryItem::new).collect();
                self.phase = Phase::Generated;
            }
            Err(e) => {
                tracing::error!("Image generation failed: {}", e);
                self.gallery.clear();
                if e.is_auth() {
                    self.phase = Phase::KeyMissing;
                    self.keys.open_select_key();
                } else {
                    self.phase = Phase::Idle;
                }
            }
        }
    }

    /// Hands the entered key to the key store and leaves the key gate.
    pub fn connect_key(&mut self) {
        if self.phase != Phase::KeyMissing {
            return;
        }
        let key = std::mem::take(&mut self.key_input);
        if let Err(e) = self.keys.save_key(&key) {
            tracing::error!("Could not save API key: {:#}", e);
        }
        self.phase = Phase::Idle;
    }

    pub fn download(&self, index: usize) -> Option<BoxFuture<'static, Result<PathBuf, String>>> {
        let image = self.gallery.get(index)?.image.clone();
        let dir = self.downloads_dir.clone();
        Some(
            async move { media::save_generated(&dir, &image, index).map_err(|e| format!("{:#}", e)) }
                .boxed(),
        )
    }

    pub fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::PromptChanged(prompt) => {
                self.set_prompt(prompt);
                Task::none()
            }
            Message::ResolutionSelected(resolution) => {
                self.set_resolution(resolution);
                Task::none()
            }
            Message::Generate => match self.generate() {
                Some(request) => Task::future(request).map(Message::Generated),
                None => Task::none(),
            },
            Message::Generated(result) => {
                self.finish_generation(result);
                Task::none()
            }
            Message::Download(index) => match self.download(index) {
                Some(save) => Task::future(save).map(Message::Downloaded),
                None => Task::none(),
            },
            Message::Downloaded(Ok(path)) => {
                tracing::info!("Saved image to {}", path.display());
                self.status = Some(format!("Saved {}", path.display()));
                Task::none()
            }
            Message::Downloaded(Err(e)) => {
                tracing::error!("Saving image failed: {}", e);
                self.status = Some("Could not save the image.".to_string());
                Task::none()
            }
            Message::KeyInputChanged(value) => {
                self.key_input = value;
                Task::none()
            }
            Message::OpenKeySelection => {
                self.keys.open_select_key();
                Task::none()
            }
            Message::ConnectKey => {
                self.connect_key();
                Task::none()
            }
        }
    }

    fn view_key_gate(&self) -> Element<Message> {
        let key_field = text_input("Paste your Gemini API key", &self.key_input)
            .on_input(Message::KeyInputChanged)
            .on_submit(Message::ConnectKey)
            .secure(true)
            .padding(12)
            .size(15);

        let buttons = row![
            button(text("Get a key").size(14)).padding(10).on_press(Message::OpenKeySelection),
            button(text("Connect").size(14)).padding(10).on_press(Message::ConnectKey),
        ]
        .spacing(10);

        container(
            column![
                text("Image generation needs a Gemini API key.").size(18),
                text("Create one in the browser, paste it below, and connect.").size(14),
                key_field,
                buttons,
            ]
            .spacing(12)
            .max_width(520.0),
        )
        .padding(20)
        .width(Length::Fill)
        .into()
    }

    pub fn view(&self, frame: usize) -> Element<Message> {
        if self.phase == Phase::KeyMissing {
            return self.view_key_gate();
        }

        let generating = self.phase == Phase::Generating;

        let mut prompt = text_input("Describe the illustration you want...", &self.prompt)
            .padding(12)
            .size(16);
        if !generating {
            prompt = prompt.on_input(Message::PromptChanged).on_submit(Message::Generate);
        }

        let resolution = pick_list(Resolution::ALL, Some(self.resolution), Message::ResolutionSelected);

        let generate = button(text("Generate").size(14))
            .padding(10)
            .on_press_maybe((!generating && !self.prompt.trim().is_empty()).then_some(Message::Generate));

        let mut content = column![
            prompt,
            row![text("Resolution").size(14), resolution, generate]
                .spacing(10)
                .align_y(iced::alignment::Vertical::Center),
        ]
        .spacing(15);

        match self.phase {
            Phase::Generating => {
                content = content.push(crate::loading_indicator(frame, "Painting your picture..."));
            }
            Phase::Generated if self.gallery.is_empty() => {
                content = content.push(text("The model returned no images for this prompt.").size(15));
            }
            Phase::Generated => {
                let mut gallery = row![].spacing(15);
                for (index, item) in self.gallery.iter().enumerate() {
                    let picture: Element<Message> = match &item.preview {
                        Some(handle) => image(handle.clone()).width(Length::Fixed(320.0)).into(),
                        None => text("(preview unavailable)").size(13).into(),
                    };
                    gallery = gallery.push(
                        column![
                            picture,
                            button(text(format!("Save image {}", index + 1)).size(13))
                                .padding(8)
                                .on_press(Message::Download(index)),
                        ]
                        .spacing(8),
                    );
                }
                content = content.push(scrollable(gallery).direction(
                    scrollable::Direction::Horizontal(scrollable::Scrollbar::default()),
                ));
            }
            _ => {}
        }

        if let Some(status) = &self.status {
            content = content.push(text(status).size(13));
        }

        scrollable(container(content).padding(15).width(Length::Fill))
            .height(Length::Fill)
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::testing::FakeCollaborator;
    use crate::keys::testing::MemoryKeyStore;

    fn png(data: &str) -> InlineImage {
        InlineImage {
            mime_type: "image/png".to_string(),
            data: data.to_string(),
        }
    }

    fn generator(client: Arc<FakeCollaborator>, keys: Arc<MemoryKeyStore>) -> ImageGen {
        ImageGen::new(client, keys, PathBuf::from("/tmp"))
    }

    #[test]
    fn test_mount_without_key_is_gated() {
        let gen = generator(Arc::new(FakeCollaborator::default()), Arc::new(MemoryKeyStore::default()));
        assert_eq!(gen.phase(), Phase::KeyMissing);

        let gen = generator(Arc::new(FakeCollaborator::default()), Arc::new(MemoryKeyStore::with_key("k")));
        assert_eq!(gen.phase(), Phase::Idle);
    }

    #[test]
    fn test_empty_prompt_is_a_no_op() {
        let client = Arc::new(FakeCollaborator::default());
        let mut gen = generator(client.clone(), Arc::new(MemoryKeyStore::with_key("k")));
        gen.set_prompt("   ".to_string());

        assert!(gen.generate().is_none());
        assert_eq!(gen.phase(), Phase::Idle);
        assert_eq!(client.image_calls(), 0);
    }

    #[tokio::test]
    async fn test_requests_selected_resolution_and_collects_every_image() {
        let client = Arc::new(FakeCollaborator::with_images(Ok(vec![png("AAAA"), png("BBBB"), png("CCCC")])));
        let mut gen = generator(client.clone(), Arc::new(MemoryKeyStore::with_key("k")));
        gen.set_prompt("a lighthouse at dusk".to_string());
        gen.set_resolution(Resolution::FourK);

        let request = gen.generate().unwrap();
        assert_eq!(gen.phase(), Phase::Generating);
        assert!(gen.generate().is_none());

        gen.finish_generation(request.await);

        let options = client.last_image_options().unwrap();
        assert_eq!(options.resolution, Resolution::FourK);
        assert_eq!(options.aspect_ratio, "1:1");
        assert_eq!(gen.phase(), Phase::Generated);
        assert_eq!(gen.gallery().len(), 3);
        assert_eq!(gen.gallery()[1].image.data, "BBBB");
    }

    #[tokio::test]
    async fn test_zero_images_is_a_valid_result() {
        let client = Arc::new(FakeCollaborator::with_images(Ok(Vec::new())));
        let mut gen = generator(client, Arc::new(MemoryKeyStore::with_key("k")));
        gen.set_prompt("nothing".to_string());

        let request = gen.generate().unwrap();
        gen.finish_generation(request.await);

        assert_eq!(gen.phase(), Phase::Generated);
        assert!(gen.gallery().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_gates_and_opens_key_selection_once() {
        let client = Arc::new(FakeCollaborator::with_images(Err(ClientError::Api {
            status: 400,
            code: Some("INVALID_ARGUMENT".to_string()),
            reason: Some("API_KEY_INVALID".to_string()),
            message: "API key not valid".to_string(),
        })));
        let keys = Arc::new(MemoryKeyStore::with_key("stale"));
        let mut gen = generator(client, keys.clone());
        gen.set_prompt("a cat".to_string());

        let request = gen.generate().unwrap();
        gen.finish_generation(request.await);

        assert_eq!(gen.phase(), Phase::KeyMissing);
        assert_eq!(keys.open_count(), 1);
        assert!(gen.generate().is_none());
    }

    #[tokio::test]
    async fn test_other_failures_return_to_idle_quietly() {
        let client = Arc::new(FakeCollaborator::with_images(Err(ClientError::Api {
            status: 503,
            code: Some("UNAVAILABLE".to_string()),
            reason: None,
            message: "overloaded".to_string(),
        })));
        let keys = Arc::new(MemoryKeyStore::with_key("k"));
        let mut gen = generator(client, keys.clone());
        gen.set_prompt("a dog".to_string());

        let request = gen.generate().unwrap();
        gen.finish_generation(request.await);

        assert_eq!(gen.phase(), Phase::Idle);
        assert!(gen.gallery().is_empty());
        assert_eq!(keys.open_count(), 0);
    }

    #[test]
    fn test_connect_key_leaves_gate_unconditionally() {
        let keys = Arc::new(MemoryKeyStore::default());
        let mut gen = generator(Arc::new(FakeCollaborator::default()), keys.clone());
        assert_eq!(gen.phase(), Phase::KeyMissing);

        let _ = gen.update(Message::KeyInputChanged("fresh-key".to_string()));
        gen.connect_key();

        assert_eq!(gen.phase(), Phase::Idle);
        assert_eq!(keys.api_key().as_deref(), Some("fresh-key"));
    }

    #[tokio::test]
    async fn test_download_writes_indexed_file() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeCollaborator::with_images(Ok(vec![png("aGVsbG8="), png("d29ybGQ=")])));
        let mut gen = ImageGen::new(client, Arc::new(MemoryKeyStore::with_key("k")), dir.path().to_path_buf());
        gen.set_prompt("two words".to_string());
        let request = gen.generate().unwrap();
        gen.finish_generation(request.await);

        let path = gen.download(1).unwrap().await.unwrap();
        assert_eq!(path.file_name().unwrap(), "study-bar-image-2.png");
        assert_eq!(std::fs::read(path).unwrap(), b"world");
        assert!(gen.download(5).is_none());
    }
}
