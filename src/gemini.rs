//! Gemini REST client and the collaborator seam the panels talk to.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::config::GeminiConfig;
use crate::keys::KeyStore;

pub type FragmentStream = BoxStream<'static, Result<String, ClientError>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no Gemini API key is configured")]
    MissingKey,

    #[error("Gemini API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        reason: Option<String>,
        message: String,
    },

    #[error("Gemini request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode Gemini response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Gemini returned no content")]
    EmptyResponse,
}

impl ClientError {
    /// True when the failure means the key is missing or rejected.
    pub fn is_auth(&self) -> bool {
        match self {
            ClientError::MissingKey => true,
            ClientError::Api { status, code, reason, .. } => {
                matches!(status, 401 | 403)
                    || matches!(code.as_deref(), Some("UNAUTHENTICATED" | "PERMISSION_DENIED"))
                    || reason.as_deref() == Some("API_KEY_INVALID")
            }
            _ => false,
        }
    }
}

/// Output size tier for generated images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    #[default]
    OneK,
    TwoK,
    FourK,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Resolution::OneK, Resolution::TwoK, Resolution::FourK];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::OneK => "1K",
            Resolution::TwoK => "2K",
            Resolution::FourK => "4K",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageOptions {
    pub aspect_ratio: String,
    pub resolution: Resolution,
}

/// A base64 payload with its MIME type, sent or received inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

/// The model service as the panels see it.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// One non-streamed completion for an image plus instructions.
    async fn describe_image(
        &self,
        system_instruction: &str,
        prompt: &str,
        image: &InlineImage,
    ) -> Result<String, ClientError>;

    /// Every inline image of the first candidate, in order.
    async fn generate_images(
        &self,
        prompt: &str,
        options: &ImageOptions,
    ) -> Result<Vec<InlineImage>, ClientError>;

    /// Opens a conversation bound to `system_instruction`.
    fn start_chat(&self, system_instruction: &str) -> Arc<dyn ChatSession>;
}

/// A stateful multi-turn conversation.
pub trait ChatSession: Send + Sync {
    /// Sends one user turn and yields the reply as it arrives.
    fn send_message_stream(&self, text: String) -> FragmentStream;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<String>,
    image_config: ImageConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageConfig {
    aspect_ratio: String,
    image_size: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn new(role: &str, parts: Vec<Part>) -> Self {
        Content {
            role: Some(role.to_string()),
            parts,
        }
    }

    fn system(text: &str) -> Self {
        Content {
            role: None,
            parts: vec![Part::text(text)],
        }
    }

    fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|part| !part.thought.unwrap_or(false))
            .filter_map(|part| part.text.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineImage>,
    #[serde(default, skip_serializing)]
    thought: Option<bool>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Part {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    fn image(image: InlineImage) -> Self {
        Part {
            inline_data: Some(image),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

impl GenerateContentResponse {
    fn first_content(&self) -> Option<&Content> {
        self.candidates.first().and_then(|c| c.content.as_ref())
    }

    fn text(&self) -> Option<String> {
        self.first_content().map(Content::text).filter(|t| !t.is_empty())
    }

    fn inline_images(self) -> Vec<InlineImage> {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.inline_data)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: Option<String>,
}

impl ErrorBody {
    fn into_error(self, http_status: u16, raw: &str) -> ClientError {
        ClientError::Api {
            status: self.code.unwrap_or(http_status),
            reason: self.details.into_iter().find_map(|d| d.reason),
            message: self.message.unwrap_or_else(|| raw.to_string()),
            code: self.status,
        }
    }
}

fn api_error(status: u16, body: &str) -> ClientError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error.into_error(status, body),
        Err(_) => ClientError::Api {
            status,
            code: None,
            reason: None,
            message: body.trim().to_string(),
        },
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    analysis_model: String,
    image_model: String,
    chat_model: String,
    keys: Arc<dyn KeyStore>,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig, keys: Arc<dyn KeyStore>) -> Self {
        GeminiClient {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            analysis_model: config.analysis_model.clone(),
            image_model: config.image_model.clone(),
            chat_model: config.chat_model.clone(),
            keys,
        }
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    async fn post(
        &self,
        url: &str,
        request: &GenerateContentRequest,
    ) -> Result<reqwest::Response, ClientError> {
        let key = self.keys.api_key().ok_or(ClientError::MissingKey)?;

        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", key)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }

        Ok(response)
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, ClientError> {
        let url = self.endpoint(model, "generateContent");
        tracing::debug!("POST {}", url);
        let body = self.post(&url, request).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn analysis_request(system_instruction: &str, prompt: &str, image: &InlineImage) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content::new(
            "user",
            vec![Part::image(image.clone()), Part::text(prompt)],
        )],
        system_instruction: Some(Content::system(system_instruction)),
        generation_config: None,
    }
}

fn image_request(prompt: &str, options: &ImageOptions) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content::new("user", vec![Part::text(prompt)])],
        system_instruction: None,
        generation_config: Some(GenerationConfig {
            response_modalities: vec!["TEXT".to_string(), "IMAGE".to_string()],
            image_config: ImageConfig {
                aspect_ratio: options.aspect_ratio.clone(),
                image_size: options.resolution.as_str().to_string(),
            },
        }),
    }
}

#[async_trait]
impl Collaborator for GeminiClient {
    async fn describe_image(
        &self,
        system_instruction: &str,
        prompt: &str,
        image: &InlineImage,
    ) -> Result<String, ClientError> {
        let request = analysis_request(system_instruction, prompt, image);
        let response = self.generate(&self.analysis_model, &request).await?;
        response.text().ok_or(ClientError::EmptyResponse)
    }

    async fn generate_images(
        &self,
        prompt: &str,
        options: &ImageOptions,
    ) -> Result<Vec<InlineImage>, ClientError> {
        let request = image_request(prompt, options);
        let response = self.generate(&self.image_model, &request).await?;
        let images = response.inline_images();
        tracing::debug!("Gemini returned {} image(s)", images.len());
        Ok(images)
    }

    fn start_chat(&self, system_instruction: &str) -> Arc<dyn ChatSession> {
        Arc::new(GeminiChat {
            client: self.clone(),
            model: self.chat_model.clone(),
            system_instruction: Content::system(system_instruction),
            history: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

/// Conversation handle backed by `streamGenerateContent`.
#[derive(Clone)]
pub struct GeminiChat {
    client: GeminiClient,
    model: String,
    system_instruction: Content,
    history: Arc<Mutex<Vec<Content>>>,
}

impl GeminiChat {
    fn request_with(&self, user: &Content) -> GenerateContentRequest {
        let mut contents = self
            .history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        contents.push(user.clone());

        GenerateContentRequest {
            contents,
            system_instruction: Some(self.system_instruction.clone()),
            generation_config: None,
        }
    }

    fn stream_url(&self) -> String {
        format!(
            "{}?alt=sse",
            self.client.endpoint(&self.model, "streamGenerateContent")
        )
    }

    fn commit(&self, user: Content, reply: String) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.push(user);
        history.push(Content::new("model", vec![Part::text(reply)]));
    }

    #[cfg(test)]
    fn history_len(&self) -> usize {
        self.history.lock().unwrap().len()
    }
}

impl ChatSession for GeminiChat {
    fn send_message_stream(&self, text: String) -> FragmentStream {
        let chat = self.clone();
        let user = Content::new("user", vec![Part::text(text)]);

        let connect = async move {
            let request = chat.request_with(&user);
            let url = chat.stream_url();
            tracing::debug!("POST {}", url);
            let response = chat.client.post(&url, &request).await?;
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed();
            Ok::<_, ClientError>(TurnReader::new(chat, user, body))
        };

        stream::once(connect)
            .map(|connected| match connected {
                Ok(reader) => reader.into_stream(),
                Err(err) => stream::iter([Err(err)]).boxed(),
            })
            .flatten()
            .boxed()
    }
}

/// Reads one streamed reply and commits the turn once the body ends cleanly.
struct TurnReader {
    chat: GeminiChat,
    user: Content,
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    reply: String,
    finished: bool,
}

impl TurnReader {
    fn new(
        chat: GeminiChat,
        user: Content,
        body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    ) -> Self {
        TurnReader {
            chat,
            user,
            body,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            reply: String::new(),
            finished: false,
        }
    }

    fn feed(&mut self, events: Vec<String>) -> Result<(), ClientError> {
        for event in events {
            let chunk: GenerateContentResponse = serde_json::from_str(&event)?;
            if let Some(error) = chunk.error {
                return Err(error.into_error(500, &event));
            }
            if let Some(fragment) = chunk.text() {
                self.reply.push_str(&fragment);
                self.pending.push_back(fragment);
            }
        }
        Ok(())
    }

    fn into_stream(self) -> FragmentStream {
        stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            loop {
                if let Some(fragment) = reader.pending.pop_front() {
                    return Some((Ok(fragment), Some(reader)));
                }
                if reader.finished {
                    if reader.reply.is_empty() {
                        return Some((Err(ClientError::EmptyResponse), None));
                    }
                    reader.chat.commit(reader.user, reader.reply);
                    return None;
                }

                match reader.body.next().await {
                    Some(Ok(chunk)) => {
                        let events = reader.decoder.push(&chunk);
                        if let Err(err) = reader.feed(events) {
                            return Some((Err(err), None));
                        }
                    }
                    Some(Err(err)) => return Some((Err(ClientError::Transport(err)), None)),
                    None => {
                        reader.finished = true;
                        let tail = reader.decoder.finish().into_iter().collect();
                        if let Err(err) = reader.feed(tail) {
                            return Some((Err(err), None));
                        }
                    }
                }
            }
        })
        .boxed()
    }
}

/// Splits a server-sent-event byte stream into `data:` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = Self::data_line(&line) {
                events.push(data);
            }
        }
        events
    }

    /// Flushes a final line that had no trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        Self::data_line(&line)
    }

    fn data_line(line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
        let data = line.strip_prefix("data:")?.trim_start();
        if data.is_empty() || data == "[DONE]" {
            None
        } else {
            Some(data.to_string())
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted stand-in for the Gemini service.
    #[derive(Default)]
    pub struct FakeCollaborator {
        analysis: Mutex<Option<Result<String, ClientError>>>,
        images: Mutex<Option<Result<Vec<InlineImage>, ClientError>>>,
        describe_calls: AtomicUsize,
        image_calls: AtomicUsize,
        chats_started: AtomicUsize,
        last_instruction: Mutex<Option<String>>,
        last_image_options: Mutex<Option<ImageOptions>>,
        pub session: Arc<FakeSession>,
    }

    impl FakeCollaborator {
        pub fn with_analysis(result: Result<String, ClientError>) -> Self {
            let fake = FakeCollaborator::default();
            *fake.analysis.lock().unwrap() = Some(result);
            fake
        }

        pub fn with_images(result: Result<Vec<InlineImage>, ClientError>) -> Self {
            let fake = FakeCollaborator::default();
            *fake.images.lock().unwrap() = Some(result);
            fake
        }

        pub fn with_chat(turns: Vec<Vec<Result<String, ClientError>>>) -> Self {
            FakeCollaborator {
                session: Arc::new(FakeSession::new(turns)),
                ..Default::default()
            }
        }

        pub fn describe_calls(&self) -> usize {
            self.describe_calls.load(Ordering::SeqCst)
        }

        pub fn image_calls(&self) -> usize {
            self.image_calls.load(Ordering::SeqCst)
        }

        pub fn chats_started(&self) -> usize {
            self.chats_started.load(Ordering::SeqCst)
        }

        pub fn last_instruction(&self) -> Option<String> {
            self.last_instruction.lock().unwrap().clone()
        }

        pub fn last_image_options(&self) -> Option<ImageOptions> {
            self.last_image_options.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Collaborator for FakeCollaborator {
        async fn describe_image(
            &self,
            system_instruction: &str,
            _prompt: &str,
            _image: &InlineImage,
        ) -> Result<String, ClientError> {
            self.describe_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_instruction.lock().unwrap() = Some(system_instruction.to_string());
            self.analysis.lock().unwrap().take().unwrap_or(Err(ClientError::EmptyResponse))
        }

        async fn generate_images(
            &self,
            _prompt: &str,
            options: &ImageOptions,
        ) -> Result<Vec<InlineImage>, ClientError> {
            self.image_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_image_options.lock().unwrap() = Some(options.clone());
            self.images.lock().unwrap().take().unwrap_or(Ok(Vec::new()))
        }

        fn start_chat(&self, system_instruction: &str) -> Arc<dyn ChatSession> {
            self.chats_started.fetch_add(1, Ordering::SeqCst);
            *self.last_instruction.lock().unwrap() = Some(system_instruction.to_string());
            self.session.clone()
        }
    }

    /// Replays one scripted list of fragments per sent message.
    #[derive(Default)]
    pub struct FakeSession {
        turns: Mutex<VecDeque<Vec<Result<String, ClientError>>>>,
        sent: Mutex<Vec<String>>,
    }

    impl FakeSession {
        pub fn new(turns: Vec<Vec<Result<String, ClientError>>>) -> Self {
            FakeSession {
                turns: Mutex::new(turns.into()),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl ChatSession for FakeSession {
        fn send_message_stream(&self, text: String) -> FragmentStream {
            self.sent.lock().unwrap().push(text);
            let items = self.turns.lock().unwrap().pop_front().unwrap_or_default();
            stream::iter(items).boxed()
        }
    }
}
