use futures_util::future::{BoxFuture, FutureExt};
use iced::widget::{button, column, container, image, row, scrollable, text};
use iced::{font, window, Element, Font, Length, Task};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::gemini::Collaborator;
use crate::{markdown, media};

pub const SYSTEM_INSTRUCTION: &str = "You are a patient tutor reviewing a photo or scan of a student's document. \
Read everything in the image carefully, then answer in Markdown using exactly these six \
second-level headings, in this order:\n\
## Problem Summary\n\
## Key Concepts\n\
## Step-by-Step Solution\n\
## Final Answer\n\
## Common Mistakes\n\
## Practice Next\n\
Do not use '## ' anywhere else. Keep each section focused and use lists or short \
paragraphs under each heading.";

pub const ANALYSIS_PROMPT: &str = "Analyze this document.";

pub const ANALYSIS_FAILED: &str =
    "Sorry, something went wrong while analyzing the image. Please try again.";

const SECTION_DELIMITER: &str = "## ";

#[derive(Debug, Clone)]
pub struct SelectedImage {
    pub name: String,
    pub mime_type: String,
    pub bytes: Arc<Vec<u8>>,
    pub preview: image::Handle,
}

impl SelectedImage {
    pub fn from_bytes(path: &Path, bytes: Vec<u8>) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());

        SelectedImage {
            name,
            mime_type: media::detect_mime_type(&bytes, path),
            preview: image::Handle::from_bytes(bytes.clone()),
            bytes: Arc::new(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub title: String,
    pub body: String,
}

/// Splits a response on `"## "`. Text before the first heading is dropped.
pub fn parse_sections(response: &str) -> Vec<Section> {
    response
        .split(SECTION_DELIMITER)
        .skip(1)
        .map(|segment| {
            let (title, body) = segment.split_once('\n').unwrap_or((segment, ""));
            Section {
                title: title.trim().to_string(),
                body: body.trim().to_string(),
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub enum Message {
    PickImage,
    ImagePicked(Option<SelectedImage>),
    Analyze,
    Analyzed(Result<String, Arc<anyhow::Error>>),
    ExportSnapshot,
    WindowFound(Option<window::Id>),
    SnapshotCaptured(window::Screenshot),
    SnapshotSaved(Result<PathBuf, String>),
    AlertClosed,
    Reset,
}

pub struct Analyzer {
    client: Arc<dyn Collaborator>,
    max_image_dimension: u32,
    downloads_dir: PathBuf,
    selected: Option<SelectedImage>,
    result: Option<String>,
    analyzing: bool,
    exporting: bool,
    status: Option<String>,
}

impl Analyzer {
    pub fn new(client: Arc<dyn Collaborator>, max_image_dimension: u32, downloads_dir: PathBuf) -> Self {
        Analyzer {
            client,
            max_image_dimension,
            downloads_dir,
            selected: None,
            result: None,
            analyzing: false,
            exporting: false,
            status: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.analyzing
    }

    #[cfg(test)]
    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    #[cfg(test)]
    pub fn selected(&self) -> Option<&SelectedImage> {
        self.selected.as_ref()
    }

    pub fn sections(&self) -> Vec<Section> {
        self.result.as_deref().map(parse_sections).unwrap_or_default()
    }

    /// Replaces the chosen image and drops any previous result.
    pub fn select_image(&mut self, image: SelectedImage) {
        if self.analyzing {
            return;
        }
        tracing::info!("Selected {} ({})", image.name, image.mime_type);
        self.selected = Some(image);
        self.result = None;
        self.status = None;
    }

    /// Starts one analysis of the selected image, if there is one and none is running.
    pub fn analyze(&mut self) -> Option<BoxFuture<'static, Result<String, Arc<anyhow::Error>>>> {
        if self.analyzing {
            return None;
        }
        let selected = self.selected.as_ref()?;

        let client = self.client.clone();
        let bytes = selected.bytes.clone();
        let mime_type = selected.mime_type.clone();
        let max_dimension = self.max_image_dimension;

        self.analyzing = true;
        self.result = None;
        self.status = None;

        let request = async move {
            let image = media::encode_for_upload(&bytes, &mime_type, max_dimension)?;
            let text = client
                .describe_image(SYSTEM_INSTRUCTION, ANALYSIS_PROMPT, &image)
                .await?;
            Ok::<_, anyhow::Error>(text)
        };

        Some(request.map(|result| result.map_err(Arc::new)).boxed())
    }

    pub fn finish_analysis(&mut self, result: Result<String, Arc<anyhow::Error>>) {
        self.analyzing = false;
        match result {
            Ok(text) => {
                tracing::info!("Analysis finished ({} sections)", parse_sections(&text).len());
                self.result = Some(text);
            }
            Err(e) => {
                tracing::error!("Analysis failed: {:#}", e);
                self.result = Some(ANALYSIS_FAILED.to_string());
            }
        }
    }

    pub fn reset(&mut self) {
        if self.analyzing {
            return;
        }
        self.selected = None;
        self.result = None;
        self.status = None;
    }

    pub fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::PickImage => {
                if self.analyzing {
                    return Task::none();
                }
                Task::future(async {
                    let handle = rfd::AsyncFileDialog::new()
                        .set_title("Choose an image to analyze")
                        .add_filter("Images", &["png", "jpg", "jpeg", "webp", "gif", "bmp"])
                        .pick_file()
                        .await?;

                    match tokio::fs::read(handle.path()).await {
                        Ok(bytes) => Some(SelectedImage::from_bytes(handle.path(), bytes)),
                        Err(e) => {
                            tracing::error!("Failed to read {}: {}", handle.path().display(), e);
                            None
                        }
                    }
                })
                .map(Message::ImagePicked)
            }
            Message::ImagePicked(Some(image)) => {
                self.select_image(image);
                Task::none()
            }
            Message::ImagePicked(None) => Task::none(),
            Message::Analyze => match self.analyze() {
                Some(request) => Task::future(request).map(Message::Analyzed),
                None => Task::none(),
            },
            Message::Analyzed(result) => {
                self.finish_analysis(result);
                Task::none()
            }
            Message::ExportSnapshot => {
                if self.exporting || self.result.is_none() {
                    return Task::none();
                }
                self.exporting = true;
                window::get_latest().map(Message::WindowFound)
            }
            Message::WindowFound(Some(id)) => window::screenshot(id).map(Message::SnapshotCaptured),
            Message::WindowFound(None) => {
                self.update(Message::SnapshotSaved(Err("No open window to capture".to_string())))
            }
            Message::SnapshotCaptured(shot) => {
                let dir = self.downloads_dir.clone();
                Task::future(async move {
                    media::save_snapshot(&dir, shot.size.width, shot.size.height, shot.bytes.to_vec())
                        .map_err(|e| format!("{:#}", e))
                })
                .map(Message::SnapshotSaved)
            }
            Message::SnapshotSaved(Ok(path)) => {
                self.exporting = false;
                tracing::info!("Saved snapshot to {}", path.display());
                self.status = Some(format!("Saved {}", path.display()));
                Task::none()
            }
            Message::SnapshotSaved(Err(e)) => {
                self.exporting = false;
                tracing::error!("Snapshot export failed: {}", e);
                Task::future(async move {
                    rfd::AsyncMessageDialog::new()
                        .set_level(rfd::MessageLevel::Error)
                        .set_title("Export failed")
                        .set_description(format!("Could not save the analysis image.\n\n{}", e))
                        .show()
                        .await;
                    Message::AlertClosed
                })
            }
            Message::AlertClosed => Task::none(),
            Message::Reset => {
                self.reset();
                Task::none()
            }
        }
    }

    pub fn view(&self, frame: usize) -> Element<Message> {
        let pick = button(text("Choose image").size(14))
            .padding(10)
            .on_press_maybe((!self.analyzing).then_some(Message::PickImage));

        let analyze = button(text("Analyze").size(14))
            .padding(10)
            .on_press_maybe((self.selected.is_some() && !self.analyzing).then_some(Message::Analyze));

        let mut toolbar = row![pick, analyze].spacing(10);
        if self.result.is_some() && !self.analyzing {
            toolbar = toolbar.push(
                button(text("Export").size(14))
                    .padding(10)
                    .on_press_maybe((!self.exporting).then_some(Message::ExportSnapshot)),
            );
        }
        if self.selected.is_some() && !self.analyzing {
            toolbar = toolbar.push(button(text("Start over").size(14)).padding(10).on_press(Message::Reset));
        }

        let mut content = column![toolbar].spacing(15);

        match &self.selected {
            Some(selected) => {
                content = content.push(
                    column![
                        image(selected.preview.clone()).height(Length::Fixed(220.0)),
                        text(&selected.name).size(13),
                    ]
                    .spacing(5),
                );
            }
            None => {
                content = content.push(text("Choose a photo of a worksheet, page, or problem to get a guided breakdown.").size(15));
            }
        }

        if self.analyzing {
            content = content.push(crate::loading_indicator(frame, "Reading your document..."));
        } else if let Some(result) = &self.result {
            let sections = self.sections();
            if sections.is_empty() {
                content = content.push(markdown::view(result));
            } else {
                for section in sections {
                    let title = text(section.title).size(18).font(Font {
                        weight: font::Weight::Bold,
                        ..Font::DEFAULT
                    });
                    content = content.push(
                        container(column![title, markdown::view(&section.body)].spacing(8))
                            .padding(12)
                            .width(Length::Fill)
                            .style(container::rounded_box),
                    );
                }
            }
        }

        if let Some(status) = &self.status {
            content = content.push(text(status).size(13));
        }

        scrollable(container(content).padding(15).width(Length::Fill))
            .height(Length::Fill)
            .into()
    }
}
