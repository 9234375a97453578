use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::router::ViewSelection;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub gemini: GeminiConfig,
    pub window: WindowConfig,
    pub analyzer: AnalyzerConfig,
    pub downloads: DownloadsConfig,
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub base_url: String,
    pub analysis_model: String,
    pub image_model: String,
    pub chat_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        GeminiConfig {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            analysis_model: "gemini-2.5-flash".to_string(),
            image_model: "gemini-3-pro-image-preview".to_string(),
            chat_model: "gemini-2.5-flash".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub min_width: u32,
    pub min_height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            width: 1000,
            height: 760,
            min_width: 640,
            min_height: 480,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Images wider or taller than this are scaled down before upload.
    pub max_image_dimension: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            max_image_dimension: 2048,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UiConfig {
    pub start_view: String,
}

impl Config {
    pub fn load() -> Self {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => return config,
                    Err(e) => tracing::warn!("Error parsing {}: {}. Using defaults.", config_path.display(), e),
                },
                Err(e) => tracing::warn!("Error reading {}: {}. Using defaults.", config_path.display(), e),
            }
        } else if let Some(parent) = config_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        Config::default()
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn start_view(&self) -> ViewSelection {
        ViewSelection::parse(&self.ui.start_view)
    }

    /// Where saved images and snapshots go.
    pub fn downloads_dir(&self) -> PathBuf {
        self.downloads
            .dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| Self::get_config_dir().join("downloads"))
    }

    pub fn get_config_path() -> PathBuf {
        Self::get_config_dir().join("config.toml")
    }

    pub fn get_config_dir() -> PathBuf {
        if let Some(dir) = dirs::config_dir() {
            dir.join("study-bar")
        } else {
            PathBuf::from(".")
        }
    }
}
