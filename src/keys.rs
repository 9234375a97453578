use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::RwLock;

pub const KEY_ENV_VAR: &str = "GEMINI_API_KEY";
pub const KEY_CONSOLE_URL: &str = "https://aistudio.google.com/app/apikey";

/// Host-side API key management.
pub trait KeyStore: Send + Sync {
    fn api_key(&self) -> Option<String>;

    fn has_selected_api_key(&self) -> bool {
        self.api_key().is_some()
    }

    /// Starts the host's key selection flow. Assumed to succeed.
    fn open_select_key(&self);

    fn save_key(&self, key: &str) -> Result<()>;
}

type Launcher = Box<dyn Fn(&str) -> io::Result<()> + Send + Sync>;

/// Resolves the key from, in order: a key saved this session, `GEMINI_API_KEY`,
/// the config file, and the `api_key` file in the config directory.
pub struct FileKeyStore {
    key_file: PathBuf,
    configured: Option<String>,
    saved: RwLock<Option<String>>,
    read_env: bool,
    launch: Launcher,
}

impl FileKeyStore {
    pub fn new(key_file: PathBuf, configured: Option<String>) -> Self {
        FileKeyStore {
            key_file,
            configured: configured.filter(|k| !k.trim().is_empty()),
            saved: RwLock::new(None),
            read_env: true,
            launch: Box::new(webbrowser::open),
        }
    }

    #[cfg(test)]
    fn without_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    #[cfg(test)]
    fn with_launcher(mut self, launch: impl Fn(&str) -> io::Result<()> + Send + Sync + 'static) -> Self {
        self.launch = Box::new(launch);
        self
    }

    fn read_key_file(&self) -> Option<String> {
        let contents = fs::read_to_string(&self.key_file).ok()?;
        let key = contents.trim();
        if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        }
    }
}

impl KeyStore for FileKeyStore {
    fn api_key(&self) -> Option<String> {
        if let Ok(saved) = self.saved.read() {
            if let Some(key) = saved.as_ref() {
                return Some(key.clone());
            }
        }

        if self.read_env {
            if let Ok(key) = std::env::var(KEY_ENV_VAR) {
                if !key.trim().is_empty() {
                    return Some(key.trim().to_string());
                }
            }
        }

        self.configured.clone().or_else(|| self.read_key_file())
    }

    fn open_select_key(&self) {
        tracing::info!("Opening {} to select an API key", KEY_CONSOLE_URL);
        if let Err(e) = (self.launch)(KEY_CONSOLE_URL) {
            tracing::warn!("Could not open key console, visit {} to create a key: {}", KEY_CONSOLE_URL, e);
        }
    }

    fn save_key(&self, key: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("API key is empty");
        }

        if let Some(parent) = self.key_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.key_file, format!("{}\n", key))
            .with_context(|| format!("Failed to write {}", self.key_file.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.key_file, fs::Permissions::from_mode(0o600))
                .context("Failed to restrict key file permissions")?;
        }

        if let Ok(mut saved) = self.saved.write() {
            *saved = Some(key.to_string());
        }
        tracing::info!("Saved API key to {}", self.key_file.display());
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("api_key"), None).without_env();
        assert!(!store.has_selected_api_key());
    }

    #[test]
    fn test_blank_configured_key_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("api_key"), Some("  ".to_string())).without_env();
        assert_eq!(store.api_key(), None);
    }

    #[test]
    fn test_key_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_key");
        fs::write(&path, "  file-key\n").unwrap();

        let store = FileKeyStore::new(path, None).without_env();
        assert_eq!(store.api_key().as_deref(), Some("file-key"));
    }

    #[test]
    fn test_configured_key_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_key");
        fs::write(&path, "file-key").unwrap();

        let store = FileKeyStore::new(path, Some("config-key".to_string())).without_env();
        assert_eq!(store.api_key().as_deref(), Some("config-key"));
    }

    #[test]
    fn test_save_key_persists_and_takes_effect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("api_key");

        let store = FileKeyStore::new(path.clone(), Some("config-key".to_string())).without_env();
        store.save_key(" new-key ").unwrap();

        assert_eq!(store.api_key().as_deref(), Some("new-key"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "new-key\n");
    }

    #[test]
    fn test_save_empty_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("api_key"), None).without_env();
        assert!(store.save_key("   ").is_err());
        assert!(!store.has_selected_api_key());
    }

    #[test]
    fn test_open_select_key_launches_console_url() {
        let dir = tempfile::tempdir().unwrap();
        let launched = Arc::new(Mutex::new(Vec::new()));
        let seen = launched.clone();
        let store = FileKeyStore::new(dir.path().join("api_key"), None)
            .without_env()
            .with_launcher(move |url| {
                seen.lock().unwrap().push(url.to_string());
                Ok(())
            });

        store.open_select_key();
        assert_eq!(*launched.lock().unwrap(), vec![KEY_CONSOLE_URL.to_string()]);
    }

    #[test]
    fn test_launcher_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path().join("api_key"), None)
            .without_env()
            .with_launcher(|_| Err(io::Error::new(io::ErrorKind::NotFound, "no browser")));

        store.open_select_key();
        assert!(!store.has_selected_api_key());
    }
}
