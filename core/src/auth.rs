//! API key resolution.
//!
//! A key comes from, in order: resolved settings (including `RUNKIT_API_KEY`),
//! the credentials file under the runkit home, then the injected
//! [`CredentialProvider`]. A key obtained from the provider is saved so the
//! next run does not ask again.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use inquire::InquireError;
use inquire::Password;
use inquire::PasswordDisplayMode;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::CredentialError;
use crate::settings::Settings;
use crate::terminal::termlog;

pub const CREDENTIALS_FILE: &str = "credentials.json";

/// Supplies an API key when none is configured or stored.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` means the provider has nothing to offer.
    async fn acquire(&self, settings: &Settings) -> Result<Option<String>, CredentialError>;
}

/// A pre-supplied key, or none at all. Never prompts.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(Option<String>);

impl StaticCredentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self(Some(api_key.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn acquire(&self, _settings: &Settings) -> Result<Option<String>, CredentialError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrontEnd {
    /// Ask for the key itself with a masked prompt.
    #[default]
    Terminal,
    /// Send the user to the authorization page and ask for the code shown
    /// there.
    Browser,
}

/// Prompts the user. Fails with [`CredentialError::Unattended`] when stdin is
/// not a terminal.
#[derive(Debug, Clone, Default)]
pub struct InteractiveCredentials {
    front_end: FrontEnd,
}

impl InteractiveCredentials {
    pub fn new(front_end: FrontEnd) -> Self {
        Self { front_end }
    }
}

#[async_trait]
impl CredentialProvider for InteractiveCredentials {
    async fn acquire(&self, settings: &Settings) -> Result<Option<String>, CredentialError> {
        if !std::io::stdin().is_terminal() {
            return Err(CredentialError::Unattended);
        }
        let message = match self.front_end {
            FrontEnd::Terminal => "Paste your API key:",
            FrontEnd::Browser => {
                termlog(&format!(
                    "Authorize this machine at {}/authorize",
                    settings.app_url()
                ));
                "Paste the code from your browser:"
            }
        };
        let answer = tokio::task::spawn_blocking(move || {
            Password::new(message)
                .without_confirmation()
                .with_display_mode(PasswordDisplayMode::Masked)
                .prompt()
        })
        .await
        .map_err(|err| CredentialError::Prompt(err.to_string()))?;

        match answer {
            Ok(key) => {
                let key = key.trim().to_string();
                Ok((!key.is_empty()).then_some(key))
            }
            Err(InquireError::OperationCanceled) => Err(CredentialError::Declined),
            Err(InquireError::OperationInterrupted) => Err(CredentialError::Interrupted),
            Err(InquireError::NotTTY) => Err(CredentialError::Unattended),
            Err(err) => Err(CredentialError::Prompt(err.to_string())),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsDotJson {
    /// API keys by base URL.
    #[serde(default)]
    keys: BTreeMap<String, String>,
}

pub fn credentials_path(home: &Path) -> PathBuf {
    home.join(CREDENTIALS_FILE)
}

/// Reads the stored key for `base_url`. A missing file is not an error.
pub fn read_stored_key(home: &Path, base_url: &str) -> Result<Option<String>, CredentialError> {
    let path = credentials_path(home);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(CredentialError::Store { path, source }),
    };
    let stored: CredentialsDotJson =
        serde_json::from_str(&contents).map_err(|err| CredentialError::Store {
            path: path.clone(),
            source: err.into(),
        })?;
    Ok(stored.keys.get(&normalize_url(base_url)).cloned())
}

/// Stores `api_key` for `base_url`, keeping keys for other hosts.
pub fn save_key(home: &Path, base_url: &str, api_key: &str) -> Result<(), CredentialError> {
    let path = credentials_path(home);
    let store_err = |source: std::io::Error| CredentialError::Store {
        path: path.clone(),
        source,
    };
    std::fs::create_dir_all(home).map_err(store_err)?;

    let mut stored = match std::fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => CredentialsDotJson::default(),
    };
    stored
        .keys
        .insert(normalize_url(base_url), api_key.to_string());
    let json_data = serde_json::to_string_pretty(&stored).map_err(|err| store_err(err.into()))?;

    let mut options = OpenOptions::new();
    options.truncate(true).write(true).create(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(&path).map_err(store_err)?;
    file.write_all(json_data.as_bytes()).map_err(store_err)?;
    file.flush().map_err(store_err)?;
    Ok(())
}

/// Returns an API key or the reason there is none.
pub async fn ensure_credential(
    settings: &Settings,
    provider: &dyn CredentialProvider,
) -> Result<String, CredentialError> {
    if let Some(key) = settings.api_key.as_deref().filter(|key| !key.is_empty()) {
        debug!(key = %safe_format_key(key), "using API key from settings");
        return Ok(key.to_string());
    }

    let home = settings.home();
    if let Some(key) = read_stored_key(&home, &settings.base_url)? {
        debug!(key = %safe_format_key(&key), "using stored API key");
        return Ok(key);
    }

    let key = provider
        .acquire(settings)
        .await?
        .ok_or(CredentialError::Missing)?;
    save_key(&home, &settings.base_url, &key)?;
    debug!(key = %safe_format_key(&key), "saved API key");
    Ok(key)
}

/// Keeps enough of a key to recognize it in logs.
pub fn safe_format_key(key: &str) -> String {
    if key.len() <= 13 || !key.is_ascii() {
        return "***".to_string();
    }
    let prefix = &key[..8];
    let suffix = &key[key.len() - 5..];
    format!("{prefix}***{suffix}")
}

fn normalize_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    struct Refusing;

    #[async_trait]
    impl CredentialProvider for Refusing {
        async fn acquire(&self, _settings: &Settings) -> Result<Option<String>, CredentialError> {
            Err(CredentialError::Declined)
        }
    }

    fn settings(home: &Path) -> Settings {
        Settings {
            home_dir: Some(home.to_path_buf()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn settings_key_wins_without_touching_the_provider() {
        let home = tempdir().expect("tempdir");
        let settings = Settings {
            api_key: Some("from-settings".to_string()),
            ..settings(home.path())
        };

        let key = ensure_credential(&settings, &Refusing).await.expect("key");

        assert_eq!(key, "from-settings");
        assert!(!credentials_path(home.path()).exists());
    }

    #[tokio::test]
    async fn provider_key_is_saved_and_reused() {
        let home = tempdir().expect("tempdir");
        let settings = settings(home.path());

        let key = ensure_credential(&settings, &StaticCredentials::new("provided-key"))
            .await
            .expect("key");
        assert_eq!(key, "provided-key");

        let again = ensure_credential(&settings, &Refusing)
            .await
            .expect("stored key");
        assert_eq!(again, "provided-key");
    }

    #[tokio::test]
    async fn missing_key_is_an_error() {
        let home = tempdir().expect("tempdir");
        let err = ensure_credential(&settings(home.path()), &StaticCredentials::none())
            .await
            .expect_err("no key");
        assert!(matches!(err, CredentialError::Missing));
    }

    #[tokio::test]
    async fn declined_prompt_propagates() {
        let home = tempdir().expect("tempdir");
        let err = ensure_credential(&settings(home.path()), &Refusing)
            .await
            .expect_err("declined");
        assert!(matches!(err, CredentialError::Declined));
    }

    #[test]
    fn keys_are_stored_per_host() {
        let home = tempdir().expect("tempdir");
        save_key(home.path(), "https://api.one.dev/", "key-one").expect("save");
        save_key(home.path(), "https://api.two.dev", "key-two").expect("save");

        assert_eq!(
            read_stored_key(home.path(), "https://api.one.dev")
                .expect("read")
                .as_deref(),
            Some("key-one")
        );
        assert_eq!(
            read_stored_key(home.path(), "https://api.two.dev")
                .expect("read")
                .as_deref(),
            Some("key-two")
        );
    }

    #[cfg(unix)]
    #[test]
    fn credentials_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let home = tempdir().expect("tempdir");
        save_key(home.path(), "https://api.runkit.dev", "secret").expect("save");
        let mode = std::fs::metadata(credentials_path(home.path()))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn formats_long_key() {
        assert_eq!(safe_format_key("rk-live-1234567890ABCDE"), "rk-live-***ABCDE");
        assert_eq!(safe_format_key("short"), "***");
    }
}
