use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};

use crate::error::ChatResult;
use crate::identity::{AuthProvider, DEFAULT_ANONYMOUS_LABEL, IdentityBinder};
use crate::moderation::{DEFAULT_DENY_LIST, ModerationFilter};

pub const SETTINGS_DIRECTORY_NAME: &str = "gallery-chat";
pub const SETTINGS_FILE_NAME: &str = "chat.json";
pub const ENV_PREFIX: &str = "GALLERY_CHAT_";

/// The externally tunable values of the discussion subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_deny_list")]
    pub deny_list: Vec<String>,
    #[serde(default = "default_anonymous_label")]
    pub anonymous_label: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            deny_list: default_deny_list(),
            anonymous_label: default_anonymous_label(),
        }
    }
}

impl ChatSettings {
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".gallery-chat"))
            .join(SETTINGS_FILE_NAME)
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    /// Defaults, then the JSON file, then `GALLERY_CHAT_*` variables.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!("chat settings file not found at {:?}, using defaults", path);
        }

        let figment = Figment::from(Serialized::defaults(ChatSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse chat settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatSettings::default()
            }
        }
    }

    pub fn normalized(mut self) -> Self {
        let mut seen = HashSet::new();
        self.deny_list = self
            .deny_list
            .into_iter()
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .filter(|entry| seen.insert(entry.to_lowercase()))
            .collect();

        self.anonymous_label = self.anonymous_label.trim().to_string();
        if self.anonymous_label.is_empty() {
            self.anonymous_label = default_anonymous_label();
        }

        self
    }

    pub fn moderation_filter(&self) -> ChatResult<ModerationFilter> {
        ModerationFilter::new(&self.deny_list)
    }

    pub fn identity_binder(&self, provider: Arc<dyn AuthProvider>) -> IdentityBinder {
        IdentityBinder::with_anonymous_label(provider, self.anonymous_label.clone())
    }
}

fn default_deny_list() -> Vec<String> {
    DEFAULT_DENY_LIST.iter().map(|word| word.to_string()).collect()
}

fn default_anonymous_label() -> String {
    DEFAULT_ANONYMOUS_LABEL.to_string()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::identity::SessionAuth;

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = TempDir::new().expect("temp dir");
        let settings = ChatSettings::load_from(&temp_dir.path().join("absent.json"));
        assert_eq!(settings, ChatSettings::default());
    }

    #[test]
    fn file_values_are_normalized() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"deny_list": [" Gargoyle ", "gargoyle", ""], "anonymous_label": "  "}"#,
        )
        .expect("write settings");

        let settings = ChatSettings::load_from(&path);
        assert_eq!(settings.deny_list, vec!["Gargoyle".to_string()]);
        assert_eq!(settings.anonymous_label, DEFAULT_ANONYMOUS_LABEL);

        let filter = settings.moderation_filter().expect("valid deny-list");
        assert_eq!(filter.apply("a GARGOYLE!"), "a ****!");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"anonymous_label": "Visitor"}"#).expect("write settings");

        let settings = ChatSettings::load_from(&path);
        assert_eq!(settings.deny_list, default_deny_list());

        let binder = settings.identity_binder(Arc::new(SessionAuth::new()));
        assert_eq!(binder.current_display_name().expect("resolves"), "Visitor");
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{"deny_list": 42"#).expect("write settings");

        assert_eq!(ChatSettings::load_from(&path), ChatSettings::default());
    }

    #[test]
    fn deny_list_colliding_with_mask_is_a_config_error() {
        let settings = ChatSettings {
            deny_list: vec!["**bad**".to_string()],
            anonymous_label: default_anonymous_label(),
        };
        assert!(settings.moderation_filter().is_err());
    }
}
