use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3001";
pub const DEFAULT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

pub const BASE_URL_ENV: &str = "CHATLINE_API_BASE_URL";
pub const MODEL_ENV: &str = "CHATLINE_MODEL";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub default_model: String,
    pub credentials_path: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            default_model: DEFAULT_MODEL.to_string(),
            credentials_path: default_credentials_path(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration invalid: {0}")]
    Invalid(String),
    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Invalid(detail) => format!("Chatline is misconfigured: {detail}. Update chatline.yaml."),
            Self::Unreadable { path, .. } => {
                format!("Could not read {}. Check its permissions.", path.display())
            }
        }
    }
}

impl ClientSettings {
    /// Reads the first `chatline.yaml` found, then applies environment overrides.
    /// No file at all means defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match locate_config_file() {
            Some(path) => Some(read_config(&path)?),
            None => None,
        };
        let overrides = EnvOverrides {
            base_url: std::env::var(BASE_URL_ENV).ok(),
            model: std::env::var(MODEL_ENV).ok(),
        };
        resolve_settings(file.and_then(|config| config.api), overrides)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = read_config(path)?;
        resolve_settings(config.api, EnvOverrides::default())
    }

    /// Replaces the base URL, validated like file and env values.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, ConfigError> {
        self.base_url = normalize_base_url(base_url)?;
        Ok(self)
    }
}

fn read_config(path: &Path) -> Result<ChatlineConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    if contents.trim().is_empty() {
        return Ok(ChatlineConfig::default());
    }
    serde_yaml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid {}: {err}", path.display())))
}

#[derive(Debug, Default)]
struct EnvOverrides {
    base_url: Option<String>,
    model: Option<String>,
}

fn resolve_settings(
    section: Option<ApiSection>,
    env: EnvOverrides,
) -> Result<ClientSettings, ConfigError> {
    let section = section.unwrap_or_default();
    let mut settings = ClientSettings::default();

    if let Some(base_url) = non_empty(env.base_url).or_else(|| non_empty(section.base_url)) {
        settings.base_url = base_url;
    }
    settings.base_url = normalize_base_url(&settings.base_url)?;

    if let Some(secs) = section.timeout_secs {
        if secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs must be positive".to_string()));
        }
        settings.timeout = Duration::from_secs(secs);
    }
    if let Some(model) = non_empty(env.model).or_else(|| non_empty(section.model)) {
        settings.default_model = model;
    }
    if let Some(path) = section.credentials_file {
        settings.credentials_path = Some(path);
    }
    Ok(settings)
}

fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let raw = raw.trim();
    let parsed =
        Url::parse(raw).map_err(|err| ConfigError::Invalid(format!("base_url `{raw}`: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "base_url must be http or https, got `{}`",
            parsed.scheme()
        )));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_credentials_path() -> Option<PathBuf> {
    BaseDirs::new().map(|base| base.config_dir().join("chatline").join("credentials.json"))
}

fn locate_config_file() -> Option<PathBuf> {
    chatline_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn chatline_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("chatline");
        paths.push(config_dir.join("chatline.yaml"));
        paths.push(config_dir.join("chatline.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".chatline").join("chatline.yaml"));
        paths.push(home_dir.join(".chatline").join("chatline.yml"));
    } else {
        paths.push(PathBuf::from("chatline.yaml"));
        paths.push(PathBuf::from("chatline.yml"));
    }
    paths
}

#[derive(Debug, Default, Deserialize)]
struct ChatlineConfig {
    api: Option<ApiSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiSection {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    model: Option<String>,
    credentials_file: Option<PathBuf>,
}
