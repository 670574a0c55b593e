//! Configuration loading.
//!
//! Priority (highest to lowest):
//! 1. `CHAT_*` environment variables (`CHAT_API_KEY`, `CHAT_MODEL`, ...)
//! 2. Explicit `--config` file
//! 3. `./chat.toml`
//! 4. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::ingest::ThrottleConfig;

pub const PROJECT_CONFIG_FILE: &str = "chat.toml";
pub const ENV_PREFIX: &str = "CHAT_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub greeting: String,
    pub display_throttle_ms: u64,
    pub persist_throttle_ms: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub log_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.moonshot.cn/v1".to_string(),
            api_key: None,
            model: "kimi-k2-0905-preview".to_string(),
            system_prompt: "You are a helpful assistant. Answer in Markdown.".to_string(),
            greeting: "Hi! Ask me anything.".to_string(),
            display_throttle_ms: 100,
            persist_throttle_ms: 150,
            connect_timeout_secs: 30,
            request_timeout_secs: 300,
            log_file: PathBuf::from("chat-stream-tui.log"),
        }
    }
}

impl Config {
    pub fn load(explicit: Option<&Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(explicit).extract().map_err(Box::new)
    }

    pub fn figment(explicit: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        let project = Path::new(PROJECT_CONFIG_FILE);
        if project.exists() {
            figment = figment.merge(Toml::file(project));
        }
        if let Some(path) = explicit {
            figment = figment.merge(Toml::file(path));
        }

        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            display: Duration::from_millis(self.display_throttle_ms),
            persist: Duration::from_millis(self.persist_throttle_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_throttles() {
        let throttle = Config::default().throttle();
        assert_eq!(throttle, ThrottleConfig::default());
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string("model = \"moonshot-v1-8k\"\ndisplay_throttle_ms = 50"))
            .extract()
            .unwrap();

        assert_eq!(config.model, "moonshot-v1-8k");
        assert_eq!(config.throttle().display, Duration::from_millis(50));
        assert_eq!(config.persist_throttle_ms, 150);
        assert!(config.api_key.is_none());
    }
}
