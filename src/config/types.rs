use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ToolServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub sse_keep_alive_secs: u64,
    /// Provider sessions silent for this long are dropped; 0 keeps them forever
    pub session_idle_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            sse_keep_alive_secs: 15,
            session_idle_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Identity and paging of the bundled tool provider
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolServerConfig {
    pub name: String,
    pub version: String,
    pub instructions: Option<String>,
    /// Descriptors per `tools/list` page; unset means a single page
    pub page_size: Option<usize>,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            name: "MCP Demo Server".to_string(),
            version: "1.0.0".to_string(),
            instructions: None,
            page_size: None,
        }
    }
}

/// Which provider the consumer side connects to
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Stdio {
        #[serde(default = "default_provider_name")]
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
    },
}

fn default_provider_name() -> String {
    "local".to_string()
}

impl Default for ProviderConfig {
    /// This binary, spawned as a stdio provider
    fn default() -> Self {
        ProviderConfig::Stdio {
            name: default_provider_name(),
            command: env!("CARGO_PKG_NAME").to_string(),
            args: vec!["serve-stdio".to_string()],
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub system_prompt: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-chat".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            system_prompt: Some(
                "You are a professional assistant. You can use tools to perform calculations."
                    .to_string(),
            ),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub handshake_timeout_secs: u64,
    pub stream_reconnect_delay_ms: u64,
    pub max_stream_reconnects: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            stream_reconnect_delay_ms: 3000,
            max_stream_reconnects: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.http.port, 3000);
        assert_eq!(config.http.sse_keep_alive_secs, 15);
        assert_eq!(config.http.session_idle_timeout_secs, 1800);
        assert_eq!(config.session.handshake_timeout_secs, 30);
        assert_eq!(config.model.api_key_env, "OPENAI_API_KEY");
        assert!(matches!(
            config.provider,
            ProviderConfig::Stdio { ref args, .. } if args == &["serve-stdio"]
        ));
    }
}
