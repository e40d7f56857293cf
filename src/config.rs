use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

use crate::http_client::{join_url, ClientSettings};
use crate::streaming::{ReconnectPolicy, StreamSettings};

/// Benefits client - authenticated API calls and live notifications
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// API base URL
    #[arg(short = 'u', long, env = "API_BASE_URL")]
    pub base_url: Option<String>,

    /// Token refresh endpoint path
    #[arg(long, env = "REFRESH_PATH", default_value = "/auth/refresh")]
    pub refresh_path: String,

    /// Notification stream endpoint path
    #[arg(long, env = "STREAM_PATH", default_value = "/notifications/stream")]
    pub stream_path: String,

    /// Path to the credentials SQLite database
    #[arg(short = 'd', long, env = "CREDENTIALS_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    /// Consecutive stream failures before giving up
    #[arg(long, env = "RECONNECT_MAX_ATTEMPTS", default_value = "5")]
    pub reconnect_attempts: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Authenticated GET, prints the JSON body
    Get {
        /// API path, e.g. /coupons
        path: String,
    },
    /// Follow the notification stream
    Watch {
        /// Only log these notification kinds
        #[arg(short, long = "kind")]
        kinds: Vec<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_base_url: Url,
    pub refresh_path: String,
    pub stream_path: String,
    pub stream_token_param: String,

    // Credentials
    pub credentials_db_file: PathBuf,
    pub seed_access_token: Option<String>,
    pub seed_refresh_token: Option<String>,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Event stream
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub stream_idle_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_json: bool,

    pub command: Command,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        Self::from_args(args)
    }

    /// Build config from parsed arguments, filling the rest from the environment
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let base_url = args
            .base_url
            .context("API_BASE_URL is required (use -u or set API_BASE_URL env var)")?;
        let api_base_url = Url::parse(&base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", base_url))?;

        let config = Config {
            api_base_url,
            refresh_path: args.refresh_path,
            stream_path: args.stream_path,
            stream_token_param: std::env::var("STREAM_TOKEN_PARAM")
                .unwrap_or_else(|_| "token".to_string()),

            credentials_db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_db_path),
            seed_access_token: std::env::var("ACCESS_TOKEN").ok().filter(|s| !s.is_empty()),
            seed_refresh_token: std::env::var("REFRESH_TOKEN").ok().filter(|s| !s.is_empty()),

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 20),
            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 30),
            http_request_timeout: args.http_timeout,

            reconnect_base_delay_ms: env_or("RECONNECT_BASE_DELAY_MS", 1000),
            reconnect_max_delay_ms: env_or("RECONNECT_MAX_DELAY_MS", 30_000),
            reconnect_max_attempts: args.reconnect_attempts,
            stream_idle_timeout: env_or("STREAM_IDLE_TIMEOUT", 90),

            log_level: args.log_level,
            log_json: args.log_format.eq_ignore_ascii_case("json"),

            command: args.command,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.api_base_url.scheme(), "http" | "https") {
            anyhow::bail!(
                "API_BASE_URL must use http or https: {}",
                self.api_base_url
            );
        }

        if self.reconnect_max_attempts == 0 {
            anyhow::bail!("RECONNECT_MAX_ATTEMPTS must be at least 1");
        }

        if self.reconnect_base_delay_ms == 0 {
            anyhow::bail!("RECONNECT_BASE_DELAY_MS must be greater than 0");
        }

        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            anyhow::bail!(
                "RECONNECT_MAX_DELAY_MS ({}) must not be below RECONNECT_BASE_DELAY_MS ({})",
                self.reconnect_max_delay_ms,
                self.reconnect_base_delay_ms
            );
        }

        Ok(())
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.api_base_url.clone(),
            refresh_path: self.refresh_path.clone(),
            max_connections: self.http_max_connections,
            connect_timeout: Duration::from_secs(self.http_connect_timeout),
            request_timeout: Duration::from_secs(self.http_request_timeout),
        }
    }

    pub fn stream_settings(&self) -> Result<StreamSettings> {
        let url = join_url(&self.api_base_url, &self.stream_path)?;
        Ok(StreamSettings {
            url,
            token_param: self.stream_token_param.clone(),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
                max_attempts: self.reconnect_max_attempts,
            },
            idle_timeout: (self.stream_idle_timeout > 0)
                .then(|| Duration::from_secs(self.stream_idle_timeout)),
        })
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Default credentials database location
fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("benefits-client")
        .join("credentials.sqlite3")
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_parse_watch_command() {
        let args = parse(&[
            "benefits-client",
            "-u",
            "https://api.example.com/v1",
            "watch",
            "--kind",
            "stamp-added",
            "-k",
            "payment-success",
        ]);
        assert_eq!(
            args.command,
            Command::Watch {
                kinds: vec!["stamp-added".to_string(), "payment-success".to_string()]
            }
        );
    }

    #[test]
    fn test_settings_from_args() {
        let args = parse(&[
            "benefits-client",
            "-u",
            "https://api.example.com/v1/",
            "--reconnect-attempts",
            "3",
            "-d",
            "/tmp/creds.sqlite3",
            "get",
            "/coupons",
        ]);
        let config = Config::from_args(args).unwrap();
        config.validate().unwrap();

        assert_eq!(config.command, Command::Get { path: "/coupons".to_string() });
        assert_eq!(config.credentials_db_file, PathBuf::from("/tmp/creds.sqlite3"));

        let stream = config.stream_settings().unwrap();
        assert_eq!(
            stream.url.as_str(),
            "https://api.example.com/v1/notifications/stream"
        );
        assert_eq!(stream.reconnect.max_attempts, 3);

        let client = config.client_settings();
        assert_eq!(client.refresh_path, "/auth/refresh");
        assert_eq!(client.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_base_url() {
        let args = parse(&["benefits-client", "-u", "not a url", "get", "/x"]);
        assert!(Config::from_args(args).is_err());

        let args = parse(&["benefits-client", "-u", "ftp://files.example.com", "get", "/x"]);
        let config = Config::from_args(args).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_or_default() {
        assert_eq!(env_or("BENEFITS_CLIENT_TEST_UNSET_VAR", 42u64), 42);
    }
}
