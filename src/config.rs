//! Configuration management
//!
//! Router settings come from the environment (`LISTEN_PLAIN`, `FINAL_HTTP`,
//! …) with a TOML file layered on top: keys present in the file win, keys
//! absent fall back to the environment.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::ports::PortSet;

/// Root configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub router: RouterConfig,
    pub logging: LoggingConfig,
}

/// Router configuration.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Bind address for the plain (HTTP/SOCKS) listener.
    pub listen_plain: String,
    /// Bind address for the TLS-sniffing listener.
    pub listen_tls: String,

    /// Terminal backends per protocol: `host:port`, or a filesystem path
    /// for a UNIX-domain socket.
    pub final_http: String,
    pub final_socks: String,
    pub final_tls: String,

    /// Gate for knot-driven redirection.
    pub allow_redir: bool,
    /// Ports eligible for redirection: `80,443,10000-65535`.
    pub allow_ports: String,

    /// Bitmap built from `allow_ports` at load time.
    pub allowed: PortSet,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Output format: "json" or "pretty"
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

/// File-side view of the configuration: every key optional, so absent keys
/// keep whatever the environment provided.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    router: Option<FileRouter>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
struct FileRouter {
    listen_plain: Option<String>,
    listen_tls: Option<String>,
    final_http: Option<String>,
    final_socks: Option<String>,
    final_tls: Option<String>,
    allow_redir: Option<bool>,
    allow_ports: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
}

impl Config {
    /// Load configuration from the environment, overlay the TOML file when
    /// one is given, and finalize the port bitmap.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Some(path) = path {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path:?}"))?;
            let file: FileConfig =
                toml::from_str(&contents).context("failed to parse config file")?;
            config.overlay(file);
        }
        config.router.allowed = PortSet::parse(&config.router.allow_ports)
            .context("failed to build port bitmap")?;
        Ok(config)
    }

    /// Configuration from environment variables alone.
    fn from_env() -> Result<Self> {
        let mut config = Self::default();
        let r = &mut config.router;
        if let Ok(v) = std::env::var("LISTEN_PLAIN") {
            r.listen_plain = v;
        }
        if let Ok(v) = std::env::var("LISTEN_TLS") {
            r.listen_tls = v;
        }
        if let Ok(v) = std::env::var("FINAL_HTTP") {
            r.final_http = v;
        }
        if let Ok(v) = std::env::var("FINAL_SOCKS") {
            r.final_socks = v;
        }
        if let Ok(v) = std::env::var("FINAL_TLS") {
            r.final_tls = v;
        }
        if let Ok(v) = std::env::var("ALLOW_REDIR") {
            r.allow_redir =
                parse_bool(&v).with_context(|| format!("invalid ALLOW_REDIR value {v:?}"))?;
        }
        if let Ok(v) = std::env::var("ALLOW_PORTS") {
            r.allow_ports = v;
        }
        Ok(config)
    }

    fn overlay(&mut self, file: FileConfig) {
        if let Some(router) = file.router {
            let r = &mut self.router;
            if let Some(v) = router.listen_plain {
                r.listen_plain = v;
            }
            if let Some(v) = router.listen_tls {
                r.listen_tls = v;
            }
            if let Some(v) = router.final_http {
                r.final_http = v;
            }
            if let Some(v) = router.final_socks {
                r.final_socks = v;
            }
            if let Some(v) = router.final_tls {
                r.final_tls = v;
            }
            if let Some(v) = router.allow_redir {
                r.allow_redir = v;
            }
            if let Some(v) = router.allow_ports {
                r.allow_ports = v;
            }
        }
        if let Some(logging) = file.logging {
            if let Some(v) = logging.level {
                self.logging.level = v;
            }
            if let Some(v) = logging.format {
                self.logging.format = v;
            }
        }
    }

    /// At least one listener is required for the router to be of any use.
    pub fn has_listener(&self) -> bool {
        !self.router.listen_plain.is_empty() || !self.router.listen_tls.is_empty()
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        _ => bail!("not a boolean"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_parses_and_builds_portmap() {
        let toml = r#"
            [router]
            listen_plain = "127.0.0.1:8080"
            final_http = "127.0.0.1:3128"
            allow_redir = true
            allow_ports = "80,443,10000-65535"

            [logging]
            level = "debug"
        "#;
        let file: FileConfig = toml::from_str(toml).unwrap();
        let mut config = Config::default();
        config.overlay(file);
        config.router.allowed = PortSet::parse(&config.router.allow_ports).unwrap();

        assert_eq!(config.router.listen_plain, "127.0.0.1:8080");
        assert!(config.router.allow_redir);
        assert!(config.router.allowed.contains(443));
        assert!(config.router.allowed.contains(20000));
        assert!(!config.router.allowed.contains(8080));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
        assert!(config.has_listener());
    }

    #[test]
    fn missing_listeners_are_detected() {
        let config = Config::default();
        assert!(!config.has_listener());
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn bad_port_spec_fails_the_bitmap() {
        let file: FileConfig = toml::from_str(
            r#"
            [router]
            allow_ports = "80,nope"
        "#,
        )
        .unwrap();
        let mut config = Config::default();
        config.overlay(file);
        assert!(PortSet::parse(&config.router.allow_ports).is_err());
    }
}
