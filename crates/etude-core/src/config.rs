use crate::error::{EtudeError, EtudeResult};
use crate::http::FormDecoding;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where request processing runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dispatch {
    /// Parse and build replies on the worker pool.
    #[default]
    Pool,
    /// Do it on the reactor thread.
    Inline,
}

impl FromStr for Dispatch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pool" => Ok(Dispatch::Pool),
            "inline" => Ok(Dispatch::Inline),
            other => Err(format!("unknown dispatch mode `{}`", other)),
        }
    }
}

/// Server configuration, fixed at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen host (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 1316). 0 picks an ephemeral port.
    pub port: u16,

    /// Epoll trigger mode:
    /// 0 = listen LT, conn LT; 1 = conn ET; 2 = listen ET; 3 = both ET.
    pub trigger_mode: u8,

    /// Idle timeout in milliseconds (default: 60000). 0 disables eviction.
    pub timeout_ms: u64,

    /// Set `SO_LINGER` on the listening socket.
    pub linger: bool,

    /// Worker pool size (default: number of CPUs)
    pub workers: usize,

    /// Handles in the credential store pool (default: 12)
    pub credential_pool_size: usize,

    /// Connection table capacity (default: 65536)
    pub max_connections: usize,

    /// Directory static files are served from (default: ./resources)
    pub resource_dir: PathBuf,

    pub form_decoding: FormDecoding,

    pub dispatch: Dispatch,

    pub log_enabled: bool,

    /// Filter directive used when `RUST_LOG` is unset (default: info)
    pub log_level: String,

    /// Append logs to this file instead of stdout.
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1316,
            trigger_mode: 3,
            timeout_ms: 60_000,
            linger: false,
            workers: num_cpus::get(),
            credential_pool_size: 12,
            max_connections: 65_536,
            resource_dir: PathBuf::from("./resources"),
            form_decoding: FormDecoding::Standard,
            dispatch: Dispatch::Pool,
            log_enabled: true,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load from `ETUDE_*` environment variables, reading `.env` first if
    /// one exists. Unset variables keep their defaults.
    pub fn from_env() -> EtudeResult<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> EtudeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();

        if let Some(v) = lookup("ETUDE_HOST") {
            cfg.host = v;
        }
        set_parsed(&lookup, "ETUDE_PORT", &mut cfg.port)?;
        set_parsed(&lookup, "ETUDE_TRIGGER_MODE", &mut cfg.trigger_mode)?;
        set_parsed(&lookup, "ETUDE_TIMEOUT_MS", &mut cfg.timeout_ms)?;
        if let Some(v) = lookup("ETUDE_LINGER") {
            cfg.linger = parse_bool("ETUDE_LINGER", &v)?;
        }
        set_parsed(&lookup, "ETUDE_WORKERS", &mut cfg.workers)?;
        set_parsed(&lookup, "ETUDE_CREDENTIAL_POOL_SIZE", &mut cfg.credential_pool_size)?;
        set_parsed(&lookup, "ETUDE_MAX_CONNECTIONS", &mut cfg.max_connections)?;
        if let Some(v) = lookup("ETUDE_RESOURCE_DIR") {
            cfg.resource_dir = PathBuf::from(v);
        }
        set_parsed(&lookup, "ETUDE_FORM_DECODING", &mut cfg.form_decoding)?;
        set_parsed(&lookup, "ETUDE_DISPATCH", &mut cfg.dispatch)?;
        if let Some(v) = lookup("ETUDE_LOG_ENABLED") {
            cfg.log_enabled = parse_bool("ETUDE_LOG_ENABLED", &v)?;
        }
        if let Some(v) = lookup("ETUDE_LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Some(v) = lookup("ETUDE_LOG_FILE") {
            cfg.log_file = (!v.is_empty()).then(|| PathBuf::from(v));
        }

        Ok(cfg)
    }

    pub fn validate(&self) -> EtudeResult<()> {
        if (1..1024).contains(&self.port) {
            return Err(EtudeError::Config(format!(
                "port {} is privileged; use 1024-65535 or 0",
                self.port
            )));
        }
        if self.trigger_mode > 3 {
            return Err(EtudeError::Config(format!(
                "trigger mode {} out of range 0-3",
                self.trigger_mode
            )));
        }
        if self.workers == 0 {
            return Err(EtudeError::Config("workers must be at least 1".into()));
        }
        if self.credential_pool_size == 0 {
            return Err(EtudeError::Config(
                "credential pool size must be at least 1".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(EtudeError::Config(
                "max connections must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `None` when idle eviction is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn listen_edge_triggered(&self) -> bool {
        matches!(self.trigger_mode, 2 | 3)
    }

    pub fn conn_edge_triggered(&self) -> bool {
        matches!(self.trigger_mode, 1 | 3)
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> EtudeResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| EtudeError::Config(format!("{}: {}", key, e)))?;
    }
    Ok(())
}

fn parse_bool(key: &str, raw: &str) -> EtudeResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(EtudeError::Config(format!(
            "{}: expected a boolean, got `{}`",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.port, 1316);
        assert_eq!(cfg.trigger_mode, 3);
        assert_eq!(cfg.idle_timeout(), Some(Duration::from_secs(60)));
        assert!(cfg.listen_edge_triggered() && cfg.conn_edge_triggered());
        assert!(cfg.workers >= 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn reads_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("ETUDE_PORT", "8080"),
            ("ETUDE_TRIGGER_MODE", "1"),
            ("ETUDE_TIMEOUT_MS", "0"),
            ("ETUDE_LINGER", "yes"),
            ("ETUDE_FORM_DECODING", "legacy"),
            ("ETUDE_DISPATCH", "inline"),
            ("ETUDE_LOG_FILE", "/tmp/etude.log"),
        ]))
        .unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert!(!cfg.listen_edge_triggered());
        assert!(cfg.conn_edge_triggered());
        assert_eq!(cfg.idle_timeout(), None);
        assert!(cfg.linger);
        assert_eq!(cfg.form_decoding, FormDecoding::Legacy);
        assert_eq!(cfg.dispatch, Dispatch::Inline);
        assert_eq!(cfg.log_file, Some(PathBuf::from("/tmp/etude.log")));
    }

    #[test]
    fn bad_values_are_config_errors() {
        let err = Config::from_lookup(lookup(&[("ETUDE_PORT", "http")])).unwrap_err();
        assert!(matches!(err, EtudeError::Config(ref m) if m.starts_with("ETUDE_PORT")));
        assert!(Config::from_lookup(lookup(&[("ETUDE_LINGER", "maybe")])).is_err());
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let base = Config::default();
        for cfg in [
            Config { port: 80, ..base.clone() },
            Config { trigger_mode: 4, ..base.clone() },
            Config { workers: 0, ..base.clone() },
            Config { credential_pool_size: 0, ..base.clone() },
            Config { max_connections: 0, ..base.clone() },
        ] {
            assert!(cfg.validate().is_err(), "{:?}", cfg);
        }
        Config { port: 0, ..base }.validate().unwrap();
    }

    #[test]
    fn deserializes_partial_toml_style_input() {
        let cfg: Config = serde_json::from_str(r#"{"port": 9000, "dispatch": "inline"}"#).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.dispatch, Dispatch::Inline);
        assert_eq!(cfg.credential_pool_size, 12);
    }
}
