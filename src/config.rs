//! Download settings: defaults, then a TOML file, then environment overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ApplicationError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Wire request granularity in bytes.
    pub block_length: u32,
    /// Port announced to the tracker.
    pub port: u16,
    /// 20-byte client identifier sent in handshakes and announces.
    pub peer_id: String,
    /// Seconds without data before the session gives up.
    pub health_timeout_secs: u64,
    /// Remaining-time marks (seconds) at which a stall warning is logged.
    pub warning_ladder_secs: Vec<u64>,
    /// Reannounce interval used when the tracker does not supply one.
    pub default_reannounce_secs: u64,
    /// Lower bound on the reannounce interval.
    pub min_reannounce_secs: u64,
    /// Quiet period after which losing the last active peer re-arms the health timer.
    pub stall_grace_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_length:            16 * 1024,
            port:                    6881,
            peer_id:                 "-RU0001-123456789010".into(),
            health_timeout_secs:     120,
            warning_ladder_secs:     vec![90, 60, 30, 15, 10, 5],
            default_reannounce_secs: 1800,
            min_reannounce_secs:     60,
            stall_grace_secs:        30,
            connect_timeout_secs:    10,
        }
    }
}

impl Config {
    /// Loads `path` if given, else the per-user config file if it exists,
    /// then applies `SWARMFETCH_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ApplicationError> {
        let mut config = match path.map(Path::to_path_buf).or_else(default_path) {
            Some(p) if path.is_some() || p.exists() => Self::from_file(&p)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ApplicationError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ApplicationError::ConfigError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ApplicationError> {
        toml::from_str(text).map_err(|e| ApplicationError::ConfigError(e.to_string()))
    }

    fn apply_env(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ApplicationError> {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ApplicationError> {
            value
                .parse()
                .map_err(|_| ApplicationError::ConfigError(format!("{}: invalid value {:?}", key, value)))
        }

        if let Some(v) = var("SWARMFETCH_PORT") {
            self.port = parse("SWARMFETCH_PORT", v)?;
        }
        if let Some(v) = var("SWARMFETCH_HEALTH_TIMEOUT") {
            self.health_timeout_secs = parse("SWARMFETCH_HEALTH_TIMEOUT", v)?;
        }
        if let Some(v) = var("SWARMFETCH_MIN_REANNOUNCE") {
            self.min_reannounce_secs = parse("SWARMFETCH_MIN_REANNOUNCE", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ApplicationError> {
        if self.block_length == 0 {
            return Err(ApplicationError::ConfigError("block_length must be positive".into()));
        }
        if self.peer_id.len() != 20 {
            return Err(ApplicationError::ConfigError(
                "peer_id must be exactly 20 bytes".into(),
            ));
        }
        Ok(())
    }

    pub fn peer_id(&self) -> [u8; 20] {
        let mut id = [0u8; 20];
        let bytes = self.peer_id.as_bytes();
        let n = bytes.len().min(20);
        id[..n].copy_from_slice(&bytes[..n]);
        id
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    /// Warning marks that fall inside the health window, largest first.
    pub fn warning_ladder(&self) -> Vec<Duration> {
        let mut marks: Vec<u64> = self
            .warning_ladder_secs
            .iter()
            .copied()
            .filter(|s| *s > 0 && *s < self.health_timeout_secs)
            .collect();
        marks.sort_unstable_by(|a, b| b.cmp(a));
        marks.dedup();
        marks.into_iter().map(Duration::from_secs).collect()
    }

    pub fn default_reannounce(&self) -> Duration {
        Duration::from_secs(self.default_reannounce_secs)
    }

    pub fn min_reannounce(&self) -> Duration {
        Duration::from_secs(self.min_reannounce_secs)
    }

    pub fn stall_grace(&self) -> Duration {
        Duration::from_secs(self.stall_grace_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/swarmfetch/config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_classic_client() {
        let c = Config::default();
        assert_eq!(c.block_length, 16384);
        assert_eq!(c.health_timeout(), Duration::from_secs(120));
        assert_eq!(c.peer_id(), *b"-RU0001-123456789010");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn toml_overrides_only_given_fields() {
        let c = Config::from_toml("port = 7000\nhealth_timeout_secs = 30\n").unwrap();
        assert_eq!(c.port, 7000);
        assert_eq!(c.health_timeout_secs, 30);
        assert_eq!(c.min_reannounce_secs, 60);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml("bogus = 1").is_err());
    }

    #[test]
    fn ladder_is_clipped_to_the_timeout() {
        let c = Config {
            health_timeout_secs: 40,
            warning_ladder_secs: vec![5, 90, 30, 30],
            ..Config::default()
        };
        assert_eq!(
            c.warning_ladder(),
            vec![Duration::from_secs(30), Duration::from_secs(5)]
        );
    }

    #[test]
    fn env_overrides_apply_and_validate() {
        let mut c = Config::default();
        c.apply_env(|k| (k == "SWARMFETCH_PORT").then(|| "7001".to_string()))
            .unwrap();
        assert_eq!(c.port, 7001);

        let err = c.apply_env(|k| (k == "SWARMFETCH_HEALTH_TIMEOUT").then(|| "soon".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn short_peer_id_is_invalid() {
        let c = Config {
            peer_id: "short".into(),
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }
}
