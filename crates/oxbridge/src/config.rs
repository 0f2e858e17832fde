//! Process-wide bridge settings.
//!
//! Settings are read once from the environment on first use and can be
//! changed afterwards with the setters below. Class and protocol builders
//! can also override the rename policy for a single definition.
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `OXBRIDGE_AUTO_RENAME` | `1`, `true`, `yes` or `on` enables auto-rename |
//! | `OXBRIDGE_LOG` | log level name (`error` ... `trace`) |

use oxbridge_log::Level;
use parking_lot::RwLock;
use std::sync::OnceLock;

/// Environment variable enabling auto-rename.
pub const AUTO_RENAME_ENV: &str = "OXBRIDGE_AUTO_RENAME";

/// Bridge configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Register a class or protocol under `Name_2`, `Name_3`, ... when its
    /// name is taken, instead of failing.
    pub auto_rename: bool,
    /// Log level applied to `oxbridge-log`.
    pub log_level: Level,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            auto_rename: false,
            log_level: Level::Warn,
        }
    }
}

impl BridgeConfig {
    /// Builds a configuration from the environment.
    ///
    /// Unset or unparsable variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = BridgeConfig::default();

        if let Ok(value) = std::env::var(AUTO_RENAME_ENV) {
            config.auto_rename = parse_flag(&value);
        }
        if let Ok(value) = std::env::var(oxbridge_log::LOG_ENV) {
            if let Ok(level) = value.parse() {
                config.log_level = level;
            }
        }

        config
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

static CONFIG: OnceLock<RwLock<BridgeConfig>> = OnceLock::new();

fn global() -> &'static RwLock<BridgeConfig> {
    CONFIG.get_or_init(|| {
        let config = BridgeConfig::from_env();
        oxbridge_log::set_level(config.log_level);
        RwLock::new(config)
    })
}

/// Current configuration.
#[must_use]
pub fn config() -> BridgeConfig {
    *global().read()
}

/// Replaces the configuration and applies its log level.
pub fn set_config(config: BridgeConfig) {
    *global().write() = config;
    oxbridge_log::set_level(config.log_level);
}

/// Enables or disables auto-rename for later definitions.
pub fn set_auto_rename(enabled: bool) {
    global().write().auto_rename = enabled;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        for on in ["1", "true", "YES", " on "] {
            assert!(parse_flag(on), "{on}");
        }
        for off in ["0", "false", "", "enabled"] {
            assert!(!parse_flag(off), "{off}");
        }
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert!(!config.auto_rename);
        assert_eq!(config.log_level, Level::Warn);
    }
}
