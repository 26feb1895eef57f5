//! Process-wide configuration
//!
//! Fixed once per process, either by [`crate::Lockdep::start`] or, on first
//! use, from the environment:
//!
//! - `LOCKDEP_DISABLE=1` turns every call-in into a no-op that allows.
//! - `LOCKDEP_VERBOSE=1` prints a diagnostic line for every operation.
//! - `LOCKDEP_LOG=<path>` writes the JSON event log to `path`.

use std::path::PathBuf;
use std::sync::OnceLock;

pub const ENV_DISABLE: &str = "LOCKDEP_DISABLE";
pub const ENV_VERBOSE: &str = "LOCKDEP_VERBOSE";
pub const ENV_LOG: &str = "LOCKDEP_LOG";

/// Immutable engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether call-ins reach the engine at all
    pub enabled: bool,
    /// One diagnostic line per operation instead of denials only
    pub verbose: bool,
    /// Event log destination
    pub log_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: true,
            verbose: false,
            log_path: None,
        }
    }
}

impl Config {
    /// Build a configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).is_some_and(|value| value.trim() == "1");
        Config {
            enabled: !flag(ENV_DISABLE),
            verbose: flag(ENV_VERBOSE),
            log_path: lookup(ENV_LOG)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// The process configuration, read from the environment on first access
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Fix the configuration explicitly
///
/// # Returns
/// `false` if the configuration had already been fixed
pub(crate) fn install(config: Config) -> bool {
    CONFIG.set(config).is_ok()
}

/// Whether the configuration has been fixed already
pub(crate) fn is_fixed() -> bool {
    CONFIG.get().is_some()
}

/// Whether call-ins are enabled for this process
pub fn is_enabled() -> bool {
    get().enabled
}

pub fn is_verbose() -> bool {
    get().verbose
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxhash::FxHashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: FxHashMap<String, String> = pairs
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = from_pairs(&[]);
        assert!(config.enabled);
        assert!(!config.verbose);
        assert!(config.log_path.is_none());
    }

    #[test]
    fn test_disable_switch_requires_one() {
        assert!(!from_pairs(&[(ENV_DISABLE, "1")]).enabled);
        assert!(from_pairs(&[(ENV_DISABLE, "0")]).enabled);
        assert!(from_pairs(&[(ENV_DISABLE, "yes")]).enabled);
    }

    #[test]
    fn test_log_path_and_verbose() {
        let config = from_pairs(&[(ENV_VERBOSE, "1"), (ENV_LOG, "/tmp/lockdep.log")]);
        assert!(config.verbose);
        assert_eq!(config.log_path, Some(PathBuf::from("/tmp/lockdep.log")));
        assert!(from_pairs(&[(ENV_LOG, "")]).log_path.is_none());
    }
}
