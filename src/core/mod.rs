// Core types
pub mod types;
pub use types::*;

// Process configuration and the re-entrancy guard
pub mod config;
pub mod guard;

// Diagnostics and the event log
pub mod logger;

// Arena-backed storage for the engine
pub mod arena;
pub mod graph;
pub mod thread_context;

// Lock-order validation engine
pub mod detector;
pub use detector::{DeadlockCallback, Engine, EngineStats, global};

use anyhow::{Result, bail};
use config::Config;
use std::path::PathBuf;

/// Lockdep configuration builder
///
/// Fixes the process configuration and sets up the global engine. Without it
/// the configuration is read from the environment the first time any call-in
/// runs.
pub struct Lockdep {
    enabled: bool,
    verbose: bool,
    log_path: Option<PathBuf>,
    callback: Option<DeadlockCallback>,
}

impl Default for Lockdep {
    fn default() -> Self {
        Self::new()
    }
}

impl Lockdep {
    /// Create a builder with default settings
    ///
    /// By default:
    /// - Detection is enabled
    /// - Only denials are printed
    /// - The event log is disabled
    /// - No callback is registered
    pub fn new() -> Self {
        Lockdep {
            enabled: true,
            verbose: false,
            log_path: None,
            callback: None,
        }
    }

    /// Turn every call-in into a no-op that allows
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Print one diagnostic line per operation
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Activate the event log and set the path for the log file
    ///
    /// # Arguments
    /// * `path` - Path to the log file. If the path contains "{timestamp}",
    ///   it will be replaced with the current timestamp.
    pub fn with_log<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.log_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set a callback to be invoked with every denied acquisition
    ///
    /// The callback runs on the denying thread after the engine has released
    /// its internal lock, so it may call back into the engine.
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(CycleInfo) + Send + Sync + 'static,
    {
        self.callback = Some(std::sync::Arc::new(callback));
        self
    }

    /// Fix the configuration and start the global engine
    ///
    /// # Errors
    /// Returns an error if the configuration was already fixed (by an earlier
    /// `start` or by a call-in that read the environment), or if the event log
    /// could not be created
    pub fn start(self) -> Result<()> {
        let config = Config {
            enabled: self.enabled,
            verbose: self.verbose,
            log_path: self.log_path,
        };
        if !config::install(config) {
            bail!("lockdep configuration is already fixed");
        }

        let config = config::get();
        let engine = global();
        if let Some(path) = &config.log_path
            && !engine.is_logging()
        {
            bail!("Failed to initialize event log at {}", path.display());
        }

        if let Some(callback) = self.callback {
            engine.install_callback(callback);
        }

        logger::diag(format_args!(
            "lockdep {} started (enabled: {}, verbose: {}, log: {})",
            env!("CARGO_PKG_VERSION"),
            config.enabled,
            config.verbose,
            config
                .log_path
                .as_ref()
                .map_or_else(|| "off".to_string(), |p| p.display().to_string()),
        ));
        Ok(())
    }
}
