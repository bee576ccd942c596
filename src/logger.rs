//! # Logger
//!
//! A cloneable, scoped logging handle
//!
//! Components receive a [`Logger`] from whoever creates them, instead of reaching for
//! a process-wide logger of their own. Records go to the [`log`] facade, with the
//! handle's scope prefixed, so whichever backend the binary installs (`env_logger`)
//! decides what is shown.
//!
//! ```text
//! [download/worker 3/peer 165.232.41.73:51556] piece 7 committed
//! ```

use std::fmt;
use std::sync::Arc;

use log::Level;

/// Target of every record emitted through a [`Logger`]
const TARGET: &str = "bittorrent_client";

#[derive(Clone, Debug)]
pub struct Logger {
    scope: Arc<str>,
}

impl Logger {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: Arc::from(scope.into()),
        }
    }

    /// A handle for a sub-component; its scope is nested under this one.
    pub fn child(&self, scope: impl fmt::Display) -> Self {
        Self::new(format!("{}/{}", self.scope, scope))
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        log::log!(target: TARGET, level, "[{}] {}", self.scope, args);
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Trace, args)
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args)
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args)
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args)
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(TARGET)
    }
}
