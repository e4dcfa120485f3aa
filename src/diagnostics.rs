//! Structured advisories returned alongside results.
//!
//! Every diagnostic pushed here is also forwarded to the `log` facade, so a
//! binary that installs a logger sees the same messages on stderr.

use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub level: Level,
    /// Feature the message is about, if any.
    pub feature: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}", message);
        self.entries.push(Diagnostic {
            level: Level::Warning,
            feature: None,
            message,
        });
    }

    pub fn warn_feature(&mut self, feature: &str, message: impl Into<String>) {
        let message = message.into();
        warn!("{}: {}", feature, message);
        self.entries.push(Diagnostic {
            level: Level::Warning,
            feature: Some(feature.to_string()),
            message,
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.entries.push(Diagnostic {
            level: Level::Info,
            feature: None,
            message,
        });
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(|d| d.level == Level::Warning)
    }

    pub fn has_warning_containing(&self, needle: &str) -> bool {
        self.warnings().any(|d| d.message.contains(needle))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
