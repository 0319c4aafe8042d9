//! User-facing error classification.
//!
//! Failures that cross component boundaries travel as values (error-flagged
//! tool results, blocking hook outputs); this module only shapes whatever
//! reaches the top of a turn into a titled report with recovery suggestions.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    Network,
    Timeout,
    Permission,
    Validation,
    Storage,
    Runtime,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub title: String,
    pub message: String,
    pub kind: ErrorKind,
    pub suggestions: Vec<String>,
}

impl ErrorReport {
    pub fn new(title: impl Into<String>, message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind,
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: {}", self.title, self.message)?;
        for (i, suggestion) in self.suggestions.iter().enumerate() {
            writeln!(f, "  {}. {suggestion}", i + 1)?;
        }
        Ok(())
    }
}

/// Classify an error by message pattern into a titled report.
pub fn classify(error: &anyhow::Error) -> ErrorReport {
    let message = error.to_string();
    let lower = message.to_lowercase();

    if lower.contains("api key") || lower.contains("sable_api") {
        return ErrorReport::new("Configuration Error", &message, ErrorKind::Configuration)
            .with_suggestion("Set the SABLE_API_KEY environment variable")
            .with_suggestion("Add SABLE_API_KEY to ~/.sable/.env");
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return ErrorReport::new("Request Timeout", &message, ErrorKind::Timeout)
            .with_suggestion("Check your network connection")
            .with_suggestion("Try again; the endpoint may be overloaded");
    }
    if lower.contains("connection") || lower.contains("network") || lower.contains("dns") {
        return ErrorReport::new("Network Error", &message, ErrorKind::Network)
            .with_suggestion("Check your internet connection")
            .with_suggestion("Verify SABLE_API_URL points at a reachable endpoint");
    }
    if lower.contains("denied") || lower.contains("permission") || lower.contains("blocked") {
        return ErrorReport::new("Permission Error", &message, ErrorKind::Permission)
            .with_suggestion("Adjust the approval mode or approve the action when prompted");
    }
    if lower.contains("invalid") || lower.contains("malformed") || lower.contains("parse") {
        return ErrorReport::new("Validation Error", &message, ErrorKind::Validation);
    }
    if lower.contains("sqlite") || lower.contains("no such file") || lower.contains("i/o") {
        return ErrorReport::new("Storage Error", &message, ErrorKind::Storage)
            .with_suggestion("Check permissions on ~/.sable and the workspace .sable directory");
    }

    ErrorReport::new("Error", &message, ErrorKind::Unknown)
}
