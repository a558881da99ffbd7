//! UI-agnostic session state types
//!
//! This module contains data structures that are shared between different front
//! ends (TUI, REPL, etc.) and don't depend on any specific UI framework.

use serde::{Deserialize, Serialize};

/// What produced a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Request,
    Response,
    ErrorResponse,
}

/// One line of the conversation shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub kind: EntryKind,
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(kind: EntryKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Generating,
}

/// Widget enablement derived from [`SessionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affordances {
    pub submit_label: &'static str,
    /// Pressing submit cancels the in-flight request instead of sending
    pub submit_is_cancel: bool,
    pub streaming_toggle_enabled: bool,
    pub config_enabled: bool,
}

impl SessionState {
    pub fn affordances(self) -> Affordances {
        match self {
            SessionState::Idle => Affordances {
                submit_label: "Send",
                submit_is_cancel: false,
                streaming_toggle_enabled: true,
                config_enabled: true,
            },
            SessionState::Generating => Affordances {
                submit_label: "Cancel",
                submit_is_cancel: true,
                streaming_toggle_enabled: false,
                config_enabled: false,
            },
        }
    }

    pub fn is_generating(self) -> bool {
        self == SessionState::Generating
    }
}
