pub mod config;
pub mod config_form;
pub mod engine;
pub mod params;
pub mod preferences;
pub mod session;
pub mod state;
pub mod transcript;

// Re-export main types for convenience
pub use config::Config;
pub use config_form::{ConfigField, ConfigForm, ConfigFormError, ConfigUpdateListener, FieldError};
pub use engine::{Engine, EngineError, EngineFactory, OllamaEngine, OllamaFactory, TextStream};
pub use params::GenerationParameters;
pub use preferences::{
    JsonPreferenceStore, MemoryPreferenceStore, PrefKey, PreferenceError, PreferenceStore,
};
pub use session::{
    EventKind, GenerationEvent, Outcome, RequestId, Session, SubmitOutcome, UiUpdate,
};
pub use state::{Affordances, EntryKind, SessionState, TranscriptEntry};
pub use transcript::{Transcript, TranscriptError};
