use crate::preferences::{PrefKey, PrefResult, PreferenceStore};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_TOP_K: i32 = 16;
pub const DEFAULT_MAX_OUTPUT_TOKENS: i32 = 256;

/// Sampling settings handed to the engine when it is initialized
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub temperature: f32,
    pub top_k: i32,
    pub max_output_tokens: i32,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_k: DEFAULT_TOP_K,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

impl GenerationParameters {
    pub fn load(store: &dyn PreferenceStore) -> Self {
        Self {
            temperature: get_temperature(store),
            top_k: get_top_k(store),
            max_output_tokens: get_max_output_tokens(store),
        }
    }

    pub fn save(&self, store: &mut dyn PreferenceStore) -> PrefResult<()> {
        set_temperature(store, self.temperature)?;
        set_top_k(store, self.top_k)?;
        set_max_output_tokens(store, self.max_output_tokens)
    }

    /// Check value ranges, returning the offending key and a message
    pub fn validate(&self) -> Result<(), Vec<(PrefKey, String)>> {
        let mut problems = Vec::new();
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            problems.push((
                PrefKey::Temperature,
                "must be a number greater than or equal to 0".to_string(),
            ));
        }
        if self.top_k < 1 {
            problems.push((PrefKey::TopK, "must be at least 1".to_string()));
        }
        if self.max_output_tokens < 1 {
            problems.push((PrefKey::MaxOutputTokens, "must be at least 1".to_string()));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

pub fn get_temperature(store: &dyn PreferenceStore) -> f32 {
    store.get_float(PrefKey::Temperature, DEFAULT_TEMPERATURE)
}

pub fn set_temperature(store: &mut dyn PreferenceStore, temperature: f32) -> PrefResult<()> {
    store.set_float(PrefKey::Temperature, temperature)
}

pub fn get_top_k(store: &dyn PreferenceStore) -> i32 {
    store.get_int(PrefKey::TopK, DEFAULT_TOP_K)
}

pub fn set_top_k(store: &mut dyn PreferenceStore, top_k: i32) -> PrefResult<()> {
    store.set_int(PrefKey::TopK, top_k)
}

pub fn get_max_output_tokens(store: &dyn PreferenceStore) -> i32 {
    store.get_int(PrefKey::MaxOutputTokens, DEFAULT_MAX_OUTPUT_TOKENS)
}

pub fn set_max_output_tokens(store: &mut dyn PreferenceStore, max_tokens: i32) -> PrefResult<()> {
    store.set_int(PrefKey::MaxOutputTokens, max_tokens)
}
