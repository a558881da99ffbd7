//! Editable form for the generation parameters.
//!
//! Front ends render the three text fields however they like; the form owns
//! parsing, validation and the write-then-notify sequence on save. Dropping
//! the form without calling [`ConfigForm::confirm`] is the cancel path.

use crate::params::GenerationParameters;
use crate::preferences::{PrefKey, PreferenceError, PreferenceStore};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

/// Receives a single notification after new parameters are saved
pub trait ConfigUpdateListener {
    fn on_config_updated(&mut self, params: &GenerationParameters);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    Temperature,
    TopK,
    MaxOutputTokens,
}

impl ConfigField {
    pub fn all() -> Vec<ConfigField> {
        vec![
            ConfigField::Temperature,
            ConfigField::TopK,
            ConfigField::MaxOutputTokens,
        ]
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConfigField::Temperature => "Temperature",
            ConfigField::TopK => "Top K",
            ConfigField::MaxOutputTokens => "Max output tokens",
        }
    }

    pub fn next(&self) -> ConfigField {
        match self {
            ConfigField::Temperature => ConfigField::TopK,
            ConfigField::TopK => ConfigField::MaxOutputTokens,
            ConfigField::MaxOutputTokens => ConfigField::Temperature,
        }
    }

    pub fn previous(&self) -> ConfigField {
        match self {
            ConfigField::Temperature => ConfigField::MaxOutputTokens,
            ConfigField::TopK => ConfigField::Temperature,
            ConfigField::MaxOutputTokens => ConfigField::TopK,
        }
    }

    /// Look up a field by its preference key name (`temperature`, `top_k`, ...)
    pub fn from_key(name: &str) -> Option<ConfigField> {
        match name.trim().to_lowercase().as_str() {
            "temperature" | "temp" => Some(ConfigField::Temperature),
            "top_k" | "topk" => Some(ConfigField::TopK),
            "max_output_tokens" | "max_tokens" => Some(ConfigField::MaxOutputTokens),
            _ => None,
        }
    }

    fn from_pref(key: PrefKey) -> ConfigField {
        match key {
            PrefKey::Temperature => ConfigField::Temperature,
            PrefKey::TopK => ConfigField::TopK,
            PrefKey::MaxOutputTokens => ConfigField::MaxOutputTokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: ConfigField,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field.label(), self.message)
    }
}

#[derive(Debug, Error)]
pub enum ConfigFormError {
    #[error("invalid settings: {}", join_errors(.0))]
    Invalid(Vec<FieldError>),
    #[error(transparent)]
    Store(#[from] PreferenceError),
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigForm {
    pub temperature: String,
    pub top_k: String,
    pub max_output_tokens: String,
}

impl ConfigForm {
    /// Fill the fields from the values currently in the store
    pub fn load(store: &dyn PreferenceStore) -> Self {
        Self::from_params(&GenerationParameters::load(store))
    }

    pub fn from_params(params: &GenerationParameters) -> Self {
        Self {
            temperature: params.temperature.to_string(),
            top_k: params.top_k.to_string(),
            max_output_tokens: params.max_output_tokens.to_string(),
        }
    }

    pub fn field(&self, field: ConfigField) -> &str {
        match field {
            ConfigField::Temperature => &self.temperature,
            ConfigField::TopK => &self.top_k,
            ConfigField::MaxOutputTokens => &self.max_output_tokens,
        }
    }

    pub fn field_mut(&mut self, field: ConfigField) -> &mut String {
        match field {
            ConfigField::Temperature => &mut self.temperature,
            ConfigField::TopK => &mut self.top_k,
            ConfigField::MaxOutputTokens => &mut self.max_output_tokens,
        }
    }

    /// Parse and range-check every field, collecting one error per bad field
    pub fn parse(&self) -> Result<GenerationParameters, Vec<FieldError>> {
        let mut errors = Vec::new();

        let temperature = parse_field::<f32>(ConfigField::Temperature, &self.temperature, &mut errors);
        let top_k = parse_field::<i32>(ConfigField::TopK, &self.top_k, &mut errors);
        let max_output_tokens =
            parse_field::<i32>(ConfigField::MaxOutputTokens, &self.max_output_tokens, &mut errors);

        if let (Some(temperature), Some(top_k), Some(max_output_tokens)) =
            (temperature, top_k, max_output_tokens)
        {
            let params = GenerationParameters {
                temperature,
                top_k,
                max_output_tokens,
            };
            match params.validate() {
                Ok(()) => return Ok(params),
                Err(problems) => errors.extend(problems.into_iter().map(|(key, message)| {
                    FieldError {
                        field: ConfigField::from_pref(key),
                        message,
                    }
                })),
            }
        }

        Err(errors)
    }

    /// Save the parsed values and notify `listener`.
    ///
    /// Nothing is written and the listener is not called when any field is
    /// invalid, so the caller can keep the form open and show the errors.
    pub fn confirm(
        &self,
        store: &mut dyn PreferenceStore,
        listener: &mut dyn ConfigUpdateListener,
    ) -> Result<GenerationParameters, ConfigFormError> {
        let params = self.parse().map_err(ConfigFormError::Invalid)?;
        params.save(store)?;
        info!(
            temperature = params.temperature,
            top_k = params.top_k,
            max_output_tokens = params.max_output_tokens,
            "generation parameters saved"
        );
        listener.on_config_updated(&params);
        Ok(params)
    }
}

fn parse_field<T: FromStr>(field: ConfigField, text: &str, errors: &mut Vec<FieldError>) -> Option<T> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        errors.push(FieldError {
            field,
            message: "is required".to_string(),
        });
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            let expected = match field {
                ConfigField::Temperature => "a decimal number",
                ConfigField::TopK | ConfigField::MaxOutputTokens => "a whole number",
            };
            errors.push(FieldError {
                field,
                message: format!("'{}' is not {}", trimmed, expected),
            });
            None
        }
    }
}
