use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error("failed to access preferences at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse preferences at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot store non-finite value {value} for '{key}'")]
    NonFinite { key: &'static str, value: f32 },
    #[error("could not determine config directory")]
    NoConfigDir,
}

pub type PrefResult<T> = Result<T, PreferenceError>;

/// Named settings persisted in a [`PreferenceStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefKey {
    Temperature,
    TopK,
    MaxOutputTokens,
}

impl PrefKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefKey::Temperature => "temperature",
            PrefKey::TopK => "top_k",
            PrefKey::MaxOutputTokens => "max_output_tokens",
        }
    }
}

/// Key/value storage for scalar settings, read with a fallback default
pub trait PreferenceStore {
    fn get_float(&self, key: PrefKey, default: f32) -> f32;
    fn set_float(&mut self, key: PrefKey, value: f32) -> PrefResult<()>;
    fn get_int(&self, key: PrefKey, default: i32) -> i32;
    fn set_int(&mut self, key: PrefKey, value: i32) -> PrefResult<()>;
}

// Int is listed first so whole numbers written as integers don't read back as floats.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum PrefValue {
    Int(i64),
    Float(f64),
}

#[derive(Debug, Default, Clone)]
struct PrefMap(BTreeMap<String, PrefValue>);

impl PrefMap {
    fn get_float(&self, key: PrefKey, default: f32) -> f32 {
        match self.0.get(key.as_str()) {
            Some(PrefValue::Float(v)) => *v as f32,
            Some(PrefValue::Int(v)) => *v as f32,
            None => default,
        }
    }

    fn get_int(&self, key: PrefKey, default: i32) -> i32 {
        match self.0.get(key.as_str()) {
            Some(PrefValue::Int(v)) => match i32::try_from(*v) {
                Ok(v) => v,
                Err(_) => {
                    warn!(key = key.as_str(), value = v, "stored integer out of range, using default");
                    default
                }
            },
            Some(PrefValue::Float(v)) => {
                warn!(key = key.as_str(), value = v, "expected integer preference, using default");
                default
            }
            None => default,
        }
    }

    fn put_float(&mut self, key: PrefKey, value: f32) -> PrefResult<()> {
        if !value.is_finite() {
            return Err(PreferenceError::NonFinite {
                key: key.as_str(),
                value,
            });
        }
        self.0
            .insert(key.as_str().to_string(), PrefValue::Float(value as f64));
        Ok(())
    }

    fn put_int(&mut self, key: PrefKey, value: i32) {
        self.0
            .insert(key.as_str().to_string(), PrefValue::Int(value as i64));
    }
}

/// Preferences kept only for the lifetime of the process
#[derive(Debug, Default, Clone)]
pub struct MemoryPreferenceStore {
    values: PrefMap,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get_float(&self, key: PrefKey, default: f32) -> f32 {
        self.values.get_float(key, default)
    }

    fn set_float(&mut self, key: PrefKey, value: f32) -> PrefResult<()> {
        self.values.put_float(key, value)
    }

    fn get_int(&self, key: PrefKey, default: i32) -> i32 {
        self.values.get_int(key, default)
    }

    fn set_int(&mut self, key: PrefKey, value: i32) -> PrefResult<()> {
        self.values.put_int(key, value);
        Ok(())
    }
}

/// Preferences persisted as a JSON object, written through on every change
#[derive(Debug, Clone)]
pub struct JsonPreferenceStore {
    path: PathBuf,
    values: PrefMap,
}

impl JsonPreferenceStore {
    /// Open the store at the default location under the user config directory
    pub fn open_default() -> PrefResult<Self> {
        Self::open(Self::default_path()?)
    }

    /// Open the store backed by `path`. A missing file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> PrefResult<Self> {
        let path = path.into();
        let values = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|source| PreferenceError::Io {
                path: path.clone(),
                source,
            })?;
            let map: BTreeMap<String, PrefValue> =
                serde_json::from_str(&content).map_err(|source| PreferenceError::Parse {
                    path: path.clone(),
                    source,
                })?;
            PrefMap(map)
        } else {
            PrefMap::default()
        };
        debug!(path = ?path, entries = values.0.len(), "opened preference store");
        Ok(Self { path, values })
    }

    pub fn default_path() -> PrefResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(PreferenceError::NoConfigDir)?;
        Ok(config_dir.join("genchat").join("preferences.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> PrefResult<()> {
        let io_err = |source| PreferenceError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(&self.values.0).map_err(|source| {
            PreferenceError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;
        fs::write(&self.path, content).map_err(io_err)
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn get_float(&self, key: PrefKey, default: f32) -> f32 {
        self.values.get_float(key, default)
    }

    fn set_float(&mut self, key: PrefKey, value: f32) -> PrefResult<()> {
        self.values.put_float(key, value)?;
        self.flush()
    }

    fn get_int(&self, key: PrefKey, default: i32) -> i32 {
        self.values.get_int(key, default)
    }

    fn set_int(&mut self, key: PrefKey, value: i32) -> PrefResult<()> {
        self.values.put_int(key, value);
        self.flush()
    }
}
