use crate::engine::ollama::{DEFAULT_MODEL, DEFAULT_OLLAMA_URL};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Result, anyhow};

pub const URL_ENV: &str = "GENCHAT_OLLAMA_URL";
pub const MODEL_ENV: &str = "GENCHAT_MODEL";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub ollama_url: Option<String>,
    pub model: Option<String>,
    /// Initial position of the streaming toggle
    pub streaming: Option<bool>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_config_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&config_content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(config_path, config_content)?;
        Ok(())
    }

    pub fn save_streaming(streaming: bool) -> Result<()> {
        let mut config = Self::load().unwrap_or_else(|_| Self::new());
        config.streaming = Some(streaming);
        config.save()
    }

    /// Server URL: environment, then config file, then the local default
    pub fn effective_url(&self) -> String {
        pick(std::env::var(URL_ENV).ok(), self.ollama_url.clone(), DEFAULT_OLLAMA_URL)
    }

    pub fn effective_model(&self) -> String {
        pick(std::env::var(MODEL_ENV).ok(), self.model.clone(), DEFAULT_MODEL)
    }

    pub fn streaming_default(&self) -> bool {
        self.streaming.unwrap_or(false)
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("genchat"))
    }

    fn get_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }
}

fn pick(env: Option<String>, file: Option<String>, default: &str) -> String {
    env.filter(|v| !v.trim().is_empty())
        .or(file.filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::new());
        assert!(!config.streaming_default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");
        let config = Config {
            ollama_url: Some("http://gpu-box:11434".to_string()),
            model: Some("llama3.2:latest".to_string()),
            streaming: Some(true),
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_pick_precedence() {
        assert_eq!(pick(Some("env".into()), Some("file".into()), "def"), "env");
        assert_eq!(pick(None, Some("file".into()), "def"), "file");
        assert_eq!(pick(Some(" ".into()), None, "def"), "def");
    }
}
