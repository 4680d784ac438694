//! Workspace settings: where the dryer log, the training sets, the model
//! artifacts and the model config live.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dryer_core::{load_toml_config, ImportReport, ModelConfig, IMAGE_SIDE};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Settings file picked up from the working directory when `--settings` is absent.
pub const DEFAULT_SETTINGS_FILE: &str = "dryer.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Dryer log (JSON array of production records)
    pub records: PathBuf,
    /// Training-set registry
    pub sets: PathBuf,
    /// Directory of versioned model artifacts
    pub models_dir: PathBuf,
    /// Model configuration document; defaults are used when absent
    pub model_config: Option<PathBuf>,
    /// Side length images are resized to for new models; a loaded model
    /// keeps the side it was trained with
    pub image_side: u32,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            records: PathBuf::from("sechoir_data.json"),
            sets: PathBuf::from("training_sets.json"),
            models_dir: PathBuf::from("MODELS"),
            model_config: None,
            image_side: IMAGE_SIDE as u32,
        }
    }
}

impl WorkspaceSettings {
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => load_toml_config(path)
                .with_context(|| format!("Failed to load settings {}", path.display())),
            None if Path::new(DEFAULT_SETTINGS_FILE).exists() => {
                load_toml_config(Path::new(DEFAULT_SETTINGS_FILE))
                    .context("Failed to load dryer.toml")
            }
            None => Ok(Self::default()),
        }
    }

    /// The model config to work with; defaults when none is configured.
    pub fn model_config(&self, override_path: Option<&Path>) -> Result<ModelConfig> {
        let Some(path) = override_path.or(self.model_config.as_deref()) else {
            return Ok(ModelConfig::default());
        };
        if !path.exists() {
            warn!(path = %path.display(), "model config not found, using defaults");
            return Ok(ModelConfig::default());
        }
        let (config, report) = ModelConfig::load(path)
            .with_context(|| format!("Failed to read model config {}", path.display()))?;
        log_import(path, &report);
        Ok(config)
    }
}

pub fn log_import(path: &Path, report: &ImportReport) {
    if report.is_clean() {
        info!(path = %path.display(), "model config loaded");
        return;
    }
    if !report.unknown.is_empty() {
        warn!(keys = ?report.unknown, "unknown config keys kept but ignored");
    }
    if !report.rejected.is_empty() {
        warn!(keys = ?report.rejected, "config values rejected, defaults kept");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_partial_settings_file() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("dryer.toml");
        fs::write(&path, "models_dir = \"out/models\"\nimage_side = 16\n")?;

        let settings = WorkspaceSettings::resolve(Some(&path))?;
        assert_eq!(settings.models_dir, PathBuf::from("out/models"));
        assert_eq!(settings.image_side, 16);
        assert_eq!(settings.records, PathBuf::from("sechoir_data.json"));
        assert!(settings.model_config.is_none());
        Ok(())
    }

    #[test]
    fn test_every_settings_key() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("dryer.toml");
        fs::write(
            &path,
            r#"
records = "log.json"
sets = "sets.json"
models_dir = "models"
model_config = "model.json"
image_side = 24
"#,
        )?;

        let settings = WorkspaceSettings::resolve(Some(&path))?;
        assert_eq!(settings.records, PathBuf::from("log.json"));
        assert_eq!(settings.sets, PathBuf::from("sets.json"));
        assert_eq!(settings.models_dir, PathBuf::from("models"));
        assert_eq!(settings.model_config, Some(PathBuf::from("model.json")));
        assert_eq!(settings.image_side, 24);
        Ok(())
    }

    #[test]
    fn test_missing_model_config_uses_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let settings = WorkspaceSettings {
            model_config: Some(dir.path().join("absent.json")),
            ..Default::default()
        };
        assert_eq!(settings.model_config(None)?, ModelConfig::default());
        Ok(())
    }

    #[test]
    fn test_model_config_override() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("model.json");
        fs::write(&path, r#"{"n_epochs": 3, "architecture": "cnn+dense", "color": "red"}"#)?;

        let config = WorkspaceSettings::default().model_config(Some(&path))?;
        assert_eq!(config.n_epochs, 3);
        assert!(config.extra.contains_key("color"));
        Ok(())
    }
}
