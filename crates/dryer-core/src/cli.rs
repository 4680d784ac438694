//! Shared CLI helpers for workspace tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

/// Installs the global subscriber; `RUST_LOG` overrides the verbosity flag.
pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init()
        .map_err(|e| Error::InvalidConfig(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path).map_err(|e| {
        Error::InvalidConfig(format!("Failed to read config {}: {e}", path.display()))
    })?;

    toml::from_str(&content).map_err(|e| {
        Error::InvalidConfig(format!("Failed to parse config {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Paths {
        records: String,
        models_dir: String,
    }

    #[test]
    fn test_load_toml_config() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("dryer.toml");
        fs::write(&path, "records = \"sechoir_data.json\"\nmodels_dir = \"MODELS\"\n")?;

        let paths: Paths = load_toml_config(&path)?;
        assert_eq!(paths.records, "sechoir_data.json");
        assert_eq!(paths.models_dir, "MODELS");
        Ok(())
    }

    #[test]
    fn test_missing_toml_is_config_error() {
        let result: Result<Paths> = load_toml_config(Path::new("/nonexistent/dryer.toml"));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
