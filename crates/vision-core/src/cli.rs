//! Shared CLI helpers for workspace tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Deserialize)]
    struct Section {
        batch: usize,
    }

    #[derive(Deserialize)]
    struct Doc {
        #[serde(rename = "DataSet")]
        dataset: Section,
    }

    #[test]
    fn test_load_toml_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.toml");
        fs::write(&path, "[DataSet]\nbatch = 16\n").unwrap();

        let doc: Doc = load_toml_config(&path).unwrap();
        assert_eq!(doc.dataset.batch, 16);
    }

    #[test]
    fn test_missing_config_is_config_error() {
        let result: Result<Doc> = load_toml_config(Path::new("/nonexistent/train.toml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
