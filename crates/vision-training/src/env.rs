//! Run directory setup.

use std::fs;
use std::path::PathBuf;

use chrono::Local;
use tracing::info;
use vision_core::{Error, Result, RunConfig};

use crate::checkpoint::CheckpointPaths;
use crate::summary::CsvSummaryWriter;

/// Everything a run writes lives under `run_dir`
pub struct RunEnv {
    pub run_dir: PathBuf,
    pub writer: CsvSummaryWriter,
    pub checkpoints: CheckpointPaths,
}

/// Creates `<log_dir>/<YYYYmmdd-HHMMSS>/`, stores the resolved config there
/// as `config.toml` and opens the summary writer. Checkpoints are named
/// after the backbone inside the run directory.
pub fn init_env(cfg: &RunConfig) -> Result<RunEnv> {
    let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let run_dir = cfg.train.log_dir.join(stamp);
    fs::create_dir_all(&run_dir)?;

    let resolved = toml::to_string_pretty(cfg)
        .map_err(|e| Error::Serialization(format!("Failed to serialize config: {e}")))?;
    fs::write(run_dir.join("config.toml"), resolved)?;

    let writer = CsvSummaryWriter::new(&run_dir)?;
    let checkpoints = CheckpointPaths::new(run_dir.join(&cfg.models.backbone));

    info!("Run directory: {}", run_dir.display());
    Ok(RunEnv {
        run_dir,
        writer,
        checkpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(log_dir: &std::path::Path) -> RunConfig {
        let text = format!(
            r#"
            [DataSet]
            txt = "data/train.txt"
            labels = ["a", "b"]

            [Models]
            backbone = "cnn"
            loss = "cross_entropy"

            [Train]
            log_dir = "{}"
            "#,
            log_dir.display()
        );
        toml::from_str(&text).unwrap()
    }

    #[test]
    fn test_creates_run_dir_with_config() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());

        let env = init_env(&cfg).unwrap();

        assert!(env.run_dir.starts_with(dir.path()));
        let saved: RunConfig =
            toml::from_str(&fs::read_to_string(env.run_dir.join("config.toml")).unwrap()).unwrap();
        assert_eq!(saved.dataset.labels, vec!["a", "b"]);
        assert_eq!(env.checkpoints.best(), env.run_dir.join("cnn_best"));
        assert!(env.run_dir.join("scalars.csv").exists());
    }
}
