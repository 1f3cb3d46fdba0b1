//! Run directories: `<out_dir>/<experiment>/run_<n>/`.
//!
//! Each run gets a fresh numbered directory holding a copy of the
//! configuration it ran with (`config.yml`) and its trace (`trace.jsonl`).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Errors creating a run directory.
#[derive(Debug, thiserror::Error)]
pub enum RunDirError {
    #[error("failed to create run directory {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("failed to copy configuration into {path}: {source}")]
    CopyConfig { path: PathBuf, source: io::Error },
}

/// A directory holding one run.
#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
    index: u32,
}

impl RunDir {
    pub const CONFIG_FILE: &'static str = "config.yml";
    pub const TRACE_FILE: &'static str = "trace.jsonl";

    /// Creates the next `run_<n>` under `out_dir/experiment` and copies
    /// `config` into it.
    pub fn create(out_dir: &Path, experiment: &str, config: &Path) -> Result<Self, RunDirError> {
        let parent = out_dir.join(experiment);
        fs::create_dir_all(&parent).map_err(|source| RunDirError::Create {
            path: parent.clone(),
            source,
        })?;

        // Another process may claim the same index; `create_dir` fails then.
        let mut index = next_index(&parent);
        let path = loop {
            let candidate = parent.join(format!("run_{index}"));
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => index += 1,
                Err(source) => {
                    return Err(RunDirError::Create {
                        path: candidate,
                        source,
                    });
                }
            }
        };

        let run = Self { path, index };
        fs::copy(config, run.config_path()).map_err(|source| RunDirError::CopyConfig {
            path: run.path.clone(),
            source,
        })?;
        debug!(path = %run.path.display(), "Created run directory");
        Ok(run)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(Self::CONFIG_FILE)
    }

    pub fn trace_path(&self) -> PathBuf {
        self.path.join(Self::TRACE_FILE)
    }
}

/// One more than the highest existing `run_<n>`, starting at 1.
fn next_index(parent: &Path) -> u32 {
    let Ok(entries) = fs::read_dir(parent) else {
        return 1;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("run_"))
                .and_then(|n| n.parse::<u32>().ok())
        })
        .max()
        .map_or(1, |highest| highest + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_file(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("exp.yml");
        fs::write(&path, "experiment:\n  name: exp\n").unwrap();
        path
    }

    #[test]
    fn test_first_run_is_run_1() {
        let dir = TempDir::new().unwrap();
        let config = config_file(&dir);
        let run = RunDir::create(&dir.path().join("runs"), "exp", &config).unwrap();

        assert_eq!(run.index(), 1);
        assert!(run.path().ends_with("runs/exp/run_1"));
        assert_eq!(
            fs::read_to_string(run.config_path()).unwrap(),
            "experiment:\n  name: exp\n"
        );
        assert!(!run.trace_path().exists());
    }

    #[test]
    fn test_index_follows_highest_existing() {
        let dir = TempDir::new().unwrap();
        let config = config_file(&dir);
        let out = dir.path().join("runs");
        fs::create_dir_all(out.join("exp/run_7")).unwrap();
        fs::create_dir_all(out.join("exp/notes")).unwrap();

        let run = RunDir::create(&out, "exp", &config).unwrap();
        assert_eq!(run.index(), 8);
    }

    #[test]
    fn test_missing_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = RunDir::create(dir.path(), "exp", &dir.path().join("missing.yml")).unwrap_err();
        assert!(matches!(err, RunDirError::CopyConfig { .. }));
    }
}
