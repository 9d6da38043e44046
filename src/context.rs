// File: ./src/context.rs
// Where roomcal keeps its config and log files.
use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const LOG_FILE: &str = "roomcal.log";

/// Resolves the files roomcal touches on disk. The parent directory of a
/// returned path exists.
pub trait AppContext: Send + Sync + std::fmt::Debug {
    fn config_file(&self) -> Result<PathBuf>;
    fn log_file(&self) -> Result<PathBuf>;
}

fn file_in(dir: &Path, name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {:?}", dir))?;
    Ok(dir.join(name))
}

/// Platform directories, or `<root>/config` and `<root>/data` under `--root`.
#[derive(Clone, Debug)]
pub struct StandardContext {
    root: Option<PathBuf>,
}

impl StandardContext {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn dir(&self, sub: &str) -> Result<PathBuf> {
        if let Some(root) = &self.root {
            return Ok(root.join(sub));
        }
        let proj = ProjectDirs::from("org", "roomcal", "roomcal")
            .ok_or_else(|| anyhow!("No home directory"))?;
        Ok(match sub {
            "config" => proj.config_dir().to_path_buf(),
            _ => proj.data_local_dir().to_path_buf(),
        })
    }
}

impl AppContext for StandardContext {
    fn config_file(&self) -> Result<PathBuf> {
        file_in(&self.dir("config")?, CONFIG_FILE)
    }

    fn log_file(&self) -> Result<PathBuf> {
        file_in(&self.dir("data")?, LOG_FILE)
    }
}

/// Scratch directory for tests; removed on drop.
#[derive(Debug)]
pub struct TestContext {
    pub root: PathBuf,
}

impl TestContext {
    pub fn new() -> Self {
        let root = std::env::temp_dir().join(format!("roomcal_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("failed to create TestContext temp dir");
        Self { root }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContext for TestContext {
    fn config_file(&self) -> Result<PathBuf> {
        file_in(&self.root, CONFIG_FILE)
    }

    fn log_file(&self) -> Result<PathBuf> {
        file_in(&self.root, LOG_FILE)
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}
