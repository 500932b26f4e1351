//! Initialization of a triad workspace (`triad.toml` + `.triad/`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{DEFAULT_CONFIG_FILE, TriadConfig, write_config};

/// Canonical paths of a workspace rooted at `root`.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let data_dir = root.join(".triad");
        let cfg = TriadConfig::default();
        Self {
            config_path: root.join(DEFAULT_CONFIG_FILE),
            runs_dir: root.join(&cfg.store.runs_dir),
            gitignore_path: data_dir.join(".gitignore"),
            data_dir,
            root,
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing `triad.toml`.
    pub force: bool,
}

/// Write a default `triad.toml` and create the runs directory.
///
/// Fails if `triad.toml` already exists unless `options.force` is set. Existing
/// runs are never touched.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<WorkspacePaths> {
    let paths = WorkspacePaths::new(root);
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "triad init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    create_dir(&paths.runs_dir)?;
    fs::write(&paths.gitignore_path, DATA_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &TriadConfig::default())?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const DATA_GITIGNORE: &str = "runs/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.runs_dir.is_dir());
        assert!(paths.config_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            DATA_GITIGNORE
        );
        assert_eq!(load_config(&paths.config_path).expect("load"), TriadConfig::default());
    }

    /// A second init without --force refuses to clobber the config.
    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_workspace(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    /// --force restores the default config and keeps existing runs.
    #[test]
    fn init_with_force_rewrites_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "[loop]\nmax_iterations = 3\n").expect("custom");
        let run_dir = paths.runs_dir.join("keep-me");
        fs::create_dir_all(&run_dir).expect("run dir");

        init_workspace(temp.path(), &InitOptions { force: true }).expect("re-init");
        let cfg = load_config(&paths.config_path).expect("load");
        assert_eq!(cfg.run_loop.max_iterations, 20);
        assert!(run_dir.is_dir());
    }
}
