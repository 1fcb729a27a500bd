use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".".into()
}

fn default_tmp_dir() -> String {
    ".tmp".into()
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    /// Remove `<tmp>/<trigger>` left over from an earlier run before dumping.
    Trigger,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: String,
    pub clean: CleanMode,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            tmp_dir: default_tmp_dir(),
            clean: CleanMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub tmp_dir: PathBuf,
    /// `<tmp>/<trigger>`
    pub trigger_dir: PathBuf,
    /// `<tmp>/<trigger>/databases`, where database dumps land.
    pub dump_dir: PathBuf,
}

pub fn load_paths(cfg: &WorkspaceConfig, trigger: &str) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = absolute_from(&cwd, &cfg.root_dir, "workspace.root_dir")?;
    let tmp_dir = tmp_under(&root, &cfg.tmp_dir)?;
    let trigger_dir = tmp_dir.join(trigger);
    let dump_dir = trigger_dir.join("databases");
    Ok(WorkspacePaths {
        root,
        tmp_dir,
        trigger_dir,
        dump_dir,
    })
}

/// Resolve paths, apply the clean mode, and create the dump directory.
pub fn prepare(cfg: &WorkspaceConfig, trigger: &str) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg, trigger)?;
    if cfg.clean == CleanMode::Trigger {
        safe_remove_dir_all(&paths.root, &paths.trigger_dir)?;
    }
    fs::create_dir_all(&paths.dump_dir).map_err(|e| {
        Error::msg(format!(
            "failed to create dump dir {}: {e}",
            paths.dump_dir.display()
        ))
    })?;
    Ok(paths)
}

fn absolute_from(base: &Path, raw: &str, what: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::config(format!("{what} is empty")));
    }
    let p = PathBuf::from(raw);
    Ok(if p.is_absolute() { p } else { base.join(p) })
}

fn tmp_under(root: &Path, raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if Path::new(raw)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::config(format!(
            "workspace.tmp_dir '{raw}' must not contain '..'"
        )));
    }
    absolute_from(root, raw, "workspace.tmp_dir")
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) || dir_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (not inside workspace root '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::msg(format!("failed to remove dir {}: {e}", dir_can.display())))
}
