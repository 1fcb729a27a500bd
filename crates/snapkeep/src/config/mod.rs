//! Job definition loading.
//!
//! A job is a TOML document. It may name a parent with a root-level `extends = "<file>"` and
//! pull tables from other files with `imports = [...]` at any table level; later values win and
//! tables merge key by key.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

use crate::compressor::CompressorConfig;
use crate::database::elasticsearch::ElasticsearchConfig;
use crate::error::{Error, Result};
use crate::remote::DEFAULT_CALL_TIMEOUT;
use crate::workspace::WorkspaceConfig;

#[derive(Debug, Clone)]
pub struct JobDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl JobDoc {
    pub fn parse(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let path = path.into();
        let value: Value = toml::from_str(raw)
            .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;
        Ok(Self { path, value })
    }

    pub fn job(&self) -> Result<JobConfig> {
        let cfg: JobConfig = self
            .value
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("invalid job {}: {e}", self.path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DatabasesConfig {
    pub elasticsearch: Vec<ElasticsearchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub trigger: String,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub utilities: BTreeMap<String, String>,
    pub compressor: Option<CompressorConfig>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub databases: DatabasesConfig,
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        let t = self.trigger.trim();
        if t.is_empty() {
            return Err(Error::config("trigger is empty"));
        }
        if t.contains('/') || t.contains('\\') || t == "." || t == ".." {
            return Err(Error::config(format!(
                "trigger '{t}' must be a single path segment"
            )));
        }
        if self.http.timeout_secs == 0 {
            return Err(Error::config("http.timeout_secs must be > 0"));
        }
        if let Some(c) = &self.compressor {
            c.validate()?;
        }

        let mut seen = BTreeSet::new();
        for db in &self.databases.elasticsearch {
            db.validate()?;
            if !seen.insert(db.dump_filename()) {
                return Err(Error::config(format!(
                    "duplicate elasticsearch database '{}' (give each entry a distinct id)",
                    db.dump_filename()
                )));
            }
        }
        if self.databases.elasticsearch.is_empty() {
            return Err(Error::config("job defines no databases"));
        }
        Ok(())
    }
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(b), Value::Table(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(slot) => merge(slot, v),
                    None => {
                        b.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn relative_to(file: &Path, reference: &str) -> PathBuf {
    let p = Path::new(reference);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    file.parent().unwrap_or_else(|| Path::new(".")).join(p)
}

fn take_imports(file: &Path, tbl: &mut toml::Table) -> Result<Vec<String>> {
    let Some(raw) = tbl.remove("imports") else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = raw else {
        return Err(Error::config(format!(
            "imports in {} must be an array of strings",
            file.display()
        )));
    };
    items
        .into_iter()
        .map(|v| match v {
            Value::String(s) => Ok(s.trim().to_string()),
            _ => Err(Error::config(format!(
                "imports in {} must be an array of strings",
                file.display()
            ))),
        })
        .filter(|r| !matches!(r, Ok(s) if s.is_empty()))
        .collect()
}

fn expand_imports(file: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };
    let imports = take_imports(file, tbl)?;
    if !imports.is_empty() {
        let mut acc = Value::Table(toml::Table::new());
        for imp in imports {
            merge(&mut acc, load_layered(&relative_to(file, &imp), stack)?);
        }
        merge(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }
    for (_, child) in tbl.iter_mut() {
        expand_imports(file, child, stack)?;
    }
    Ok(())
}

fn load_layered(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(key.clone()) {
        return Err(Error::config(format!(
            "job config include cycle at {}",
            key.display()
        )));
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read job {}: {e}", path.display())))?;
    let mut value = JobDoc::parse(path, &raw)?.value;

    let mut out = Value::Table(toml::Table::new());
    let parent = value
        .as_table_mut()
        .and_then(|t| t.remove("extends"))
        .map(|v| match v {
            Value::String(s) => Ok(s),
            _ => Err(Error::config(format!(
                "extends in {} must be a string",
                path.display()
            ))),
        })
        .transpose()?;
    if let Some(parent) = parent {
        out = load_layered(&relative_to(path, &parent), stack)?;
    }

    expand_imports(path, &mut value, stack)?;
    merge(&mut out, value);

    stack.remove(&key);
    Ok(out)
}

pub fn load(path: &Path) -> Result<JobDoc> {
    let value = load_layered(path, &mut HashSet::new())?;
    Ok(JobDoc {
        path: path.to_path_buf(),
        value,
    })
}
