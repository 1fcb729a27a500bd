use std::path::Path;
use std::time::Duration;

use crate::compressor::{self, Compressor};
use crate::config::JobConfig;
use crate::database::elasticsearch::Elasticsearch;
use crate::database::{Adapter, DumpEnv};
use crate::error::Result;
use crate::utilities::Utilities;
use crate::workspace::WorkspaceConfig;

/// Utilities every job pipeline is built from.
const BASE_UTILITIES: &[&str] = &["tar", "cat"];

/// A validated job, ready to run: adapters constructed, compressor resolved.
pub struct Job {
    trigger: String,
    workspace: WorkspaceConfig,
    utilities: Utilities,
    compressor: Option<Box<dyn Compressor>>,
    adapters: Vec<Box<dyn Adapter>>,
}

impl Job {
    pub fn from_config(cfg: &JobConfig) -> Result<Self> {
        cfg.validate()?;
        let utilities = Utilities::new(&cfg.utilities)?;
        let compressor = cfg
            .compressor
            .as_ref()
            .map(|c| compressor::from_config(c, &utilities))
            .transpose()?;
        let timeout = Duration::from_secs(cfg.http.timeout_secs);

        let mut adapters: Vec<Box<dyn Adapter>> = Vec::new();
        for db in &cfg.databases.elasticsearch {
            adapters.push(Box::new(Elasticsearch::new(db.clone(), timeout)?));
        }

        Ok(Self {
            trigger: cfg.trigger.trim().to_string(),
            workspace: cfg.workspace.clone(),
            utilities,
            compressor,
            adapters,
        })
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn workspace(&self) -> &WorkspaceConfig {
        &self.workspace
    }

    pub fn adapters(&self) -> impl Iterator<Item = &dyn Adapter> {
        self.adapters.iter().map(|a| a.as_ref())
    }

    pub fn dump_env<'a>(&'a self, dump_dir: &'a Path) -> DumpEnv<'a> {
        DumpEnv {
            dump_dir,
            utilities: &self.utilities,
            compressor: self.compressor.as_deref(),
        }
    }

    pub fn artifact_extension(&self) -> String {
        match &self.compressor {
            Some(c) => format!(".tar{}", c.extension()),
            None => ".tar".into(),
        }
    }

    /// Resolve every base utility. Compressor programs were resolved when the job was built.
    pub fn resolve_utilities(&self) -> Vec<(&'static str, Result<String>)> {
        BASE_UTILITIES
            .iter()
            .map(|name| (*name, self.utilities.resolve(name)))
            .collect()
    }
}
