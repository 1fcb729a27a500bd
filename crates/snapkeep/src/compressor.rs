use serde::Deserialize;

use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineStage};
use crate::utilities::Utilities;

/// A compression step a database dump can be streamed through.
///
/// `compress_with` appends the compressor's stage to the pipeline; `extension` is what that stage
/// adds to the artifact name (e.g. `.gz`).
pub trait Compressor: Send + Sync {
    fn compress_with(&self, pipeline: &mut Pipeline) -> Result<()>;
    fn extension(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompressorKind {
    Gzip,
    Bzip2,
    Custom,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressorConfig {
    pub kind: CompressorKind,
    pub level: Option<u32>,
    #[serde(default)]
    pub rsyncable: bool,
    pub command: Option<String>,
    pub extension: Option<String>,
}

impl CompressorConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(level) = self.level
            && !(1..=9).contains(&level)
        {
            return Err(Error::config(format!(
                "compressor.level must be between 1 and 9 (got {level})"
            )));
        }
        if self.rsyncable && self.kind != CompressorKind::Gzip {
            return Err(Error::config("compressor.rsyncable only applies to gzip"));
        }
        if self.kind == CompressorKind::Custom {
            let cmd = self.command.as_deref().map(str::trim).unwrap_or("");
            if cmd.is_empty() {
                return Err(Error::config("custom compressor requires compressor.command"));
            }
            let ext = self.extension.as_deref().unwrap_or("");
            if !ext.starts_with('.') || ext.len() < 2 {
                return Err(Error::config(
                    "custom compressor requires compressor.extension starting with '.'",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Gzip {
    program: String,
    level: Option<u32>,
    rsyncable: bool,
}

impl Compressor for Gzip {
    fn compress_with(&self, pipeline: &mut Pipeline) -> Result<()> {
        let mut stage = PipelineStage::new(&self.program);
        if let Some(l) = self.level {
            stage = stage.arg(format!("-{l}"));
        }
        if self.rsyncable {
            stage = stage.arg("--rsyncable");
        }
        pipeline.add(stage)
    }

    fn extension(&self) -> &str {
        ".gz"
    }
}

#[derive(Debug, Clone)]
pub struct Bzip2 {
    program: String,
    level: Option<u32>,
}

impl Compressor for Bzip2 {
    fn compress_with(&self, pipeline: &mut Pipeline) -> Result<()> {
        let mut stage = PipelineStage::new(&self.program);
        if let Some(l) = self.level {
            stage = stage.arg(format!("-{l}"));
        }
        pipeline.add(stage)
    }

    fn extension(&self) -> &str {
        ".bz2"
    }
}

#[derive(Debug, Clone)]
pub struct Custom {
    stage: PipelineStage,
    extension: String,
}

impl Custom {
    pub fn new(command: &str, extension: impl Into<String>) -> Result<Self> {
        Ok(Self {
            stage: PipelineStage::parse(command)?,
            extension: extension.into(),
        })
    }
}

impl Compressor for Custom {
    fn compress_with(&self, pipeline: &mut Pipeline) -> Result<()> {
        pipeline.add(self.stage.clone())
    }

    fn extension(&self) -> &str {
        &self.extension
    }
}

pub fn from_config(cfg: &CompressorConfig, utilities: &Utilities) -> Result<Box<dyn Compressor>> {
    cfg.validate()?;
    Ok(match cfg.kind {
        CompressorKind::Gzip => Box::new(Gzip {
            program: utilities.resolve("gzip")?,
            level: cfg.level,
            rsyncable: cfg.rsyncable,
        }),
        CompressorKind::Bzip2 => Box::new(Bzip2 {
            program: utilities.resolve("bzip2")?,
            level: cfg.level,
        }),
        CompressorKind::Custom => Box::new(Custom::new(
            cfg.command.as_deref().unwrap_or_default(),
            cfg.extension.clone().unwrap_or_default(),
        )?),
    })
}
