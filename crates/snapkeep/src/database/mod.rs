//! Store adapters and the per-attempt protocol state they share.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::compressor::Compressor;
use crate::error::{Error, Result};
use crate::executor::{JobCtx, JobEvent};
use crate::remote::{ControlApi, Method};
use crate::utilities::Utilities;

pub mod elasticsearch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Idle,
    PreCopy,
    Copying,
    PostCopy,
    Done,
    Failed,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdapterState::Idle => "idle",
            AdapterState::PreCopy => "pre-copy",
            AdapterState::Copying => "copying",
            AdapterState::PostCopy => "post-copy",
            AdapterState::Done => "done",
            AdapterState::Failed => "failed",
        })
    }
}

/// What an adapter needs from the surrounding job to produce its artifact.
pub struct DumpEnv<'a> {
    pub dump_dir: &'a Path,
    pub utilities: &'a Utilities,
    pub compressor: Option<&'a dyn Compressor>,
}

/// A store type that can be backed up. `perform` runs one complete attempt.
pub trait Adapter {
    /// Adapter name used for the artifact, e.g. `Elasticsearch`.
    fn name(&self) -> &'static str;

    fn database_id(&self) -> Option<&str>;

    /// `<Name>[-<id>]`, the artifact name before extensions.
    fn dump_filename(&self) -> String {
        match self.database_id() {
            Some(id) => format!("{}-{}", self.name(), id),
            None => self.name().to_string(),
        }
    }

    /// Human readable outline of what `perform` would do.
    fn describe(&self) -> Vec<String>;

    fn perform(&self, ctx: &JobCtx, env: &DumpEnv<'_>) -> Result<PathBuf>;
}

/// A remote call that reverts state changed by a successful pre-copy call.
#[derive(Debug, Clone)]
pub struct CleanupCall {
    pub what: String,
    pub method: Method,
    pub path: String,
    pub body: Option<String>,
}

/// Per-attempt protocol state. Created by `perform`, dropped when it returns.
pub struct AdapterRunState<'a> {
    api: &'a dyn ControlApi,
    state: AdapterState,
    owed: Vec<CleanupCall>,
}

impl<'a> AdapterRunState<'a> {
    pub fn new(api: &'a dyn ControlApi) -> Self {
        Self {
            api,
            state: AdapterState::Idle,
            owed: Vec::new(),
        }
    }

    pub fn enter(&mut self, ctx: &JobCtx, to: AdapterState) {
        let from = self.state;
        if from == to {
            return;
        }
        debug!(attempt = %ctx.attempt_id(), %from, %to, "state change");
        self.state = to;
        ctx.emit(JobEvent::StateChanged {
            id: ctx.attempt_id(),
            from,
            to,
        });
    }

    /// Issue one control call; a failure comes back as `Error::RemoteCall`.
    pub fn control(
        &self,
        ctx: &JobCtx,
        what: &str,
        method: Method,
        path: &str,
        body: Option<&str>,
    ) -> Result<()> {
        control_call(self.api, ctx, what, method, path, body)
    }

    /// Record the call that reverts a state change which just succeeded.
    pub fn owe(&mut self, call: CleanupCall) {
        self.owed.push(call);
    }

    /// Run owed cleanup (reverse order of setup) and settle the attempt.
    ///
    /// The attempt's first failure wins: a failed `outcome` stays the primary error and cleanup
    /// failures are attached to it; if `outcome` succeeded, the first cleanup failure becomes the
    /// primary error.
    pub fn conclude<T>(mut self, ctx: &JobCtx, outcome: Result<T>) -> Result<T> {
        let mut cleanup_errs = Vec::new();
        if self.state == AdapterState::Copying || !self.owed.is_empty() {
            self.enter(ctx, AdapterState::PostCopy);
            while let Some(call) = self.owed.pop() {
                if let Err(e) = control_call(
                    self.api,
                    ctx,
                    &call.what,
                    call.method,
                    &call.path,
                    call.body.as_deref(),
                ) {
                    warn!(attempt = %ctx.attempt_id(), "cleanup call failed: {}", call.what);
                    cleanup_errs.push(e);
                }
            }
        }

        let res = first_failure(outcome, cleanup_errs);
        self.enter(
            ctx,
            if res.is_ok() {
                AdapterState::Done
            } else {
                AdapterState::Failed
            },
        );
        res
    }
}

fn first_failure<T>(outcome: Result<T>, mut cleanup: Vec<Error>) -> Result<T> {
    let primary = match outcome {
        Ok(v) if cleanup.is_empty() => return Ok(v),
        Ok(_) => cleanup.remove(0),
        Err(e) => e,
    };
    if cleanup.is_empty() {
        Err(primary)
    } else {
        Err(Error::Cleanup {
            primary: Box::new(primary),
            cleanup,
        })
    }
}

fn control_call(
    api: &dyn ControlApi,
    ctx: &JobCtx,
    what: &str,
    method: Method,
    path: &str,
    body: Option<&str>,
) -> Result<()> {
    if ctx.dry_run {
        ctx.log(&format!("DRY-RUN: {method} {path} ({what})"));
        return Ok(());
    }
    info!(attempt = %ctx.attempt_id(), %method, path = %path, "{what}");
    let res = api.call(method, path, body);
    ctx.emit(JobEvent::ControlCall {
        id: ctx.attempt_id(),
        method,
        endpoint: path.to_string(),
        ok: res.is_success(),
        status: res.status(),
    });
    res.into_result(what, api.target(), path)
}
