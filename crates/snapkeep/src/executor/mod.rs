use std::path::PathBuf;
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use tracing::{error, info};

use crate::database::AdapterState;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::remote::Method;

/// Lifecycle events of a job run. Notification delivery hangs off an [`EventSink`].
#[derive(Debug, Clone)]
pub enum JobEvent {
    JobStarted {
        trigger: String,
        started_at: String,
        dry_run: bool,
    },
    AttemptStarted {
        id: String,
    },
    StateChanged {
        id: String,
        from: AdapterState,
        to: AdapterState,
    },
    ControlCall {
        id: String,
        method: Method,
        endpoint: String,
        ok: bool,
        status: Option<u16>,
    },
    Log {
        id: String,
        line: String,
    },
    AttemptFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        artifact: Option<PathBuf>,
        elapsed_ms: u128,
    },
    JobDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, ev: JobEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    attempts_ok: usize,
    attempts_failed: usize,
    control_calls: usize,
    failed_attempts: Vec<String>,
    artifacts: Vec<PathBuf>,
}

impl EventSink for StdoutSink {
    fn emit(&self, ev: JobEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        match ev {
            JobEvent::JobStarted {
                trigger,
                started_at,
                dry_run,
            } => {
                s.started_at = Some(Instant::now());
                let mode = if dry_run { " (dry-run)" } else { "" };
                println!("JOB: {trigger} started at {started_at}{mode}");
            }
            JobEvent::AttemptStarted { id } => println!("RUN: {id}"),
            JobEvent::StateChanged { id, from, to } => println!("[{id}] {from} -> {to}"),
            JobEvent::ControlCall {
                id,
                method,
                endpoint,
                ok,
                status,
            } => {
                s.control_calls = s.control_calls.saturating_add(1);
                let status = status.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
                let verdict = if ok { "ok" } else { "FAILED" };
                println!("[{id}] {method} {endpoint} => {status} {verdict}");
            }
            JobEvent::Log { id, line } => println!("[{id}] {line}"),
            JobEvent::AttemptFinished {
                id,
                ok,
                error,
                artifact,
                elapsed_ms,
            } => {
                if ok {
                    s.attempts_ok = s.attempts_ok.saturating_add(1);
                    if let Some(a) = artifact {
                        println!("DONE: {id} ({elapsed_ms}ms) -> {}", a.display());
                        s.artifacts.push(a);
                    } else {
                        println!("DONE: {id} ({elapsed_ms}ms)");
                    }
                } else {
                    s.attempts_failed = s.attempts_failed.saturating_add(1);
                    s.failed_attempts.push(id.clone());
                    println!("FAIL: {id} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                }
            }
            JobEvent::JobDone { ok, error } => {
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                let mut summary = String::from("SUMMARY:\n");
                summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                summary.push_str(&format!(
                    "  attempts: ok={} failed={}\n",
                    s.attempts_ok, s.attempts_failed
                ));
                summary.push_str(&format!("  control_calls: {}\n", s.control_calls));
                summary.push_str(&format!("  elapsed: {}\n", format_elapsed_hms(wall.as_secs())));
                if !s.failed_attempts.is_empty() {
                    summary.push_str(&format!(
                        "  failed_attempts: {}\n",
                        s.failed_attempts.join(", ")
                    ));
                }
                if !s.artifacts.is_empty() {
                    summary.push_str("  artifacts:\n");
                    for a in &s.artifacts {
                        summary.push_str(&format!("    {}\n", a.display()));
                    }
                }
                if let Some(e) = error.filter(|_| !ok) {
                    summary.push_str(&format!("  error: {e}\n"));
                }
                print!("{summary}");
                *s = StdoutSinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<JobEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<JobEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, ev: JobEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Clone)]
pub struct JobCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn EventSink>,
    current_attempt: Option<String>,
}

impl JobCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn EventSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_attempt: None,
        }
    }

    pub fn set_attempt(&mut self, id: impl Into<String>) {
        self.current_attempt = Some(id.into());
    }

    pub fn attempt_id(&self) -> String {
        self.current_attempt
            .clone()
            .unwrap_or_else(|| "<none>".into())
    }

    pub fn emit(&self, ev: JobEvent) {
        self.sink.emit(ev);
    }

    pub fn log(&self, msg: &str) {
        let id = self.attempt_id();
        info!(attempt = %id, "{msg}");
        self.sink.emit(JobEvent::Log {
            id,
            line: msg.to_string(),
        });
    }
}

/// Perform every database of `job` in order. The first failing database ends the run.
pub fn execute_job(job: &Job, ctx: &mut JobCtx) -> Result<Vec<PathBuf>> {
    ctx.emit(JobEvent::JobStarted {
        trigger: job.trigger().to_string(),
        started_at: chrono::Local::now().to_rfc3339(),
        dry_run: ctx.dry_run,
    });

    let paths = if ctx.dry_run {
        crate::workspace::load_paths(job.workspace(), job.trigger())
    } else {
        crate::workspace::prepare(job.workspace(), job.trigger())
    };
    let paths = match paths {
        Ok(p) => p,
        Err(e) => return Err(job_failed(ctx, e)),
    };
    ctx.set_attempt(job.trigger());
    ctx.log(&format!("dump dir = {}", paths.dump_dir.display()));

    let env = job.dump_env(&paths.dump_dir);
    let mut artifacts = Vec::new();
    for adapter in job.adapters() {
        let id = adapter.dump_filename();
        ctx.set_attempt(id.clone());
        ctx.emit(JobEvent::AttemptStarted { id: id.clone() });
        let start = Instant::now();
        let res = adapter.perform(ctx, &env);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(artifact) => {
                ctx.emit(JobEvent::AttemptFinished {
                    id,
                    ok: true,
                    error: None,
                    artifact: Some(artifact.clone()),
                    elapsed_ms,
                });
                artifacts.push(artifact);
            }
            Err(e) => {
                error!(attempt = %id, "backup failed: {e}");
                ctx.emit(JobEvent::AttemptFinished {
                    id,
                    ok: false,
                    error: Some(e.to_string()),
                    artifact: None,
                    elapsed_ms,
                });
                return Err(job_failed(ctx, e));
            }
        }
    }

    ctx.emit(JobEvent::JobDone {
        ok: true,
        error: None,
    });
    Ok(artifacts)
}

fn job_failed(ctx: &JobCtx, e: Error) -> Error {
    ctx.emit(JobEvent::JobDone {
        ok: false,
        error: Some(e.to_string()),
    });
    e
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
