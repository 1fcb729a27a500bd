//! Streaming chains of external processes.
//!
//! A [`Pipeline`] wires the standard output of each stage directly into the standard input of the
//! next through OS pipes. Nothing on the data path passes through this process: only each stage's
//! stderr is read back, into a bounded tail buffer, so memory use does not depend on how much data
//! flows through the chain.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_line;

/// Exit code recorded for a stage whose process could not be started.
pub const SPAWN_FAILED_EXIT_CODE: i32 = 127;

const MAX_STDERR_LINES: usize = 200;
const MAX_PENDING_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStage {
    program: String,
    args: Vec<String>,
    stdout_path: Option<PathBuf>,
}

impl PipelineStage {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout_path: None,
        }
    }

    /// Split a plain command line on whitespace. No shell quoting is interpreted.
    pub fn parse(cmdline: &str) -> Result<Self> {
        let mut parts = cmdline.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(Error::config("empty pipeline command"));
        };
        Ok(Self::new(program).args(parts))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Redirect this stage's standard output into `path` (created or truncated when the pipeline runs).
    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_path = Some(path.into());
        self
    }

}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        if let Some(p) = &self.stdout_path {
            write!(f, " > '{}'", p.display())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub command: String,
    pub exit_code: i32,
    pub stderr: Vec<String>,
}

impl StageOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
    outcomes: Option<Vec<StageOutcome>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stage: PipelineStage) -> Result<()> {
        if self.outcomes.is_some() {
            return Err(Error::config(format!(
                "cannot add stage '{stage}': pipeline has already run"
            )));
        }
        self.stages.push(stage);
        Ok(())
    }

    /// Start every stage, then wait for all of them. Blocks until the last process has exited.
    pub fn run(&mut self) -> Result<()> {
        if self.outcomes.is_some() {
            return Err(Error::config("pipeline has already run"));
        }
        if self.stages.is_empty() {
            return Err(Error::config("pipeline has no stages"));
        }

        let last = self.stages.len() - 1;
        if let Some((n, stage)) = self.stages[..last]
            .iter()
            .enumerate()
            .find(|(_, s)| s.stdout_path.is_some())
        {
            return Err(Error::config(format!(
                "stage {}: '{stage}' redirects stdout but is not the last stage",
                n + 1
            )));
        }
        let mut running: Vec<std::result::Result<StageGuard, String>> =
            Vec::with_capacity(self.stages.len());
        let mut upstream: Option<ChildStdout> = None;

        for (idx, stage) in self.stages.iter().enumerate() {
            let stdin = match upstream.take() {
                Some(out) => Stdio::from(out),
                None => Stdio::null(),
            };
            match spawn_stage(stage, stdin, idx == last) {
                Ok(mut child) => {
                    debug!(stage = idx + 1, pid = child.id(), command = %stage, "stage started");
                    if idx != last {
                        upstream = child.stdout.take();
                    }
                    let stderr = child
                        .stderr
                        .take()
                        .map(|err| thread::spawn(move || collect_stderr(idx + 1, err)));
                    running.push(Ok(StageGuard {
                        child: Some(child),
                        stderr,
                    }));
                }
                Err(e) => {
                    warn!(stage = idx + 1, command = %stage, "stage failed to start: {e}");
                    running.push(Err(format!("failed to start '{}': {e}", stage.program)));
                }
            }
        }

        let mut outcomes = Vec::with_capacity(self.stages.len());
        for (idx, (stage, slot)) in self.stages.iter().zip(running).enumerate() {
            let outcome = match slot {
                Ok(guard) => {
                    let (exit_code, stderr) = guard.wait();
                    StageOutcome {
                        command: stage.to_string(),
                        exit_code,
                        stderr,
                    }
                }
                Err(msg) => StageOutcome {
                    command: stage.to_string(),
                    exit_code: SPAWN_FAILED_EXIT_CODE,
                    stderr: vec![msg],
                },
            };
            debug!(stage = idx + 1, exit_code = outcome.exit_code, "stage exited");
            outcomes.push(outcome);
        }
        self.outcomes = Some(outcomes);
        Ok(())
    }

    pub fn outcomes(&self) -> &[StageOutcome] {
        self.outcomes.as_deref().unwrap_or(&[])
    }

    /// True iff the pipeline ran and every stage exited 0.
    pub fn success(&self) -> bool {
        self.outcomes
            .as_ref()
            .is_some_and(|o| o.iter().all(StageOutcome::success))
    }

    /// 1-based positions of the stages that exited non-zero.
    pub fn failed_stages(&self) -> Vec<usize> {
        self.outcomes()
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.success())
            .map(|(i, _)| i + 1)
            .collect()
    }

    /// Diagnostics for every failing stage. Empty iff [`Pipeline::success`].
    pub fn error_messages(&self) -> String {
        if self.outcomes.is_none() {
            return "pipeline has not run".into();
        }
        let failed = self.failed_stages();
        if failed.is_empty() {
            return String::new();
        }
        let mut out = String::from("Pipeline STDERR Messages:\n");
        for n in failed {
            let o = &self.outcomes()[n - 1];
            out.push_str(&format!(
                "  stage {n}: '{}' exited with {}\n",
                o.command, o.exit_code
            ));
            for line in &o.stderr {
                out.push_str("    ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, s) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{s}")?;
        }
        Ok(())
    }
}

// Owns one running stage; the child is always reaped, including when the pipeline unwinds.
struct StageGuard {
    child: Option<Child>,
    stderr: Option<JoinHandle<Vec<String>>>,
}

impl StageGuard {
    fn wait(mut self) -> (i32, Vec<String>) {
        let status = self.child.take().map(|mut c| c.wait());
        let mut stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let code = match status {
            Some(Ok(status)) => exit_code(status),
            Some(Err(e)) => {
                stderr.push(format!("wait failed: {e}"));
                -1
            }
            None => -1,
        };
        (code, stderr)
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }
    }
}

fn spawn_stage(stage: &PipelineStage, stdin: Stdio, last: bool) -> std::io::Result<Child> {
    let stdout = match (&stage.stdout_path, last) {
        (Some(path), _) => Stdio::from(File::create(path)?),
        (None, true) => Stdio::null(),
        (None, false) => Stdio::piped(),
    };

    let mut cmd = Command::new(&stage.program);
    cmd.args(&stage.args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped());

    // Stages run in their own process group, out of reach of terminal signals sent to ours.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    cmd.spawn()
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

fn collect_stderr(stage: usize, err: ChildStderr) -> Vec<String> {
    let mut tail: VecDeque<String> = VecDeque::new();
    let mut push = |raw: &[u8]| {
        let line = sanitize_line(&String::from_utf8_lossy(raw));
        if line.is_empty() {
            return;
        }
        debug!(stage = stage, "stderr: {line}");
        if tail.len() >= MAX_STDERR_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    };

    let mut r = BufReader::new(err);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(256);
    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if !pending.is_empty() {
                    push(&pending);
                    pending.clear();
                }
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    push(&pending);
                    pending.clear();
                }
            }
        }
    }
    if !pending.is_empty() {
        push(&pending);
    }
    tail.into()
}
