use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use snapkeep::Result;
use snapkeep::executor::{JobCtx, StdoutSink, execute_job};
use snapkeep::job::Job;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Log format for diagnostics on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Back up every database in the job
    Perform {
        /// Path to a job definition TOML
        job: PathBuf,
        /// Log the control calls and pipelines instead of running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate the job and print what each database backup would do
    Check {
        /// Path to a job definition TOML
        job: PathBuf,
    },
    /// Print the fully-resolved job TOML (after imports/extends)
    Resolve {
        /// Path to a job definition TOML
        job: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_format);

    let res = match args.cmd {
        Command::Perform { job, dry_run } => cmd_perform(&job, dry_run),
        Command::Check { job } => cmd_check(&job),
        Command::Resolve { job } => cmd_resolve(&job),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_job(path: &Path) -> Result<Job> {
    let doc = snapkeep::config::load(path)?;
    Job::from_config(&doc.job()?)
}

fn cmd_perform(path: &Path, dry_run: bool) -> Result<()> {
    let job = load_job(path)?;
    let sink = Arc::new(StdoutSink::default());
    let mut ctx = JobCtx::new(dry_run, sink);
    execute_job(&job, &mut ctx)?;
    Ok(())
}

fn cmd_check(path: &Path) -> Result<()> {
    let job = load_job(path)?;
    println!("trigger: {}", job.trigger());
    for (name, res) in job.resolve_utilities() {
        println!("utility {name:<6} {}", res?);
    }
    for (i, adapter) in job.adapters().enumerate() {
        let lines = adapter.describe();
        for (j, line) in lines.iter().enumerate() {
            if j == 0 {
                println!(
                    "{:>2}. {line} -> {}{}",
                    i + 1,
                    adapter.dump_filename(),
                    job.artifact_extension()
                );
            } else {
                println!("      {line}");
            }
        }
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = snapkeep::config::load(path)?;
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}
