// src/main.rs
//
// =============================================================================
// RUNSCRIBE: COMMAND LINE (v 0.3)
// =============================================================================
//
// Modes:
// 1. EXEC:   Runs a command as a tracked run. Its stdout/stderr are teed into
//            the run log, its exit code is logged as a metric.
// 2. TAGS:   Prints the default tags this machine would attach to a run.
// 3. CONFIG: Prints the resolved settings (config file + environment).

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use runscribe::capture::{OutputRouter, Stream};
use runscribe::config::Settings;
use runscribe::run::{ActiveRun, RunOptions};
use runscribe::tracking::RunStatus;
use runscribe::{logs, tags, tee_println};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "runscribe",
    version,
    about = "Experiment run tracking with console capture"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command inside a tracked run.
    Exec {
        /// Experiment to record the run under (created if missing).
        #[arg(long)]
        experiment: String,

        /// Human-readable run name.
        #[arg(long)]
        run_name: Option<String>,

        /// Run parameter, repeatable. Use: --param lr=0.1 --param epochs=3
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Extra run tag, repeatable.
        #[arg(long = "tag", value_parser = parse_key_val)]
        tags: Vec<(String, String)>,

        /// Directory uploaded as artifacts when the run ends, repeatable.
        #[arg(long = "artifacts")]
        artifact_dirs: Vec<PathBuf>,

        /// Skip git/host tags.
        #[arg(long)]
        no_default_tags: bool,

        /// The command and its arguments.
        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Print the default tags for this machine and working directory.
    Tags,

    /// Print the resolved settings as YAML.
    Config,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", raw))
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();
    logs::init_logging();

    match cli.command {
        Commands::Exec {
            experiment,
            run_name,
            params,
            tags,
            artifact_dirs,
            no_default_tags,
            command,
        } => {
            let options = RunOptions {
                run_name,
                extra_artifact_dirs: artifact_dirs,
                tags: tags.into_iter().collect(),
                default_tags: !no_default_tags,
                ..RunOptions::default()
            };
            let code = run_exec(&experiment, options, params, &command)?;
            std::process::exit(code);
        }
        Commands::Tags => {
            for (k, v) in tags::default_tags() {
                println!("{:<24} {}", k, v);
            }
            Ok(())
        }
        Commands::Config => {
            let settings = Settings::load()?;
            print!("{}", serde_yaml::to_string(&settings)?);
            Ok(())
        }
    }
}

// ============================================================================
// 3. EXEC: CHILD PROCESS UNDER A RUN
// ============================================================================

fn run_exec(
    experiment: &str,
    options: RunOptions,
    params: Vec<(String, String)>,
    command: &[String],
) -> Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("No command given"))?;

    let mut run = ActiveRun::start(experiment, options)?;
    run.log_params(params);
    run.set_tag("command", command.join(" "));
    tee_println!("Run {} executing: {}", run.run_id(), command.join(" "));

    let status = match spawn_teed(program, args) {
        Ok(status) => status,
        Err(e) => {
            log::error!("{:#}", e);
            run.finish(RunStatus::Failed);
            return Err(e);
        }
    };

    let code = status.code().unwrap_or(-1);
    run.log_metric("exit_code", code as f64);
    let outcome = run.finish(if status.success() {
        RunStatus::Finished
    } else {
        RunStatus::Failed
    });

    match (&outcome.run_id, &outcome.local_run_dir) {
        (Some(id), Some(dir)) => log::info!("Run {} recorded in {}", id, dir.display()),
        (Some(id), None) => log::info!("Run {} recorded on {}", id, outcome.tracking_uri),
        _ => log::error!("Run could not be recorded"),
    }
    Ok(code)
}

/// Spawns `program`, copying its stdout/stderr through the capture router
/// until it exits.
fn spawn_teed(program: &str, args: &[String]) -> Result<ExitStatus> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn {:?}", program))?;

    let pumps: Vec<_> = [
        child.stdout.take().map(|r| pump(r, Stream::Stdout)),
        child.stderr.take().map(|r| pump(r, Stream::Stderr)),
    ]
    .into_iter()
    .flatten()
    .collect();

    let status = child.wait().context("Failed to wait for child")?;
    for handle in pumps {
        if handle.join().is_err() {
            log::warn!("Output pump thread panicked");
        }
    }
    Ok(status)
}

fn pump(mut reader: impl Read + Send + 'static, stream: Stream) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let router = OutputRouter::global();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if router.write(stream, &buf[..n]).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = router.flush(stream);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_arguments() {
        assert_eq!(
            parse_key_val("lr=0.1").unwrap(),
            ("lr".to_string(), "0.1".to_string())
        );
        assert_eq!(
            parse_key_val("expr=a=b").unwrap(),
            ("expr".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }
}
