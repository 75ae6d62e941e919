use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use parasim::{
    config::{ConfigErrors, RunnerConfig},
    error::{chain, root_cause},
    job::{JobDetails, JobId, JobParameters, TaskDetails},
    orchestrator::{JobOrchestrator, OrchestrationError},
    sync::ShutdownToken,
};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    io,
    path::{Path, PathBuf},
    process::{self, ExitCode},
    thread,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Run large simulation batches on a compute pool
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Runner configuration
    #[arg(short, long, env = "PARASIM_CONFIG", default_value = "parasim.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage a model archive or directory and submit it as a new job
    Submit {
        /// Return right after submission instead of downloading outputs into ./outputs
        #[arg(long)]
        no_wait: bool,
        name: String,
        model_path: PathBuf,
    },
    /// Stop a job and all of its tasks
    Terminate { job: JobId },
    /// Delete the outputs of a job, then the job
    Delete { job: JobId },
    ListJobs,
    ListTasks { job: JobId },
    /// Download outputs until the job is complete
    DownloadOutputs { job: JobId, output_dir: PathBuf },
    /// Drive a job from inside the pool, started by the job itself
    RunManager {
        job: JobId,
        input: PathBuf,
        #[arg(action = ArgAction::Set)]
        submit_tasks: bool,
        #[arg(action = ArgAction::Set)]
        auto_scale: bool,
    },
    /// Upload the configured tools and application archives
    StageTools,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Invalid configuration")]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

fn main() -> ExitCode {
    // listings go to stdout, everything else to stderr
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();

            // help and version are not failures
            return if error.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let token = ShutdownToken::new();
    if let Err(error) = register_signals(&token) {
        warn!(error = ?error, "Failed to register signal handlers, Ctrl-C will not shut down cleanly");
    }

    match run(cli, &token) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Orchestration(OrchestrationError::Cancelled)) => {
            info!("Cancelled");
            ExitCode::SUCCESS
        }
        Err(error) => {
            debug!("{}", chain(&error));
            error!("{}", root_cause(&error));

            if matches!(
                error,
                CliError::Orchestration(OrchestrationError::InputValidation(_))
            ) {
                eprintln!("{}", Cli::command().render_usage());
            }

            ExitCode::FAILURE
        }
    }
}

/// first signal cancels the token, the second one exits right away
fn register_signals(token: &ShutdownToken) -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let token = token.clone();

    thread::Builder::new()
        .name("parasim-signals".to_owned())
        .spawn(move || {
            for signal in signals.forever() {
                if token.is_cancelled() {
                    warn!(signal = signal, "Forced shutdown");
                    process::exit(1);
                }

                info!(signal = signal, "Shutting down, send again to force");
                token.cancel();
            }
        })?;

    Ok(())
}

fn run(cli: Cli, token: &ShutdownToken) -> Result<(), CliError> {
    let mut config = RunnerConfig::load(&cli.config)?;

    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let job_config = config.job.clone();
    let orchestrator = JobOrchestrator::load(config, cli.config)?;

    match cli.command {
        Command::Submit {
            no_wait,
            name,
            model_path,
        } => {
            let parameters = JobParameters {
                display_name: name,
                model_path,
                application_version: job_config.application_version,
                cores_per_process: job_config.cores_per_process,
                manager_submits_tasks: job_config.manager_submits_tasks,
                auto_scale: job_config.auto_scale,
                no_wait,
            };

            let job = orchestrator.submit_job(&parameters, token)?;
            println!("Submitted Job {job}");

            if !parameters.no_wait {
                let downloaded = orchestrator.download_outputs(&job, Path::new("outputs"), token)?;
                println!("Downloaded {downloaded} outputs of job {job}");
            }
        }
        Command::Terminate { job } => orchestrator.terminate_job(&job)?,
        Command::Delete { job } => orchestrator.delete_job(&job)?,
        Command::ListJobs => {
            for job in orchestrator.list_jobs(token)? {
                println!("{}", job_line(&job));
            }
        }
        Command::ListTasks { job } => {
            for task in orchestrator.list_tasks(&job, token)? {
                println!("{}", task_line(&task));
            }
        }
        Command::DownloadOutputs { job, output_dir } => {
            let downloaded = orchestrator.download_outputs(&job, &output_dir, token)?;
            println!("Downloaded {downloaded} outputs of job {job}");
        }
        Command::RunManager {
            job,
            input,
            submit_tasks,
            auto_scale,
        } => {
            let state = orchestrator.run_manager(&job, &input, submit_tasks, auto_scale, token)?;
            info!(job = %job, state = ?state, "Job manager done");
        }
        Command::StageTools => {
            let uploaded = orchestrator.stage_tools()?;
            println!("Uploaded {uploaded} files");
        }
    }

    Ok(())
}

fn format_duration(duration: Option<chrono::Duration>) -> String {
    match duration {
        Some(duration) => {
            let seconds = duration.num_seconds().max(0);
            format!(
                "{:02}:{:02}:{:02}",
                seconds / 3600,
                seconds / 60 % 60,
                seconds % 60
            )
        }
        None => "-".to_owned(),
    }
}

fn job_line(job: &JobDetails) -> String {
    let pool = match &job.pool {
        Some(pool) => format!(
            "{} x {} ({}, {} tasks per vm)",
            pool.vm_count, pool.vm_size, pool.allocation_state, pool.max_tasks_per_vm
        ),
        None => "-".to_owned(),
    };

    format!(
        "{}\t{}\t{}\t{}\t{}",
        job.id,
        job.display_name,
        job.state,
        format_duration(job.duration()),
        pool
    )
}

fn task_line(task: &TaskDetails) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        task.id,
        task.display_name,
        task.state,
        format_duration(task.duration())
    )
}
