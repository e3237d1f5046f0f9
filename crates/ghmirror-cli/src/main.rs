use anyhow::Result;
use clap::{Parser, Subcommand};
use ghmirror_core::{JobType, ScheduleConfig};
use ghmirror_sync::{JobParams, MirrorRuntime, RealignOptions};
use serde_json::to_string_pretty;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ghmirror")]
#[command(about = "GitHub organization mirror: sync, backup, restore and identity realignment")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted.
    Serve,
    /// Run one job now and wait for it.
    Run {
        job: JobType,
        /// Backup generation to restore from (restore only; newest by default).
        #[arg(long)]
        generation: Option<String>,
    },
    /// Replace the recurring schedule of a job type.
    Schedule {
        job: JobType,
        #[arg(long)]
        hour: u8,
        #[arg(long)]
        minute: u8,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        #[arg(long)]
        disable: bool,
    },
    /// Show schedules, next runs, lock holder and last runs.
    Status,
    /// Re-resolve mirrored issues and pull requests whose repository moved.
    Realign {
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// Derive issue workflow statuses from linked pull request activity.
    DeriveStatus {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let runtime = MirrorRuntime::from_env().await?;
    let orchestrator = runtime.orchestrator.clone();

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Serve => {
            info!("serving; press ctrl-c to stop");
            runtime
                .serve(async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(error = %err, "could not listen for ctrl-c; stopping");
                    }
                })
                .await?;
            info!("scheduler stopped");
        }
        Commands::Run { job, generation } => {
            let params = match job {
                JobType::Restore => JobParams::Restore { generation },
                _ => JobParams::None,
            };
            let summary = orchestrator.trigger(job, params).await?;
            println!(
                "{job} {}: run_id={} elapsed_ms={} {}",
                summary.status, summary.run_id, summary.elapsed_ms, summary.summary
            );
        }
        Commands::Schedule {
            job,
            hour,
            minute,
            timezone,
            disable,
        } => {
            let info = orchestrator
                .update_schedule(
                    job,
                    ScheduleConfig {
                        enabled: !disable,
                        hour,
                        minute,
                        timezone,
                    },
                )
                .await?;
            match info.next_run {
                Some(next) => println!("{job} next run at {next}"),
                None => println!("{job} schedule disabled"),
            }
        }
        Commands::Status => {
            let overview = orchestrator.runtime_overview().await?;
            println!("{}", to_string_pretty(&overview)?);
        }
        Commands::Realign {
            dry_run,
            batch_size,
            limit,
        } => {
            let report = orchestrator
                .realign(RealignOptions {
                    dry_run,
                    batch_size,
                    limit,
                })
                .await?;
            println!("{}", to_string_pretty(&report)?);
        }
        Commands::DeriveStatus { force } => {
            let outcome = orchestrator.derive_statuses(force).await?;
            println!("{}", to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_parse_into_job_types() {
        let cli = Cli::try_parse_from(["ghmirror", "run", "restore", "--generation", "20240305_020000"]).unwrap();
        match cli.command {
            Some(Commands::Run { job, generation }) => {
                assert_eq!(job, JobType::Restore);
                assert_eq!(generation.as_deref(), Some("20240305_020000"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cli::try_parse_from(["ghmirror", "run", "reindex"]).is_err());
    }

    #[test]
    fn schedule_defaults_to_utc_and_enabled() {
        let cli = Cli::try_parse_from(["ghmirror", "schedule", "backup", "--hour", "3", "--minute", "30"]).unwrap();
        match cli.command {
            Some(Commands::Schedule {
                job,
                timezone,
                disable,
                ..
            }) => {
                assert_eq!(job, JobType::Backup);
                assert_eq!(timezone, "UTC");
                assert!(!disable);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn realign_flags_have_defaults() {
        let cli = Cli::try_parse_from(["ghmirror", "realign", "--dry-run"]).unwrap();
        match cli.command {
            Some(Commands::Realign {
                dry_run,
                batch_size,
                limit,
            }) => assert_eq!((dry_run, batch_size, limit), (true, 50, 500)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
