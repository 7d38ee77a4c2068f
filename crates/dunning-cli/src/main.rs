use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dunning_core::{format_amount, FetchOutcome};
use dunning_storage::ThreadManager;
use dunning_sync::{maybe_build_scheduler, pipeline_from_env, FollowUpConfig, ReminderTemplate};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dunning-cli")]
#[command(about = "Overdue invoice follow-up for Odoo")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch overdue invoices and print them.
    Fetch,
    /// Write today's report under REPORTS_DIR.
    Report {
        /// Also email the report to REPORT_RECIPIENT.
        #[arg(long)]
        email: bool,
    },
    /// Email every client with overdue invoices.
    Remind {
        #[arg(long, default_value = "initial")]
        template: ReminderTemplate,
        /// Build the messages without sending or recording threads.
        #[arg(long)]
        dry_run: bool,
    },
    Threads {
        #[command(subcommand)]
        command: ThreadCommands,
    },
    /// Run the cron-driven report until Ctrl-C.
    Schedule,
}

#[derive(Debug, Subcommand)]
enum ThreadCommands {
    List,
    Clear {
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dunning=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Fetch) {
        Commands::Fetch => {
            let pipeline = pipeline_from_env().await?;
            match pipeline.fetch().await {
                FetchOutcome::Invoices(records) => {
                    let total: f64 = records.iter().map(|r| r.amount_due).sum();
                    for r in &records {
                        println!(
                            "{:<20} {:<30} {:>14} {:>5}d  {}",
                            r.invoice_number,
                            r.client_name,
                            format!("{} {}", r.currency_symbol, format_amount(r.amount_due)),
                            r.days_overdue,
                            r.company_name
                        );
                    }
                    println!(
                        "fetch complete: invoices={} outstanding=${}",
                        records.len(),
                        format_amount(total)
                    );
                }
                FetchOutcome::NoneOverdue => println!("fetch complete: no overdue invoices"),
                FetchOutcome::Failed { reason } => bail!("fetch failed: {reason}"),
            }
        }
        Commands::Report { email } => {
            let pipeline = pipeline_from_env().await?;
            match pipeline.run_daily_report(email).await? {
                Some(artifacts) => println!(
                    "report complete: invoices={} clients={} outstanding=${} csv={} emailed_to={}",
                    artifacts.report.total_invoices,
                    artifacts.report.total_clients,
                    format_amount(artifacts.report.total_amount),
                    artifacts.csv_path.display(),
                    artifacts.emailed_to.as_deref().unwrap_or("-")
                ),
                None => println!("report skipped: no overdue invoices"),
            }
        }
        Commands::Remind { template, dry_run } => {
            let pipeline = pipeline_from_env().await?;
            let run = pipeline.send_client_reminders(template, dry_run).await?;
            for label in run.sent.iter().chain(&run.previewed) {
                println!("{} {label}", if dry_run { "preview" } else { "sent" });
            }
            for client in &run.skipped_without_email {
                println!("skipped {client}: no email on file");
            }
            for label in &run.failed {
                println!("failed {label}");
            }
            if !run.failed.is_empty() {
                bail!("{} reminder(s) failed", run.failed.len());
            }
        }
        Commands::Threads { command } => {
            let config = FollowUpConfig::from_env();
            let mut threads = ThreadManager::open(config.thread_store_path).await;
            match command {
                ThreadCommands::List => {
                    let summaries = threads.list_threads();
                    if summaries.is_empty() {
                        println!("no email threads recorded");
                    }
                    for t in summaries {
                        println!(
                            "{}  messages={} created={} subject={:?}\n  {}",
                            t.thread_id,
                            t.message_count,
                            t.created_date.format("%Y-%m-%d %H:%M"),
                            t.last_subject,
                            t.client_key
                        );
                    }
                }
                ThreadCommands::Clear { yes } => {
                    if !yes {
                        bail!("refusing to clear {} thread(s) without --yes", threads.len());
                    }
                    threads.clear_threads().await;
                    println!("cleared threads in {}", threads.store_path().display());
                }
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline_from_env().await?);
            let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
                bail!("scheduler disabled; set FOLLOWUP_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
