use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use digestor_compose::tuning::TunerStatus;
use digestor_compose::{
    build_composer, ComposeConfig, ComposeService, RunContext, RunScope, RunSummary,
};
use digestor_storage::PgRepository;

#[derive(Debug, Parser)]
#[command(name = "digestor")]
#[command(about = "Digest composition engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C.
    Run,
    /// One locked run: due digest windows, then due tuners.
    Once,
    /// Run the adaptive tuners.
    Tune {
        /// Ignore the weekly due check.
        #[arg(long)]
        force: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Print the windows the next run would process.
    Windows,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = ComposeConfig::from_env();

    match cli.command.unwrap_or(Commands::Once) {
        Commands::Run => {
            let composer = build_composer(config).await?;
            ComposeService::new(composer).run_until_shutdown().await?;
        }
        Commands::Once => {
            let ctx = RunContext::detached(config.operation_timeout());
            let composer = build_composer(config).await?;
            let summary = composer.run(&ctx, Utc::now(), RunScope::Full).await?;
            print_summary(&summary);
        }
        Commands::Tune { force } => {
            let ctx = RunContext::detached(config.operation_timeout());
            let composer = build_composer(config).await?;
            let summary = composer
                .run(&ctx, Utc::now(), RunScope::TunersOnly { force })
                .await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            let repo = PgRepository::connect(&config.database_url).await?;
            repo.migrate().await?;
            println!("migrations applied");
        }
        Commands::Windows => {
            let ctx = RunContext::detached(config.operation_timeout());
            let composer = build_composer(config).await?;
            let windows = composer.plan_windows(&ctx, Utc::now()).await?;
            if windows.is_empty() {
                println!("no windows due");
            }
            for window in windows {
                println!("{window}");
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    if !summary.lock_acquired {
        println!("lease held by another replica; nothing done");
        return;
    }
    println!(
        "run complete: windows={} posted={} skipped={} empty={} send_failures={} anomalies={}",
        summary.windows,
        summary.posted,
        summary.skipped_existing,
        summary.empty,
        summary.send_failures,
        summary.anomalies.len()
    );
    if let Some(reason) = &summary.aborted {
        println!("aborted: {reason}");
    }
    for report in &summary.tuners {
        let status = match &report.status {
            TunerStatus::Disabled => "disabled".to_string(),
            TunerStatus::NotDue => "not due".to_string(),
            TunerStatus::Ran(outcome) => outcome.clone(),
            TunerStatus::Failed(err) => format!("failed: {err}"),
        };
        println!("tuner {}: {status}", report.name);
    }
}

fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("DIGESTOR_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize tracing subscriber: {err}"))
}
