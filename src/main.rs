use anyhow::Result;
use clap::Parser;
use mail_triage::cli::{self, Cli, Commands};
use mail_triage::config::Config;
use mail_triage::error::TriageError;
use mail_triage::models::TriageMode;
use mail_triage::scheduler::{Scheduler, SingleFlight};
use mail_triage::server;
use mail_triage::state::parse_timestamp;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Exit with proper code on error
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        eprintln!("\nFor help, run: mail-triage --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Install default crypto provider for rustls
    // On non-Windows platforms, use aws-lc-rs; on Windows, use ring
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    // Credentials may live in a .env file next to the config
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mail_triage=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mail_triage=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    if let Commands::InitConfig { output, force } = &cli.command {
        tracing::info!("Generating example configuration file");

        if output.exists() && !force {
            return Err(TriageError::Config(format!(
                "Configuration file already exists at {:?}. Use --force to overwrite.",
                output
            ))
            .into());
        }

        Config::create_example(output).await?;

        println!("Created example configuration file at: {:?}", output);
        println!("\nPlease edit this file to customize your settings.");
        println!("Key settings to review:");
        println!("  - folders.archive / folders.rejected: where triaged mail goes");
        println!("  - folders.categories: category folders offered to the classifier");
        println!("  - triage.delete_after_days: age at which rejected backlog mail is deleted");
        println!("  - classifier.model: chat model used for the worth-reading verdict");
        println!("\nCredentials are read from IMAP_USER, IMAP_PASSWORD and OPENAI_API_KEY.");
        return Ok(());
    }

    let config = Arc::new(Config::load(&cli.config).await?);
    tracing::info!("Mail triage starting...");

    let engine = Arc::new(cli::build_engine(config.clone())?);

    match cli.command {
        Commands::Run => {
            let mut scheduler = Scheduler::new(SingleFlight::new(engine), config.scheduler.clone());
            scheduler.run_forever().await;
            Ok(())
        }

        Commands::Serve { schedule } => {
            let flight = SingleFlight::new(engine);
            if schedule {
                let mut scheduler = Scheduler::new(flight.clone(), config.scheduler.clone());
                tokio::spawn(async move { scheduler.run_forever().await });
            }
            server::serve(flight, &config.server).await?;
            Ok(())
        }

        Commands::New { since } => {
            let watermark_override = since.as_deref().map(parse_timestamp).transpose()?;
            let report = SingleFlight::new(engine)
                .run_queued(TriageMode::New, watermark_override)
                .await?;
            cli::print_report(&report);
            Ok(())
        }

        Commands::Backlog => {
            let report = SingleFlight::new(engine)
                .run_queued(TriageMode::Backlog, None)
                .await?;
            cli::print_report(&report);
            Ok(())
        }

        Commands::InitConfig { .. } => Ok(()),
    }
}
