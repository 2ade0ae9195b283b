//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::classifier::{BusinessRule, ClassificationDispatcher, OpenAiClassifier};
use crate::client::ImapConnector;
use crate::config::{Config, MailboxCredentials};
use crate::error::Result;
use crate::models::{PassReport, LABEL_INBOX};
use crate::parser::MimeParser;
use crate::retry::RetryPolicy;
use crate::state::FileWatermarkStore;
use crate::triage::TriageEngine;

#[derive(Parser, Debug)]
#[command(name = "mail-triage")]
#[command(version = "0.1.0")]
#[command(about = "Classify, file and prune a mailbox with an LLM", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll for new mail forever, working the backlog when idle
    Run,

    /// Serve the HTTP control endpoints
    Serve {
        /// Also run the forever scheduler in the background
        #[arg(long)]
        schedule: bool,
    },

    /// Run a single new-mail pass
    New {
        /// Only consider mail since this RFC 3339 timestamp instead of the stored watermark
        #[arg(long)]
        since: Option<String>,
    },

    /// Run a single backlog pass
    Backlog,

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Wire the production engine: IMAP from the environment, OpenAI classifier,
/// MIME parser and the file watermark
pub fn build_engine(config: Arc<Config>) -> Result<TriageEngine> {
    let credentials = MailboxCredentials::from_env()?;
    tracing::debug!("Mailbox credentials: {:?}", credentials);

    let connect_timeout = RetryPolicy::from_config(&config.retry.connection).attempt_timeout;
    let connector = ImapConnector::new(
        credentials,
        connect_timeout,
        config.triage.operation_timeout(),
    )
    .with_tracked_labels(tracked_labels(&config));

    let service = OpenAiClassifier::from_env(&config.classifier, config.folders.categories.clone())?;
    let dispatcher = ClassificationDispatcher::new(
        BusinessRule::from_config(&config.business),
        Arc::new(service),
        RetryPolicy::from_config(&config.retry.classifier),
        config.classifier.max_body_chars,
        config.folders.categories.clone(),
    );

    let watermark = FileWatermarkStore::new(&config.state.watermark_path);

    Ok(TriageEngine::new(
        config,
        Arc::new(connector),
        dispatcher,
        Arc::new(MimeParser),
        Arc::new(watermark),
    ))
}

/// Labels that decide an action when a message is seen through an all-mail view
fn tracked_labels(config: &Config) -> Vec<String> {
    let mut labels = vec![
        config.folders.archive.clone(),
        LABEL_INBOX.to_string(),
        config.folders.rejected.clone(),
    ];
    labels.extend(config.folders.categories.iter().cloned());
    labels
}

/// Print a pass summary
pub fn print_report(report: &PassReport) {
    println!("\n========================================");
    println!("{} Pass Summary", capitalize(&report.mode.to_string()));
    println!("========================================");
    println!("Run ID: {}", report.run_id);
    if let Some(folder) = &report.folder {
        println!("Folder: {}", folder);
    }
    if let Some(finished) = report.finished_at {
        println!(
            "Duration: {} seconds",
            (finished - report.started_at).num_seconds()
        );
    }
    println!("Processed: {}", report.processed);
    println!("  Kept: {}", report.kept);
    println!("  Archived: {}", report.archived);
    println!("  Categorized: {}", report.categorized);
    println!("  Deleted: {}", report.deleted);
    println!("  Failed: {}", report.failed);
    println!("Skipped: {}", report.skipped);
    println!("Undetermined: {}", report.undetermined);
    if report.rate_limited > 0 {
        println!("Rate limited: {}", report.rate_limited);
    }
    if report.deadline_hit {
        println!("Pass deadline reached; remaining messages left for the next pass");
    }
    println!("========================================");
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_new_with_since() {
        let cli = Cli::try_parse_from([
            "mail-triage",
            "-v",
            "new",
            "--since",
            "2024-03-04T10:30:00Z",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("config.toml"));
        match cli.command {
            Commands::New { since } => assert_eq!(since.as_deref(), Some("2024-03-04T10:30:00Z")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_serve_and_init_config() {
        let cli = Cli::try_parse_from(["mail-triage", "--config", "x.toml", "serve", "--schedule"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("x.toml"));
        assert!(matches!(cli.command, Commands::Serve { schedule: true }));

        let cli = Cli::try_parse_from(["mail-triage", "init-config", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::InitConfig { force: true, .. }));
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("backlog"), "Backlog");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn test_tracked_labels_cover_filing_targets() {
        let config = Config::default();
        let labels = tracked_labels(&config);
        assert_eq!(labels[0], "Records");
        assert!(labels.iter().any(|l| l == "\\Inbox"));
        assert!(labels.iter().any(|l| l == "AI Rejects"));
        assert!(labels.iter().any(|l| l == "Newsletters"));
    }

    #[test]
    #[serial]
    fn test_build_engine_requires_credentials() {
        std::env::remove_var("IMAP_USER");
        std::env::remove_var("IMAP_PASSWORD");
        let result = build_engine(Arc::new(Config::default()));
        assert!(result.is_err());
    }
}
