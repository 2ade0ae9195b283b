//! One triage pass as an explicit state machine
//!
//! ```text
//! Connecting -> Ready -> Iterating -> Finalizing -> Disconnected
//!                 |                      ^
//!                 +------ no work -------+
//! ```
//!
//! Failed connection attempts are retried inside `Connecting` under the
//! connection retry policy; exhausting it fails the pass. Once a session
//! exists every path goes through `Finalizing`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::classifier::ClassificationDispatcher;
use crate::client::{MailboxClient, MailboxConnector};
use crate::config::Config;
use crate::error::{Result, TriageError};
use crate::executor::{self, ActionContext};
use crate::models::{ActionOutcome, FailureReason, PassReport, TriageMode, Verdict};
use crate::parser::{build_snapshot, MessageParser};
use crate::planner::{self, FolderSearchPlan, Resolution};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::scheduler::PassRunner;
use crate::state::WatermarkStore;

/// Where a pass currently is; each variant owns what its transition needs
enum PassState {
    Connecting,
    Ready(Box<dyn MailboxClient>),
    Iterating {
        client: Box<dyn MailboxClient>,
        folder: String,
        uids: Vec<u32>,
    },
    Finalizing(Box<dyn MailboxClient>),
    Disconnected,
}

/// Runs triage passes against one mailbox
pub struct TriageEngine {
    config: Arc<Config>,
    connector: Arc<dyn MailboxConnector>,
    dispatcher: ClassificationDispatcher,
    parser: Arc<dyn MessageParser>,
    watermark: Arc<dyn WatermarkStore>,
    connect_policy: RetryPolicy,
}

impl TriageEngine {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn MailboxConnector>,
        dispatcher: ClassificationDispatcher,
        parser: Arc<dyn MessageParser>,
        watermark: Arc<dyn WatermarkStore>,
    ) -> Self {
        let connect_policy = RetryPolicy::from_config(&config.retry.connection);
        Self {
            config,
            connector,
            dispatcher,
            parser,
            watermark,
            connect_policy,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one pass to completion
    ///
    /// Only a connection that cannot be established is an error; everything
    /// after that is reflected in the returned report.
    pub async fn run(
        &self,
        mode: TriageMode,
        watermark_override: Option<DateTime<Utc>>,
    ) -> Result<PassReport> {
        let mut report = PassReport::new(mode);
        let span = info_span!("pass", mode = %mode, run_id = %report.run_id);

        async move {
            info!("Starting {} pass", mode);
            let deadline = Instant::now() + self.config.triage.pass_deadline();
            let mut state = PassState::Connecting;

            loop {
                state = match state {
                    PassState::Connecting => PassState::Ready(self.connecting().await?),
                    PassState::Ready(client) => {
                        self.resolving(client, mode, watermark_override, &mut report)
                            .await
                    }
                    PassState::Iterating {
                        mut client,
                        folder,
                        uids,
                    } => {
                        self.iterating(client.as_mut(), mode, &folder, &uids, &mut report, deadline)
                            .await;
                        PassState::Finalizing(client)
                    }
                    PassState::Finalizing(mut client) => {
                        self.finalizing(client.as_mut(), mode).await;
                        PassState::Disconnected
                    }
                    PassState::Disconnected => break,
                };
            }

            report.finish();
            info!(
                "{} pass complete: {} processed ({} kept, {} archived, {} categorized, {} deleted, {} failed), {} skipped, {} undetermined",
                mode,
                report.processed,
                report.kept,
                report.archived,
                report.categorized,
                report.deleted,
                report.failed,
                report.skipped,
                report.undetermined
            );
            Ok::<_, TriageError>(report)
        }
        .instrument(span)
        .await
    }

    /// Connecting -> Ready
    async fn connecting(&self) -> Result<Box<dyn MailboxClient>> {
        execute_with_retry("IMAP connect", &self.connect_policy, || {
            self.connector.connect()
        })
        .await
        .map_err(|e| match e {
            TriageError::Connection(_) => e,
            other => TriageError::Connection(other.to_string()),
        })
    }

    /// Ready -> Iterating, or straight to Finalizing when there is nothing to do
    async fn resolving(
        &self,
        mut client: Box<dyn MailboxClient>,
        mode: TriageMode,
        watermark_override: Option<DateTime<Utc>>,
        report: &mut PassReport,
    ) -> PassState {
        let watermark = match (mode, watermark_override) {
            (TriageMode::New, Some(timestamp)) => {
                info!("Using watermark override {}", timestamp);
                timestamp
            }
            (TriageMode::New, None) => self.watermark.read().await,
            (TriageMode::Backlog, _) => Utc::now(),
        };

        let plan =
            FolderSearchPlan::for_mode(mode, &self.config.folders, &self.config.triage, watermark);
        debug!("Search plan: {:?}", plan);

        match planner::resolve(client.as_mut(), &plan).await {
            Ok(Resolution::Found { folder, uids }) => {
                report.folder = Some(folder.clone());
                PassState::Iterating {
                    client,
                    folder,
                    uids,
                }
            }
            Ok(Resolution::NoWork) => PassState::Finalizing(client),
            Err(e) => {
                warn!("Folder resolution aborted: {}", e);
                PassState::Finalizing(client)
            }
        }
    }

    /// Iterating -> Finalizing, one message at a time
    async fn iterating(
        &self,
        client: &mut dyn MailboxClient,
        mode: TriageMode,
        folder: &str,
        uids: &[u32],
        report: &mut PassReport,
        deadline: Instant,
    ) {
        let ctx = ActionContext::from_config(&self.config, mode, folder);
        let cap = self.config.triage.max_messages_per_pass;
        let pacing = self.config.triage.message_pacing();

        let work = async {
            let mut acted = 0;
            let mut paced = false;
            for &uid in uids {
                if acted >= cap {
                    info!(
                        "Reached {} messages in '{}', leaving the rest for the next pass",
                        cap, folder
                    );
                    break;
                }
                if paced && !pacing.is_zero() {
                    tokio::time::sleep(pacing).await;
                }

                let before = report.processed;
                if let Err(e) = self.process_message(client, uid, &ctx, report).await {
                    warn!("Connection lost, ending iteration early: {}", e);
                    break;
                }
                // Settled and undetermined messages do not use up the cap
                paced = report.processed > before;
                if paced {
                    acted += 1;
                }
            }
        };

        if tokio::time::timeout_at(deadline, work).await.is_err() {
            warn!(
                "Pass deadline of {:?} reached, finalizing early",
                self.config.triage.pass_deadline()
            );
            report.deadline_hit = true;
        }
    }

    /// Fetch, parse, classify and act on one message
    ///
    /// Returns an error only when the session is gone.
    async fn process_message(
        &self,
        client: &mut dyn MailboxClient,
        uid: u32,
        ctx: &ActionContext,
        report: &mut PassReport,
    ) -> Result<()> {
        let raw = match client.fetch(uid).await {
            Ok(raw) => raw,
            Err(e) if e.is_connection_lost() => return Err(e),
            Err(e) => {
                warn!("Failed to fetch message {}: {}", uid, e);
                report.record(
                    &ActionOutcome::Failed(executor::failure_reason(&e)),
                    &ctx.archive,
                );
                return Ok(());
            }
        };

        let parsed = match self.parser.parse(&raw.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Failed to parse message {}: {}", uid, e);
                report.record(
                    &ActionOutcome::Failed(FailureReason::ParseError),
                    &ctx.archive,
                );
                return Ok(());
            }
        };
        let snapshot = build_snapshot(raw, &parsed);

        // No point paying for a classifier call on mail that will be skipped
        if executor::is_settled(&snapshot, ctx) {
            debug!("Message {} already triaged", uid);
            report.record(&ActionOutcome::Skipped, &ctx.archive);
            return Ok(());
        }

        let verdict = match self.dispatcher.classify(&snapshot).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Classification failed for message {}: {}", uid, e);
                report.record(
                    &ActionOutcome::Failed(FailureReason::ClassificationFailed),
                    &ctx.archive,
                );
                return Ok(());
            }
        };

        if verdict == Verdict::Undetermined {
            debug!("Message {} undetermined, leaving it alone", uid);
            report.record_undetermined();
            return Ok(());
        }

        let outcome = executor::apply(client, &snapshot, &verdict, ctx).await?;
        debug!("Message {} '{}': {:?}", uid, snapshot.subject, outcome);
        report.record(&outcome, &ctx.archive);
        Ok(())
    }

    /// Finalizing -> Disconnected; failures here are logged only
    async fn finalizing(&self, client: &mut dyn MailboxClient, mode: TriageMode) {
        if let Err(e) = client.expunge().await {
            warn!("Expunge failed: {}", e);
        }
        if let Err(e) = client.logout().await {
            debug!("Logout failed: {}", e);
        }

        if mode == TriageMode::New {
            let now = Utc::now();
            match self.watermark.write(now).await {
                Ok(()) => debug!("Watermark advanced to {}", now),
                Err(e) => warn!("Failed to save watermark: {}", e),
            }
        }
    }
}

#[async_trait]
impl PassRunner for TriageEngine {
    async fn run_pass(
        &self,
        mode: TriageMode,
        watermark_override: Option<DateTime<Utc>>,
    ) -> Result<PassReport> {
        self.run(mode, watermark_override).await
    }
}
