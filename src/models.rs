use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// IMAP system flag for starred (keep-forever) messages
pub const FLAG_FLAGGED: &str = "\\Flagged";
/// IMAP system flag for read messages
pub const FLAG_SEEN: &str = "\\Seen";
/// IMAP system flag for messages pending expunge
pub const FLAG_DELETED: &str = "\\Deleted";
/// Gmail system label carried by inbox messages in any folder view
pub const LABEL_INBOX: &str = "\\Inbox";

/// Raw fetch result as returned by a mailbox session
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub labels: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub body: Vec<u8>,
}

/// Immutable snapshot of one mailbox entry, built by fetch + parse
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub uid: u32,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub date: DateTime<Utc>,
    pub flags: Vec<String>,
    pub labels: Vec<String>,
}

impl MessageSnapshot {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f.eq_ignore_ascii_case(flag))
    }

    /// Labels and keywords both count; Gmail exposes folders as labels
    pub fn has_label(&self, label: &str) -> bool {
        self.labels
            .iter()
            .chain(self.flags.iter())
            .any(|l| l.trim_start_matches('\\').eq_ignore_ascii_case(label))
    }

    /// Age in whole days relative to `now`
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.date).num_days()
    }
}

/// Result of the classification dispatcher for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    WorthReading { category: Option<String> },
    NotWorthReading { category: Option<String> },
    BusinessAutoRoute,
    Undetermined,
}

impl Verdict {
    pub fn category(&self) -> Option<&str> {
        match self {
            Verdict::WorthReading { category } | Verdict::NotWorthReading { category } => {
                category.as_deref()
            }
            _ => None,
        }
    }
}

/// Why an action on a message did not complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    FolderMissing(String),
    RateLimited,
    Timeout,
    ParseError,
    ClassificationFailed,
    Protocol(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::FolderMissing(folder) => write!(f, "folder '{}' missing", folder),
            FailureReason::RateLimited => write!(f, "rate limited"),
            FailureReason::Timeout => write!(f, "timed out"),
            FailureReason::ParseError => write!(f, "unparseable message"),
            FailureReason::ClassificationFailed => write!(f, "classification failed"),
            FailureReason::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

/// Outcome of acting on one message; drives counters only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionOutcome {
    Kept,
    Starred,
    MovedTo(String),
    Deleted,
    Skipped,
    Failed(FailureReason),
}

/// Which sweep a pass performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageMode {
    New,
    Backlog,
}

impl fmt::Display for TriageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriageMode::New => write!(f, "new"),
            TriageMode::Backlog => write!(f, "backlog"),
        }
    }
}

/// Counters and metadata for one completed pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub run_id: String,
    pub mode: TriageMode,
    pub folder: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: usize,
    pub categorized: usize,
    pub deleted: usize,
    pub kept: usize,
    pub archived: usize,
    pub skipped: usize,
    pub undetermined: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub deadline_hit: bool,
}

impl PassReport {
    pub fn new(mode: TriageMode) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            mode,
            folder: None,
            started_at: Utc::now(),
            finished_at: None,
            processed: 0,
            categorized: 0,
            deleted: 0,
            kept: 0,
            archived: 0,
            skipped: 0,
            undetermined: 0,
            failed: 0,
            rate_limited: 0,
            deadline_hit: false,
        }
    }

    /// Fold one message outcome into the counters
    ///
    /// Only outcomes that touched the mailbox, or tried to, count as processed.
    pub fn record(&mut self, outcome: &ActionOutcome, archive_folder: &str) {
        match outcome {
            ActionOutcome::Skipped => {
                self.skipped += 1;
                return;
            }
            // Left exactly as found; the next pass will see it again
            ActionOutcome::Kept => {
                self.kept += 1;
                return;
            }
            ActionOutcome::Starred => self.kept += 1,
            ActionOutcome::MovedTo(folder) if folder.eq_ignore_ascii_case(archive_folder) => {
                self.archived += 1
            }
            ActionOutcome::MovedTo(_) => self.categorized += 1,
            ActionOutcome::Deleted => self.deleted += 1,
            ActionOutcome::Failed(reason) => {
                self.failed += 1;
                if *reason == FailureReason::RateLimited {
                    self.rate_limited += 1;
                }
            }
        }
        self.processed += 1;
    }

    /// Undetermined verdicts are a deliberate no-op
    pub fn record_undetermined(&mut self) {
        self.undetermined += 1;
    }

    /// At least one message changed state during the pass
    ///
    /// Failed messages are counted as processed but are not progress, so a
    /// pass that only fails does not trigger a burst.
    pub fn made_progress(&self) -> bool {
        self.processed > self.failed
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

/// What the control surface reports for one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: String,
    pub message: String,
    pub processed: usize,
    pub categorized: usize,
    pub deleted: usize,
}

impl ControlResponse {
    pub fn from_report(report: &PassReport) -> Self {
        let message = match report.mode {
            TriageMode::New => format!("Processed {} new emails", report.processed),
            TriageMode::Backlog => format!(
                "Processed {} old emails: {} categorized, {} deleted",
                report.processed, report.categorized, report.deleted
            ),
        };
        Self {
            status: "ok".to_string(),
            message,
            processed: report.processed,
            categorized: report.categorized,
            deleted: report.deleted,
        }
    }

    pub fn from_error(mode: TriageMode, error: &crate::error::TriageError) -> Self {
        Self {
            status: "error".to_string(),
            message: format!("{} pass failed: {}", mode, error),
            processed: 0,
            categorized: 0,
            deleted: 0,
        }
    }
}
