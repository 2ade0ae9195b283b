//! Per-message actions driven by a verdict
//!
//! Every mutation goes through [`MailboxClient`], which bounds it with the
//! operation timeout. Failures are folded into [`ActionOutcome::Failed`]
//! so one bad message never aborts a pass; only a lost connection is
//! returned as an error.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::client::{MailboxClient, MessageFlag};
use crate::config::Config;
use crate::error::{Result, TriageError};
use crate::models::{
    ActionOutcome, FailureReason, MessageSnapshot, TriageMode, Verdict, FLAG_FLAGGED, LABEL_INBOX,
};

/// Everything `apply` needs to know about the pass it runs in
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub inbox: String,
    pub archive: String,
    pub rejected: String,
    pub trash: Vec<String>,
    pub current_folder: String,
    pub recent_days: i64,
    pub delete_after_days: i64,
    pub star_kept_messages: bool,
    pub star_on_archive: bool,
    pub mark_rejected_read: bool,
    pub sort_into_category_folders: bool,
    pub deletion_enabled: bool,
    pub now: DateTime<Utc>,
}

impl ActionContext {
    pub fn from_config(config: &Config, mode: TriageMode, current_folder: &str) -> Self {
        Self {
            inbox: config.folders.inbox.clone(),
            archive: config.folders.archive.clone(),
            rejected: config.folders.rejected.clone(),
            trash: config.folders.trash.clone(),
            current_folder: current_folder.to_string(),
            recent_days: config.triage.recent_days,
            delete_after_days: config.triage.delete_after_days,
            star_kept_messages: config.triage.star_kept_messages,
            star_on_archive: config.triage.star_on_archive,
            mark_rejected_read: config.triage.mark_rejected_read,
            sort_into_category_folders: config.triage.sort_into_category_folders,
            deletion_enabled: mode == TriageMode::Backlog,
            now: Utc::now(),
        }
    }

    /// Opened from the inbox, or seen through an all-mail view with the inbox label
    fn in_inbox(&self, message: &MessageSnapshot) -> bool {
        self.current_folder.eq_ignore_ascii_case(&self.inbox)
            || message
                .labels
                .iter()
                .any(|l| l.eq_ignore_ascii_case(LABEL_INBOX))
    }

    fn already_in(&self, message: &MessageSnapshot, folder: &str) -> bool {
        folder.eq_ignore_ascii_case(&self.current_folder) || message.has_label(folder)
    }
}

/// Map a message-local error onto the reason recorded in the report
pub fn failure_reason(error: &TriageError) -> FailureReason {
    match error {
        TriageError::FolderMissing(folder) => FailureReason::FolderMissing(folder.clone()),
        TriageError::RateLimited(_) => FailureReason::RateLimited,
        TriageError::Timeout { .. } => FailureReason::Timeout,
        TriageError::Parse(_) => FailureReason::ParseError,
        TriageError::Classification(_) => FailureReason::ClassificationFailed,
        other => FailureReason::Protocol(other.to_string()),
    }
}

/// Contain a message-local error; a lost connection propagates
fn contain(error: TriageError, uid: u32, action: &str) -> Result<ActionOutcome> {
    if error.is_connection_lost() {
        return Err(error);
    }
    let reason = failure_reason(&error);
    warn!("Failed to {} message {}: {}", action, uid, error);
    Ok(ActionOutcome::Failed(reason))
}

/// Best-effort flag change; only a lost connection is an error
async fn try_add_flag(
    client: &mut dyn MailboxClient,
    uid: u32,
    flag: MessageFlag,
) -> Result<bool> {
    match client.add_flags(uid, &[flag]).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_connection_lost() => Err(e),
        Err(e) => {
            warn!("Could not add {} to message {}: {}", flag.as_imap(), uid, e);
            Ok(false)
        }
    }
}

async fn move_to(
    client: &mut dyn MailboxClient,
    uid: u32,
    destination: &str,
) -> Result<ActionOutcome> {
    match client.move_message(uid, destination).await {
        Ok(()) => {
            info!("Moved message {} to '{}'", uid, destination);
            Ok(ActionOutcome::MovedTo(destination.to_string()))
        }
        Err(TriageError::FolderMissing(detail)) => {
            warn!(
                "Folder '{}' does not exist, leaving message {} in place ({})",
                destination, uid, detail
            );
            Ok(ActionOutcome::Failed(FailureReason::FolderMissing(
                destination.to_string(),
            )))
        }
        Err(e) => contain(e, uid, &format!("move to '{}'", destination)),
    }
}

/// Archive a message, starring it first when `star` is set
async fn archive(
    client: &mut dyn MailboxClient,
    uid: u32,
    ctx: &ActionContext,
    star: bool,
) -> Result<ActionOutcome> {
    if star {
        try_add_flag(client, uid, MessageFlag::Flagged).await?;
    } else if ctx.star_kept_messages {
        debug!("Not starring message {} moved to '{}'", uid, ctx.archive);
    }
    move_to(client, uid, &ctx.archive).await
}

/// Trash folders first, then `\Deleted` with an immediate expunge
async fn delete(
    client: &mut dyn MailboxClient,
    uid: u32,
    ctx: &ActionContext,
) -> Result<ActionOutcome> {
    for trash in &ctx.trash {
        match client.move_message(uid, trash).await {
            Ok(()) => {
                info!("Deleted message {} (moved to '{}')", uid, trash);
                return Ok(ActionOutcome::Deleted);
            }
            Err(e) if e.is_connection_lost() => return Err(e),
            Err(e) => debug!("Trash folder '{}' unavailable: {}", trash, e),
        }
    }

    if let Err(e) = client.add_flags(uid, &[MessageFlag::Deleted]).await {
        return contain(e, uid, "delete");
    }
    if let Err(e) = client.expunge().await {
        return contain(e, uid, "expunge");
    }
    info!("Deleted message {} (expunged)", uid);
    Ok(ActionOutcome::Deleted)
}

/// Already archived or starred; nothing left to decide
pub fn is_settled(message: &MessageSnapshot, ctx: &ActionContext) -> bool {
    message.has_label(&ctx.archive) || message.has_flag(FLAG_FLAGGED)
}

/// Apply a verdict to one message
///
/// Rules, in order:
/// 1. archived, starred or undetermined messages are skipped untouched
/// 2. business mail is archived (starred when `star_kept_messages`)
/// 3. worth reading: recent inbox mail stays, everything else is archived
/// 4. not worth reading: marked read, then deleted when old enough in a
///    backlog pass, otherwise moved to its category or the rejected folder
///    unless it is already there
pub async fn apply(
    client: &mut dyn MailboxClient,
    message: &MessageSnapshot,
    verdict: &Verdict,
    ctx: &ActionContext,
) -> Result<ActionOutcome> {
    let uid = message.uid;

    if is_settled(message, ctx) {
        debug!("Message {} already archived or starred, skipping", uid);
        return Ok(ActionOutcome::Skipped);
    }

    let age = message.age_days(ctx.now);

    match verdict {
        Verdict::Undetermined => {
            debug!("No verdict for message {}, leaving it alone", uid);
            Ok(ActionOutcome::Skipped)
        }
        Verdict::BusinessAutoRoute => {
            info!("Business message {}: {}", uid, message.subject);
            archive(client, uid, ctx, ctx.star_kept_messages).await
        }
        Verdict::WorthReading { .. } if age < ctx.recent_days && ctx.in_inbox(message) => {
            if !ctx.star_kept_messages {
                return Ok(ActionOutcome::Kept);
            }
            match client.add_flags(uid, &[MessageFlag::Flagged]).await {
                Ok(()) => {
                    info!("Starred message {} ({} days old)", uid, age);
                    Ok(ActionOutcome::Starred)
                }
                Err(e) => contain(e, uid, "star"),
            }
        }
        Verdict::WorthReading { .. } => {
            archive(client, uid, ctx, ctx.star_kept_messages && ctx.star_on_archive).await
        }
        Verdict::NotWorthReading { category } => {
            let expired = ctx.deletion_enabled && age > ctx.delete_after_days;
            let target = match category {
                Some(category) if ctx.sort_into_category_folders => category.as_str(),
                _ => ctx.rejected.as_str(),
            };
            if !expired && ctx.already_in(message, target) {
                debug!("Message {} already filed in '{}'", uid, target);
                return Ok(ActionOutcome::Skipped);
            }

            if ctx.mark_rejected_read {
                try_add_flag(client, uid, MessageFlag::Seen).await?;
            }

            if expired {
                return delete(client, uid, ctx).await;
            }
            move_to(client, uid, target).await
        }
    }
}
