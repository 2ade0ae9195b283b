//! Folder resolution: find the first candidate folder with work to do

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::client::{MailboxClient, SearchPredicate};
use crate::config::{FolderConfig, TriageConfig};
use crate::error::Result;
use crate::models::TriageMode;

/// Ordered folders to search plus the predicate to apply
#[derive(Debug, Clone, PartialEq)]
pub struct FolderSearchPlan {
    pub primary: Vec<String>,
    /// Searched only once every primary folder came up empty
    pub fallback: Vec<String>,
    pub predicate: SearchPredicate,
    pub newest_first: bool,
}

impl FolderSearchPlan {
    /// Build a plan; the archive folder and duplicates are dropped
    pub fn new(
        primary: Vec<String>,
        fallback: Vec<String>,
        predicate: SearchPredicate,
        newest_first: bool,
        archive: &str,
    ) -> Self {
        let mut seen: Vec<String> = Vec::new();
        let mut keep = |folders: Vec<String>| {
            folders
                .into_iter()
                .filter(|f| !f.eq_ignore_ascii_case(archive))
                .filter(|f| {
                    if seen.iter().any(|s| s.eq_ignore_ascii_case(f)) {
                        false
                    } else {
                        seen.push(f.clone());
                        true
                    }
                })
                .collect::<Vec<_>>()
        };
        let primary = keep(primary);
        let fallback = keep(fallback);

        Self {
            primary,
            fallback,
            predicate,
            newest_first,
        }
    }

    /// New mail: the inbox since the watermark day. Backlog: everything,
    /// newest first, with category folders as the fallback.
    pub fn for_mode(
        mode: TriageMode,
        folders: &FolderConfig,
        triage: &TriageConfig,
        watermark: DateTime<Utc>,
    ) -> Self {
        match mode {
            TriageMode::New => Self::new(
                vec![folders.inbox.clone()],
                Vec::new(),
                SearchPredicate::UnreadUnflaggedSince(watermark.date_naive()),
                false,
                &folders.archive,
            ),
            TriageMode::Backlog => {
                let fallback = if triage.category_fallback {
                    folders.categories.clone()
                } else {
                    Vec::new()
                };
                Self::new(
                    folders.backlog.clone(),
                    fallback,
                    SearchPredicate::All,
                    true,
                    &folders.archive,
                )
            }
        }
    }

    pub fn candidates(&self) -> impl Iterator<Item = &String> {
        self.primary.iter().chain(self.fallback.iter())
    }
}

/// Outcome of running a plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Folder left selected in the session, with uids in processing order
    Found { folder: String, uids: Vec<u32> },
    NoWork,
}

/// Try each candidate in order, stopping at the first non-empty folder
///
/// A folder that cannot be opened or searched counts as empty. Only a
/// lost connection aborts the scan.
pub async fn resolve(
    client: &mut dyn MailboxClient,
    plan: &FolderSearchPlan,
) -> Result<Resolution> {
    for (index, folder) in plan.candidates().enumerate() {
        if index == plan.primary.len() {
            debug!("Primary folders empty, trying category folders");
        }

        if let Err(e) = client.open_folder(folder, false).await {
            if e.is_connection_lost() {
                return Err(e);
            }
            warn!("Cannot open folder '{}', treating as empty: {}", folder, e);
            continue;
        }

        let mut uids = match client.search(&plan.predicate).await {
            Ok(uids) => uids,
            Err(e) if e.is_connection_lost() => return Err(e),
            Err(e) => {
                warn!("Search failed in '{}', treating as empty: {}", folder, e);
                continue;
            }
        };

        if uids.is_empty() {
            debug!("No matching messages in '{}'", folder);
            continue;
        }

        uids.sort_unstable();
        if plan.newest_first {
            uids.reverse();
        }
        info!("Found {} message(s) in '{}'", uids.len(), folder);
        return Ok(Resolution::Found {
            folder: folder.clone(),
            uids,
        });
    }

    info!("No messages found in any candidate folder");
    Ok(Resolution::NoWork)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockMailboxClient;
    use crate::config::Config;
    use crate::error::TriageError;
    use chrono::TimeZone;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plan_excludes_archive_and_duplicates() {
        let plan = FolderSearchPlan::new(
            names(&["INBOX", "records", "inbox"]),
            names(&["Receipts", "Records", "INBOX", "Receipts"]),
            SearchPredicate::All,
            true,
            "Records",
        );
        assert_eq!(plan.primary, names(&["INBOX"]));
        assert_eq!(plan.fallback, names(&["Receipts"]));
    }

    #[test]
    fn test_plan_for_new_mode() {
        let config = Config::default();
        let watermark = Utc.with_ymd_and_hms(2024, 3, 4, 23, 59, 0).unwrap();
        let plan = FolderSearchPlan::for_mode(TriageMode::New, &config.folders, &config.triage, watermark);
        assert_eq!(plan.primary, names(&["INBOX"]));
        assert!(plan.fallback.is_empty());
        assert!(!plan.newest_first);
        assert_eq!(
            plan.predicate.to_imap_query(),
            "UNSEEN UNFLAGGED SINCE 04-Mar-2024"
        );
    }

    #[test]
    fn test_plan_for_backlog_mode() {
        let mut config = Config::default();
        config.folders.categories.push("Records".to_string());
        let plan = FolderSearchPlan::for_mode(
            TriageMode::Backlog,
            &config.folders,
            &config.triage,
            Utc::now(),
        );
        assert_eq!(plan.predicate, SearchPredicate::All);
        assert!(plan.newest_first);
        assert_eq!(
            plan.primary,
            vec!["[Gmail]/All Mail", "[Google Mail]/All Mail", "INBOX"]
        );
        assert!(!plan.candidates().any(|f| f == "Records"));
        assert_eq!(plan.fallback.len(), 4);

        config.triage.category_fallback = false;
        let plan = FolderSearchPlan::for_mode(
            TriageMode::Backlog,
            &config.folders,
            &config.triage,
            Utc::now(),
        );
        assert!(plan.fallback.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_stops_at_first_non_empty() {
        let mut client = MockMailboxClient::new();
        let mut seq = Sequence::new();

        for (folder, uids) in [("A", vec![]), ("B", vec![]), ("C", vec![3u32, 7, 5])] {
            client
                .expect_open_folder()
                .with(eq(folder), eq(false))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
            client
                .expect_search()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(uids.clone()));
        }

        let plan = FolderSearchPlan::new(
            names(&["A", "B", "C", "D"]),
            vec![],
            SearchPredicate::All,
            true,
            "Records",
        );
        let resolution = resolve(&mut client, &plan).await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Found {
                folder: "C".to_string(),
                uids: vec![7, 5, 3]
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_missing_folder_counts_as_empty() {
        let mut client = MockMailboxClient::new();
        client
            .expect_open_folder()
            .with(eq("Gone"), eq(false))
            .times(1)
            .returning(|_, _| Err(TriageError::FolderMissing("Gone".to_string())));
        client
            .expect_open_folder()
            .with(eq("Receipts"), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_search()
            .times(1)
            .returning(|_| Ok(vec![1, 2]));

        let plan = FolderSearchPlan::new(
            names(&["Gone"]),
            names(&["Receipts"]),
            SearchPredicate::All,
            false,
            "Records",
        );
        let resolution = resolve(&mut client, &plan).await.unwrap();
        assert_eq!(
            resolution,
            Resolution::Found {
                folder: "Receipts".to_string(),
                uids: vec![1, 2]
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_all_empty_is_no_work() {
        let mut client = MockMailboxClient::new();
        client.expect_open_folder().times(2).returning(|_, _| Ok(()));
        client.expect_search().times(2).returning(|_| Ok(vec![]));

        let plan = FolderSearchPlan::new(
            names(&["INBOX"]),
            names(&["Receipts"]),
            SearchPredicate::All,
            true,
            "Records",
        );
        assert_eq!(resolve(&mut client, &plan).await.unwrap(), Resolution::NoWork);
    }

    #[tokio::test]
    async fn test_resolve_connection_loss_aborts() {
        let mut client = MockMailboxClient::new();
        client
            .expect_open_folder()
            .times(1)
            .returning(|_, _| Err(TriageError::Connection("reset".to_string())));

        let plan = FolderSearchPlan::new(
            names(&["INBOX", "Receipts"]),
            vec![],
            SearchPredicate::All,
            true,
            "Records",
        );
        let result = resolve(&mut client, &plan).await;
        assert!(matches!(result, Err(TriageError::Connection(_))));
    }
}
