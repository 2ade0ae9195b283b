//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mail_triage::classifier::{
    BusinessRule, ClassificationDispatcher, ClassificationRequest, ClassificationService,
};
use mail_triage::client::{MailboxClient, MailboxConnector, MessageFlag, SearchPredicate};
use mail_triage::config::Config;
use mail_triage::error::{Result, TriageError};
use mail_triage::models::RawMessage;
use mail_triage::parser::MimeParser;
use mail_triage::retry::RetryPolicy;
use mail_triage::state::WatermarkStore;
use mail_triage::triage::TriageEngine;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One stored message in the fake mailbox
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub flags: Vec<String>,
    pub labels: Vec<String>,
    pub internal_date: DateTime<Utc>,
    pub source: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct MailboxState {
    pub folders: HashMap<String, BTreeMap<u32, StoredMessage>>,
    pub next_uid: u32,
    /// Every call issued against the mailbox, e.g. `move 3 Records`
    pub log: Vec<String>,
    pub active_sessions: usize,
    pub max_concurrent_sessions: usize,
    pub connects: usize,
}

/// In-memory mailbox shared by every session opened through [`FakeConnector`]
#[derive(Clone, Default)]
pub struct FakeMailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl FakeMailbox {
    /// Mailbox with the default folder layout
    pub fn new() -> Self {
        let config = Config::default();
        let mailbox = Self::default();
        {
            let mut state = mailbox.state.lock().unwrap();
            state.next_uid = 1;
            let mut names = vec![
                config.folders.inbox.clone(),
                config.folders.archive.clone(),
                config.folders.rejected.clone(),
            ];
            names.extend(config.folders.categories.iter().cloned());
            names.push(config.folders.trash[0].clone());
            for name in names {
                state.folders.insert(name, BTreeMap::new());
            }
        }
        mailbox
    }

    pub fn add_folder(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .folders
            .entry(name.to_string())
            .or_default();
    }

    pub fn remove_folder(&self, name: &str) {
        self.state.lock().unwrap().folders.remove(name);
    }

    /// Store a message and return its uid
    pub fn deliver(&self, folder: &str, message: StoredMessage) -> u32 {
        let mut state = self.state.lock().unwrap();
        let uid = state.next_uid;
        state.next_uid += 1;
        state
            .folders
            .get_mut(folder)
            .expect("folder exists")
            .insert(uid, message);
        uid
    }

    pub fn count(&self, folder: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .folders
            .get(folder)
            .map(|f| f.len())
            .unwrap_or(0)
    }

    pub fn messages(&self, folder: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .unwrap()
            .folders
            .get(folder)
            .map(|f| f.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.state.lock().unwrap().max_concurrent_sessions
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            mailbox: self.clone(),
            failures_left: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Hands out sessions on a [`FakeMailbox`]
#[derive(Clone)]
pub struct FakeConnector {
    mailbox: FakeMailbox,
    failures_left: Arc<AtomicUsize>,
}

impl FakeConnector {
    /// Refuse the next `n` connection attempts
    pub fn failing(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl MailboxConnector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxClient>> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TriageError::Connection("connection refused".to_string()));
        }

        let mut state = self.mailbox.state.lock().unwrap();
        state.connects += 1;
        state.active_sessions += 1;
        state.max_concurrent_sessions = state.max_concurrent_sessions.max(state.active_sessions);
        drop(state);

        Ok(Box::new(FakeSession {
            mailbox: self.mailbox.clone(),
            selected: None,
            open: true,
        }))
    }
}

pub struct FakeSession {
    mailbox: FakeMailbox,
    selected: Option<String>,
    open: bool,
}

impl FakeSession {
    fn with_state<T>(&self, f: impl FnOnce(&mut MailboxState) -> T) -> T {
        let mut state = self.mailbox.state.lock().unwrap();
        f(&mut state)
    }

    fn selected(&self) -> Result<String> {
        self.selected
            .clone()
            .ok_or_else(|| TriageError::Protocol("No folder selected".to_string()))
    }

    fn with_message<T>(
        &self,
        uid: u32,
        f: impl FnOnce(&mut StoredMessage) -> T,
    ) -> Result<T> {
        let folder = self.selected()?;
        self.with_state(|state| {
            state
                .folders
                .get_mut(&folder)
                .and_then(|f| f.get_mut(&uid))
                .map(f)
                .ok_or_else(|| TriageError::Protocol(format!("No message with uid {}", uid)))
        })
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        if self.open {
            if let Ok(mut state) = self.mailbox.state.lock() {
                state.active_sessions -= 1;
            }
        }
    }
}

#[async_trait]
impl MailboxClient for FakeSession {
    async fn open_folder(&mut self, name: &str, _read_only: bool) -> Result<()> {
        let exists = self.with_state(|state| {
            state.log.push(format!("open {}", name));
            state.folders.contains_key(name)
        });
        if !exists {
            return Err(TriageError::FolderMissing(format!(
                "[NONEXISTENT] Unknown Mailbox: {}",
                name
            )));
        }
        self.selected = Some(name.to_string());
        Ok(())
    }

    async fn search(&mut self, predicate: &SearchPredicate) -> Result<Vec<u32>> {
        let folder = self.selected()?;
        Ok(self.with_state(|state| {
            state.log.push(format!("search {} {}", folder, predicate.to_imap_query()));
            state.folders[&folder]
                .iter()
                .filter(|(_, m)| match predicate {
                    SearchPredicate::All => true,
                    SearchPredicate::UnreadUnflaggedSince(day) => {
                        !m.flags.iter().any(|f| f == "\\Seen" || f == "\\Flagged")
                            && m.internal_date.date_naive() >= *day
                    }
                })
                .map(|(uid, _)| *uid)
                .collect()
        }))
    }

    async fn fetch(&mut self, uid: u32) -> Result<RawMessage> {
        let message = self.with_message(uid, |m| m.clone())?;
        self.with_state(|state| state.log.push(format!("fetch {}", uid)));
        Ok(RawMessage {
            uid,
            flags: message.flags,
            labels: message.labels,
            internal_date: Some(message.internal_date),
            body: message.source,
        })
    }

    async fn add_flags(&mut self, uid: u32, flags: &[MessageFlag]) -> Result<()> {
        self.with_message(uid, |m| {
            for flag in flags {
                if !m.flags.iter().any(|f| f == flag.as_imap()) {
                    m.flags.push(flag.as_imap().to_string());
                }
            }
        })?;
        self.with_state(|state| {
            let names: Vec<_> = flags.iter().map(|f| f.as_imap()).collect();
            state.log.push(format!("flag {} +{}", uid, names.join(" ")));
        });
        Ok(())
    }

    async fn remove_flags(&mut self, uid: u32, flags: &[MessageFlag]) -> Result<()> {
        self.with_message(uid, |m| {
            m.flags
                .retain(|f| !flags.iter().any(|flag| flag.as_imap() == f.as_str()));
        })?;
        self.with_state(|state| state.log.push(format!("flag {} -", uid)));
        Ok(())
    }

    async fn set_flags(&mut self, uid: u32, flags: &[MessageFlag]) -> Result<()> {
        self.with_message(uid, |m| {
            m.flags = flags.iter().map(|f| f.as_imap().to_string()).collect();
        })?;
        self.with_state(|state| state.log.push(format!("flag {} =", uid)));
        Ok(())
    }

    async fn move_message(&mut self, uid: u32, destination: &str) -> Result<()> {
        let folder = self.selected()?;
        self.with_state(|state| {
            state.log.push(format!("move {} {}", uid, destination));
            if !state.folders.contains_key(destination) {
                return Err(TriageError::FolderMissing(format!(
                    "[TRYCREATE] No folder {}",
                    destination
                )));
            }
            let message = state
                .folders
                .get_mut(&folder)
                .and_then(|f| f.remove(&uid))
                .ok_or_else(|| TriageError::Protocol(format!("No message with uid {}", uid)))?;
            let new_uid = state.next_uid;
            state.next_uid += 1;
            state
                .folders
                .get_mut(destination)
                .expect("checked above")
                .insert(new_uid, message);
            Ok(())
        })
    }

    async fn expunge(&mut self) -> Result<()> {
        if let Some(folder) = self.selected.clone() {
            self.with_state(|state| {
                state.log.push(format!("expunge {}", folder));
                if let Some(messages) = state.folders.get_mut(&folder) {
                    messages.retain(|_, m| !m.flags.iter().any(|f| f == "\\Deleted"));
                }
            });
        }
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        self.with_state(|state| {
            state.log.push("logout".to_string());
            state.active_sessions -= 1;
        });
        self.open = false;
        self.selected = None;
        Ok(())
    }
}

/// Classifier that replays scripted responses, then repeats a default
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Result<String>>>,
    default: String,
    calls: AtomicUsize,
    requests: Mutex<Vec<ClassificationRequest>>,
}

impl ScriptedClassifier {
    pub fn new(default: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: default.to_string(),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, response: Result<String>) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ClassificationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClassificationService for ScriptedClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.default.clone()))
    }
}

/// Watermark kept in memory
#[derive(Default)]
pub struct MemoryWatermark {
    value: Mutex<Option<DateTime<Utc>>>,
    writes: AtomicUsize,
}

impl MemoryWatermark {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            value: Mutex::new(Some(timestamp)),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermark {
    async fn read(&self) -> DateTime<Utc> {
        self.value.lock().unwrap().unwrap_or_else(Utc::now)
    }

    async fn write(&self, timestamp: DateTime<Utc>) -> Result<()> {
        *self.value.lock().unwrap() = Some(timestamp);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Config with pacing and retry delays shrunk for tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.triage.message_pacing_ms = 0;
    config.retry.connection.base_delay_ms = 10;
    config.retry.connection.max_delay_ms = 100;
    config.retry.classifier.base_delay_ms = 100;
    config.retry.classifier.max_delay_ms = 1_000;
    config.retry.classifier.jitter_ratio = 0.0;
    config.retry.classifier.rate_limit_cooldown_ms = 1_000;
    config
}

/// Engine over the fake mailbox and a scripted classifier
pub fn engine(
    config: Config,
    connector: FakeConnector,
    classifier: Arc<ScriptedClassifier>,
    watermark: Arc<MemoryWatermark>,
) -> TriageEngine {
    let dispatcher = ClassificationDispatcher::new(
        BusinessRule::from_config(&config.business),
        classifier,
        RetryPolicy::from_config(&config.retry.classifier),
        config.classifier.max_body_chars,
        config.folders.categories.clone(),
    );
    TriageEngine::new(
        Arc::new(config),
        Arc::new(connector),
        dispatcher,
        Arc::new(MimeParser),
        watermark,
    )
}

/// An RFC 5322 message received `age_days` ago
pub fn create_test_message(sender: &str, subject: &str, body: &str, age_days: i64) -> StoredMessage {
    let date = Utc::now() - Duration::days(age_days);
    let source = format!(
        "From: {}\r\nTo: me@example.com\r\nSubject: {}\r\nDate: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
        sender,
        subject,
        date.to_rfc2822(),
        body
    );
    StoredMessage {
        flags: Vec::new(),
        labels: Vec::new(),
        internal_date: date,
        source: source.into_bytes(),
    }
}

/// A newsletter the classifier is expected to reject
pub fn create_newsletter_message(age_days: i64) -> StoredMessage {
    create_test_message(
        "news@weekly.example.com",
        "This week in gadgets",
        "Ten things you missed this week.",
        age_days,
    )
}

/// A message from a person
pub fn create_personal_message(age_days: i64) -> StoredMessage {
    create_test_message(
        "Alice <alice@example.com>",
        "Dinner on Friday?",
        "Are you free on Friday evening?",
        age_days,
    )
}

pub const WORTH_READING: &str = r#"{"judgment": true}"#;
pub const NEWSLETTER: &str = r#"{"judgment": false, "category": "Newsletters"}"#;
pub const UNKNOWN: &str = r#"{"judgment": "unknown"}"#;
