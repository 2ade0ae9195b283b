//! Mailbox session client over IMAP with bounded operations

use async_imap::types::{Fetch, Flag};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures::TryStreamExt;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, trace};

use crate::config::MailboxCredentials;
use crate::error::{Result, TriageError};
use crate::models::{RawMessage, FLAG_DELETED, FLAG_FLAGGED, FLAG_SEEN};

/// Flags the engine ever writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFlag {
    Seen,
    Flagged,
    Deleted,
}

impl MessageFlag {
    pub fn as_imap(&self) -> &'static str {
        match self {
            MessageFlag::Seen => FLAG_SEEN,
            MessageFlag::Flagged => FLAG_FLAGGED,
            MessageFlag::Deleted => FLAG_DELETED,
        }
    }
}

fn flag_list(flags: &[MessageFlag]) -> String {
    flags
        .iter()
        .map(MessageFlag::as_imap)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Search criteria understood by the triage loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchPredicate {
    /// Every message in the folder
    All,
    /// Unread, not starred, received on or after the given day
    UnreadUnflaggedSince(NaiveDate),
}

impl SearchPredicate {
    pub fn to_imap_query(&self) -> String {
        match self {
            SearchPredicate::All => "ALL".to_string(),
            SearchPredicate::UnreadUnflaggedSince(date) => {
                format!("UNSEEN UNFLAGGED SINCE {}", date.format("%d-%b-%Y"))
            }
        }
    }
}

/// Trait defining mailbox session operations for easier testing
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailboxClient: Send {
    /// Select a folder; subsequent uid operations apply to it
    async fn open_folder(&mut self, name: &str, read_only: bool) -> Result<()>;

    /// Uids in the open folder matching the predicate, ascending
    async fn search(&mut self, predicate: &SearchPredicate) -> Result<Vec<u32>>;

    /// Fetch flags, labels, internal date and full source without marking it read
    async fn fetch(&mut self, uid: u32) -> Result<RawMessage>;

    async fn add_flags(&mut self, uid: u32, flags: &[MessageFlag]) -> Result<()>;

    async fn remove_flags(&mut self, uid: u32, flags: &[MessageFlag]) -> Result<()>;

    /// Replace the flag set
    async fn set_flags(&mut self, uid: u32, flags: &[MessageFlag]) -> Result<()>;

    /// Errors: `FolderMissing`, `RateLimited`, anything else
    async fn move_message(&mut self, uid: u32, destination: &str) -> Result<()>;

    async fn expunge(&mut self) -> Result<()>;

    async fn logout(&mut self) -> Result<()>;
}

/// Opens new mailbox sessions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailboxClient>>;
}

/// Run one protocol command under a time bound
///
/// A command that times out may still have a response in flight, so the
/// session can no longer be trusted and the timeout is a lost connection.
async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        TriageError::Connection(format!(
            "{}; abandoning session",
            TriageError::timeout(operation, limit)
        ))
    })?
}

fn flag_to_string(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => FLAG_SEEN.to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => FLAG_FLAGGED.to_string(),
        Flag::Deleted => FLAG_DELETED.to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
        #[allow(unreachable_patterns)]
        other => format!("{:?}", other),
    }
}

fn quote_mailbox(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Production IMAP client
///
/// Every protocol call is bounded by `operation_timeout`. When
/// `tracked_labels` is non-empty the server is assumed to support the
/// Gmail `X-GM-LABELS` search extension and each fetched message is
/// annotated with those of the tracked labels it carries.
pub struct ImapMailboxClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    session: async_imap::Session<T>,
    selected: Option<String>,
    tracked_labels: Vec<String>,
    operation_timeout: Duration,
    /// Set once a command loses the connection; every later command fails fast
    broken: bool,
}

impl<T> ImapMailboxClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    pub fn new(
        session: async_imap::Session<T>,
        tracked_labels: Vec<String>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            session,
            selected: None,
            tracked_labels,
            operation_timeout,
            broken: false,
        }
    }

    fn live(&self) -> Result<()> {
        if self.broken {
            return Err(TriageError::Connection(
                "Session abandoned after an earlier failure".to_string(),
            ));
        }
        Ok(())
    }

    fn settle<R>(&mut self, result: Result<R>) -> Result<R> {
        if matches!(&result, Err(e) if e.is_connection_lost()) {
            self.broken = true;
        }
        result
    }

    fn require_selected(&self) -> Result<&str> {
        self.live()?;
        self.selected
            .as_deref()
            .ok_or_else(|| TriageError::Protocol("No folder selected".to_string()))
    }

    async fn store(&mut self, uid: u32, query: String) -> Result<()> {
        self.require_selected()?;
        let limit = self.operation_timeout;
        let session = &mut self.session;
        let result = bounded(&format!("store uid {}", uid), limit, async move {
            let _: Vec<Fetch> = session
                .uid_store(uid.to_string(), &query)
                .await?
                .try_collect()
                .await?;
            Ok(())
        })
        .await;
        self.settle(result)
    }

    async fn labels_for(&mut self, uid: u32) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for label in self.tracked_labels.clone() {
            let query = format!("UID {} X-GM-LABELS {}", uid, quote_mailbox(&label));
            let limit = self.operation_timeout;
            let session = &mut self.session;
            let result = bounded("label search", limit, async move {
                Ok(session.uid_search(&query).await?)
            })
            .await;
            match self.settle(result) {
                Ok(uids) if uids.contains(&uid) => found.push(label),
                Ok(_) => {}
                Err(e) if e.is_connection_lost() => return Err(e),
                Err(e) => trace!("Label lookup for uid {} unsupported or failed: {}", uid, e),
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl<T> MailboxClient for ImapMailboxClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    async fn open_folder(&mut self, name: &str, read_only: bool) -> Result<()> {
        self.live()?;
        let limit = self.operation_timeout;
        let session = &mut self.session;
        let result = bounded(&format!("open {}", name), limit, async move {
            if read_only {
                Ok(session.examine(name).await?)
            } else {
                Ok(session.select(name).await?)
            }
        })
        .await;
        let mailbox = self.settle(result)?;
        debug!("Opened folder '{}' ({} messages)", name, mailbox.exists);
        self.selected = Some(name.to_string());
        Ok(())
    }

    async fn search(&mut self, predicate: &SearchPredicate) -> Result<Vec<u32>> {
        self.require_selected()?;
        let query = predicate.to_imap_query();
        let limit = self.operation_timeout;
        let session = &mut self.session;
        let result = bounded(&format!("search {}", query), limit, async move {
            Ok(session.uid_search(&query).await?)
        })
        .await;
        let uids = self.settle(result)?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch(&mut self, uid: u32) -> Result<RawMessage> {
        self.require_selected()?;
        let limit = self.operation_timeout;
        let session = &mut self.session;
        let result = bounded(&format!("fetch uid {}", uid), limit, async move {
            Ok(session
                .uid_fetch(uid.to_string(), "(UID FLAGS INTERNALDATE BODY.PEEK[])")
                .await?
                .try_collect::<Vec<Fetch>>()
                .await?)
        })
        .await;
        let fetches: Vec<Fetch> = self.settle(result)?;

        let fetch = fetches
            .iter()
            .find(|f| f.body().is_some())
            .ok_or_else(|| TriageError::Protocol(format!("No message with uid {}", uid)))?;

        let raw = RawMessage {
            uid: fetch.uid.unwrap_or(uid),
            flags: fetch.flags().map(|f| flag_to_string(&f)).collect(),
            labels: Vec::new(),
            internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
            body: fetch.body().map(|b| b.to_vec()).unwrap_or_default(),
        };
        drop(fetches);

        let labels = if self.tracked_labels.is_empty() {
            Vec::new()
        } else {
            self.labels_for(uid).await?
        };

        Ok(RawMessage { labels, ..raw })
    }

    async fn add_flags(&mut self, uid: u32, flags: &[MessageFlag]) -> Result<()> {
        self.store(uid, format!("+FLAGS ({})", flag_list(flags))).await
    }

    async fn remove_flags(&mut self, uid: u32, flags: &[MessageFlag]) -> Result<()> {
        self.store(uid, format!("-FLAGS ({})", flag_list(flags))).await
    }

    async fn set_flags(&mut self, uid: u32, flags: &[MessageFlag]) -> Result<()> {
        self.store(uid, format!("FLAGS ({})", flag_list(flags))).await
    }

    async fn move_message(&mut self, uid: u32, destination: &str) -> Result<()> {
        self.require_selected()?;
        let limit = self.operation_timeout;
        let session = &mut self.session;
        let result = bounded(&format!("move uid {} to {}", uid, destination), limit, async move {
            Ok(session.uid_mv(uid.to_string(), destination).await?)
        })
        .await;
        self.settle(result)
    }

    async fn expunge(&mut self) -> Result<()> {
        if self.selected.is_none() {
            return Ok(());
        }
        self.live()?;
        let limit = self.operation_timeout;
        let session = &mut self.session;
        let result = bounded("expunge", limit, async move {
            Ok(session.expunge().await?.try_collect::<Vec<u32>>().await?)
        })
        .await;
        let removed = self.settle(result)?;
        debug!("Expunged {} message(s)", removed.len());
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        self.live()?;
        let limit = self.operation_timeout;
        let session = &mut self.session;
        bounded("logout", limit, async move { Ok(session.logout().await?) }).await?;
        self.selected = None;
        Ok(())
    }
}

/// Build a rustls `ClientConfig` using Mozilla's bundled root certificates.
fn tls_client_config() -> Arc<ClientConfig> {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Arc::new(config)
}

/// Opens authenticated IMAP sessions from environment credentials
pub struct ImapConnector {
    credentials: MailboxCredentials,
    tracked_labels: Vec<String>,
    connect_timeout: Duration,
    operation_timeout: Duration,
}

impl ImapConnector {
    pub fn new(
        credentials: MailboxCredentials,
        connect_timeout: Duration,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            tracked_labels: Vec::new(),
            connect_timeout,
            operation_timeout,
        }
    }

    /// Annotate fetched messages with these Gmail labels when present
    pub fn with_tracked_labels(mut self, labels: Vec<String>) -> Self {
        self.tracked_labels = labels;
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.credentials.host, self.credentials.port)
    }

    async fn open_tcp(&self) -> Result<TcpStream> {
        let addr = self.address();
        tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TriageError::Connection(format!("TCP connection to {} timed out", addr)))?
            .map_err(|e| TriageError::Connection(format!("TCP connection to {} failed: {}", addr, e)))
    }

    async fn login<S>(&self, stream: S) -> Result<async_imap::Session<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Debug + Send,
    {
        let client = async_imap::Client::new(stream);
        let login = client.login(&self.credentials.user, &self.credentials.password);
        tokio::time::timeout(self.connect_timeout, login)
            .await
            .map_err(|_| TriageError::Connection("IMAP login timed out".to_string()))?
            .map_err(|(e, _)| TriageError::Connection(format!("IMAP authentication failed: {}", e)))
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxClient>> {
        info!("Connecting to IMAP server {}...", self.address());
        let tcp_stream = self.open_tcp().await?;

        if !self.credentials.tls {
            let session = self.login(tcp_stream).await?;
            info!("Connected to {} (plaintext)", self.credentials.host);
            return Ok(Box::new(ImapMailboxClient::new(
                session,
                self.tracked_labels.clone(),
                self.operation_timeout,
            )));
        }

        let connector = TlsConnector::from(tls_client_config());
        let server_name = ServerName::try_from(self.credentials.host.clone()).map_err(|e| {
            TriageError::Connection(format!(
                "Invalid server name '{}': {}",
                self.credentials.host, e
            ))
        })?;
        let tls_stream = tokio::time::timeout(
            self.connect_timeout,
            connector.connect(server_name, tcp_stream),
        )
        .await
        .map_err(|_| TriageError::Connection("TLS handshake timed out".to_string()))?
        .map_err(|e| TriageError::Connection(format!("TLS handshake failed: {}", e)))?;

        let session = self.login(tls_stream).await?;
        info!("Connected to {}", self.credentials.host);
        Ok(Box::new(ImapMailboxClient::new(
            session,
            self.tracked_labels.clone(),
            self.operation_timeout,
        )))
    }
}
