//! Mailbox access.
//!
//! [`MailSource`] is the handful of mailbox operations a run needs. [`ImapConnector`] opens
//! real IMAP sessions over implicit TLS; [`InMemoryMailbox`] keeps messages in memory and is
//! what the tests drive.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_imap::{Client, Session, types::Fetch};
use async_trait::async_trait;
use futures::TryStreamExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::{net::TcpStream, sync::Mutex, time::timeout};
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::{debug, info, instrument};

use super::IngestError;
use crate::config::ImapConfig;

/// An open mailbox, selected and ready for the run.
#[async_trait]
pub trait MailSource: Send {
    /// Name of the mailbox being polled, recorded on runs and logs.
    fn mailbox(&self) -> &str;

    /// UIDs of the messages waiting in the mailbox, ascending, at most `limit`. Messages left
    /// in place and flagged `\Seen` by earlier runs are not waiting.
    async fn list_uids(&mut self, limit: usize) -> Result<Vec<u32>, IngestError>;

    /// Raw RFC 822 bytes, without setting `\Seen`.
    async fn fetch(&mut self, uid: u32) -> Result<Vec<u8>, IngestError>;

    /// Move to the processed mailbox, or flag `\Seen` in place when there is none.
    async fn mark_processed(&mut self, uid: u32) -> Result<(), IngestError>;

    /// Move to the failed mailbox. Without one the message stays for the next run, unless this
    /// was its last attempt, in which case it is flagged `\Seen`.
    async fn mark_failed(&mut self, uid: u32, final_attempt: bool) -> Result<(), IngestError>;

    async fn close(self: Box<Self>) -> Result<(), IngestError>;
}

#[async_trait]
pub trait MailSourceConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailSource>, IngestError>;
}

type ImapSession = Session<TlsStream<TcpStream>>;

/// `UID SEARCH` criteria for waiting messages. When every message leaves the mailbox after a
/// run, anything still there is waiting; otherwise kept messages are told apart by `\Seen`.
fn waiting_criteria(processed_mailbox: Option<&str>, failed_mailbox: Option<&str>) -> &'static str {
    match (processed_mailbox, failed_mailbox) {
        (Some(_), Some(_)) => "UNDELETED",
        _ => "UNSEEN UNDELETED",
    }
}

/// Connects to the configured IMAP account.
pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

async fn bounded<T, E: std::fmt::Display>(
    limit: Duration,
    command: &'static str,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, IngestError> {
    timeout(limit, fut)
        .await
        .map_err(|_| IngestError::Timeout(command))?
        .map_err(|e| IngestError::Imap {
            command,
            message: e.to_string(),
        })
}

#[async_trait]
impl MailSourceConnector for ImapConnector {
    #[instrument(skip(self), fields(host = %self.config.host, mailbox = %self.config.mailbox), err)]
    async fn connect(&self) -> Result<Box<dyn MailSource>, IngestError> {
        let config = &self.config;

        let tcp = timeout(config.connect_timeout, TcpStream::connect((config.host.as_str(), config.port)))
            .await
            .map_err(|_| IngestError::Timeout("connect"))?
            .map_err(|e| IngestError::Connect(e.to_string()))?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name =
            ServerName::try_from(config.host.clone()).map_err(|_| IngestError::Connect(format!("invalid host name '{}'", config.host)))?;
        let tls = timeout(config.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| IngestError::Timeout("TLS handshake"))?
            .map_err(|e| IngestError::Connect(format!("TLS handshake failed: {e}")))?;

        let mut client = Client::new(tls);
        let greeting = bounded(config.connect_timeout, "greeting", client.read_response()).await?;
        if greeting.is_none() {
            return Err(IngestError::Connect("server closed the connection before greeting".to_string()));
        }

        let mut session = timeout(config.command_timeout, client.login(&config.username, &config.password))
            .await
            .map_err(|_| IngestError::Timeout("LOGIN"))?
            .map_err(|(e, _)| IngestError::Imap {
                command: "LOGIN",
                message: e.to_string(),
            })?;

        let capabilities = bounded(config.command_timeout, "CAPABILITY", session.capabilities()).await?;
        let supports_move = capabilities.has_str("MOVE");
        let supports_uidplus = capabilities.has_str("UIDPLUS");

        bounded(config.command_timeout, "SELECT", session.select(&config.mailbox)).await?;
        info!(supports_move, "IMAP session ready");

        Ok(Box::new(ImapMailSource {
            session,
            config: config.clone(),
            supports_move,
            supports_uidplus,
        }))
    }
}

struct ImapMailSource {
    session: ImapSession,
    config: ImapConfig,
    supports_move: bool,
    supports_uidplus: bool,
}

impl ImapMailSource {
    async fn store_flag(&mut self, uid: u32, flag: &str) -> Result<(), IngestError> {
        let limit = self.config.command_timeout;
        let stream = bounded(limit, "UID STORE", self.session.uid_store(uid.to_string(), format!("+FLAGS.SILENT ({flag})"))).await?;
        let _: Vec<Fetch> = bounded(limit, "UID STORE", stream.try_collect()).await?;
        Ok(())
    }

    async fn move_to(&mut self, uid: u32, target: &str) -> Result<(), IngestError> {
        let limit = self.config.command_timeout;
        if self.supports_move {
            return bounded(limit, "UID MOVE", self.session.uid_mv(uid.to_string(), target)).await;
        }

        bounded(limit, "UID COPY", self.session.uid_copy(uid.to_string(), target)).await?;
        self.store_flag(uid, "\\Deleted").await?;
        if self.supports_uidplus {
            let stream = bounded(limit, "UID EXPUNGE", self.session.uid_expunge(uid.to_string())).await?;
            let _: Vec<u32> = bounded(limit, "UID EXPUNGE", stream.try_collect()).await?;
        } else {
            let stream = bounded(limit, "EXPUNGE", self.session.expunge()).await?;
            let _: Vec<u32> = bounded(limit, "EXPUNGE", stream.try_collect()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MailSource for ImapMailSource {
    fn mailbox(&self) -> &str {
        &self.config.mailbox
    }

    async fn list_uids(&mut self, limit: usize) -> Result<Vec<u32>, IngestError> {
        let criteria = waiting_criteria(self.config.processed_mailbox.as_deref(), self.config.failed_mailbox.as_deref());
        let found = bounded(self.config.command_timeout, "UID SEARCH", self.session.uid_search(criteria)).await?;
        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable();
        uids.truncate(limit);
        Ok(uids)
    }

    async fn fetch(&mut self, uid: u32) -> Result<Vec<u8>, IngestError> {
        let limit = self.config.command_timeout;
        let stream = bounded(limit, "UID FETCH", self.session.uid_fetch(uid.to_string(), "BODY.PEEK[]")).await?;
        let fetches: Vec<Fetch> = bounded(limit, "UID FETCH", stream.try_collect()).await?;
        fetches
            .iter()
            .find_map(|fetch| fetch.body())
            .map(<[u8]>::to_vec)
            .ok_or(IngestError::MissingMessage { uid })
    }

    async fn mark_processed(&mut self, uid: u32) -> Result<(), IngestError> {
        match self.config.processed_mailbox.clone() {
            Some(target) => self.move_to(uid, &target).await,
            None => self.store_flag(uid, "\\Seen").await,
        }
    }

    async fn mark_failed(&mut self, uid: u32, final_attempt: bool) -> Result<(), IngestError> {
        match self.config.failed_mailbox.clone() {
            Some(target) => self.move_to(uid, &target).await,
            None if final_attempt => self.store_flag(uid, "\\Seen").await,
            None => Ok(()),
        }
    }

    async fn close(mut self: Box<Self>) -> Result<(), IngestError> {
        bounded(self.config.command_timeout, "LOGOUT", self.session.logout()).await
    }
}

#[derive(Debug)]
struct StoredMessage {
    raw: Vec<u8>,
    seen: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_uid: u32,
    inbox: BTreeMap<u32, StoredMessage>,
    processed: Vec<Vec<u8>>,
    failed: Vec<Vec<u8>>,
}

/// A mailbox held in memory. Clones share the same messages.
///
/// Like [`ImapConfig`], it moves processed and failed messages out by default. Without a
/// target they stay in the inbox and are flagged `\Seen` instead.
#[derive(Clone)]
pub struct InMemoryMailbox {
    name: String,
    moves_processed: bool,
    moves_failed: bool,
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryMailbox {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            moves_processed: true,
            moves_failed: true,
            state: Arc::default(),
        }
    }

    /// Flag processed messages `\Seen` in place instead of moving them.
    pub fn without_processed_mailbox(mut self) -> Self {
        self.moves_processed = false;
        self
    }

    /// Leave failed messages in place instead of moving them.
    pub fn without_failed_mailbox(mut self) -> Self {
        self.moves_failed = false;
        self
    }

    /// Drop a message into the inbox, returning its UID.
    pub async fn deliver(&self, raw: impl Into<Vec<u8>>) -> u32 {
        let mut state = self.state.lock().await;
        state.next_uid += 1;
        let uid = state.next_uid;
        state.inbox.insert(uid, StoredMessage { raw: raw.into(), seen: false });
        uid
    }

    /// Messages still in the inbox, seen or not.
    pub async fn inbox_len(&self) -> usize {
        self.state.lock().await.inbox.len()
    }

    pub async fn seen_len(&self) -> usize {
        self.state.lock().await.inbox.values().filter(|m| m.seen).count()
    }

    pub async fn processed_len(&self) -> usize {
        self.state.lock().await.processed.len()
    }

    pub async fn failed_len(&self) -> usize {
        self.state.lock().await.failed.len()
    }
}

impl MemoryState {
    fn mark_seen(&mut self, uid: u32) -> Result<(), IngestError> {
        let message = self.inbox.get_mut(&uid).ok_or(IngestError::MissingMessage { uid })?;
        message.seen = true;
        Ok(())
    }

    fn take(&mut self, uid: u32) -> Result<Vec<u8>, IngestError> {
        self.inbox
            .remove(&uid)
            .map(|message| message.raw)
            .ok_or(IngestError::MissingMessage { uid })
    }
}

#[async_trait]
impl MailSourceConnector for InMemoryMailbox {
    async fn connect(&self) -> Result<Box<dyn MailSource>, IngestError> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl MailSource for InMemoryMailbox {
    fn mailbox(&self) -> &str {
        &self.name
    }

    async fn list_uids(&mut self, limit: usize) -> Result<Vec<u32>, IngestError> {
        let state = self.state.lock().await;
        Ok(state.inbox.iter().filter(|(_, m)| !m.seen).map(|(uid, _)| *uid).take(limit).collect())
    }

    async fn fetch(&mut self, uid: u32) -> Result<Vec<u8>, IngestError> {
        self.state
            .lock()
            .await
            .inbox
            .get(&uid)
            .map(|message| message.raw.clone())
            .ok_or(IngestError::MissingMessage { uid })
    }

    async fn mark_processed(&mut self, uid: u32) -> Result<(), IngestError> {
        let mut state = self.state.lock().await;
        if !self.moves_processed {
            return state.mark_seen(uid);
        }
        let raw = state.take(uid)?;
        state.processed.push(raw);
        Ok(())
    }

    async fn mark_failed(&mut self, uid: u32, final_attempt: bool) -> Result<(), IngestError> {
        let mut state = self.state.lock().await;
        match (self.moves_failed, final_attempt) {
            (true, _) => {
                let raw = state.take(uid)?;
                state.failed.push(raw);
                Ok(())
            }
            (false, true) => state.mark_seen(uid),
            (false, false) => Ok(()),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), IngestError> {
        debug!(mailbox = %self.name, "In-memory mailbox closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_criteria() {
        assert_eq!(waiting_criteria(Some("Done"), Some("Failed")), "UNDELETED");
        assert_eq!(waiting_criteria(None, Some("Failed")), "UNSEEN UNDELETED");
        assert_eq!(waiting_criteria(Some("Done"), None), "UNSEEN UNDELETED");
        assert_eq!(waiting_criteria(None, None), "UNSEEN UNDELETED");
    }

    #[tokio::test]
    async fn test_in_memory_mailbox_moves_messages() {
        let mailbox = InMemoryMailbox::new("INBOX");
        let first = mailbox.deliver(b"first".to_vec()).await;
        let second = mailbox.deliver(b"second".to_vec()).await;
        let third = mailbox.deliver(b"third".to_vec()).await;

        let mut source = mailbox.connect().await.unwrap();
        assert_eq!(source.mailbox(), "INBOX");
        assert_eq!(source.list_uids(2).await.unwrap(), vec![first, second]);
        assert_eq!(source.fetch(second).await.unwrap(), b"second".to_vec());

        source.mark_processed(first).await.unwrap();
        source.mark_failed(second, false).await.unwrap();
        assert!(matches!(source.fetch(first).await, Err(IngestError::MissingMessage { .. })));
        assert_eq!(source.list_uids(10).await.unwrap(), vec![third]);
        source.close().await.unwrap();

        assert_eq!(mailbox.inbox_len().await, 1);
        assert_eq!(mailbox.processed_len().await, 1);
        assert_eq!(mailbox.failed_len().await, 1);
    }

    #[tokio::test]
    async fn test_in_memory_mailbox_keeps_messages_in_place() {
        let mailbox = InMemoryMailbox::new("INBOX").without_processed_mailbox().without_failed_mailbox();
        let done = mailbox.deliver(b"done".to_vec()).await;
        let retry = mailbox.deliver(b"retry".to_vec()).await;
        let hopeless = mailbox.deliver(b"hopeless".to_vec()).await;
        let fresh = mailbox.deliver(b"fresh".to_vec()).await;

        let mut source = mailbox.connect().await.unwrap();
        source.mark_processed(done).await.unwrap();
        source.mark_failed(retry, false).await.unwrap();
        source.mark_failed(hopeless, true).await.unwrap();

        // Seen messages no longer take up the per-run limit
        assert_eq!(source.list_uids(2).await.unwrap(), vec![retry, fresh]);
        assert_eq!(mailbox.inbox_len().await, 4);
        assert_eq!(mailbox.seen_len().await, 2);
        assert_eq!(mailbox.processed_len().await, 0);
        assert_eq!(mailbox.failed_len().await, 0);
    }
}
