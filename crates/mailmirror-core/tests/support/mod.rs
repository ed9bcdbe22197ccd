//! In-memory server and tag store shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mailmirror_core::{
    AccountConfig, Auth, Connector, EngineConfig, MailboxConfig, RemoteError, RemoteSession,
    RevisionCheckpoint, TagStore, TagStoreError,
};
use mailmirror_imap::{FetchedMessage, IdleEvent, Selected};
use tokio::sync::{Notify, mpsc};

/// A raw message whose canonical headers depend only on `n`.
pub fn message(n: u32, body: &str) -> Vec<u8> {
    format!(
        "From: sender{n}@example.com\r\n\
         To: me@example.com\r\n\
         Subject: message {n}\r\n\
         Date: Mon, {n} Jan 2024 10:00:00 +0000\r\n\
         Message-ID: <m{n}@example.com>\r\n\
         \r\n\
         {body}\r\n"
    )
    .into_bytes()
}

/// The part of a message a `HEADER.FIELDS (FROM DATE MESSAGE-ID)` fetch
/// returns.
fn canonical_section(raw: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(raw);
    let head = text.split("\r\n\r\n").next().unwrap_or_default();
    let mut out = String::new();
    for line in head.split("\r\n") {
        let name = line.split(':').next().unwrap_or_default().to_ascii_lowercase();
        if ["from", "date", "message-id"].contains(&name.as_str()) {
            out.push_str(line);
            out.push_str("\r\n");
        }
    }
    out.push_str("\r\n");
    out.into_bytes()
}

#[derive(Debug, Clone)]
struct Stored {
    flags: Vec<String>,
    raw: Vec<u8>,
}

#[derive(Debug, Default)]
struct ServerState {
    mailboxes: HashMap<String, BTreeMap<u32, Stored>>,
    commands: Vec<String>,
    refused: HashSet<String>,
    fail_select: HashSet<String>,
}

/// Mailboxes keyed by name, each a UID-ordered map of messages.
#[derive(Debug, Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, mailbox: &str, uid: u32, flags: &[&str], raw: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .entry(mailbox.to_string())
            .or_default()
            .insert(
                uid,
                Stored {
                    flags: flags.iter().map(|f| (*f).to_string()).collect(),
                    raw,
                },
            );
    }

    pub fn create(&self, mailbox: &str) {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .entry(mailbox.to_string())
            .or_default();
    }

    pub fn expunge(&self, mailbox: &str, uid: u32) {
        if let Some(messages) = self.state.lock().unwrap().mailboxes.get_mut(mailbox) {
            messages.remove(&uid);
        }
    }

    pub fn set_flags(&self, mailbox: &str, uid: u32, flags: &[&str]) {
        if let Some(stored) = self
            .state
            .lock()
            .unwrap()
            .mailboxes
            .get_mut(mailbox)
            .and_then(|m| m.get_mut(&uid))
        {
            stored.flags = flags.iter().map(|f| (*f).to_string()).collect();
        }
    }

    pub fn flags(&self, mailbox: &str, uid: u32) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .get(mailbox)
            .and_then(|m| m.get(&uid))
            .map(|s| s.flags.clone())
            .unwrap_or_default()
    }

    /// Makes `connect` fail for `user`.
    pub fn refuse(&self, user: &str) {
        self.state.lock().unwrap().refused.insert(user.to_string());
    }

    /// Makes `SELECT mailbox` fail.
    pub fn fail_select(&self, mailbox: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_select
            .insert(mailbox.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    pub fn session(&self) -> MockSession {
        MockSession {
            server: self.clone(),
            selected: None,
        }
    }

    fn log(&self, command: String) {
        self.state.lock().unwrap().commands.push(command);
    }

    fn messages(&self, mailbox: &str) -> Vec<(u32, Stored)> {
        self.state
            .lock()
            .unwrap()
            .mailboxes
            .get(mailbox)
            .map(|m| m.iter().map(|(uid, s)| (*uid, s.clone())).collect())
            .unwrap_or_default()
    }
}

fn uid_list(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// One session against a [`MockServer`].
#[derive(Debug)]
pub struct MockSession {
    server: MockServer,
    selected: Option<String>,
}

impl MockSession {
    fn selected(&self) -> Result<&str, RemoteError> {
        self.selected
            .as_deref()
            .ok_or_else(|| RemoteError::Other("no mailbox selected".into()))
    }

    async fn stream(
        &self,
        uids: &[u32],
        sink: &mpsc::Sender<FetchedMessage>,
        section: impl Fn(&Stored) -> Vec<u8>,
    ) -> Result<(), RemoteError> {
        let mailbox = self.selected()?;
        for (seq, (uid, stored)) in (1..).zip(self.server.messages(mailbox)) {
            if !uids.contains(&uid) {
                continue;
            }
            let message = FetchedMessage {
                seq,
                uid: Some(uid),
                flags: Some(stored.flags.clone()),
                section: Some(section(&stored)),
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

impl RemoteSession for MockSession {
    async fn select(&mut self, mailbox: &str) -> Result<Selected, RemoteError> {
        self.server.log(format!("SELECT {mailbox}"));
        if self.server.state.lock().unwrap().fail_select.contains(mailbox) {
            return Err(RemoteError::Other(format!("{mailbox} does not exist")));
        }
        let exists = u32::try_from(self.server.messages(mailbox).len()).unwrap();
        self.selected = Some(mailbox.to_string());
        Ok(Selected {
            exists,
            uid_validity: Some(1),
        })
    }

    async fn fetch_uid_flags(
        &mut self,
        exists: u32,
        sink: mpsc::Sender<FetchedMessage>,
    ) -> Result<(), RemoteError> {
        self.server.log(format!("FETCH 1:{exists}"));
        let mailbox = self.selected()?;
        for (seq, (uid, stored)) in (1..=exists).zip(self.server.messages(mailbox)) {
            let message = FetchedMessage {
                seq,
                uid: Some(uid),
                flags: Some(stored.flags),
                section: None,
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn fetch_headers(
        &mut self,
        uids: &[u32],
        sink: mpsc::Sender<FetchedMessage>,
    ) -> Result<(), RemoteError> {
        self.server.log(format!("UID FETCH {} HEADER", uid_list(uids)));
        self.stream(uids, &sink, |s| canonical_section(&s.raw)).await
    }

    async fn fetch_bodies(
        &mut self,
        uids: &[u32],
        sink: mpsc::Sender<FetchedMessage>,
    ) -> Result<(), RemoteError> {
        self.server.log(format!("UID FETCH {} BODY", uid_list(uids)));
        self.stream(uids, &sink, |s| s.raw.clone()).await
    }

    async fn store_add(&mut self, uids: &[u32], flag: &str) -> Result<(), RemoteError> {
        self.server
            .log(format!("UID STORE {} +FLAGS {flag}", uid_list(uids)));
        let mailbox = self.selected()?.to_string();
        let mut state = self.server.state.lock().unwrap();
        if let Some(messages) = state.mailboxes.get_mut(&mailbox) {
            for uid in uids {
                if let Some(stored) = messages.get_mut(uid)
                    && !stored.flags.iter().any(|f| f == flag)
                {
                    stored.flags.push(flag.to_string());
                }
            }
        }
        Ok(())
    }

    async fn idle(&mut self, stop: &Notify, keepalive: Duration) -> Result<IdleEvent, RemoteError> {
        self.server.log("IDLE".to_string());
        tokio::select! {
            () = stop.notified() => Ok(IdleEvent::Stopped),
            () = tokio::time::sleep(keepalive) => Ok(IdleEvent::Timeout),
        }
    }

    async fn logout(&mut self) -> Result<(), RemoteError> {
        self.server.log("LOGOUT".to_string());
        Ok(())
    }
}

/// Hands out sessions on one [`MockServer`].
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    pub server: MockServer,
}

impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, account: &AccountConfig) -> Result<MockSession, RemoteError> {
        if self.server.state.lock().unwrap().refused.contains(&account.user) {
            return Err(RemoteError::Other("authentication failed".into()));
        }
        self.server.log(format!("LOGIN {}", account.user));
        Ok(self.server.session())
    }
}

#[derive(Debug, Default)]
struct StoreState {
    status: Option<RevisionCheckpoint>,
    files: HashMap<String, Vec<PathBuf>>,
    queries: Vec<(String, Option<String>)>,
    batches: Vec<Vec<String>>,
    refreshes: usize,
}

/// Tag store answering queries from a fixed table.
#[derive(Debug, Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    pub fn new(identity: &str, counter: u64) -> Self {
        let store = Self::default();
        store.set_status(identity, counter);
        store
    }

    pub fn set_status(&self, identity: &str, counter: u64) {
        self.state.lock().unwrap().status = Some(RevisionCheckpoint {
            count: 0,
            identity: identity.to_string(),
            counter,
        });
    }

    /// Answers `query` with `files`.
    pub fn answer(&self, query: &str, files: Vec<PathBuf>) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(query.to_string(), files);
    }

    pub fn queries(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().unwrap().queries.clone()
    }

    /// Every line sent through `apply_batch`, in order.
    pub fn lines(&self) -> Vec<String> {
        self.state.lock().unwrap().batches.concat()
    }

    pub fn refreshes(&self) -> usize {
        self.state.lock().unwrap().refreshes
    }

    fn lookup(&self, query: &str) -> Vec<PathBuf> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(query)
            .cloned()
            .unwrap_or_default()
    }
}

impl TagStore for FakeStore {
    async fn status(&self) -> Result<RevisionCheckpoint, TagStoreError> {
        self.state
            .lock()
            .unwrap()
            .status
            .clone()
            .ok_or_else(|| TagStoreError::Output {
                command: "count --lastmod".into(),
                output: String::new(),
            })
    }

    async fn count(&self, query: &str, identity: Option<&str>) -> Result<u64, TagStoreError> {
        self.state
            .lock()
            .unwrap()
            .queries
            .push((query.to_string(), identity.map(str::to_string)));
        Ok(self.lookup(query).len() as u64)
    }

    async fn search_files(
        &self,
        query: &str,
        _identity: Option<&str>,
    ) -> Result<Vec<PathBuf>, TagStoreError> {
        Ok(self.lookup(query))
    }

    async fn refresh(&self) -> Result<(), TagStoreError> {
        self.state.lock().unwrap().refreshes += 1;
        Ok(())
    }

    async fn apply_batch(&self, lines: &[String]) -> Result<(), TagStoreError> {
        if !lines.is_empty() {
            self.state.lock().unwrap().batches.push(lines.to_vec());
        }
        Ok(())
    }
}

pub fn account(user: &str, mailboxes: &[&str]) -> AccountConfig {
    AccountConfig {
        imap_server: "imap.example.com".into(),
        tls: true,
        user: user.into(),
        auth: Auth::Plain {
            password: "pw".into(),
        },
        salt: "salt".into(),
        mailboxes: mailboxes
            .iter()
            .map(|m| MailboxConfig::Name((*m).to_string()))
            .collect(),
    }
}

pub fn engine(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(
        root.join(".index"),
        root.join("target"),
        root.join(".lastmod"),
    );
    config.write_slots = 2;
    config.poll_interval = Duration::from_millis(50);
    config.idle_keepalive = Duration::from_secs(30);
    config
}
