//! The remote mailbox seam.
//!
//! [`RemoteSession`] is everything reconciliation needs from a server
//! connection. It is implemented for [`mailmirror_imap::Session`] and by
//! scripted fakes in tests.

use std::future::Future;
use std::time::Duration;

use mailmirror_imap::{
    FetchedMessage, IdleEvent, ImapStream, Selected, Session, UidSet, connect_plain, connect_tls,
    split_server,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};
use tracing::info;

use crate::account::{AccountConfig, Auth};

/// Items fetched for messages not yet in the index.
pub const HEADER_ITEMS: &str = "UID FLAGS BODY.PEEK[HEADER.FIELDS (FROM DATE MESSAGE-ID)]";

/// Items fetched for messages not yet archived.
pub const BODY_ITEMS: &str = "UID BODY.PEEK[]";

/// Remote failures.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The IMAP layer failed.
    #[error(transparent)]
    Imap(#[from] mailmirror_imap::Error),

    /// Any other failure, e.g. from a test double.
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// True when the connection cannot be used any more.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        match self {
            Self::Imap(e) => e.is_connection_lost(),
            Self::Other(_) => false,
        }
    }
}

/// Commands issued against one server connection. Fetch results are
/// streamed into `sink`, which is dropped when the command completes.
pub trait RemoteSession: Send {
    /// Selects a mailbox.
    fn select(&mut self, mailbox: &str)
    -> impl Future<Output = Result<Selected, RemoteError>> + Send;

    /// Streams UID and flags for sequence numbers `1..=exists`.
    fn fetch_uid_flags(
        &mut self,
        exists: u32,
        sink: mpsc::Sender<FetchedMessage>,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Streams UID, flags and the canonical header fields for `uids`.
    fn fetch_headers(
        &mut self,
        uids: &[u32],
        sink: mpsc::Sender<FetchedMessage>,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Streams UID and the complete message for `uids`.
    fn fetch_bodies(
        &mut self,
        uids: &[u32],
        sink: mpsc::Sender<FetchedMessage>,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Adds `flag` to every message in `uids`.
    fn store_add(
        &mut self,
        uids: &[u32],
        flag: &str,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Waits in IDLE until a push event, a stop request or the keepalive.
    fn idle(
        &mut self,
        stop: &Notify,
        keepalive: Duration,
    ) -> impl Future<Output = Result<IdleEvent, RemoteError>> + Send;

    /// Ends the session.
    fn logout(&mut self) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

impl<S> RemoteSession for Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn select(&mut self, mailbox: &str) -> Result<Selected, RemoteError> {
        Ok(Self::select(self, mailbox).await?)
    }

    async fn fetch_uid_flags(
        &mut self,
        exists: u32,
        sink: mpsc::Sender<FetchedMessage>,
    ) -> Result<(), RemoteError> {
        Ok(Self::fetch_uid_flags(self, exists, &sink).await?)
    }

    async fn fetch_headers(
        &mut self,
        uids: &[u32],
        sink: mpsc::Sender<FetchedMessage>,
    ) -> Result<(), RemoteError> {
        Ok(self
            .uid_fetch(&UidSet::from_uids(uids), HEADER_ITEMS, &sink)
            .await?)
    }

    async fn fetch_bodies(
        &mut self,
        uids: &[u32],
        sink: mpsc::Sender<FetchedMessage>,
    ) -> Result<(), RemoteError> {
        Ok(self
            .uid_fetch(&UidSet::from_uids(uids), BODY_ITEMS, &sink)
            .await?)
    }

    async fn store_add(&mut self, uids: &[u32], flag: &str) -> Result<(), RemoteError> {
        Ok(self.uid_store_add(&UidSet::from_uids(uids), flag).await?)
    }

    async fn idle(&mut self, stop: &Notify, keepalive: Duration) -> Result<IdleEvent, RemoteError> {
        Ok(Self::idle(self, stop, keepalive).await?)
    }

    async fn logout(&mut self) -> Result<(), RemoteError> {
        Ok(Self::logout(self).await?)
    }
}

/// Opens authenticated sessions for an account.
pub trait Connector: Send + Sync + 'static {
    /// Session type produced.
    type Session: RemoteSession + 'static;

    /// Connects and authenticates.
    fn connect(
        &self,
        account: &AccountConfig,
    ) -> impl Future<Output = Result<Self::Session, RemoteError>> + Send;
}

/// Connects over TCP, with TLS unless the account disables it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImapConnector;

impl Connector for ImapConnector {
    type Session = Session<ImapStream>;

    async fn connect(&self, account: &AccountConfig) -> Result<Self::Session, RemoteError> {
        let (host, port) = split_server(&account.imap_server);
        let stream = if account.tls {
            connect_tls(host, port).await?
        } else {
            connect_plain(host, port).await?
        };

        let mut session = Session::from_stream(stream).await?;
        match &account.auth {
            Auth::Plain { password } => session.login(&account.user, password).await?,
            Auth::OAuth2 { access_token } => {
                session
                    .authenticate_xoauth2(&account.user, access_token)
                    .await?;
            }
        }
        info!(server = %account.imap_server, user = %account.user, "connected");
        Ok(session)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    #[tokio::test]
    async fn header_fetch_uses_compact_uid_set() {
        let (client, server) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"* OK ready\r\n").await.unwrap();

            let command = lines.next_line().await.unwrap().unwrap();
            write
                .write_all(
                    b"* 1 FETCH (UID 4 FLAGS (\\Seen) BODY[HEADER.FIELDS (FROM DATE MESSAGE-ID)] {11}\r\n\
From: a\r\n\r\n)\r\nA0000 OK done\r\n",
                )
                .await
                .unwrap();
            command
        });

        let mut session = Session::from_stream(client).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        RemoteSession::fetch_headers(&mut session, &[6, 4, 5], tx)
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.uid, Some(4));
        assert_eq!(message.section.as_deref(), Some(&b"From: a\r\n\r\n"[..]));
        assert!(rx.recv().await.is_none());
        assert_eq!(
            server.await.unwrap(),
            "A0000 UID FETCH 4:6 (UID FLAGS BODY.PEEK[HEADER.FIELDS (FROM DATE MESSAGE-ID)])"
        );
    }

    #[test]
    fn connection_loss_classification() {
        assert!(RemoteError::Imap(mailmirror_imap::Error::Bye("bye".into())).is_connection_lost());
        assert!(!RemoteError::Imap(mailmirror_imap::Error::No("no".into())).is_connection_lost());
        assert!(!RemoteError::Other("x".into()).is_connection_lost());
    }
}
