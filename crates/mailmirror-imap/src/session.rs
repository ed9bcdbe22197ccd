//! An authenticated IMAP session.
//!
//! [`Session`] issues one command at a time and blocks until the tagged
//! completion arrives. `FETCH` results are streamed to an mpsc channel as
//! they are parsed, so a consumer can start hashing or writing before the
//! whole command has completed.

#![allow(clippy::missing_errors_doc)]

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};

use crate::auth::{quote, xoauth2_response};
use crate::framed::FramedStream;
use crate::response::{self, FetchedMessage, Response, Status, Untagged, uid_validity};
use crate::tag::TagGenerator;
use crate::uid_set::UidSet;
use crate::{Error, Result};

/// Result of selecting a mailbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selected {
    /// Number of messages in the mailbox.
    pub exists: u32,
    /// UID validity epoch, when the server reports it.
    pub uid_validity: Option<u32>,
}

/// Why an IDLE wait ended. The session has always left IDLE again when
/// one of these is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// New message count.
    Exists(u32),
    /// Message with this sequence number was expunged.
    Expunge(u32),
    /// Flags changed on this sequence number.
    Fetch(u32),
    /// Keepalive expired, or the server ended IDLE on its own.
    Timeout,
    /// Stop was requested through the notifier.
    Stopped,
}

enum Wake {
    Stop,
    Keepalive,
    Readable(Result<()>),
}

/// A connected IMAP session.
pub struct Session<S> {
    stream: FramedStream<S>,
    tags: TagGenerator,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a connected stream and reads the server greeting.
    pub async fn from_stream(stream: S) -> Result<Self> {
        let mut stream = FramedStream::new(stream);
        let greeting = stream.read_response().await?;

        match response::parse(&greeting)? {
            Response::Untagged(Untagged::Status {
                status: Status::Ok | Status::PreAuth,
                ..
            }) => Ok(Self {
                stream,
                tags: TagGenerator::default(),
            }),
            Response::Untagged(Untagged::Status {
                status: Status::Bye,
                text,
                ..
            }) => Err(Error::Bye(text)),
            other => Err(Error::Protocol(format!("unexpected greeting: {other:?}"))),
        }
    }

    /// Authenticates with LOGIN.
    pub async fn login(&mut self, user: &str, password: &str) -> Result<()> {
        let command = format!("LOGIN {} {}", quote(user), quote(password));
        self.execute(&command, None).await.map_err(auth_error)?;
        debug!(user, "logged in");
        Ok(())
    }

    /// Authenticates with `AUTHENTICATE XOAUTH2`, sending the token as
    /// the initial response.
    pub async fn authenticate_xoauth2(&mut self, user: &str, token: &str) -> Result<()> {
        let tag = self.tags.next();
        let command = format!(
            "{tag} AUTHENTICATE XOAUTH2 {}\r\n",
            xoauth2_response(user, token)
        );
        self.stream.write_command(command.as_bytes()).await?;

        loop {
            let raw = self.stream.read_response().await?;
            match response::parse(&raw)? {
                // The server explains a rejection in a challenge and
                // expects an empty response before the tagged NO.
                Response::Continuation(_) => self.stream.write_command(b"\r\n").await?,
                Response::Tagged {
                    tag: done,
                    status,
                    text,
                } if done == tag => {
                    status.check(text).map_err(auth_error)?;
                    debug!(user, "authenticated with XOAUTH2");
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Selects a mailbox read-write.
    pub async fn select(&mut self, mailbox: &str) -> Result<Selected> {
        let untagged = self
            .execute(&format!("SELECT {}", quote(mailbox)), None)
            .await?;

        let mut selected = Selected::default();
        for data in untagged {
            match data {
                Untagged::Exists(n) => selected.exists = n,
                Untagged::Status {
                    code: Some(code), ..
                } => {
                    if let Some(validity) = uid_validity(&code) {
                        selected.uid_validity = Some(validity);
                    }
                }
                _ => {}
            }
        }
        Ok(selected)
    }

    /// Streams `(UID FLAGS)` for sequence numbers `1..=exists`.
    pub async fn fetch_uid_flags(
        &mut self,
        exists: u32,
        sink: &mpsc::Sender<FetchedMessage>,
    ) -> Result<()> {
        if exists == 0 {
            return Ok(());
        }
        self.execute(&format!("FETCH 1:{exists} (UID FLAGS)"), Some(sink))
            .await
            .map(drop)
    }

    /// Streams `UID FETCH <uids> (<items>)`.
    pub async fn uid_fetch(
        &mut self,
        uids: &UidSet,
        items: &str,
        sink: &mpsc::Sender<FetchedMessage>,
    ) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        self.execute(&format!("UID FETCH {uids} ({items})"), Some(sink))
            .await
            .map(drop)
    }

    /// Adds one flag to every UID in the set.
    pub async fn uid_store_add(&mut self, uids: &UidSet, flag: &str) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        self.execute(&format!("UID STORE {uids} +FLAGS.SILENT ({flag})"), None)
            .await
            .map(drop)
    }

    /// Enters IDLE and waits for a push event, a stop request or the
    /// keepalive deadline, then leaves IDLE with `DONE`.
    ///
    /// A stop requested before this call is observed immediately, because
    /// [`Notify::notify_one`] stores a permit.
    pub async fn idle(&mut self, stop: &Notify, keepalive: Duration) -> Result<IdleEvent> {
        let tag = self.tags.next();
        self.stream
            .write_command(format!("{tag} IDLE\r\n").as_bytes())
            .await?;

        loop {
            let raw = self.stream.read_response().await?;
            match response::parse(&raw)? {
                Response::Continuation(_) => break,
                Response::Tagged {
                    tag: done,
                    status,
                    text,
                } if done == tag => {
                    status.check(text)?;
                    return Err(Error::Protocol(
                        "IDLE completed without continuation".to_string(),
                    ));
                }
                Response::Untagged(Untagged::Status {
                    status: Status::Bye,
                    text,
                    ..
                }) => return Err(Error::Bye(text)),
                _ => {}
            }
        }
        trace!(%tag, "idling");

        let deadline = Instant::now() + keepalive;
        let event = loop {
            let wake = tokio::select! {
                biased;
                () = stop.notified() => Wake::Stop,
                () = sleep_until(deadline) => Wake::Keepalive,
                ready = self.stream.wait_readable() => Wake::Readable(ready),
            };

            match wake {
                Wake::Stop => break IdleEvent::Stopped,
                Wake::Keepalive => break IdleEvent::Timeout,
                Wake::Readable(ready) => {
                    ready?;
                    let raw = self.stream.read_response().await?;
                    match response::parse(&raw)? {
                        Response::Untagged(Untagged::Exists(n)) => break IdleEvent::Exists(n),
                        Response::Untagged(Untagged::Expunge(n)) => break IdleEvent::Expunge(n),
                        Response::Untagged(Untagged::Fetch(message)) => {
                            break IdleEvent::Fetch(message.seq);
                        }
                        Response::Untagged(Untagged::Status {
                            status: Status::Bye,
                            text,
                            ..
                        }) => return Err(Error::Bye(text)),
                        Response::Tagged {
                            tag: done,
                            status,
                            text,
                        } if done == tag => {
                            status.check(text)?;
                            return Ok(IdleEvent::Timeout);
                        }
                        _ => {}
                    }
                }
            }
        };

        self.stream.write_command(b"DONE\r\n").await?;
        loop {
            let raw = self.stream.read_response().await?;
            if let Response::Tagged {
                tag: done,
                status,
                text,
            } = response::parse(&raw)?
                && done == tag
            {
                status.check(text)?;
                trace!(%tag, ?event, "left idle");
                return Ok(event);
            }
        }
    }

    /// Sends LOGOUT. A BYE without a tagged completion is accepted.
    pub async fn logout(&mut self) -> Result<()> {
        match self.execute("LOGOUT", None).await {
            Ok(_) | Err(Error::Bye(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Runs one command to completion.
    ///
    /// `FETCH` data goes to `sink` when one is given and is returned with
    /// the other untagged data otherwise. A response that fails to parse
    /// is reported only after the tagged completion has been read, so the
    /// session stays usable.
    async fn execute(
        &mut self,
        command: &str,
        sink: Option<&mpsc::Sender<FetchedMessage>>,
    ) -> Result<Vec<Untagged>> {
        let tag = self.tags.next();
        let verb = command.split(' ').next().unwrap_or_default();
        trace!(%tag, verb, "sending command");
        self.stream
            .write_command(format!("{tag} {command}\r\n").as_bytes())
            .await?;

        let mut untagged = Vec::new();
        let mut parse_failure = None;
        let mut bye = None;
        let mut sink_closed = false;

        loop {
            let raw = match self.stream.read_response().await {
                Ok(raw) => raw,
                Err(e) => return Err(bye.map_or(e, Error::Bye)),
            };
            let parsed = match response::parse(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(%tag, error = %e, "unparseable response");
                    parse_failure.get_or_insert(e);
                    continue;
                }
            };

            match parsed {
                Response::Tagged {
                    tag: done,
                    status,
                    text,
                } if done == tag => {
                    status.check(text)?;
                    return match parse_failure {
                        Some(e) => Err(e),
                        None => Ok(untagged),
                    };
                }
                Response::Tagged { tag: other, .. } => {
                    return Err(Error::Protocol(format!(
                        "completion for unknown tag {other}"
                    )));
                }
                Response::Continuation(_) => {
                    return Err(Error::Protocol(format!(
                        "unexpected continuation during {verb}"
                    )));
                }
                Response::Untagged(Untagged::Status {
                    status: Status::Bye,
                    text,
                    ..
                }) => bye = Some(text),
                Response::Untagged(Untagged::Fetch(message)) => match sink {
                    Some(tx) if !sink_closed => {
                        if tx.send(message).await.is_err() {
                            debug!(%tag, "fetch receiver dropped, draining");
                            sink_closed = true;
                        }
                    }
                    Some(_) => {}
                    None => untagged.push(Untagged::Fetch(message)),
                },
                Response::Untagged(data) => untagged.push(data),
            }
        }
    }
}

fn auth_error(e: Error) -> Error {
    match e {
        Error::No(text) | Error::Bad(text) => Error::Auth(text),
        other => other,
    }
}
