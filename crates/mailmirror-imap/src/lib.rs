//! # mailmirror-imap
//!
//! The slice of IMAP that a mirroring engine needs, over tokio and rustls.
//!
//! - **Streaming fetch**: `FETCH` results are parsed one response at a time
//!   and pushed to an mpsc channel, literals included
//! - **UID-scoped commands**: `UID FETCH` and `UID STORE +FLAGS` take a
//!   compact [`UidSet`]
//! - **Stoppable IDLE**: [`Session::idle`] races push events against a
//!   [`tokio::sync::Notify`] stop signal and a keepalive deadline, and
//!   always leaves IDLE with `DONE` before returning
//! - **TLS via rustls**: no OpenSSL dependency
//!
//! ```ignore
//! use mailmirror_imap::{Session, UidSet, connect_tls};
//!
//! let stream = connect_tls("imap.example.com", 993).await?;
//! let mut session = Session::from_stream(stream).await?;
//! session.login("me@example.com", "secret").await?;
//! let selected = session.select("INBOX").await?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! session.fetch_uid_flags(selected.exists, &tx).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod auth;
mod error;
pub mod framed;
pub mod lexer;
pub mod response;
pub mod session;
pub mod stream;
mod tag;
mod uid_set;

pub use error::{Error, Result};
pub use response::FetchedMessage;
pub use session::{IdleEvent, Selected, Session};
pub use stream::{ImapStream, connect_plain, connect_tls, split_server};
pub use tag::TagGenerator;
pub use uid_set::UidSet;
