//! Account model types.

use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

use crate::codec;

/// Bytes of the hash kept in a mailbox identifier.
const MAILBOX_ID_BYTES: usize = 6;

/// Credentials for one account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Auth {
    /// `LOGIN` with a password.
    Plain {
        /// Password.
        password: String,
    },
    /// `AUTHENTICATE XOAUTH2` with a bearer token obtained elsewhere.
    #[serde(rename = "oauth2")]
    OAuth2 {
        /// Access token.
        access_token: String,
    },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain { .. } => f.write_str("Plain { .. }"),
            Self::OAuth2 { .. } => f.write_str("OAuth2 { .. }"),
        }
    }
}

impl Auth {
    /// The secret, whichever kind it is.
    #[must_use]
    pub fn secret(&self) -> &str {
        match self {
            Self::Plain { password } => password,
            Self::OAuth2 { access_token } => access_token,
        }
    }
}

/// A mailbox to mirror, either a bare name or a name with extra tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MailboxConfig {
    /// Just the mailbox name.
    Name(String),
    /// Name plus tags added to every message first seen here.
    Tagged {
        /// Mailbox name.
        name: String,
        /// Tags, with or without a leading `+`.
        #[serde(default)]
        tags: Vec<String>,
    },
}

impl MailboxConfig {
    /// Mailbox name on the server.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Tagged { name, .. } => name,
        }
    }

    /// Extra tags without their `+` prefix.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        match self {
            Self::Name(_) => Vec::new(),
            Self::Tagged { tags, .. } => tags
                .iter()
                .map(|t| t.trim().trim_start_matches('+').to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }
}

/// One remote account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// `host` or `host:port`; the port defaults to 993.
    pub imap_server: String,
    /// Use implicit TLS.
    #[serde(default = "default_tls")]
    pub tls: bool,
    /// Login name, also used as the address in mailbox identifiers.
    pub user: String,
    /// Credentials.
    pub auth: Auth,
    /// Mixed into mailbox identifiers.
    #[serde(default)]
    pub salt: String,
    /// Mailboxes to mirror. The first one is watched in live mode.
    pub mailboxes: Vec<MailboxConfig>,
}

const fn default_tls() -> bool {
    true
}

impl AccountConfig {
    /// Identifier of one of this account's mailboxes.
    #[must_use]
    pub fn mailbox_id(&self, mailbox: &str) -> String {
        mailbox_id(mailbox, &self.user, &self.salt)
    }
}

/// Stable identifier for a mailbox, used as its index file name: the hex
/// form of the first six bytes of `sha1(mailbox || address || salt)`.
#[must_use]
pub fn mailbox_id(mailbox: &str, address: &str, salt: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(mailbox.as_bytes());
    hasher.update(address.as_bytes());
    hasher.update(salt.as_bytes());
    codec::to_hex(&hasher.finalize()[..MAILBOX_ID_BYTES])
}
