//! Engine and settings-file configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::account::{AccountConfig, validate_account};
use crate::flags::FlagTable;
use crate::{Error, Result};

/// Default number of concurrent archive writes.
pub const DEFAULT_WRITE_SLOTS: usize = 4;

/// Default cadence for polling the tag store in live mode.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default IDLE keepalive, well below the 29 minutes servers may allow.
pub const DEFAULT_IDLE_KEEPALIVE: Duration = Duration::from_secs(600);

/// Contents of the JSON settings file. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding one index file per mailbox.
    pub index_dir: Option<PathBuf>,
    /// Archive root.
    pub archive_dir: Option<PathBuf>,
    /// Revision checkpoint file.
    pub checkpoint_file: Option<PathBuf>,
    /// `notmuch` executable.
    pub notmuch: PathBuf,
    /// Concurrent archive writes.
    pub write_slots: usize,
    /// Live-mode tag store poll interval, in seconds.
    pub poll_interval_secs: u64,
    /// IDLE keepalive, in seconds.
    pub idle_keepalive_secs: u64,
    /// Accounts to mirror.
    pub accounts: Vec<AccountConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            index_dir: None,
            archive_dir: None,
            checkpoint_file: None,
            notmuch: PathBuf::from("notmuch"),
            write_slots: DEFAULT_WRITE_SLOTS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            idle_keepalive_secs: DEFAULT_IDLE_KEEPALIVE.as_secs(),
            accounts: Vec::new(),
        }
    }
}

impl Settings {
    /// Reads and validates a settings file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file cannot be read and
    /// [`Error::Config`] if it does not parse or validate.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::storage(path, e))?;
        let settings = Self::from_json(&contents)?;
        debug!(path = %path.display(), accounts = settings.accounts.len(), "loaded settings");
        Ok(settings)
    }

    /// Parses and validates settings JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem.
    pub fn from_json(contents: &str) -> Result<Self> {
        let settings: Self =
            serde_json::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks every account and the numeric settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] listing the problems found.
    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            return Err(Error::Config("no accounts configured".into()));
        }
        if self.write_slots == 0 {
            return Err(Error::Config("write_slots must be at least 1".into()));
        }
        if self.idle_keepalive_secs == 0 || self.poll_interval_secs == 0 {
            return Err(Error::Config("intervals must be at least one second".into()));
        }

        let problems: Vec<String> = self
            .accounts
            .iter()
            .enumerate()
            .filter_map(|(n, account)| {
                validate_account(account).err().map(|errors| {
                    let list: Vec<String> = errors
                        .iter()
                        .map(|e| format!("{}: {e}", e.field()))
                        .collect();
                    format!("account {n} ({}): {}", account.user, list.join(", "))
                })
            })
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

/// Resolved engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Directory holding one index file per mailbox.
    pub index_dir: PathBuf,
    /// Archive root.
    pub archive_dir: PathBuf,
    /// Revision checkpoint file.
    pub checkpoint_file: PathBuf,
    /// Concurrent archive writes.
    pub write_slots: usize,
    /// Live-mode tag store poll interval.
    pub poll_interval: Duration,
    /// IDLE keepalive.
    pub idle_keepalive: Duration,
    /// Flag and tag mapping.
    pub flag_table: FlagTable,
}

impl EngineConfig {
    /// Configuration with default tuning for the given locations.
    pub fn new(
        index_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        checkpoint_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            index_dir: index_dir.into(),
            archive_dir: archive_dir.into(),
            checkpoint_file: checkpoint_file.into(),
            write_slots: DEFAULT_WRITE_SLOTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            idle_keepalive: DEFAULT_IDLE_KEEPALIVE,
            flag_table: FlagTable::default(),
        }
    }

    /// Applies the tuning values of a settings file.
    #[must_use]
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.write_slots = settings.write_slots.max(1);
        self.poll_interval = Duration::from_secs(settings.poll_interval_secs.max(1));
        self.idle_keepalive = Duration::from_secs(settings.idle_keepalive_secs.max(1));
        self
    }

    /// Index file of one mailbox.
    #[must_use]
    pub fn index_path(&self, mailbox_id: &str) -> PathBuf {
        self.index_dir.join(mailbox_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "accounts": [{
            "imap_server": "imap.example.com",
            "user": "me@example.com",
            "auth": { "type": "plain", "password": "pw" },
            "mailboxes": ["INBOX"]
        }]
    }"#;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings = Settings::from_json(MINIMAL).unwrap();
        assert_eq!(settings.write_slots, DEFAULT_WRITE_SLOTS);
        assert_eq!(settings.notmuch, PathBuf::from("notmuch"));
        assert!(settings.index_dir.is_none());

        let engine = EngineConfig::new("/i", "/t", "/l").with_settings(&settings);
        assert_eq!(engine.idle_keepalive, DEFAULT_IDLE_KEEPALIVE);
        assert_eq!(engine.index_path("abc"), PathBuf::from("/i/abc"));
    }

    #[test]
    fn invalid_settings_are_config_errors() {
        assert!(matches!(Settings::from_json("{"), Err(Error::Config(_))));
        assert!(matches!(Settings::from_json("{}"), Err(Error::Config(_))));

        let bad = MINIMAL.replace("\"pw\"", "\"\"");
        let Err(Error::Config(message)) = Settings::from_json(&bad) else {
            panic!("expected a config error");
        };
        assert!(message.contains("auth"));

        let zero = MINIMAL.replacen('{', r#"{ "write_slots": 0,"#, 1);
        assert!(Settings::from_json(&zero).is_err());
    }

    #[tokio::test]
    async fn load_reports_missing_file_as_storage() {
        let err = Settings::load(Path::new("/nonexistent/mailmirror.json"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
