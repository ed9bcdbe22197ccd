//! Account validation.

use std::collections::HashSet;

use super::model::AccountConfig;

/// Validation error for account configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// IMAP server is empty.
    EmptyServer,
    /// IMAP server port is not a number in 1-65535.
    InvalidPort,
    /// User name is empty.
    EmptyUser,
    /// Password or token is empty.
    EmptySecret,
    /// No mailboxes configured.
    NoMailboxes,
    /// A mailbox name is empty.
    EmptyMailbox,
    /// The same mailbox is listed twice.
    DuplicateMailbox(String),
}

impl ValidationError {
    /// Get human-readable error message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::EmptyServer => "IMAP server is required",
            Self::InvalidPort => "IMAP port must be 1-65535",
            Self::EmptyUser => "User name is required",
            Self::EmptySecret => "Password or access token is required",
            Self::NoMailboxes => "At least one mailbox is required",
            Self::EmptyMailbox => "Mailbox names must not be empty",
            Self::DuplicateMailbox(_) => "Mailbox is listed more than once",
        }
    }

    /// Get the field name this error relates to.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::EmptyServer | Self::InvalidPort => "imap_server",
            Self::EmptyUser => "user",
            Self::EmptySecret => "auth",
            Self::NoMailboxes | Self::EmptyMailbox | Self::DuplicateMailbox(_) => "mailboxes",
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateMailbox(name) => write!(f, "{}: {name}", self.message()),
            _ => write!(f, "{}", self.message()),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Result of validating an account.
pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Validate an account configuration.
///
/// # Errors
///
/// Returns every problem found.
pub fn validate_account(account: &AccountConfig) -> ValidationResult {
    let mut errors = Vec::new();

    let server = account.imap_server.trim();
    if server.is_empty() {
        errors.push(ValidationError::EmptyServer);
    } else if let Some((_, port)) = server.rsplit_once(':')
        && !matches!(port.parse::<u16>(), Ok(p) if p > 0)
    {
        errors.push(ValidationError::InvalidPort);
    }

    if account.user.trim().is_empty() {
        errors.push(ValidationError::EmptyUser);
    }
    if account.auth.secret().is_empty() {
        errors.push(ValidationError::EmptySecret);
    }

    if account.mailboxes.is_empty() {
        errors.push(ValidationError::NoMailboxes);
    }
    let mut seen = HashSet::new();
    for mailbox in &account.mailboxes {
        let name = mailbox.name();
        if name.trim().is_empty() {
            errors.push(ValidationError::EmptyMailbox);
        } else if !seen.insert(name) {
            errors.push(ValidationError::DuplicateMailbox(name.to_string()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
