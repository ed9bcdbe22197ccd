//! Account configuration.
//!
//! Provides the account model, mailbox identifiers and validation.

mod model;
mod validation;

pub use model::{AccountConfig, Auth, MailboxConfig, mailbox_id};
pub use validation::{ValidationError, ValidationResult, validate_account};
