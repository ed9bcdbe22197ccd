//! Translation between remote message flags and local tags.
//!
//! Each tracked flag owns one bit of the index record's flag byte. A tag is
//! either the flag's positive form (`\Flagged` set means `+flagged`) or its
//! inverse (`\Seen` set means `-unread`).

use std::fmt;

use crate::codec::Digest;
use crate::tags::OFFLINE_TAG;

/// One flag-to-tag mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagEntry {
    /// Single bit in the record's flag byte.
    pub mask: u8,
    /// Remote flag name, e.g. `\Seen`.
    pub remote: String,
    /// Local tag name, e.g. `unread`.
    pub tag: String,
    /// The tag is present when the flag is absent.
    pub inverted: bool,
}

impl FlagEntry {
    fn new(mask: u8, remote: &str, tag: &str, inverted: bool) -> Self {
        Self {
            mask,
            remote: remote.to_string(),
            tag: tag.to_string(),
            inverted,
        }
    }
}

/// The set of tracked flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagTable {
    entries: Vec<FlagEntry>,
}

impl Default for FlagTable {
    fn default() -> Self {
        Self {
            entries: vec![
                FlagEntry::new(0x01, "\\Seen", "unread", true),
                FlagEntry::new(0x02, "\\Answered", "replied", false),
                FlagEntry::new(0x04, "\\Deleted", "deleted", false),
                FlagEntry::new(0x08, "$Forwarded", "forwarded", false),
                FlagEntry::new(0x10, "\\Flagged", "flagged", false),
            ],
        }
    }
}

impl FlagTable {
    /// Builds a table from explicit entries.
    ///
    /// # Errors
    ///
    /// Returns a message if a mask is not a single bit below 0x80 or is
    /// used twice, or if a flag maps to the offline marker tag.
    pub fn new(entries: Vec<FlagEntry>) -> Result<Self, String> {
        let mut used = 0u8;
        for entry in &entries {
            if entry.mask.count_ones() != 1 || entry.mask >= 0x80 {
                return Err(format!("flag {} has invalid mask {:#04x}", entry.remote, entry.mask));
            }
            if used & entry.mask != 0 {
                return Err(format!("flag {} reuses mask {:#04x}", entry.remote, entry.mask));
            }
            if entry.tag == OFFLINE_TAG {
                return Err(format!("flag {} cannot map to tag {OFFLINE_TAG}", entry.remote));
            }
            used |= entry.mask;
        }
        Ok(Self { entries })
    }

    /// Tracked entries in table order.
    #[must_use]
    pub fn entries(&self) -> &[FlagEntry] {
        &self.entries
    }

    /// Bit set for a remote flag list. Unknown flags are ignored; names
    /// are compared case-insensitively.
    #[must_use]
    pub fn to_bits<S: AsRef<str>>(&self, flags: &[S]) -> u8 {
        flags.iter().fold(0, |bits, flag| {
            let flag = flag.as_ref();
            self.entries
                .iter()
                .find(|e| e.remote.eq_ignore_ascii_case(flag))
                .map_or(bits, |e| bits | e.mask)
        })
    }

    /// Remote flag names for a bit set.
    #[must_use]
    pub fn to_remote(&self, bits: u8) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| bits & e.mask != 0)
            .map(|e| e.remote.as_str())
            .collect()
    }

    /// Tag operations that move a message from `old` to `new` bits.
    #[must_use]
    pub fn tag_ops(&self, old: u8, new: u8) -> Vec<TagOp> {
        let changed = old ^ new;
        self.entries
            .iter()
            .filter(|e| changed & e.mask != 0)
            .map(|e| {
                if (new & e.mask != 0) != e.inverted {
                    TagOp::Add(e.tag.clone())
                } else {
                    TagOp::Remove(e.tag.clone())
                }
            })
            .collect()
    }

    /// Renders a ticket as tag operations, extra tags first.
    #[must_use]
    pub fn ticket_ops(&self, ticket: &FlagTicket) -> Vec<TagOp> {
        let mut ops: Vec<TagOp> = ticket.extra.iter().cloned().map(TagOp::Add).collect();
        ops.extend(self.tag_ops(ticket.old, ticket.new));
        ops
    }
}

/// One change to a local tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagOp {
    /// `+tag`
    Add(String),
    /// `-tag`
    Remove(String),
}

impl fmt::Display for TagOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add(tag) => write!(f, "+{tag}"),
            Self::Remove(tag) => write!(f, "-{tag}"),
        }
    }
}

/// A pending tag update for one archived message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagTicket {
    /// Bits before the change. Zero for a message seen for the first time.
    pub old: u8,
    /// Bits after the change.
    pub new: u8,
    /// Which message.
    pub digest: Digest,
    /// Mailbox tags added alongside, only for newly seen messages.
    pub extra: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops(list: &[TagOp]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn bits_from_remote_flags() {
        let table = FlagTable::default();
        assert_eq!(table.to_bits(&["\\Seen", "\\Recent", "\\flagged"]), 0x11);
        assert_eq!(table.to_bits(&["$forwarded", "\\Answered"]), 0x0a);
        assert_eq!(table.to_bits::<&str>(&[]), 0);
        assert_eq!(table.to_remote(0x05), vec!["\\Seen", "\\Deleted"]);
    }

    #[test]
    fn new_unread_message_gets_no_unread_op() {
        let table = FlagTable::default();
        assert!(table.tag_ops(0, 0).is_empty());
        assert_eq!(ops(&table.tag_ops(0, 0x01)), vec!["-unread"]);
        assert_eq!(ops(&table.tag_ops(0x01, 0)), vec!["+unread"]);
    }

    #[test]
    fn positive_flags_map_directly() {
        let table = FlagTable::default();
        assert_eq!(
            ops(&table.tag_ops(0x02, 0x14)),
            vec!["-replied", "+deleted", "+flagged"]
        );
    }

    #[test]
    fn ticket_puts_extra_tags_first() {
        let table = FlagTable::default();
        let ticket = FlagTicket {
            old: 0,
            new: 0x01,
            digest: [0; 20],
            extra: vec!["inbox".into(), "work".into()],
        };
        assert_eq!(ops(&table.ticket_ops(&ticket)), vec!["+inbox", "+work", "-unread"]);
    }

    #[test]
    fn table_rejects_bad_masks() {
        assert!(FlagTable::new(vec![FlagEntry::new(0x03, "\\Seen", "unread", true)]).is_err());
        assert!(FlagTable::new(vec![FlagEntry::new(0x80, "\\Seen", "unread", true)]).is_err());
        assert!(
            FlagTable::new(vec![
                FlagEntry::new(0x01, "\\Seen", "unread", true),
                FlagEntry::new(0x01, "\\Flagged", "flagged", false),
            ])
            .is_err()
        );
        assert!(FlagTable::new(vec![FlagEntry::new(0x04, "\\Deleted", "offline", false)]).is_err());
        assert_eq!(
            FlagTable::new(FlagTable::default().entries().to_vec()).unwrap_or_default(),
            FlagTable::default()
        );
    }
}
