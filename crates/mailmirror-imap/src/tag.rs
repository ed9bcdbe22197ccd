//! Command tag generator.

use std::sync::atomic::{AtomicU32, Ordering};

/// Generates sequential command tags: `A0000`, `A0001`, ...
#[derive(Debug)]
pub struct TagGenerator {
    counter: AtomicU32,
    prefix: char,
}

impl TagGenerator {
    /// Creates a new tag generator with the given prefix.
    #[must_use]
    pub const fn new(prefix: char) -> Self {
        Self {
            counter: AtomicU32::new(0),
            prefix,
        }
    }

    /// Generates the next tag. Wraps after `u32::MAX` commands.
    #[must_use]
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{n:04}", self.prefix)
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new('A')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_tags() {
        let tags = TagGenerator::default();
        assert_eq!(tags.next(), "A0000");
        assert_eq!(tags.next(), "A0001");
    }

    #[test]
    fn tags_grow_past_four_digits() {
        let tags = TagGenerator {
            counter: AtomicU32::new(12_345),
            prefix: 'M',
        };
        assert_eq!(tags.next(), "M12345");
    }
}
