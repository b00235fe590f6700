//! Collection version markers.
//!
//! A watermark is the last version marker observed for a remote collection.
//! Markers only move forward: an equal or older marker carries no news.

use chrono::{DateTime, Utc};

/// A watermark representing a point in a collection's change history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark {
    /// Monotonically increasing version marker.
    pub sequence: i64,
    /// When this watermark was observed.
    pub observed_at: DateTime<Utc>,
}

impl Watermark {
    /// Create a new watermark with the given sequence number.
    pub fn new(sequence: i64) -> Self {
        Self {
            sequence,
            observed_at: Utc::now(),
        }
    }

    /// Check if this watermark is newer than another.
    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.sequence > other.sequence
    }

    /// Whether an incoming marker advances past `last`. Anything advances
    /// past a collection that has never been observed.
    pub fn advances(last: Option<&Watermark>, incoming: i64) -> bool {
        match last {
            Some(last) => incoming > last.sequence,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_newer_than() {
        let w3 = Watermark::new(3);
        let w4 = Watermark::new(4);
        assert!(w4.is_newer_than(&w3));
        assert!(!w3.is_newer_than(&w4));
        assert!(!w3.is_newer_than(&Watermark::new(3)));
    }

    #[test]
    fn test_advances_requires_strictly_greater() {
        let last = Watermark::new(3);
        assert!(!Watermark::advances(Some(&last), 2));
        assert!(!Watermark::advances(Some(&last), 3));
        assert!(Watermark::advances(Some(&last), 4));
        assert!(Watermark::advances(None, i64::MIN));
    }
}
