//! Fixed-size time-stamped ring buffer.
//!
//! Backs the engine's log history: appends overwrite the oldest entry, and
//! `read_since` replays everything strictly newer than a given instant.

use chrono::{DateTime, Utc};

/// Number of slots allocated for every ring.
///
/// Note the allocation is always `RING_SLOTS` wide while indexing is
/// modulo the separately stored logical `size`. `Ring::new` asserts
/// `size` fits the allocation; the daemon constructs rings with
/// `size == RING_SLOTS`, so the two values only diverge in tests that
/// exercise smaller logical sizes.
pub const RING_SLOTS: usize = 1024;

/// A circular buffer of `(timestamp, payload)` pairs.
///
/// Uninitialized slots carry `DateTime::<Utc>::MIN_UTC`, which sorts before
/// any queryable instant and is therefore never returned by `read_since`.
#[derive(Debug, Clone)]
pub struct Ring<T> {
    slots: Vec<(DateTime<Utc>, Option<T>)>,
    size: usize,
    write: usize,
}

impl<T: Clone> Ring<T> {
    /// Creates a ring indexing over `size` of the [`RING_SLOTS`] allocated
    /// slots.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or exceeds [`RING_SLOTS`].
    #[must_use]
    pub fn new(size: usize) -> Self {
        assert!(size > 0 && size <= RING_SLOTS, "ring size out of range");
        Self {
            slots: vec![(DateTime::<Utc>::MIN_UTC, None); RING_SLOTS],
            size,
            write: 0,
        }
    }

    /// The logical capacity used for indexing.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Appends an entry, overwriting the oldest when full.
    pub fn append(&mut self, timestamp: DateTime<Utc>, value: T) {
        self.slots[self.write] = (timestamp, Some(value));
        self.write = (self.write + 1) % self.size;
    }

    /// Returns entries with timestamp strictly after `t`, oldest first.
    ///
    /// Walks backward from the most recent entry and stops at the writer
    /// position so no slot is read twice; at most `size` entries are
    /// returned.
    #[must_use]
    pub fn read_since(&self, t: DateTime<Utc>) -> Vec<(DateTime<Utc>, T)> {
        let mut out = Vec::new();
        for step in 1..=self.size {
            let idx = (self.write + self.size - step) % self.size;
            let (ts, value) = &self.slots[idx];
            if *ts <= t {
                break;
            }
            if let Some(value) = value {
                out.push((*ts, value.clone()));
            }
        }
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn empty_ring_reads_nothing() {
        let ring: Ring<String> = Ring::new(8);
        assert!(ring.read_since(ts(0)).is_empty());
    }

    #[test]
    fn reads_are_chronological_and_filtered() {
        let mut ring = Ring::new(8);
        for i in 1..=5 {
            ring.append(ts(i), format!("line-{i}"));
        }
        let entries = ring.read_since(ts(2));
        let times: Vec<i64> = entries.iter().map(|(t, _)| t.timestamp()).collect();
        assert_eq!(times, vec![3, 4, 5]);
        assert_eq!(entries[0].1, "line-3");
    }

    #[test]
    fn overwrite_keeps_at_most_size_entries() {
        let size = 8;
        let mut ring = Ring::new(size);
        for i in 1..=(size as i64 + 5) {
            ring.append(ts(i), i.to_string());
        }
        let entries = ring.read_since(ts(0));
        assert_eq!(entries.len(), size);
        let times: Vec<i64> = entries.iter().map(|(t, _)| t.timestamp()).collect();
        let expected: Vec<i64> = (6..=13).collect();
        assert_eq!(times, expected);
    }

    #[test]
    fn read_since_future_instant_is_empty() {
        let mut ring = Ring::new(4);
        ring.append(ts(10), "x".to_string());
        assert!(ring.read_since(ts(10)).is_empty());
        assert_eq!(ring.read_since(ts(9)).len(), 1);
    }

    #[test]
    fn indexing_is_modulo_logical_size() {
        // size 2 inside the 1024-slot allocation: the third append must
        // overwrite the first.
        let mut ring = Ring::new(2);
        ring.append(ts(1), "a".to_string());
        ring.append(ts(2), "b".to_string());
        ring.append(ts(3), "c".to_string());
        let entries = ring.read_since(ts(0));
        assert_eq!(
            entries.iter().map(|(_, v)| v.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
    }
}
