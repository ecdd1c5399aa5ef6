//! Packed 64-bit BFS timestamp: seconds since epoch in the high 48 bits,
//! a uniquifier in the low 16 (§3 "Metadata", §4.7 last-modified index).

use std::time::{SystemTime, UNIX_EPOCH};

/// Packs `seconds` and a `uniquifier` the way every on-disk timestamp field
/// and the last-modified index's keys are stored.
pub fn pack(seconds: u64, uniquifier: u16) -> u64 {
    (seconds << 16) | u64::from(uniquifier)
}

pub fn unpack(value: u64) -> (u64, u16) {
    (value >> 16, (value & 0xffff) as u16)
}

/// Current wall-clock time packed with uniquifier 0, the default a caller
/// gets when it doesn't supply its own (§4.7 `update_last_modified`).
pub fn now_packed() -> u64 {
    let seconds = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    pack(seconds, 0)
}

/// Monotonically increasing uniquifier source for the last-modified index:
/// successive calls within the same second still produce distinct keys.
pub struct Uniquifier {
    last_seconds: std::sync::atomic::AtomicU64,
    counter: std::sync::atomic::AtomicU16,
}

impl Default for Uniquifier {
    fn default() -> Self {
        Uniquifier { last_seconds: std::sync::atomic::AtomicU64::new(0), counter: std::sync::atomic::AtomicU16::new(0) }
    }
}

impl Uniquifier {
    pub fn next(&self, seconds: u64) -> u64 {
        use std::sync::atomic::Ordering;
        let prev = self.last_seconds.swap(seconds, Ordering::AcqRel);
        let count = if prev == seconds {
            self.counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
        } else {
            self.counter.store(0, Ordering::Release);
            0
        };
        pack(seconds, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let v = pack(1_700_000_000, 42);
        assert_eq!(unpack(v), (1_700_000_000, 42));
    }

    #[test]
    fn uniquifier_increments_within_same_second() {
        let u = Uniquifier::default();
        let a = u.next(100);
        let b = u.next(100);
        assert_ne!(a, b);
        let c = u.next(101);
        assert_eq!(unpack(c).1, 0);
    }
}
