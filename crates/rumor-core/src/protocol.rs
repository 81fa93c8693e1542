//! Identity and ordering primitives shared by every snapshot.
//!
//! - [`MemberId`]: 128-bit identifier, one per node process lifetime
//! - [`Sequence`]: 16-bit wrapping state sequence number
//! - [`Timestamp`]: 24-bit wrapping millisecond clock

use chrono::Utc;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a cluster member.
///
/// A fresh identifier is drawn when a node process starts. It is stable across
/// reconnections and only changes when the process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Creates a new random member ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuilds a member ID from its two 64-bit halves.
    #[must_use]
    pub fn from_halves(high: u64, low: u64) -> Self {
        Self(Uuid::from_u64_pair(high, low))
    }

    /// Returns the most and least significant 64-bit halves.
    #[must_use]
    pub fn halves(&self) -> (u64, u64) {
        self.0.as_u64_pair()
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MemberId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// State sequence number of a member, bumped on every local attribute change.
///
/// Comparison uses wrapping arithmetic so the counter can roll over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sequence(i16);

impl Sequence {
    /// The first sequence number a member advertises.
    pub const ZERO: Self = Self(0);

    /// Creates a sequence from its raw value.
    #[must_use]
    pub const fn new(raw: i16) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn raw(self) -> i16 {
        self.0
    }

    /// Returns the following sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Signed distance from `other` to `self`.
    #[must_use]
    pub const fn delta(self, other: Self) -> i16 {
        self.0.wrapping_sub(other.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of significant bits in a [`Timestamp`].
pub const TIMESTAMP_BITS: u32 = 24;

const TIMESTAMP_MASK: u32 = (1 << TIMESTAMP_BITS) - 1;

/// Reduced-precision creation time of a snapshot.
///
/// Millisecond resolution truncated to 24 bits, so it wraps roughly every
/// 4.6 hours. Two timestamps are only comparable when they are less than half
/// a wrap apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timestamp(u32);

impl Timestamp {
    /// Creates a timestamp from a raw value, discarding bits above the 24th.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & TIMESTAMP_MASK)
    }

    /// Truncates a millisecond counter.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self((millis as u32) & TIMESTAMP_MASK)
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_millis(Utc::now().timestamp_millis() as u64)
    }

    /// Returns the raw 24-bit value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns this timestamp moved forward by `millis`, wrapping.
    #[must_use]
    pub const fn add_millis(self, millis: u32) -> Self {
        Self(self.0.wrapping_add(millis) & TIMESTAMP_MASK)
    }

    /// Signed distance in milliseconds from `other` to `self`.
    #[must_use]
    pub const fn delta(self, other: Self) -> i32 {
        let diff = self.0.wrapping_sub(other.0) & TIMESTAMP_MASK;
        // sign-extend the 24-bit difference
        ((diff << 8) as i32) >> 8
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ========== MemberId Tests ==========

    #[test]
    fn member_ids_are_unique() {
        assert_ne!(MemberId::new(), MemberId::new());
    }

    #[test]
    fn member_id_halves_roundtrip() {
        let id = MemberId::new();
        let (high, low) = id.halves();
        assert_eq!(MemberId::from_halves(high, low), id);
    }

    #[test]
    fn member_id_display_is_uuid() {
        let id = MemberId::new();
        assert_eq!(id.to_string(), id.as_uuid().to_string());
    }

    // ========== Sequence Tests ==========

    #[test]
    fn sequence_next_wraps() {
        let last = Sequence::new(i16::MAX);
        assert_eq!(last.next(), Sequence::new(i16::MIN));
        assert_eq!(last.next().delta(last), 1);
    }

    #[test]
    fn sequence_delta_sign() {
        let a = Sequence::new(10);
        let b = Sequence::new(12);
        assert_eq!(b.delta(a), 2);
        assert_eq!(a.delta(b), -2);
        assert_eq!(a.delta(a), 0);
    }

    // ========== Timestamp Tests ==========

    #[test]
    fn timestamp_truncates_to_24_bits() {
        let ts = Timestamp::from_raw(0x0123_4567);
        assert_eq!(ts.raw(), 0x23_4567);
    }

    #[test]
    fn timestamp_delta_across_wrap() {
        let before = Timestamp::from_raw(TIMESTAMP_MASK - 5);
        let after = before.add_millis(10);
        assert_eq!(after.raw(), 4);
        assert_eq!(after.delta(before), 10);
        assert_eq!(before.delta(after), -10);
    }

    #[test]
    fn timestamp_now_is_masked() {
        assert!(Timestamp::now().raw() <= TIMESTAMP_MASK);
    }

    proptest! {
        #[test]
        fn timestamp_delta_matches_offset(start in 0u32..=TIMESTAMP_MASK, offset in 0u32..(1 << 23)) {
            let a = Timestamp::from_raw(start);
            let b = a.add_millis(offset);
            prop_assert_eq!(b.delta(a), offset as i32);
            prop_assert_eq!(a.delta(b), -(offset as i32));
        }

        #[test]
        fn sequence_delta_matches_steps(start in any::<i16>(), steps in 0u16..1000) {
            let mut seq = Sequence::new(start);
            for _ in 0..steps {
                seq = seq.next();
            }
            prop_assert_eq!(seq.delta(Sequence::new(start)), steps as i16);
        }
    }
}
