//! Change sequence numbers.
//!
//! A [`Csn`] is the logical timestamp of one accepted write:
//! `(wall-clock millis, per-millisecond sequence, originating replica)`.
//! The derived order compares the fields in that order, so two writes from
//! different replicas never compare equal.
//!
//! ## Encodings
//!
//! - text: 24 lowercase hex digits, `timestamp(12) | replica(4) | seq(8)`;
//!   the 28-digit form with a 16-digit timestamp is accepted on input
//! - key: 14 bytes `timestamp BE(8) | seq BE(4) | replica BE(2)` whose
//!   byte order equals CSN order

use crate::error::{CoreError, CoreResult};
use crate::types::ReplicaId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of the canonical text form.
pub const CSN_STRING_LEN: usize = 24;

/// Length of the legacy text form with a 16-digit timestamp.
pub const LEGACY_CSN_STRING_LEN: usize = 28;

/// Length of the binary key form.
pub const CSN_KEY_LEN: usize = 14;

/// Largest timestamp the 12-digit text form can carry.
pub const MAX_CSN_TIMESTAMP: u64 = (1 << 48) - 1;

/// A change sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Csn {
    timestamp: u64,
    seq: u32,
    replica_id: ReplicaId,
}

impl Csn {
    /// Creates a CSN.
    ///
    /// Timestamps past [`MAX_CSN_TIMESTAMP`] are clamped to it.
    #[must_use]
    pub const fn new(timestamp: u64, seq: u32, replica_id: ReplicaId) -> Self {
        let timestamp = if timestamp > MAX_CSN_TIMESTAMP {
            MAX_CSN_TIMESTAMP
        } else {
            timestamp
        };
        Self {
            timestamp,
            seq,
            replica_id,
        }
    }

    /// The smallest CSN carrying `timestamp`, used as a time-based bound.
    #[must_use]
    pub const fn at_time(timestamp: u64) -> Self {
        Self::new(timestamp, 0, ReplicaId(0))
    }

    /// Wall-clock milliseconds when the CSN was generated.
    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Sequence within the millisecond.
    #[must_use]
    pub const fn seq(&self) -> u32 {
        self.seq
    }

    /// Replica that generated the CSN.
    #[must_use]
    pub const fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Encodes the order-preserving binary key.
    #[must_use]
    pub fn to_key_bytes(&self) -> [u8; CSN_KEY_LEN] {
        let mut key = [0u8; CSN_KEY_LEN];
        key[0..8].copy_from_slice(&self.timestamp.to_be_bytes());
        key[8..12].copy_from_slice(&self.seq.to_be_bytes());
        key[12..14].copy_from_slice(&self.replica_id.as_u16().to_be_bytes());
        key
    }

    /// Decodes a binary key.
    ///
    /// # Errors
    ///
    /// Returns an error unless `bytes` is exactly [`CSN_KEY_LEN`] long and
    /// its timestamp fits [`MAX_CSN_TIMESTAMP`].
    pub fn from_key_bytes(bytes: &[u8]) -> CoreResult<Self> {
        let key: [u8; CSN_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CoreError::log_corruption(format!("CSN key of {} bytes", bytes.len())))?;
        let timestamp = u64::from_be_bytes([
            key[0], key[1], key[2], key[3], key[4], key[5], key[6], key[7],
        ]);
        if timestamp > MAX_CSN_TIMESTAMP {
            return Err(CoreError::log_corruption(format!(
                "CSN key timestamp {timestamp:#x} out of range"
            )));
        }
        let seq = u32::from_be_bytes([key[8], key[9], key[10], key[11]]);
        let replica = u16::from_be_bytes([key[12], key[13]]);
        Ok(Self::new(timestamp, seq, ReplicaId(replica)))
    }

    /// Returns true if `self` was generated after `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:012x}{:04x}{:08x}",
            self.timestamp,
            self.replica_id.as_u16(),
            self.seq
        )
    }
}

impl FromStr for Csn {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let invalid = |reason| CoreError::InvalidCsn {
            input: s.to_string(),
            reason,
        };
        let ts_len = match s.len() {
            CSN_STRING_LEN => 12,
            LEGACY_CSN_STRING_LEN => 16,
            _ => return Err(invalid("expected 24 or 28 hex digits")),
        };
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid("not hexadecimal"));
        }

        let timestamp =
            u64::from_str_radix(&s[..ts_len], 16).map_err(|_| invalid("bad timestamp"))?;
        if timestamp > MAX_CSN_TIMESTAMP {
            return Err(invalid("timestamp out of range"));
        }
        let replica = u16::from_str_radix(&s[ts_len..ts_len + 4], 16)
            .map_err(|_| invalid("bad replica id"))?;
        let seq = u32::from_str_radix(&s[ts_len + 4..], 16).map_err(|_| invalid("bad sequence"))?;
        Ok(Self::new(timestamp, seq, ReplicaId(replica)))
    }
}

impl Serialize for Csn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Csn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn csn(ts: u64, seq: u32, replica: u16) -> Csn {
        Csn::new(ts, seq, ReplicaId(replica))
    }

    #[test]
    fn order_is_timestamp_then_seq_then_replica() {
        assert!(csn(1, 9, 9) < csn(2, 0, 0));
        assert!(csn(5, 1, 9) < csn(5, 2, 0));
        assert!(csn(5, 2, 1) < csn(5, 2, 2));
        assert!(csn(5, 2, 2).is_newer_than(&csn(5, 2, 1)));
    }

    #[test]
    fn text_form_is_24_hex_digits() {
        let text = csn(0x0191_2345_6789, 7, 0x12).to_string();
        assert_eq!(text, "019123456789001200000007");
        assert_eq!(text.len(), CSN_STRING_LEN);
        assert_eq!(text.parse::<Csn>().unwrap(), csn(0x0191_2345_6789, 7, 0x12));
    }

    #[test]
    fn parses_legacy_28_digit_form() {
        let parsed: Csn = "000000000000000a000000000000".parse().unwrap();
        assert_eq!(parsed, csn(10, 0, 0));
        let parsed: Csn = "0000000000000001000200000003".parse().unwrap();
        assert_eq!(parsed, csn(1, 3, 2));
    }

    #[test]
    fn rejects_malformed_text() {
        assert!(matches!(
            "abc".parse::<Csn>(),
            Err(CoreError::InvalidCsn { .. })
        ));
        assert!("zz0000000000000000000000".parse::<Csn>().is_err());
        assert!("+00000000000000000000000".parse::<Csn>().is_err());
    }

    #[test]
    fn timestamp_is_bounded_by_the_text_form() {
        let max = csn(MAX_CSN_TIMESTAMP, u32::MAX, u16::MAX);
        let text = max.to_string();
        assert_eq!(text, "ffffffffffffffffffffffff");
        assert_eq!(text.parse::<Csn>().unwrap(), max);

        let clamped = csn(1 << 48, 0, 1);
        assert_eq!(clamped.timestamp(), MAX_CSN_TIMESTAMP);
        assert_eq!(clamped.to_string().len(), CSN_STRING_LEN);

        assert!(matches!(
            "0001000000000000000000000000".parse::<Csn>(),
            Err(CoreError::InvalidCsn { .. })
        ));
        let mut key = [0u8; CSN_KEY_LEN];
        key[1] = 1;
        assert!(Csn::from_key_bytes(&key).is_err());
    }

    #[test]
    fn key_bytes_reject_wrong_length() {
        assert!(Csn::from_key_bytes(&[0u8; 13]).is_err());
    }

    #[test]
    fn serde_uses_text_form() {
        let value = csn(42, 1, 3);
        let mut bytes = Vec::new();
        ciborium::into_writer(&value, &mut bytes).unwrap();
        let text: String = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(text, value.to_string());
        let back: Csn = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, value);
    }

    proptest! {
        #[test]
        fn key_order_matches_csn_order(
            a in (0u64..1 << 48, any::<u32>(), any::<u16>()),
            b in (0u64..1 << 48, any::<u32>(), any::<u16>()),
        ) {
            let a = csn(a.0, a.1, a.2);
            let b = csn(b.0, b.1, b.2);
            prop_assert_eq!(a.cmp(&b), a.to_key_bytes().cmp(&b.to_key_bytes()));
            prop_assert_eq!(Csn::from_key_bytes(&a.to_key_bytes()).unwrap(), a);
            prop_assert_eq!(a.to_string().parse::<Csn>().unwrap(), a);
        }
    }
}
