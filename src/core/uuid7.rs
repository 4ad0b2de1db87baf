//! UUIDv7 identifiers and the 12-character Crockford short form.
//!
//! Batches, migrations, and bootstrap markers are all keyed by UUIDv7 so
//! that identifier order equals creation order. The short form encodes the
//! top 60 bits in Crockford base32; lexicographic order of short values
//! matches the 128-bit integer order of the originals.

use time::OffsetDateTime;
use uuid::{NoContext, Timestamp, Uuid};

use crate::core::error::RagmillError;
use crate::core::time::unix_millis;

pub const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
pub const SHORT_UUID7_LENGTH: usize = 12;

/// Returns a time-ordered UUIDv7 for `when` (millisecond precision).
pub fn generate_uuid7(when: OffsetDateTime) -> Result<Uuid, RagmillError> {
    let millis = unix_millis(when);
    if millis >= 1u64 << 48 {
        return Err(RagmillError::ConfigError(
            "uuid7 timestamp out of range".to_string(),
        ));
    }
    let seconds = millis / 1000;
    let subsec_nanos = ((millis % 1000) * 1_000_000) as u32;
    let ts = Timestamp::from_unix(NoContext, seconds, subsec_nanos);
    Ok(Uuid::new_v7(ts))
}

/// Returns the 12-character Crockford base32 prefix for `value`.
pub fn short_uuid7(value: &Uuid) -> String {
    let mut high = value.as_u128() >> (128 - SHORT_UUID7_LENGTH * 5);
    let mut symbols = [b'0'; SHORT_UUID7_LENGTH];
    for slot in symbols.iter_mut().rev() {
        *slot = CROCKFORD_ALPHABET[(high & 0x1F) as usize];
        high >>= 5;
    }
    String::from_utf8_lossy(&symbols).to_string()
}

/// Returns the UTC instant embedded in a UUIDv7 (millisecond precision).
pub fn uuid7_timestamp(value: &Uuid) -> Result<OffsetDateTime, RagmillError> {
    let bytes = value.as_bytes();
    let mut millis: u64 = 0;
    for byte in &bytes[0..6] {
        millis = (millis << 8) | u64::from(*byte);
    }
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| RagmillError::ConfigError(format!("uuid7 timestamp invalid: {err}")))
}

/// Validates that `value` is a normalized short UUID7 string.
pub fn validate_short_uuid7(value: &str) -> Result<(), RagmillError> {
    if value.len() != SHORT_UUID7_LENGTH {
        return Err(RagmillError::ConfigError(format!(
            "shortuuid7 must be {SHORT_UUID7_LENGTH} characters: {value:?}"
        )));
    }
    for ch in value.bytes() {
        if !CROCKFORD_ALPHABET.contains(&ch) {
            return Err(RagmillError::ConfigError(format!(
                "Invalid shortuuid7 character: {:?}",
                ch as char
            )));
        }
    }
    Ok(())
}

/// Returns `true` when short-form ordering matches canonical UUID order.
pub fn ensure_short_uuid7_order(values: &[Uuid]) -> bool {
    let mut canonical: Vec<&Uuid> = values.iter().collect();
    canonical.sort_by_key(|item| item.as_u128());
    let mut shortened: Vec<&Uuid> = values.iter().collect();
    shortened.sort_by_key(|item| short_uuid7(item));
    canonical
        .iter()
        .zip(shortened.iter())
        .all(|(a, b)| a.as_u128() == b.as_u128())
}
