//! Shared timestamp helpers for manifests, backups, and ledgers.

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::core::error::RagmillError;

/// Returns the current instant in UTC.
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Formats an instant as RFC 3339 (`2026-01-01T00:00:00Z`).
pub fn to_rfc3339(value: OffsetDateTime) -> String {
    value
        .format(&Rfc3339)
        .unwrap_or_else(|_| value.unix_timestamp().to_string())
}

/// Parses an RFC 3339 timestamp back into an instant.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, RagmillError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| RagmillError::ConfigError(format!("Invalid timestamp {value:?}: {err}")))
}

/// Compact UTC label used in backup file names (`YYYYMMDDThhmmssZ`).
pub fn backup_label(value: OffsetDateTime) -> String {
    let fmt = format_description!("[year][month][day]T[hour][minute][second]Z");
    value
        .format(&fmt)
        .unwrap_or_else(|_| format!("{}Z", value.unix_timestamp()))
}

/// Milliseconds since the unix epoch, saturating at zero for pre-epoch input.
pub fn unix_millis(value: OffsetDateTime) -> u64 {
    let nanos = value.unix_timestamp_nanos();
    if nanos <= 0 {
        return 0;
    }
    (nanos / 1_000_000) as u64
}
