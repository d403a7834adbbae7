use chrono::{DateTime, SecondsFormat, Utc};

use crate::ToolbridgeError;

/// Parse an RFC3339 timestamp into non-negative Unix milliseconds.
///
/// The conversion is total for any valid RFC3339 input at or after the
/// epoch; offsets are folded into UTC so two spellings of the same instant
/// compare equal.
pub fn rfc3339_to_ms(s: &str) -> crate::Result<u64> {
    let parsed = DateTime::parse_from_rfc3339(s)
        .map_err(|e| ToolbridgeError::Validation(format!("invalid timestamp {s:?}: {e}")))?;
    let ms = parsed.timestamp_millis();
    if ms < 0 {
        return Err(ToolbridgeError::Validation(format!("pre-epoch timestamp {s:?}")));
    }
    Ok(ms as u64)
}

/// Render Unix milliseconds as an RFC3339 UTC timestamp with millisecond
/// precision, the wire form used in acks and tombstone records.
pub fn ms_to_rfc3339(ms: u64) -> String {
    ms_to_datetime(ms).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Millisecond timestamp as a `DateTime<Utc>`. Values beyond chrono's
/// representable range clamp to the epoch; they cannot arise from
/// `rfc3339_to_ms`.
pub fn ms_to_datetime(ms: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms as i64).unwrap_or_default()
}
