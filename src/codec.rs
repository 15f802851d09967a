//! Notification payload codec.
//!
//! The producer-side trigger emits a seven-field, single-space-separated
//! payload:
//!
//! ```text
//! <key_b64> <epoch_ts> <INSERT|UPDATE|DELETE> <index> <value_b64> <inline|stored> <payload>
//! ```
//!
//! Decoding never panics: every malformed input maps to a typed
//! [`WatchError`] that the listener fans out to interested watchers as an
//! error event.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::WatchError;
use crate::event::{ChangeEvent, Operation, PayloadRef};

/// Decodes one notification payload into a [`ChangeEvent`].
pub(crate) fn decode_notification(payload: &str) -> Result<ChangeEvent, WatchError> {
    let parts: Vec<&str> = payload.split(' ').collect();
    if parts.len() != 7 {
        return Err(WatchError::MalformedPayload(parts.len()));
    }

    let key = STANDARD.decode(parts[0]).map_err(|_| WatchError::BadKey)?;
    let value = STANDARD
        .decode(parts[4])
        .map_err(|_| WatchError::BadIndexValue)?;

    let op = match parts[2] {
        "INSERT" | "UPDATE" => Operation::Put,
        "DELETE" => Operation::Delete,
        other => return Err(WatchError::BadOperation(other.to_string())),
    };

    let time = parse_epoch(parts[1])?;

    let payload = match parts[5] {
        "inline" => {
            let data = STANDARD
                .decode(parts[6])
                .map_err(|_| WatchError::BadPayloadData)?;
            Some(PayloadRef::Inline(Bytes::from(data)))
        }
        "stored" => Some(PayloadRef::Stored(parts[6].to_string())),
        _ => None,
    };

    Ok(ChangeEvent {
        key: Bytes::from(key),
        index: parts[3].to_string(),
        value: Bytes::from(value),
        op,
        time,
        payload,
    })
}

/// Parses a Postgres `extract(epoch from …)` style timestamp: seconds with
/// an optional fractional part.
///
/// The fractional part scales by digit count: three digits are
/// milliseconds, nine are nanoseconds. Lengths outside 1..=9 go through the
/// same `10^(9-len)` formula, truncating toward zero; that formula is the
/// contract inherited from the producing side.
pub(crate) fn parse_epoch(s: &str) -> Result<DateTime<Utc>, WatchError> {
    let bad = || WatchError::BadTimestamp(s.to_string());

    let (secs_part, frac_part) = match s.split_once('.') {
        Some((secs, frac)) => (secs, Some(frac)),
        None => (s, None),
    };
    let secs: i64 = secs_part.parse().map_err(|_| bad())?;

    let nanos = match frac_part {
        None => 0u32,
        Some(frac) => {
            let digits: i64 = frac.parse().map_err(|_| bad())?;
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            let scaled = (digits as f64 * 10f64.powi(9 - i32::try_from(frac.len()).map_err(|_| bad())?)) as i64;
            u32::try_from(scaled).map_err(|_| bad())?
        }
    };

    DateTime::from_timestamp(secs, nanos).ok_or_else(bad)
}
