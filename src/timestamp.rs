//! Timestamps on the wire.
//!
//! The API exchanges points in time as integer milliseconds since the Unix
//! epoch. Use the serde helper modules on fields of request and response
//! types:
//!
//! ```
//! use bulkwire::timestamp::{self, Timestamp};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct Event {
//!     #[serde(with = "timestamp::epoch_millis")]
//!     start_time: Timestamp,
//!     #[serde(default, with = "timestamp::epoch_millis_option")]
//!     end_time: Option<Timestamp>,
//! }
//!
//! let event: Event = serde_json::from_str(r#"{"startTime": 1700000000000}"#).unwrap();
//! assert_eq!(timestamp::to_epoch_millis(&event.start_time), 1_700_000_000_000);
//! assert!(event.end_time.is_none());
//! ```

use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};

/// A point in time, always in UTC.
pub type Timestamp = DateTime<Utc>;

/// Milliseconds since the Unix epoch.
pub fn to_epoch_millis(timestamp: &Timestamp) -> i64 {
    timestamp.timestamp_millis()
}

/// Converts milliseconds since the Unix epoch.
///
/// # Errors
///
/// Returns [`Error::ConfigurationError`] if `millis` is outside chrono's
/// representable range.
pub fn from_epoch_millis(millis: i64) -> Result<Timestamp> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::ConfigurationError(format!("Timestamp out of range: {}", millis)))
}

/// `#[serde(with = "...")]` for `Timestamp` fields.
pub mod epoch_millis {
    use super::Timestamp;
    use chrono::{TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(timestamp: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(timestamp.timestamp_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {}", millis)))
    }
}

/// `#[serde(with = "...")]` for `Option<Timestamp>` fields.
pub mod epoch_millis_option {
    use super::Timestamp;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        timestamp: &Option<Timestamp>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match timestamp {
            Some(timestamp) => super::epoch_millis::serialize(timestamp, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Timestamp>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super::epoch_millis")] Timestamp);

        let value = Option::<Wrapper>::deserialize(deserializer)?;
        Ok(value.map(|Wrapper(timestamp)| timestamp))
    }
}
