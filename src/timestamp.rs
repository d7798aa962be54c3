//! Wire-format timestamps
//!
//! Timestamps travel as `{"t_ms": <milliseconds since epoch>}` or the
//! literal string `"/never/"`. Internally a timestamp is an optional
//! millisecond count; `None` means never.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(Option<i64>);

impl Timestamp {
    pub const NEVER: Timestamp = Timestamp(None);

    pub fn from_millis(ms: i64) -> Self {
        Timestamp(Some(ms))
    }

    pub fn now() -> Self {
        Timestamp(Some(Utc::now().timestamp_millis()))
    }

    pub fn is_never(&self) -> bool {
        self.0.is_none()
    }

    pub fn millis(&self) -> Option<i64> {
        self.0
    }

    /// True if this deadline lies in the past. A `never` timestamp is
    /// never expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.0 {
            None => false,
            Some(ms) => ms < now.timestamp_millis(),
        }
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(Some(dt.timestamp_millis()))
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        self.0.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

impl From<Option<DateTime<Utc>>> for Timestamp {
    fn from(v: Option<DateTime<Utc>>) -> Self {
        match v {
            Some(dt) => Timestamp::from_datetime(dt),
            None => Timestamp::NEVER,
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            None => serializer.serialize_str("/never/"),
            Some(ms) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("t_ms", &ms)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TsVisitor;

        impl<'de> Visitor<'de> for TsVisitor {
            type Value = Timestamp;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{{\"t_ms\": <int>}} or \"/never/\"")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
                if v == "/never/" {
                    Ok(Timestamp::NEVER)
                } else {
                    Err(E::custom(format!("unexpected timestamp string '{}'", v)))
                }
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Timestamp, A::Error> {
                let mut t_ms: Option<i64> = None;
                while let Some(key) = map.next_key::<String>()? {
                    if key == "t_ms" {
                        t_ms = Some(map.next_value()?);
                    } else {
                        let _: de::IgnoredAny = map.next_value()?;
                    }
                }
                t_ms.map(Timestamp::from_millis)
                    .ok_or_else(|| de::Error::custom("timestamp object missing t_ms"))
            }
        }

        deserializer.deserialize_any(TsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_finite() {
        let ts = Timestamp::from_millis(1234);
        assert_eq!(serde_json::to_string(&ts).unwrap(), r#"{"t_ms":1234}"#);
    }

    #[test]
    fn test_serialize_never() {
        assert_eq!(
            serde_json::to_string(&Timestamp::NEVER).unwrap(),
            r#""/never/""#
        );
    }

    #[test]
    fn test_deserialize_round_trip() {
        let ts: Timestamp = serde_json::from_str(r#"{"t_ms":99}"#).unwrap();
        assert_eq!(ts.millis(), Some(99));

        let never: Timestamp = serde_json::from_str(r#""/never/""#).unwrap();
        assert!(never.is_never());
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(serde_json::from_str::<Timestamp>(r#""/sometimes/""#).is_err());
        assert!(serde_json::from_str::<Timestamp>(r#"{"ms":1}"#).is_err());
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let past = Timestamp::from_millis(now.timestamp_millis() - 1000);
        let future = Timestamp::from_millis(now.timestamp_millis() + 1000);
        assert!(past.is_expired(now));
        assert!(!future.is_expired(now));
        assert!(!Timestamp::NEVER.is_expired(now));
    }
}
