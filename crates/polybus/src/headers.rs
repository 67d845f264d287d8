//! Message Headers and Header Codec
//!
//! Headers carry small scalar values (strings, integers, booleans,
//! timestamps) alongside a message payload. The bus itself only reads and
//! writes the well-known keys defined in [`well_known`]; everything else is
//! passed through untouched for application use.
//!
//! Transports exchange headers as flat string bags. [`HeaderCodec`] encodes a
//! typed [`Headers`] map into such a bag and decodes it back; typed reads
//! coerce from the string form on demand, so a header written as a timestamp
//! survives a round-trip through any transport that can carry strings.
//!
//! # Wire format
//!
//! - Integers: decimal
//! - Booleans: `true` / `false`
//! - Timestamps: **epoch milliseconds** (decoding also accepts RFC 3339)

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Well-known header keys used by the bus core
pub mod well_known {
    /// Stable name of the application message type
    pub const MESSAGE_TYPE: &str = "message-type";

    /// Unique id correlating a request with its response
    pub const REQUEST_ID: &str = "request-id";

    /// Reply channel (topic or queue) for the response
    pub const REPLY_TO: &str = "reply-to";

    /// Absolute expiry instant after which a request must not be handled
    pub const EXPIRES: &str = "expires";

    /// Textual error carried on a response
    pub const ERROR: &str = "error";
}

/// A single scalar header value
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    /// UTF-8 string
    String(String),
    /// Signed 64-bit integer
    Int(i64),
    /// Boolean flag
    Bool(bool),
    /// UTC timestamp
    Timestamp(DateTime<Utc>),
}

impl HeaderValue {
    /// View the value as a string slice, if it is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Coerce the value into an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::String(value) => value.parse().ok(),
            _ => None,
        }
    }

    /// Coerce the value into a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::String(value) => value.parse().ok(),
            _ => None,
        }
    }

    /// Coerce the value into a timestamp
    ///
    /// Strings are parsed as epoch milliseconds first, then as RFC 3339.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(value) => Some(*value),
            Self::Int(millis) => DateTime::<Utc>::from_timestamp_millis(*millis),
            Self::String(value) => {
                if let Ok(millis) = value.parse::<i64>() {
                    DateTime::<Utc>::from_timestamp_millis(millis)
                } else {
                    DateTime::parse_from_rfc3339(value)
                        .ok()
                        .map(|parsed| parsed.with_timezone(&Utc))
                }
            }
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for HeaderValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Typed header map attached to a message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    values: HashMap<String, HeaderValue>,
}

impl Headers {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any previous value under the same key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a raw header value
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.values.get(key)
    }

    /// Whether a header is present
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Read a header as a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(HeaderValue::as_str)
    }

    /// Read a header as an integer, coercing from the string form
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(HeaderValue::as_i64)
    }

    /// Read a header as a boolean, coercing from the string form
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(HeaderValue::as_bool)
    }

    /// Read a header as a timestamp, coercing from the string form
    pub fn get_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.values.get(key).and_then(HeaderValue::as_timestamp)
    }

    /// Number of headers present
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.values.iter()
    }
}

/// Encodes and decodes [`Headers`] to and from a transport header bag
#[derive(Debug, Clone, Default)]
pub struct HeaderCodec;

impl HeaderCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }

    /// Encode a typed header map into a flat string bag
    pub fn encode(&self, headers: &Headers) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(key, value)| {
                let encoded = match value {
                    HeaderValue::String(value) => value.clone(),
                    HeaderValue::Int(value) => value.to_string(),
                    HeaderValue::Bool(value) => value.to_string(),
                    HeaderValue::Timestamp(value) => value.timestamp_millis().to_string(),
                };
                (key.clone(), encoded)
            })
            .collect()
    }

    /// Decode a transport string bag into a typed header map
    ///
    /// Values decode as strings; typed reads on [`Headers`] coerce on demand.
    pub fn decode(&self, bag: &HashMap<String, String>) -> Headers {
        let mut headers = Headers::new();
        for (key, value) in bag {
            headers.insert(key.clone(), value.clone());
        }
        headers
    }
}
