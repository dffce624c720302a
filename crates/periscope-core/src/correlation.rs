//! Correlation IDs
//!
//! Every proxied exchange gets one ID, shared by its request and response
//! snapshots. IDs are time-based and strictly increasing per generator, so
//! sorting them reproduces the order in which the exchanges started.
//!
//! Layout: `(unix_millis << 16) | seq`, rendered as 13 Crockford base32
//! characters followed by an 8 hex digit generator instance tag, e.g.
//! `01JA2Q7D8V000-3f09c2aa`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Bits reserved below the millisecond timestamp for same-millisecond ties
const SEQ_BITS: u32 = 16;

/// Characters needed to hold a u64 in base32 (65 bits)
const ENCODED_LEN: usize = 13;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Identifier linking a captured request to its captured response
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationId {
    value: u64,
    instance: u32,
}

impl CorrelationId {
    /// Milliseconds since UNIX epoch encoded in this ID
    pub fn timestamp_millis(&self) -> u64 {
        self.value >> SEQ_BITS
    }

    /// Raw ordered value (without the instance tag)
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; ENCODED_LEN];
        let mut v = self.value;
        for slot in buf.iter_mut().rev() {
            *slot = CROCKFORD[(v & 0x1f) as usize];
            v >>= 5;
        }
        // Crockford alphabet is ASCII
        let encoded = std::str::from_utf8(&buf).map_err(|_| fmt::Error)?;
        write!(f, "{}-{:08x}", encoded, self.instance)
    }
}

/// Error returned when parsing a malformed correlation ID
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid correlation id: {0}")]
pub struct ParseCorrelationIdError(String);

impl FromStr for CorrelationId {
    type Err = ParseCorrelationIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseCorrelationIdError(s.to_string());
        let (encoded, instance) = s.split_once('-').ok_or_else(err)?;
        if encoded.len() != ENCODED_LEN || instance.len() != 8 {
            return Err(err());
        }

        let mut value: u64 = 0;
        for (i, c) in encoded.bytes().enumerate() {
            let digit = CROCKFORD
                .iter()
                .position(|&b| b == c.to_ascii_uppercase())
                .ok_or_else(err)? as u64;
            // Leading char only carries the top four bits
            if i == 0 && digit > 0xf {
                return Err(err());
            }
            value = (value << 5) | digit;
        }

        let instance = u32::from_str_radix(instance, 16).map_err(|_| err())?;
        Ok(Self { value, instance })
    }
}

impl Serialize for CorrelationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CorrelationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Lock-free source of correlation IDs
///
/// Safe to share across tasks; `next` never blocks and never repeats a
/// value. When the clock stands still or steps backwards the sequence
/// keeps counting up from the last issued value.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    last: AtomicU64,
    instance: u32,
}

impl CorrelationIdGenerator {
    /// Create a generator with a random instance tag
    pub fn new() -> Self {
        Self::with_instance(Uuid::new_v4().as_u128() as u32)
    }

    /// Create a generator with a fixed instance tag
    pub fn with_instance(instance: u32) -> Self {
        Self {
            last: AtomicU64::new(0),
            instance,
        }
    }

    /// Issue the next ID
    pub fn next(&self) -> CorrelationId {
        let now = unix_millis() << SEQ_BITS;
        let advance = |last: u64| now.max(last.saturating_add(1));

        // The closure always returns Some, so this is always Ok
        let prev = match self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(advance(last)))
        {
            Ok(prev) | Err(prev) => prev,
        };

        CorrelationId {
            value: advance(prev),
            instance: self.instance,
        }
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
