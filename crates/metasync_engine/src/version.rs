//! Version tokens and storage timestamps.
//!
//! A version token is the `created_at` value of a change row. It packs up to
//! three times into one string: the data (creation) time, the content
//! modification time, and the metadata modification time. The later two are
//! stored as signed hexadecimal deltas in 10 µs ticks:
//!
//! ```text
//! 1528323859.12345+1f4+a
//! └──── data ────┘└┬─┘└┬┘
//!                 content ┘   └ meta
//! ```

use crate::error::{SyncError, SyncResult};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Number of ticks per second (one tick is 10 µs).
pub const TICKS_PER_SECOND: i64 = 100_000;

/// Number of fractional digits carried by a timestamp.
const FRACTION_DIGITS: usize = 5;

/// A storage timestamp: 10 µs ticks since the epoch plus an ordering offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp {
    ticks: i64,
    offset: u64,
}

impl Timestamp {
    /// Creates a timestamp from raw ticks.
    #[must_use]
    pub const fn from_ticks(ticks: i64) -> Self {
        Self { ticks, offset: 0 }
    }

    /// Creates a timestamp from whole seconds.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self::from_ticks(secs * TICKS_PER_SECOND)
    }

    /// Returns the raw tick count.
    #[must_use]
    pub const fn ticks(&self) -> i64 {
        self.ticks
    }

    /// Returns the ordering offset.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns true for the zero timestamp.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.ticks == 0 && self.offset == 0
    }

    /// Milliseconds since the epoch, rounded down.
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.ticks.div_euclid(100)
    }

    fn shifted(&self, delta: i64) -> SyncResult<Self> {
        if delta == 0 {
            return Ok(*self);
        }
        self.ticks
            .checked_add(delta)
            .map(Self::from_ticks)
            .ok_or_else(|| SyncError::InvalidVersionToken("timestamp delta overflows".into()))
    }
}

impl FromStr for Timestamp {
    type Err = SyncError;

    /// Parses `1528323859.12345`, `0000001528323859.12345` or the same with
    /// an `_<hex offset>` suffix.
    fn from_str(s: &str) -> SyncResult<Self> {
        let invalid = || SyncError::InvalidVersionToken(format!("malformed timestamp {s:?}"));

        let s = s.trim();
        let (seconds, offset) = match s.split_once('_') {
            Some((seconds, offset)) => {
                let offset = u64::from_str_radix(offset, 16).map_err(|_| invalid())?;
                (seconds, offset)
            }
            None => (s, 0),
        };

        let (whole, fraction) = seconds.split_once('.').unwrap_or((seconds, ""));
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let mut frac_ticks = 0i64;
        for (i, digit) in fraction.bytes().take(FRACTION_DIGITS).enumerate() {
            let weight = 10i64.pow((FRACTION_DIGITS - 1 - i) as u32);
            frac_ticks += i64::from(digit - b'0') * weight;
        }

        // round half up on the first dropped digit
        if fraction.as_bytes().get(FRACTION_DIGITS).is_some_and(|d| *d >= b'5') {
            frac_ticks += 1;
        }

        let ticks = whole
            .checked_mul(TICKS_PER_SECOND)
            .and_then(|t| t.checked_add(frac_ticks))
            .ok_or_else(invalid)?;

        Ok(Self { ticks, offset })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:010}.{:05}",
            self.ticks.div_euclid(TICKS_PER_SECOND),
            self.ticks.rem_euclid(TICKS_PER_SECOND)
        )?;
        if self.offset > 0 {
            write!(f, "_{:016x}", self.offset)?;
        }
        Ok(())
    }
}

/// The kind of change a row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// New object or new content.
    Put,
    /// Metadata-only update.
    Post,
    /// Object removed.
    Delete,
}

impl Operation {
    /// Wire name used in message payloads.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Put => "put",
            Operation::Post => "post",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded `created_at` value of a change row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionToken {
    data: Timestamp,
    content: Option<Timestamp>,
    meta: Option<Timestamp>,
}

impl VersionToken {
    /// Creates a token that only carries a data time.
    #[must_use]
    pub const fn new(data: Timestamp) -> Self {
        Self {
            data,
            content: None,
            meta: None,
        }
    }

    /// Creates a token with explicit content and metadata times.
    #[must_use]
    pub const fn with_times(data: Timestamp, content: Timestamp, meta: Timestamp) -> Self {
        Self {
            data,
            content: Some(content),
            meta: Some(meta),
        }
    }

    /// Creation time of the row.
    #[must_use]
    pub const fn data_time(&self) -> Timestamp {
        self.data
    }

    /// Content modification time, defaulting to the data time.
    #[must_use]
    pub fn content_time(&self) -> Timestamp {
        self.content.unwrap_or(self.data)
    }

    /// Metadata modification time, defaulting to the content time.
    #[must_use]
    pub fn meta_time(&self) -> Timestamp {
        self.meta.unwrap_or_else(|| self.content_time())
    }

    /// Returns true if the token encodes a content time.
    #[must_use]
    pub const fn has_explicit_content(&self) -> bool {
        self.content.is_some()
    }

    /// Returns true if the token encodes a metadata time.
    #[must_use]
    pub const fn has_explicit_meta(&self) -> bool {
        self.meta.is_some()
    }

    /// Returns true if the row only changed metadata.
    #[must_use]
    pub fn is_metadata_only(&self) -> bool {
        let non_zero = |t: Option<Timestamp>| t.is_some_and(|t| !t.is_zero());
        non_zero(self.content) || non_zero(self.meta)
    }

    /// Classifies a row carrying this token.
    #[must_use]
    pub fn operation(&self, deleted: bool) -> Operation {
        if deleted {
            Operation::Delete
        } else if self.is_metadata_only() {
            Operation::Post
        } else {
            Operation::Put
        }
    }
}

impl Ord for VersionToken {
    fn cmp(&self, other: &Self) -> Ordering {
        self.data
            .cmp(&other.data)
            .then_with(|| self.content_time().cmp(&other.content_time()))
            .then_with(|| self.meta_time().cmp(&other.meta_time()))
    }
}

impl PartialOrd for VersionToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn parse_delta(sign: u8, digits: &str, token: &str) -> SyncResult<i64> {
    let magnitude = i64::from_str_radix(digits, 16)
        .map_err(|_| SyncError::InvalidVersionToken(format!("malformed delta in {token:?}")))?;
    Ok(if sign == b'-' { -magnitude } else { magnitude })
}

impl FromStr for VersionToken {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        let s = s.trim();
        let split = s.find(['+', '-']).unwrap_or(s.len());
        let data: Timestamp = s[..split].parse()?;

        let mut deltas = Vec::with_capacity(2);
        let mut rest = &s[split..];
        while let Some(&sign) = rest.as_bytes().first() {
            let body = &rest[1..];
            let end = body.find(['+', '-']).unwrap_or(body.len());
            deltas.push(parse_delta(sign, &body[..end], s)?);
            rest = &body[end..];
        }

        match deltas.as_slice() {
            [] => Ok(Self::new(data)),
            [content] => Ok(Self {
                data,
                content: Some(data.shifted(*content)?),
                meta: None,
            }),
            [content, meta] => {
                let content = data.shifted(*content)?;
                Ok(Self {
                    data,
                    content: Some(content),
                    meta: Some(content.shifted(*meta)?),
                })
            }
            _ => Err(SyncError::InvalidVersionToken(format!(
                "too many components in {s:?}"
            ))),
        }
    }
}

fn write_delta(f: &mut fmt::Formatter<'_>, delta: i64) -> fmt::Result {
    let sign = if delta < 0 { '-' } else { '+' };
    write!(f, "{sign}{:x}", delta.unsigned_abs())
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data)?;
        if let Some(content) = self.content {
            write_delta(f, content.ticks - self.data.ticks)?;
            if let Some(meta) = self.meta {
                write_delta(f, meta.ticks - content.ticks)?;
            }
        }
        Ok(())
    }
}
