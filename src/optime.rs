use bson::Timestamp;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Position inside a replica set oplog.
///
/// It mirrors the oplog `ts` field: seconds since epoch plus an ordinal which makes entries
/// written in the same second unique.  Optimes are totally ordered by `(time, increment)`.
/// The zero optime sorts before every real oplog entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Optime {
    /// seconds since unix epoch.
    pub time: u32,
    /// ordinal of the entry inside `time`.
    pub increment: u32,
}

impl Optime {
    /// create an optime from its two components.
    pub fn new(time: u32, increment: u32) -> Self {
        Optime { time, increment }
    }

    /// true for the zero optime, which means "from the first oplog entry".
    pub fn is_zero(&self) -> bool {
        self.time == 0 && self.increment == 0
    }

    /// wall clock time of this optime, only used for logging.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.time as i64, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

impl Ord for Optime {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.increment).cmp(&(other.time, other.increment))
    }
}

impl PartialOrd for Optime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<Timestamp> for Optime {
    fn from(ts: Timestamp) -> Self {
        Optime::new(ts.time, ts.increment)
    }
}

impl From<Optime> for Timestamp {
    fn from(optime: Optime) -> Self {
        Timestamp {
            time: optime.time,
            increment: optime.increment,
        }
    }
}

impl fmt::Display for Optime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.time, self.increment)
    }
}
