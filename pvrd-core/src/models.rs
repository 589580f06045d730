use std::fmt;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::NaiveTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

// identifiers

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct ChannelId(u32);

impl ChannelId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH#{}", self.0)
    }
}

impl From<u32> for ChannelId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub struct EventId(u32);

impl EventId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EID#{:04X}", self.0)
    }
}

impl From<u32> for EventId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
pub struct TimerId(u32);

impl TimerId {
    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T#{}", self.0)
    }
}

impl From<u32> for TimerId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

// Identifies the physical transmission a channel rides on.  Several channels
// share one transponder and can be recorded by a single device at the same
// time.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub struct Transponder(u32);

impl Transponder {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Transponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TP#{}", self.0)
    }
}

impl From<u32> for Transponder {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

// channel

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub number: u32,
    pub transponder: Transponder,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

// running status

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunningStatus {
    #[default]
    Undefined,
    NotRunning,
    StartsSoon,
    Pausing,
    Running,
}

// clock times
//
// Timers define their start and stop as whole minutes since midnight.  A stop
// at or before the start wraps to the next day.

pub fn minutes(hours: u32, mins: u32) -> u32 {
    hours * 60 + mins
}

pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

pub fn minutes_of_day(at: DateTime<Utc>) -> u32 {
    let midnight = day_start(at.date_naive());
    ((at - midnight).num_minutes() as u32) % MINUTES_PER_DAY
}

// chrono::Duration has no serde support of its own.

pub mod duration_seconds {
    use chrono::Duration;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(duration.num_seconds())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::seconds(i64::deserialize(deserializer)?))
    }
}

// </coverage:exclude>
