use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Datelike;
use chrono::Duration;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::epg::EpgEvent;
use crate::epg::EpgStore;
use crate::error::Error;
use crate::events::EventEmitter;
use crate::events::Notification;
use crate::events::TimerChanged;
use crate::models::Channel;
use crate::models::ChannelId;
use crate::models::EventId;
use crate::models::MINUTES_PER_DAY;
use crate::models::RunningStatus;
use crate::models::TimerId;
use crate::models::day_start;
use crate::models::minutes_of_day;

/// Score of an event whose span is exactly covered by a timer's window.
pub const FULL_COVERAGE: u32 = 1000;

// weekday mask

const WEEKDAY_LETTERS: [char; 7] = ['M', 'T', 'W', 'T', 'F', 'S', 'S'];

/// Seven bits, Monday is bit 0.  An empty mask means the timer fires at most
/// once, on its anchor day.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct WeekdayMask(u8);

impl WeekdayMask {
    pub const EMPTY: WeekdayMask = WeekdayMask(0);

    pub fn from_bits(bits: u8) -> Self {
        WeekdayMask(bits & 0x7F)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, weekday: chrono::Weekday) -> bool {
        self.0 & (1 << weekday.num_days_from_monday()) != 0
    }

    pub fn with(self, weekday: chrono::Weekday) -> Self {
        WeekdayMask(self.0 | (1 << weekday.num_days_from_monday()))
    }
}

impl fmt::Display for WeekdayMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, letter) in WEEKDAY_LETTERS.iter().enumerate() {
            if self.0 & (1 << i) != 0 {
                write!(f, "{}", letter)?;
            } else {
                write!(f, "-")?;
            }
        }
        Ok(())
    }
}

impl FromStr for WeekdayMask {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bits = 0u8;
        let mut count = 0;
        for (i, ch) in s.chars().enumerate() {
            count += 1;
            if i >= 7 {
                break;
            }
            if ch == WEEKDAY_LETTERS[i] {
                bits |= 1 << i;
            } else if ch != '-' {
                return Err(Error::InvalidTimerDefinition(format!(
                    "invalid weekdays `{}`",
                    s
                )));
            }
        }
        if count != 7 {
            return Err(Error::InvalidTimerDefinition(format!(
                "invalid weekdays `{}`",
                s
            )));
        }
        Ok(WeekdayMask(bits))
    }
}

// time window

/// The resolved `[start, stop)` instant pair for one occurrence of a timer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.stop
    }

    pub fn duration(&self) -> Duration {
        self.stop - self.start
    }
}

// event handle

/// Revocable reference to a guide event.  Resolved through the store's
/// current snapshot on demand so a replaced schedule can never dangle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct EventHandle {
    pub channel: ChannelId,
    pub event: EventId,
}

// timer

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Timer {
    pub id: TimerId,
    pub active: bool,
    /// Ad-hoc recording started from the current channel, not user-scheduled.
    pub instant: bool,
    pub uses_vps: bool,
    pub recording: bool,
    /// Auto-generated from a pattern rule.  Preserved but never matched
    /// differently from a regular timer.
    pub spawned: bool,
    pub avoid: bool,
    pub channel: ChannelId,
    /// Anchor date.  `None` on a repeating timer whose first-day constraint
    /// has expired.
    pub day: Option<NaiveDate>,
    pub weekdays: WeekdayMask,
    /// Minutes since midnight.
    pub start: u32,
    /// Minutes since midnight; at or before `start` means the next day.
    pub stop: u32,
    pub priority: i32,
    pub lifetime: u32,
    pub title: String,
    #[serde(skip)]
    pub deferred_until: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub pending: bool,
    pub event: Option<EventHandle>,
    #[serde(skip)]
    pub(crate) bound_version: u64,
    #[serde(skip)]
    pub(crate) cached_window: Option<TimeWindow>,
}

impl Timer {
    pub fn new(channel: ChannelId) -> Self {
        Timer {
            id: TimerId::default(),
            active: true,
            instant: false,
            uses_vps: false,
            recording: false,
            spawned: false,
            avoid: false,
            channel,
            day: None,
            weekdays: WeekdayMask::EMPTY,
            start: 0,
            stop: 0,
            priority: 50,
            lifetime: 99,
            title: String::new(),
            deferred_until: None,
            pending: false,
            event: None,
            bound_version: 0,
            cached_window: None,
        }
    }

    /// Builds a one-shot timer around a guide event, applying the configured
    /// start/stop margins.  A VPS-capable event recorded with VPS gets no
    /// margins; the broadcaster's timestamp is authoritative.
    pub fn from_event(event: &EpgEvent, config: &Config) -> Self {
        let uses_vps = config.recording.use_vps && event.vps_at.is_some();
        let (start_at, stop_at) = if uses_vps {
            (event.vps_at.unwrap_or(event.start_at), event.end_at())
        } else {
            (
                event.start_at - Duration::minutes(config.recording.start_margin as i64),
                event.end_at() + Duration::minutes(config.recording.stop_margin as i64),
            )
        };
        Timer {
            uses_vps,
            day: Some(start_at.date_naive()),
            start: minutes_of_day(start_at),
            stop: minutes_of_day(stop_at),
            priority: config.recording.default_priority,
            lifetime: config.recording.default_lifetime,
            title: event.title().to_string(),
            event: Some(EventHandle {
                channel: event.channel,
                event: event.id,
            }),
            ..Timer::new(event.channel)
        }
    }

    /// Builds the ad-hoc timer backing an instant or pause recording.
    pub fn new_instant(channel: &Channel, config: &Config, now: DateTime<Utc>) -> Self {
        let start = minutes_of_day(now);
        Timer {
            instant: true,
            day: Some(now.date_naive()),
            start,
            stop: (start + config.recording.instant_record_time) % MINUTES_PER_DAY,
            priority: config.recording.default_priority,
            lifetime: config.recording.default_lifetime,
            title: channel.name.clone(),
            ..Timer::new(channel.id)
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.start >= MINUTES_PER_DAY || self.stop >= MINUTES_PER_DAY {
            return Err(Error::InvalidTimerDefinition(format!(
                "start/stop must be within a day: {}/{}",
                self.start, self.stop
            )));
        }
        if self.weekdays.is_empty() && self.day.is_none() {
            return Err(Error::InvalidTimerDefinition(
                "a single-shot timer needs a day".to_string(),
            ));
        }
        Ok(())
    }

    fn day_window(&self, date: NaiveDate) -> TimeWindow {
        let start = day_start(date) + Duration::minutes(self.start as i64);
        let length = (self.stop + MINUTES_PER_DAY - self.start) % MINUTES_PER_DAY;
        TimeWindow {
            start,
            stop: start + Duration::minutes(length as i64),
        }
    }

    /// Resolves the occurrence relevant at `reference`.  `None` means no
    /// occurrence is due within the scan range.
    ///
    /// With `earliest` set, an occurrence on the reference's own day is
    /// returned even when its window has already elapsed; event scoring uses
    /// this to anchor the comparison at the actual broadcast.
    pub fn window_at(&self, reference: DateTime<Utc>, earliest: bool) -> Option<TimeWindow> {
        if self.weekdays.is_empty() {
            return self.day.map(|day| self.day_window(day));
        }
        let today = reference.date_naive();
        let base = match self.day {
            Some(day) => day.max(today),
            None => today,
        };
        for offset in -1..=7 {
            let date = base + Duration::days(offset);
            if !self.weekdays.contains(date.weekday()) {
                continue;
            }
            let window = self.day_window(date);
            if let Some(day) = self.day {
                if window.start < day_start(day) {
                    continue;
                }
            }
            // A previous day's occurrence only counts while its window still
            // reaches past `reference` (a stop wrapped past midnight).
            if window.stop > reference || (earliest && date >= today) {
                return Some(window);
            }
        }
        None
    }

    pub fn occurs_at(&self, at: DateTime<Utc>) -> bool {
        self.window_at(at, false)
            .is_some_and(|window| window.contains(at))
    }

    pub fn cached_window(&self) -> Option<TimeWindow> {
        self.cached_window
    }

    /// How much of `event`'s span this timer covers, in permille.
    ///
    /// A VPS timer scored against a VPS-stamped event matches all or
    /// nothing: 1100 on an exact start-time match, 1200 when the event is
    /// also reported as running, 0 otherwise.
    pub fn coverage(&self, event: &EpgEvent) -> u32 {
        let reference = match event.vps_at {
            Some(vps) if self.uses_vps => vps,
            _ => event.start_at,
        };
        let window = match self.window_at(reference, true) {
            Some(window) => window,
            None => return 0,
        };
        if self.uses_vps {
            if let Some(vps) = event.vps_at {
                if window.start != vps {
                    return 0;
                }
                return if event.running_status == RunningStatus::Running {
                    FULL_COVERAGE + 200
                } else {
                    FULL_COVERAGE + 100
                };
            }
        }
        let event_start = event.start_at;
        let event_end = event.end_at();
        if window.start <= event_start && event_end <= window.stop {
            return FULL_COVERAGE;
        }
        if event_end <= window.start || event_start >= window.stop {
            return 0;
        }
        let overlap = window.stop.min(event_end) - window.start.max(event_start);
        let duration = event.duration.num_seconds().max(1);
        (overlap.num_seconds() * FULL_COVERAGE as i64 / duration) as u32
    }

    fn same_schedule(&self, other: &Timer) -> bool {
        self.channel == other.channel
            && self.day == other.day
            && self.weekdays == other.weekdays
            && self.start == other.start
            && self.stop == other.stop
            && self.uses_vps == other.uses_vps
    }
}

// timers file codec
//
// One record per line.  `title` is always the last field and takes the rest
// of the line, so arbitrary titles survive a round trip.  Run-time state
// (deferral, the recording/pending flags) is intentionally absent.

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} active={} instant={} vps={} spawned={} avoid={} channel={} day={} weekdays={} \
             start={} stop={} priority={} lifetime={} title={}",
            self.id.value(),
            self.active as u8,
            self.instant as u8,
            self.uses_vps as u8,
            self.spawned as u8,
            self.avoid as u8,
            self.channel.value(),
            match self.day {
                Some(day) => day.format("%Y-%m-%d").to_string(),
                None => "-".to_string(),
            },
            self.weekdays,
            self.start,
            self.stop,
            self.priority,
            self.lifetime,
            self.title,
        )
    }
}

fn field<'a>(input: &'a str, key: &'static str) -> Result<(&'a str, &'a str), Error> {
    let rest = input
        .strip_prefix(key)
        .and_then(|rest| rest.strip_prefix('='))
        .ok_or_else(|| Error::InvalidTimerDefinition(format!("missing field `{}`", key)))?;
    match rest.split_once(' ') {
        Some((value, rest)) => Ok((value, rest)),
        None => Ok((rest, "")),
    }
}

fn parse_flag(value: &str, key: &'static str) -> Result<bool, Error> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(Error::InvalidTimerDefinition(format!(
            "invalid flag `{}`",
            key
        ))),
    }
}

fn parse_number<T: FromStr>(value: &str, key: &'static str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::InvalidTimerDefinition(format!("invalid number `{}`", key)))
}

impl FromStr for Timer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, rest) = field(s, "id")?;
        let (active, rest) = field(rest, "active")?;
        let (instant, rest) = field(rest, "instant")?;
        let (vps, rest) = field(rest, "vps")?;
        let (spawned, rest) = field(rest, "spawned")?;
        let (avoid, rest) = field(rest, "avoid")?;
        let (channel, rest) = field(rest, "channel")?;
        let (day, rest) = field(rest, "day")?;
        let (weekdays, rest) = field(rest, "weekdays")?;
        let (start, rest) = field(rest, "start")?;
        let (stop, rest) = field(rest, "stop")?;
        let (priority, rest) = field(rest, "priority")?;
        let (lifetime, rest) = field(rest, "lifetime")?;
        let title = rest
            .strip_prefix("title=")
            .ok_or_else(|| Error::InvalidTimerDefinition("missing field `title`".to_string()))?;
        let timer = Timer {
            id: TimerId::from(parse_number::<u32>(id, "id")?),
            active: parse_flag(active, "active")?,
            instant: parse_flag(instant, "instant")?,
            uses_vps: parse_flag(vps, "vps")?,
            spawned: parse_flag(spawned, "spawned")?,
            avoid: parse_flag(avoid, "avoid")?,
            channel: ChannelId::from(parse_number::<u32>(channel, "channel")?),
            day: match day {
                "-" => None,
                _ => Some(NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|_| {
                    Error::InvalidTimerDefinition(format!("invalid day `{}`", day))
                })?),
            },
            weekdays: weekdays.parse()?,
            start: parse_number(start, "start")?,
            stop: parse_number(stop, "stop")?,
            priority: parse_number(priority, "priority")?,
            lifetime: parse_number(lifetime, "lifetime")?,
            title: title.to_string(),
            ..Timer::new(ChannelId::from(0))
        };
        timer.validate()?;
        Ok(timer)
    }
}

// table

/// All known timers, in insertion order.  Scans take the read lock so the
/// driver tick and UI queries never block each other; structural mutation
/// and flag changes take the write lock.
pub struct TimerTable {
    inner: RwLock<Inner>,
    // Index of the timer most recently handed out for starting; -1 while no
    // timer matches.  Keeps repeated polls within one tick from re-selecting
    // a timer whose start is still in flight.
    last_pending: AtomicI64,
    modified: AtomicBool,
    emitter: EventEmitter,
}

#[derive(Default)]
struct Inner {
    timers: Vec<Timer>,
    next_id: u32,
}

impl TimerTable {
    pub fn new(emitter: EventEmitter) -> Self {
        TimerTable {
            inner: RwLock::new(Inner {
                timers: Vec::new(),
                next_id: 1,
            }),
            last_pending: AtomicI64::new(-1),
            modified: AtomicBool::new(false),
            emitter,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.timers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.timers.is_empty()
    }

    pub async fn get(&self, id: TimerId) -> Option<Timer> {
        self.inner
            .read()
            .await
            .timers
            .iter()
            .find(|timer| timer.id == id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<Timer> {
        self.inner.read().await.timers.clone()
    }

    pub async fn add(&self, mut timer: Timer) -> Result<TimerId, Error> {
        timer.validate()?;
        let id = {
            let mut inner = self.inner.write().await;
            if !timer.id.is_assigned() {
                timer.id = TimerId::from(inner.next_id);
            }
            if inner.timers.iter().any(|t| t.id == timer.id) {
                return Err(Error::InvalidTimerDefinition(format!(
                    "duplicate id {}",
                    timer.id
                )));
            }
            inner.next_id = inner.next_id.max(timer.id.value() + 1);
            let id = timer.id;
            tracing::info!(timer.id = %id, timer.title = %timer.title, "Added timer");
            inner.timers.push(timer);
            id
        };
        self.mark_modified();
        self.notify(id);
        Ok(id)
    }

    pub async fn update(&self, mut timer: Timer) -> Result<(), Error> {
        timer.validate()?;
        let id = timer.id;
        {
            let mut inner = self.inner.write().await;
            let slot = inner
                .timers
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(Error::TimerNotFound)?;
            timer.recording = slot.recording;
            timer.pending = slot.pending;
            if timer.same_schedule(slot) {
                timer.event = slot.event;
                timer.bound_version = slot.bound_version;
                timer.cached_window = slot.cached_window;
                timer.deferred_until = slot.deferred_until;
            } else {
                // The definition changed; everything derived from it is
                // stale.
                timer.event = None;
                timer.bound_version = 0;
                timer.cached_window = None;
                timer.deferred_until = None;
            }
            *slot = timer;
        }
        tracing::info!(timer.id = %id, "Updated timer");
        self.mark_modified();
        self.notify(id);
        Ok(())
    }

    pub async fn remove(&self, id: TimerId) -> Result<Timer, Error> {
        let timer = {
            let mut inner = self.inner.write().await;
            let index = inner
                .timers
                .iter()
                .position(|timer| timer.id == id)
                .ok_or(Error::TimerNotFound)?;
            inner.timers.remove(index)
        };
        tracing::info!(timer.id = %id, timer.title = %timer.title, "Removed timer");
        self.mark_modified();
        self.notify(id);
        Ok(timer)
    }

    /// The timer that should be recording right now, or `None`.
    ///
    /// The highest priority wins; the first-seen timer wins an exact tie.
    /// A pending timer (selected earlier but not recording yet) is
    /// reconsidered at most once per round; the round ends when no timer
    /// matches at all.
    pub async fn find_active(&self, now: DateTime<Utc>) -> Option<Timer> {
        let inner = self.inner.read().await;
        let mut last_pending = self.last_pending.load(Ordering::Relaxed);
        let mut best: Option<(usize, &Timer)> = None;
        for (index, timer) in inner.timers.iter().enumerate() {
            if !timer.active || timer.avoid || timer.recording {
                continue;
            }
            if matches!(timer.deferred_until, Some(until) if until > now) {
                continue;
            }
            if !timer.occurs_at(now) {
                continue;
            }
            if timer.pending {
                if (index as i64) > last_pending {
                    last_pending = index as i64;
                } else {
                    continue;
                }
            }
            match best {
                Some((_, t0)) if t0.priority >= timer.priority => (),
                _ => best = Some((index, timer)),
            }
        }
        match best {
            Some((index, timer)) => {
                self.last_pending.store(index as i64, Ordering::Relaxed);
                Some(timer.clone())
            }
            None => {
                self.last_pending.store(-1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Re-resolves each timer's bound event against schedule snapshots newer
    /// than the one it was last bound against.
    pub async fn bind_events(&self, store: &EpgStore, now: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        for timer in inner.timers.iter_mut() {
            let schedule = match store.schedule(timer.channel).await {
                Some(schedule) => schedule,
                None => continue,
            };
            if schedule.version <= timer.bound_version {
                continue;
            }
            timer.bound_version = schedule.version;
            if timer.uses_vps {
                let mut best: Option<(&EpgEvent, u32)> = None;
                for event in schedule.events.iter() {
                    let score = timer.coverage(event);
                    if score <= FULL_COVERAGE {
                        continue;
                    }
                    best = match best {
                        Some((e0, s0))
                            if s0 > score || (s0 == score && e0.duration >= event.duration) =>
                        {
                            Some((e0, s0))
                        }
                        _ => Some((event, score)),
                    };
                }
                match best {
                    Some((event, _)) => {
                        timer.event = Some(EventHandle {
                            channel: timer.channel,
                            event: event.id,
                        });
                    }
                    None => {
                        // A live VPS recording keeps its stale metadata until
                        // the window has fully elapsed.
                        let elapsed = timer
                            .window_at(now, false)
                            .is_none_or(|window| window.stop <= now);
                        if elapsed {
                            timer.event = None;
                        }
                    }
                }
            } else {
                let window = match timer.window_at(now, false) {
                    Some(window) => window,
                    None => {
                        timer.event = None;
                        continue;
                    }
                };
                let from = window.start - Duration::hours(1);
                let to = window.stop + Duration::hours(1);
                let mut best: Option<(&EpgEvent, u32)> = None;
                for event in schedule.events_between(from, to) {
                    let score = timer.coverage(event);
                    if score == 0 {
                        continue;
                    }
                    best = match best {
                        Some((e0, s0))
                            if s0 > score || (s0 == score && e0.duration >= event.duration) =>
                        {
                            Some((e0, s0))
                        }
                        _ => Some((event, score)),
                    };
                }
                timer.event = best.map(|(event, _)| EventHandle {
                    channel: timer.channel,
                    event: event.id,
                });
            }
        }
    }

    /// Removes single-occurrence timers whose window has been over for more
    /// than `grace`.
    pub async fn expire(&self, now: DateTime<Utc>, grace: Duration) {
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.write().await;
            inner.timers.retain(|timer| {
                if !timer.weekdays.is_empty() || timer.recording {
                    return true;
                }
                let expired = timer
                    .window_at(now, false)
                    .is_some_and(|window| window.stop + grace <= now);
                if expired {
                    removed.push((timer.id, timer.title.clone()));
                }
                !expired
            });
        }
        for (id, title) in removed {
            tracing::info!(timer.id = %id, timer.title = %title, "Expired, removed timer");
            self.mark_modified();
            self.notify(id);
        }
    }

    /// Slow-path housekeeping: refreshes cached windows and retires the
    /// first-day anchor of repeating timers once it lies safely in the past
    /// (one full day plus an hour of margin).
    pub async fn maintain(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        for timer in inner.timers.iter_mut() {
            let window = timer.window_at(now, false);
            timer.cached_window = window;
            if timer.weekdays.is_empty() {
                continue;
            }
            if let Some(day) = timer.day {
                if window.is_some() && now > day_start(day) + Duration::hours(25) {
                    tracing::debug!(timer.id = %timer.id, "First-day constraint expired");
                    timer.day = None;
                    self.mark_modified();
                }
            }
        }
    }

    /// The best-covering timer for an externally supplied event.
    pub async fn match_event(&self, event: &EpgEvent) -> Option<(Timer, u32)> {
        let inner = self.inner.read().await;
        let mut best: Option<(&Timer, u32)> = None;
        for timer in inner.timers.iter() {
            if timer.channel != event.channel {
                continue;
            }
            let score = timer.coverage(event);
            if score == 0 {
                continue;
            }
            best = match best {
                Some((t0, s0)) if s0 >= score => Some((t0, s0)),
                _ => Some((timer, score)),
            };
        }
        best.map(|(timer, score)| (timer.clone(), score))
    }

    pub async fn mark_pending(&self, id: TimerId) {
        let mut inner = self.inner.write().await;
        if let Some(timer) = inner.timers.iter_mut().find(|timer| timer.id == id) {
            timer.pending = true;
        }
    }

    pub async fn mark_recording(&self, id: TimerId, recording: bool) {
        {
            let mut inner = self.inner.write().await;
            if let Some(timer) = inner.timers.iter_mut().find(|timer| timer.id == id) {
                timer.recording = recording;
                if recording {
                    timer.pending = false;
                    timer.deferred_until = None;
                }
            }
        }
        self.mark_modified();
    }

    /// Excludes the timer from matching until `until`, after a failed start.
    pub async fn defer(&self, id: TimerId, until: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        if let Some(timer) = inner.timers.iter_mut().find(|timer| timer.id == id) {
            tracing::debug!(timer.id = %id, %until, "Deferred timer");
            timer.deferred_until = Some(until);
            timer.pending = false;
        }
    }

    pub async fn set_active(&self, id: TimerId, active: bool) -> Result<(), Error> {
        {
            let mut inner = self.inner.write().await;
            let timer = inner
                .timers
                .iter_mut()
                .find(|timer| timer.id == id)
                .ok_or(Error::TimerNotFound)?;
            timer.active = active;
            timer.pending = false;
        }
        self.mark_modified();
        self.notify(id);
        Ok(())
    }

    // persistence

    /// Replaces the table with the records in `path`.  Malformed lines are
    /// skipped with a warning; run-time state is reset on every record.
    pub async fn load<P>(&self, path: P) -> Result<usize, Error>
    where
        P: AsRef<Path>,
        P: std::fmt::Debug,
    {
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(?path, "No timers file");
                return Ok(0);
            }
            Err(err) => return Err(err.into()),
        };
        let mut inner = self.inner.write().await;
        inner.timers.clear();
        inner.next_id = 1;
        let mut count = 0;
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Timer>() {
                Ok(timer) => {
                    if inner.timers.iter().any(|t| t.id == timer.id) {
                        tracing::warn!(timer.id = %timer.id, line = lineno + 1, "Duplicate timer id, skipped");
                        continue;
                    }
                    inner.next_id = inner.next_id.max(timer.id.value() + 1);
                    inner.timers.push(timer);
                    count += 1;
                }
                Err(err) => {
                    tracing::warn!(%err, line = lineno + 1, ?path, "Skipped malformed timer record");
                }
            }
        }
        tracing::info!(timers.len = count, ?path, "Loaded timers");
        Ok(count)
    }

    /// Writes every persisted timer to `path`, one record per line, through
    /// a `<path>.new` rename so a crash never leaves a half-written file.
    /// Ad-hoc instant timers are run-time-only and stay out of the file.
    pub async fn save<P>(&self, path: P) -> bool
    where
        P: AsRef<Path>,
        P: std::fmt::Debug,
    {
        let mut buf = String::new();
        {
            let inner = self.inner.read().await;
            for timer in inner.timers.iter().filter(|timer| !timer.instant) {
                buf.push_str(&timer.to_string());
                buf.push('\n');
            }
        }
        let new_path = append_extension(&path, "new");
        let result = std::fs::File::create(&new_path)
            .and_then(|mut file| {
                use std::io::Write;
                file.write_all(buf.as_bytes())?;
                file.sync_all()
            })
            .and_then(|_| std::fs::rename(&new_path, &path));
        match result {
            Ok(_) => {
                self.modified.store(false, Ordering::Relaxed);
                tracing::debug!(?path, "Saved timers");
                true
            }
            Err(err) => {
                tracing::error!(%err, ?path, "Failed to save timers");
                false
            }
        }
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Relaxed)
    }

    fn mark_modified(&self) {
        self.modified.store(true, Ordering::Relaxed);
    }

    fn notify(&self, id: TimerId) {
        self.emitter
            .emit(Notification::TimerChanged(TimerChanged { timer_id: id }));
    }
}

fn append_extension<P, S>(path: P, ext: S) -> std::path::PathBuf
where
    P: AsRef<Path>,
    S: AsRef<std::ffi::OsStr>,
{
    let path = path.as_ref();
    match path.extension() {
        Some(last_ext) => {
            let mut last_ext = last_ext.to_os_string();
            last_ext.push(".");
            last_ext.push(ext);
            path.with_extension(last_ext)
        }
        None => path.with_extension(ext),
    }
}

// <coverage:exclude>
#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Weekday;
    use itertools::Itertools;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        day_start(date(y, m, d)) + Duration::minutes((h * 60 + min) as i64)
    }

    fn single(day: NaiveDate, start: u32, stop: u32) -> Timer {
        Timer {
            day: Some(day),
            start,
            stop,
            ..Timer::new(1.into())
        }
    }

    fn weekly(weekdays: WeekdayMask, start: u32, stop: u32) -> Timer {
        Timer {
            weekdays,
            start,
            stop,
            ..Timer::new(1.into())
        }
    }

    fn event_for(timer: &Timer, start_at: DateTime<Utc>, minutes: i64) -> EpgEvent {
        EpgEvent {
            start_at,
            duration: Duration::minutes(minutes),
            ..EpgEvent::new(1.into(), timer.channel)
        }
    }

    fn table() -> TimerTable {
        TimerTable::new(EventEmitter::default())
    }

    #[test]
    fn test_weekday_mask_codec() {
        let mask = WeekdayMask::EMPTY
            .with(Weekday::Mon)
            .with(Weekday::Wed)
            .with(Weekday::Sun);
        assert_eq!(mask.to_string(), "M-W---S");
        assert_eq!("M-W---S".parse::<WeekdayMask>().unwrap(), mask);
        assert_eq!("-------".parse::<WeekdayMask>().unwrap(), WeekdayMask::EMPTY);
        assert_matches!("MTWTFSS".parse::<WeekdayMask>(), Ok(mask) => {
            assert_eq!(mask.bits(), 0x7F);
        });
        assert_matches!("".parse::<WeekdayMask>(), Err(Error::InvalidTimerDefinition(_)));
        assert_matches!("M-W---X".parse::<WeekdayMask>(), Err(Error::InvalidTimerDefinition(_)));
        assert_matches!("M-W---SS".parse::<WeekdayMask>(), Err(Error::InvalidTimerDefinition(_)));
    }

    #[test]
    fn test_window_single_shot() {
        // 2026-08-03 is a Monday.
        let timer = single(date(2026, 8, 3), 720, 780);
        let window = timer.window_at(at(2026, 8, 1, 0, 0), false).unwrap();
        assert_eq!(window.start, at(2026, 8, 3, 12, 0));
        assert_eq!(window.stop, at(2026, 8, 3, 13, 0));
        // The same window regardless of the reference instant.
        assert_eq!(timer.window_at(at(2026, 9, 1, 0, 0), false), Some(window));
    }

    #[test]
    fn test_window_wraps_past_midnight() {
        let timer = single(date(2026, 8, 3), 1380, 30);
        let window = timer.window_at(at(2026, 8, 3, 0, 0), false).unwrap();
        assert_eq!(window.start, at(2026, 8, 3, 23, 0));
        assert_eq!(window.stop, at(2026, 8, 4, 0, 30));
        assert_eq!(window.duration(), Duration::minutes(90));
    }

    #[test]
    fn test_window_duration_is_minutes_mod_day() {
        for (start, stop) in [(0, 0), (720, 780), (1380, 30), (30, 1380), (100, 100)] {
            let timer = single(date(2026, 8, 3), start, stop);
            let window = timer.window_at(at(2026, 8, 3, 0, 0), false).unwrap();
            let expected = (stop + MINUTES_PER_DAY - start) % MINUTES_PER_DAY;
            assert_eq!(window.duration(), Duration::minutes(expected as i64));
        }
    }

    #[test]
    fn test_window_weekly_scenario() {
        // Monday-only timer evaluated on a Wednesday resolves to the
        // following Monday.
        let timer = weekly(WeekdayMask::EMPTY.with(Weekday::Mon), 720, 780);
        let window = timer.window_at(at(2026, 8, 5, 10, 0), false).unwrap();
        assert_eq!(window.start, at(2026, 8, 10, 12, 0));
        assert_eq!(window.stop, at(2026, 8, 10, 13, 0));
    }

    #[test]
    fn test_window_weekly_prefers_running_occurrence() {
        // Evaluated in the middle of today's occurrence, today's window wins
        // over next week's.
        let timer = weekly(WeekdayMask::EMPTY.with(Weekday::Wed), 720, 780);
        let window = timer.window_at(at(2026, 8, 5, 12, 30), false).unwrap();
        assert_eq!(window.start, at(2026, 8, 5, 12, 0));
    }

    #[test]
    fn test_window_respects_anchor_day() {
        // Anchored two weeks out: occurrences before the anchor do not
        // count, and the scan starts at the anchor itself.
        let timer = Timer {
            day: Some(date(2026, 8, 17)),
            ..weekly(WeekdayMask::EMPTY.with(Weekday::Mon), 720, 780)
        };
        let window = timer.window_at(at(2026, 8, 5, 10, 0), false).unwrap();
        assert_eq!(window.start, at(2026, 8, 17, 12, 0));
        assert!(!timer.occurs_at(at(2026, 8, 10, 12, 30)));
    }

    #[test]
    fn test_window_earliest_ignores_elapsed_stop() {
        let timer = weekly(WeekdayMask::EMPTY.with(Weekday::Mon), 720, 780);
        // Monday 14:00: the day's occurrence is over.
        let reference = at(2026, 8, 3, 14, 0);
        assert_eq!(
            timer.window_at(reference, false).unwrap().start,
            at(2026, 8, 10, 12, 0)
        );
        assert_eq!(
            timer.window_at(reference, true).unwrap().start,
            at(2026, 8, 3, 12, 0)
        );
    }

    #[test]
    fn test_coverage_plain() {
        let timer = single(date(2026, 8, 3), 720, 780);

        // Identical span.
        let event = event_for(&timer, at(2026, 8, 3, 12, 0), 60);
        assert_eq!(timer.coverage(&event), FULL_COVERAGE);

        // Fully contained.
        let event = event_for(&timer, at(2026, 8, 3, 12, 10), 30);
        assert_eq!(timer.coverage(&event), FULL_COVERAGE);

        // Half covered.
        let event = event_for(&timer, at(2026, 8, 3, 12, 30), 60);
        assert_eq!(timer.coverage(&event), 500);

        // Disjoint.
        let event = event_for(&timer, at(2026, 8, 3, 14, 0), 60);
        assert_eq!(timer.coverage(&event), 0);

        // Zero-duration events never divide by zero.
        let event = event_for(&timer, at(2026, 8, 3, 12, 30), 0);
        assert_eq!(timer.coverage(&event), FULL_COVERAGE);
    }

    #[test]
    fn test_coverage_repeating() {
        // Each day's broadcast is scored against that day's own occurrence,
        // not the previous day's.
        let daily = weekly(WeekdayMask::from_bits(0x7F), 720, 780);
        let event = event_for(&daily, at(2026, 8, 5, 12, 0), 60);
        assert_eq!(daily.coverage(&event), FULL_COVERAGE);
        let event = event_for(&daily, at(2026, 8, 5, 12, 30), 60);
        assert_eq!(daily.coverage(&event), 500);

        // A broadcast crossing midnight is still covered by the occurrence
        // that started the evening before.
        let night = weekly(WeekdayMask::from_bits(0x7F), 1380, 30);
        let event = event_for(&night, at(2026, 8, 5, 23, 0), 90);
        assert_eq!(night.coverage(&event), FULL_COVERAGE);

        // A weekly timer covers the broadcast on its weekday and nothing on
        // the other days.
        let monday = weekly(WeekdayMask::EMPTY.with(Weekday::Mon), 720, 780);
        let event = event_for(&monday, at(2026, 8, 10, 12, 0), 60);
        assert_eq!(monday.coverage(&event), FULL_COVERAGE);
        let event = event_for(&monday, at(2026, 8, 11, 12, 0), 60);
        assert_eq!(monday.coverage(&event), 0);
    }

    #[test]
    fn test_coverage_vps() {
        let timer = Timer {
            uses_vps: true,
            ..single(date(2026, 8, 3), 720, 780)
        };

        let mut event = EpgEvent {
            vps_at: Some(at(2026, 8, 3, 12, 0)),
            ..event_for(&timer, at(2026, 8, 3, 12, 0), 60)
        };
        assert_eq!(timer.coverage(&event), 1100);

        event.running_status = RunningStatus::Running;
        assert_eq!(timer.coverage(&event), 1200);

        // Shifted VPS time never matches, regardless of the span.
        event.vps_at = Some(at(2026, 8, 3, 12, 1));
        assert_eq!(timer.coverage(&event), 0);

        // Without a VPS stamp the plain overlap rule applies.
        event.vps_at = None;
        event.running_status = RunningStatus::Undefined;
        assert_eq!(timer.coverage(&event), FULL_COVERAGE);
    }

    #[test]
    fn test_coverage_bounds() {
        let timer = Timer {
            uses_vps: true,
            ..single(date(2026, 8, 3), 720, 780)
        };
        for minutes in [0, 10, 60, 120] {
            for offset in [-60i64, -30, 0, 30, 60] {
                let event = EpgEvent {
                    vps_at: Some(at(2026, 8, 3, 12, 0) + Duration::minutes(offset)),
                    ..event_for(&timer, at(2026, 8, 3, 12, 0) + Duration::minutes(offset), minutes)
                };
                let score = timer.coverage(&event);
                assert!(score <= 1200, "score {} out of bounds", score);
            }
        }
    }

    #[test]
    fn test_timer_from_event_applies_margins() {
        let config = Config::default();
        let event = EpgEvent {
            start_at: at(2026, 8, 3, 12, 0),
            duration: Duration::minutes(60),
            title: Some("News".to_string()),
            ..EpgEvent::new(10.into(), 3.into())
        };
        let timer = Timer::from_event(&event, &config);
        assert_eq!(timer.channel, 3.into());
        assert_eq!(timer.day, Some(date(2026, 8, 3)));
        assert_eq!(timer.start, 718);
        assert_eq!(timer.stop, 790);
        assert!(!timer.uses_vps);
        assert_eq!(timer.title, "News");
        assert_eq!(timer.coverage(&event), FULL_COVERAGE);

        // With VPS enabled the broadcaster's timestamp is authoritative and
        // margins do not apply.
        let mut config = config;
        config.recording.use_vps = true;
        let event = EpgEvent {
            vps_at: Some(at(2026, 8, 3, 12, 0)),
            ..event
        };
        let timer = Timer::from_event(&event, &config);
        assert!(timer.uses_vps);
        assert_eq!(timer.start, 720);
        assert_eq!(timer.stop, 780);
        assert_eq!(timer.coverage(&event), 1100);
    }

    #[test]
    fn test_timer_codec_roundtrip() {
        let timer = Timer {
            id: 3.into(),
            uses_vps: true,
            day: Some(date(2026, 8, 3)),
            start: 720,
            stop: 780,
            priority: 70,
            lifetime: 30,
            title: "News at = noon (repeat)".to_string(),
            ..Timer::new(5.into())
        };
        let line = timer.to_string();
        let parsed: Timer = line.parse().unwrap();
        assert_eq!(parsed, timer);
        assert_eq!(parsed.to_string(), line);

        let timer = Timer {
            id: 4.into(),
            weekdays: WeekdayMask::EMPTY.with(Weekday::Mon).with(Weekday::Fri),
            day: None,
            start: 1380,
            stop: 30,
            ..Timer::new(5.into())
        };
        let parsed: Timer = timer.to_string().parse().unwrap();
        assert_eq!(parsed, timer);
    }

    #[test]
    fn test_timer_codec_rejects_malformed() {
        assert_matches!(
            "id=x".parse::<Timer>(),
            Err(Error::InvalidTimerDefinition(_))
        );
        // A single-shot timer without a day.
        let line = "id=1 active=1 instant=0 vps=0 spawned=0 avoid=0 channel=1 day=- \
                    weekdays=------- start=720 stop=780 priority=50 lifetime=99 title=x";
        assert_matches!(line.parse::<Timer>(), Err(Error::InvalidTimerDefinition(_)));
        // Out-of-range clock time.
        let line = "id=1 active=1 instant=0 vps=0 spawned=0 avoid=0 channel=1 day=2026-08-03 \
                    weekdays=------- start=1440 stop=780 priority=50 lifetime=99 title=x";
        assert_matches!(line.parse::<Timer>(), Err(Error::InvalidTimerDefinition(_)));
        // Missing title field.
        let line = "id=1 active=1 instant=0 vps=0 spawned=0 avoid=0 channel=1 day=2026-08-03 \
                    weekdays=------- start=720 stop=780 priority=50 lifetime=99";
        assert_matches!(line.parse::<Timer>(), Err(Error::InvalidTimerDefinition(_)));
    }

    #[tokio::test]
    async fn test_add_assigns_ids() {
        let table = table();
        let id1 = table.add(single(date(2026, 8, 3), 720, 780)).await.unwrap();
        let id2 = table.add(single(date(2026, 8, 3), 800, 860)).await.unwrap();
        assert_eq!(id1, 1.into());
        assert_eq!(id2, 2.into());
        assert_matches!(
            table
                .add(Timer {
                    id: 2.into(),
                    ..single(date(2026, 8, 3), 900, 960)
                })
                .await,
            Err(Error::InvalidTimerDefinition(_))
        );
    }

    #[tokio::test]
    async fn test_find_active_picks_highest_priority() {
        let timers = [
            Timer {
                priority: 50,
                title: "p50".to_string(),
                ..single(date(2026, 8, 3), 720, 780)
            },
            Timer {
                priority: 70,
                title: "p70".to_string(),
                ..single(date(2026, 8, 3), 720, 780)
            },
            Timer {
                priority: 10,
                title: "p10".to_string(),
                ..single(date(2026, 8, 3), 720, 780)
            },
        ];
        let now = at(2026, 8, 3, 12, 30);
        for permutation in timers.iter().permutations(timers.len()) {
            let table = table();
            for timer in permutation {
                table.add(timer.clone()).await.unwrap();
            }
            assert_matches!(table.find_active(now).await, Some(timer) => {
                assert_eq!(timer.priority, 70);
            });
        }
    }

    #[tokio::test]
    async fn test_find_active_tie_prefers_first() {
        let table = table();
        let first = table.add(single(date(2026, 8, 3), 720, 780)).await.unwrap();
        table.add(single(date(2026, 8, 3), 720, 780)).await.unwrap();
        let now = at(2026, 8, 3, 12, 30);
        assert_matches!(table.find_active(now).await, Some(timer) => {
            assert_eq!(timer.id, first);
        });
    }

    #[tokio::test]
    async fn test_find_active_skips_flagged() {
        let table = table();
        table
            .add(Timer {
                active: false,
                ..single(date(2026, 8, 3), 720, 780)
            })
            .await
            .unwrap();
        table
            .add(Timer {
                avoid: true,
                ..single(date(2026, 8, 3), 720, 780)
            })
            .await
            .unwrap();
        let now = at(2026, 8, 3, 12, 30);
        assert_matches!(table.find_active(now).await, None);
    }

    #[tokio::test]
    async fn test_find_active_skips_deferred() {
        let table = table();
        let now = at(2026, 8, 3, 12, 30);
        let id = table.add(single(date(2026, 8, 3), 720, 780)).await.unwrap();
        table.defer(id, now + Duration::seconds(30)).await;
        assert_matches!(table.find_active(now).await, None);
        assert_matches!(table.find_active(now + Duration::seconds(30)).await, Some(_));
    }

    #[tokio::test]
    async fn test_find_active_pending_watermark() {
        let table = table();
        let now = at(2026, 8, 3, 12, 30);
        let low = table
            .add(Timer {
                priority: 50,
                ..single(date(2026, 8, 3), 720, 780)
            })
            .await
            .unwrap();
        let high = table
            .add(Timer {
                priority: 70,
                ..single(date(2026, 8, 3), 720, 780)
            })
            .await
            .unwrap();

        let selected = table.find_active(now).await.unwrap();
        assert_eq!(selected.id, high);
        table.mark_pending(high).await;

        // Within the same tick the pending winner is not selected again; the
        // next device gets the lower-priority timer.
        let selected = table.find_active(now).await.unwrap();
        assert_eq!(selected.id, low);
    }

    #[tokio::test]
    async fn test_find_active_retries_pending_next_round() {
        let table = table();
        let now = at(2026, 8, 3, 12, 30);
        let id = table.add(single(date(2026, 8, 3), 720, 780)).await.unwrap();

        assert_matches!(table.find_active(now).await, Some(_));
        table.mark_pending(id).await;
        // Start still in flight, skipped; the round ends with no match.
        assert_matches!(table.find_active(now).await, None);
        // A fresh round reconsiders the pending timer once.
        assert_matches!(table.find_active(now).await, Some(timer) => {
            assert_eq!(timer.id, id);
        });
    }

    #[tokio::test]
    async fn test_find_active_skips_recording() {
        let table = table();
        let now = at(2026, 8, 3, 12, 30);
        let id = table.add(single(date(2026, 8, 3), 720, 780)).await.unwrap();
        table.mark_recording(id, true).await;
        assert_matches!(table.find_active(now).await, None);
        table.mark_recording(id, false).await;
        assert_matches!(table.find_active(now).await, Some(_));
    }

    #[tokio::test]
    async fn test_expire() {
        let table = table();
        let grace = Duration::seconds(60);
        let done = table.add(single(date(2026, 8, 3), 720, 780)).await.unwrap();
        let repeating = table
            .add(weekly(WeekdayMask::EMPTY.with(Weekday::Mon), 720, 780))
            .await
            .unwrap();
        let live = table.add(single(date(2026, 8, 3), 720, 840)).await.unwrap();
        table.mark_recording(live, true).await;

        table.expire(at(2026, 8, 3, 13, 2), grace).await;

        assert_matches!(table.get(done).await, None);
        assert_matches!(table.get(repeating).await, Some(_));
        assert_matches!(table.get(live).await, Some(_));
    }

    #[tokio::test]
    async fn test_maintain_retires_first_day() {
        let table = table();
        let id = table
            .add(Timer {
                day: Some(date(2026, 8, 3)),
                ..weekly(WeekdayMask::EMPTY.with(Weekday::Mon), 720, 780)
            })
            .await
            .unwrap();

        // Less than a day past the anchor: kept.
        table.maintain(at(2026, 8, 4, 0, 30)).await;
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_eq!(timer.day, Some(date(2026, 8, 3)));
        });

        // More than a day plus an hour past the anchor: retired.
        table.maintain(at(2026, 8, 4, 1, 30)).await;
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_matches!(timer.day, None);
            assert_matches!(timer.cached_window(), Some(_));
        });
    }

    #[tokio::test]
    async fn test_bind_events_plain() {
        let store = EpgStore::new();
        let table = table();
        let id = table.add(single(date(2026, 8, 3), 720, 780)).await.unwrap();
        let now = at(2026, 8, 3, 11, 0);

        let exact = EpgEvent {
            start_at: at(2026, 8, 3, 12, 0),
            duration: Duration::minutes(60),
            ..EpgEvent::new(10.into(), 1.into())
        };
        let partial = EpgEvent {
            start_at: at(2026, 8, 3, 12, 40),
            duration: Duration::minutes(60),
            ..EpgEvent::new(11.into(), 1.into())
        };
        store
            .update_schedule(1.into(), vec![exact.clone(), partial])
            .await;

        table.bind_events(&store, now).await;
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_eq!(timer.event, Some(EventHandle { channel: 1.into(), event: 10.into() }));
        });

        // A replaced schedule without any overlapping event unbinds.
        store.update_schedule(1.into(), vec![]).await;
        table.bind_events(&store, now).await;
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_matches!(timer.event, None);
        });
    }

    #[tokio::test]
    async fn test_bind_events_prefers_longer_on_tie() {
        let store = EpgStore::new();
        let table = table();
        let id = table.add(single(date(2026, 8, 3), 720, 780)).await.unwrap();

        // Both fully contained, both score 1000; the longer one wins.
        let short = EpgEvent {
            start_at: at(2026, 8, 3, 12, 0),
            duration: Duration::minutes(20),
            ..EpgEvent::new(10.into(), 1.into())
        };
        let long = EpgEvent {
            start_at: at(2026, 8, 3, 12, 20),
            duration: Duration::minutes(40),
            ..EpgEvent::new(11.into(), 1.into())
        };
        store.update_schedule(1.into(), vec![short, long]).await;

        table.bind_events(&store, at(2026, 8, 3, 11, 0)).await;
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_eq!(timer.event.unwrap().event, 11.into());
        });
    }

    #[tokio::test]
    async fn test_bind_events_vps_keeps_stale_binding_while_live() {
        let store = EpgStore::new();
        let table = table();
        let id = table
            .add(Timer {
                uses_vps: true,
                ..single(date(2026, 8, 3), 720, 780)
            })
            .await
            .unwrap();

        let event = EpgEvent {
            start_at: at(2026, 8, 3, 12, 0),
            duration: Duration::minutes(60),
            vps_at: Some(at(2026, 8, 3, 12, 0)),
            ..EpgEvent::new(10.into(), 1.into())
        };
        store.update_schedule(1.into(), vec![event]).await;
        table.bind_events(&store, at(2026, 8, 3, 11, 0)).await;
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_matches!(timer.event, Some(_));
        });

        // The event disappears mid-recording: the binding survives while the
        // window has not elapsed...
        store.update_schedule(1.into(), vec![]).await;
        table.bind_events(&store, at(2026, 8, 3, 12, 30)).await;
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_matches!(timer.event, Some(_));
        });

        // ...and is dropped afterwards.
        store.update_schedule(1.into(), vec![]).await;
        table.bind_events(&store, at(2026, 8, 3, 13, 30)).await;
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_matches!(timer.event, None);
        });
    }

    #[tokio::test]
    async fn test_bind_events_skips_stale_versions() {
        let store = EpgStore::new();
        let table = table();
        let id = table.add(single(date(2026, 8, 3), 720, 780)).await.unwrap();
        let now = at(2026, 8, 3, 11, 0);

        let event = EpgEvent {
            start_at: at(2026, 8, 3, 12, 0),
            duration: Duration::minutes(60),
            ..EpgEvent::new(10.into(), 1.into())
        };
        store.update_schedule(1.into(), vec![event]).await;
        table.bind_events(&store, now).await;
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_matches!(timer.event, Some(_));
            assert_eq!(timer.bound_version, 1);
        });

        // Binding again without a newer snapshot is a no-op.
        table.bind_events(&store, now).await;
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_eq!(timer.bound_version, 1);
        });

        // A newer snapshot is picked up.
        store.update_schedule(1.into(), vec![]).await;
        table.bind_events(&store, now).await;
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_matches!(timer.event, None);
            assert_eq!(timer.bound_version, 2);
        });
    }

    #[tokio::test]
    async fn test_match_event() {
        let table = table();
        table
            .add(Timer {
                title: "noon".to_string(),
                ..single(date(2026, 8, 3), 720, 780)
            })
            .await
            .unwrap();
        table
            .add(Timer {
                title: "evening".to_string(),
                ..single(date(2026, 8, 3), 1200, 1260)
            })
            .await
            .unwrap();

        let event = EpgEvent {
            start_at: at(2026, 8, 3, 12, 0),
            duration: Duration::minutes(60),
            ..EpgEvent::new(10.into(), 1.into())
        };
        assert_matches!(table.match_event(&event).await, Some((timer, score)) => {
            assert_eq!(timer.title, "noon");
            assert_eq!(score, FULL_COVERAGE);
        });

        let event = EpgEvent {
            start_at: at(2026, 8, 3, 3, 0),
            duration: Duration::minutes(60),
            ..EpgEvent::new(11.into(), 1.into())
        };
        assert_matches!(table.match_event(&event).await, None);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("timers.conf");

        let table = table();
        let kept = table
            .add(Timer {
                title: "morning show".to_string(),
                ..single(date(2026, 8, 3), 420, 480)
            })
            .await
            .unwrap();
        table
            .add(Timer {
                instant: true,
                title: "ad-hoc".to_string(),
                ..single(date(2026, 8, 3), 720, 780)
            })
            .await
            .unwrap();
        table.defer(kept, at(2026, 8, 3, 7, 5)).await;
        assert!(table.is_modified());
        assert!(table.save(&path).await);
        assert!(!table.is_modified());

        let restored = table_with_load(&path).await;
        assert_eq!(restored.len().await, 1);
        assert_matches!(restored.get(kept).await, Some(timer) => {
            assert_eq!(timer.title, "morning show");
            // Deferral is run-time-only state.
            assert_matches!(timer.deferred_until, None);
            assert!(!timer.recording);
        });
    }

    async fn table_with_load(path: &Path) -> TimerTable {
        let table = TimerTable::new(EventEmitter::default());
        table.load(path).await.unwrap();
        table
    }

    #[tokio::test]
    async fn test_load_skips_malformed_records() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("timers.conf");
        let good = single(date(2026, 8, 3), 720, 780);
        let good = Timer {
            id: 7.into(),
            ..good
        };
        let content = format!("{}\nthis is not a timer\n\n", good);
        std::fs::write(&path, content).unwrap();

        let table = table_with_load(&path).await;
        assert_eq!(table.len().await, 1);
        assert_matches!(table.get(7.into()).await, Some(_));
        // Ids continue after the highest loaded one.
        let id = table.add(single(date(2026, 8, 3), 800, 860)).await.unwrap();
        assert_eq!(id, 8.into());
    }

    #[tokio::test]
    async fn test_update_preserves_runtime_state() {
        let table = table();
        let id = table.add(single(date(2026, 8, 3), 720, 780)).await.unwrap();
        table.mark_recording(id, true).await;

        let mut edited = table.get(id).await.unwrap();
        edited.title = "renamed".to_string();
        table.update(edited).await.unwrap();
        assert_matches!(table.get(id).await, Some(timer) => {
            assert_eq!(timer.title, "renamed");
            assert!(timer.recording);
        });

        assert_matches!(
            table
                .update(Timer {
                    id: 99.into(),
                    ..single(date(2026, 8, 3), 720, 780)
                })
                .await,
            Err(Error::TimerNotFound)
        );
    }
}
// </coverage:exclude>
