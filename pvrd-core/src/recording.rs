use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::epg::EpgEvent;
use crate::epg::EpgStore;
use crate::error::Error;
use crate::events::EventEmitter;
use crate::events::Notification;
use crate::events::RecordingFailed;
use crate::events::RecordingStarted;
use crate::events::RecordingStopped;
use crate::models::Channel;
use crate::models::ChannelId;
use crate::models::TimerId;
use crate::timers::Timer;
use crate::timers::TimerTable;
use crate::tuner::DeviceHandle;
use crate::tuner::TunerPool;

// disk-space probe

pub trait DiskSpaceProbe: Send + Sync {
    fn free_mbytes(&self, path: &Path) -> u64;
}

pub struct StatvfsProbe;

impl DiskSpaceProbe for StatvfsProbe {
    fn free_mbytes(&self, path: &Path) -> u64 {
        use std::os::unix::ffi::OsStrExt;
        let cpath = match std::ffi::CString::new(path.as_os_str().as_bytes()) {
            Ok(cpath) => cpath,
            Err(_) => return 0,
        };
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) } != 0 {
            return 0;
        }
        // f_bavail counts blocks available to unprivileged users.
        (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64) / (1024 * 1024)
    }
}

// writer

pub struct Recorder {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl Recorder {
    pub async fn open(path: &Path, channel: &Channel) -> Result<Recorder, Error> {
        let file = tokio::fs::File::create(path).await?;
        tracing::debug!(?path, %channel, "Opened recording file");
        Ok(Recorder {
            path: path.to_owned(),
            file: Some(file),
        })
    }

    pub async fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = file.sync_all().await {
                tracing::error!(%err, path = ?self.path, "Failed to sync recording file");
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// metadata sidecar saved next to the content file

#[derive(Deserialize, Serialize)]
pub struct Record {
    pub title: String,
    pub channel: ChannelId,
    pub started_at: DateTime<Utc>,
    pub timer: Timer,
    pub event: Option<EpgEvent>,
    pub content_path: PathBuf,
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '\0' => '_',
            ch if ch.is_whitespace() => '_',
            ch => ch,
        })
        .collect()
}

/// The stem is derived from the timer, the channel and the window start, so
/// two requests for the same broadcast collide on purpose.
fn record_stem(title: &str, channel: &Channel, start: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        sanitize(title),
        start.format("%Y%m%d%H%M"),
        sanitize(&channel.name)
    )
}

// session

/// One recording in progress: an acquired device, an open writer and the
/// timer occurrence they serve.
pub struct RecordingSession {
    filename: String,
    content_path: PathBuf,
    device: DeviceHandle,
    recorder: Option<Recorder>,
    timer_id: Option<TimerId>,
    instant_label: Option<String>,
    event: Option<EpgEvent>,
    channel: Channel,
    started_at: DateTime<Utc>,
}

impl RecordingSession {
    #[allow(clippy::too_many_arguments)]
    async fn start(
        config: &Config,
        device: DeviceHandle,
        channel: &Channel,
        timer: &Timer,
        stem: String,
        instant_label: Option<String>,
        epg: &EpgStore,
        now: DateTime<Utc>,
    ) -> Result<RecordingSession, Error> {
        let filename = format!("{}.ts", stem);
        let content_path = config.recording.record_dir.join(&filename);
        let metadata_path = config
            .recording
            .record_dir
            .join(format!("{}.record.json", stem));

        let event = Self::resolve_event(config, channel, timer, epg, now).await;

        // On-disk structures come first; the device is not touched until the
        // writer has somewhere to go.
        if let Some(dir) = content_path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                tracing::error!(%err, ?dir, "Failed to create recording directory");
                device.detach().await;
                return Err(Error::StorageError);
            }
        }

        let record = Record {
            title: timer.title.clone(),
            channel: channel.id,
            started_at: now,
            timer: timer.clone(),
            event: event.clone(),
            content_path: content_path.clone(),
        };
        let saved = std::fs::File::create(&metadata_path)
            .map_err(Error::from)
            .and_then(|file| serde_json::to_writer_pretty(file, &record).map_err(Error::from));
        if let Err(err) = saved {
            tracing::error!(%err, ?metadata_path, "Failed to save metadata");
            device.detach().await;
            return Err(Error::StorageError);
        }
        tracing::debug!(?metadata_path, "Saved metadata");

        let recorder = match Recorder::open(&content_path, channel).await {
            Ok(recorder) => recorder,
            Err(err) => {
                tracing::error!(%err, ?content_path, "Failed to open recording file");
                device.detach().await;
                return Err(Error::StorageError);
            }
        };

        if !device.attach().await {
            // The tuner was grabbed away between acquisition and attachment.
            device.detach().await;
            return Err(Error::DeviceBusy);
        }

        tracing::info!(%filename, %channel, timer.id = %timer.id, "Recording...");
        Ok(RecordingSession {
            filename,
            content_path,
            device,
            recorder: Some(recorder),
            timer_id: Some(timer.id),
            instant_label,
            event,
            channel: channel.clone(),
            started_at: now,
        })
    }

    /// Event metadata for the session: the timer's bound event when there is
    /// one, otherwise a bounded poll for an event spanning the window's
    /// mid-point.  The guide may simply not know the broadcast; the session
    /// then proceeds without metadata.
    async fn resolve_event(
        config: &Config,
        channel: &Channel,
        timer: &Timer,
        epg: &EpgStore,
        now: DateTime<Utc>,
    ) -> Option<EpgEvent> {
        if let Some(handle) = timer.event {
            return match epg.schedule(handle.channel).await {
                Some(schedule) => schedule.event(handle.event).cloned(),
                None => None,
            };
        }
        let window = timer.window_at(now, false)?;
        let midpoint = window.start + window.duration() / 2;
        for attempt in 0..config.scheduler.guide_poll_attempts {
            if attempt > 0 {
                tokio::time::sleep(config.scheduler.guide_poll_interval).await;
            }
            if let Some(schedule) = epg.schedule(channel.id).await {
                if let Some(event) = schedule.event_at(midpoint) {
                    return Some(event.clone());
                }
            }
        }
        tracing::warn!(timer.id = %timer.id, "No guide event found, recording without metadata");
        None
    }

    /// Detaches and closes the writer and releases the device.  Safe to call
    /// more than once.
    pub async fn stop(&mut self) {
        if let Some(mut recorder) = self.recorder.take() {
            recorder.close().await;
            self.device.detach().await;
            tracing::info!(filename = %self.filename, "Stopped recording");
        }
    }

    /// Whether the session should keep running.
    async fn is_valid(&self, timers: &TimerTable, now: DateTime<Utc>) -> bool {
        if !self.device.attached().await {
            tracing::warn!(filename = %self.filename, "Device detached, ending session");
            return false;
        }
        if let Some(timer_id) = self.timer_id {
            match timers.get(timer_id).await {
                Some(timer) => {
                    if !timer.occurs_at(now) {
                        tracing::info!(filename = %self.filename, timer.id = %timer_id, "Window elapsed");
                        return false;
                    }
                }
                None => {
                    tracing::info!(filename = %self.filename, timer.id = %timer_id, "Timer vanished, ending session");
                    return false;
                }
            }
        }
        true
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content_path(&self) -> &Path {
        &self.content_path
    }

    pub fn timer_id(&self) -> Option<TimerId> {
        self.timer_id
    }

    pub fn instant_label(&self) -> Option<&str> {
        self.instant_label.as_deref()
    }

    pub fn event(&self) -> Option<&EpgEvent> {
        self.event.as_ref()
    }

    pub fn get_model(&self) -> SessionModel {
        SessionModel {
            filename: self.filename.clone(),
            channel: self.channel.id,
            timer_id: self.timer_id,
            instant_label: self.instant_label.clone(),
            started_at: self.started_at,
            device_index: self.device.device_index(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionModel {
    pub filename: String,
    pub channel: ChannelId,
    pub timer_id: Option<TimerId>,
    pub instant_label: Option<String>,
    pub started_at: DateTime<Utc>,
    pub device_index: usize,
}

// manager

/// Admission control for scarce recording resources.  Driven by a periodic
/// tick; owns every live session from acquisition through teardown.
pub struct RecordingManager<T> {
    config: Arc<Config>,
    channels: IndexMap<ChannelId, Channel>,
    tuners: T,
    epg: Arc<EpgStore>,
    timers: Arc<TimerTable>,
    probe: Box<dyn DiskSpaceProbe>,
    sessions: RwLock<HashMap<String, RecordingSession>>,
    current_channel: RwLock<Option<ChannelId>>,
    low_space_warned: Mutex<HashMap<Option<TimerId>, DateTime<Utc>>>,
    low_space_warnings: AtomicU64,
    // Bumped on every session add/remove so observers can poll for "has
    // anything changed" without walking the collection.
    generation: AtomicU64,
    capacity: usize,
    emitter: EventEmitter,
}

impl<T> RecordingManager<T>
where
    T: TunerPool,
{
    pub fn new(
        config: Arc<Config>,
        tuners: T,
        epg: Arc<EpgStore>,
        timers: Arc<TimerTable>,
        probe: Box<dyn DiskSpaceProbe>,
        capacity: usize,
        emitter: EventEmitter,
    ) -> Self {
        let channels = config
            .channels
            .iter()
            .filter(|config| !config.disabled)
            .map(|config| {
                let channel = Channel::from(config);
                (channel.id, channel)
            })
            .collect();
        RecordingManager {
            config,
            channels,
            tuners,
            epg,
            timers,
            probe,
            sessions: Default::default(),
            current_channel: Default::default(),
            low_space_warned: Default::default(),
            low_space_warnings: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            capacity,
            emitter,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub async fn set_current_channel(&self, channel: ChannelId) {
        *self.current_channel.write().await = Some(channel);
    }

    pub async fn session_models(&self) -> Vec<SessionModel> {
        self.sessions
            .read()
            .await
            .values()
            .map(|session| session.get_model())
            .collect()
    }

    /// Starts a recording for `timer`, or an ad-hoc recording of the current
    /// channel when no timer is given.
    ///
    /// Failures of a timer-driven start are absorbed into the timer's state
    /// (left pending or deferred) so a later tick retries; the returned
    /// error is for user-initiated callers.
    pub async fn start(
        &self,
        timer: Option<Timer>,
        pause: bool,
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        let unattended = timer.is_some();
        let backoff = Duration::from_std(self.config.scheduler.start_backoff)
            .unwrap_or_else(|_| Duration::seconds(30));

        let channel = match self.target_channel(timer.as_ref()).await {
            Some(channel) => channel,
            None => {
                if let Some(timer) = timer.as_ref() {
                    tracing::error!(timer.id = %timer.id, channel = %timer.channel, "Channel not found");
                    self.timers.defer(timer.id, now + backoff).await;
                } else {
                    tracing::error!("No channel to record from");
                }
                return Err(Error::ChannelNotFound);
            }
        };

        // The timer is pending from here on; every refusal below defers it,
        // deactivates it or leaves it pending, so one admission round visits
        // it at most once.
        if let Some(timer) = timer.as_ref() {
            self.timers.mark_pending(timer.id).await;
        }

        let free = self.probe.free_mbytes(&self.config.recording.record_dir);
        if free < self.config.recording.min_free_space_mb {
            self.warn_low_space(timer.as_ref().map(|timer| timer.id), free, now)
                .await;
            self.emit_failed(&channel, timer.as_ref().map(|timer| timer.id), &Error::InsufficientDiskSpace);
            return Err(Error::InsufficientDiskSpace);
        }

        // An ad-hoc request gets a synthesized timer; it lives in the table
        // like any other but never reaches the timers file.
        let timer = match timer {
            Some(timer) => timer,
            None => {
                let mut instant = Timer::new_instant(&channel, &self.config, now);
                if pause {
                    // A live pause must never lose its device to a timer.
                    instant.priority = i32::MAX;
                }
                let id = self.timers.add(instant).await?;
                self.timers.mark_pending(id).await;
                match self.timers.get(id).await {
                    Some(timer) => timer,
                    None => return Err(Error::TimerNotFound),
                }
            }
        };
        let instant_label = timer.instant.then(|| {
            if pause {
                format!("Pause {}", channel.name)
            } else {
                channel.name.clone()
            }
        });

        let window_start = timer
            .window_at(now, false)
            .map(|window| window.start)
            .unwrap_or(now);
        let stem = record_stem(&timer.title, &channel, window_start);
        let filename = format!("{}.ts", stem);
        if self.sessions.read().await.contains_key(&filename) {
            // Expected when two inputs reference the same broadcast; the
            // loser is switched off, not failed.
            tracing::info!(%filename, timer.id = %timer.id, "Already recording");
            if timer.instant {
                self.timers.remove(timer.id).await.ok();
            } else {
                self.timers.set_active(timer.id, false).await.ok();
            }
            self.emit_failed(&channel, Some(timer.id), &Error::AlreadyRecording);
            return Err(Error::AlreadyRecording);
        }

        let device = match self.tuners.acquire(&channel, timer.priority).await {
            Some(device) => device,
            None => {
                if unattended {
                    // Stays pending; a later tick retries without log noise.
                    tracing::debug!(timer.id = %timer.id, "No free device, leaving timer pending");
                } else {
                    tracing::error!(%channel, "No free device");
                    self.timers.remove(timer.id).await.ok();
                }
                self.emit_failed(&channel, Some(timer.id), &Error::NoFreeDevice);
                return Err(Error::NoFreeDevice);
            }
        };

        if !device.tune(&channel).await {
            device.detach().await;
            self.defer_after_failure(&timer, now + backoff).await;
            self.emit_failed(&channel, Some(timer.id), &Error::DeviceBusy);
            return Err(Error::DeviceBusy);
        }

        let session = match RecordingSession::start(
            &self.config,
            device,
            &channel,
            &timer,
            stem,
            instant_label,
            &self.epg,
            now,
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                if matches!(err, Error::StorageError | Error::DeviceBusy) {
                    self.defer_after_failure(&timer, now + backoff).await;
                }
                self.emit_failed(&channel, Some(timer.id), &err);
                return Err(err);
            }
        };

        {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.capacity {
                // Allocation already bounds concurrency; getting here means
                // the bookkeeping is broken.
                drop(sessions);
                tracing::error!(%filename, "Session table full, refusing to record");
                let mut session = session;
                session.stop().await;
                self.defer_after_failure(&timer, now + backoff).await;
                return Err(Error::NoFreeDevice);
            }
            sessions.insert(filename.clone(), session);
        }
        self.timers.mark_recording(timer.id, true).await;
        self.bump_generation();
        self.emitter.emit(Notification::RecordingStarted(RecordingStarted {
            filename: filename.clone(),
            channel: channel.id,
            timer_id: Some(timer.id),
        }));
        tracing::info!(%filename, timer.id = %timer.id, "Start recording");
        Ok(filename)
    }

    /// One scheduler beat: admit every timer that is due, poll every live
    /// session, and keep an eye on free disk space.
    pub async fn tick(&self, now: DateTime<Utc>) {
        // Admit until nothing matches or every recorder slot is taken.  A
        // failed start leaves its timer pending or deferred, so it is not
        // selected twice within one round.
        while self.sessions.read().await.len() < self.capacity {
            let timer = match self.timers.find_active(now).await {
                Some(timer) => timer,
                None => break,
            };
            if let Err(err) = self.start(Some(timer.clone()), false, now).await {
                tracing::debug!(%err, timer.id = %timer.id, "Start attempt failed");
            }
        }

        let mut ended = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (filename, session) in sessions.iter() {
                if !session.is_valid(&self.timers, now).await {
                    ended.push(filename.clone());
                }
            }
        }
        for filename in ended {
            if let Err(err) = self.stop_session(&filename, true).await {
                tracing::warn!(%err, %filename, "Failed to stop session");
            }
        }

        if !self.sessions.read().await.is_empty() {
            let free = self.probe.free_mbytes(&self.config.recording.record_dir);
            if free < self.config.recording.min_free_space_mb {
                self.warn_low_space(None, free, now).await;
            }
        }
    }

    /// Tears one session down.  `execute_hooks` controls whether state-change
    /// notifications fire.
    pub async fn stop_session(&self, filename: &str, execute_hooks: bool) -> Result<(), Error> {
        let mut session = self
            .sessions
            .write()
            .await
            .remove(filename)
            .ok_or(Error::SessionNotFound)?;
        session.stop().await;
        if let Some(timer_id) = session.timer_id() {
            self.timers.mark_recording(timer_id, false).await;
        }
        self.bump_generation();
        if execute_hooks {
            self.emitter
                .emit(Notification::RecordingStopped(RecordingStopped {
                    filename: filename.to_string(),
                }));
        }
        Ok(())
    }

    /// Stops the ad-hoc session carrying `label`.  A single-occurrence
    /// backing timer goes away with it.
    pub async fn stop_by_label(&self, label: &str) -> Result<(), Error> {
        let found = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .find(|session| session.instant_label() == Some(label))
                .map(|session| (session.filename().to_string(), session.timer_id()))
        };
        let (filename, timer_id) = found.ok_or(Error::SessionNotFound)?;
        self.stop_session(&filename, true).await?;
        if let Some(timer_id) = timer_id {
            if let Some(timer) = self.timers.get(timer_id).await {
                if timer.weekdays.is_empty() {
                    self.timers.remove(timer_id).await.ok();
                }
            }
        }
        Ok(())
    }

    /// Editing a channel's tuning parameters invalidates any session whose
    /// device follows that transponder; those sessions stop so the next tick
    /// can re-acquire.
    pub async fn on_channel_retuned(&self, channel: &Channel) {
        let mut ended = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (filename, session) in sessions.iter() {
                if session.device.uses_transponder(channel.transponder).await {
                    ended.push(filename.clone());
                }
            }
        }
        for filename in ended {
            tracing::info!(%filename, %channel, "Channel retuned, ending session");
            self.stop_session(&filename, true).await.ok();
        }
    }

    pub async fn shutdown(&self) {
        let filenames: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        for filename in filenames {
            self.stop_session(&filename, true).await.ok();
        }
    }

    async fn target_channel(&self, timer: Option<&Timer>) -> Option<Channel> {
        match timer {
            Some(timer) => self.channels.get(&timer.channel).cloned(),
            None => {
                let current = *self.current_channel.read().await;
                match current {
                    Some(id) => self.channels.get(&id).cloned(),
                    None => self.channels.values().next().cloned(),
                }
            }
        }
    }

    async fn defer_after_failure(&self, timer: &Timer, until: DateTime<Utc>) {
        if timer.instant {
            self.timers.remove(timer.id).await.ok();
        } else {
            self.timers.defer(timer.id, until).await;
        }
    }

    async fn warn_low_space(&self, timer_id: Option<TimerId>, free: u64, now: DateTime<Utc>) {
        let interval = Duration::from_std(self.config.recording.low_space_warn_interval)
            .unwrap_or(Duration::MAX);
        let mut warned = self.low_space_warned.lock().await;
        match warned.get(&timer_id) {
            Some(last) if now - *last < interval => (),
            _ => {
                warned.insert(timer_id, now);
                self.low_space_warnings.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    free,
                    min = self.config.recording.min_free_space_mb,
                    "Not enough free disk space"
                );
            }
        }
    }

    fn emit_failed(&self, channel: &Channel, timer_id: Option<TimerId>, err: &Error) {
        self.emitter
            .emit(Notification::RecordingFailed(RecordingFailed {
                channel: channel.id,
                timer_id,
                reason: err.into(),
            }));
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }
}

// </coverage:exclude>
