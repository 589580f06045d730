use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::models::ChannelId;
use crate::models::TimerId;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStarted {
    pub filename: String,
    pub channel: ChannelId,
    pub timer_id: Option<TimerId>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStopped {
    pub filename: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingFailed {
    pub channel: ChannelId,
    pub timer_id: Option<TimerId>,
    pub reason: RecordingFailedReason,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingFailedReason {
    AlreadyRecording,
    DeviceBusy,
    StorageError,
    NoFreeDevice,
    InsufficientDiskSpace,
    Other,
}

impl From<&Error> for RecordingFailedReason {
    fn from(err: &Error) -> Self {
        match err {
            Error::AlreadyRecording => Self::AlreadyRecording,
            Error::DeviceBusy => Self::DeviceBusy,
            Error::StorageError => Self::StorageError,
            Error::NoFreeDevice => Self::NoFreeDevice,
            Error::InsufficientDiskSpace => Self::InsufficientDiskSpace,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerChanged {
    pub timer_id: TimerId,
}

#[derive(Clone, Debug)]
pub enum Notification {
    RecordingStarted(RecordingStarted),
    RecordingStopped(RecordingStopped),
    RecordingFailed(RecordingFailed),
    TimerChanged(TimerChanged),
}

// Fire-and-forget delivery to UI/logging/remote-protocol consumers.  Nobody
// listening is not an error.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<Notification>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventEmitter { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn emit(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(16)
    }
}

// <coverage:exclude>
#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let emitter = EventEmitter::default();
        emitter.emit(Notification::TimerChanged(TimerChanged {
            timer_id: 1.into(),
        }));
    }

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let emitter = EventEmitter::default();
        let mut rx = emitter.subscribe();
        emitter.emit(Notification::RecordingStopped(RecordingStopped {
            filename: "news.ts".to_string(),
        }));
        assert_matches!(rx.recv().await, Ok(Notification::RecordingStopped(stopped)) => {
            assert_eq!(stopped.filename, "news.ts");
        });
    }
}
// </coverage:exclude>
