#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Already recording")]
    AlreadyRecording,
    #[error("Device busy")]
    DeviceBusy,
    #[error("Storage error")]
    StorageError,
    #[error("No free device")]
    NoFreeDevice,
    #[error("Insufficient disk space")]
    InsufficientDiskSpace,
    #[error("Invalid timer definition: {0}")]
    InvalidTimerDefinition(String),
    #[error("Timer not found")]
    TimerNotFound,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Channel not found")]
    ChannelNotFound,
    #[error("std::io error: {0}")]
    IoError(std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(serde_json::Error),
    #[error("YAML error: {0}")]
    YamlError(serde_yaml::Error),
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err)
    }
}
