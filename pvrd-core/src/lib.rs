pub mod config;
pub mod epg;
pub mod error;
pub mod events;
pub mod models;
pub mod recording;
pub mod timers;
pub mod tracing_ext;
pub mod tuner;
