use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use serde::Deserialize;

use crate::models::Channel;
use crate::models::ChannelId;
use crate::models::MINUTES_PER_DAY;
use crate::models::Transponder;

pub fn load<P: AsRef<Path>>(config_path: P) -> Arc<Config> {
    let config_path = config_path.as_ref();
    let reader = File::open(config_path).unwrap_or_else(|err| {
        panic!("Failed to open {:?}: {}", config_path, err);
    });
    let config: Config = serde_yaml::from_reader(reader).unwrap_or_else(|err| {
        panic!("Failed to parse {:?}: {}", config_path, err);
    });
    config.validate();
    Arc::new(config)
}

// result

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub tuners: Vec<TunerConfig>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    pub fn validate(&self) {
        self.scheduler.validate();
        self.recording.validate();
        self.tuners
            .iter()
            .enumerate()
            .for_each(|(i, config)| config.validate(i));
        assert_eq!(
            self.tuners.len(),
            self.tuners
                .iter()
                .map(|config| &config.name)
                .unique()
                .count(),
            "config.tuners: `name` must be a unique"
        );
        self.channels
            .iter()
            .enumerate()
            .for_each(|(i, config)| config.validate(i));
        assert_eq!(
            self.channels.len(),
            self.channels
                .iter()
                .map(|config| config.number)
                .unique()
                .count(),
            "config.channels: `number` must be a unique"
        );
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(
        default = "SchedulerConfig::default_tick_interval",
        with = "humantime_serde"
    )]
    pub tick_interval: Duration,
    #[serde(
        default = "SchedulerConfig::default_maintain_interval",
        with = "humantime_serde"
    )]
    pub maintain_interval: Duration,
    #[serde(
        default = "SchedulerConfig::default_expire_grace",
        with = "humantime_serde"
    )]
    pub expire_grace: Duration,
    #[serde(
        default = "SchedulerConfig::default_start_backoff",
        with = "humantime_serde"
    )]
    pub start_backoff: Duration,
    #[serde(default = "SchedulerConfig::default_guide_poll_attempts")]
    pub guide_poll_attempts: usize,
    #[serde(
        default = "SchedulerConfig::default_guide_poll_interval",
        with = "humantime_serde"
    )]
    pub guide_poll_interval: Duration,
    #[serde(default = "SchedulerConfig::default_timers_file")]
    pub timers_file: PathBuf,
}

impl SchedulerConfig {
    fn default_tick_interval() -> Duration {
        Duration::from_secs(1)
    }

    fn default_maintain_interval() -> Duration {
        Duration::from_secs(20)
    }

    fn default_expire_grace() -> Duration {
        Duration::from_secs(60)
    }

    fn default_start_backoff() -> Duration {
        Duration::from_secs(30)
    }

    fn default_guide_poll_attempts() -> usize {
        10
    }

    fn default_guide_poll_interval() -> Duration {
        Duration::from_secs(1)
    }

    fn default_timers_file() -> PathBuf {
        "timers.conf".into()
    }

    fn validate(&self) {
        assert!(
            !self.tick_interval.is_zero(),
            "config.scheduler: `tick-interval` must be larger than 0"
        );
        assert!(
            !self.maintain_interval.is_zero(),
            "config.scheduler: `maintain-interval` must be larger than 0"
        );
        assert!(
            self.guide_poll_attempts > 0,
            "config.scheduler: `guide-poll-attempts` must be larger than 0"
        );
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_interval: Self::default_tick_interval(),
            maintain_interval: Self::default_maintain_interval(),
            expire_grace: Self::default_expire_grace(),
            start_backoff: Self::default_start_backoff(),
            guide_poll_attempts: Self::default_guide_poll_attempts(),
            guide_poll_interval: Self::default_guide_poll_interval(),
            timers_file: Self::default_timers_file(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RecordingConfig {
    #[serde(default = "RecordingConfig::default_record_dir")]
    pub record_dir: PathBuf,
    #[serde(default = "RecordingConfig::default_min_free_space_mb")]
    pub min_free_space_mb: u64,
    #[serde(
        default = "RecordingConfig::default_low_space_warn_interval",
        with = "humantime_serde"
    )]
    pub low_space_warn_interval: Duration,
    /// Minutes recorded before the scheduled start when a timer is created
    /// from a guide event.
    #[serde(default = "RecordingConfig::default_start_margin")]
    pub start_margin: u32,
    /// Minutes recorded past the scheduled stop when a timer is created from
    /// a guide event.
    #[serde(default = "RecordingConfig::default_stop_margin")]
    pub stop_margin: u32,
    #[serde(default = "RecordingConfig::default_priority")]
    pub default_priority: i32,
    #[serde(default = "RecordingConfig::default_lifetime")]
    pub default_lifetime: u32,
    /// Minutes an ad-hoc recording runs when nothing stops it earlier.
    #[serde(default = "RecordingConfig::default_instant_record_time")]
    pub instant_record_time: u32,
    #[serde(default)]
    pub use_vps: bool,
}

impl RecordingConfig {
    fn default_record_dir() -> PathBuf {
        "recordings".into()
    }

    fn default_min_free_space_mb() -> u64 {
        1024
    }

    fn default_low_space_warn_interval() -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn default_start_margin() -> u32 {
        2
    }

    fn default_stop_margin() -> u32 {
        10
    }

    fn default_priority() -> i32 {
        50
    }

    fn default_lifetime() -> u32 {
        99
    }

    fn default_instant_record_time() -> u32 {
        180
    }

    fn validate(&self) {
        assert!(
            !self.record_dir.as_os_str().is_empty(),
            "config.recording: `record-dir` must be a non-empty path"
        );
        assert!(
            self.instant_record_time > 0 && self.instant_record_time < MINUTES_PER_DAY,
            "config.recording: `instant-record-time` must be within (0, 1440)"
        );
        assert!(
            self.start_margin < MINUTES_PER_DAY && self.stop_margin < MINUTES_PER_DAY,
            "config.recording: margins must be shorter than a day"
        );
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        RecordingConfig {
            record_dir: Self::default_record_dir(),
            min_free_space_mb: Self::default_min_free_space_mb(),
            low_space_warn_interval: Self::default_low_space_warn_interval(),
            start_margin: Self::default_start_margin(),
            stop_margin: Self::default_stop_margin(),
            default_priority: Self::default_priority(),
            default_lifetime: Self::default_lifetime(),
            instant_record_time: Self::default_instant_record_time(),
            use_vps: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TunerConfig {
    pub name: String,
    #[serde(default = "TunerConfig::default_recorder_slots")]
    pub recorder_slots: usize,
    #[serde(default)]
    pub disabled: bool,
}

impl TunerConfig {
    fn default_recorder_slots() -> usize {
        1
    }

    fn validate(&self, index: usize) {
        assert!(
            !self.name.is_empty(),
            "config.tuners[{}]: `name` must be a non-empty string",
            index
        );
        assert!(
            self.recorder_slots > 0,
            "config.tuners[{}]: `recorder-slots` must be larger than 0",
            index
        );
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub name: String,
    pub number: u32,
    pub transponder: u32,
    #[serde(default)]
    pub disabled: bool,
}

impl ChannelConfig {
    fn validate(&self, index: usize) {
        assert!(
            !self.name.is_empty(),
            "config.channels[{}]: `name` must be a non-empty string",
            index
        );
        assert!(
            self.number > 0,
            "config.channels[{}]: `number` must be larger than 0",
            index
        );
    }
}

impl From<&ChannelConfig> for Channel {
    fn from(config: &ChannelConfig) -> Self {
        Channel {
            id: ChannelId::from(config.number),
            name: config.name.clone(),
            number: config.number,
            transponder: Transponder::from(config.transponder),
        }
    }
}

// </coverage:exclude>
