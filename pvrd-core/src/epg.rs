use std::sync::Arc;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::models::ChannelId;
use crate::models::EventId;
use crate::models::RunningStatus;
use crate::models::duration_seconds;

// models

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EpgEvent {
    pub id: EventId,
    pub channel: ChannelId,
    pub start_at: DateTime<Utc>,
    #[serde(with = "duration_seconds")]
    pub duration: Duration,
    pub vps_at: Option<DateTime<Utc>>,
    pub running_status: RunningStatus,
    pub title: Option<String>,
}

impl EpgEvent {
    pub fn new(id: EventId, channel: ChannelId) -> Self {
        EpgEvent {
            id,
            channel,
            start_at: DateTime::<Utc>::MIN_UTC,
            duration: Duration::minutes(0),
            vps_at: None,
            running_status: RunningStatus::Undefined,
            title: None,
        }
    }

    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or("NO TITLE")
    }

    pub fn end_at(&self) -> DateTime<Utc> {
        self.start_at + self.duration
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start_at <= at && at < self.end_at()
    }
}

// One channel's event list, ordered by start time.  Every replacement of the
// list gets a larger version so that consumers holding event handles can
// detect staleness without comparing contents.
#[derive(Clone, Debug)]
pub struct EpgSchedule {
    pub channel: ChannelId,
    pub version: u64,
    pub events: Vec<EpgEvent>,
}

impl EpgSchedule {
    pub fn event(&self, id: EventId) -> Option<&EpgEvent> {
        self.events.iter().find(|event| event.id == id)
    }

    pub fn event_at(&self, at: DateTime<Utc>) -> Option<&EpgEvent> {
        self.events.iter().find(|event| event.contains(at))
    }

    pub fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = &EpgEvent> {
        self.events
            .iter()
            .filter(move |event| event.start_at < to && event.end_at() > from)
    }
}

// store

pub struct EpgStore {
    schedules: RwLock<IndexMap<ChannelId, Arc<EpgSchedule>>>,
}

impl EpgStore {
    pub fn new() -> Self {
        EpgStore {
            schedules: Default::default(),
        }
    }

    pub async fn schedule(&self, channel: ChannelId) -> Option<Arc<EpgSchedule>> {
        self.schedules.read().await.get(&channel).cloned()
    }

    pub async fn version(&self, channel: ChannelId) -> u64 {
        self.schedules
            .read()
            .await
            .get(&channel)
            .map(|schedule| schedule.version)
            .unwrap_or(0)
    }

    pub async fn update_schedule(&self, channel: ChannelId, mut events: Vec<EpgEvent>) -> u64 {
        events.sort_by_key(|event| event.start_at);
        let mut schedules = self.schedules.write().await;
        let version = schedules
            .get(&channel)
            .map(|schedule| schedule.version)
            .unwrap_or(0)
            + 1;
        tracing::debug!(%channel, version, events.len = events.len(), "Updated schedule");
        schedules.insert(
            channel,
            Arc::new(EpgSchedule {
                channel,
                version,
                events,
            }),
        );
        version
    }
}

impl Default for EpgStore {
    fn default() -> Self {
        Self::new()
    }
}

// <coverage:exclude>
#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn event(id: u32, start_at: DateTime<Utc>, minutes: i64) -> EpgEvent {
        EpgEvent {
            start_at,
            duration: Duration::minutes(minutes),
            ..EpgEvent::new(id.into(), 1.into())
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_update_schedule_bumps_version() {
        let store = EpgStore::new();
        assert_eq!(store.version(1.into()).await, 0);
        assert_matches!(store.schedule(1.into()).await, None);

        let now = Utc::now();
        store.update_schedule(1.into(), vec![event(1, now, 30)]).await;
        assert_eq!(store.version(1.into()).await, 1);

        store.update_schedule(1.into(), vec![]).await;
        assert_eq!(store.version(1.into()).await, 2);
        assert_eq!(store.version(2.into()).await, 0);
    }

    #[tokio::test]
    async fn test_update_schedule_orders_events() {
        let store = EpgStore::new();
        let now = Utc::now();
        store
            .update_schedule(
                1.into(),
                vec![event(2, now + Duration::minutes(30), 30), event(1, now, 30)],
            )
            .await;
        let schedule = store.schedule(1.into()).await.unwrap();
        assert_eq!(schedule.events[0].id, 1.into());
        assert_eq!(schedule.events[1].id, 2.into());
    }

    #[tokio::test]
    async fn test_event_lookup() {
        let store = EpgStore::new();
        let now = Utc::now();
        store
            .update_schedule(1.into(), vec![event(1, now, 30), event(2, now + Duration::minutes(30), 30)])
            .await;
        let schedule = store.schedule(1.into()).await.unwrap();

        assert_matches!(schedule.event(2.into()), Some(event) => {
            assert_eq!(event.id, 2.into());
        });
        assert_matches!(schedule.event(3.into()), None);

        assert_matches!(schedule.event_at(now + Duration::minutes(45)), Some(event) => {
            assert_eq!(event.id, 2.into());
        });
        assert_matches!(schedule.event_at(now + Duration::minutes(60)), None);

        let spanning: Vec<_> = schedule
            .events_between(now + Duration::minutes(20), now + Duration::minutes(40))
            .collect();
        assert_eq!(spanning.len(), 2);
    }
}
// </coverage:exclude>
