use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::models::Channel;
use crate::models::Transponder;

const IDLE_PRIORITY: i32 = -100;

/// The one capability the recording core needs from the device subsystem.
/// An implementation may preempt lower-priority users to satisfy a request.
#[async_trait]
pub trait TunerPool: Send + Sync {
    async fn acquire(&self, channel: &Channel, priority: i32) -> Option<DeviceHandle>;
}

// local pool
//
// Bookkeeping for a fixed set of tuners.  Physical tuning and demodulation
// live behind this boundary; the pool tracks which transponder each tuner
// follows, who subscribed at which priority, and how many recorder slots are
// taken.

pub struct LocalTunerPool {
    tuners: Vec<Arc<Tuner>>,
}

impl LocalTunerPool {
    pub fn new(config: &Config) -> Self {
        let tuners: Vec<_> = config
            .tuners
            .iter()
            .filter(|config| !config.disabled)
            .enumerate()
            .map(|(index, config)| {
                Arc::new(Tuner {
                    index,
                    name: config.name.clone(),
                    slots: config.recorder_slots,
                    state: Default::default(),
                })
            })
            .collect();
        tracing::info!(tuners.len = tuners.len(), "Loaded tuners");
        LocalTunerPool { tuners }
    }

    /// Upper bound on concurrent recordings.
    pub fn capacity(&self) -> usize {
        self.tuners.iter().map(|tuner| tuner.slots).sum()
    }
}

#[async_trait]
impl TunerPool for LocalTunerPool {
    async fn acquire(&self, channel: &Channel, priority: i32) -> Option<DeviceHandle> {
        // A tuner already following the transponder can take another
        // recording without disturbing anyone.
        for tuner in self.tuners.iter() {
            let mut state = tuner.state.lock().await;
            if state.tuned == Some(channel.transponder)
                && !state.users.is_empty()
                && state.users.len() < tuner.slots
            {
                tracing::debug!(tuner.index, %channel, priority, "Reuse active tuner");
                return Some(tuner.subscribe(&mut state, priority));
            }
        }

        for tuner in self.tuners.iter() {
            let mut state = tuner.state.lock().await;
            if state.users.is_empty() {
                tracing::debug!(tuner.index, %channel, priority, "Use tuner");
                state.tuned = Some(channel.transponder);
                return Some(tuner.subscribe(&mut state, priority));
            }
        }

        // No tuner available at this point.  Grab the one with the lowest
        // priority that the request outranks.
        let mut found: Option<(&Arc<Tuner>, i32)> = None;
        for tuner in self.tuners.iter() {
            let state = tuner.state.lock().await;
            let current = state.priority();
            if current < priority {
                match found {
                    Some((_, lowest)) if lowest <= current => (),
                    _ => found = Some((tuner, current)),
                }
            }
        }
        if let Some((tuner, _)) = found {
            let mut state = tuner.state.lock().await;
            if state.priority() < priority {
                tracing::debug!(tuner.index, %channel, priority, grabbed = state.priority(), "Grab tuner");
                state.users.clear();
                state.tuned = Some(channel.transponder);
                return Some(tuner.subscribe(&mut state, priority));
            }
        }

        tracing::warn!(%channel, priority, "No tuner available");
        None
    }
}

#[derive(Debug)]
struct Tuner {
    index: usize,
    name: String,
    slots: usize,
    state: Mutex<TunerState>,
}

impl Tuner {
    fn subscribe(self: &Arc<Self>, state: &mut TunerState, priority: i32) -> DeviceHandle {
        let id = state.next_user;
        state.next_user += 1;
        state.users.push(TunerUser {
            id,
            priority,
            attached: false,
        });
        DeviceHandle {
            tuner: self.clone(),
            user: id,
        }
    }
}

#[derive(Debug, Default)]
struct TunerState {
    tuned: Option<Transponder>,
    users: Vec<TunerUser>,
    next_user: u32,
}

impl TunerState {
    fn priority(&self) -> i32 {
        self.users
            .iter()
            .map(|user| user.priority)
            .max()
            .unwrap_or(IDLE_PRIORITY)
    }

    fn has_user(&self, id: u32) -> bool {
        self.users.iter().any(|user| user.id == id)
    }
}

#[derive(Debug)]
struct TunerUser {
    id: u32,
    priority: i32,
    attached: bool,
}

/// One subscription on one tuner.  The handle goes stale when a
/// higher-priority request grabs the tuner; every operation then reports
/// failure and the owning session winds itself down on its next poll.
#[derive(Debug)]
pub struct DeviceHandle {
    tuner: Arc<Tuner>,
    user: u32,
}

impl DeviceHandle {
    pub fn device_index(&self) -> usize {
        self.tuner.index
    }

    pub fn device_name(&self) -> &str {
        &self.tuner.name
    }

    pub async fn tune(&self, channel: &Channel) -> bool {
        let mut state = self.tuner.state.lock().await;
        if !state.has_user(self.user) {
            return false;
        }
        if state.tuned == Some(channel.transponder) {
            return true;
        }
        // Switching the transponder would cut off the other subscribers.
        if state.users.len() > 1 {
            return false;
        }
        state.tuned = Some(channel.transponder);
        true
    }

    /// Attaches the recording sink.  Fails when the tuner was grabbed away
    /// between acquisition and attachment.
    pub async fn attach(&self) -> bool {
        let mut state = self.tuner.state.lock().await;
        match state.users.iter_mut().find(|user| user.id == self.user) {
            Some(user) => {
                user.attached = true;
                true
            }
            None => false,
        }
    }

    /// Releases the subscription.  Idempotent.
    pub async fn detach(&self) {
        let mut state = self.tuner.state.lock().await;
        state.users.retain(|user| user.id != self.user);
    }

    pub async fn attached(&self) -> bool {
        let state = self.tuner.state.lock().await;
        state
            .users
            .iter()
            .any(|user| user.id == self.user && user.attached)
    }

    pub async fn uses_transponder(&self, transponder: Transponder) -> bool {
        let state = self.tuner.state.lock().await;
        state.has_user(self.user) && state.tuned == Some(transponder)
    }
}

// <coverage:exclude>
#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn channel(number: u32, transponder: u32) -> Channel {
        Channel {
            id: number.into(),
            name: format!("ch{}", number),
            number,
            transponder: transponder.into(),
        }
    }

    fn pool(slots_per_tuner: &[usize]) -> LocalTunerPool {
        let config = Config {
            tuners: slots_per_tuner
                .iter()
                .enumerate()
                .map(|(i, slots)| crate::config::TunerConfig {
                    name: format!("tuner{}", i),
                    recorder_slots: *slots,
                    disabled: false,
                })
                .collect(),
            ..Default::default()
        };
        LocalTunerPool::new(&config)
    }

    #[tokio::test]
    async fn test_capacity() {
        assert_eq!(pool(&[1, 2]).capacity(), 3);
    }

    #[tokio::test]
    async fn test_acquire_idle_tuner() {
        let pool = pool(&[1]);
        let handle = pool.acquire(&channel(1, 10), 50).await.unwrap();
        assert_eq!(handle.device_index(), 0);
        assert_eq!(handle.device_name(), "tuner0");
        assert!(handle.attach().await);
        assert!(handle.uses_transponder(10.into()).await);
        assert!(!handle.uses_transponder(11.into()).await);
    }

    #[tokio::test]
    async fn test_reuse_same_transponder() {
        let pool = pool(&[2]);
        let first = pool.acquire(&channel(1, 10), 50).await.unwrap();
        // A second channel on the same transponder shares the tuner.
        let second = pool.acquire(&channel(2, 10), 10).await.unwrap();
        assert_eq!(first.device_index(), second.device_index());
        // Both slots taken now.
        assert_matches!(pool.acquire(&channel(3, 10), 50).await, None);
    }

    #[tokio::test]
    async fn test_grab_lowest_priority() {
        let pool = pool(&[1, 1]);
        let low = pool.acquire(&channel(1, 10), 10).await.unwrap();
        let mid = pool.acquire(&channel(2, 20), 30).await.unwrap();
        assert!(low.attach().await);
        assert!(mid.attach().await);

        // Outranks both; the lowest-priority tuner gets grabbed.
        let high = pool.acquire(&channel(3, 30), 50).await.unwrap();
        assert_eq!(high.device_index(), low.device_index());
        assert!(high.attach().await);

        // The revoked handle reports failure everywhere.
        assert!(!low.attached().await);
        assert!(!low.attach().await);
        assert!(!low.tune(&channel(1, 10)).await);
        assert!(mid.attached().await);
    }

    #[tokio::test]
    async fn test_equal_priority_does_not_grab() {
        let pool = pool(&[1]);
        let _first = pool.acquire(&channel(1, 10), 50).await.unwrap();
        assert_matches!(pool.acquire(&channel(2, 20), 50).await, None);
        assert_matches!(pool.acquire(&channel(2, 20), 51).await, Some(_));
    }

    #[tokio::test]
    async fn test_detach_frees_slot() {
        let pool = pool(&[1]);
        let handle = pool.acquire(&channel(1, 10), 50).await.unwrap();
        assert_matches!(pool.acquire(&channel(2, 20), 50).await, None);
        handle.detach().await;
        handle.detach().await;
        assert_matches!(pool.acquire(&channel(2, 20), 50).await, Some(_));
    }

    #[tokio::test]
    async fn test_tune_keeps_other_subscribers() {
        let pool = pool(&[2]);
        let first = pool.acquire(&channel(1, 10), 50).await.unwrap();
        // Alone on the tuner, switching transponders is fine.
        assert!(first.tune(&channel(9, 90)).await);

        let second = pool.acquire(&channel(8, 90), 50).await.unwrap();
        assert_eq!(first.device_index(), second.device_index());
        // With company, only same-transponder tuning succeeds.
        assert!(first.tune(&channel(8, 90)).await);
        assert!(!first.tune(&channel(1, 10)).await);
    }

    #[tokio::test]
    async fn test_disabled_tuners_are_not_loaded() {
        let config = Config {
            tuners: vec![
                crate::config::TunerConfig {
                    name: "tuner0".to_string(),
                    recorder_slots: 1,
                    disabled: true,
                },
                crate::config::TunerConfig {
                    name: "tuner1".to_string(),
                    recorder_slots: 1,
                    disabled: false,
                },
            ],
            ..Default::default()
        };
        let pool = LocalTunerPool::new(&config);
        assert_eq!(pool.capacity(), 1);
        let handle = pool.acquire(&channel(1, 10), 50).await.unwrap();
        assert_eq!(handle.device_name(), "tuner1");
    }
}
// </coverage:exclude>
