//! Auto-save scheduler.
//!
//! Saves are triggered by a fixed interval (only while the host is in the
//! foreground), by named game events (trailing debounce per event type), by
//! visibility loss, and by the explicit shutdown flush. A single in-flight
//! flag drops triggers that arrive while a save is running.
//!
//! Data written after the last confirmed save is lost if the host dies
//! without calling [`AutoSaveScheduler::shutdown`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use colony_save_core::{SaveError, SnapshotProvider, MAX_AUTO_SLOTS};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::slot_store::{SaveReceipt, SlotStore};

/// Game events that may trigger an auto-save.
pub const KNOWN_EVENTS: [&str; 6] = [
    "building_completed",
    "research_completed",
    "battle_ended",
    "evolution_unlocked",
    "population_milestone",
    "season_changed",
];

/// Quiet period after the last occurrence of an event before it saves.
pub const EVENT_DEBOUNCE: Duration = Duration::from_secs(2);

const MIN_INTERVAL_MINUTES: u32 = 1;
const MAX_INTERVAL_MINUTES: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSaveConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
    /// Number of auto slots in the rotation
    #[serde(default = "default_auto_slot_count")]
    pub auto_slot_count: u32,
    /// Events that trigger a save
    #[serde(default = "default_events")]
    pub events: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_minutes() -> u32 {
    5
}

fn default_auto_slot_count() -> u32 {
    3
}

fn default_events() -> Vec<String> {
    KNOWN_EVENTS.iter().map(|e| e.to_string()).collect()
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_minutes: default_interval_minutes(),
            auto_slot_count: default_auto_slot_count(),
            events: default_events(),
        }
    }
}

impl AutoSaveConfig {
    pub fn validate(&self) -> Result<(), SaveError> {
        if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&self.interval_minutes) {
            return Err(SaveError::Config(format!(
                "interval must be between {} and {} minutes, got {}",
                MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, self.interval_minutes
            )));
        }
        if !(1..=MAX_AUTO_SLOTS).contains(&self.auto_slot_count) {
            return Err(SaveError::Config(format!(
                "auto-slot count must be between 1 and {}, got {}",
                MAX_AUTO_SLOTS, self.auto_slot_count
            )));
        }
        if let Some(unknown) = self.events.iter().find(|e| !is_known_event(e)) {
            return Err(SaveError::Config(format!("unknown event '{}'", unknown)));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }
}

fn is_known_event(name: &str) -> bool {
    KNOWN_EVENTS.contains(&name)
}

/// What caused a save attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Interval,
    Event(String),
    VisibilityLost,
    Shutdown,
    /// Explicit request from the host; runs even when auto-save is disabled.
    Manual,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Interval => write!(f, "interval"),
            Trigger::Event(name) => write!(f, "event:{}", name),
            Trigger::VisibilityLost => write!(f, "visibility_lost"),
            Trigger::Shutdown => write!(f, "shutdown"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Saved(SaveReceipt),
    /// Another save was in flight
    Dropped,
    /// The snapshot provider had nothing to save
    NothingToSave,
    Disabled,
    /// The scheduler has been shut down
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoSaveStatus {
    pub enabled: bool,
    pub last_time: Option<DateTime<Utc>>,
    /// Time until the next interval save; `None` while the timer is paused
    pub next_in: Option<Duration>,
    pub in_progress: bool,
}

/// Auto-save scheduler. Cloning yields a handle to the same scheduler.
#[derive(Clone)]
pub struct AutoSaveScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: SlotStore,
    provider: Arc<dyn SnapshotProvider>,
    config: RwLock<AutoSaveConfig>,
    in_flight: AtomicBool,
    foreground: AtomicBool,
    stopped: AtomicBool,
    last_time: Mutex<Option<DateTime<Utc>>>,
    next_tick: Mutex<Option<Instant>>,
    /// Wakes the interval loop after a config, visibility or shutdown change
    wake: Notify,
    /// Latest occurrence per event type; a debounced save only fires if no
    /// newer occurrence arrived during the quiet period
    debounce: DashMap<String, u64>,
    debounce_seq: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AutoSaveScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoSaveScheduler")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Clears the in-flight flag when a save attempt ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AutoSaveScheduler {
    pub fn new(
        store: SlotStore,
        provider: Arc<dyn SnapshotProvider>,
        config: AutoSaveConfig,
    ) -> Result<Self, SaveError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                store,
                provider,
                config: RwLock::new(config),
                in_flight: AtomicBool::new(false),
                foreground: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                last_time: Mutex::new(None),
                next_tick: Mutex::new(None),
                wake: Notify::new(),
                debounce: DashMap::new(),
                debounce_seq: AtomicU64::new(0),
                timer: Mutex::new(None),
            }),
        })
    }

    /// Start the interval timer. Calling it again has no effect.
    pub fn start(&self) {
        let Ok(mut timer) = self.inner.timer.lock() else {
            return;
        };
        if timer.is_some() || self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        *timer = Some(tokio::spawn(async move { inner.run_timer().await }));
        debug!("Auto-save timer started");
    }

    pub fn config(&self) -> AutoSaveConfig {
        self.inner.config()
    }

    /// Replace the configuration. An invalid configuration is rejected and
    /// the current one stays in effect.
    pub fn update_config(&self, config: AutoSaveConfig) -> Result<(), SaveError> {
        config.validate()?;
        match self.inner.config.write() {
            Ok(mut current) => *current = config,
            Err(_) => return Err(SaveError::Internal("auto-save config lock poisoned".into())),
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn status(&self) -> AutoSaveStatus {
        let next_in = self
            .inner
            .next_tick
            .lock()
            .ok()
            .and_then(|t| *t)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        AutoSaveStatus {
            enabled: self.inner.config().enabled,
            last_time: self.inner.last_time.lock().ok().and_then(|t| *t),
            next_in,
            in_progress: self.inner.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Run one save attempt now.
    pub async fn trigger(&self, trigger: Trigger) -> Result<TriggerOutcome, SaveError> {
        self.inner.fire(trigger).await
    }

    /// Report a game event. The save fires once no further event of the
    /// same type has arrived for [`EVENT_DEBOUNCE`].
    pub fn notify_event(&self, name: &str) -> Result<(), SaveError> {
        if !is_known_event(name) {
            return Err(SaveError::Config(format!("unknown event '{}'", name)));
        }
        let config = self.inner.config();
        if !config.enabled || !config.events.iter().any(|e| e == name) {
            debug!("Ignoring event {}: not an auto-save trigger", name);
            return Ok(());
        }

        let seq = self.inner.debounce_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.debounce.insert(name.to_string(), seq);

        let inner = self.inner.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(EVENT_DEBOUNCE).await;
            let latest = inner.debounce.get(&name).map(|s| *s);
            if latest != Some(seq) || inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            inner.debounce.remove(&name);
            if let Err(e) = inner.fire(Trigger::Event(name.clone())).await {
                warn!("Auto-save after event {} failed: {}", name, e);
            }
        });
        Ok(())
    }

    /// Host visibility change. Losing visibility forces one save, awaited,
    /// and suspends the timer; regaining it restarts the interval.
    pub async fn on_visibility_change(
        &self,
        visible: bool,
    ) -> Result<Option<TriggerOutcome>, SaveError> {
        self.inner.foreground.store(visible, Ordering::SeqCst);
        self.inner.wake.notify_one();
        if visible {
            return Ok(None);
        }
        self.inner.fire(Trigger::VisibilityLost).await.map(Some)
    }

    /// Stop all triggers, wait for a running save, then perform a final save.
    ///
    /// Everything is bounded by `timeout`; on expiry the flush is abandoned
    /// and an error is returned.
    pub async fn shutdown(&self, timeout: Duration) -> Result<TriggerOutcome, SaveError> {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        if let Ok(mut timer) = self.inner.timer.lock() {
            if let Some(handle) = timer.take() {
                handle.abort();
            }
        }
        if let Ok(mut next) = self.inner.next_tick.lock() {
            *next = None;
        }

        let inner = self.inner.clone();
        let flush = async move {
            while inner.in_flight.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            inner.fire(Trigger::Shutdown).await
        };

        match tokio::time::timeout(timeout, flush).await {
            Ok(result) => {
                info!("Auto-save scheduler stopped");
                result
            }
            Err(_) => {
                warn!("Final auto-save did not finish within {:?}", timeout);
                Err(SaveError::Internal(format!(
                    "shutdown flush timed out after {:?}",
                    timeout
                )))
            }
        }
    }
}

impl SchedulerInner {
    fn config(&self) -> AutoSaveConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    fn set_next_tick(&self, at: Option<Instant>) {
        if let Ok(mut next) = self.next_tick.lock() {
            *next = at;
        }
    }

    async fn run_timer(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let config = self.config();
            if !config.enabled || !self.foreground.load(Ordering::SeqCst) {
                self.set_next_tick(None);
                self.wake.notified().await;
                continue;
            }

            let deadline = Instant::now() + config.interval();
            self.set_next_tick(Some(deadline));
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if let Err(e) = self.fire(Trigger::Interval).await {
                        warn!("Interval auto-save failed: {}", e);
                    }
                }
                _ = self.wake.notified() => {}
            }
        }
        self.set_next_tick(None);
    }

    async fn fire(self: &Arc<Self>, trigger: Trigger) -> Result<TriggerOutcome, SaveError> {
        if self.stopped.load(Ordering::SeqCst) && trigger != Trigger::Shutdown {
            debug!("Ignoring {} auto-save: scheduler is stopped", trigger);
            return Ok(TriggerOutcome::Stopped);
        }
        let config = self.config();
        if !config.enabled && trigger != Trigger::Manual {
            return Ok(TriggerOutcome::Disabled);
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Dropping {} auto-save: another save is in flight", trigger);
            return Ok(TriggerOutcome::Dropped);
        }

        // The attempt runs detached and owns the in-flight flag, so an
        // aborted or dropped caller cannot clear it while a write is pending.
        let inner = self.clone();
        tokio::spawn(async move {
            let _in_flight = InFlight(&inner.in_flight);
            inner.save_once(&trigger, config.auto_slot_count).await
        })
        .await
        .map_err(|e| SaveError::Internal(format!("Auto-save task failed: {}", e)))?
    }

    async fn save_once(
        &self,
        trigger: &Trigger,
        auto_slot_count: u32,
    ) -> Result<TriggerOutcome, SaveError> {
        let Some(snapshot) = self.provider.snapshot().await? else {
            debug!("Skipping {} auto-save: nothing to save", trigger);
            return Ok(TriggerOutcome::NothingToSave);
        };

        let slot_id = self
            .store
            .next_auto_save_slot_within(auto_slot_count)
            .await?;
        let receipt = self.store.save(&snapshot, slot_id).await?;

        if let Ok(mut last) = self.last_time.lock() {
            *last = Some(receipt.last_saved);
        }
        info!("Auto-saved ({}) to slot {}", trigger, slot_id);
        Ok(TriggerOutcome::Saved(receipt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use colony_save_core::{ManualClock, MemoryKv, SlotLayout, Snapshot};
    use std::sync::atomic::AtomicUsize;

    struct SlowProvider {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl SlowProvider {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotProvider for SlowProvider {
        async fn snapshot(&self) -> Result<Option<Snapshot>, SaveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let at = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
            Ok(Some(Snapshot::new("Auto", "Anthill", at)))
        }
    }

    struct EmptyProvider;

    #[async_trait]
    impl SnapshotProvider for EmptyProvider {
        async fn snapshot(&self) -> Result<Option<Snapshot>, SaveError> {
            Ok(None)
        }
    }

    async fn store() -> SlotStore {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap(),
        ));
        SlotStore::open(Arc::new(MemoryKv::new()), SlotLayout::default(), clock)
            .await
            .unwrap()
    }

    async fn occupied_auto_slots(store: &SlotStore) -> usize {
        let layout = store.layout().clone();
        store
            .list_slots()
            .await
            .into_iter()
            .filter(|s| s.occupied && layout.auto_slot_ids().any(|id| id == s.slot_id))
            .count()
    }

    #[test]
    fn test_config_validation() {
        assert!(AutoSaveConfig::default().validate().is_ok());
        for bad in [
            AutoSaveConfig {
                interval_minutes: 0,
                ..Default::default()
            },
            AutoSaveConfig {
                interval_minutes: 61,
                ..Default::default()
            },
            AutoSaveConfig {
                auto_slot_count: 0,
                ..Default::default()
            },
            AutoSaveConfig {
                auto_slot_count: 11,
                ..Default::default()
            },
            AutoSaveConfig {
                events: vec!["meteor_strike".into()],
                ..Default::default()
            },
        ] {
            assert!(matches!(bad.validate(), Err(SaveError::Config(_))));
        }
    }

    #[tokio::test]
    async fn test_invalid_update_keeps_previous_config() {
        let scheduler =
            AutoSaveScheduler::new(store().await, SlowProvider::new(Duration::ZERO), AutoSaveConfig::default())
                .unwrap();
        let custom = AutoSaveConfig {
            interval_minutes: 10,
            ..Default::default()
        };
        scheduler.update_config(custom.clone()).unwrap();
        assert!(scheduler
            .update_config(AutoSaveConfig {
                interval_minutes: 90,
                ..Default::default()
            })
            .is_err());
        assert_eq!(scheduler.config(), custom);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_triggers_write_once() {
        let store = store().await;
        let provider = SlowProvider::new(Duration::from_secs(1));
        let scheduler =
            AutoSaveScheduler::new(store.clone(), provider.clone(), AutoSaveConfig::default()).unwrap();

        let (a, b, c) = tokio::join!(
            scheduler.trigger(Trigger::Interval),
            scheduler.trigger(Trigger::Event("battle_ended".into())),
            scheduler.trigger(Trigger::Interval),
        );
        assert!(matches!(a.unwrap(), TriggerOutcome::Saved(_)));
        assert_eq!(b.unwrap(), TriggerOutcome::Dropped);
        assert_eq!(c.unwrap(), TriggerOutcome::Dropped);
        assert_eq!(provider.calls(), 1);
        assert_eq!(occupied_auto_slots(&store).await, 1);
        assert!(!scheduler.status().in_progress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_burst_is_debounced() {
        let store = store().await;
        let provider = SlowProvider::new(Duration::ZERO);
        let scheduler =
            AutoSaveScheduler::new(store.clone(), provider.clone(), AutoSaveConfig::default()).unwrap();

        for _ in 0..5 {
            scheduler.notify_event("building_completed").unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(provider.calls(), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(provider.calls(), 1);
        assert_eq!(occupied_auto_slots(&store).await, 1);
        assert!(scheduler.status().last_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_events_debounce_separately() {
        let store = store().await;
        let provider = SlowProvider::new(Duration::ZERO);
        let scheduler =
            AutoSaveScheduler::new(store.clone(), provider.clone(), AutoSaveConfig::default()).unwrap();

        scheduler.notify_event("battle_ended").unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.notify_event("season_changed").unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_events() {
        let provider = SlowProvider::new(Duration::ZERO);
        let config = AutoSaveConfig {
            events: vec!["battle_ended".into()],
            ..Default::default()
        };
        let scheduler = AutoSaveScheduler::new(store().await, provider.clone(), config).unwrap();
        assert!(scheduler.notify_event("meteor_strike").is_err());
        assert!(scheduler.notify_event("season_changed").is_ok());
        assert!(scheduler.inner.debounce.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_pauses_in_background() {
        let store = store().await;
        let provider = SlowProvider::new(Duration::ZERO);
        let config = AutoSaveConfig {
            interval_minutes: 1,
            ..Default::default()
        };
        let scheduler = AutoSaveScheduler::new(store.clone(), provider.clone(), config).unwrap();
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(provider.calls(), 1);
        assert!(scheduler.status().next_in.is_some());

        // losing visibility forces one save, then the timer stops
        let outcome = scheduler.on_visibility_change(false).await.unwrap();
        assert!(matches!(outcome, Some(TriggerOutcome::Saved(_))));
        assert_eq!(provider.calls(), 2);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(provider.calls(), 2);
        assert!(scheduler.status().next_in.is_none());

        scheduler.on_visibility_change(true).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_scheduler_does_not_save() {
        let provider = SlowProvider::new(Duration::ZERO);
        let config = AutoSaveConfig {
            enabled: false,
            interval_minutes: 1,
            ..Default::default()
        };
        let scheduler = AutoSaveScheduler::new(store().await, provider.clone(), config).unwrap();
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(
            scheduler.trigger(Trigger::Interval).await.unwrap(),
            TriggerOutcome::Disabled
        );
        assert_eq!(provider.calls(), 0);
        assert!(matches!(
            scheduler.trigger(Trigger::Manual).await.unwrap(),
            TriggerOutcome::Saved(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_save_then_flushes() {
        let store = store().await;
        let provider = SlowProvider::new(Duration::from_secs(1));
        let scheduler =
            AutoSaveScheduler::new(store.clone(), provider.clone(), AutoSaveConfig::default()).unwrap();

        let running = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.trigger(Trigger::Interval).await })
        };
        tokio::task::yield_now().await;
        assert!(scheduler.status().in_progress);

        let outcome = scheduler.shutdown(Duration::from_secs(10)).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Saved(_)));
        assert!(matches!(running.await.unwrap().unwrap(), TriggerOutcome::Saved(_)));
        assert_eq!(provider.calls(), 2);
        assert_eq!(occupied_auto_slots(&store).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_saves_after_shutdown() {
        let store = store().await;
        let provider = SlowProvider::new(Duration::ZERO);
        let scheduler =
            AutoSaveScheduler::new(store.clone(), provider.clone(), AutoSaveConfig::default()).unwrap();

        let outcome = scheduler.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Saved(_)));
        assert_eq!(provider.calls(), 1);

        assert_eq!(
            scheduler.trigger(Trigger::Interval).await.unwrap(),
            TriggerOutcome::Stopped
        );
        assert_eq!(
            scheduler.trigger(Trigger::Manual).await.unwrap(),
            TriggerOutcome::Stopped
        );
        assert_eq!(
            scheduler.on_visibility_change(false).await.unwrap(),
            Some(TriggerOutcome::Stopped)
        );
        scheduler.notify_event("battle_ended").unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(provider.calls(), 1);
        assert_eq!(occupied_auto_slots(&store).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_interval_save_does_not_overlap() {
        let store = store().await;
        let provider = SlowProvider::new(Duration::from_secs(1));
        let config = AutoSaveConfig {
            interval_minutes: 1,
            ..Default::default()
        };
        let scheduler = AutoSaveScheduler::new(store.clone(), provider.clone(), config).unwrap();
        scheduler.start();

        // the interval save starts at 60s and is still reading the snapshot
        tokio::time::sleep(Duration::from_millis(60_500)).await;
        assert_eq!(provider.calls(), 1);
        assert!(scheduler.status().in_progress);

        let outcome = scheduler.shutdown(Duration::from_secs(10)).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Saved(_)));
        assert_eq!(provider.calls(), 2);
        // the interval save completed before the final save picked its slot
        assert_eq!(occupied_auto_slots(&store).await, 2);
        assert!(!scheduler.status().in_progress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_times_out() {
        let provider = SlowProvider::new(Duration::from_secs(30));
        let scheduler =
            AutoSaveScheduler::new(store().await, provider, AutoSaveConfig::default()).unwrap();
        assert!(scheduler.shutdown(Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_nothing_to_save() {
        let scheduler =
            AutoSaveScheduler::new(store().await, Arc::new(EmptyProvider), AutoSaveConfig::default())
                .unwrap();
        assert_eq!(
            scheduler.trigger(Trigger::Manual).await.unwrap(),
            TriggerOutcome::NothingToSave
        );
    }
}
