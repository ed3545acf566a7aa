//! Periodic ticking and eviction of idle sessions

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::lifecycle::types::LifecycleConfig;
use crate::threading::{Eviction, SharedThreads};

/// Background service that ages sessions and evicts the expired ones
///
/// Each tick increments every session's idle counter, then removes the
/// sessions past the timeout together with their message chains. Eviction
/// is silent toward the chat platform.
pub struct LifecycleManager<H = ()> {
    driver: Arc<TickDriver<H>>,
    running: Arc<RwLock<bool>>,
    task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl<H> LifecycleManager<H>
where
    H: Clone + Send + 'static,
{
    pub fn new(threads: SharedThreads<H>, config: LifecycleConfig) -> Self {
        Self {
            driver: Arc::new(TickDriver {
                threads,
                config,
                ticks: AtomicU64::new(0),
                evicted: AtomicUsize::new(0),
            }),
            running: Arc::new(RwLock::new(false)),
            task: Arc::new(RwLock::new(None)),
        }
    }

    /// Start ticking in the background; a no-op when already running
    pub async fn start(&self) {
        {
            let running_guard = self.running.read().await;
            if *running_guard {
                debug!("Lifecycle manager already running");
                return;
            }
        }

        *self.running.write().await = true;

        let driver = Arc::clone(&self.driver);
        let running = Arc::clone(&self.running);
        let task = tokio::spawn(async move {
            driver.run_loop(running).await;
        });

        *self.task.write().await = Some(task);
        info!(
            "Lifecycle manager started (tick every {:?}, timeout {} ticks)",
            self.driver.config.tick_interval, self.driver.config.timeout_ticks
        );
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;

        if let Some(task) = self.task.write().await.take() {
            task.abort();
            info!("Lifecycle manager stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Run one tick immediately, outside the timer
    pub fn tick_now(&self) -> Vec<Eviction> {
        self.driver.tick()
    }

    /// Ticks performed since creation
    pub fn ticks(&self) -> u64 {
        self.driver.ticks.load(Ordering::Relaxed)
    }

    pub async fn status(&self) -> serde_json::Value {
        let is_running = *self.running.read().await;
        let (sessions, records) = {
            let threads = self.driver.threads.lock();
            (threads.sessions().len(), threads.store().len())
        };

        serde_json::json!({
            "running": is_running,
            "ticks": self.ticks(),
            "evicted_sessions": self.driver.evicted.load(Ordering::Relaxed),
            "sessions": sessions,
            "records": records,
            "config": self.driver.config,
        })
    }
}

/// State shared between the manager and its spawned loop
struct TickDriver<H> {
    threads: SharedThreads<H>,
    config: LifecycleConfig,
    ticks: AtomicU64,
    evicted: AtomicUsize,
}

impl<H: Clone> TickDriver<H> {
    async fn run_loop(&self, running: Arc<RwLock<bool>>) {
        loop {
            tokio::time::sleep(self.config.tick_interval).await;

            if !*running.read().await {
                break;
            }

            self.tick();
        }
    }

    fn tick(&self) -> Vec<Eviction> {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        let mut threads = self.threads.lock();
        let evictions = threads.tick_and_evict(self.config.timeout_ticks);
        self.evicted.fetch_add(evictions.len(), Ordering::Relaxed);

        if self.config.dump_due(tick) && !threads.is_empty() {
            let snapshot = threads.snapshot();
            debug!(
                "Thread state at tick {}: {}",
                tick,
                serde_json::to_string(&snapshot).unwrap_or_default()
            );
        }

        evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threading::{BackendContext, MessageId, ThreadState};
    use std::time::Duration;

    fn config(timeout_ticks: u64, tick_interval: Duration) -> LifecycleConfig {
        LifecycleConfig {
            timeout_ticks,
            tick_interval,
            debug_dump_every: 1,
        }
    }

    fn seeded() -> SharedThreads {
        let threads = ThreadState::shared();
        {
            let mut state = threads.lock();
            state
                .record_message(MessageId::new(1, 1), None, Some("hi".into()), BackendContext::None)
                .unwrap();
            state
                .record_message(
                    MessageId::new(1, 2),
                    Some(MessageId::new(1, 1)),
                    Some("hello".into()),
                    BackendContext::None,
                )
                .unwrap();
        }
        threads
    }

    #[tokio::test]
    async fn test_tick_now_evicts_after_timeout() {
        let threads = seeded();
        let manager = LifecycleManager::new(threads.clone(), config(2, Duration::from_secs(3600)));

        assert!(manager.tick_now().is_empty());
        assert!(manager.tick_now().is_empty());
        let evicted = manager.tick_now();

        assert_eq!(
            evicted,
            vec![Eviction {
                start_id: MessageId::new(1, 1),
                removed: 2
            }]
        );
        assert!(threads.lock().is_empty());
        assert_eq!(manager.ticks(), 3);
    }

    #[tokio::test]
    async fn test_zero_timeout_evicts_on_first_tick() {
        let threads = seeded();
        let manager = LifecycleManager::new(threads.clone(), config(0, Duration::from_secs(3600)));

        assert_eq!(manager.tick_now().len(), 1);
        assert!(threads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let manager = LifecycleManager::new(seeded(), config(600, Duration::from_secs(3600)));
        assert!(!manager.is_running().await);

        manager.start().await;
        assert!(manager.is_running().await);
        manager.start().await;
        assert!(manager.is_running().await);

        manager.stop().await;
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn test_background_loop_evicts() {
        let threads = seeded();
        let manager = LifecycleManager::new(threads.clone(), config(1, Duration::from_millis(10)));

        manager.start().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        manager.stop().await;

        assert!(manager.ticks() >= 2);
        assert!(threads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_status() {
        let manager = LifecycleManager::new(seeded(), config(5, Duration::from_secs(3600)));
        manager.tick_now();

        let status = manager.status().await;
        assert!(!status["running"].as_bool().unwrap());
        assert_eq!(status["ticks"], 1);
        assert_eq!(status["sessions"], 1);
        assert_eq!(status["records"], 2);
        assert_eq!(status["config"]["timeout_ticks"], 5);
    }
}
