//! Periodic background tasks wiring the store into the scheduler.

use std::{sync::Arc, time::Duration};

use crate::{
    error::Result,
    metrics,
    scheduler::{BackgroundTask, Context},
    store::flush::{background_dirty_flush, check_child_complete},
    store::SpillStore,
};

/// Reaps a finished flush child and runs the completion handler.
pub struct ChildReapTask {
    store: Arc<SpillStore>,
}

impl ChildReapTask {
    pub fn new(store: Arc<SpillStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for ChildReapTask {
    fn name(&self) -> &'static str {
        "child-reap"
    }

    fn interval(&self) -> Duration {
        self.store.config.scheduler.reap_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        check_child_complete(&self.store).await
    }
}

/// The autonomous flush policy: starts a background flush once the dirty
/// counter crosses the configured threshold.
pub struct FlushPolicyTask {
    store: Arc<SpillStore>,
}

impl FlushPolicyTask {
    pub fn new(store: Arc<SpillStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushPolicyTask {
    fn name(&self) -> &'static str {
        "flush-policy"
    }

    fn interval(&self) -> Duration {
        self.store.config.scheduler.flush_policy_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let threshold = self.store.config.scheduler.dirty_flush_threshold;
        if self.store.stats().dirty() < threshold || self.store.background_op_in_progress() {
            return Ok(());
        }

        tracing::info!(
            dirty = self.store.stats().dirty(),
            threshold,
            "dirty threshold reached; starting background flush"
        );
        background_dirty_flush(&self.store)
    }
}

/// Logs a metrics snapshot.
pub struct MetricsTask {
    store: Arc<SpillStore>,
}

impl MetricsTask {
    pub fn new(store: Arc<SpillStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.store.config.scheduler.metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        metrics::log_metrics(&self.store.metrics());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FreezerConfig, SchedulerConfig};
    use crate::scheduler::Scheduler;
    use crate::tmpfs::TempDir;

    #[tokio::test]
    async fn test_policy_and_reap_tasks_flush_autonomously() -> Result<()> {
        let dir = TempDir::new().expect("tempdir");
        let store = SpillStore::open(
            FreezerConfig::new(dir.path()).db_count(1).scheduler(
                SchedulerConfig::default()
                    .reap_interval(Duration::from_millis(5))
                    .flush_policy_interval(Duration::from_millis(5))
                    .dirty_flush_threshold(3),
            ),
        )?;

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(FlushPolicyTask::new(store.clone())));
        scheduler.register(Arc::new(ChildReapTask::new(store.clone())));

        for i in 0..5u32 {
            let key = format!("key_{i}").into_bytes();
            store.set(0, &key, b"v".to_vec())?;
        }

        // Threshold is 3, so the policy should kick off a flush and the
        // reaper should settle it.
        for _ in 0..200 {
            if store.stats().flush_successes() > 0 && store.dirty_key_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.stats().flush_successes() > 0);
        assert_eq!(store.dirty_key_count(), 0);
        assert_eq!(store.flushing_key_count(), 0);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_policy_task_idles_below_threshold() -> Result<()> {
        let dir = TempDir::new().expect("tempdir");
        let store = SpillStore::open(
            FreezerConfig::new(dir.path()).db_count(1).scheduler(
                SchedulerConfig::default()
                    .flush_policy_interval(Duration::from_millis(5))
                    .dirty_flush_threshold(100),
            ),
        )?;

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(FlushPolicyTask::new(store.clone())));

        store.set(0, b"a", b"1".to_vec())?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!store.background_op_in_progress());
        assert_eq!(store.dirty_key_count(), 1);

        scheduler.shutdown().await?;
        Ok(())
    }
}
