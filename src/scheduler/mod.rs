//! Per-source collection scheduling.
//!
//! Each enabled source gets its own loop task: collect, sleep until the next
//! cron occurrence or fixed interval, repeat. Loops are independent, so one
//! slow provider never delays another, and the engine's exclusivity guard
//! makes an overlapping manual trigger a no-op rather than a conflict.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use croner::Cron;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigProvider, Schedule, Source};
use crate::engine::CollectorEngine;

pub struct Scheduler {
    engine: Arc<CollectorEngine>,
    config: Arc<dyn ConfigProvider>,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(engine: Arc<CollectorEngine>, config: Arc<dyn ConfigProvider>) -> Self {
        Scheduler {
            engine,
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns a collection loop for every enabled source.
    pub async fn start(&self) -> Result<()> {
        let sources = self.config.sources()?;
        info!(count = sources.len(), "starting scheduler");
        for source in sources {
            if source.enabled {
                self.schedule_source(&source).await;
            }
        }
        Ok(())
    }

    /// (Re)schedules one source, replacing any existing loop. Called on
    /// startup and again whenever a source's schedule is edited.
    pub async fn schedule_source(&self, source: &Source) {
        let mut handles = self.handles.lock().await;
        if let Some(old) = handles.remove(&source.id) {
            debug!(source = %source.id, "replacing existing collection loop");
            old.abort();
        }

        let engine = Arc::clone(&self.engine);
        let source_id = source.id.clone();
        let schedule = source.schedule.clone();
        let handle = tokio::spawn(async move {
            collection_loop(engine, source_id, schedule).await;
        });
        handles.insert(source.id.clone(), handle);
        info!(source = %source.id, "collection loop scheduled");
    }

    /// Stops a source's loop, if one is running.
    pub async fn unschedule(&self, source_id: &str) {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.remove(source_id) {
            handle.abort();
            info!(source = %source_id, "collection loop stopped");
        }
    }

    /// Aborts every loop. Called on process shutdown.
    pub async fn shutdown(&self) {
        let mut handles = self.handles.lock().await;
        let count = handles.len();
        for (_, handle) in handles.drain() {
            handle.abort();
        }
        info!(count, "scheduler stopped");
    }

    /// Number of sources currently scheduled.
    pub async fn scheduled_count(&self) -> usize {
        self.handles.lock().await.len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Best effort; a clean shutdown goes through shutdown() first.
        if let Ok(mut handles) = self.handles.try_lock() {
            for (_, handle) in handles.drain() {
                handle.abort();
            }
        }
    }
}

async fn collection_loop(engine: Arc<CollectorEngine>, source_id: String, schedule: Schedule) {
    // Collect once immediately so a freshly added source shows data without
    // waiting for its first tick.
    loop {
        if let Err(e) = engine.run(&source_id).await {
            error!(source = %source_id, error = %e, "scheduled run failed");
        }
        match next_delay(&schedule) {
            Some(delay) => {
                debug!(source = %source_id, seconds = delay.as_secs(), "sleeping until next run");
                tokio::time::sleep(delay).await;
            }
            None => {
                warn!(source = %source_id, "no further occurrences, stopping loop");
                return;
            }
        }
    }
}

/// Time until the next trigger. A cron expression wins over the interval;
/// an invalid one is logged and the interval takes over.
fn next_delay(schedule: &Schedule) -> Option<Duration> {
    let interval = Duration::from_secs(schedule.interval_minutes.max(1) * 60);
    let Some(expr) = &schedule.cron else {
        return Some(interval);
    };
    let cron = match Cron::new(expr).parse() {
        Ok(cron) => cron,
        Err(e) => {
            warn!(cron = %expr, error = %e, "invalid cron expression, using interval");
            return Some(interval);
        }
    };
    match cron.find_next_occurrence(&Utc::now(), false) {
        Ok(next) => {
            let delta = (next - Utc::now()).to_std().unwrap_or(Duration::from_secs(1));
            Some(delta)
        }
        Err(e) => {
            warn!(cron = %expr, error = %e, "no next occurrence");
            None
        }
    }
}
