//! Idle reaping and LRU eviction policy.
//!
//! The registry consults [`select_victim`] when a start arrives at the
//! running-instances cap; the [`IdleSweeper`] periodically stops running
//! instances whose last use is older than their idle timeout.

use crate::instance::Instance;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pick the eviction victim among `running`: the instance with the smallest
/// `last_used_at`, ties broken by name ascending. Never the requester.
pub(crate) fn select_victim(
    running: &[Arc<Instance>],
    requester: &str,
) -> Option<Arc<Instance>> {
    let keys: Vec<(&str, i64)> = running
        .iter()
        .map(|i| (i.name(), i.last_used_millis()))
        .collect();
    let victim = select_victim_key(&keys, requester)?;
    running.iter().find(|i| i.name() == victim).cloned()
}

fn select_victim_key<'a>(candidates: &[(&'a str, i64)], requester: &str) -> Option<&'a str> {
    candidates
        .iter()
        .filter(|(name, _)| *name != requester)
        .min_by(|(an, at), (bn, bt)| at.cmp(bt).then_with(|| an.cmp(bn)))
        .map(|(name, _)| *name)
}

/// Whether an instance has been idle past its timeout.
fn is_idle(last_used_millis: i64, idle_timeout_minutes: u64, now: DateTime<Utc>) -> bool {
    if idle_timeout_minutes == 0 || last_used_millis == 0 {
        return false;
    }
    let idle_millis = now.timestamp_millis() - last_used_millis;
    idle_millis > (idle_timeout_minutes as i64) * 60 * 1000
}

/// Periodic task that stops running instances past their idle timeout.
pub struct IdleSweeper {
    registry: Arc<Registry>,
    period: Duration,
}

impl IdleSweeper {
    pub fn new(registry: Arc<Registry>, period: Duration) -> Self {
        Self { registry, period }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        info!(period = ?self.period, "Starting idle sweeper");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// One sweep pass. Targets are snapshotted first so no registry
    /// iteration state is held while stopping. Best-effort: a failed stop
    /// is logged and the sweep moves on. Returns the number of instances
    /// stopped.
    pub async fn sweep_once(&self) -> usize {
        let now = Utc::now();
        let mut targets = Vec::new();

        for instance in self.registry.running_instances().await {
            let timeout = instance.options().await.idle_timeout_minutes;
            if is_idle(instance.last_used_millis(), timeout, now) {
                targets.push((instance, timeout));
            }
        }

        let mut stopped = 0;
        for (instance, timeout) in targets {
            info!(
                instance = instance.name(),
                idle_timeout_minutes = timeout,
                "Stopping idle instance"
            );
            match self.registry.stop_instance(instance.name()).await {
                Ok(()) => {
                    metrics::counter!("llamactl_instance_idle_stops_total").increment(1);
                    stopped += 1;
                }
                Err(e) => {
                    warn!(instance = instance.name(), error = %e, "Failed to stop idle instance");
                }
            }
        }

        if stopped > 0 {
            debug!(stopped, "Idle sweep finished");
        }
        stopped
    }
}
