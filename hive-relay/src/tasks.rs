//! Periodic task runner shared by the monitor, the forwarders, the resender and
//! the network reporter.

use crate::state::StopSignal;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait PeriodicTask: Send + 'static {
    fn name(&self) -> &'static str;

    /// One iteration. An error is logged and the task carries on at its next tick.
    async fn tick(&mut self) -> anyhow::Result<()>;
}

/// Runs `task` every `period` until `stop` fires. The stop signal is only
/// observed between iterations; a panicking iteration is contained like an error.
pub async fn run_periodic<T: PeriodicTask>(mut task: T, period: Duration, mut stop: StopSignal) {
    let name = task.name();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(task = name, period_secs = period.as_secs_f64(), "periodic task started");

    loop {
        tokio::select! {
            biased;
            _ = stop.stopped() => break,
            _ = ticker.tick() => {}
        }

        match AssertUnwindSafe(task.tick()).catch_unwind().await {
            Ok(Ok(())) => debug!(task = name, "iteration done"),
            Ok(Err(e)) => warn!(task = name, error = %e, "iteration failed"),
            Err(_) => error!(task = name, "iteration panicked"),
        }
    }

    info!(task = name, "periodic task stopped");
}

pub fn spawn_periodic<T: PeriodicTask>(task: T, period: Duration, stop: StopSignal) -> JoinHandle<()> {
    tokio::spawn(run_periodic(task, period, stop))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::stop_channel;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Flaky {
        runs: Arc<AtomicU32>,
    }

    #[async_trait]
    impl PeriodicTask for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn tick(&mut self) -> anyhow::Result<()> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => anyhow::bail!("transient failure"),
                1 => panic!("bug in one iteration"),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_task() {
        let runs = Arc::new(AtomicU32::new(0));
        let (trigger, stop) = stop_channel();
        let handle = spawn_periodic(Flaky { runs: runs.clone() }, Duration::from_millis(5), stop);

        tokio::time::timeout(Duration::from_secs(5), async {
            while runs.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        trigger.stop();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_first_tick() {
        let runs = Arc::new(AtomicU32::new(0));
        let (trigger, stop) = stop_channel();
        trigger.stop();
        run_periodic(Flaky { runs: runs.clone() }, Duration::from_secs(3600), stop).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
