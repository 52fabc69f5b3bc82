//! Liveness monitor: periodic sweep that declares silent units DOWN and
//! brings them back once their silence gap is under the timeout again.
//!
//! Recovery is judged from the gap alone; the sweep does not check that a new
//! heartbeat arrived in between.

use crate::alerts::AlertSink;
use crate::clock::{format_timestamp, seconds_between, SharedClock};
use crate::liveness::LivenessStore;
use crate::models::{AlertKind, SyncStatus};
use crate::store::StoreError;
use crate::tasks::PeriodicTask;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Default, PartialEq)]
pub struct SweepOutcome {
    pub went_down: Vec<String>,
    pub recovered: Vec<String>,
}

pub struct LivenessMonitor {
    store: LivenessStore,
    alerts: AlertSink,
    clock: SharedClock,
    timeout_secs: f64,
    grace_secs: f64,
    started_at: NaiveDateTime,
    grace_over: bool,
    /// Units this monitor declared (or found) DOWN; keeps the DOWN alert to one per silence.
    down_units: HashSet<String>,
}

impl LivenessMonitor {
    /// Units left DOWN by an earlier run are remembered, so a heartbeat that
    /// overwrites their row during the grace period still yields a recovered alert.
    pub fn new(store: LivenessStore, alerts: AlertSink, clock: SharedClock, timeout_secs: f64, grace_secs: f64) -> Self {
        let started_at = clock.now();
        let down_units = match store.list_units() {
            Ok(units) => units
                .into_iter()
                .filter(|u| u.sync_status == SyncStatus::Down)
                .map(|u| u.unit_id)
                .collect(),
            Err(e) => {
                warn!(error = %e, "could not read units left DOWN; starting with none");
                HashSet::new()
            }
        };
        Self {
            store,
            alerts,
            clock,
            timeout_secs,
            grace_secs,
            started_at,
            grace_over: false,
            down_units,
        }
    }

    pub fn sweep(&mut self) -> Result<SweepOutcome, StoreError> {
        let now = self.clock.now();
        let mut outcome = SweepOutcome::default();

        if seconds_between(now, self.started_at) < self.grace_secs {
            debug!("startup grace period; skipping liveness sweep");
            return Ok(outcome);
        }
        if !self.grace_over {
            info!(grace_secs = self.grace_secs, "startup grace period over; liveness monitoring active");
            self.grace_over = true;
        }

        for unit in self.store.list_units()? {
            let gap = seconds_between(now, unit.last_seen);
            let id = unit.unit_id.as_str();

            if gap > self.timeout_secs {
                if unit.sync_status == SyncStatus::Down {
                    // DOWN from an earlier run of the hub; don't alert again
                    self.down_units.insert(unit.unit_id.clone());
                    continue;
                }
                match self.store.mark_down(id, &unit.last_seen) {
                    Ok(true) => {
                        self.down_units.insert(unit.unit_id.clone());
                        self.alerts.emit(
                            id,
                            AlertKind::Down,
                            format!("{id} is DOWN. Last seen: {}", format_timestamp(&unit.last_seen)),
                            &now,
                        );
                        outcome.went_down.push(unit.unit_id.clone());
                    }
                    Ok(false) => debug!(unit = id, "status changed during sweep; skipping"),
                    Err(e) => warn!(unit = id, error = %e, "could not mark unit down"),
                }
            } else if unit.sync_status == SyncStatus::Down || self.down_units.contains(id) {
                if unit.sync_status == SyncStatus::Down {
                    if let Err(e) = self.store.mark_recovered(id) {
                        warn!(unit = id, error = %e, "could not mark unit recovered");
                        continue;
                    }
                }
                self.down_units.remove(id);
                self.alerts.emit(
                    id,
                    AlertKind::Recovered,
                    format!("{id} has recovered from DOWN ({gap:.0}s since last heartbeat)"),
                    &now,
                );
                outcome.recovered.push(unit.unit_id.clone());
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl PeriodicTask for LivenessMonitor {
    fn name(&self) -> &'static str {
        "liveness-monitor"
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        self.sweep()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::alerts_of_kind;
    use crate::clock::{ts, Clock, ManualClock};
    use crate::outbox::Outbox;
    use std::sync::Arc;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: LivenessStore,
        outbox: Outbox,
    }

    impl Fixture {
        fn new(start: &str) -> Self {
            Self {
                clock: ManualClock::starting_at(start),
                store: LivenessStore::open_in_memory().unwrap(),
                outbox: Outbox::open_in_memory().unwrap(),
            }
        }

        fn monitor(&self, timeout: f64, grace: f64) -> LivenessMonitor {
            LivenessMonitor::new(
                self.store.clone(),
                AlertSink::new("beehub", self.outbox.clone()),
                self.clock.clone(),
                timeout,
                grace,
            )
        }

        fn heartbeat(&self, unit: &str) {
            self.store.record_heartbeat(unit, &self.clock.now(), SyncStatus::Good, true).unwrap();
        }
    }

    #[test]
    fn test_hive3_goes_down_only_after_timeout() {
        let f = Fixture::new("2024-01-01T00:00:00");
        let mut monitor = f.monitor(90.0, 0.0);

        // heartbeats every 10s, the last one at 00:01:00
        for _ in 0..6 {
            f.clock.advance_secs(10);
            f.heartbeat("hive3");
            assert_eq!(monitor.sweep().unwrap(), SweepOutcome::default());
        }

        for gap in [10, 50, 80, 90] {
            f.clock.set("2024-01-01T00:01:00");
            f.clock.advance_secs(gap);
            assert!(monitor.sweep().unwrap().went_down.is_empty(), "gap {gap}s must not be DOWN");
        }

        f.clock.set("2024-01-01T00:02:31");
        assert_eq!(monitor.sweep().unwrap().went_down, vec!["hive3"]);
        let unit = f.store.unit("hive3").unwrap().unwrap();
        assert_eq!(unit.sync_status, SyncStatus::Down);
        assert!(!unit.powered_on);
        assert_eq!(unit.last_seen, ts("2024-01-01T00:01:00"));
    }

    #[test]
    fn test_down_alert_fires_once_per_silence() {
        let f = Fixture::new("2024-01-01T00:00:00");
        let mut monitor = f.monitor(90.0, 0.0);
        f.heartbeat("hive3");

        for _ in 0..10 {
            f.clock.advance_secs(60);
            monitor.sweep().unwrap();
        }
        assert_eq!(alerts_of_kind(&f.outbox, AlertKind::Down).len(), 1);
    }

    #[test]
    fn test_no_action_during_grace_period() {
        let f = Fixture::new("2024-01-01T00:10:00");
        f.store.record_heartbeat("hive1", &ts("2024-01-01T00:00:00"), SyncStatus::Good, true).unwrap();
        let mut monitor = f.monitor(90.0, 120.0);

        f.clock.advance_secs(119);
        assert_eq!(monitor.sweep().unwrap(), SweepOutcome::default());
        assert_eq!(f.store.unit("hive1").unwrap().unwrap().sync_status, SyncStatus::Good);

        f.clock.advance_secs(1);
        assert_eq!(monitor.sweep().unwrap().went_down, vec!["hive1"]);
    }

    #[test]
    fn test_heartbeat_after_down_reports_recovery() {
        let f = Fixture::new("2024-01-01T00:00:00");
        let mut monitor = f.monitor(90.0, 0.0);
        f.heartbeat("hive3");
        f.clock.advance_secs(100);
        monitor.sweep().unwrap();

        // unit comes back: handler overwrites DOWN with a fresh heartbeat
        f.heartbeat("hive3");
        f.clock.advance_secs(10);
        let outcome = monitor.sweep().unwrap();
        assert_eq!(outcome.recovered, vec!["hive3"]);
        assert_eq!(alerts_of_kind(&f.outbox, AlertKind::Recovered).len(), 1);

        // and a later silence is a new DOWN
        f.clock.advance_secs(100);
        assert_eq!(monitor.sweep().unwrap().went_down, vec!["hive3"]);
        assert_eq!(alerts_of_kind(&f.outbox, AlertKind::Down).len(), 2);
    }

    #[test]
    fn test_down_row_under_threshold_recovers_on_gap_alone() {
        let f = Fixture::new("2024-01-01T00:00:00");
        f.heartbeat("hive8");
        f.store.mark_down("hive8", &ts("2024-01-01T00:00:00")).unwrap();
        // fresh monitor (hub restart), row is DOWN but the gap is small
        let mut monitor = f.monitor(90.0, 0.0);
        f.clock.advance_secs(5);

        assert_eq!(monitor.sweep().unwrap().recovered, vec!["hive8"]);
        assert_eq!(f.store.unit("hive8").unwrap().unwrap().sync_status, SyncStatus::Good);
    }

    #[test]
    fn test_restart_does_not_repeat_down_alert() {
        let f = Fixture::new("2024-01-01T00:00:00");
        f.heartbeat("hive3");
        f.clock.advance_secs(200);
        f.monitor(90.0, 0.0).sweep().unwrap();

        let mut restarted = f.monitor(90.0, 0.0);
        f.clock.advance_secs(60);
        assert_eq!(restarted.sweep().unwrap(), SweepOutcome::default());
        assert_eq!(alerts_of_kind(&f.outbox, AlertKind::Down).len(), 1);
    }

    #[test]
    fn test_heartbeat_during_grace_after_restart_reports_recovery() {
        let f = Fixture::new("2024-01-01T00:00:00");
        f.heartbeat("hive3");
        f.clock.advance_secs(200);
        f.monitor(90.0, 0.0).sweep().unwrap();

        // hub restarts; the unit comes back before the grace period ends
        let mut restarted = f.monitor(90.0, 120.0);
        f.clock.advance_secs(110);
        f.heartbeat("hive3");
        assert_eq!(restarted.sweep().unwrap(), SweepOutcome::default());

        f.clock.advance_secs(15);
        let outcome = restarted.sweep().unwrap();
        assert_eq!(outcome.recovered, vec!["hive3"]);
        assert!(outcome.went_down.is_empty());
        assert_eq!(alerts_of_kind(&f.outbox, AlertKind::Down).len(), 1);
        assert_eq!(alerts_of_kind(&f.outbox, AlertKind::Recovered).len(), 1);
    }

    #[test]
    fn test_out_of_sync_unit_can_go_down() {
        let f = Fixture::new("2024-01-01T00:00:00");
        f.store.record_heartbeat("hive6", &f.clock.now(), SyncStatus::OutOfSync, true).unwrap();
        let mut monitor = f.monitor(90.0, 0.0);
        f.clock.advance_secs(91);
        assert_eq!(monitor.sweep().unwrap().went_down, vec!["hive6"]);
    }
}
