//! Start/stop coordination of the X engine integrations
//!
//! Start picks a future mcount all instances can still reach (the largest
//! reported GPUMCNT plus a block-aligned delay) and broadcasts it once.
//! Stop is an unsynchronized broadcast. Neither waits for acknowledgement.

use crate::counter::delay_mcnts;
use crate::store::{parse_int, query_status, InstanceKey, StateStore, StatusSnapshot, StoreError, BCAST_SET_CHANNEL};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Status field holding an instance's current GPU mcount.
pub const MCNT_FIELD: &str = "GPUMCNT";

/// Status field holding an instance's integration state.
pub const INTSTAT_FIELD: &str = "INTSTAT";

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("no GPUMCNT values found, cannot start")]
    NoInstancesReporting,
    #[error("sync mcount out of range (max GPUMCNT {max}, delay {delay:?})")]
    DelayOutOfRange { max: u64, delay: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("no active INTSTAT values found, nothing to stop")]
    NothingToStop,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reporting vs queried instances. Less than full coverage is only a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coverage {
    pub expected: usize,
    pub reporting: usize,
}

impl Coverage {
    pub fn missing(&self) -> usize {
        self.expected.saturating_sub(self.reporting)
    }

    /// `Some(missing count)` when at least one instance did not report.
    pub fn partial(&self) -> Option<usize> {
        (self.missing() > 0).then(|| self.missing())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOptions {
    pub delay: Duration,
    pub integration_length: u64,
    pub spectra_per_mcnt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub min_observed: u64,
    pub max_observed: u64,
    pub counter_delay: u64,
    pub sync_counter: u64,
    pub integration_length: u64,
    pub output_dump_count: u64,
    pub coverage: Coverage,
}

impl SyncPlan {
    /// Broadcast payload for the start command.
    pub fn start_message(&self) -> String {
        format!(
            "INTSYNC={}\nINTCOUNT={}\nINTSTAT=start\nOUTDUMPS={}",
            self.sync_counter, self.integration_length, self.output_dump_count
        )
    }
}

impl fmt::Display for SyncPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Min GPUMCNT is {}", self.min_observed)?;
        writeln!(f, "Max GPUMCNT is {}  (range {})", self.max_observed, self.max_observed - self.min_observed)?;
        writeln!(f, "Delay  MCNT is {}", self.counter_delay)?;
        write!(f, "Sync   MCNT is {}", self.sync_counter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopPlan {
    pub active: usize,
    pub coverage: Coverage,
}

impl StopPlan {
    pub fn stop_message(&self) -> &'static str {
        "INTSTAT=stop"
    }
}

/// Computes the sync mcount from a GPUMCNT snapshot.
pub fn plan_start(snapshot: &StatusSnapshot, opts: &StartOptions) -> Result<SyncPlan, StartError> {
    let mcnts: Vec<u64> = snapshot.reported().filter_map(|(_, v)| parse_int(v)).collect();
    let (Some(&min), Some(&max)) = (mcnts.iter().min(), mcnts.iter().max()) else {
        return Err(StartError::NoInstancesReporting);
    };

    let out_of_range = || StartError::DelayOutOfRange { max, delay: opts.delay };
    let counter_delay = delay_mcnts(opts.delay, opts.spectra_per_mcnt).ok_or_else(out_of_range)?;
    let sync_counter = max.checked_add(counter_delay).ok_or_else(out_of_range)?;
    Ok(SyncPlan {
        min_observed: min,
        max_observed: max,
        counter_delay,
        sync_counter,
        integration_length: opts.integration_length,
        output_dump_count: 0,
        coverage: Coverage { expected: snapshot.expected(), reporting: mcnts.len() },
    })
}

/// `off` and `stop` mean the instance is not integrating.
fn is_active(intstat: &str) -> bool {
    let s = intstat.trim();
    !(s.is_empty() || s.eq_ignore_ascii_case("off") || s.eq_ignore_ascii_case("stop"))
}

pub fn plan_stop(snapshot: &StatusSnapshot) -> Result<StopPlan, StopError> {
    let reporting = snapshot.reported().count();
    let active = snapshot.reported().filter(|(_, v)| is_active(v)).count();
    if active == 0 {
        return Err(StopError::NothingToStop);
    }
    Ok(StopPlan {
        active,
        coverage: Coverage { expected: snapshot.expected(), reporting },
    })
}

/// Drives start/stop against a live store for a fixed instance set.
pub struct Coordinator<'a, S> {
    store: &'a S,
    keys: Vec<InstanceKey>,
}

impl<'a, S: StateStore> Coordinator<'a, S> {
    pub fn new(store: &'a S, keys: Vec<InstanceKey>) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &[InstanceKey] {
        &self.keys
    }

    /// Fire-and-forget publish of the start command.
    pub async fn broadcast_start(&self, plan: &SyncPlan) -> Result<(), StoreError> {
        self.store.publish(BCAST_SET_CHANNEL, &plan.start_message()).await
    }

    pub async fn start(&self, opts: &StartOptions) -> Result<SyncPlan, StartError> {
        let snapshot = query_status(self.store, &self.keys, MCNT_FIELD).await?;
        let plan = plan_start(&snapshot, opts)?;
        if let Some(missing) = plan.coverage.partial() {
            warn!("missing {} for {} X engine instances", MCNT_FIELD, missing);
        }
        for line in plan.to_string().lines() {
            info!("{}", line);
        }
        self.broadcast_start(&plan).await?;
        Ok(plan)
    }

    pub async fn stop(&self) -> Result<StopPlan, StopError> {
        let snapshot = query_status(self.store, &self.keys, INTSTAT_FIELD).await?;
        let plan = plan_stop(&snapshot)?;
        if let Some(missing) = plan.coverage.partial() {
            warn!("missing {} for {} X engine instances", INTSTAT_FIELD, missing);
        }
        self.store.publish(BCAST_SET_CHANNEL, plan.stop_message()).await?;
        info!("stop sent to {} active instances", plan.active);
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> StartOptions {
        StartOptions { delay: Duration::from_secs(10), integration_length: 2048, spectra_per_mcnt: 8 }
    }

    #[test]
    fn test_plan_start_partial() {
        let snap = StatusSnapshot::new(MCNT_FIELD)
            .with(InstanceKey::new("A", 0), Some("1000"))
            .with(InstanceKey::new("B", 0), Some("1200"))
            .with(InstanceKey::new("C", 0), None);
        let plan = plan_start(&snap, &opts()).unwrap();
        assert_eq!(plan.min_observed, 1000);
        assert_eq!(plan.max_observed, 1200);
        assert_eq!(Some(plan.counter_delay), delay_mcnts(Duration::from_secs(10), 8));
        assert_eq!(plan.sync_counter, 1200 + 122_880);
        assert_eq!(plan.coverage.partial(), Some(1));
    }

    #[test]
    fn test_plan_start_empty() {
        let snap = StatusSnapshot::new(MCNT_FIELD).with(InstanceKey::new("A", 0), None);
        assert!(matches!(plan_start(&snap, &opts()), Err(StartError::NoInstancesReporting)));
        assert!(matches!(
            plan_start(&StatusSnapshot::new(MCNT_FIELD), &opts()),
            Err(StartError::NoInstancesReporting)
        ));
    }

    #[test]
    fn test_plan_start_full_coverage_hex() {
        let snap = StatusSnapshot::new(MCNT_FIELD)
            .with(InstanceKey::new("A", 0), Some("0x800"))
            .with(InstanceKey::new("A", 1), Some("4096"));
        let plan = plan_start(&snap, &opts()).unwrap();
        assert_eq!(plan.min_observed, 2048);
        assert_eq!(plan.coverage.partial(), None);
    }

    #[test]
    fn test_plan_start_out_of_range() {
        let snap = StatusSnapshot::new(MCNT_FIELD).with(InstanceKey::new("A", 0), Some("0xffffffffffffffff"));
        assert!(matches!(
            plan_start(&snap, &opts()),
            Err(StartError::DelayOutOfRange { max: u64::MAX, .. })
        ));

        let snap = StatusSnapshot::new(MCNT_FIELD).with(InstanceKey::new("A", 0), Some("1000"));
        let long = StartOptions { delay: Duration::from_secs(u64::MAX / 1000), ..opts() };
        assert!(matches!(plan_start(&snap, &long), Err(StartError::DelayOutOfRange { .. })));
    }

    #[test]
    fn test_start_message() {
        let snap = StatusSnapshot::new(MCNT_FIELD).with(InstanceKey::new("A", 0), Some("100"));
        let plan = plan_start(&snap, &opts()).unwrap();
        assert_eq!(plan.start_message(), "INTSYNC=122980\nINTCOUNT=2048\nINTSTAT=start\nOUTDUMPS=0");
    }

    #[test]
    fn test_plan_stop() {
        let snap = StatusSnapshot::new(INTSTAT_FIELD)
            .with(InstanceKey::new("A", 0), Some("on"))
            .with(InstanceKey::new("A", 1), Some("off"))
            .with(InstanceKey::new("A", 2), None);
        let plan = plan_stop(&snap).unwrap();
        assert_eq!(plan.active, 1);
        assert_eq!(plan.coverage, Coverage { expected: 3, reporting: 2 });
        assert_eq!(plan.stop_message(), "INTSTAT=stop");

        let idle = StatusSnapshot::new(INTSTAT_FIELD).with(InstanceKey::new("A", 0), Some("off"));
        assert!(matches!(plan_stop(&idle), Err(StopError::NothingToStop)));
    }
}
