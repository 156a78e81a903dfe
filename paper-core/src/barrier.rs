//! Synchronized arming of the sync and noise generators
//!
//! The 1 PPS input is not locked to real time, so instead of sleeping to the
//! top of a second we spin on the first board's `sync_count` until it ticks,
//! then pulse the arm register on every board (all `1`s, then all `0`s).
//! The sync arm runs twice: a single arm has been seen to leave a subset of
//! boards one packet out of step with the rest.
//!
//! Any device error here aborts the run. A partially armed array has no
//! defined relative phase.

use crate::device::{reg, Device, DeviceError};
use crate::store::{record_sync_time, StateStore, StoreError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    #[error("no {register} edge on {host} within {waited:?}")]
    Timeout { host: String, register: &'static str, waited: Duration },
    #[error("no devices to arm")]
    NoDevices,
    #[error("sync arm repetitions must be at least 1")]
    NoRepetitions,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("failed to store sync time: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierPolicy {
    /// Upper bound on one edge wait.
    #[serde(with = "secs_f64")]
    pub edge_timeout: Duration,
    /// Sync arm repetitions.
    pub repetitions: u32,
    /// Wait after each arm for the sync pulse to go out.
    #[serde(with = "secs_f64")]
    pub settle: Duration,
}

impl Default for BarrierPolicy {
    fn default() -> Self {
        Self { edge_timeout: Duration::from_secs(5), repetitions: 2, settle: Duration::from_secs(1) }
    }
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Wall-clock source for the recorded sync time.
pub trait Clock {
    fn now_unix(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }
}

/// Spins on `sync_count` until it changes. Returns the new value.
pub async fn wait_edge<D: Device>(reference: &mut D, timeout: Duration) -> Result<u32, BarrierError> {
    let start = Instant::now();
    let initial = reference.read_register(reg::SYNC_COUNT).await?;
    let mut polls = 0u64;
    loop {
        let value = reference.read_register(reg::SYNC_COUNT).await?;
        polls += 1;
        if value != initial {
            debug!("{} sync_count {} -> {} after {} polls", reference.host(), initial, value, polls);
            return Ok(value);
        }
        if start.elapsed() >= timeout {
            return Err(BarrierError::Timeout {
                host: reference.host().to_string(),
                register: reg::SYNC_COUNT,
                waited: start.elapsed(),
            });
        }
    }
}

/// Drives `register` high on every device, then low on every device.
pub async fn pulse_all<D: Device>(devices: &mut [D], register: &str) -> Result<(), DeviceError> {
    for dev in devices.iter_mut() {
        dev.write_register(register, 1).await?;
    }
    for dev in devices.iter_mut() {
        dev.write_register(register, 0).await?;
    }
    Ok(())
}

async fn write_all<D: Device>(devices: &mut [D], register: &str, value: u32) -> Result<(), DeviceError> {
    for dev in devices.iter_mut() {
        dev.write_register(register, value).await?;
    }
    Ok(())
}

/// Arms the sync generators and records the resulting sync time.
///
/// The first device is the edge reference. Returns the Unix time of the
/// last sync pulse.
pub async fn arm_sync<D, S, C>(
    devices: &mut [D],
    store: &S,
    clock: &C,
    policy: &BarrierPolicy,
) -> Result<i64, BarrierError>
where
    D: Device,
    S: StateStore,
    C: Clock,
{
    if devices.is_empty() {
        return Err(BarrierError::NoDevices);
    }
    if policy.repetitions == 0 {
        return Err(BarrierError::NoRepetitions);
    }

    let mut sync_time = 0;
    for attempt in 1..=policy.repetitions {
        info!("arming sync generator(s) ({}/{})", attempt, policy.repetitions);
        write_all(devices, reg::SYNC_ARM, 0).await?;
        wait_edge(&mut devices[0], policy.edge_timeout).await?;
        pulse_all(devices, reg::SYNC_ARM).await?;
        sync_time = clock.now_unix() + 1;
        tokio::time::sleep(policy.settle).await;
    }

    info!("storing sync time {}", sync_time);
    record_sync_time(store, sync_time).await?;
    Ok(sync_time)
}

/// Seeds and arms the digital noise generators on the next edge.
pub async fn arm_noise<D: Device>(devices: &mut [D], seed: u32, policy: &BarrierPolicy) -> Result<(), BarrierError> {
    if devices.is_empty() {
        return Err(BarrierError::NoDevices);
    }

    info!("seeding noise generators");
    for register in reg::SEEDS {
        write_all(devices, register, seed).await?;
    }

    info!("arming noise generator(s)");
    wait_edge(&mut devices[0], policy.edge_timeout).await?;
    pulse_all(devices, reg::NOISE_ARM).await?;
    Ok(())
}
