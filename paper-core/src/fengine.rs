//! F engine configuration driver
//!
//! Every step runs on all remaining engines before the next step starts.
//! Engines that fail pre-flight or a later per-engine step are dropped from
//! the rest of the run and listed in the report. Only the arming barrier can
//! abort the whole run.

use crate::barrier::{arm_noise, arm_sync, BarrierError, Clock};
use crate::config::{FengOptions, HostSpec};
use crate::device::{configure_core, reg, words_to_bytes, write_arp_table, Device, DeviceError};
use crate::store::StateStore;
use crate::topology::{AddressPlan, ArpTable};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info, warn};

/// Coefficient BRAMs per engine.
pub const EQ_BLOCKS: u32 = 16;
/// Words per coefficient BRAM.
pub const EQ_WORDS: usize = 2048;

/// Reset pulse applied to counters and both network cores.
const RESET_SEQUENCE: [u32; 3] = [0, 1, 0];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreflightError {
    #[error(transparent)]
    Unreachable(DeviceError),
    #[error("{0} is not programmed")]
    NotReady(String),
    #[error("{0} is not programmed with an roach2_fengine design")]
    DesignMismatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("cannot resolve {name}: {reason}")]
    Unresolvable { name: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
enum LinkError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigureError {
    #[error("sync requested but no state store available")]
    MissingStore,
    #[error("arming failed, restart configuration: {0}")]
    Barrier(#[from] BarrierError),
}

/// Name resolution for X engine peer hosts.
#[allow(async_fn_in_trait)]
pub trait Resolver {
    async fn resolve(&self, name: &str) -> Result<Ipv4Addr, IdentityError>;
}

/// System resolver via `getaddrinfo`.
pub struct DnsResolver;

impl Resolver for DnsResolver {
    async fn resolve(&self, name: &str) -> Result<Ipv4Addr, IdentityError> {
        let unresolvable = |reason: String| IdentityError::Unresolvable { name: name.to_string(), reason };
        let addrs = tokio::net::lookup_host((name, 0)).await.map_err(|e| unresolvable(e.to_string()))?;
        addrs
            .filter_map(|a| match a.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| unresolvable("no IPv4 address".into()))
    }
}

/// A device handle with its function ID.
pub struct FEngine<D> {
    pub device: D,
    pub fid: u32,
}

impl<D: Device> Device for FEngine<D> {
    fn host(&self) -> &str {
        self.device.host()
    }

    async fn is_programmed(&mut self) -> Result<bool, DeviceError> {
        self.device.is_programmed().await
    }

    async fn list_features(&mut self) -> Result<Vec<String>, DeviceError> {
        self.device.list_features().await
    }

    async fn read_register(&mut self, name: &str) -> Result<u32, DeviceError> {
        self.device.read_register(name).await
    }

    async fn write_register(&mut self, name: &str, value: u32) -> Result<(), DeviceError> {
        self.device.write_register(name, value).await
    }

    async fn write_block(&mut self, name: &str, offset: u32, data: &[u8]) -> Result<(), DeviceError> {
        self.device.write_block(name, offset, data).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Excluded {
    pub host: String,
    pub step: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigureReport {
    pub configured: Vec<(String, u32)>,
    pub excluded: Vec<Excluded>,
    pub sync_time: Option<i64>,
}

impl ConfigureReport {
    pub fn log_summary(&self) {
        info!("{} F engine(s) configured, {} excluded", self.configured.len(), self.excluded.len());
        for ex in &self.excluded {
            warn!("  excluded {} at {}: {}", ex.host, ex.step, ex.reason);
        }
    }
}

/// Checks that the board is programmed with the F engine design.
pub async fn preflight<D: Device>(dev: &mut D) -> Result<(), PreflightError> {
    if !dev.is_programmed().await.map_err(PreflightError::Unreachable)? {
        return Err(PreflightError::NotReady(dev.host().to_string()));
    }
    let features = dev.list_features().await.map_err(PreflightError::Unreachable)?;
    if !features.iter().any(|f| f == reg::DESIGN_MARKER) {
        return Err(PreflightError::DesignMismatch(dev.host().to_string()));
    }
    Ok(())
}

/// Runs `$body` (a future yielding `Result`) for every engine and drops the
/// ones that fail.
macro_rules! each_engine {
    ($self:ident, $step:expr, |$fe:ident| $body:expr) => {{
        let mut failed = Vec::new();
        for (i, $fe) in $self.engines.iter_mut().enumerate() {
            if let Err(e) = $body.await {
                failed.push((i, e.to_string()));
            }
        }
        $self.exclude($step, failed);
    }};
}

struct Driver<D> {
    engines: Vec<FEngine<D>>,
    excluded: Vec<Excluded>,
}

impl<D: Device> Driver<D> {
    fn exclude(&mut self, step: &'static str, failed: Vec<(usize, String)>) {
        let mut dropped = Vec::with_capacity(failed.len());
        for (i, reason) in failed.into_iter().rev() {
            let fe = self.engines.remove(i);
            warn!("{} failed {}: {}", fe.host(), step, reason);
            dropped.push(Excluded { host: fe.host().to_string(), step, reason });
        }
        self.excluded.extend(dropped.into_iter().rev());
    }
}

async fn disable_tx<D: Device>(fe: &mut FEngine<D>) -> Result<(), DeviceError> {
    debug!("  disabling {} network transmission", fe.host());
    fe.write_register(reg::ETH_SW_EN, 0).await?;
    fe.write_register(reg::ETH_GPU_EN, 0).await
}

async fn write_eq<D: Device>(fe: &mut FEngine<D>, image: &[u8]) -> Result<(), DeviceError> {
    for block in 0..EQ_BLOCKS {
        fe.write_block(&reg::eq_coeffs(block), 0, image).await?;
    }
    Ok(())
}

async fn configure_links<D: Device, R: Resolver>(
    fe: &mut FEngine<D>,
    plan: &AddressPlan,
    arp: &ArpTable,
    resolver: &R,
) -> Result<(), LinkError> {
    let identity = plan.node_identity(fe.fid);
    for link in &identity.links {
        let sw = reg::eth_sw(link.link);
        debug!("  configuring {}:{} IP {} MAC {}", fe.host(), sw, link.switch.ip, link.switch.mac);
        configure_core(fe, &sw, &link.switch).await?;
        write_arp_table(fe, &sw, arp).await?;
    }
    for link in &identity.links {
        let gpu = reg::eth_gpu(link.link);
        debug!("  configuring {}:{} IP {} MAC {}", fe.host(), gpu, link.cluster.ip, link.cluster.mac);
        configure_core(fe, &gpu, &link.cluster).await?;
        let xip = resolver.resolve(&link.peer_hostname).await?;
        debug!("    XIP {} ({})", xip, link.peer_hostname);
        fe.write_register(&reg::eth_xip(link.link), u32::from(xip)).await?;
    }
    Ok(())
}

async fn select_input<D: Device>(fe: &mut FEngine<D>, value: u32) -> Result<(), DeviceError> {
    for register in reg::INSEL {
        fe.write_register(register, value).await?;
    }
    Ok(())
}

async fn reset_network<D: Device>(fe: &mut FEngine<D>) -> Result<(), DeviceError> {
    debug!("  resetting {} network interfaces", fe.host());
    for v in RESET_SEQUENCE {
        fe.write_register(reg::ETH_CNT_RST, v).await?;
        fe.write_register(reg::ETH_GPU_RST, v).await?;
        fe.write_register(reg::ETH_SW_RST, v).await?;
    }
    Ok(())
}

/// Configures every reachable engine.
///
/// `connections` pairs each requested host with the outcome of opening its
/// handle. `store` is only used when `opts.sync` is set.
pub async fn configure<D, S, R, C>(
    connections: Vec<(HostSpec, Result<D, DeviceError>)>,
    store: Option<&S>,
    resolver: &R,
    clock: &C,
    opts: &FengOptions,
) -> Result<ConfigureReport, ConfigureError>
where
    D: Device,
    S: StateStore,
    R: Resolver,
    C: Clock,
{
    // Refuse before any board is touched.
    let store = match (opts.sync, store) {
        (true, None) => return Err(ConfigureError::MissingStore),
        (true, Some(_)) if opts.barrier.repetitions == 0 => return Err(BarrierError::NoRepetitions.into()),
        (_, store) => store,
    };

    let mut drv = Driver { engines: Vec::new(), excluded: Vec::new() };

    for (spec, conn) in connections {
        let checked = match conn {
            Ok(mut device) => preflight(&mut device).await.map(|()| device),
            Err(e) => Err(PreflightError::Unreachable(e)),
        };
        match checked {
            Ok(device) => {
                info!("initializing {} as FID {}", spec.host, spec.fid);
                drv.engines.push(FEngine { device, fid: spec.fid });
            }
            Err(e) => {
                warn!("error: {}", e);
                drv.excluded.push(Excluded { host: spec.host, step: "preflight", reason: e.to_string() });
            }
        }
    }

    info!("disabling network transmission");
    each_engine!(drv, "disable transmission", |fe| disable_tx(fe));

    info!("setting FIDs");
    each_engine!(drv, "fid", |fe| fe.write_register(reg::FID, fe.fid));

    info!("setting fftshift to {}", opts.fft_shift);
    each_engine!(drv, "fft_shift", |fe| fe.write_register(reg::FFT_SHIFT, opts.fft_shift));

    info!("setting eq to {}", opts.eq.gain());
    let eq_image = words_to_bytes(&[opts.eq.raw(); EQ_WORDS]);
    each_engine!(drv, "eq", |fe| write_eq(fe, &eq_image));

    info!("configuring 10 GbE interfaces");
    let arp = opts.addresses.switch_arp_table();
    each_engine!(drv, "10 GbE", |fe| configure_links(fe, &opts.addresses, &arp, resolver));

    info!("setting corner turner mode {}", opts.ctmode);
    each_engine!(drv, "ctmode", |fe| fe.write_register(reg::CTMODE, opts.ctmode.value()));

    let mut sync_time = None;
    if let Some(store) = store.filter(|_| opts.sync) {
        if drv.engines.is_empty() {
            warn!("no F engines left to arm");
        } else {
            sync_time = Some(arm_sync(&mut drv.engines, store, clock, &opts.barrier).await?);
            arm_noise(&mut drv.engines, opts.seed, &opts.barrier).await?;
        }
    }

    info!("setting F engine inputs to {:?}", opts.input);
    let insel = opts.input.register_value();
    each_engine!(drv, "input select", |fe| select_input(fe, insel));

    info!("resetting network interfaces");
    each_engine!(drv, "reset", |fe| reset_network(fe));

    info!("enable transmission to X engines");
    each_engine!(drv, "enable X engine transmission", |fe| fe.write_register(reg::ETH_GPU_EN, 1));

    info!("enable transmission to switch");
    each_engine!(drv, "enable switch transmission", |fe| fe.write_register(reg::ETH_SW_EN, 1));

    Ok(ConfigureReport {
        configured: drv.engines.iter().map(|fe| (fe.host().to_string(), fe.fid)).collect(),
        excluded: drv.excluded,
        sync_time,
    })
}
