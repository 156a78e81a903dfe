/*!
Test harness for the control tools

Builds a small F engine array (`pf1..pfN`) of mock boards sharing one
journal, a mock store, a resolver that knows every `pxF-L` peer, and run
options with a short edge timeout and no settle wait.
*/

use crate::device_stub::{Journal, MockDevice};
use crate::store_stub::MockStore;
use paper_core::barrier::{BarrierPolicy, Clock};
use paper_core::config::{CtMode, EqCoeff, FengOptions, HostSpec, InputSource, KatcpConf, Settings};
use paper_core::fengine::{IdentityError, Resolver};
use paper_core::topology::{peer_hostname, LINKS_PER_NODE};
use paper_core::DeviceError;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Resolves names from a fixed table.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    names: HashMap<String, Ipv4Addr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every X engine peer of FIDs `0..num_fids`, as `10.0.{fid}.{link}`.
    pub fn for_array(num_fids: u32) -> Self {
        let mut r = Self::new();
        for fid in 0..num_fids {
            for link in 0..LINKS_PER_NODE {
                r.insert(&peer_hostname(fid, link), Ipv4Addr::new(10, 0, fid as u8, link as u8));
            }
        }
        r
    }

    pub fn insert(&mut self, name: &str, ip: Ipv4Addr) {
        self.names.insert(name.to_string(), ip);
    }

    pub fn remove(&mut self, name: &str) {
        self.names.remove(name);
    }
}

impl Resolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<Ipv4Addr, IdentityError> {
        self.names.get(name).copied().ok_or_else(|| IdentityError::Unresolvable {
            name: name.to_string(),
            reason: "unknown host".into(),
        })
    }
}

pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_unix(&self) -> i64 {
        self.0
    }
}

pub struct TestHarness {
    pub journal: Journal,
    pub store: MockStore,
    pub resolver: StaticResolver,
    pub clock: FixedClock,
    pub devices: Vec<(HostSpec, Result<MockDevice, DeviceError>)>,
}

impl TestHarness {
    /// `num_engines` healthy boards `pf1..`, FIDs `0..`.
    pub fn new(num_engines: u32) -> Self {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();

        let journal = Journal::new();
        let devices = (0..num_engines)
            .map(|fid| {
                let host = format!("pf{}", fid + 1);
                let dev = MockDevice::new(host.clone(), &journal);
                (HostSpec { host, fid }, Ok(dev))
            })
            .collect();
        Self {
            journal,
            store: MockStore::new(),
            resolver: StaticResolver::for_array(num_engines),
            clock: FixedClock(1_700_000_000),
            devices,
        }
    }

    /// Replaces the board at `index`, keeping its host and FID.
    pub fn replace(&mut self, index: usize, f: impl FnOnce(MockDevice) -> MockDevice) {
        let (spec, _) = &self.devices[index];
        let dev = MockDevice::new(spec.host.clone(), &self.journal);
        self.devices[index].1 = Ok(f(dev));
    }

    /// Marks the board at `index` as never connected.
    pub fn disconnect(&mut self, index: usize) {
        let host = self.devices[index].0.host.clone();
        self.devices[index].1 = Err(DeviceError::Unreachable { host, reason: "connection refused".into() });
    }

    pub fn take_devices(&mut self) -> Vec<(HostSpec, Result<MockDevice, DeviceError>)> {
        std::mem::take(&mut self.devices)
    }

    pub fn options(&self) -> FengOptions {
        let settings = Settings::default();
        FengOptions {
            hosts: self.devices.iter().map(|(spec, _)| spec.clone()).collect(),
            eq: EqCoeff::from_gain(600.0),
            fft_shift: (1 << 11) - 1,
            ctmode: CtMode::new(0).expect("ctmode 0"),
            input: InputSource::Adc,
            sync: true,
            seed: settings.noise_seed,
            addresses: settings.addresses,
            barrier: BarrierPolicy {
                edge_timeout: Duration::from_millis(200),
                repetitions: 2,
                settle: Duration::ZERO,
            },
            katcp: KatcpConf { port: 7147, timeout_secs: 1 },
        }
    }
}
