//! Settings file and resolved run options
//!
//! `paper.yaml` (or `$PAPER_CONFIG`) supplies site defaults; command line
//! flags override them. The merged result is an immutable options struct
//! handed to each entry point.

use crate::barrier::BarrierPolicy;
use crate::katcp;
use crate::topology::AddressPlan;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub redis: RedisConf,
    pub katcp: KatcpConf,
    pub barrier: BarrierPolicy,
    pub addresses: AddressPlan,
    /// X engine hosts are `{xhost_prefix}1..`.
    pub xhost_prefix: String,
    pub noise_seed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConf {
    pub host: String,
    pub port: u16,
}

impl Default for RedisConf {
    fn default() -> Self {
        Self { host: "redishost".into(), port: 6379 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KatcpConf {
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for KatcpConf {
    fn default() -> Self {
        Self { port: katcp::DEFAULT_PORT, timeout_secs: 10 }
    }
}

impl KatcpConf {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis: RedisConf::default(),
            katcp: KatcpConf::default(),
            barrier: BarrierPolicy::default(),
            addresses: AddressPlan::default(),
            xhost_prefix: "px".into(),
            noise_seed: 0x1111_1111,
        }
    }
}

impl Settings {
    /// Loads `.env`, then the settings file. Missing or invalid files fall
    /// back to defaults.
    pub async fn load() -> Self {
        dotenvy::dotenv().ok();
        let path = std::env::var("PAPER_CONFIG").unwrap_or_else(|_| "paper.yaml".into());
        Self::load_from(&path).await
    }

    pub async fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        let txt = match tokio::fs::read_to_string(path).await {
            Ok(txt) => txt,
            Err(e) => {
                warn!("cannot read settings from {}: {}", path.display(), e);
                return Self::default();
            }
        };
        if txt.trim().is_empty() {
            return Self::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("invalid settings in {}: {}", path.display(), e);
            Self::default()
        })
    }
}

/// Options for `paper-ctl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlOptions {
    pub num_xhosts: u32,
    pub num_instances: u32,
    pub intcount: u64,
    pub delay: Duration,
    pub spectra_per_mcnt: u32,
    pub redis_host: String,
    pub redis_port: u16,
    pub xhost_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostSpecError {
    #[error("Cannot determine FID from '{0}'")]
    NoFid(String),
    #[error("invalid FID in '{0}'")]
    BadFid(String),
}

/// `HOST[:FID]`. Without `:FID` the host must be `pfN`, giving FID N-1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub host: String,
    pub fid: u32,
}

impl FromStr for HostSpec {
    type Err = HostSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((host, fid)) = s.split_once(':') {
            let fid = fid.parse().map_err(|_| HostSpecError::BadFid(s.to_string()))?;
            return Ok(Self { host: host.to_string(), fid });
        }
        let n: u32 = s
            .strip_prefix("pf")
            .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|d| d.parse().ok())
            .ok_or_else(|| HostSpecError::NoFid(s.to_string()))?;
        let fid = n.checked_sub(1).ok_or_else(|| HostSpecError::NoFid(s.to_string()))?;
        Ok(Self { host: s.to_string(), fid })
    }
}

/// Corner turner mode: how many F engines feed each X engine group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtMode(u32);

impl CtMode {
    pub const MAX: u32 = 3;

    pub fn new(mode: u32) -> Option<Self> {
        (mode <= Self::MAX).then_some(Self(mode))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn describe(self) -> &'static str {
        match self.0 {
            0 => "8 F engines",
            1 => "4 F engines",
            2 => "2 F engines",
            _ => "1 F engine",
        }
    }
}

impl fmt::Display for CtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.describe())
    }
}

/// F engine input selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    Adc,
    Noise,
}

impl InputSource {
    /// Two-bit selector code per input.
    pub fn code(self) -> u32 {
        match self {
            InputSource::Adc => 0,
            InputSource::Noise => 1,
        }
    }

    /// `insel_N` register value selecting this source for all 16 inputs.
    pub fn register_value(self) -> u32 {
        (0..16).fold(0, |acc, i| acc | (self.code() << (2 * i)))
    }
}

/// Equalizer gain in units of 1/128.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EqCoeff(u32);

impl EqCoeff {
    pub fn from_gain(gain: f64) -> Self {
        Self((gain * 128.0).round().max(0.0) as u32)
    }

    /// Raw fixed-point word written to the coefficient BRAMs.
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn gain(self) -> f64 {
        f64::from(self.0) / 128.0
    }
}

/// Options for `paper-feng-init`.
#[derive(Debug, Clone, PartialEq)]
pub struct FengOptions {
    pub hosts: Vec<HostSpec>,
    pub eq: EqCoeff,
    pub fft_shift: u32,
    pub ctmode: CtMode,
    pub input: InputSource,
    pub sync: bool,
    pub seed: u32,
    pub addresses: AddressPlan,
    pub barrier: BarrierPolicy,
    pub katcp: KatcpConf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_host_spec() {
        assert_eq!("pf1".parse::<HostSpec>(), Ok(HostSpec { host: "pf1".into(), fid: 0 }));
        assert_eq!("roach7:3".parse::<HostSpec>(), Ok(HostSpec { host: "roach7".into(), fid: 3 }));
        assert_eq!("roach7".parse::<HostSpec>(), Err(HostSpecError::NoFid("roach7".into())));
        assert_eq!("pf0".parse::<HostSpec>(), Err(HostSpecError::NoFid("pf0".into())));
        assert!(matches!("pf2:x".parse::<HostSpec>(), Err(HostSpecError::BadFid(_))));
    }

    #[test]
    fn test_ctmode() {
        assert_eq!(CtMode::new(2).unwrap().describe(), "2 F engines");
        assert_eq!(CtMode::new(3).unwrap().to_string(), "3 (1 F engine)");
        assert!(CtMode::new(4).is_none());
    }

    #[test]
    fn test_eq_and_insel() {
        assert_eq!(EqCoeff::from_gain(600.0).raw(), 76_800);
        assert_eq!(EqCoeff::from_gain(1.003).gain(), 1.0);
        assert_eq!(InputSource::Adc.register_value(), 0);
        assert_eq!(InputSource::Noise.register_value(), 0x5555_5555);
    }

    #[tokio::test]
    async fn test_settings_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "redis:\n  host: redis.paper\n  port: 6380\nbarrier:\n  repetitions: 3").unwrap();
        let s = Settings::load_from(file.path()).await;
        assert_eq!(s.redis.host, "redis.paper");
        assert_eq!(s.barrier.repetitions, 3);
        assert_eq!(s.xhost_prefix, "px");
    }

    #[tokio::test]
    async fn test_partial_sections_keep_other_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "katcp:\n  port: 7148\nredis:\n  host: redis.paper\nxhost_prefix: qx").unwrap();
        let s = Settings::load_from(file.path()).await;
        assert_eq!(s.katcp, KatcpConf { port: 7148, timeout_secs: 10 });
        assert_eq!(s.redis, RedisConf { host: "redis.paper".into(), port: 6379 });
        assert_eq!(s.xhost_prefix, "qx");
    }

    #[tokio::test]
    async fn test_unreadable_path_falls_back() {
        // a directory exists but cannot be read as a file
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Settings::load_from(dir.path()).await, Settings::default());
    }

    #[tokio::test]
    async fn test_settings_fallback() {
        let s = Settings::load_from("/nonexistent/paper.yaml").await;
        assert_eq!(s, Settings::default());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "redis: [not, a, map]").unwrap();
        assert_eq!(Settings::load_from(file.path()).await, Settings::default());
    }
}
