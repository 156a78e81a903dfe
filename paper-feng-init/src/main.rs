//! paper-feng-init - initialize 32-input ROACH2 F engines
//!
//! Connects to every named board over KATCP, pushes the per-engine
//! configuration and optionally arms the array-wide sync and noise
//! generators.

use anyhow::{Context, Result};
use clap::Parser;
use paper_core::config::{CtMode, EqCoeff, FengOptions, HostSpec, InputSource};
use paper_core::katcp::KatcpDevice;
use paper_core::{configure, DnsResolver, RedisStore, Settings, SystemClock};
use tracing::{info, Level};

#[derive(Parser)]
#[command(version, about = "Initialize 32-input ROACH2 F engines")]
struct Cli {
    /// Boards to initialize, as HOST[:FID]. FID defaults to N-1 for pfN.
    #[arg(required = true, value_name = "HOST[:FID]")]
    hosts: Vec<HostSpec>,

    /// Equalizer gain
    #[arg(short, long, default_value_t = 600.0)]
    eq: f64,

    /// FFT shift schedule
    #[arg(short, long, default_value_t = 2047)]
    fftshift: u32,

    /// Corner turner mode (0-3)
    #[arg(short, long, default_value = "0", value_parser = parse_ctmode)]
    mode: CtMode,

    /// Host running redis-server [settings: redis.host]
    #[arg(short, long)]
    redishost: Option<String>,

    /// Skip sync and noise arming
    #[arg(short = 's', long)]
    no_sync: bool,

    /// Use the noise generators instead of the ADCs
    #[arg(short, long)]
    noise: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Noise generator seed [settings: noise_seed]
    #[arg(long, value_parser = parse_seed)]
    seed: Option<u32>,
}

fn parse_ctmode(s: &str) -> Result<CtMode, String> {
    let mode: u32 = s.parse().map_err(|e| format!("{e}"))?;
    CtMode::new(mode).ok_or_else(|| format!("mode must be 0..={}", CtMode::MAX))
}

fn parse_seed(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{e}"))
}

impl Cli {
    fn options(&self, settings: &Settings) -> FengOptions {
        FengOptions {
            hosts: self.hosts.clone(),
            eq: EqCoeff::from_gain(self.eq),
            fft_shift: self.fftshift,
            ctmode: self.mode,
            input: if self.noise { InputSource::Noise } else { InputSource::Adc },
            sync: !self.no_sync,
            seed: self.seed.unwrap_or(settings.noise_seed),
            addresses: settings.addresses.clone(),
            barrier: settings.barrier.clone(),
            katcp: settings.katcp.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // exits 1 with usage on a bad HOST[:FID] or mode
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    let settings = Settings::load().await;
    let opts = cli.options(&settings);
    info!("corner turner mode {}", opts.ctmode);

    let mut connections = Vec::with_capacity(opts.hosts.len());
    for spec in &opts.hosts {
        info!("connecting to {}", spec.host);
        let conn = KatcpDevice::connect(&spec.host, opts.katcp.port, opts.katcp.timeout()).await;
        connections.push((spec.clone(), conn));
    }

    let store = if opts.sync {
        let host = cli.redishost.as_deref().unwrap_or(&settings.redis.host);
        let store = RedisStore::connect(host, settings.redis.port)
            .await
            .with_context(|| format!("failed to connect to redis on {host}"))?;
        Some(store)
    } else {
        None
    };

    let report = configure(connections, store.as_ref(), &DnsResolver, &SystemClock, &opts)
        .await
        .context("F engine initialization aborted")?;
    report.log_summary();
    info!("all done");
    Ok(())
}
