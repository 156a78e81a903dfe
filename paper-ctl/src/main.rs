//! paper-ctl - start and stop PAPER correlator integrations
//!
//! Reads GPUMCNT/INTSTAT from every X engine instance's hashpipe status and
//! broadcasts the start or stop command on the hashpipe set channel.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paper_core::counter::DEFAULT_SPECTRA_PER_MCNT;
use paper_core::store::instance_keys;
use paper_core::{Coordinator, CtlOptions, RedisStore, Settings, StartError, StartOptions, StopError};
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(version, about = "Start and stop PAPER correlator integrations")]
struct Cli {
    /// Delay before starting, in seconds
    #[arg(short, long, default_value_t = 10)]
    delay: u64,

    /// GPU blocks per integration
    #[arg(short = 'n', long, default_value_t = 2048)]
    intcount: u64,

    /// Number of instances per X host
    #[arg(short = 'i', long, default_value_t = 4)]
    numinst: u32,

    /// Number of X hosts
    #[arg(short = 'x', long, default_value_t = 8)]
    numxhost: u32,

    /// Host running redis-server [settings: redis.host]
    #[arg(short, long)]
    server: Option<String>,

    /// Spectra per GPU mcount (must divide 1024)
    #[arg(long, default_value_t = DEFAULT_SPECTRA_PER_MCNT, value_parser = parse_spectra_per_mcnt)]
    spectra_per_mcnt: u32,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Start integrations at a common future mcount
    Start,
    /// Stop integrations
    Stop,
    /// Connect to the store and exit
    Test,
}

fn parse_spectra_per_mcnt(s: &str) -> Result<u32, String> {
    let n: u32 = s.parse().map_err(|e| format!("{e}"))?;
    if n == 0 || 1024 % n != 0 {
        return Err(format!("{n} is not a factor of 1024"));
    }
    Ok(n)
}

impl Cli {
    fn options(&self, settings: &Settings) -> CtlOptions {
        CtlOptions {
            num_xhosts: self.numxhost,
            num_instances: self.numinst,
            intcount: self.intcount,
            delay: Duration::from_secs(self.delay),
            spectra_per_mcnt: self.spectra_per_mcnt,
            redis_host: self.server.clone().unwrap_or_else(|| settings.redis.host.clone()),
            redis_port: settings.redis.port,
            xhost_prefix: settings.xhost_prefix.clone(),
        }
    }
}

async fn run(cmd: Command, opts: &CtlOptions) -> Result<()> {
    let keys = instance_keys(&opts.xhost_prefix, opts.num_xhosts, opts.num_instances);
    let store = RedisStore::connect(&opts.redis_host, opts.redis_port)
        .await
        .with_context(|| format!("failed to connect to redis on {}", opts.redis_host))?;
    let coord = Coordinator::new(&store, keys);

    match cmd {
        Command::Start => {
            let start = StartOptions {
                delay: opts.delay,
                integration_length: opts.intcount,
                spectra_per_mcnt: opts.spectra_per_mcnt,
            };
            match coord.start(&start).await {
                Ok(_) => {}
                Err(e @ StartError::NoInstancesReporting) => error!("{}", e),
                Err(e) => return Err(e).context("start failed"),
            }
        }
        Command::Stop => match coord.stop().await {
            Ok(_) => {}
            Err(e @ StopError::NothingToStop) => error!("{}", e),
            Err(e) => return Err(e).context("stop failed"),
        },
        Command::Test => info!("{} status keys, store reachable", coord.keys().len()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    // clap exits non-zero with usage on missing or unknown subcommands
    let cli = Cli::parse();
    let settings = Settings::load().await;
    let opts = cli.options(&settings);

    run(cli.cmd, &opts).await
}
