//! Device handle capabilities and the ROACH2 F engine register map
//!
//! A [`Device`] is one owned connection to one board. Nothing is shared
//! between handles; cross-device ordering is the caller's job.

use crate::topology::{ArpTable, Interface};

/// Byte offset of the MAC (two big-endian words) inside a 10 GbE core.
pub const CORE_MAC_OFFSET: u32 = 0x00;
/// Byte offset of the IP word inside a 10 GbE core.
pub const CORE_IP_OFFSET: u32 = 0x10;
/// Byte offset of the ARP table inside a 10 GbE core.
pub const CORE_ARP_OFFSET: u32 = 0x3000;

/// Register names of the roach2_fengine design.
pub mod reg {
    pub const ETH_SW_EN: &str = "eth_sw_en";
    pub const ETH_GPU_EN: &str = "eth_gpu_en";
    pub const FID: &str = "fid";
    pub const FFT_SHIFT: &str = "fft_shift";
    pub const CTMODE: &str = "ctmode";
    pub const SYNC_ARM: &str = "sync_arm";
    pub const NOISE_ARM: &str = "noise_arm";
    pub const SYNC_COUNT: &str = "sync_count";
    pub const ETH_CNT_RST: &str = "eth_cnt_rst";
    pub const ETH_GPU_RST: &str = "eth_gpu_rst";
    pub const ETH_SW_RST: &str = "eth_sw_rst";
    pub const SEEDS: [&str; 4] = ["seed_0", "seed_1", "seed_2", "seed_3"];
    pub const INSEL: [&str; 2] = ["insel_0", "insel_1"];

    /// Present only in the F engine design; used as a design fingerprint.
    pub const DESIGN_MARKER: &str = "eth_0_xip";

    pub fn eq_coeffs(block: u32) -> String {
        format!("eq_{block}_coeffs")
    }

    pub fn eth_sw(link: u32) -> String {
        format!("eth_{link}_sw")
    }

    pub fn eth_gpu(link: u32) -> String {
        format!("eth_{link}_gpu")
    }

    pub fn eth_xip(link: u32) -> String {
        format!("eth_{link}_xip")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("{host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },
    #[error("{host} rejected {request}: {reply}")]
    Rejected { host: String, request: String, reply: String },
    #[error("{host} sent malformed reply to {request}: {reply}")]
    Malformed { host: String, request: String, reply: String },
}

/// Register-level access to one FPGA board.
#[allow(async_fn_in_trait)]
pub trait Device {
    fn host(&self) -> &str;

    /// Whether the FPGA is programmed and running.
    async fn is_programmed(&mut self) -> Result<bool, DeviceError>;

    async fn list_features(&mut self) -> Result<Vec<String>, DeviceError>;

    async fn read_register(&mut self, name: &str) -> Result<u32, DeviceError>;

    async fn write_register(&mut self, name: &str, value: u32) -> Result<(), DeviceError>;

    async fn write_block(&mut self, name: &str, offset: u32, data: &[u8]) -> Result<(), DeviceError>;
}

/// Big-endian image of a word array.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Writes IP and MAC into a 10 GbE core.
pub async fn configure_core<D: Device>(dev: &mut D, core: &str, iface: &Interface) -> Result<(), DeviceError> {
    dev.write_block(core, CORE_MAC_OFFSET, &words_to_bytes(&iface.mac.to_words())).await?;
    dev.write_block(core, CORE_IP_OFFSET, &u32::from(iface.ip).to_be_bytes()).await
}

pub async fn write_arp_table<D: Device>(dev: &mut D, core: &str, table: &ArpTable) -> Result<(), DeviceError> {
    dev.write_block(core, CORE_ARP_OFFSET, &table.to_bytes()).await
}
