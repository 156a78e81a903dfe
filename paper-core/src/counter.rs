//! Model-counter (mcount) arithmetic
//!
//! The GPU model counter advances once per `spectra_per_mcnt` spectra, and the
//! pipeline only acts on counter values that fall on a 2048-mcount block
//! boundary. Every rate or delay handed to the X engines is therefore rounded
//! up to the next multiple of [`MCNT_BLOCK`].

use std::time::Duration;

/// ADC sample rate of the F engines.
pub const SAMPLES_PER_SECOND: u64 = 200_000_000;

/// FFT length, in samples.
pub const SAMPLES_PER_SPECTRUM: u64 = 2048;

/// Granularity of the downstream mcount.
pub const MCNT_BLOCK: u64 = 2048;

/// Default number of spectra per mcount for the GPU correlator.
pub const DEFAULT_SPECTRA_PER_MCNT: u32 = 8;

/// Rounds `value` up to the next multiple of [`MCNT_BLOCK`]. `None` if that
/// multiple does not fit in a `u64`.
pub fn quantize_up(value: u64) -> Option<u64> {
    value.div_ceil(MCNT_BLOCK).checked_mul(MCNT_BLOCK)
}

/// Mcounts per wall-clock second, rounded up to a multiple of 2048.
///
/// Precondition: `spectra_per_mcnt` is non-zero and a factor of 1024. Other
/// values still yield a number, it just has no physical meaning.
pub fn mcnts_per_second(spectra_per_mcnt: u32) -> u64 {
    let samples_per_mcnt = u64::from(spectra_per_mcnt) * SAMPLES_PER_SPECTRUM;
    SAMPLES_PER_SECOND.div_ceil(samples_per_mcnt * MCNT_BLOCK) * MCNT_BLOCK
}

/// Converts a delay into mcounts, rounded up to a multiple of 2048.
///
/// `None` when the delay is too long to express as a `u64` mcount.
pub fn delay_mcnts(delay: Duration, spectra_per_mcnt: u32) -> Option<u64> {
    let rate = mcnts_per_second(spectra_per_mcnt);
    let whole = delay.as_secs().checked_mul(rate)?;
    // Sub-second part in exact integer nanoseconds, rounded up.
    let frac = (u64::from(delay.subsec_nanos()) * rate).div_ceil(1_000_000_000);
    quantize_up(whole.checked_add(frac)?)
}
