/*!
# PAPER DevKit - stubs and helpers for testing without hardware

- In-memory hashpipe status store (`MockStore`)
- Scriptable F engine boards sharing one operation journal (`MockDevice`)
- Static name resolution and a fixed clock
- `TestHarness` wiring a small array together
*/

pub mod device_stub;
pub mod store_stub;
pub mod test_utils;

pub use device_stub::{Journal, MockDevice, Op};
pub use store_stub::{MockMessage, MockStore};
pub use test_utils::{FixedClock, StaticResolver, TestHarness};
