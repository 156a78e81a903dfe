/*!
# PAPER Core - synchronization and network setup for the correlator

Shared by the `paper-ctl` and `paper-feng-init` tools:
- `counter`  : mcount rate and delay arithmetic
- `sync`     : start/stop planning and broadcast to X engine instances
- `topology` : F engine IP/MAC/ARP derivation from the function ID
- `store`    : hashpipe status store (redis) client
- `barrier`  : edge-aligned arming of the sync and noise generators
- `fengine`  : ordered F engine configuration sequence
- `device`, `katcp` : register access to ROACH2 boards
*/

pub mod barrier;
pub mod config;
pub mod counter;
pub mod device;
pub mod fengine;
pub mod katcp;
pub mod store;
pub mod sync;
pub mod topology;

pub use barrier::{BarrierError, BarrierPolicy, Clock, SystemClock};
pub use config::{CtMode, CtlOptions, EqCoeff, FengOptions, HostSpec, InputSource, Settings};
pub use device::{Device, DeviceError};
pub use fengine::{configure, ConfigureError, ConfigureReport, DnsResolver, Resolver};
pub use store::{InstanceKey, RedisStore, StateStore, StatusSnapshot, StoreError};
pub use sync::{Coordinator, StartError, StartOptions, StopError, SyncPlan};
