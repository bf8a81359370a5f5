//! SCOPY transport core: a generic segmented RMA engine that schedules
//! GET/PUT requests across a pluggable [`primitive::CopyPrimitive`] (spec
//! section 4.3).

mod engine;
mod primitive;
mod tx;

pub use engine::{ScopyEndpoint, ScopyInterface};
pub use primitive::{CopyPrimitive, IoctlDevice, IoctlPrimitive, PeerHandle, RemoteIov, ScopyIoctlRequest, ScopyIoctlResponse};
#[cfg(all(target_os = "linux", feature = "tcp"))]
pub use primitive::ProcessVmPrimitive;
pub use tx::{Completion, Op};
