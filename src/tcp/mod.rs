//! The TCP active-message transport (spec section 4.4).

mod endpoint;
mod iface;
mod wire;

pub use endpoint::{Caps, ConnState};
pub use iface::{TcpEpId, TcpIface};
pub use wire::CM_AM_ID;
