//! Common functionality shared among canmaster crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is
//! re-exported by `canmaster-client`.
#![warn(missing_docs)]

pub mod constants;
pub mod messages;
pub mod node_id;
pub mod sdo;
pub mod traits;
pub mod value;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
pub use socketcan::{open_socketcan, SocketCanReceiver, SocketCanSender};

pub use messages::{CanId, CanMessage};
pub use node_id::NodeId;
pub use value::{DataType, Value};
