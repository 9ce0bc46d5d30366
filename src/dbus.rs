//! The published `com.victronenergy.system` service
//!
//! Exposes the aggregated snapshot on the bus through the VeDbus-style
//! `com.victronenergy.BusItem` interface: one object per output path plus a
//! root object serving whole-tree reads. All paths are read-only from the
//! bus except `/Relay/0/State`, whose writes are forwarded to the engine as
//! commands.

mod fmt;
pub mod items;
mod root;
mod service;
mod shared;

pub use fmt::format_path_value;
pub use root::{RootBus, TreeNode};
pub use service::{SERVICE_NAME, SystemService, summed_paths};
