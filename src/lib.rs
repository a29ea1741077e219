#![doc = include_str!("../README.md")]

mod error;

pub mod common;
pub mod config;
pub mod messages;
pub mod reactor;
pub mod rpc;
pub mod scheduler;

pub use common::{Id, Node};
pub use config::{AddressFamily, Config};
pub use error::Error;
pub use reactor::ConnectionManager;
pub use rpc::{DhtHandler, RpcServer};
pub use scheduler::Scheduler;

// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
