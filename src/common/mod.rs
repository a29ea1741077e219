//! Types shared between the message layer and the rpc server.

pub mod address;
pub mod id;
pub mod moving_average;
pub mod node;

pub use address::is_global_unicast;
pub use id::{Id, ID_SIZE};
pub use moving_average::MovingAverage;
pub use node::{decode_compact_v4, decode_compact_v6, Node};
