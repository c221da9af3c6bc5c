//! 9P2000.L protocol engine: wire codec, handle pools, transports, and
//! the transaction client.

pub mod client;
pub mod errors;
pub mod pool;
pub mod protocol;
pub mod transport;
