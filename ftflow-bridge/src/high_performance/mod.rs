// Packet memory and cache helpers used on the receive path
pub mod memory_pool;
pub mod prefetch;

pub use memory_pool::*;
pub use prefetch::*;
