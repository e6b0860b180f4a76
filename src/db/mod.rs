mod connection;
mod manager;
mod pool;
mod singleflight;

pub use connection::*;
pub use manager::*;
pub use pool::*;
pub use singleflight::*;
