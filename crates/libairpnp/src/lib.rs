pub mod bridge;
pub mod config;
mod control_point;
mod device_id;
mod port_pool;
mod spawn_utils;

pub use bridge::{BridgeServer, BridgeServerOptions};
pub use config::{Config, resolve_interface};
pub use control_point::AVControlPoint;
pub use device_id::create_device_id;
pub use port_pool::PortPool;
