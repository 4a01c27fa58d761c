//! Network status detection

mod monitor;
mod probe;

pub use monitor::NetworkStatusMonitor;
pub use probe::{ConnectivityProbe, HttpProbe, ProbeTarget, StaticProbe};
