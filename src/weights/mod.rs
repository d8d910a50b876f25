pub mod configuration;
pub mod controller;
pub mod latency;
pub mod monitor;
pub mod optimizer;
pub mod simulator;

pub use configuration::*;
pub use controller::*;
pub use latency::*;
pub use monitor::*;
pub use optimizer::*;
pub use simulator::*;
