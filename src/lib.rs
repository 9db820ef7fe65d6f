pub mod api;
pub mod bus;
pub mod config;
pub mod hub;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use types::{
    HostSample, LiveMessage, Monitor, MonitorUpdate, Observation, PhaseTiming, ProbeTask,
    SystemUpdate,
};

/// The single pub/sub topic carrying every live message.
pub const LIVE_TOPIC: &str = "pulsar:updates";
