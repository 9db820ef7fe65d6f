//! Worker-side components: the scheduler that finds due monitors, the
//! probe executor that measures one HTTP transaction, and the host-metrics
//! sampler.

pub mod probe;
pub mod sampler;
pub mod scheduler;

pub use probe::ProbeExecutor;
pub use sampler::HostSampler;
pub use scheduler::Poller;
