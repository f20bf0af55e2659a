mod cluster;
mod job;
mod metrics;

pub use cluster::*;
pub use job::*;
pub use metrics::*;
