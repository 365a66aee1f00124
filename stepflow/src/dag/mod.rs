mod graph;
mod plan;
mod step;

pub use graph::DependencyGraph;
pub use plan::Plan;
pub(crate) use plan::short_id;
pub use step::{Params, Payload, RetryPolicy, Step};
