pub mod backoff;
pub mod client;
pub mod clock;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod hash;
pub mod kube_client;
pub mod limits;
pub mod planner;
pub mod propagation;
pub mod queue;

#[cfg(test)]
pub mod testing;

pub use propagation::{reconcile, Context, ReconcileError};
