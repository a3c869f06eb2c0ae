pub mod cleanup;
pub mod reconcile;
pub mod result;
pub mod status;
pub mod sync;
pub mod validation;

pub use cleanup::*;
pub use reconcile::*;
pub use result::*;
pub use status::*;
pub use sync::*;
pub use validation::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "propagation_test.rs"]
mod tests;
