pub mod args;
pub mod health;
pub mod metrics;
pub mod plan;
pub mod reconciler;

pub use metrics::{Stats, StateHandle};
pub use reconciler::Reconciler;
