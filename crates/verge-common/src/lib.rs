pub mod config;
pub mod error;
pub mod resources;
pub mod telemetry;
pub mod types;

pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use resources::Resources;
pub use types::{
    Decision, Deployment, DeploymentId, Migration, Node, NodeId, NodeTier, Pod, PodId, PodStatus,
    Suggestion,
};
