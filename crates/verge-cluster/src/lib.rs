pub mod state;

pub use state::{CloudState, ClusterSnapshot, ClusterState, EdgeConfig, EdgeState};
