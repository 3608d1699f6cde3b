pub mod apply;
pub mod decision;
pub mod free;
pub mod migrate;
pub mod pack;
pub mod qos;
pub mod suggest;

pub use apply::{apply_decision, apply_suggestion, presort_for_packing};
pub use decision::decide;
pub use free::select_freed;
pub use migrate::plan_migrations;
pub use pack::{fit_on_edge, Packing};
pub use qos::{evaluate, qos, DeploymentShare, QosResult};
pub use suggest::suggest_cloud_to_edge;
