//! Deterministic cluster construction and assertion for tests and the
//! simulator. Everything here panics instead of returning errors: a broken
//! assumption in a test fixture should fail loudly.

mod builder;

pub use builder::{ClusterBuilder, DeploymentDesc, NodeDesc};
