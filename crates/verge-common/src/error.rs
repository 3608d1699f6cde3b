use crate::resources::Resources;
use crate::types::{DeploymentId, NodeId, PodId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A replica references a deployment the configuration never saw.
    #[error("deployment {0} is not registered")]
    UnknownDeployment(DeploymentId),

    #[error("node {0} is not registered on the edge")]
    UnknownNode(NodeId),

    /// The requested vector cannot be satisfied even by an empty edge.
    #[error("resource request {requested} exceeds total edge capacity {capacity}")]
    EdgeCapacityExceeded {
        requested: Resources,
        capacity: Resources,
    },

    #[error("not enough free resources on node {node} for pod {pod}")]
    InsufficientResources { pod: PodId, node: NodeId },

    /// The same replica was presented as both edge and cloud in one snapshot.
    #[error("pod {0} is on both edge and cloud in the same snapshot")]
    InconsistentPlacement(PodId),

    /// Deleting this replica would leave its deployment with nothing running.
    #[error("pod {pod} is the only running replica of deployment {deployment}")]
    StaleDecision {
        pod: PodId,
        deployment: DeploymentId,
    },

    #[error("unexpected event for pod {0}")]
    UnexpectedEvent(PodId),

    #[error("connector failure: {0}")]
    Connector(String),
}

impl Error {
    /// Errors that mean "this alternative is infeasible" rather than "the
    /// caller misused the API"; the decision engine skips the partition.
    pub fn is_infeasible(&self) -> bool {
        matches!(
            self,
            Error::EdgeCapacityExceeded { .. } | Error::InsufficientResources { .. }
        )
    }
}
