use std::collections::VecDeque;

use crate::plan::Expectation;

/// A stuck-queue probe: if two consecutive samples look the same and the
/// queue is not empty, no expected event has arrived for a whole health
/// period and the reconciler needs a resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSample {
    pub queue_length: usize,
    pub head_id: Option<u32>,
}

impl HealthSample {
    pub fn of(expectations: &VecDeque<Expectation>) -> Self {
        Self {
            queue_length: expectations.len(),
            head_id: expectations.front().map(|e| e.id),
        }
    }

    pub fn indicates_stuck(&self, previous: Option<&HealthSample>) -> bool {
        self.queue_length > 0 && previous == Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanKind, PlanStep};
    use verge_common::DeploymentId;

    fn queue_with(ids: &[u32]) -> VecDeque<Expectation> {
        ids.iter()
            .map(|id| Expectation {
                id: *id,
                kind: PlanKind::Placing,
                step: PlanStep::Create {
                    deployment: DeploymentId(1),
                },
            })
            .collect()
    }

    #[test]
    fn empty_queue_is_never_stuck() {
        let sample = HealthSample::of(&VecDeque::new());
        assert!(!sample.indicates_stuck(Some(&sample.clone())));
    }

    #[test]
    fn repeated_sample_is_stuck() {
        let queue = queue_with(&[7, 8]);
        let first = HealthSample::of(&queue);
        let second = HealthSample::of(&queue);
        assert!(second.indicates_stuck(Some(&first)));
    }

    #[test]
    fn progress_resets_the_verdict() {
        let first = HealthSample::of(&queue_with(&[7, 8]));
        let second = HealthSample::of(&queue_with(&[8]));
        assert!(!second.indicates_stuck(Some(&first)));
    }
}
