use super::state::RequestState;
use super::{LossReason, Outcome, ProbeResult, Targets};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reports requests nobody answered within the timeout.
pub struct Reaper {
    state: Arc<RequestState>,
    targets: Arc<Targets>,
    timeout: Duration,
}

impl Reaper {
    pub fn new(state: Arc<RequestState>, targets: Arc<Targets>, timeout: Duration) -> Self {
        Self {
            state,
            targets,
            timeout,
        }
    }

    pub fn sweep(&self, now: Instant) -> Vec<ProbeResult> {
        self.state
            .sweep_expired(self.timeout, now)
            .into_iter()
            .filter_map(|request| {
                tracing::debug!(sequence = request.sequence, addr = %request.target, "no reply received");
                self.targets.attribute(
                    request.target,
                    request.sequence,
                    Outcome::Lost(LossReason::NoReply),
                )
            })
            .collect()
    }
}
