//! Per tick fan-out of echo requests over a bounded pool of send workers.

use super::packet::{encode_echo_request, PROBE_PAYLOAD};
use super::socket::Socket;
use super::state::{InFlightRequest, RequestState};
use super::{Family, RegisterError, Targets};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug)]
pub enum SendOutcome {
    Sent {
        sequence: u16,
        target: IpAddr,
    },
    /// The sequence number was still held by an older request, nothing was sent.
    Collision {
        sequence: u16,
        target: IpAddr,
        holder: IpAddr,
    },
    WriteFailed {
        sequence: u16,
        target: IpAddr,
        error: io::Error,
    },
    NoConnection {
        target: IpAddr,
        family: Family,
    },
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }
}

/// One echo request to send.
pub struct SendJob {
    socket: Option<Arc<dyn Socket>>,
    state: Arc<RequestState>,
    target: IpAddr,
    sequence: u16,
}

impl SendJob {
    fn run(self) -> SendOutcome {
        let Self {
            socket,
            state,
            target,
            sequence,
        } = self;
        let socket = match socket {
            Some(socket) => socket,
            None => {
                return SendOutcome::NoConnection {
                    target,
                    family: Family::of(&target),
                }
            }
        };
        let identifier = socket.identifier();
        let packet = encode_echo_request(socket.family(), identifier, sequence, PROBE_PAYLOAD);

        // Reserved ahead of the write so a quick reply always finds it. It is
        // only reaped once confirmed, so a write that stalls past the timeout
        // and then fails is not mistaken for a lost probe.
        let request = InFlightRequest {
            sequence,
            target,
            identifier,
            sent_at: Instant::now(),
        };
        if let Err(RegisterError::Occupied { holder, .. }) = state.reserve(request) {
            return SendOutcome::Collision {
                sequence,
                target,
                holder,
            };
        }
        if let Err(error) = socket.send_to(&packet, target) {
            state.resolve(sequence);
            return SendOutcome::WriteFailed {
                sequence,
                target,
                error,
            };
        }
        state.confirm(sequence);
        SendOutcome::Sent { sequence, target }
    }
}

/// Bounded pool of blocking send workers, shared by every tick.
#[derive(Debug, Clone)]
pub struct SendPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl SendPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Enough workers for every target to have a send outstanding during a
    /// whole timeout window.
    pub fn sized_for(targets: usize, timeout: Duration) -> Self {
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        Self::new(targets.saturating_mul(secs.max(1) as usize))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn submit(&self, jobs: impl IntoIterator<Item = SendJob>) -> SendBatch {
        let mut tasks = JoinSet::new();
        for job in jobs {
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let (sequence, target) = (job.sequence, job.target);
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        return SendOutcome::WriteFailed {
                            sequence,
                            target,
                            error: io::Error::other(e),
                        }
                    }
                };
                match tokio::task::spawn_blocking(move || job.run()).await {
                    Ok(outcome) => outcome,
                    Err(e) => SendOutcome::WriteFailed {
                        sequence,
                        target,
                        error: io::Error::other(e),
                    },
                }
            });
        }
        SendBatch { tasks }
    }
}

/// Outcomes of the sends submitted on one tick.
#[derive(Debug)]
pub struct SendBatch {
    tasks: JoinSet<SendOutcome>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub sent: usize,
    pub failed: usize,
}

impl SendBatch {
    pub async fn next(&mut self) -> Option<SendOutcome> {
        loop {
            match self.tasks.join_next().await? {
                Ok(outcome) => return Some(outcome),
                Err(e) => tracing::debug!(error = %e, "send task did not complete"),
            }
        }
    }

    /// Wait for every send and log the failures.
    pub async fn finish(mut self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        while let Some(outcome) = self.next().await {
            match outcome {
                SendOutcome::Sent { sequence, target } => {
                    tracing::trace!(sequence, %target, "echo request sent");
                    summary.sent += 1;
                    continue;
                }
                SendOutcome::Collision {
                    sequence,
                    target,
                    holder,
                } => {
                    tracing::warn!(sequence, %target, %holder, "sequence still in flight, probe dropped");
                }
                SendOutcome::WriteFailed {
                    sequence,
                    target,
                    error,
                } => {
                    tracing::warn!(sequence, %target, %error, "send unsuccessful");
                }
                SendOutcome::NoConnection { target, family } => {
                    tracing::debug!(%target, %family, "no connection for target");
                }
            }
            summary.failed += 1;
        }
        summary
    }
}

/// Turns a tick into one echo request per target.
pub struct SendPipeline {
    pool: SendPool,
    state: Arc<RequestState>,
    targets: Arc<Targets>,
    v4: Option<Arc<dyn Socket>>,
    v6: Option<Arc<dyn Socket>>,
}

impl SendPipeline {
    pub fn new(
        pool: SendPool,
        state: Arc<RequestState>,
        targets: Arc<Targets>,
        v4: Option<Arc<dyn Socket>>,
        v6: Option<Arc<dyn Socket>>,
    ) -> Self {
        Self {
            pool,
            state,
            targets,
            v4,
            v6,
        }
    }

    fn socket_for(&self, addr: &IpAddr) -> Option<Arc<dyn Socket>> {
        match Family::of(addr) {
            Family::V4 => self.v4.clone(),
            Family::V6 => self.v6.clone(),
        }
    }

    pub fn dispatch(&self) -> SendBatch {
        let jobs: Vec<SendJob> = self
            .targets
            .iter()
            .map(|target| SendJob {
                socket: self.socket_for(&target.addr),
                state: self.state.clone(),
                target: target.addr,
                sequence: self.state.next_sequence(),
            })
            .collect();
        self.pool.submit(jobs)
    }
}
