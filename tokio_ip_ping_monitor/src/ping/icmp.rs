use super::listener::Listener;
use super::reaper::Reaper;
use super::sender::{SendPipeline, SendPool};
use super::socket::{IcmpSocket, Socket};
use super::state::RequestState;
use super::{Error, Family, Mode, ProbeResult, Target, Targets, DEFAULT_TIMEOUT};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PingerConfig {
    /// Time between two rounds of probes.
    pub period: Duration,
    /// Age after which an unanswered probe is reported lost.
    pub timeout: Duration,
    pub ipv4: bool,
    pub ipv6: bool,
    pub mode: Mode,
    pub targets: Vec<Target>,
}

impl PingerConfig {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            period: Duration::from_secs(1),
            timeout: DEFAULT_TIMEOUT,
            ipv4: true,
            ipv6: false,
            mode: Mode::Privileged,
            targets,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_families(mut self, ipv4: bool, ipv6: bool) -> Self {
        self.ipv4 = ipv4;
        self.ipv6 = ipv6;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

/// The probing engine: sends a round of probes every period, listens for
/// replies and reaps the probes that got none.
pub struct Pinger {
    period: Duration,
    timeout: Duration,
    state: Arc<RequestState>,
    targets: Arc<Targets>,
    v4: Option<Arc<dyn Socket>>,
    v6: Option<Arc<dyn Socket>>,
    results: mpsc::Sender<ProbeResult>,
}

impl Pinger {
    /// Open one connection per enabled family. A family whose connection
    /// cannot be opened is disabled for the run.
    pub fn new(config: PingerConfig, results: mpsc::Sender<ProbeResult>) -> Result<Self, Error> {
        let v4 = config
            .ipv4
            .then(|| Self::open(Family::V4, config.mode, config.timeout))
            .flatten();
        let v6 = config
            .ipv6
            .then(|| Self::open(Family::V6, config.mode, config.timeout))
            .flatten();
        Self::with_sockets(config, v4, v6, results)
    }

    fn open(family: Family, mode: Mode, timeout: Duration) -> Option<Arc<dyn Socket>> {
        match IcmpSocket::open(family, mode, timeout) {
            Ok(socket) => {
                tracing::info!(
                    %family,
                    mode = ?socket.mode(),
                    identifier = socket.identifier(),
                    "using ICMP connection"
                );
                Some(Arc::new(socket))
            }
            Err(source) => {
                let error = Error::Socket { family, source };
                tracing::error!(%error, "{} probing disabled", family);
                None
            }
        }
    }

    pub fn with_sockets(
        config: PingerConfig,
        v4: Option<Arc<dyn Socket>>,
        v6: Option<Arc<dyn Socket>>,
        results: mpsc::Sender<ProbeResult>,
    ) -> Result<Self, Error> {
        if config.period.is_zero() || config.timeout.is_zero() {
            return Err(Error::BadConfig(
                "period and timeout must be greater than zero".to_string(),
            ));
        }
        if v4.is_none() && v6.is_none() {
            return Err(Error::NoConnection);
        }
        let targets: Targets = config
            .targets
            .into_iter()
            .filter(|target| {
                let enabled = match Family::of(&target.addr) {
                    Family::V4 => v4.is_some(),
                    Family::V6 => v6.is_some(),
                };
                if !enabled {
                    tracing::warn!(name = %target.name, addr = %target.addr, "no connection for target, skipping");
                }
                enabled
            })
            .collect();
        Ok(Self {
            period: config.period,
            timeout: config.timeout,
            state: Arc::new(RequestState::new()),
            targets: Arc::new(targets),
            v4,
            v6,
            results,
        })
    }

    pub fn state(&self) -> Arc<RequestState> {
        self.state.clone()
    }

    pub fn targets(&self) -> Arc<Targets> {
        self.targets.clone()
    }

    /// Probe until `shutdown` is cancelled. Probes still in flight at that
    /// point are abandoned.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let Self {
            period,
            timeout,
            state,
            targets,
            v4,
            v6,
            results,
        } = self;

        let listening = shutdown.child_token();
        let mut listeners = vec![];
        for socket in v4.iter().chain(v6.iter()) {
            let listener = Listener::new(
                socket.clone(),
                state.clone(),
                targets.clone(),
                results.clone(),
                listening.clone(),
            );
            match listener.spawn() {
                Ok(handle) => listeners.push(handle),
                Err(e) => {
                    listening.cancel();
                    join_listeners(listeners).await;
                    return Err(Error::Listener(e));
                }
            }
        }

        let pipeline = SendPipeline::new(
            SendPool::sized_for(targets.len(), timeout),
            state.clone(),
            targets.clone(),
            v4,
            v6,
        );
        let reaper = Reaper::new(state.clone(), targets.clone(), timeout);

        let mut send_tick = time::interval(period);
        send_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reap_tick = time::interval_at(time::Instant::now() + timeout, timeout);
        reap_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batches = JoinSet::new();

        tracing::info!(targets = targets.len(), ?period, ?timeout, "pinger running");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = reap_tick.tick() => {
                    let lost = reaper.sweep(Instant::now());
                    if !emit(&results, lost, &shutdown).await {
                        break;
                    }
                }
                _ = send_tick.tick() => {
                    batches.spawn(pipeline.dispatch().finish());
                }
                Some(joined) = batches.join_next(), if !batches.is_empty() => {
                    if let Ok(summary) = joined {
                        tracing::debug!(sent = summary.sent, failed = summary.failed, "send batch complete");
                    }
                }
            }
        }

        tracing::info!(in_flight = state.len(), "pinger stopping");
        batches.shutdown().await;
        listening.cancel();
        join_listeners(listeners).await;
        Ok(())
    }
}

/// Push results downstream. Returns false once the run should stop, either
/// on shutdown while the channel is full or when the channel is closed.
async fn emit(
    results: &mpsc::Sender<ProbeResult>,
    batch: Vec<ProbeResult>,
    shutdown: &CancellationToken,
) -> bool {
    for result in batch {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return false,
            sent = results.send(result) => {
                if sent.is_err() {
                    tracing::warn!("result channel closed");
                    return false;
                }
            }
        }
    }
    true
}

async fn join_listeners(listeners: Vec<JoinHandle<()>>) {
    let joined = tokio::task::spawn_blocking(move || {
        for handle in listeners {
            if handle.join().is_err() {
                tracing::error!("listener thread panicked");
            }
        }
    })
    .await;
    if let Err(e) = joined {
        tracing::error!(error = %e, "failed to join listeners");
    }
}
