pub mod error;
pub mod icmp;
pub mod listener;
pub mod packet;
pub mod reaper;
pub mod sender;
pub mod socket;
pub mod state;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

pub use error::{DecodeError, Error, RegisterError};

/// Probe timeout used when the configuration does not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}

/// Socket flavour used to carry the probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Raw ICMP sockets, requires root or `CAP_NET_RAW`.
    Privileged,
    /// Kernel "ping" datagram sockets.
    Unprivileged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub addr: IpAddr,
    pub name: String,
    pub tags: Vec<String>,
}

impl Target {
    pub fn new(addr: IpAddr, name: impl Into<String>) -> Self {
        Self {
            addr,
            name: name.into(),
            tags: vec![],
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Immutable set of targets, indexed by address.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    by_addr: HashMap<IpAddr, Target>,
}

impl Targets {
    pub fn get(&self, addr: &IpAddr) -> Option<&Target> {
        self.by_addr.get(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.by_addr.values()
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Build the result for a resolved request, looking the target up by address.
    pub fn attribute(&self, addr: IpAddr, sequence: u16, outcome: Outcome) -> Option<ProbeResult> {
        match self.by_addr.get(&addr) {
            Some(target) => Some(ProbeResult {
                target: target.clone(),
                sequence,
                outcome,
            }),
            None => {
                tracing::error!(%addr, sequence, "no details for resolved probe in targets");
                None
            }
        }
    }
}

impl FromIterator<Target> for Targets {
    fn from_iter<I: IntoIterator<Item = Target>>(iter: I) -> Self {
        let mut by_addr = HashMap::new();
        for target in iter {
            by_addr.entry(target.addr).or_insert(target);
        }
        Self { by_addr }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossReason {
    NoReply,
    DestinationUnreachable,
    PacketTooBig,
    TimeExceeded,
}

impl LossReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoReply => "no reply received",
            Self::DestinationUnreachable => "destination unreachable",
            Self::PacketTooBig => "packet too big",
            Self::TimeExceeded => "time exceeded",
        }
    }
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Reply(Duration),
    Lost(LossReason),
}

/// A finished probe, handed over to whoever consumes the result channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub target: Target,
    pub sequence: u16,
    pub outcome: Outcome,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Reply(_))
    }

    pub fn rtt(&self) -> Option<Duration> {
        match self.outcome {
            Outcome::Reply(rtt) => Some(rtt),
            Outcome::Lost(_) => None,
        }
    }

    /// Round trip time in fractional milliseconds.
    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt().map(|rtt| {
            let msec = rtt.as_millis() as f64;
            let nsec = (rtt.as_nanos() % 1_000_000) as f64;
            msec + nsec * 1e-6
        })
    }

    pub fn loss_reason(&self) -> Option<LossReason> {
        match self.outcome {
            Outcome::Reply(_) => None,
            Outcome::Lost(reason) => Some(reason),
        }
    }
}
