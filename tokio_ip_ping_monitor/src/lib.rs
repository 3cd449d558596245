pub mod ping;

pub use ping::icmp::{Pinger, PingerConfig};
pub use ping::{Family, LossReason, Mode, Outcome, ProbeResult, Target, Targets};
