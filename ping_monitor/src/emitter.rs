//! JSON lines output of probe results.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::io;
use std::net::IpAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_ip_ping_monitor::{Outcome, ProbeResult};

const EVENT_TYPE: &str = "ping_monitor";

#[derive(Debug, Serialize)]
struct TargetRecord<'a> {
    name: &'a str,
    addr: IpAddr,
    tags: &'a [String],
}

#[derive(Debug, Serialize)]
struct Event<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: String,
    #[serde(rename = "type")]
    ty: &'static str,
    target: TargetRecord<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rtt: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    loss: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

impl<'a> Event<'a> {
    fn new(result: &'a ProbeResult, at: DateTime<Utc>) -> Self {
        let (rtt, reason) = match result.outcome {
            Outcome::Reply(_) => (result.rtt_ms(), None),
            Outcome::Lost(reason) => (None, Some(reason.as_str())),
        };
        Self {
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ty: EVENT_TYPE,
            target: TargetRecord {
                name: &result.target.name,
                addr: result.target.addr,
                tags: &result.target.tags,
            },
            rtt,
            loss: reason.is_some(),
            reason,
        }
    }
}

/// Render one result as a JSON line, trailing newline included.
pub fn render(result: &ProbeResult, at: DateTime<Utc>) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&Event::new(result, at))?;
    line.push(b'\n');
    Ok(line)
}

pub struct Emitter<W> {
    sink: W,
    written: u64,
}

impl<W: AsyncWrite + Unpin> Emitter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink, written: 0 }
    }

    pub async fn emit(&mut self, result: &ProbeResult) -> io::Result<()> {
        let line = render(result, Utc::now())?;
        self.sink.write_all(&line).await?;
        self.sink.flush().await?;
        self.written += 1;
        Ok(())
    }

    /// Write every result until the channel closes. Returns the number of
    /// lines written.
    pub async fn run(mut self, mut results: mpsc::Receiver<ProbeResult>) -> io::Result<u64> {
        while let Some(result) = results.recv().await {
            self.emit(&result).await?;
        }
        tracing::debug!(written = self.written, "result channel closed");
        Ok(self.written)
    }
}
