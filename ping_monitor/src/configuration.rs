use serde::Deserialize;
use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_ip_ping_monitor::{Family, Mode, PingerConfig, Target};

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("no target could be resolved")]
    Resolve,
    #[error("privileged mode requires root, set \"privileged\": false to use ping sockets")]
    NotPrivileged,
}

fn default_period() -> Duration {
    Duration::from_secs(1)
}

fn default_timeout() -> Duration {
    tokio_ip_ping_monitor::ping::DEFAULT_TIMEOUT
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfiguration {
    /// IP literal or host name.
    pub host: String,
    /// Defaults to `host`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    #[serde(default = "default_period", with = "humantime_serde")]
    pub period: Duration,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Raw sockets when set, ping sockets otherwise.
    #[serde(default = "default_true")]
    pub privileged: bool,
    #[serde(default = "default_true")]
    pub ipv4: bool,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    pub targets: Vec<TargetConfiguration>,
}

impl Configuration {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, Error> {
        let configuration: Self = serde_json::from_str(content)?;
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.targets.is_empty() {
            return Err(Error::Validation("no target configured".to_string()));
        }
        if !self.ipv4 && !self.ipv6 {
            return Err(Error::Validation(
                "at least one of ipv4 and ipv6 must be enabled".to_string(),
            ));
        }
        if self.period.is_zero() {
            return Err(Error::Validation("period must be greater than zero".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Validation("timeout must be greater than zero".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Validation(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        if let Some(position) = self.targets.iter().position(|t| t.host.trim().is_empty()) {
            return Err(Error::Validation(format!("target {} has an empty host", position)));
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        if self.privileged {
            Mode::Privileged
        } else {
            Mode::Unprivileged
        }
    }

    pub fn check_privileges(&self) -> Result<(), Error> {
        if self.privileged && !running_as_root() {
            return Err(Error::NotPrivileged);
        }
        Ok(())
    }

    fn family_enabled(&self, addr: &IpAddr) -> bool {
        match Family::of(addr) {
            Family::V4 => self.ipv4,
            Family::V6 => self.ipv6,
        }
    }

    /// Resolve every configured host to one address of an enabled family.
    ///
    /// Hosts that cannot be resolved and addresses already taken by an
    /// earlier target are skipped with a warning.
    pub async fn resolve_targets(&self) -> Result<Vec<Target>, Error> {
        let mut seen = HashSet::new();
        let mut targets = vec![];
        for target in &self.targets {
            let host = target.host.trim();
            let name = target.name.clone().unwrap_or_else(|| host.to_string());
            let addrs = match lookup(host).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    tracing::warn!(%host, error = %e, "failed to resolve target, skipping");
                    continue;
                }
            };
            let addr = match addrs.into_iter().find(|addr| self.family_enabled(addr)) {
                Some(addr) => addr,
                None => {
                    tracing::warn!(%host, "no address in an enabled family, skipping");
                    continue;
                }
            };
            if !seen.insert(addr) {
                tracing::warn!(%host, %addr, %name, "duplicate target address, skipping");
                continue;
            }
            tracing::debug!(%host, %addr, %name, "target resolved");
            targets.push(Target::new(addr, name).with_tags(target.tags.clone()));
        }
        if targets.is_empty() {
            return Err(Error::Resolve);
        }
        Ok(targets)
    }

    pub fn pinger_config(&self, targets: Vec<Target>) -> PingerConfig {
        PingerConfig::new(targets)
            .with_period(self.period)
            .with_timeout(self.timeout)
            .with_families(self.ipv4, self.ipv6)
            .with_mode(self.mode())
    }
}

async fn lookup(host: &str) -> io::Result<Vec<IpAddr>> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(vec![addr]);
    }
    let addrs = tokio::net::lookup_host((host, 0)).await?;
    Ok(addrs.map(|addr| addr.ip()).collect())
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn defaults() {
        let conf = Configuration::from_json(r#"{"targets": [{"host": "127.0.0.1"}]}"#).unwrap();
        assert_eq!(conf.period, Duration::from_secs(1));
        assert_eq!(conf.timeout, Duration::from_secs(4));
        assert!(conf.privileged);
        assert!(conf.ipv4);
        assert!(!conf.ipv6);
        assert_eq!(conf.channel_capacity, 1024);
        assert_eq!(conf.mode(), Mode::Privileged);
        assert_eq!(conf.targets[0].name, None);
        assert!(conf.targets[0].tags.is_empty());
    }

    #[test]
    fn humantime_durations() {
        let conf = Configuration::from_json(
            r#"{
                "period": "500ms",
                "timeout": "2s",
                "privileged": false,
                "ipv6": true,
                "targets": [{"host": "::1", "name": "lo6", "tags": ["lab"]}]
            }"#,
        )
        .unwrap();
        assert_eq!(conf.period, Duration::from_millis(500));
        assert_eq!(conf.timeout, Duration::from_secs(2));
        assert_eq!(conf.mode(), Mode::Unprivileged);
        assert_eq!(conf.targets[0].name.as_deref(), Some("lo6"));
        assert_eq!(conf.targets[0].tags, vec!["lab".to_string()]);
    }

    #[test]
    fn invalid_configurations() {
        let invalid = [
            r#"{"targets": []}"#,
            r#"{"ipv4": false, "targets": [{"host": "127.0.0.1"}]}"#,
            r#"{"period": "0s", "targets": [{"host": "127.0.0.1"}]}"#,
            r#"{"timeout": "0s", "targets": [{"host": "127.0.0.1"}]}"#,
            r#"{"channel_capacity": 0, "targets": [{"host": "127.0.0.1"}]}"#,
            r#"{"targets": [{"host": "127.0.0.1"}, {"host": " "}]}"#,
        ];
        for json in invalid {
            assert!(
                matches!(Configuration::from_json(json), Err(Error::Validation(_))),
                "{}",
                json
            );
        }
    }

    #[test]
    fn unparsable_configurations() {
        for json in [
            r#"{"targets": [{"host": "127.0.0.1"}], "ttl": 3}"#,
            r#"{"period": "soon", "targets": [{"host": "127.0.0.1"}]}"#,
            r#"{"period": "1s"}"#,
            "not json",
        ] {
            assert!(
                matches!(Configuration::from_json(json), Err(Error::Parse(_))),
                "{}",
                json
            );
        }
    }

    #[test]
    fn missing_file() {
        let err = Configuration::load("/nonexistent/ping_monitor.json").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn unprivileged_needs_no_root() {
        let conf = Configuration::from_json(
            r#"{"privileged": false, "targets": [{"host": "127.0.0.1"}]}"#,
        )
        .unwrap();
        assert!(conf.check_privileges().is_ok());
    }

    #[tokio::test]
    async fn literal_targets_resolve() {
        let conf = Configuration::from_json(
            r#"{
                "targets": [
                    {"host": "127.0.0.1", "tags": ["loopback"]},
                    {"host": "192.0.2.7", "name": "doc"},
                    {"host": "::1"},
                    {"host": "127.0.0.1", "name": "again"}
                ]
            }"#,
        )
        .unwrap();
        let targets = conf.resolve_targets().await.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(targets[0].name, "127.0.0.1");
        assert_eq!(targets[0].tags, vec!["loopback".to_string()]);
        assert_eq!(targets[1].addr, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)));
        assert_eq!(targets[1].name, "doc");
    }

    #[tokio::test]
    async fn disabled_family_targets_are_skipped() {
        let conf = Configuration::from_json(
            r#"{"ipv4": false, "ipv6": true, "targets": [{"host": "127.0.0.1"}, {"host": "::1"}]}"#,
        )
        .unwrap();
        let targets = conf.resolve_targets().await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn nothing_resolved() {
        let conf =
            Configuration::from_json(r#"{"targets": [{"host": "::1"}]}"#).unwrap();
        assert!(matches!(conf.resolve_targets().await, Err(Error::Resolve)));
    }

    #[test]
    fn pinger_config_follows_configuration() {
        let conf = Configuration::from_json(
            r#"{"period": "3s", "timeout": "1s", "privileged": false, "ipv6": true, "targets": [{"host": "::1"}]}"#,
        )
        .unwrap();
        let pinger = conf.pinger_config(vec![]);
        assert_eq!(pinger.period, Duration::from_secs(3));
        assert_eq!(pinger.timeout, Duration::from_secs(1));
        assert!(pinger.ipv4 && pinger.ipv6);
        assert_eq!(pinger.mode, Mode::Unprivileged);
    }
}
