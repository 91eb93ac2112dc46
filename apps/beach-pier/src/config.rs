use std::{net::SocketAddr, time::Duration};

use reqwest::Url;

use crate::{cli::ServeArgs, error::ConfigError};

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// `None` keeps keys forever.
    pub retention: Option<Duration>,
    /// In-memory cap; `None` is unbounded.
    pub max_keys: Option<usize>,
    /// Period of the in-memory expiry sweep.
    pub purge_interval: Duration,
    /// Namespace for keys held in Redis.
    pub key_prefix: String,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention: Some(Duration::from_secs(86_400)),
            max_keys: Some(100_000),
            purge_interval: Duration::from_secs(60),
            key_prefix: "pier:idempotency".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub idempotency: IdempotencyConfig,
    /// `None` disables idle pruning.
    pub session_idle_timeout: Option<Duration>,
    pub idle_sweep_interval: Duration,
    pub upstream_url: Option<Url>,
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            redis_url: None,
            idempotency: IdempotencyConfig::default(),
            session_idle_timeout: None,
            idle_sweep_interval: Duration::from_secs(30),
            upstream_url: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl TryFrom<ServeArgs> for Config {
    type Error = ConfigError;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr =
            args.listen_addr
                .parse()
                .map_err(|source| ConfigError::ListenAddr {
                    value: args.listen_addr.clone(),
                    source,
                })?;

        if args.idle_sweep_interval_secs == 0 {
            return Err(ConfigError::Zero {
                name: "idle sweep interval",
            });
        }
        if args.idempotency_purge_interval_secs == 0 {
            return Err(ConfigError::Zero {
                name: "idempotency purge interval",
            });
        }

        let upstream_url = args
            .upstream_url
            .as_deref()
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(parse_upstream)
            .transpose()?;

        Ok(Config {
            listen_addr,
            redis_url: args.redis_url.filter(|url| !url.trim().is_empty()),
            idempotency: IdempotencyConfig {
                retention: non_zero_secs(args.idempotency_retention_secs),
                max_keys: (args.idempotency_max_keys > 0).then_some(args.idempotency_max_keys),
                purge_interval: Duration::from_secs(args.idempotency_purge_interval_secs),
                key_prefix: args.idempotency_key_prefix,
            },
            session_idle_timeout: non_zero_secs(args.session_idle_timeout_secs),
            idle_sweep_interval: Duration::from_secs(args.idle_sweep_interval_secs),
            upstream_url,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn parse_upstream(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::UpstreamUrl {
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::UpstreamUrl {
            value: raw.to_string(),
            reason: format!("unsupported scheme {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::Cli;

    fn parse(args: &[&str]) -> Result<Config, ConfigError> {
        let cli = Cli::try_parse_from(std::iter::once("beach-pier").chain(args.iter().copied()))
            .expect("arguments parse");
        Config::try_from(cli.serve)
    }

    #[test_timeout::timeout]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert!(config.redis_url.is_none());
        assert_eq!(
            config.idempotency.retention,
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(config.idempotency.max_keys, Some(100_000));
        assert_eq!(config.idempotency.purge_interval, Duration::from_secs(60));
        assert_eq!(config.idempotency.key_prefix, "pier:idempotency");
        assert!(config.session_idle_timeout.is_none());
        assert!(config.upstream_url.is_none());
    }

    #[test_timeout::timeout]
    fn zero_means_disabled() {
        let config = parse(&[
            "--idempotency-retention-secs",
            "0",
            "--idempotency-max-keys",
            "0",
            "--session-idle-timeout-secs",
            "0",
        ])
        .unwrap();
        assert!(config.idempotency.retention.is_none());
        assert!(config.idempotency.max_keys.is_none());
        assert!(config.session_idle_timeout.is_none());
    }

    #[test_timeout::timeout]
    fn explicit_values() {
        let config = parse(&[
            "--listen-addr",
            "127.0.0.1:9000",
            "--redis-url",
            "redis://cache:6379",
            "--session-idle-timeout-secs",
            "120",
            "--upstream-url",
            "http://orders.internal:8081/",
        ])
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.session_idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(
            config.upstream_url.unwrap().as_str(),
            "http://orders.internal:8081/"
        );
    }

    #[test_timeout::timeout]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            parse(&["--listen-addr", "nope"]),
            Err(ConfigError::ListenAddr { .. })
        ));
        assert!(matches!(
            parse(&["--upstream-url", "ftp://files"]),
            Err(ConfigError::UpstreamUrl { .. })
        ));
        assert!(matches!(
            parse(&["--idle-sweep-interval-secs", "0"]),
            Err(ConfigError::Zero { .. })
        ));
        assert!(matches!(
            parse(&["--idempotency-purge-interval-secs", "0"]),
            Err(ConfigError::Zero {
                name: "idempotency purge interval"
            })
        ));
    }
}
