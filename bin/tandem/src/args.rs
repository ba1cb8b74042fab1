//! Command line arguments and the optional TOML file backing them.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use alloy_primitives::Address;
use alloy_rpc_types_engine::JwtSecret;
use eyre::{WrapErr as _, ensure, eyre};
use jiff::SignedDuration;
use reqwest::Url;
use serde::Deserialize;
use tandem_engine::ClientConfig;
use tandem_leadership::LeaseConfig;
use tandem_telemetry_util::LogFormat;

#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// TOML file with any of the settings below, keyed by their snake_case
    /// names. Flags and environment variables take precedence over it.
    #[arg(long, env = "TANDEM_CONFIG")]
    pub(crate) config: Option<PathBuf>,

    /// Keep the block log and the leadership lease inside this process
    /// instead of Redis. For trying things out against a single engine.
    #[arg(long, env = "TANDEM_DEV", default_value_t = false)]
    pub(crate) dev: bool,

    #[command(flatten)]
    pub(crate) settings: Settings,
}

/// Every setting is optional here so that the file can fill whatever the
/// command line left out.
#[derive(Clone, Debug, Default, PartialEq, clap::Args, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Settings {
    /// Identifies this instance in the block log and in the lease. Must be
    /// unique in the cluster and stable across restarts.
    #[arg(long = "instance-id", env = "TANDEM_INSTANCE_ID")]
    pub(crate) instance_id: Option<String>,

    /// Authenticated Engine API endpoint of the execution client.
    #[arg(long = "engine.url", env = "TANDEM_ENGINE_URL")]
    pub(crate) engine_url: Option<String>,

    /// Hex encoded 32 byte secret shared with the execution client.
    #[arg(long = "engine.jwt-secret", env = "TANDEM_JWT_SECRET")]
    pub(crate) jwt_secret: Option<String>,

    /// Public JSON-RPC endpoint of the execution client.
    #[arg(long = "engine.rpc-url", env = "TANDEM_RPC_URL")]
    pub(crate) rpc_url: Option<String>,

    /// Upper bound for a single call to the execution client.
    #[arg(long = "engine.timeout", env = "TANDEM_RPC_TIMEOUT")]
    pub(crate) rpc_timeout: Option<SignedDuration>,

    #[arg(long = "redis.url", env = "TANDEM_REDIS_URL")]
    pub(crate) redis_url: Option<String>,

    /// Upper bound for a single Redis command, excluding the time a read
    /// waits for new log entries.
    #[arg(long = "redis.timeout", env = "TANDEM_REDIS_TIMEOUT")]
    pub(crate) redis_timeout: Option<SignedDuration>,

    /// Receives the fees of blocks built by this instance.
    #[arg(long = "builder.fee-recipient", env = "TANDEM_FEE_RECIPIENT")]
    pub(crate) fee_recipient: Option<Address>,

    /// Time the execution client gets to fill a block before it is fetched.
    #[arg(long = "builder.build-delay", env = "TANDEM_BUILD_DELAY")]
    pub(crate) build_delay: Option<SignedDuration>,

    /// Minimum spacing of blocks without transactions.
    #[arg(long = "builder.empty-block-delay", env = "TANDEM_EMPTY_BLOCK_DELAY")]
    pub(crate) empty_block_delay: Option<SignedDuration>,

    /// How long the leadership lease lives without renewal.
    #[arg(long = "lease.ttl", env = "TANDEM_LEASE_TTL")]
    pub(crate) lease_ttl: Option<SignedDuration>,

    /// How often the lease is renewed or acquisition retried. Must be below
    /// `lease.ttl`.
    #[arg(long = "lease.poll-interval", env = "TANDEM_LEASE_POLL_INTERVAL")]
    pub(crate) lease_poll_interval: Option<SignedDuration>,

    /// Serve Prometheus metrics on this address.
    #[arg(long = "metrics.address", env = "TANDEM_METRICS_ADDRESS")]
    pub(crate) metrics_address: Option<SocketAddr>,

    #[arg(long = "log.format", env = "TANDEM_LOG_FORMAT")]
    pub(crate) log_format: Option<LogFormat>,

    /// Directives in `RUST_LOG` syntax. Falls back to `RUST_LOG`, then `info`.
    #[arg(long = "log.filter", env = "TANDEM_LOG_FILTER")]
    pub(crate) log_filter: Option<String>,

    /// How long the work loop gets to stop before the lease is released.
    #[arg(long = "shutdown-timeout", env = "TANDEM_SHUTDOWN_TIMEOUT")]
    pub(crate) shutdown_timeout: Option<SignedDuration>,
}

impl Settings {
    fn or(self, fallback: Self) -> Self {
        Self {
            instance_id: self.instance_id.or(fallback.instance_id),
            engine_url: self.engine_url.or(fallback.engine_url),
            jwt_secret: self.jwt_secret.or(fallback.jwt_secret),
            rpc_url: self.rpc_url.or(fallback.rpc_url),
            rpc_timeout: self.rpc_timeout.or(fallback.rpc_timeout),
            redis_url: self.redis_url.or(fallback.redis_url),
            redis_timeout: self.redis_timeout.or(fallback.redis_timeout),
            fee_recipient: self.fee_recipient.or(fallback.fee_recipient),
            build_delay: self.build_delay.or(fallback.build_delay),
            empty_block_delay: self.empty_block_delay.or(fallback.empty_block_delay),
            lease_ttl: self.lease_ttl.or(fallback.lease_ttl),
            lease_poll_interval: self.lease_poll_interval.or(fallback.lease_poll_interval),
            metrics_address: self.metrics_address.or(fallback.metrics_address),
            log_format: self.log_format.or(fallback.log_format),
            log_filter: self.log_filter.or(fallback.log_filter),
            shutdown_timeout: self.shutdown_timeout.or(fallback.shutdown_timeout),
        }
    }
}

/// Settings after merging the file and applying defaults.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) dev: bool,
    pub(crate) instance_id: String,
    pub(crate) engine_url: Url,
    pub(crate) jwt_secret: JwtSecret,
    pub(crate) rpc_url: Url,
    pub(crate) rpc_timeout: Duration,
    pub(crate) redis_url: String,
    pub(crate) redis_timeout: Duration,
    pub(crate) fee_recipient: Address,
    pub(crate) build_delay: Duration,
    pub(crate) empty_block_delay: Duration,
    pub(crate) lease_ttl: Duration,
    pub(crate) lease_poll_interval: Duration,
    pub(crate) metrics_address: Option<SocketAddr>,
    pub(crate) log_format: LogFormat,
    pub(crate) log_filter: Option<String>,
    pub(crate) shutdown_timeout: Duration,
}

impl Args {
    pub(crate) fn resolve(self) -> eyre::Result<Config> {
        let file = match &self.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .wrap_err_with(|| format!("failed reading config file `{}`", path.display()))?;
                toml::from_str::<Settings>(&contents)
                    .wrap_err_with(|| format!("failed parsing config file `{}`", path.display()))?
            }
            None => Settings::default(),
        };
        let settings = self.settings.or(file);

        let instance_id = settings
            .instance_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| eyre!("`instance-id` is required and must not be empty"))?;
        let jwt_secret = settings
            .jwt_secret
            .ok_or_else(|| eyre!("`engine.jwt-secret` is required"))?;
        let jwt_secret = JwtSecret::from_hex(jwt_secret.trim())
            .wrap_err("`engine.jwt-secret` must be 32 hex encoded bytes")?;

        let config = Config {
            dev: self.dev,
            instance_id,
            engine_url: url(settings.engine_url.as_deref(), "http://127.0.0.1:8551", "engine.url")?,
            jwt_secret,
            rpc_url: url(settings.rpc_url.as_deref(), "http://127.0.0.1:8545", "engine.rpc-url")?,
            rpc_timeout: duration(settings.rpc_timeout, Duration::from_secs(30), "engine.timeout")?,
            redis_url: settings
                .redis_url
                .unwrap_or_else(|| "redis://127.0.0.1:7001".to_owned()),
            redis_timeout: duration(settings.redis_timeout, Duration::from_secs(5), "redis.timeout")?,
            fee_recipient: settings.fee_recipient.unwrap_or(Address::ZERO),
            build_delay: duration(settings.build_delay, Duration::from_millis(1), "builder.build-delay")?,
            empty_block_delay: duration(
                settings.empty_block_delay,
                Duration::from_secs(60),
                "builder.empty-block-delay",
            )?,
            lease_ttl: duration(settings.lease_ttl, Duration::from_millis(300), "lease.ttl")?,
            lease_poll_interval: duration(
                settings.lease_poll_interval,
                Duration::from_millis(100),
                "lease.poll-interval",
            )?,
            metrics_address: settings.metrics_address,
            log_format: settings.log_format.unwrap_or_default(),
            log_filter: settings.log_filter,
            shutdown_timeout: duration(
                settings.shutdown_timeout,
                Duration::from_secs(5),
                "shutdown-timeout",
            )?,
        };

        ensure!(
            config.lease_poll_interval < config.lease_ttl,
            "`lease.poll-interval` must be below `lease.ttl`, or the lease expires between renewals"
        );
        ensure!(!config.lease_poll_interval.is_zero(), "`lease.poll-interval` must not be zero");
        Ok(config)
    }
}

impl Config {
    pub(crate) fn engine_client(&self) -> ClientConfig {
        ClientConfig {
            engine_url: self.engine_url.clone(),
            rpc_url: self.rpc_url.clone(),
            jwt_secret: self.jwt_secret.clone(),
            timeout: self.rpc_timeout,
        }
    }

    pub(crate) fn block_builder(&self) -> tandem_block_builder::Config {
        tandem_block_builder::Config {
            fee_recipient: self.fee_recipient,
            build_delay: self.build_delay,
            empty_block_delay: self.empty_block_delay,
            ..Default::default()
        }
    }

    pub(crate) fn lease(&self) -> LeaseConfig {
        LeaseConfig {
            holder: self.instance_id.clone(),
            ttl: self.lease_ttl,
            poll_interval: self.lease_poll_interval,
        }
    }
}

fn url(value: Option<&str>, default: &str, name: &str) -> eyre::Result<Url> {
    let value = value.unwrap_or(default);
    value
        .parse()
        .wrap_err_with(|| format!("`{name}` is not a valid URL: `{value}`"))
}

fn duration(value: Option<SignedDuration>, default: Duration, name: &str) -> eyre::Result<Duration> {
    match value {
        Some(value) => {
            Duration::try_from(value).wrap_err_with(|| format!("`{name}` must not be negative"))
        }
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write as _, time::Duration};

    use clap::Parser as _;
    use tandem_telemetry_util::LogFormat;

    use super::Args;

    const SECRET: &str = "f79ae8046bc11c9927afe911db7143c51a806c4a537cc08e0d37140b0192f430";

    fn parse(args: &[&str]) -> eyre::Result<super::Config> {
        Args::try_parse_from(std::iter::once("tandem").chain(args.iter().copied()))?.resolve()
    }

    #[test]
    fn defaults_fill_everything_but_identity_and_secret() {
        let config = parse(&["--instance-id", "node-1", "--engine.jwt-secret", SECRET]).unwrap();
        assert_eq!(config.instance_id, "node-1");
        assert_eq!(config.engine_url.as_str(), "http://127.0.0.1:8551/");
        assert_eq!(config.redis_url, "redis://127.0.0.1:7001");
        assert_eq!(config.build_delay, Duration::from_millis(1));
        assert_eq!(config.empty_block_delay, Duration::from_secs(60));
        assert_eq!(config.lease_ttl, Duration::from_millis(300));
        assert_eq!(config.lease_poll_interval, Duration::from_millis(100));
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(!config.dev);
    }

    #[test]
    fn command_line_wins_over_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
instance_id = "from-file"
jwt_secret = "{SECRET}"
lease_ttl = "2s"
empty_block_delay = "30s"
log_format = "json"
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let config = parse(&["--config", path, "--lease.ttl", "1s"]).unwrap();
        assert_eq!(config.instance_id, "from-file");
        assert_eq!(config.lease_ttl, Duration::from_secs(1));
        assert_eq!(config.empty_block_delay, Duration::from_secs(30));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "instance = \"typo\"").unwrap();
        let path = file.path().to_str().unwrap();
        let error = parse(&["--config", path]).unwrap_err();
        assert!(format!("{error:#}").contains("failed parsing config file"), "{error:#}");
    }

    #[test]
    fn blank_instance_id_is_rejected() {
        let error = parse(&["--instance-id", " ", "--engine.jwt-secret", SECRET]).unwrap_err();
        assert!(error.to_string().contains("instance-id"), "{error}");
    }

    #[test]
    fn poll_interval_must_stay_below_ttl() {
        let error = parse(&[
            "--instance-id",
            "node-1",
            "--engine.jwt-secret",
            SECRET,
            "--lease.ttl",
            "100ms",
            "--lease.poll-interval",
            "100ms",
        ])
        .unwrap_err();
        assert!(error.to_string().contains("lease.poll-interval"), "{error}");
    }

    #[test]
    fn malformed_secret_is_rejected() {
        assert!(parse(&["--instance-id", "node-1", "--engine.jwt-secret", "abc"]).is_err());
    }
}
