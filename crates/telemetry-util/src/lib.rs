//! Tracing setup and event-field helpers shared by the tandem crates.

use std::{error::Error, fmt, str::FromStr, time::Duration};

use eyre::WrapErr as _;
use tracing::field::DisplayValue;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

/// Filter used when neither `--log.filter` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "info";

/// How log lines are rendered on stderr.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(eyre::eyre!(
                "unknown log format `{other}`, expected `text` or `json`"
            )),
        }
    }
}

/// Installs the global tracing subscriber.
///
/// `filter` takes precedence over `RUST_LOG`; if both are absent
/// [`DEFAULT_FILTER`] is used.
pub fn init_tracing(format: LogFormat, filter: Option<&str>) -> eyre::Result<()> {
    let filter = match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .wrap_err_with(|| format!("invalid log filter `{directives}`"))?,
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
            .wrap_err("failed constructing default log filter")?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NONE)
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
    installed.map_err(|e| eyre::eyre!("failed installing tracing subscriber: {e}"))
}

/// Renders a [`Duration`] with compact unit designators at millisecond
/// precision, e.g. `1s 500ms`. Durations past [`jiff::SignedDuration::MAX`]
/// print as that maximum.
///
/// ```
/// use tandem_telemetry_util::display_duration;
///
/// let wait = std::time::Duration::from_millis(1500);
/// tracing::info!(retry_after = %display_duration(wait), "backing off");
/// ```
pub fn display_duration(duration: Duration) -> impl fmt::Display {
    use jiff::{
        SignedDuration,
        fmt::friendly::{Designator, SpanPrinter},
    };
    static PRINTER: SpanPrinter = SpanPrinter::new().designator(Designator::Compact);

    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    let duration = SignedDuration::try_from(Duration::from_millis(millis))
        .unwrap_or(SignedDuration::MAX);
    PRINTER.duration_to_string(&duration)
}

/// Records an error as a tracing field, rendered as its message followed by
/// every source, separated by `: `.
///
/// Accepts typed errors as well as [`eyre::Report`].
///
/// ```
/// use eyre::WrapErr as _;
/// use tandem_telemetry_util::error_field;
///
/// let result: eyre::Result<()> = Err(std::io::Error::from(std::io::ErrorKind::TimedOut))
///     .wrap_err("engine did not answer");
/// if let Err(error) = result {
///     tracing::warn!(error = error_field(&error), "request failed");
/// }
/// ```
pub fn error_field<E, Kind>(error: &E) -> DisplayValue<ErrorChain<'_>>
where
    E: ChainRoot<Kind>,
{
    tracing::field::display(ErrorChain(error.chain_root()))
}

/// An error and its sources, displayed on one line.
pub struct ErrorChain<'a>(&'a (dyn Error + 'static));

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        for cause in std::iter::successors(self.0.source(), |&cause| cause.source()) {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

/// Anything [`error_field`] can start an error chain from.
///
/// `Kind` is one of the [`kind`] markers; it keeps the impl for std errors
/// apart from the one for [`eyre::Report`].
pub trait ChainRoot<Kind> {
    fn chain_root(&self) -> &(dyn Error + 'static);
}

#[doc(hidden)]
pub mod kind {
    pub struct Std;
    pub struct Report;
}

impl<E: Error + 'static> ChainRoot<kind::Std> for E {
    fn chain_root(&self) -> &(dyn Error + 'static) {
        self
    }
}

impl ChainRoot<kind::Report> for eyre::Report {
    fn chain_root(&self) -> &(dyn Error + 'static) {
        AsRef::<dyn Error>::as_ref(self)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use eyre::WrapErr as _;

    use super::{LogFormat, display_duration, error_field};

    #[test]
    fn log_format_parses_known_values() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn durations_use_compact_designators() {
        assert_eq!(display_duration(Duration::from_millis(1500)).to_string(), "1s 500ms");
        assert_eq!(display_duration(Duration::from_secs(60)).to_string(), "1m");
    }

    #[test]
    fn jittered_durations_drop_sub_millisecond_noise() {
        assert_eq!(display_duration(Duration::from_micros(153_827)).to_string(), "153ms");
        assert_eq!(display_duration(Duration::ZERO).to_string(), "0s");
    }

    #[test]
    fn error_field_renders_the_whole_chain() {
        let report = Err::<(), _>(std::io::Error::from(std::io::ErrorKind::NotFound))
            .wrap_err("failed opening config")
            .wrap_err("failed to start node")
            .unwrap_err();
        assert_eq!(
            format!("{:?}", error_field(&report)),
            "failed to start node: failed opening config: entity not found",
        );

        let io = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(format!("{:?}", error_field(&io)), "timed out");
    }
}
