//! Log output for the `jamrtc` binary.
//!
//! Verbosity runs on a 0-7 scale: 0 silences everything, 4 is informational,
//! 6 traces jamrtc itself and 7 also traces the WebRTC and WebSocket stacks.
//! Single engine layers can be pinned to their own level with `layer=level`
//! overrides. `JAMRTC_LOG_FILTER` replaces the computed filter outright.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use clap::ValueEnum;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const FILTER_ENV: &str = "JAMRTC_LOG_FILTER";

/// Crates whose events follow the overall verbosity. Directives match by
/// prefix, so `jamrtc` also covers the `jamrtc_core` library.
const OWN_TARGETS: &[&str] = &["jamrtc", "janus_proto"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Verbosity(u8);

impl Verbosity {
    pub const MAX: u8 = 7;

    /// Levels above [`Verbosity::MAX`] are clamped.
    pub fn new(level: u8) -> Self {
        Self(level.min(Self::MAX))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn own_filter(self) -> LevelFilter {
        match self.0 {
            0 => LevelFilter::OFF,
            1 | 2 => LevelFilter::ERROR,
            3 => LevelFilter::WARN,
            4 => LevelFilter::INFO,
            5 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Dependencies stay at `warn` until the top of the scale.
    pub fn dependency_filter(self) -> LevelFilter {
        if self.0 == Self::MAX {
            LevelFilter::TRACE
        } else {
            self.own_filter().min(LevelFilter::WARN)
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Self(4)
    }
}

/// Engine layers that can be tuned on their own, by library module path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Layer {
    Engine,
    Transport,
    Directory,
    Media,
    Render,
}

impl Layer {
    pub fn target(self) -> &'static str {
        match self {
            Layer::Engine => "jamrtc_core::engine",
            Layer::Transport => "jamrtc_core::transport",
            Layer::Directory => "jamrtc_core::directory",
            Layer::Media => "jamrtc_core::media",
            Layer::Render => "jamrtc_core::render",
        }
    }
}

/// A `layer=level` override such as `transport=trace` or `engine=6`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerLevel {
    pub layer: Layer,
    pub level: LevelFilter,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayerLevelError {
    #[error("expected LAYER=LEVEL, got {0:?}")]
    Syntax(String),
    #[error("unknown layer {0:?}")]
    Layer(String),
    #[error("unknown level {0:?}; use 0-7 or a level name")]
    Level(String),
}

impl FromStr for LayerLevel {
    type Err = LayerLevelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (layer, level) = raw
            .split_once('=')
            .ok_or_else(|| LayerLevelError::Syntax(raw.to_string()))?;
        let layer = <Layer as ValueEnum>::from_str(layer.trim(), true)
            .map_err(|_| LayerLevelError::Layer(layer.trim().to_string()))?;
        let level = level.trim();
        let level = match level.parse::<u8>() {
            Ok(numeric) if numeric <= Verbosity::MAX => Verbosity(numeric).own_filter(),
            Ok(_) => return Err(LayerLevelError::Level(level.to_string())),
            Err(_) => level
                .parse::<LevelFilter>()
                .map_err(|_| LayerLevelError::Level(level.to_string()))?,
        };
        Ok(Self { layer, level })
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub verbosity: Verbosity,
    pub layers: Vec<LayerLevel>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("failed to install logger: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

fn level_name(level: LevelFilter) -> &'static str {
    [
        (LevelFilter::OFF, "off"),
        (LevelFilter::ERROR, "error"),
        (LevelFilter::WARN, "warn"),
        (LevelFilter::INFO, "info"),
        (LevelFilter::DEBUG, "debug"),
    ]
    .into_iter()
    .find_map(|(known, name)| (known == level).then_some(name))
    .unwrap_or("trace")
}

/// `EnvFilter` directives for `config`; layer overrides come last.
pub fn directives(config: &LogConfig) -> String {
    let own = level_name(config.verbosity.own_filter());
    let mut directives = vec![level_name(config.verbosity.dependency_filter()).to_string()];
    directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={own}")));
    directives.extend(
        config
            .layers
            .iter()
            .map(|layer| format!("{}={}", layer.layer.target(), level_name(layer.level))),
    );
    directives.join(",")
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let filter = match std::env::var(FILTER_ENV) {
        Ok(raw) => EnvFilter::try_new(raw)?,
        Err(_) => EnvFilter::try_new(directives(config))?,
    };
    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    let level = config.verbosity.get();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(config.file.is_none())
                .with_target(level >= 5)
                .with_thread_names(level >= 6),
        )
        .try_init()?;
    let _ = GUARD.set(guard);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: u8) -> LogConfig {
        LogConfig {
            verbosity: Verbosity::new(level),
            ..LogConfig::default()
        }
    }

    #[test]
    fn default_is_informational_with_quiet_dependencies() {
        assert_eq!(directives(&LogConfig::default()), "warn,jamrtc=info,janus_proto=info");
    }

    #[test]
    fn scale_ends() {
        assert_eq!(directives(&config(0)), "off,jamrtc=off,janus_proto=off");
        assert_eq!(directives(&config(6)), "warn,jamrtc=trace,janus_proto=trace");
        assert_eq!(directives(&config(7)), "trace,jamrtc=trace,janus_proto=trace");
        assert_eq!(Verbosity::new(12).get(), Verbosity::MAX);
    }

    #[test]
    fn layer_overrides_parse_names_and_numbers() {
        assert_eq!(
            "transport=trace".parse::<LayerLevel>(),
            Ok(LayerLevel {
                layer: Layer::Transport,
                level: LevelFilter::TRACE
            })
        );
        assert_eq!(
            "Engine = 2".parse::<LayerLevel>(),
            Ok(LayerLevel {
                layer: Layer::Engine,
                level: LevelFilter::ERROR
            })
        );
        assert!(matches!("engine".parse::<LayerLevel>(), Err(LayerLevelError::Syntax(_))));
        assert!(matches!("jack=info".parse::<LayerLevel>(), Err(LayerLevelError::Layer(_))));
        assert!(matches!("media=9".parse::<LayerLevel>(), Err(LayerLevelError::Level(_))));
        assert!(matches!("media=loud".parse::<LayerLevel>(), Err(LayerLevelError::Level(_))));
    }

    #[test]
    fn layer_overrides_follow_the_base_filter() {
        let mut config = config(3);
        config.layers = vec![
            "transport=trace".parse().expect("override"),
            "directory=0".parse().expect("override"),
        ];
        assert_eq!(
            directives(&config),
            "warn,jamrtc=warn,janus_proto=warn,jamrtc_core::transport=trace,jamrtc_core::directory=off"
        );
    }
}
