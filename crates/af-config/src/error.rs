use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config file {}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
