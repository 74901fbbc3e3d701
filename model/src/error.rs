use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
pub struct Error(OpaqueError);
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum OpaqueError {
    #[snafu(display("Unable to read settings from the environment: {}", source))]
    EnvSettings { source: envy::Error },

    #[snafu(display("Invalid node IP '{}': {}", value, source))]
    InvalidNodeIp {
        value: String,
        source: std::net::AddrParseError,
    },

    #[snafu(display("Unable to read manifest '{}': {}", path.display(), source))]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to parse manifest '{}': {}", path.display(), source))]
    ManifestParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("Manifest '{}' is a '{}', expected a ConfigMap", path.display(), kind))]
    ManifestKind { path: PathBuf, kind: String },

    #[snafu(display("Unable to read config file '{}': {}", path.display(), source))]
    ShellConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
}
