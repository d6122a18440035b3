use std::path::PathBuf;

/// Failure taxonomy shared by the provisioner, the supervisor and the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Release listing or artifact download failed.
    #[error("network error: {0}")]
    Network(String),

    /// An external utility (xz, tar, scp, ssh) could not run or exited non-zero.
    #[error("process error: {0}")]
    Process(String),

    /// Host platform/architecture has no published emulator build.
    #[error("unsupported host: {os}/{arch}")]
    Detection { os: String, arch: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("config error at {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable code, used in logs and client acknowledgements.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Process(_) => "process_error",
            Self::Detection { .. } => "detection_error",
            Self::Validation(_) => "validation_error",
            Self::Config { .. } => "config_error",
            Self::Io { .. } => "io_error",
        }
    }
}
