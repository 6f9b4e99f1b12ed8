use std::fmt;
use std::path::PathBuf;

use crate::config::ConfigError;
use crate::lock::LockError;
use crate::port::PortError;
use crate::process::ProcessError;
use crate::provision::ProvisionError;
use crate::readiness::ReadinessError;

/// Stable classification of [`SandboxError`], for callers that branch on the
/// failure rather than print it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidConfig,
    BinaryNotFound,
    DownloadFailed,
    RunningFailed,
    InstallationFailed,
    PortNotAvailable,
    LockFailed,
    PortAcquisitionFailed,
    InitializationFailed,
    RunFailed,
    DumpFailed,
    TearDownFailed,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("create work directory: {0}")]
    WorkDir(#[source] std::io::Error),

    #[error("initialize node home: {0}")]
    Initialization(#[source] ProcessError),

    #[error("start node: {0}")]
    Spawn(#[source] ProcessError),

    #[error("node failed to start: {0}")]
    RunFailed(#[from] ReadinessError),

    #[error("dump state: {0}")]
    Dump(#[from] DumpError),

    #[error("tear down: {}", ErrorList(.0))]
    TearDownFailed(Vec<TearDownError>),

    #[error("sandbox start cancelled")]
    Cancelled,
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::InvalidConfig,
            Self::Provision(e) => match e {
                ProvisionError::BinaryNotFound { .. } => ErrorKind::BinaryNotFound,
                ProvisionError::LockFailed(LockError::Cancelled { .. }) => ErrorKind::Cancelled,
                ProvisionError::LockFailed(_) => ErrorKind::LockFailed,
                ProvisionError::UnsupportedPlatform { .. }
                | ProvisionError::DownloadFailed { .. }
                | ProvisionError::Client(_) => ErrorKind::DownloadFailed,
                ProvisionError::RunningFailed { .. } => ErrorKind::RunningFailed,
                ProvisionError::InstallationFailed { .. } => ErrorKind::InstallationFailed,
            },
            Self::Port(e) => match e {
                PortError::PortNotAvailable { .. } => ErrorKind::PortNotAvailable,
                PortError::LockFailed { .. } => ErrorKind::LockFailed,
                PortError::PortAcquisitionFailed { .. } => ErrorKind::PortAcquisitionFailed,
            },
            Self::WorkDir(_) | Self::Initialization(_) => ErrorKind::InitializationFailed,
            Self::Spawn(_) => ErrorKind::RunFailed,
            Self::RunFailed(ReadinessError::Cancelled) | Self::Cancelled => ErrorKind::Cancelled,
            Self::RunFailed(_) => ErrorKind::RunFailed,
            Self::Dump(_) => ErrorKind::DumpFailed,
            Self::TearDownFailed(_) => ErrorKind::TearDownFailed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Read(#[from] ConfigError),
}

/// One failed step of `stop`/`tear_down`. Later steps still run.
#[derive(Debug, thiserror::Error)]
pub enum TearDownError {
    #[error("terminate node: {0}")]
    Terminate(#[source] ProcessError),

    #[error("unlock port {port}: {source}")]
    Unlock {
        port: u16,
        #[source]
        source: PortError,
    },

    #[error("remove {}: {source}", .path.display())]
    RemoveHome {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

struct ErrorList<'a>(&'a [TearDownError]);

impl fmt::Display for ErrorList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
