//! Provision and supervise short-lived `near-sandbox` nodes for integration tests.
//!
//! ```text
//! Sandbox::start
//!   └─ Provisioned::provision   ensure binary, `init --fast` into a fresh home
//!        └─ configure           lock RPC + network ports, materialize genesis/config
//!             └─ launch         spawn `run`, poll GET /status until 2xx
//! Sandbox::stop / tear_down     SIGTERM → unlock ports → remove home
//! ```

mod account;
mod config;
mod error;
mod lock;
mod materialize;
mod paths;
mod platform;
mod port;
mod process;
mod provision;
mod readiness;
mod sandbox;

pub use account::{
    DEFAULT_ACCOUNT_ID, DEFAULT_PRIVATE_KEY, DEFAULT_PUBLIC_KEY, GenesisAccount, near_to_yocto,
};
pub use config::{ConfigError, SandboxConfig, Settings, env};
pub use error::{DumpError, ErrorKind, Result, SandboxError, TearDownError};
pub use lock::{FileLock, FileMutex, LockError, NamedMutex, RetryPolicy, acquire_with_retry};
pub use materialize::{DEFAULT_MAX_OPEN_FILES, DEFAULT_MAX_PAYLOAD_SIZE, apply_overrides};
pub use paths::{BINARY_NAME, HomePaths, InstallPaths, LockPaths};
pub use platform::{DEFAULT_VERSION, Platform};
pub use port::{LOCALHOST, PortAllocator, PortError, PortLease};
pub use process::{NodeProcess, ProcessError, ProcessExit, ProcessRunner};
pub use provision::{BinaryProvisioner, DownloadError, ProvisionError};
pub use readiness::{POLL_INTERVAL, ReadinessError, ReadinessProbe};
pub use sandbox::{Configured, Provisioned, Sandbox, StateDump};
