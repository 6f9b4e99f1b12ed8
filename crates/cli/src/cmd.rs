use std::ffi::OsString;
use std::process::{ExitCode, ExitStatus};

use clap::Args;
use near_sandbox::{
    BinaryProvisioner, ConfigError, DEFAULT_VERSION, ProcessError, ProcessRunner, ProvisionError,
    Sandbox, SandboxConfig, SandboxError, Settings,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// near-sandbox version to run
    #[arg(long = "node-version", env = "NEAR_SANDBOX_VERSION", default_value = DEFAULT_VERSION)]
    pub version: String,

    /// Arguments passed through to the binary (defaults to `--help`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<OsString>,
}

#[derive(Debug, Args)]
pub struct StartArgs {
    /// RPC port (any free port when omitted)
    #[arg(long)]
    pub rpc_port: Option<u16>,

    /// Network port (any free port when omitted)
    #[arg(long)]
    pub net_port: Option<u16>,

    /// near-sandbox version to start
    #[arg(long, env = "NEAR_SANDBOX_VERSION", default_value = DEFAULT_VERSION)]
    pub version: String,

    /// Keep the node home on exit instead of deleting it
    #[arg(long)]
    pub keep_home: bool,
}

#[derive(Debug, Args)]
pub struct InstallArgs {
    /// near-sandbox version to install
    #[arg(long, env = "NEAR_SANDBOX_VERSION", default_value = DEFAULT_VERSION)]
    pub version: String,
}

pub async fn run(args: RunArgs) -> CliResult<ExitCode> {
    let settings = Settings::from_env()?;
    let binary = BinaryProvisioner::new(&settings)?
        .ensure(&args.version, &CancellationToken::new())
        .await?;

    let mut passthrough = args.args;
    if passthrough.is_empty() {
        passthrough.push("--help".into());
    }
    let status = ProcessRunner::new(binary, settings.debug_logs)
        .run_passthrough(&passthrough)
        .await?;
    Ok(ExitCode::from(exit_byte(status)))
}

pub async fn start(args: StartArgs) -> CliResult<()> {
    let settings = Settings::from_env()?;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            () = recv_signal(&mut sigterm) => info!("received SIGTERM, shutting down"),
            () = recv_signal(&mut sigint) => info!("received SIGINT, shutting down"),
        }
        trigger.cancel();
    });

    let config = SandboxConfig {
        rpc_port: args.rpc_port,
        net_port: args.net_port,
        ..SandboxConfig::default()
    };
    let sandbox = Sandbox::start_with(&config, &args.version, &settings, &cancel).await?;
    println!("rpc: {}", sandbox.rpc_url());
    println!("home: {}", sandbox.home_dir().display());

    tokio::select! {
        () = cancel.cancelled() => {}
        exit = sandbox.wait_exit() => warn!(%exit, "node exited on its own"),
    }

    if args.keep_home {
        let home = sandbox.stop().await?;
        info!(home = %home.display(), "sandbox stopped, home kept");
    } else {
        sandbox.tear_down().await?;
    }
    Ok(())
}

pub async fn install(args: InstallArgs) -> CliResult<()> {
    let settings = Settings::from_env()?;
    let path = BinaryProvisioner::new(&settings)?
        .ensure(&args.version, &CancellationToken::new())
        .await?;
    println!("{}", path.display());
    Ok(())
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Mirror the child's exit code; signals and out-of-range codes map to 1.
fn exit_byte(status: ExitStatus) -> u8 {
    status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    #[test]
    fn exit_code_mirrors_child() {
        assert_eq!(exit_byte(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_byte(ExitStatus::from_raw(3 << 8)), 3);
        // Killed by SIGKILL.
        assert_eq!(exit_byte(ExitStatus::from_raw(9)), 1);
    }
}
