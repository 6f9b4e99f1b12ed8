//! Sandbox lifecycle.
//!
//! Startup is split into consuming stages so the order cannot be violated:
//! [`Provisioned`] (binary ready, home initialized) → [`Configured`] (ports
//! leased, home rewritten) → [`Sandbox`] (node running and answering RPC).
//! A home is only ever configured once, and only a configured home is run.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SandboxConfig, Settings};
use crate::error::{DumpError, Result, SandboxError, TearDownError};
use crate::materialize::{apply_overrides, read_json};
use crate::paths::HomePaths;
use crate::platform::DEFAULT_VERSION;
use crate::port::{PortAllocator, PortLease};
use crate::process::{NodeProcess, ProcessExit, ProcessRunner};
use crate::provision::BinaryProvisioner;
use crate::readiness::ReadinessProbe;

/// Binary in place and a fresh home initialized with `init --fast`.
pub struct Provisioned {
    settings: Settings,
    runner: ProcessRunner,
    home: HomePaths,
}

impl Provisioned {
    pub async fn provision(
        version: &str,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let binary = BinaryProvisioner::new(settings)?
            .ensure(version, cancel)
            .await?;
        let home = tempfile::Builder::new()
            .prefix("near-sandbox-")
            .tempdir()
            .map_err(SandboxError::WorkDir)?
            .keep();

        let runner = ProcessRunner::new(binary, settings.debug_logs);
        if let Err(e) = runner.initialize(&home).await {
            warn!(home = %home.display(), "init failed, keeping home for inspection");
            return Err(SandboxError::Initialization(e));
        }
        Ok(Self {
            settings: settings.clone(),
            runner,
            home: HomePaths::new(home),
        })
    }

    pub fn home_dir(&self) -> &Path {
        self.home.home()
    }

    pub fn binary(&self) -> &Path {
        self.runner.binary()
    }

    /// Lease both ports and rewrite genesis/config for `config`.
    pub async fn configure(self, config: &SandboxConfig) -> Result<Configured> {
        let rpc_port = config.rpc_port.filter(|&p| p != 0);
        let net_port = config.net_port.filter(|&p| p != 0);
        if rpc_port.is_some() && rpc_port == net_port {
            return Err(ConfigError::Invalid(format!(
                "rpc and network ports must differ (both {})",
                rpc_port.unwrap_or_default()
            ))
            .into());
        }

        let ports = PortAllocator::new(self.settings.lock_dir.clone());
        let (rpc, net) = tokio::join!(
            ports.acquire_or_lock(rpc_port),
            ports.acquire_or_lock(net_port)
        );
        let (rpc, net) = match (rpc, net) {
            (Ok(rpc), Ok(net)) => (rpc, net),
            (Ok(held), Err(e)) | (Err(e), Ok(held)) => {
                release_quietly(&ports, held).await;
                return Err(e.into());
            }
            (Err(e), Err(_)) => return Err(e.into()),
        };

        if let Err(e) = apply_overrides(&self.home, config, &self.settings).await {
            release_quietly(&ports, rpc).await;
            release_quietly(&ports, net).await;
            return Err(e.into());
        }
        debug!(rpc = rpc.port(), net = net.port(), "sandbox configured");

        Ok(Configured {
            settings: self.settings,
            runner: self.runner,
            home: self.home,
            ports,
            rpc,
            net,
        })
    }
}

/// Ports leased and home rewritten; ready to run.
pub struct Configured {
    settings: Settings,
    runner: ProcessRunner,
    home: HomePaths,
    ports: PortAllocator,
    rpc: PortLease,
    net: PortLease,
}

impl Configured {
    pub fn home_dir(&self) -> &Path {
        self.home.home()
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc.port()
    }

    pub fn net_port(&self) -> u16 {
        self.net.port()
    }

    /// Spawn the node and wait for `/status`. On failure the node is stopped
    /// and the ports released; the home is left on disk.
    pub async fn launch(self, cancel: &CancellationToken) -> Result<Sandbox> {
        let Self {
            settings,
            runner,
            home,
            ports,
            rpc,
            net,
        } = self;
        let rpc_url = format!("http://{}", rpc.addr());

        let node = match runner
            .spawn_node(home.home(), &rpc.addr(), &net.addr())
            .await
        {
            Ok(node) => node,
            Err(e) => {
                abandon(&ports, rpc, net, &home).await;
                return Err(SandboxError::Spawn(e));
            }
        };

        let ready = match ReadinessProbe::new(&rpc_url, settings.rpc_timeout) {
            Ok(probe) => probe.wait(&node, cancel).await,
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            if let Err(term) = node.terminate().await {
                warn!(error = %term, "terminate node after failed start");
            }
            drop(node);
            abandon(&ports, rpc, net, &home).await;
            return Err(e.into());
        }

        info!(
            rpc_url = %rpc_url,
            pid = node.pid(),
            home = %home.home().display(),
            "sandbox ready"
        );
        Ok(Sandbox {
            rpc_url,
            runner,
            home,
            ports,
            rpc,
            net,
            node,
        })
    }
}

/// Output of [`Sandbox::dump`]. `genesis.records` holds the full state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateDump {
    pub genesis: Value,
    pub config: Value,
    pub node_key: Value,
    pub validator_key: Value,
}

/// A running node with its ports and home.
///
/// Dropping it kills the node and unlocks the ports but leaves the home on
/// disk; use [`Sandbox::tear_down`] to remove everything.
pub struct Sandbox {
    rpc_url: String,
    runner: ProcessRunner,
    home: HomePaths,
    ports: PortAllocator,
    rpc: PortLease,
    net: PortLease,
    node: NodeProcess,
}

impl Sandbox {
    /// Start with settings from the environment and the default node version.
    pub async fn start(config: &SandboxConfig) -> Result<Self> {
        let settings = Settings::from_env()?;
        Self::start_with(
            config,
            DEFAULT_VERSION,
            &settings,
            &CancellationToken::new(),
        )
        .await
    }

    pub async fn start_with(
        config: &SandboxConfig,
        version: &str,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let provisioned = Provisioned::provision(version, settings, cancel).await?;
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        let configured = provisioned.configure(config).await?;
        configured.launch(cancel).await
    }

    /// `http://127.0.0.1:<rpc_port>`
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn home_dir(&self) -> &Path {
        self.home.home()
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc.port()
    }

    pub fn net_port(&self) -> u16 {
        self.net.port()
    }

    pub fn rpc_lock_file(&self) -> &Path {
        self.rpc.lock_file()
    }

    pub fn net_lock_file(&self) -> &Path {
        self.net.lock_file()
    }

    pub fn pid(&self) -> Option<u32> {
        self.node.pid()
    }

    pub fn try_exit(&self) -> Option<ProcessExit> {
        self.node.try_exit()
    }

    /// Resolves when the node exits on its own.
    pub async fn wait_exit(&self) -> ProcessExit {
        self.node.wait_exit().await
    }

    /// Export state with `view-state dump-state` and fold the streamed
    /// records back into genesis.
    pub async fn dump(&self) -> Result<StateDump> {
        self.runner
            .dump_state(self.home.home())
            .await
            .map_err(DumpError::from)?;

        let [genesis, config, node_key, validator_key, records] = [
            "genesis.json",
            "config.json",
            "node_key.json",
            "validator_key.json",
            "records.json",
        ]
        .map(|name| self.home.dump_file(name));
        let (mut genesis, config, node_key, validator_key, records) = tokio::try_join!(
            read_json(&genesis),
            read_json(&config),
            read_json(&node_key),
            read_json(&validator_key),
            read_json(&records),
        )
        .map_err(DumpError::from)?;
        append_records(&mut genesis, records).map_err(DumpError::from)?;

        Ok(StateDump {
            genesis,
            config,
            node_key,
            validator_key,
        })
    }

    /// Kill the node and unlock both ports. Returns the home, which is kept.
    pub async fn stop(self) -> Result<PathBuf> {
        let Self {
            home,
            ports,
            rpc,
            net,
            node,
            ..
        } = self;
        let errors = shutdown(node, &ports, rpc, net).await;
        if errors.is_empty() {
            Ok(home.home().to_path_buf())
        } else {
            Err(SandboxError::TearDownFailed(errors))
        }
    }

    /// [`stop`](Self::stop), then delete the home.
    pub async fn tear_down(self) -> Result<()> {
        let Self {
            home,
            ports,
            rpc,
            net,
            node,
            ..
        } = self;
        let mut errors = shutdown(node, &ports, rpc, net).await;
        match tokio::fs::remove_dir_all(home.home()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(home = %home.home().display(), "home already removed");
            }
            Err(source) => errors.push(TearDownError::RemoveHome {
                path: home.home().to_path_buf(),
                source,
            }),
        }
        if errors.is_empty() {
            info!(home = %home.home().display(), "sandbox torn down");
            Ok(())
        } else {
            Err(SandboxError::TearDownFailed(errors))
        }
    }
}

/// Terminate, then unlock. Every step runs even if an earlier one fails.
async fn shutdown(
    node: NodeProcess,
    ports: &PortAllocator,
    rpc: PortLease,
    net: PortLease,
) -> Vec<TearDownError> {
    let mut errors = Vec::new();
    match node.terminate().await {
        Ok(exit) => debug!(%exit, "node stopped"),
        Err(e) => errors.push(TearDownError::Terminate(e)),
    }
    drop(node);

    for lease in [rpc, net] {
        let port = lease.port();
        if let Err(source) = ports.release(lease).await {
            errors.push(TearDownError::Unlock { port, source });
        }
    }
    errors
}

async fn abandon(ports: &PortAllocator, rpc: PortLease, net: PortLease, home: &HomePaths) {
    release_quietly(ports, rpc).await;
    release_quietly(ports, net).await;
    warn!(home = %home.home().display(), "sandbox failed to start, keeping home for inspection");
}

async fn release_quietly(ports: &PortAllocator, lease: PortLease) {
    let port = lease.port();
    if let Err(e) = ports.release(lease).await {
        warn!(port, error = %e, "release port lease");
    }
}

/// Append dumped `records` to `genesis.records`, creating it if absent.
fn append_records(genesis: &mut Value, records: Value) -> std::result::Result<(), ConfigError> {
    let Value::Array(records) = records else {
        return Err(ConfigError::Invalid(
            "dumped records is not an array".into(),
        ));
    };
    let obj = genesis
        .as_object_mut()
        .ok_or_else(|| ConfigError::Invalid("dumped genesis is not a JSON object".into()))?;
    match obj
        .entry("records")
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(existing) => {
            existing.extend(records);
            Ok(())
        }
        _ => Err(ConfigError::Invalid(
            "dumped genesis records is not an array".into(),
        )),
    }
}
