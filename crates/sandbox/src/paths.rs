use std::path::{Path, PathBuf};

/// File name of the node executable inside an install directory.
pub const BINARY_NAME: &str = "near-sandbox";

/// Per-version install layout: `<download_dir>/near-sandbox-<version>/near-sandbox`.
pub struct InstallPaths {
    install_dir: PathBuf,
}

impl InstallPaths {
    pub fn new(download_dir: &Path, version: &str) -> Self {
        Self {
            install_dir: download_dir.join(format!("{BINARY_NAME}-{version}")),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn binary(&self) -> PathBuf {
        self.install_dir.join(BINARY_NAME)
    }

    /// Install lock beside the binary: `<binary>.lock`.
    pub fn install_lock(&self) -> PathBuf {
        self.install_dir.join(format!("{BINARY_NAME}.lock"))
    }
}

/// Shared lock directory for port leases.
pub struct LockPaths {
    dir: PathBuf,
}

impl LockPaths {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn port(&self, port: u16) -> PathBuf {
        self.dir.join(format!("near-sandbox-port-{port}.lock"))
    }
}

/// Layout of a node home (work) directory.
pub struct HomePaths {
    home: PathBuf,
}

impl HomePaths {
    pub fn new(home: PathBuf) -> Self {
        Self { home }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config(&self) -> PathBuf {
        self.home.join("config.json")
    }

    pub fn genesis(&self) -> PathBuf {
        self.home.join("genesis.json")
    }

    pub fn node_key(&self) -> PathBuf {
        self.home.join("node_key.json")
    }

    pub fn validator_key(&self) -> PathBuf {
        self.home.join("validator_key.json")
    }

    /// Signer key file written for each genesis account.
    pub fn account_key(&self, account_id: &str) -> PathBuf {
        self.home.join(format!("{account_id}.json"))
    }

    /// Directory the node's `dump-state` writes into.
    pub fn dump_dir(&self) -> PathBuf {
        self.home.join("output")
    }

    pub fn dump_file(&self, name: &str) -> PathBuf {
        self.dump_dir().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_paths_are_stable_per_version() {
        let base = Path::new("/opt/near");
        let a = InstallPaths::new(base, "2.6.5");
        let b = InstallPaths::new(base, "2.6.5");
        assert_eq!(a.binary(), b.binary());
        assert_eq!(
            a.binary(),
            PathBuf::from("/opt/near/near-sandbox-2.6.5/near-sandbox")
        );
        assert_eq!(
            a.install_lock(),
            PathBuf::from("/opt/near/near-sandbox-2.6.5/near-sandbox.lock")
        );

        let other = InstallPaths::new(base, "2.7.0");
        assert_ne!(a.install_dir(), other.install_dir());
    }

    #[test]
    fn port_lock_named_by_port() {
        let locks = LockPaths::new(PathBuf::from("/tmp"));
        assert_eq!(
            locks.port(3030),
            PathBuf::from("/tmp/near-sandbox-port-3030.lock")
        );
    }

    #[test]
    fn home_layout() {
        let home = HomePaths::new(PathBuf::from("/work"));
        assert_eq!(
            home.account_key("alice.near"),
            PathBuf::from("/work/alice.near.json")
        );
        assert_eq!(
            home.dump_file("records.json"),
            PathBuf::from("/work/output/records.json")
        );
    }
}
