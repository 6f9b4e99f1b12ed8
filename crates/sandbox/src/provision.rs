//! Locate, download and verify the `near-sandbox` executable.
//!
//! Installs are per version under `<download_dir>/near-sandbox-<version>/`.
//! Concurrent installers serialize on `near-sandbox.lock` in that directory
//! and re-check for the binary once they hold it, so only the first process
//! downloads. A binary only reaches its final path after it has passed the
//! health check in staging, so its existence means it is runnable.

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::lock::{FileMutex, LockError, NamedMutex, RetryPolicy, acquire_with_retry};
use crate::paths::{BINARY_NAME, InstallPaths};
use crate::platform::Platform;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("near-sandbox binary not found at {}", .path.display())]
    BinaryNotFound { path: PathBuf },

    #[error("no near-sandbox build for {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("install lock: {0}")]
    LockFailed(#[source] LockError),

    #[error("download {url}: {source}")]
    DownloadFailed {
        url: String,
        #[source]
        source: DownloadError,
    },

    #[error("health check of {} failed: {detail}", .path.display())]
    RunningFailed { path: PathBuf, detail: String },

    #[error("install {step} at {}: {source}", .path.display())]
    InstallationFailed {
        step: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build http client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("extract archive: {0}")]
    Extract(#[source] std::io::Error),

    #[error("extract task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub struct BinaryProvisioner<M: NamedMutex = FileMutex> {
    bin_override: Option<PathBuf>,
    download_dir: PathBuf,
    artifact_url: Option<String>,
    retry: RetryPolicy,
    client: reqwest::Client,
    mutex: M,
}

impl BinaryProvisioner<FileMutex> {
    pub fn new(settings: &Settings) -> Result<Self, ProvisionError> {
        Self::with_mutex(settings, FileMutex)
    }
}

impl<M: NamedMutex> BinaryProvisioner<M> {
    /// Coordinate installs through `mutex` instead of lock files.
    pub fn with_mutex(settings: &Settings, mutex: M) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(ProvisionError::Client)?;
        Ok(Self {
            bin_override: settings.bin_path.clone(),
            download_dir: settings.download_dir.clone(),
            artifact_url: settings.artifact_url.clone(),
            retry: settings.install_retry,
            client,
            mutex,
        })
    }

    /// Where `version` lives once installed. Ignores the override path.
    pub fn install_paths(&self, version: &str) -> InstallPaths {
        InstallPaths::new(&self.download_dir, version)
    }

    /// Return a runnable executable for `version`, installing it if needed.
    pub async fn ensure(
        &self,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ProvisionError> {
        if let Some(path) = &self.bin_override {
            if !is_file(path).await {
                return Err(ProvisionError::BinaryNotFound { path: path.clone() });
            }
            debug!(path = %path.display(), "using near-sandbox override");
            return Ok(path.clone());
        }

        let paths = self.install_paths(version);
        let binary = paths.binary();
        if is_file(&binary).await {
            debug!(path = %binary.display(), version, "near-sandbox already installed");
            return Ok(binary);
        }

        tokio::fs::create_dir_all(paths.install_dir())
            .await
            .map_err(|source| ProvisionError::InstallationFailed {
                step: "create directory",
                path: paths.install_dir().to_path_buf(),
                source,
            })?;

        let lock = acquire_with_retry(&self.mutex, &paths.install_lock(), &self.retry, cancel)
            .await
            .map_err(ProvisionError::LockFailed)?;
        let result = self.install(&paths, version).await;
        if let Err(e) = self.mutex.release(lock).await {
            warn!(error = %e, "release install lock");
        }
        result
    }

    /// Runs under the install lock. The install directory holds the lock file
    /// and is never removed here; a rejected binary goes away with staging.
    async fn install(
        &self,
        paths: &InstallPaths,
        version: &str,
    ) -> Result<PathBuf, ProvisionError> {
        let binary = paths.binary();
        if is_file(&binary).await {
            info!(version, "near-sandbox installed by another process");
            return Ok(binary);
        }

        let url = match &self.artifact_url {
            Some(url) => url.clone(),
            None => Platform::detect()?.artifact_url(version),
        };
        info!(%url, version, "downloading near-sandbox");
        let (staging, extracted) = self.download(&url, paths).await?;

        set_executable(&extracted).await?;
        health_check(&extracted).await?;
        rename_into_place(&extracted, &binary).await?;
        drop(staging);

        info!(path = %binary.display(), version, "near-sandbox installed");
        Ok(binary)
    }

    /// Fetch and unpack into a staging directory next to the install. Returns
    /// the staging guard and the unpacked executable inside it.
    async fn download(
        &self,
        url: &str,
        paths: &InstallPaths,
    ) -> Result<(tempfile::TempDir, PathBuf), ProvisionError> {
        let failed = |source: DownloadError| ProvisionError::DownloadFailed {
            url: url.to_string(),
            source,
        };

        // Staging lives next to the target so the final rename stays on one filesystem.
        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempdir_in(paths.install_dir())
            .map_err(|source| ProvisionError::InstallationFailed {
                step: "create staging directory",
                path: paths.install_dir().to_path_buf(),
                source,
            })?;
        let archive = staging.path().join("near-sandbox.tar.gz");
        let unpacked = staging.path().join("unpacked");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(e.into()))?;
        if !response.status().is_success() {
            return Err(failed(DownloadError::Status(response.status())));
        }
        stream_to_file(response, &archive).await.map_err(failed)?;
        extract(&archive, &unpacked).await.map_err(failed)?;

        let extracted = unpacked.join(BINARY_NAME);
        if !is_file(&extracted).await {
            return Err(ProvisionError::InstallationFailed {
                step: "locate executable",
                path: extracted,
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("archive has no {BINARY_NAME} entry"),
                ),
            });
        }
        Ok((staging, extracted))
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn stream_to_file(mut response: reqwest::Response, path: &Path) -> Result<(), DownloadError> {
    let write_err = |source| DownloadError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::create(path).await.map_err(write_err)?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await.map_err(write_err)?;
    }
    file.flush().await.map_err(write_err)
}

/// Unpack a gzip tarball into `dest`, dropping the leading path component
/// (`near-sandbox-<platform>/near-sandbox` lands at `dest/near-sandbox`).
async fn extract(archive: &Path, dest: &Path) -> Result<(), DownloadError> {
    let archive = archive.to_owned();
    let dest = dest.to_owned();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&archive)?;
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
        std::fs::create_dir_all(&dest)?;
        for entry in tar.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let mut components = path.components();
            components.next();
            let stripped = components.as_path();
            if stripped.as_os_str().is_empty()
                || !stripped.components().all(|c| matches!(c, Component::Normal(_)))
            {
                continue;
            }
            let target = dest.join(stripped);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        }
        Ok::<(), std::io::Error>(())
    })
    .await?
    .map_err(DownloadError::Extract)
}

async fn set_executable(path: &Path) -> Result<(), ProvisionError> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|source| ProvisionError::InstallationFailed {
            step: "chmod",
            path: path.to_path_buf(),
            source,
        })
}

/// Atomic on one filesystem; staging is created inside the install directory.
async fn rename_into_place(from: &Path, to: &Path) -> Result<(), ProvisionError> {
    tokio::fs::rename(from, to)
        .await
        .map_err(|source| ProvisionError::InstallationFailed {
            step: "rename",
            path: to.to_path_buf(),
            source,
        })
}

async fn health_check(binary: &Path) -> Result<(), ProvisionError> {
    let output = tokio::process::Command::new(binary)
        .arg("--version")
        .output()
        .await
        .map_err(|e| ProvisionError::RunningFailed {
            path: binary.to_path_buf(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(ProvisionError::RunningFailed {
            path: binary.to_path_buf(),
            detail: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    debug!(
        version = %String::from_utf8_lossy(&output.stdout).trim(),
        "health check passed"
    );
    Ok(())
}
