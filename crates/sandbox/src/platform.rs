//! Artifact platform naming and download URLs.

use crate::provision::ProvisionError;

pub const DEFAULT_VERSION: &str = "2.6.5";

const ARTIFACT_BASE_URL: &str = "https://s3-us-west-1.amazonaws.com/build.nearprotocol.com/nearcore";

/// Platform segment of the artifact URL, e.g. `Linux-x86_64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    os: &'static str,
    arch: &'static str,
}

impl Platform {
    pub fn detect() -> Result<Self, ProvisionError> {
        Self::from_parts(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Map Rust's `(OS, ARCH)` constants onto published artifact names.
    pub fn from_parts(os: &str, arch: &str) -> Result<Self, ProvisionError> {
        let (os, arch) = match (os, arch) {
            ("linux", "x86_64") => ("Linux", "x86_64"),
            ("linux", "aarch64") => ("Linux", "aarch64"),
            ("macos", "aarch64") => ("Darwin", "arm64"),
            _ => {
                return Err(ProvisionError::UnsupportedPlatform {
                    os: os.to_string(),
                    arch: arch.to_string(),
                });
            }
        };
        Ok(Self { os, arch })
    }

    pub fn os(&self) -> &'static str {
        self.os
    }

    pub fn arch(&self) -> &'static str {
        self.arch
    }

    pub fn artifact_url(&self, version: &str) -> String {
        format!(
            "{ARTIFACT_BASE_URL}/{}-{}/{version}/near-sandbox.tar.gz",
            self.os, self.arch
        )
    }
}
