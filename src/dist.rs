//! Query server distribution resolution.
//!
//! Toolchain download and version checking are an external collaborator's
//! job; this module defines the interface the client consumes and a resolver
//! that finds an already-installed server binary.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::eval::progress::ProgressSender;

/// Errors from distribution resolution.
#[derive(Error, Debug)]
pub enum DistError {
    /// No server executable is configured or discoverable. The user must fix
    /// the `server.path` setting or install a distribution.
    #[error("query server executable not found; set server.path in quarry.toml")]
    NotInstalled,
}

/// External collaborator interface: locates (and can install) the server
/// executable.
#[async_trait]
pub trait DistributionResolver: Send + Sync {
    /// Path to a usable server executable, if one is available now.
    fn executable_path(&self) -> Option<PathBuf>;

    /// Ensure a usable executable exists, reporting progress to `progress`.
    async fn install_or_update(
        &self,
        progress: Option<ProgressSender>,
    ) -> Result<PathBuf, DistError>;
}

/// Resolver backed by configuration and filesystem search.
///
/// Resolution order: the configured path, then common install locations,
/// then `$PATH`.
pub struct ConfiguredDistribution {
    configured: Option<PathBuf>,
}

impl ConfiguredDistribution {
    pub fn new(configured: Option<PathBuf>) -> Self {
        Self { configured }
    }

    fn search_candidates() -> Option<PathBuf> {
        let candidates = [
            "quarry-server",
            "./quarry-server",
            "./server/quarry-server",
        ];

        for candidate in candidates {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Some(path);
            }
        }

        // Try PATH
        if let Ok(output) = std::process::Command::new("which")
            .arg("quarry-server")
            .output()
        {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(PathBuf::from(path));
                }
            }
        }

        None
    }
}

#[async_trait]
impl DistributionResolver for ConfiguredDistribution {
    fn executable_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.configured {
            return Some(path.clone());
        }
        Self::search_candidates()
    }

    async fn install_or_update(
        &self,
        _progress: Option<ProgressSender>,
    ) -> Result<PathBuf, DistError> {
        // This resolver cannot download anything; an installed binary counts
        // as up to date.
        self.executable_path().ok_or(DistError::NotInstalled)
    }
}
