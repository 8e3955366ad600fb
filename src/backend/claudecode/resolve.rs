//! Locating the Claude CLI executable on the host.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::process::Command;
use tracing::{debug, info};

use crate::util::home_dir;

/// Well-known install locations, probed before asking the shell.
fn default_candidates() -> Vec<PathBuf> {
    let home = PathBuf::from(home_dir());
    vec![
        home.join(".claude/local/claude"),
        home.join(".local/bin/claude"),
        PathBuf::from("/usr/local/bin/claude"),
        PathBuf::from("/opt/homebrew/bin/claude"),
        home.join(".npm-global/bin/claude"),
        PathBuf::from("/usr/bin/claude"),
    ]
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Resolves and caches the CLI path for the lifetime of the resolver.
pub struct ExecutableResolver {
    explicit: Option<PathBuf>,
    candidates: Vec<PathBuf>,
    shell_lookup: Option<String>,
    cached: Mutex<Option<PathBuf>>,
}

impl ExecutableResolver {
    /// `explicit` (from `CLAUDE_CLI_PATH`) wins over probing when it exists.
    pub fn new(explicit: Option<String>) -> Self {
        Self {
            explicit: explicit.map(PathBuf::from),
            candidates: default_candidates(),
            shell_lookup: Some("claude".to_string()),
            cached: Mutex::new(None),
        }
    }

    /// Resolver with a custom probe list and shell lookup name.
    pub fn with_candidates(candidates: Vec<PathBuf>, shell_lookup: Option<String>) -> Self {
        Self {
            explicit: None,
            candidates,
            shell_lookup,
            cached: Mutex::new(None),
        }
    }

    pub fn cached(&self) -> Option<PathBuf> {
        self.cached.lock().ok().and_then(|guard| guard.clone())
    }

    /// Forget the cached resolution.
    pub fn reset(&self) {
        if let Ok(mut guard) = self.cached.lock() {
            *guard = None;
        }
    }

    pub async fn resolve(&self) -> Option<PathBuf> {
        if let Some(path) = self.cached() {
            return Some(path);
        }

        let found = self.probe().await;
        if let Some(path) = &found {
            info!("Resolved Claude CLI at {}", path.display());
            if let Ok(mut guard) = self.cached.lock() {
                *guard = Some(path.clone());
            }
        }
        found
    }

    async fn probe(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit {
            if is_executable(path) {
                return Some(path.clone());
            }
            debug!("CLAUDE_CLI_PATH {} is not executable", path.display());
        }

        if let Some(path) = self.candidates.iter().find(|p| is_executable(p)) {
            return Some(path.clone());
        }

        let name = self.shell_lookup.as_deref()?;
        let output = Command::new("sh")
            .arg("-lc")
            .arg(format!("command -v {}", name))
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!path.is_empty()).then(|| PathBuf::from(path))
    }
}
