//! Human-readable result file written after every run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::util::sanitize_filename;

/// How a run ended, as shown in the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactStatus {
    Success,
    Failed(i32),
    TimedOut,
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactStatus::Success => write!(f, "Success"),
            ArtifactStatus::Failed(code) => write!(f, "Failed (exit {})", code),
            ArtifactStatus::TimedOut => write!(f, "Timed Out"),
        }
    }
}

/// Attempts at a free name before giving up.
const NAME_ATTEMPTS: u32 = 100;

pub fn artifact_file_name(task_name: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}.txt",
        sanitize_filename(task_name),
        at.format("%Y-%m-%dT%H-%M-%S-%3f")
    )
}

fn numbered(name: &str, n: u32) -> String {
    match name.strip_suffix(".txt") {
        Some(stem) => format!("{}-{}.txt", stem, n),
        None => format!("{}-{}", name, n),
    }
}

pub fn render(
    task_name: &str,
    at: DateTime<Utc>,
    duration: Duration,
    status: ArtifactStatus,
    output: &str,
) -> String {
    format!(
        "Task: {}\nTimestamp: {}\nDuration: {:.1}s\nStatus: {}\n\n{}\n",
        task_name,
        at.to_rfc3339(),
        duration.as_secs_f64(),
        status,
        output
    )
}

/// Write the artifact under `dir`, creating it if needed. An existing file
/// with the same name is never overwritten; a numbered name is used instead.
pub async fn write_artifact(
    dir: &Path,
    task_name: &str,
    at: DateTime<Utc>,
    duration: Duration,
    status: ArtifactStatus,
    output: &str,
) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = artifact_file_name(task_name, at);
    let contents = render(task_name, at, duration, status, output);

    for n in 0..NAME_ATTEMPTS {
        let path = dir.join(if n == 0 { name.clone() } else { numbered(&name, n) });
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match file {
            Ok(mut file) => {
                file.write_all(contents.as_bytes()).await?;
                file.flush().await?;
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    anyhow::bail!("No free artifact name for {} in {}", name, dir.display())
}
