use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};

/// reStructuredText conversion through an external `pandoc` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RstConverter {
    pandoc_path: PathBuf,
}

impl RstConverter {
    pub fn new(pandoc_path: PathBuf) -> Self {
        Self { pandoc_path }
    }

    /// `None` when no pandoc binary can be found.
    pub fn discover() -> Option<Self> {
        find_pandoc_path().map(Self::new)
    }

    pub fn pandoc_path(&self) -> &Path {
        &self.pandoc_path
    }

    pub fn convert(&self, html: &str, output: &Path) -> Result<()> {
        let mut child = Command::new(&self.pandoc_path)
            .args(["--from", "html", "--to", "rst", "--output"])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to execute {}", self.pandoc_path.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(html.as_bytes())
                .context("failed to stream page into pandoc")?;
        }
        let result = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for {}", self.pandoc_path.display()))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            bail!(
                "pandoc exited with {} while writing {}: {}",
                result.status,
                output.display(),
                stderr.trim()
            );
        }
        Ok(())
    }
}

/// PANDOC_PATH first, then every directory on PATH.
pub fn find_pandoc_path() -> Option<PathBuf> {
    if let Some(env_path) = env::var("PANDOC_PATH")
        .ok()
        .map(|value| PathBuf::from(value.trim()))
        .filter(|path| path.is_file())
    {
        return Some(env_path);
    }

    let names: &[&str] = if cfg!(windows) {
        &["pandoc.exe", "pandoc"]
    } else {
        &["pandoc"]
    };
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        for name in names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}
