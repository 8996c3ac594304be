//! Start-up checks run before the first keyword is searched.

use std::ffi::OsStr;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::processing::VideoLingoClient;

/// Runs `<program> --version` and fails unless it exits successfully.
pub fn ensure_program_available(program: impl AsRef<OsStr>) -> Result<()> {
    let program = program.as_ref();
    let status = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => bail!(
            "{} is installed but `--version` failed with {status}",
            program.to_string_lossy()
        ),
        Err(err) => bail!(
            "{} is not installed or not in PATH: {err}",
            program.to_string_lossy()
        ),
    }
}

/// Checks the search tool and the processing service.
pub fn run(search_program: &str, processing: &VideoLingoClient) -> Result<()> {
    ensure_program_available(search_program)?;
    processing
        .health()
        .context("processing service health check failed")?;
    info!("preflight checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn missing_program_is_reported() {
        let err = ensure_program_available("/nonexistent/yt-dlp").unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }

    #[cfg(unix)]
    #[test]
    fn version_exit_status_decides() {
        let dir = tempdir().unwrap();
        for (name, code, ok) in [("good", 0, true), ("bad", 3, false)] {
            let path = dir.path().join(name);
            fs::write(&path, format!("#!/usr/bin/env bash\nexit {code}\n")).unwrap();
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
            assert_eq!(ensure_program_available(&path).is_ok(), ok, "{name}");
        }
    }
}
