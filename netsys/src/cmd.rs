// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::Error;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Run a command and fail if it exits non-zero, carrying captured stderr.
pub async fn run(program: &str, args: &[&str]) -> Result<String, Error> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Spawn {
            program: program.to_string(),
            source: e,
        })?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command; only report whether it exited zero. Spawn failures still
/// surface as errors.
pub async fn probe(program: &str, args: &[&str]) -> Result<bool, Error> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(|e| Error::Spawn {
            program: program.to_string(),
            source: e,
        })?;
    Ok(status.success())
}

/// Run a command feeding `input` on stdin.
pub async fn run_with_stdin(
    program: &str,
    args: &[&str],
    input: &str,
) -> Result<String, Error> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Spawn {
            program: program.to_string(),
            source: e,
        })?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).await?;
        // Close stdin so the child sees EOF.
        drop(stdin);
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let out = run("echo", &["hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let err = run("ls", &["/nonexistent-wrend-test"]).await.unwrap_err();
        match err {
            Error::CommandFailed { program, stderr, .. } => {
                assert_eq!(program, "ls");
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_reports_exit_status() {
        assert!(probe("true", &[]).await.unwrap());
        assert!(!probe("false", &[]).await.unwrap());
    }

    #[tokio::test]
    async fn stdin_is_fed_to_child() {
        let out = run_with_stdin("cat", &[], "key-material\n").await.unwrap();
        assert_eq!(out, "key-material\n");
    }
}
