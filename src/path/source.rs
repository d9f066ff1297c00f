//! Source launchers for static and on-demand paths
//!
//! A launched source is an external process expected to connect back and
//! publish the path (the relay never decodes anything itself). The trait
//! exists so tests can substitute an in-process publisher.

use tokio_util::sync::CancellationToken;

/// Starts the external source process for a path.
pub trait SourceLauncher: Send + Sync + 'static {
    /// Launch `command` for `path`. Must return immediately; the source
    /// runs until `stop` is cancelled.
    fn launch(&self, path: &str, command: &str, stop: CancellationToken);
}

/// Default launcher: `sh -c <command>` with the path name exported as
/// `RELAY_PATH`. Cancelling the token kills the process.
pub struct CommandLauncher;

impl SourceLauncher for CommandLauncher {
    fn launch(&self, path: &str, command: &str, stop: CancellationToken) {
        let path = path.to_string();
        let command = command.to_string();
        tokio::spawn(async move {
            let child = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .env("RELAY_PATH", &path)
                .kill_on_drop(true)
                .spawn();

            let mut child = match child {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(path = %path, error = %e, "Failed to launch source");
                    return;
                }
            };
            tracing::info!(path = %path, "Source process launched");

            tokio::select! {
                status = child.wait() => match status {
                    Ok(s) if s.success() => {
                        tracing::info!(path = %path, "Source process exited");
                    }
                    Ok(s) => {
                        tracing::warn!(path = %path, status = %s, "Source process failed");
                    }
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "Source process wait error");
                    }
                },
                _ = stop.cancelled() => {
                    let _ = child.kill().await;
                    tracing::info!(path = %path, "Source process stopped");
                }
            }
        });
    }
}
