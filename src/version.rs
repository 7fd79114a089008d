//! Compiler version probing for the `VersionResult` reply.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::config::{Compiler, Config, display_entry};
use crate::error::SessionError;
use crate::writer::FrameSender;

/// Probe every displayable compiler once and emit a single
/// `VersionResult` frame carrying the aggregated JSON array.
pub(crate) async fn send_version_list(
    config: &Config,
    sender: &FrameSender,
) -> Result<(), SessionError> {
    debug!("building compiler list");
    let mut entries = Vec::new();
    for compiler in &config.compilers {
        if compiler.version_command.is_empty() || !compiler.displayable {
            continue;
        }
        match probe(compiler).await {
            Some(version) => entries.push(display_entry(compiler, &version)),
            None => debug!(compiler = %compiler.name, "version probe failed, skipping"),
        }
    }
    let json = serde_json::Value::Array(entries).to_string();
    sender.send("VersionResult", json).await
}

/// Run one probe command in a neutral directory; the version is the first
/// line of stdout, taken only on a clean exit.
async fn probe(compiler: &Compiler) -> Option<String> {
    let (program, args) = compiler.version_command.split_first()?;
    let output = Command::new(program)
        .args(args)
        .current_dir("/")
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().next().map(str::to_string)
}
