//! Per-connection session: frame dispatch and the run/version pipelines.
//!
//! A session accumulates named fields and source files frame by frame
//! until a terminal command arrives: `Control` with payload `run` fires
//! the compile-and-run pipeline, `Version` fires the compiler probe.
//! Either way the session ends when its pipeline does; without a terminal
//! command it ends at client EOF.

use std::borrow::Cow;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::SessionError;
use crate::protocol::{Frame, FrameReader};
use crate::run::{build_steps, run_steps};
use crate::sources::{create_jail_dir, write_sources};
use crate::version::send_version_list;
use crate::writer::FrameSender;

/// Socket read chunk size.
const READ_BUF_SIZE: usize = 8192;

enum Dispatch {
    Accumulated,
    Run,
    Version,
}

pub(crate) struct Session {
    config: Arc<Config>,
    sender: FrameSender,
    /// Received named fields, in first-seen order, values concatenated.
    /// Values stay raw bytes; `StdIn` and friends are not required to be
    /// valid UTF-8 and must reach the child unaltered.
    received: Vec<(String, Vec<u8>)>,
    /// Pending source files, in first-seen order, contents concatenated.
    sources: Vec<(String, Vec<u8>)>,
    current_filename: String,
}

impl Session {
    pub(crate) fn new(config: Arc<Config>, sender: FrameSender) -> Self {
        Self {
            config,
            sender,
            received: Vec::new(),
            sources: Vec::new(),
            current_filename: String::new(),
        }
    }

    /// Drive the session until a terminal command fires a pipeline or the
    /// peer hangs up.
    pub(crate) async fn run<R>(mut self, mut reader: R) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FrameReader::new();
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                debug!("client closed the connection");
                return Ok(());
            }
            frames.extend(&buf[..n]);
            while let Some(frame) = frames.next_frame()? {
                match self.dispatch(frame) {
                    Dispatch::Accumulated => {}
                    Dispatch::Run => return self.run_program().await,
                    Dispatch::Version => {
                        return send_version_list(&self.config, &self.sender).await;
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Dispatch {
        match frame.name.as_str() {
            "SourceFileName" => {
                self.current_filename = String::from_utf8_lossy(&frame.payload).into_owned();
            }
            "Source" => append_field(&mut self.sources, &self.current_filename, &frame.payload),
            "Version" => return Dispatch::Version,
            "Control" if frame.payload == b"run" => return Dispatch::Run,
            _ => append_field(&mut self.received, &frame.name, &frame.payload),
        }
        Dispatch::Accumulated
    }

    async fn run_program(self) -> Result<(), SessionError> {
        let control = text_field(&self.received, "Control").unwrap_or_default();
        let compiler_name = control.strip_prefix("compiler=").unwrap_or_default();
        let Some(compiler) = self.config.compiler(compiler_name) else {
            warn!(compiler = %compiler_name, "selected compiler is not configured");
            return Err(SessionError::protocol(format!(
                "unknown compiler '{compiler_name}'"
            )));
        };
        info!(compiler = %compiler.name, "running program");

        let jail = self.config.jail(compiler);
        let jail_dir = create_jail_dir(&self.config.system.basedir).await?;
        write_sources(
            &jail_dir,
            &self.config.system.storedir,
            &self.sources,
            &compiler.output_file,
        )
        .await?;

        let steps = build_steps(compiler, jail, &self.config.switches, &self.received);
        run_steps(steps, &jail_dir.path, &self.received, jail, &self.sender).await?;
        info!(compiler = %compiler.name, jail_dir = %jail_dir.unique_name, "finished");
        Ok(())
    }
}

/// Append to the value stored under `key`, creating the entry on first
/// sight and preserving insertion order.
pub(crate) fn append_field(fields: &mut Vec<(String, Vec<u8>)>, key: &str, value: &[u8]) {
    match fields.iter_mut().find(|(k, _)| k == key) {
        Some((_, existing)) => existing.extend_from_slice(value),
        None => fields.push((key.to_string(), value.to_vec())),
    }
}

/// Look up a received field by name.
pub(crate) fn field<'a>(fields: &'a [(String, Vec<u8>)], key: &str) -> Option<&'a [u8]> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_slice())
}

/// A received field decoded for textual use (compiler selection, switch
/// ids, raw option lists).
pub(crate) fn text_field<'a>(fields: &'a [(String, Vec<u8>)], key: &str) -> Option<Cow<'a, str>> {
    field(fields, key).map(String::from_utf8_lossy)
}
