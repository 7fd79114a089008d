//! Ordered outgoing frame queue: one writer task per connection.
//!
//! Every producer on a session (framer replies, the four forwarders of a
//! step, the supervisor) funnels frames through a cloneable [`FrameSender`]
//! into a single task that owns the socket's write half. Channel FIFO
//! order is the ordering guarantee; frame boundaries are preserved because
//! each queue item is one complete frame.

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SessionError;
use crate::protocol::encode_frame;

/// Bounded queue size; producers park when the peer reads slowly.
const WRITE_QUEUE_SIZE: usize = 128;

#[derive(Clone)]
pub(crate) struct FrameSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl FrameSender {
    /// Queue one `command payload` frame. Fails fast once the writer task
    /// has stopped (peer gone or write error).
    pub(crate) async fn send(
        &self,
        command: &str,
        payload: impl AsRef<[u8]>,
    ) -> Result<(), SessionError> {
        self.tx.send(encode_frame(command, payload.as_ref())).await?;
        Ok(())
    }
}

/// Spawn the writer task for a connection. The task exits when every
/// sender is dropped or on the first socket write error; queued frames
/// after an error are discarded.
pub(crate) fn spawn_writer<W>(writer: W) -> (FrameSender, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_SIZE);
    let handle = tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        let mut pending = 0u32;
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!(error = %e, "socket write failed, dropping queued frames");
                return;
            }
            pending += 1;
            if pending >= 16 || rx.is_empty() {
                if let Err(e) = writer.flush().await {
                    debug!(error = %e, "socket flush failed, dropping queued frames");
                    return;
                }
                pending = 0;
            }
        }
        let _ = writer.flush().await;
    });
    (FrameSender { tx }, handle)
}
