//! Source materialization: jail directory creation and dual-tree writes.
//!
//! Each run gets a uniquely named working directory under `basedir`; user
//! sources land in its `store/` subtree, which the jail wrapper exposes to
//! the child. A second copy goes under `storedir` for audit and replay;
//! that tree is best-effort and never fails a run.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

use crate::error::SessionError;

/// Prefix of every per-session jail directory name.
const JAIL_DIR_PREFIX: &str = "kiln";
/// Retry delay when file opens hit descriptor exhaustion.
const RETRY_DELAY_MS: u64 = 50;

/// Mixed into directory names so two sessions created in the same
/// nanosecond still diverge.
static UNIQUE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) struct JailDir {
    pub(crate) unique_name: String,
    pub(crate) path: PathBuf,
}

/// Create `<basedir>/kiln<6 random chars>` with mode 0700, retrying on
/// name collisions.
pub(crate) async fn create_jail_dir(basedir: &Path) -> io::Result<JailDir> {
    loop {
        let unique_name = format!("{JAIL_DIR_PREFIX}{}", unique_suffix());
        let path = basedir.join(&unique_name);
        let mut builder = tokio::fs::DirBuilder::new();
        builder.mode(0o700);
        match builder.create(&path).await {
            Ok(()) => return Ok(JailDir { unique_name, path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Six characters of `[a-z0-9]` mixed from the clock and a counter.
fn unique_suffix() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let count = UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut state = nanos.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(count);
    let mut out = String::with_capacity(6);
    for _ in 0..6 {
        state ^= state >> 27;
        state = state.wrapping_mul(0x2545_f491_4f6c_dd1d);
        out.push(char::from(ALPHABET[(state >> 58) as usize % ALPHABET.len()]));
    }
    out
}

/// Materialize every pending source into the jail's `store/` tree and the
/// archival store, in submission order. An empty filename takes the
/// compiler's default. Jail-tree failures abort the run; archival
/// failures are logged and swallowed.
pub(crate) async fn write_sources(
    jail_dir: &JailDir,
    storedir: &Path,
    sources: &[(String, Vec<u8>)],
    default_filename: &str,
) -> Result<(), SessionError> {
    let store_root = jail_dir.path.join("store");
    let archive_root = storedir.join(&jail_dir.unique_name);
    for (filename, source) in sources {
        let filename = if filename.is_empty() {
            default_filename
        } else {
            filename.as_str()
        };
        debug!(file = %filename, "writing source file");
        write_under(&store_root, filename, source).await?;
        if let Err(e) = write_under(&archive_root, filename, source).await {
            warn!(file = %filename, error = %e, "failed to write archival copy");
        }
    }
    Ok(())
}

/// Resolve `filename` below `root`, rejecting absolute paths and any
/// traversal that would climb out of the tree.
fn resolve_under(root: &Path, filename: &str) -> Result<PathBuf, SessionError> {
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(filename).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(SessionError::protocol(format!(
                        "source filename '{filename}' escapes the working directory"
                    )));
                }
                resolved.pop();
                depth -= 1;
            }
            Component::CurDir => {}
            _ => {
                return Err(SessionError::protocol(format!(
                    "source filename '{filename}' must be relative"
                )));
            }
        }
    }
    if depth == 0 {
        return Err(SessionError::protocol(format!(
            "source filename '{filename}' names no file"
        )));
    }
    Ok(resolved)
}

async fn write_under(root: &Path, filename: &str, bytes: &[u8]) -> Result<(), SessionError> {
    let target = resolve_under(root, filename)?;
    if let Some(parent) = target.parent() {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(parent).await?;
    }
    let mut file = open_exclusive(&target).await?;
    file.write_all(bytes).await?;
    Ok(())
}

/// Exclusive-create with mode 0600, parking briefly when descriptors run
/// dry instead of failing the session.
async fn open_exclusive(path: &Path) -> io::Result<tokio::fs::File> {
    loop {
        let attempt = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .await;
        match attempt {
            Ok(file) => return Ok(file),
            Err(e) if is_transient(&e) => {
                debug!(path = %path.display(), error = %e, "open parked on descriptor pressure");
                sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::EAGAIN)
    )
}
