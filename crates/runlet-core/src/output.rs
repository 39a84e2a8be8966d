//! Background readers pumping child output into the session queue.
//!
//! One reader task per stream (stdout, stderr) reads whatever bytes are
//! available and relays them as [`OutputEvent`]s over an unbounded channel,
//! so a chatty child can never block on a slow consumer and the submission
//! path never blocks on the child. Fragments from one stream preserve
//! arrival order; stdout and stderr are ordered relative to each other only
//! by arrival time.

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

const READ_BUFFER_BYTES: usize = 4096;

/// Which stream of the child process a fragment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamOrigin::Stdout => write!(f, "stdout"),
            StreamOrigin::Stderr => write!(f, "stderr"),
        }
    }
}

/// One raw fragment read from the child process.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    pub origin: StreamOrigin,
    pub text: String,
    /// Arrival timestamp; used only for ordering, never displayed.
    pub at: DateTime<Utc>,
}

impl OutputEvent {
    pub fn new(origin: StreamOrigin, text: impl Into<String>) -> Self {
        Self {
            origin,
            text: text.into(),
            at: Utc::now(),
        }
    }
}

/// Spawn a reader task that drains `stream` into `tx` until EOF.
///
/// Multi-byte UTF-8 sequences split across reads are carried over to the
/// next fragment rather than surfacing as replacement characters.
pub(crate) fn spawn_reader<R>(
    stream: R,
    origin: StreamOrigin,
    tx: UnboundedSender<OutputEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = stream;
        let mut buf = [0u8; READ_BUFFER_BYTES];
        let mut pending: Vec<u8> = Vec::new();

        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let text = take_complete_utf8(&mut pending);
                    if !text.is_empty() && tx.send(OutputEvent::new(origin, text)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    log::debug!("{} reader stopped: {}", origin, err);
                    break;
                }
            }
        }

        if !pending.is_empty() {
            let text = String::from_utf8_lossy(&pending).into_owned();
            let _ = tx.send(OutputEvent::new(origin, text));
        }
        log::trace!("{} reader finished", origin);
    })
}

/// Split off the longest prefix of `pending` that is complete UTF-8,
/// leaving at most one partial trailing sequence behind.
fn take_complete_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(_) => String::from_utf8_lossy(&std::mem::take(pending)).into_owned(),
        Err(err) if err.error_len().is_none() => {
            let valid = err.valid_up_to();
            let tail = pending.split_off(valid);
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        // Genuinely invalid bytes: let lossy conversion mark them.
        Err(_) => String::from_utf8_lossy(&std::mem::take(pending)).into_owned(),
    }
}
