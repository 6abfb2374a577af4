//! Streaming reader.
//!
//! Once the device is told to start, everything it sends is decoded and
//! appended to the session's raw buffer. Observers of the buffer are woken on
//! every append and must tolerate incomplete JSON.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::TransportError;
use crate::transport::ReadHandle;

/// Why the reader stopped.
#[derive(Debug)]
pub enum ReaderExit {
    EndOfStream,
    Cancelled,
    Failed(TransportError),
}

/// Incremental UTF-8 decoding across chunk boundaries.
#[derive(Debug, Default)]
pub(crate) struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    /// Decodes what it can. An incomplete trailing sequence is held back for
    /// the next chunk; invalid bytes become U+FFFD.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

pub(crate) fn spawn_reader(
    handle: ReadHandle,
    raw: Arc<watch::Sender<String>>,
    cancel: CancellationToken,
) -> JoinHandle<ReaderExit> {
    tokio::spawn(async move { run_reader(handle, &raw, &cancel).await })
}

/// Reads until end of stream, cancellation or a read error. The handle is
/// released on every exit path.
pub async fn run_reader(
    mut handle: ReadHandle,
    raw: &watch::Sender<String>,
    cancel: &CancellationToken,
) -> ReaderExit {
    let mut decoder = Utf8Accumulator::default();
    info!("streaming reader started");

    let exit = loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break ReaderExit::Cancelled,
            chunk = handle.read_chunk() => chunk,
        };

        match chunk {
            Ok(Some(bytes)) => {
                let text = decoder.push(&bytes);
                if !text.is_empty() {
                    raw.send_modify(|buffer| buffer.push_str(&text));
                }
            }
            Ok(None) => {
                let rest = decoder.finish();
                if !rest.is_empty() {
                    raw.send_modify(|buffer| buffer.push_str(&rest));
                }
                break ReaderExit::EndOfStream;
            }
            Err(TransportError::Aborted) => break ReaderExit::Cancelled,
            Err(e) => break ReaderExit::Failed(e),
        }
    };

    match &exit {
        ReaderExit::EndOfStream => info!("device closed the stream"),
        ReaderExit::Cancelled => debug!("streaming reader cancelled"),
        ReaderExit::Failed(e) => error!("error reading from device: {}", e),
    }
    handle.release();
    exit
}
