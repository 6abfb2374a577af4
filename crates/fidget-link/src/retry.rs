//! Bounded response polling.
//!
//! Every request/response exchange with the device follows the same shape:
//! read with a per-attempt timeout, accumulate text, classify it. A timed out
//! read consumes an attempt. Text that is neither an answer nor a refusal
//! means the device is still working, so the poller waits a settle delay and
//! reads again without consuming an attempt.

use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LinkError;
use crate::transport::ReadHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    pub settle_delay: Duration,
}

/// Classification of the accumulated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
    /// Unrecognized text; settle and read again.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Accepted(String),
    Rejected(String),
    /// Every attempt timed out. `received` holds whatever text arrived.
    Exhausted { received: String },
    Cancelled,
    EndOfStream,
}

pub struct ResponsePoller<'a> {
    reader: &'a mut ReadHandle,
    cancel: &'a CancellationToken,
    policy: RetryPolicy,
}

impl<'a> ResponsePoller<'a> {
    pub fn new(
        reader: &'a mut ReadHandle,
        cancel: &'a CancellationToken,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            reader,
            cancel,
            policy,
        }
    }

    pub async fn poll(
        &mut self,
        mut classify: impl FnMut(&str) -> Verdict,
    ) -> Result<PollOutcome, LinkError> {
        let mut response = String::new();
        let mut attempt = 0;

        while attempt < self.policy.max_attempts {
            debug!(
                "waiting for response (attempt {}/{})",
                attempt + 1,
                self.policy.max_attempts
            );
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                read = time::timeout(self.policy.per_attempt_timeout, self.reader.read_chunk()) => read,
            };

            let chunk = match read {
                Err(_) => {
                    debug!("attempt {} timed out", attempt + 1);
                    attempt += 1;
                    continue;
                }
                Ok(chunk) => chunk?,
            };
            let Some(chunk) = chunk else {
                return Ok(PollOutcome::EndOfStream);
            };

            let text = String::from_utf8_lossy(&chunk);
            debug!("response chunk: {:?}", text);
            response.push_str(&text);

            match classify(&response) {
                Verdict::Accept => return Ok(PollOutcome::Accepted(response)),
                Verdict::Reject => return Ok(PollOutcome::Rejected(response)),
                Verdict::Continue => {
                    if !sleep_or_cancel(self.policy.settle_delay, self.cancel).await {
                        return Ok(PollOutcome::Cancelled);
                    }
                }
            }
        }

        Ok(PollOutcome::Exhausted { received: response })
    }
}

/// Reads one chunk as text, waiting as long as it takes.
pub async fn read_text(
    reader: &mut ReadHandle,
    cancel: &CancellationToken,
) -> Result<String, LinkError> {
    let chunk = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(LinkError::Cancelled),
        chunk = reader.read_chunk() => chunk?,
    };
    match chunk {
        Some(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        None => Err(LinkError::EndOfStream),
    }
}

/// Reads one chunk as text if it arrives before `deadline`.
pub async fn read_text_until(
    reader: &mut ReadHandle,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<Option<String>, LinkError> {
    match time::timeout_at(deadline, read_text(reader, cancel)).await {
        Ok(text) => text.map(Some),
        Err(_) => Ok(None),
    }
}

/// Returns false when cancelled first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryPort, PortOpener};
    use tokio::io::AsyncWriteExt;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_secs(3),
            settle_delay: Duration::from_millis(500),
        }
    }

    fn ok_marker(text: &str) -> Verdict {
        if text.contains("OK") {
            Verdict::Accept
        } else if text.contains("ERROR") {
            Verdict::Reject
        } else {
            Verdict::Continue
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accepts_response_split_across_reads() {
        let port = MemoryPort::new();
        let mut device = port.attach(64);
        let channel = port.open().unwrap();
        let mut reader = channel.acquire_reader().unwrap();
        let cancel = CancellationToken::new();

        device.write_all(b"O").await.unwrap();
        let feeder = tokio::spawn(async move {
            time::sleep(Duration::from_millis(100)).await;
            device.write_all(b"K\r\n").await.unwrap();
            device
        });

        let outcome = ResponsePoller::new(&mut reader, &cancel, policy())
            .poll(ok_marker)
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Accepted("OK\r\n".into()));
        feeder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_exhausts_attempts() {
        let port = MemoryPort::new();
        let _device = port.attach(64);
        let channel = port.open().unwrap();
        let mut reader = channel.acquire_reader().unwrap();
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let outcome = ResponsePoller::new(&mut reader, &cancel, policy())
            .poll(ok_marker)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Exhausted {
                received: String::new()
            }
        );
        assert_eq!(start.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_text_does_not_consume_attempts() {
        let port = MemoryPort::new();
        let mut device = port.attach(64);
        let channel = port.open().unwrap();
        let mut reader = channel.acquire_reader().unwrap();
        let cancel = CancellationToken::new();

        device.write_all(b"working").await.unwrap();
        let outcome = ResponsePoller::new(&mut reader, &cancel, policy())
            .poll(ok_marker)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Exhausted {
                received: "working".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_and_end_of_stream() {
        let port = MemoryPort::new();
        let mut device = port.attach(64);
        let channel = port.open().unwrap();
        let mut reader = channel.acquire_reader().unwrap();
        let cancel = CancellationToken::new();

        device.write_all(b"ERROR").await.unwrap();
        let outcome = ResponsePoller::new(&mut reader, &cancel, policy())
            .poll(ok_marker)
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Rejected("ERROR".into()));

        drop(device);
        let outcome = ResponsePoller::new(&mut reader, &cancel, policy())
            .poll(ok_marker)
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::EndOfStream);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins() {
        let port = MemoryPort::new();
        let _device = port.attach(64);
        let channel = port.open().unwrap();
        let mut reader = channel.acquire_reader().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = ResponsePoller::new(&mut reader, &cancel, policy())
            .poll(ok_marker)
            .await
            .unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);
        assert!(matches!(
            read_text(&mut reader, &cancel).await,
            Err(LinkError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn read_until_deadline() {
        let port = MemoryPort::new();
        let mut device = port.attach(64);
        let channel = port.open().unwrap();
        let mut reader = channel.acquire_reader().unwrap();
        let cancel = CancellationToken::new();

        let deadline = Instant::now() + Duration::from_millis(250);
        assert_eq!(
            read_text_until(&mut reader, &cancel, deadline).await.unwrap(),
            None
        );

        device.write_all(b"SYMKEY:NEEDED").await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(250);
        assert_eq!(
            read_text_until(&mut reader, &cancel, deadline).await.unwrap(),
            Some("SYMKEY:NEEDED".into())
        );
    }
}
