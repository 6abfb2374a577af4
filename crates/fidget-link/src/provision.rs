//! Symmetric key provisioning.

use fidget_common::LinkTimings;
use fidget_core::marker::{self, ProvisionMarker};
use fidget_core::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::LinkError;
use crate::key_store::KeyStore;
use crate::retry::{PollOutcome, ResponsePoller, RetryPolicy, Verdict};
use crate::transport::{ReadHandle, WriteHandle};

pub fn provision_policy(timings: &LinkTimings) -> RetryPolicy {
    RetryPolicy {
        max_attempts: timings.provision_attempts,
        per_attempt_timeout: timings.provision_timeout(),
        settle_delay: timings.provision_settle(),
    }
}

fn classify(response: &str) -> Verdict {
    match marker::scan_provision(response) {
        ProvisionMarker::Accepted => Verdict::Accept,
        ProvisionMarker::Rejected => Verdict::Reject,
        ProvisionMarker::Unrecognized | ProvisionMarker::Silent => Verdict::Continue,
    }
}

/// Sends `P:<key>` and waits for the device to accept it.
///
/// The key comes from the key store and is created there on first use.
/// With `strict` unset, running out of attempts after receiving some text
/// that carries no failure marker still counts as success.
pub async fn provision_symmetric_key(
    reader: &mut ReadHandle,
    writer: &mut WriteHandle,
    keys: &KeyStore,
    timings: &LinkTimings,
    strict: bool,
    cancel: &CancellationToken,
) -> Result<(), LinkError> {
    let key = keys.get_or_create_symmetric_key()?;
    info!("provisioning symmetric key {}", key.fingerprint());
    writer.send(&Command::RegisterKey(key.to_hex())).await?;

    let outcome = ResponsePoller::new(reader, cancel, provision_policy(timings))
        .poll(classify)
        .await?;

    match outcome {
        PollOutcome::Accepted(_) => {
            info!("symmetric key registered");
            Ok(())
        }
        PollOutcome::Rejected(response) => Err(LinkError::ProvisioningFailed(format!(
            "device rejected symmetric key: {}",
            response.trim()
        ))),
        PollOutcome::Exhausted { received } => {
            let received = received.trim();
            if received.is_empty() {
                return Err(LinkError::Timeout(format!(
                    "no response to symmetric key after {} attempts",
                    timings.provision_attempts
                )));
            }
            if strict || marker::is_error_response(received) {
                return Err(LinkError::ProvisioningFailed(format!(
                    "unrecognized response: {}",
                    received
                )));
            }
            warn!(
                "assuming symmetric key registered from unrecognized response {:?}",
                received
            );
            Ok(())
        }
        PollOutcome::Cancelled => Err(LinkError::Cancelled),
        PollOutcome::EndOfStream => Err(LinkError::EndOfStream),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryPort, PortOpener};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn read_command(device: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 512];
        let n = device.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    async fn run(reply: &'static [u8], strict: bool) -> (Result<(), LinkError>, String) {
        let port = MemoryPort::new();
        let mut device = port.attach(1024);
        let channel = port.open().unwrap();
        let mut reader = channel.acquire_reader().unwrap();
        let mut writer = channel.acquire_writer().unwrap();
        let keys = KeyStore::in_memory();
        let cancel = CancellationToken::new();

        let script = tokio::spawn(async move {
            let command = read_command(&mut device).await;
            if !reply.is_empty() {
                device.write_all(reply).await.unwrap();
            }
            (command, device)
        });

        let result = provision_symmetric_key(
            &mut reader,
            &mut writer,
            &keys,
            &LinkTimings::default(),
            strict,
            &cancel,
        )
        .await;
        let (command, _device) = script.await.unwrap();

        let key = keys.symmetric_key().unwrap().unwrap();
        assert_eq!(command, format!("P:{}", key.to_hex()));
        (result, command)
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_key() {
        let (result, _) = run(b"SYMKEY_OK\r\n", false).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_key() {
        let (result, _) = run(b"Invalid key length", false).await;
        assert!(matches!(result, Err(LinkError::ProvisioningFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (result, _) = run(b"", false).await;
        assert!(matches!(result, Err(LinkError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn noisy_device_is_tolerated_unless_strict() {
        let (result, _) = run(b"stored", false).await;
        assert!(result.is_ok());

        let (result, _) = run(b"stored", true).await;
        assert!(matches!(result, Err(LinkError::ProvisioningFailed(_))));
    }
}
