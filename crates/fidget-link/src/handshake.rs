//! Connection handshake.
//!
//! The host sends `C` and the device answers with either its bound wallet
//! (`Y:<address>`, optionally followed by `SYMKEY:NEEDED`) or `N` when it
//! has no identity yet. The first case ends in streaming (`S` is sent), the
//! second in wallet registration and, if the device asks for it, key
//! provisioning.

use std::time::Duration;

use fidget_common::{helpers, LinkConfig};
use fidget_core::marker::{self, AckMarker, AuthMarker};
use fidget_core::{Command, DeviceIdentity};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::key_store::KeyStore;
use crate::provision::provision_symmetric_key;
use crate::retry::{read_text, read_text_until, PollOutcome, ResponsePoller, RetryPolicy, Verdict};
use crate::transport::{ReadHandle, WriteHandle};

/// How a successful handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// `S` was sent; the device is about to stream its payload.
    Streaming { device_wallet: String },
    /// The wallet (and possibly a key) was registered; no streaming.
    Initialized { wallet: String },
    /// The device is bound to a different wallet. Nothing was sent after `C`.
    Mismatch { device_wallet: String },
}

/// Sends the device clock stamp and waits `settle`. Never fails.
pub async fn sync_clock(writer: &mut WriteHandle, settle: Duration) {
    let command = Command::SetClock(helpers::device_clock_stamp());
    match writer.send(&command).await {
        Ok(()) => info!("synced device clock"),
        Err(e) => warn!("failed to sync device clock: {}", e),
    }
    time::sleep(settle).await;
}

pub struct Handshake<'a> {
    reader: &'a mut ReadHandle,
    writer: &'a mut WriteHandle,
    keys: &'a KeyStore,
    config: &'a LinkConfig,
    cancel: &'a CancellationToken,
}

impl<'a> Handshake<'a> {
    pub fn new(
        reader: &'a mut ReadHandle,
        writer: &'a mut WriteHandle,
        keys: &'a KeyStore,
        config: &'a LinkConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            reader,
            writer,
            keys,
            config,
            cancel,
        }
    }

    /// Runs the handshake for `wallet`, the caller's current wallet identity.
    ///
    /// Reads until the device answers with a recognizable marker; there is
    /// no overall timeout, the cancellation token ends the wait.
    pub async fn run(&mut self, wallet: Option<&str>) -> Result<HandshakeOutcome, LinkError> {
        let wallet = wallet.map(str::trim).filter(|w| !w.is_empty());

        self.writer.send(&Command::Connect).await?;

        let mut response = String::new();
        loop {
            let text = read_text(self.reader, self.cancel).await?;
            debug!("auth response chunk: {:?}", text);
            response.push_str(&text);

            match marker::scan_auth(&response) {
                AuthMarker::Bound { .. } => {
                    self.await_key_marker(&mut response).await?;
                    let AuthMarker::Bound {
                        address, needs_key, ..
                    } = marker::scan_auth(&response)
                    else {
                        return Err(LinkError::ProtocolMismatch(response));
                    };
                    return self.bound(address, needs_key, wallet).await;
                }
                AuthMarker::Unbound => return self.register(wallet).await,
                AuthMarker::Pending => {}
            }
        }
    }

    /// Gives a trailing `SYMKEY:NEEDED` (or the rest of the address line) a
    /// short window to arrive.
    async fn await_key_marker(&mut self, response: &mut String) -> Result<(), LinkError> {
        let deadline = Instant::now() + self.config.timings.auth_grace();
        loop {
            if let AuthMarker::Bound {
                needs_key: true,
                complete: true,
                ..
            } = marker::scan_auth(response)
            {
                return Ok(());
            }
            match read_text_until(self.reader, self.cancel, deadline).await? {
                Some(text) => response.push_str(&text),
                None => return Ok(()),
            }
        }
    }

    async fn bound(
        &mut self,
        address: String,
        needs_key: bool,
        wallet: Option<&str>,
    ) -> Result<HandshakeOutcome, LinkError> {
        let config = self.config;

        if needs_key {
            info!("device {} needs a symmetric key", address);
            provision_symmetric_key(
                self.reader,
                self.writer,
                self.keys,
                &config.timings,
                config.strict_acknowledgements,
                self.cancel,
            )
            .await?;
            self.keys.remember_device_identity(&address)?;
            sync_clock(self.writer, config.timings.clock_sync_settle()).await;
        } else {
            let identity = DeviceIdentity::new(address.as_str());
            if let Some(wallet) = wallet {
                if !identity.matches(wallet) {
                    warn!(
                        "device is bound to {} but the connected wallet is {}",
                        address, wallet
                    );
                    return Ok(HandshakeOutcome::Mismatch {
                        device_wallet: address,
                    });
                }
            }
            info!("device identity {} accepted", identity);
            self.keys.remember_device_identity(&address)?;
        }

        self.writer.send(&Command::Start).await?;
        Ok(HandshakeOutcome::Streaming {
            device_wallet: address,
        })
    }

    async fn register(&mut self, wallet: Option<&str>) -> Result<HandshakeOutcome, LinkError> {
        let wallet = wallet.ok_or(LinkError::MissingWalletIdentity)?;
        let config = self.config;
        let timings = &config.timings;

        info!("device has no identity, registering wallet {}", wallet);
        self.writer
            .send(&Command::RegisterWallet(wallet.to_string()))
            .await?;

        let policy = RetryPolicy {
            max_attempts: timings.registration_attempts,
            per_attempt_timeout: timings.registration_timeout(),
            settle_delay: timings.registration_settle(),
        };
        let outcome = ResponsePoller::new(self.reader, self.cancel, policy)
            .poll(|response| match marker::scan_ack(response) {
                AckMarker::Pending => Verdict::Continue,
                AckMarker::Saved | AckMarker::KeyRequested => Verdict::Accept,
            })
            .await?;

        let key_requested = match outcome {
            PollOutcome::Accepted(response) => self.key_requested_after_ack(response).await?,
            PollOutcome::Exhausted { received }
                if !config.strict_acknowledgements && !received.trim().is_empty() =>
            {
                warn!(
                    "assuming wallet registered from unrecognized response {:?}",
                    received.trim()
                );
                false
            }
            PollOutcome::Exhausted { .. } | PollOutcome::Rejected(_) => {
                return Err(LinkError::RegistrationFailed(format!(
                    "no acknowledgement after {} attempts",
                    timings.registration_attempts
                )));
            }
            PollOutcome::Cancelled => return Err(LinkError::Cancelled),
            PollOutcome::EndOfStream => return Err(LinkError::EndOfStream),
        };

        if key_requested {
            info!("device requested a symmetric key after registration");
            provision_symmetric_key(
                self.reader,
                self.writer,
                self.keys,
                timings,
                config.strict_acknowledgements,
                self.cancel,
            )
            .await?;
        }

        self.keys.remember_device_identity(wallet)?;
        sync_clock(self.writer, timings.clock_sync_settle()).await;
        info!("device initialized for wallet {}", wallet);
        Ok(HandshakeOutcome::Initialized {
            wallet: wallet.to_string(),
        })
    }

    /// Keeps reading after a success acknowledgement until the grace window
    /// closes, since a key request can trail it or straddle two chunks.
    async fn key_requested_after_ack(&mut self, mut response: String) -> Result<bool, LinkError> {
        let deadline = Instant::now() + self.config.timings.post_ack_grace();
        loop {
            if marker::scan_ack(&response) == AckMarker::KeyRequested {
                return Ok(true);
            }
            match read_text_until(self.reader, self.cancel, deadline).await? {
                Some(text) => response.push_str(&text),
                None => return Ok(false),
            }
        }
    }
}
