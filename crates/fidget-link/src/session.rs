//! The owned link session.
//!
//! A [`LinkSession`] owns everything one device link needs: the state
//! machine, the open channel and its handles, the streaming reader and the
//! buffers it fills. Callers hold the session and pass it to whatever needs
//! it; there is no global link object.

use std::sync::Arc;

use fidget_common::LinkConfig;
use fidget_core::payload::{self, PayloadScan};
use fidget_core::{Command, LinkMachine, LinkState, LinkTransition};
use fidget_crypto::{DecryptedBatch, PayloadDecryptor};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::LinkError;
use crate::handshake::{self, Handshake, HandshakeOutcome};
use crate::key_store::KeyStore;
use crate::reader::{spawn_reader, ReaderExit};
use crate::transport::{Channel, PortOpener, WriteHandle};

/// Shown when the raw buffer holds a brace-delimited span that is not JSON.
pub const INVALID_JSON: &str = "Invalid JSON format received from device";

/// What the device streamed after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadStatus {
    /// The payload's `data` array was empty. The session disconnected
    /// itself once the auto-disconnect delay ran out.
    NoData,
    /// Every entry was decrypted or passed through. `document` is the
    /// payload with its `data` array replaced by the records.
    Decrypted {
        batch: DecryptedBatch,
        document: Value,
    },
    /// Not a device payload; the raw text is kept as is.
    Opaque(String),
}

pub struct LinkSession {
    opener: Arc<dyn PortOpener>,
    pub(crate) keys: KeyStore,
    pub(crate) config: LinkConfig,
    pub(crate) machine: LinkMachine,
    state_tx: watch::Sender<LinkState>,
    pub(crate) raw: Arc<watch::Sender<String>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) channel: Option<Channel>,
    pub(crate) writer: Option<WriteHandle>,
    pub(crate) reader_task: Option<JoinHandle<ReaderExit>>,
    device_wallet: Option<String>,
    pub(crate) data: Option<Value>,
    pub(crate) data_available: bool,
    pub(crate) decryption_error: Option<String>,
    last_error: Option<String>,
    auto_disconnect_at: Option<Instant>,
}

impl LinkSession {
    /// Starts disconnected, with the device wallet remembered by `keys`.
    pub fn new(opener: impl PortOpener + 'static, keys: KeyStore, config: LinkConfig) -> Self {
        let device_wallet = match keys.device_identity() {
            Ok(identity) => identity.map(|identity| identity.wallet_address),
            Err(e) => {
                warn!("failed to load the remembered device wallet: {}", e);
                None
            }
        };
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        let (raw, _) = watch::channel(String::new());
        Self {
            opener: Arc::new(opener),
            keys,
            config,
            machine: LinkMachine::new(),
            state_tx,
            raw: Arc::new(raw),
            cancel: CancellationToken::new(),
            channel: None,
            writer: None,
            reader_task: None,
            device_wallet,
            data: None,
            data_available: false,
            decryption_error: None,
            last_error: None,
            auto_disconnect_at: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.machine.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_raw(&self) -> watch::Receiver<String> {
        self.raw.subscribe()
    }

    /// The token the current attempt observes. Cancelling it interrupts the
    /// handshake or stops the streaming reader.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn raw_data(&self) -> String {
        self.raw.borrow().clone()
    }

    /// The decrypted payload document, or the raw text of an opaque one.
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn data_available(&self) -> bool {
        self.data_available
    }

    pub fn decryption_error(&self) -> Option<&str> {
        self.decryption_error.as_deref()
    }

    /// Diagnostic of the last failed attempt.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// The wallet the device reported or was registered with. Before the
    /// first handshake, the one the key store remembers.
    pub fn device_wallet(&self) -> Option<&str> {
        self.device_wallet.as_deref()
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// The open port, while the session holds one.
    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub(crate) fn publish(&self, transition: LinkTransition) {
        debug!(
            "link {} -> {} ({:?})",
            transition.from, transition.to, transition.event
        );
        self.state_tx.send_replace(transition.to);
    }

    /// Every return to `Disconnected` arms a fresh token for the next attempt.
    pub(crate) fn enter_disconnected(&mut self) {
        let transition = self.machine.on_disconnect();
        self.publish(transition);
        self.cancel = CancellationToken::new();
    }

    pub(crate) fn clear_session_data(&mut self) {
        self.raw.send_replace(String::new());
        self.data = None;
        self.data_available = false;
        self.decryption_error = None;
        self.auto_disconnect_at = None;
    }

    /// Connects to the device and runs the handshake for `wallet`.
    ///
    /// Returns the state the attempt settled in: `Connected` (streaming),
    /// `Initialized` (registered, not streaming) or `WalletMismatch`. Any
    /// error leaves the session `Disconnected` with every handle released.
    pub async fn connect(&mut self, wallet: Option<&str>) -> Result<LinkState, LinkError> {
        match self.machine.state() {
            LinkState::Disconnected => {}
            LinkState::WalletMismatch => self.enter_disconnected(),
            state => return Err(LinkError::Busy(state)),
        }

        self.clear_session_data();
        self.last_error = None;
        let transition = self.machine.on_connect()?;
        self.publish(transition);

        let channel = match self.opener.open() {
            Ok(channel) => channel,
            Err(e) => return Err(self.abort(e.into())),
        };
        info!("opened port {}", channel.name());

        let handles = channel
            .acquire_reader()
            .and_then(|reader| Ok((reader, channel.acquire_writer()?)));
        let (mut reader, mut writer) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                self.channel = Some(channel);
                return Err(self.abort(e.into()));
            }
        };
        self.channel = Some(channel.clone());
        let transition = self.machine.on_port_ready()?;
        self.publish(transition);

        let cancel = self.cancel.clone();
        let outcome = Handshake::new(&mut reader, &mut writer, &self.keys, &self.config, &cancel)
            .run(wallet)
            .await;

        match outcome {
            Ok(HandshakeOutcome::Streaming { device_wallet }) => {
                reader.release();
                let stream_reader = match channel.acquire_reader() {
                    Ok(reader) => reader,
                    Err(e) => {
                        drop(writer);
                        return Err(self.abort(e.into()));
                    }
                };
                let transition = self.machine.on_authenticated()?;
                self.publish(transition);
                self.device_wallet = Some(device_wallet);
                self.writer = Some(writer);
                self.reader_task = Some(spawn_reader(
                    stream_reader,
                    self.raw.clone(),
                    self.cancel.clone(),
                ));
                Ok(LinkState::Connected)
            }
            Ok(HandshakeOutcome::Initialized { wallet }) => {
                reader.release();
                let transition = self.machine.on_registered()?;
                self.publish(transition);
                self.device_wallet = Some(wallet);
                self.writer = Some(writer);
                Ok(LinkState::Initialized)
            }
            Ok(HandshakeOutcome::Mismatch { device_wallet }) => {
                reader.release();
                writer.release();
                self.close_channel();
                let transition = self.machine.on_mismatch()?;
                self.publish(transition);
                self.device_wallet = Some(device_wallet);
                Ok(LinkState::WalletMismatch)
            }
            Err(e) => {
                reader.release();
                writer.release();
                Err(self.abort(e))
            }
        }
    }

    /// Releases the attempt's resources and falls back to `Disconnected`.
    fn abort(&mut self, error: LinkError) -> LinkError {
        match &error {
            LinkError::Cancelled => info!("connection attempt cancelled"),
            e => error!("connection attempt failed: {}", e),
        }
        self.writer = None;
        self.close_channel();
        match self.machine.on_abort() {
            Ok(transition) => {
                self.publish(transition);
                self.cancel = CancellationToken::new();
            }
            Err(_) => self.enter_disconnected(),
        }
        self.last_error = Some(error.diagnostic());
        error
    }

    fn close_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close() {
                warn!("failed to close port {}: {}", channel.name(), e);
            }
        }
    }

    /// Waits for the streamed payload and decrypts it.
    ///
    /// Resolves as soon as the raw buffer holds a complete JSON object, or
    /// when the reader stops. A stream that ended with text but no JSON
    /// object is returned as opaque. An empty payload disconnects the
    /// session after `auto_disconnect_ms` before [`PayloadStatus::NoData`]
    /// is returned; cancelling the session token skips the wait.
    pub async fn wait_for_payload(&mut self) -> Result<PayloadStatus, LinkError> {
        let status = self.receive_payload().await?;
        if matches!(status, PayloadStatus::NoData) {
            self.run_auto_disconnect().await;
        }
        Ok(status)
    }

    async fn receive_payload(&mut self) -> Result<PayloadStatus, LinkError> {
        let mut raw_rx = self.raw.subscribe();
        let cancel = self.cancel.clone();

        loop {
            let raw = raw_rx.borrow_and_update().clone();
            match payload::scan(&raw) {
                PayloadScan::Document(document) => return self.accept_payload(document),
                PayloadScan::Opaque => return Ok(self.accept_opaque(raw)),
                PayloadScan::Pending { malformed } => {
                    if let Some(reason) = malformed {
                        debug!("payload not parseable yet: {}", reason);
                        self.decryption_error = Some(INVALID_JSON.to_string());
                    }
                }
            }

            let Some(task) = self.reader_task.as_mut() else {
                return self.finish_without_payload(raw, None);
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LinkError::Cancelled),
                _ = raw_rx.changed() => {}
                exit = task => {
                    self.reader_task = None;
                    let exit = exit.unwrap_or_else(|e| {
                        ReaderExit::Failed(std::io::Error::other(e.to_string()).into())
                    });
                    // Pick up whatever the reader appended last.
                    let raw = self.raw.borrow().clone();
                    return match payload::scan(&raw) {
                        PayloadScan::Document(document) => self.accept_payload(document),
                        PayloadScan::Opaque => Ok(self.accept_opaque(raw)),
                        PayloadScan::Pending { .. } => self.finish_without_payload(raw, Some(exit)),
                    };
                }
            }
        }
    }

    fn accept_payload(
        &mut self,
        document: payload::DevicePayload,
    ) -> Result<PayloadStatus, LinkError> {
        if document.is_empty() {
            info!("device has no sessions to upload");
            self.data = Some(document.with_entries(Vec::new()));
            self.data_available = false;
            self.decryption_error = None;
            self.auto_disconnect_at = Some(Instant::now() + self.config.timings.auto_disconnect());
            return Ok(PayloadStatus::NoData);
        }

        let key = self.keys.symmetric_key()?;
        if key.is_none() {
            warn!("symmetric key not found, encrypted sessions cannot be decrypted");
        }
        let batch = PayloadDecryptor::new(key, self.config.secret_phrase.as_str())
            .decrypt_entries(document.entries());
        let processed = document.with_entries(batch.to_values());

        self.data = Some(processed.clone());
        self.data_available = batch.any_success;
        self.decryption_error = batch.diagnostic().map(str::to_string);
        Ok(PayloadStatus::Decrypted {
            batch,
            document: processed,
        })
    }

    fn accept_opaque(&mut self, raw: String) -> PayloadStatus {
        info!("device sent data that is not a session payload");
        self.data = Some(Value::String(raw.clone()));
        self.data_available = true;
        PayloadStatus::Opaque(raw)
    }

    fn finish_without_payload(
        &mut self,
        raw: String,
        exit: Option<ReaderExit>,
    ) -> Result<PayloadStatus, LinkError> {
        if !raw.trim().is_empty() {
            return Ok(self.accept_opaque(raw));
        }
        match exit {
            Some(ReaderExit::Cancelled) => Err(LinkError::Cancelled),
            Some(ReaderExit::Failed(e)) => Err(e.into()),
            Some(ReaderExit::EndOfStream) | None => Err(LinkError::EndOfStream),
        }
    }

    async fn run_auto_disconnect(&mut self) {
        let Some(due) = self.auto_disconnect_at.take() else {
            return;
        };
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => debug!("auto-disconnect wait cancelled"),
            _ = time::sleep_until(due) => {}
        }
        info!("no data available, disconnecting");
        self.disconnect().await;
    }

    /// Sends an ad-hoc command through the held writer, or through a
    /// temporary one when the port is open and its writer is free.
    pub async fn send_command(&mut self, command: &Command) -> Result<(), LinkError> {
        if let Some(writer) = self.writer.as_mut() {
            return Ok(writer.send(command).await?);
        }
        let channel = self.channel.as_ref().ok_or(LinkError::NoWriter)?;
        if channel.is_writer_locked() {
            return Err(LinkError::NoWriter);
        }
        let mut writer = channel.acquire_writer()?;
        let sent = writer.send(command).await;
        writer.release();
        Ok(sent?)
    }

    /// Sets the device clock through the held writer. Does nothing without one.
    pub async fn sync_clock(&mut self) {
        let settle = self.config.timings.clock_sync_settle();
        match self.writer.as_mut() {
            Some(writer) => handshake::sync_clock(writer, settle).await,
            None => debug!("no writer held, skipping clock sync"),
        }
    }

    /// Stops any activity and forgets the device's remembered wallet. The
    /// symmetric key is kept.
    pub async fn reset_device(&mut self) -> Result<(), LinkError> {
        info!("resetting device connection");
        self.cancel.cancel();
        if let Some(task) = self.reader_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.writer = None;
        self.close_channel();
        self.clear_session_data();
        self.device_wallet = None;
        self.enter_disconnected();
        self.keys.forget_device_identity()?;
        Ok(())
    }
}
