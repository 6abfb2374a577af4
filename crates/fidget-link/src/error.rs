//! Link error types.

use fidget_core::{LinkState, TransitionError};
use fidget_crypto::KeyError;
use thiserror::Error;

/// Serial channel errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// This build or platform has no serial port access.
    #[error("transport unavailable: serial port access is not supported")]
    NoHardwareSupport,

    #[error("port unavailable: {0}")]
    PortUnavailable(String),

    #[error("reader is already locked")]
    ReaderLocked,

    #[error("writer is already locked")]
    WriterLocked,

    /// A read or write handle is still outstanding.
    #[error("cannot close port: {0} stream still locked")]
    StillLocked(&'static str),

    #[error("channel is closed")]
    Closed,

    /// The handle's lease was broken by a force unlock.
    #[error("handle was forcibly released")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key store is not valid JSON: {0}")]
    Format(String),

    /// The persisted symmetric key cannot be parsed. It is never silently
    /// regenerated, since the device still holds the old one.
    #[error("stored symmetric key is corrupt: {0}")]
    CorruptKey(#[from] KeyError),
}

/// Errors that abort a link attempt. Every one of them leaves the link
/// `Disconnected`.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unexpected device response: {0}")]
    ProtocolMismatch(String),

    #[error("wallet registration failed: {0}")]
    RegistrationFailed(String),

    #[error("symmetric key provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("no wallet connected, cannot register device")]
    MissingWalletIdentity,

    #[error("operation cancelled")]
    Cancelled,

    #[error("device closed the stream")]
    EndOfStream,

    #[error("link is busy ({0})")]
    Busy(LinkState),

    #[error("cannot send command: no writer available or stream is locked")]
    NoWriter,

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl LinkError {
    /// A diagnostic suitable for showing next to the "disconnected" state.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Transport(TransportError::NoHardwareSupport) => {
                "Serial ports are not supported on this system.".to_string()
            }
            Self::Transport(TransportError::PortUnavailable(_)) => {
                "Failed to connect to port.".to_string()
            }
            Self::MissingWalletIdentity => {
                "No wallet connected, cannot authenticate device.".to_string()
            }
            other => other.to_string(),
        }
    }
}
