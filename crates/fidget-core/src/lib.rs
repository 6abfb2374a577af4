//! Core Smart Fidget device protocol types.
//!
//! This crate provides:
//! - The link state machine driven by the connection handshake
//! - Textual device commands and response marker classification
//! - Session records and device payload parsing
//! - Daily summary aggregation over decrypted session records

#![forbid(unsafe_code)]

pub mod command;
pub mod marker;
pub mod payload;
pub mod record;
pub mod summary;

pub use command::Command;
pub use marker::{AckMarker, AuthMarker, ProvisionMarker};
pub use payload::{DevicePayload, PayloadScan};
pub use record::{DecryptMethod, DeviceIdentity, SessionRecord};
pub use summary::{DailySummary, MainActivity};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default baud rate of the device's USB serial bridge.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Length of a symmetric key in bytes.
pub const SYMMETRIC_KEY_BYTES: usize = 64;

/// Length of the hex-encoded symmetric key.
pub const SYMMETRIC_KEY_HEX_LEN: usize = SYMMETRIC_KEY_BYTES * 2;

/// Persisted field holding the wallet the device last registered with.
pub const DEVICE_WALLET_FIELD: &str = "deviceWallet";

/// Persisted field holding the hex-encoded symmetric key.
pub const DEVICE_KEY_FIELD: &str = "deviceEncryptionKey";

/// Connection state of one device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Authenticating,
    WalletMismatch,
    Connected,
    Initialized,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::WalletMismatch => "wallet_mismatch",
            Self::Connected => "connected",
            Self::Initialized => "initialized",
        }
    }

    /// True while an attempt holds (or is acquiring) the port.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticating | Self::Connected | Self::Initialized
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connect,
    PortReady,
    Authenticated,
    Registered,
    Mismatch,
    Abort,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTransition {
    pub from: LinkState,
    pub to: LinkState,
    pub event: LinkEvent,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid link transition from {0} via {1:?}")]
    Invalid(LinkState, LinkEvent),
}

/// Owner of the single `LinkState` value for a device link.
///
/// Transitions are the only way to change the state.
#[derive(Debug, Clone)]
pub struct LinkMachine {
    state: LinkState,
}

impl Default for LinkMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMachine {
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn on_connect(&mut self) -> Result<LinkTransition, TransitionError> {
        match self.state {
            LinkState::Disconnected => self.transition(LinkEvent::Connect, LinkState::Connecting),
            _ => Err(TransitionError::Invalid(self.state, LinkEvent::Connect)),
        }
    }

    pub fn on_port_ready(&mut self) -> Result<LinkTransition, TransitionError> {
        match self.state {
            LinkState::Connecting => {
                self.transition(LinkEvent::PortReady, LinkState::Authenticating)
            }
            _ => Err(TransitionError::Invalid(self.state, LinkEvent::PortReady)),
        }
    }

    pub fn on_authenticated(&mut self) -> Result<LinkTransition, TransitionError> {
        match self.state {
            LinkState::Authenticating => {
                self.transition(LinkEvent::Authenticated, LinkState::Connected)
            }
            _ => Err(TransitionError::Invalid(self.state, LinkEvent::Authenticated)),
        }
    }

    pub fn on_registered(&mut self) -> Result<LinkTransition, TransitionError> {
        match self.state {
            LinkState::Authenticating => {
                self.transition(LinkEvent::Registered, LinkState::Initialized)
            }
            _ => Err(TransitionError::Invalid(self.state, LinkEvent::Registered)),
        }
    }

    pub fn on_mismatch(&mut self) -> Result<LinkTransition, TransitionError> {
        match self.state {
            LinkState::Authenticating => {
                self.transition(LinkEvent::Mismatch, LinkState::WalletMismatch)
            }
            _ => Err(TransitionError::Invalid(self.state, LinkEvent::Mismatch)),
        }
    }

    /// A failed attempt falls back to `Disconnected`.
    pub fn on_abort(&mut self) -> Result<LinkTransition, TransitionError> {
        match self.state {
            LinkState::Connecting | LinkState::Authenticating => {
                self.transition(LinkEvent::Abort, LinkState::Disconnected)
            }
            _ => Err(TransitionError::Invalid(self.state, LinkEvent::Abort)),
        }
    }

    /// Teardown is legal from every state, including `Disconnected`.
    pub fn on_disconnect(&mut self) -> LinkTransition {
        let from = self.state;
        self.state = LinkState::Disconnected;
        LinkTransition {
            from,
            to: LinkState::Disconnected,
            event: LinkEvent::Disconnect,
        }
    }

    fn transition(
        &mut self,
        event: LinkEvent,
        next: LinkState,
    ) -> Result<LinkTransition, TransitionError> {
        let from = self.state;
        self.state = next;
        Ok(LinkTransition {
            from,
            to: next,
            event,
        })
    }
}
