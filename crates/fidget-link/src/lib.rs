//! Smart Fidget device link engine.
//!
//! Drives one device over a serial channel: the connect/authenticate
//! handshake, symmetric key provisioning, the streaming reader, payload
//! decryption and the best-effort disconnect sequence. Everything hangs off
//! an owned [`LinkSession`].
//!
//! ```no_run
//! use fidget_common::LinkConfig;
//! use fidget_link::{KeyStore, LinkSession, PayloadStatus, SerialOpener};
//!
//! # async fn demo() -> Result<(), fidget_link::LinkError> {
//! let config = LinkConfig::default();
//! let opener = SerialOpener::new(config.port.clone(), config.baud_rate);
//! let mut session = LinkSession::new(opener, KeyStore::in_memory(), config);
//!
//! session.connect(Some("0xabc")).await?;
//! if let PayloadStatus::Decrypted { batch, .. } = session.wait_for_payload().await? {
//!     println!("{} sessions", batch.records.len());
//! }
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod disconnect;
pub mod error;
pub mod handshake;
pub mod key_store;
pub mod provision;
pub mod reader;
pub mod retry;
pub mod session;
pub mod transport;

pub use error::{KeyStoreError, LinkError, TransportError};
pub use handshake::{Handshake, HandshakeOutcome};
pub use key_store::{FileStore, KeyStore, KeyValueStore, MemoryStore};
pub use reader::ReaderExit;
pub use retry::{PollOutcome, ResponsePoller, RetryPolicy, Verdict};
pub use session::{LinkSession, PayloadStatus};
pub use transport::{
    available_ports, Channel, MemoryPort, PortInfo, PortOpener, ReadHandle, SerialOpener,
    WriteHandle,
};
