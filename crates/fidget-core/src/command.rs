//! Textual commands sent to the device.
//!
//! Commands are plain ASCII with no length framing:
//!
//! ```text
//! C                      initiate connection
//! W:<address>            register wallet address
//! P:<hex key>            register symmetric key
//! S                      start data streaming
//! T:<YYYY-MM-DD HH:MM:SS> set device clock
//! D\n                    disconnect
//! ```

use std::fmt;

/// Format of the `T:` clock stamp, as understood by the device firmware.
pub const CLOCK_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    RegisterWallet(String),
    RegisterKey(String),
    Start,
    SetClock(String),
    Disconnect,
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Connect => b"C".to_vec(),
            Self::RegisterWallet(address) => format!("W:{}", address).into_bytes(),
            Self::RegisterKey(key_hex) => format!("P:{}", key_hex).into_bytes(),
            Self::Start => b"S".to_vec(),
            Self::SetClock(stamp) => format!("T:{}", stamp).into_bytes(),
            // Trailing newline helps the firmware's line parser.
            Self::Disconnect => b"D\n".to_vec(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::RegisterWallet(_) => "register-wallet",
            Self::RegisterKey(_) => "register-key",
            Self::Start => "start",
            Self::SetClock(_) => "set-clock",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Abbreviates secret material so it can be logged.
pub fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(10).collect();
    format!("{}...", prefix)
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("C"),
            Self::RegisterWallet(address) => write!(f, "W:{}", address),
            Self::RegisterKey(key_hex) => write!(f, "P:{}", redact(key_hex)),
            Self::Start => f.write_str("S"),
            Self::SetClock(stamp) => write!(f, "T:{}", stamp),
            Self::Disconnect => f.write_str("D"),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self)
    }
}
