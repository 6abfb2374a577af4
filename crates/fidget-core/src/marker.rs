//! Response marker classification.
//!
//! The device answers with loosely formatted text that may arrive split over
//! several reads. Every scan here works on the accumulated response so far,
//! using substring matches.

pub const WALLET_MARKER: &str = "Y:";
pub const NO_IDENTITY_MARKER: &str = "N";
pub const KEY_NEEDED_MARKER: &str = "SYMKEY:NEEDED";
pub const KEY_REQUEST_MARKER: &str = "NEED_SYMKEY";

/// Checked before the rejection list; `SYMKEY_OK` is covered by `OK`.
pub const PROVISION_SUCCESS_MARKERS: &[&str] = &["SYMKEY_OK", "OK", "SUCCESS"];
pub const PROVISION_FAILURE_MARKERS: &[&str] = &["Failed", "ERROR", "Invalid"];

/// Compared case-insensitively.
pub const REGISTRATION_SUCCESS_MARKERS: &[&str] = &["OK", "ACK", "SAVED", "SUCCESS"];

/// Result of scanning the authentication response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMarker {
    /// The device already carries a wallet identity.
    Bound {
        address: String,
        needs_key: bool,
        /// A line terminator followed the address.
        complete: bool,
    },
    /// The device has no identity and wants a wallet bound to it.
    Unbound,
    /// Nothing recognizable yet.
    Pending,
}

/// Scans an authentication response. The wallet marker wins over the
/// no-identity marker when both are present.
pub fn scan_auth(response: &str) -> AuthMarker {
    if let Some(idx) = find_wallet_marker(response) {
        let rest = &response[idx + WALLET_MARKER.len()..];
        let trimmed = rest.trim_start();
        let line_end = trimmed.find(|c: char| c == '\n' || c == '\r');
        let line = match line_end {
            Some(end) => &trimmed[..end],
            None => trimmed,
        };
        let address = line.split_whitespace().next().unwrap_or_default();
        if address.is_empty() {
            return AuthMarker::Pending;
        }
        return AuthMarker::Bound {
            address: address.to_string(),
            needs_key: response.contains(KEY_NEEDED_MARKER),
            complete: line_end.is_some(),
        };
    }

    if response.contains(NO_IDENTITY_MARKER) {
        return AuthMarker::Unbound;
    }

    AuthMarker::Pending
}

/// Finds a `Y:` that starts a token, so the tail of `SYMKEY:` is skipped.
fn find_wallet_marker(response: &str) -> Option<usize> {
    response.match_indices(WALLET_MARKER).map(|(idx, _)| idx).find(|&idx| {
        response[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_ascii_alphanumeric() && c != '_')
    })
}

/// Result of scanning a key provisioning response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionMarker {
    Accepted,
    Rejected,
    /// Text arrived but matched neither list; the device may still be working.
    Unrecognized,
    Silent,
}

pub fn scan_provision(response: &str) -> ProvisionMarker {
    if PROVISION_SUCCESS_MARKERS.iter().any(|m| response.contains(m)) {
        ProvisionMarker::Accepted
    } else if is_error_response(response) {
        ProvisionMarker::Rejected
    } else if response.trim().is_empty() {
        ProvisionMarker::Silent
    } else {
        ProvisionMarker::Unrecognized
    }
}

pub fn is_error_response(response: &str) -> bool {
    PROVISION_FAILURE_MARKERS.iter().any(|m| response.contains(m))
}

/// Result of scanning a wallet registration acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMarker {
    /// The device wants a symmetric key next.
    KeyRequested,
    Saved,
    Pending,
}

pub fn scan_ack(response: &str) -> AckMarker {
    if response.contains(KEY_REQUEST_MARKER) {
        return AckMarker::KeyRequested;
    }
    let upper = response.to_ascii_uppercase();
    if REGISTRATION_SUCCESS_MARKERS.iter().any(|m| upper.contains(m)) {
        AckMarker::Saved
    } else {
        AckMarker::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_marker_extracts_first_line() {
        let marker = scan_auth("Y:0xAbC123\r\nSYMKEY:NEEDED\n");
        assert_eq!(
            marker,
            AuthMarker::Bound {
                address: "0xAbC123".into(),
                needs_key: true,
                complete: true,
            }
        );
    }

    #[test]
    fn wallet_marker_without_terminator_is_incomplete() {
        let marker = scan_auth("Y: 0xabc");
        assert_eq!(
            marker,
            AuthMarker::Bound {
                address: "0xabc".into(),
                needs_key: false,
                complete: false,
            }
        );
    }

    #[test]
    fn wallet_marker_without_address_is_pending() {
        assert_eq!(scan_auth("Y:"), AuthMarker::Pending);
        assert_eq!(scan_auth("Y:  "), AuthMarker::Pending);
    }

    #[test]
    fn wallet_marker_wins_over_no_identity() {
        // "SYMKEY:NEEDED" contains an 'N' as well.
        let marker = scan_auth("N\nY:0x1\n");
        assert!(matches!(marker, AuthMarker::Bound { .. }));
        assert_eq!(scan_auth("N\n"), AuthMarker::Unbound);
        assert_eq!(scan_auth("booting...\n"), AuthMarker::Pending);
    }

    #[test]
    fn key_needed_marker_is_not_a_wallet_marker() {
        assert_eq!(scan_auth("SYMKEY:NEEDED\n"), AuthMarker::Unbound);
        assert_eq!(
            scan_auth("SYMKEY:NEEDED\nY:0xfe\n"),
            AuthMarker::Bound {
                address: "0xfe".into(),
                needs_key: true,
                complete: true,
            }
        );
    }

    #[test]
    fn provision_success_checked_before_failure() {
        assert_eq!(scan_provision("SYMKEY_OK"), ProvisionMarker::Accepted);
        assert_eq!(scan_provision("OK ERROR"), ProvisionMarker::Accepted);
        assert_eq!(scan_provision("Invalid key"), ProvisionMarker::Rejected);
        assert_eq!(scan_provision("Failed"), ProvisionMarker::Rejected);
        assert_eq!(scan_provision("working"), ProvisionMarker::Unrecognized);
        assert_eq!(scan_provision("\r\n"), ProvisionMarker::Silent);
    }

    #[test]
    fn ack_is_case_insensitive() {
        assert_eq!(scan_ack("ok"), AckMarker::Saved);
        assert_eq!(scan_ack("Wallet saved"), AckMarker::Saved);
        assert_eq!(scan_ack("ack"), AckMarker::Saved);
        assert_eq!(scan_ack("OK\nNEED_SYMKEY"), AckMarker::KeyRequested);
        assert_eq!(scan_ack("W:0xabc"), AckMarker::Pending);
    }
}
