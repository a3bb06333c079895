use core::fmt;

use crate::protocol::algorithm;

/// The privilege level requested for the IPMI session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrivilegeLevel {
    /// Callback privilege.
    Callback = 0x01,
    /// User privilege.
    User = 0x02,
    /// Operator privilege.
    Operator = 0x03,
    /// Administrator privilege.
    Administrator = 0x04,
    /// OEM-defined privilege.
    Oem = 0x05,
}

impl PrivilegeLevel {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }
}

/// RMCP+ cipher suites supported by the session engine.
///
/// All suites authenticate with RAKP-HMAC-SHA1; they differ in whether session
/// packets carry an HMAC-SHA1-96 integrity trailer and whether payloads are
/// encrypted with AES-CBC-128.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// Cipher suite ID 1: RAKP-HMAC-SHA1, no integrity, no confidentiality.
    RakpHmacSha1,
    /// Cipher suite ID 2: RAKP-HMAC-SHA1, HMAC-SHA1-96, no confidentiality.
    HmacSha1Integrity,
    /// Cipher suite ID 3: RAKP-HMAC-SHA1, HMAC-SHA1-96, AES-CBC-128.
    HmacSha1AesCbc128,
}

impl CipherSuite {
    /// Look up a suite by its IPMI cipher suite ID.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(CipherSuite::RakpHmacSha1),
            2 => Some(CipherSuite::HmacSha1Integrity),
            3 => Some(CipherSuite::HmacSha1AesCbc128),
            _ => None,
        }
    }

    /// The IPMI cipher suite ID.
    pub fn id(self) -> u8 {
        match self {
            CipherSuite::RakpHmacSha1 => 1,
            CipherSuite::HmacSha1Integrity => 2,
            CipherSuite::HmacSha1AesCbc128 => 3,
        }
    }

    /// (authentication, integrity, confidentiality) algorithm numbers.
    pub(crate) fn algorithms(self) -> (u8, u8, u8) {
        let auth = algorithm::AUTH_RAKP_HMAC_SHA1;
        match self {
            CipherSuite::RakpHmacSha1 => (auth, algorithm::NONE, algorithm::NONE),
            CipherSuite::HmacSha1Integrity => {
                (auth, algorithm::INTEGRITY_HMAC_SHA1_96, algorithm::NONE)
            }
            CipherSuite::HmacSha1AesCbc128 => (
                auth,
                algorithm::INTEGRITY_HMAC_SHA1_96,
                algorithm::CONFIDENTIALITY_AES_CBC_128,
            ),
        }
    }
}

impl Default for CipherSuite {
    fn default() -> Self {
        CipherSuite::HmacSha1AesCbc128
    }
}

/// Where a submitted session is in its lifecycle, as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The session has not been handed to an engine yet.
    NotSubmitted,
    /// The engine owns the session and is establishing it.
    Submitted,
    /// The SOL payload is active; console bytes flow.
    Established,
    /// The session ended with an error; see `SessionHandle::error_code`.
    Error,
    /// The session ended cleanly.
    Stopped,
    /// A deactivate-only session successfully deactivated the SOL payload.
    Deactivated,
}

impl SessionStatus {
    /// Whether the session has been torn down.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Error | SessionStatus::Stopped | SessionStatus::Deactivated
        )
    }
}

/// A raw IPMI response.
#[derive(Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// IPMI completion code.
    pub completion_code: u8,
    /// Payload bytes after the completion code.
    pub data: Vec<u8>,
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponse")
            .field(
                "completion_code",
                &format_args!("{:#04x}", self.completion_code),
            )
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Parsed response for `Get Payload Activation Status` (SOL payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadActivationStatus {
    /// Number of SOL instances the BMC supports (1-16).
    pub instance_capacity: u8,
    /// Bit `n` set means instance `n + 1` is currently active.
    pub activated: u16,
}

impl PayloadActivationStatus {
    /// Number of currently active instances.
    pub fn activated_count(&self) -> u32 {
        self.activated.count_ones()
    }

    /// Lowest instance number (1-based) that is not active, if any.
    pub fn first_free_instance(&self) -> Option<u8> {
        (1..=self.instance_capacity.min(16)).find(|i| !self.is_active(*i))
    }

    /// Whether the given 1-based instance is active.
    pub fn is_active(&self, instance: u8) -> bool {
        if instance == 0 || instance > 16 {
            return false;
        }
        self.activated & (1 << (instance - 1)) != 0
    }
}

/// Parsed response for `Activate Payload` (SOL payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivatedPayload {
    /// Largest SOL payload the BMC accepts from the remote console.
    pub inbound_payload_size: u16,
    /// Largest SOL payload the BMC sends to the remote console.
    pub outbound_payload_size: u16,
    /// UDP port SOL packets must be sent to.
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_suite_ids_round_trip() {
        for id in 1..=3 {
            let suite = CipherSuite::from_id(id).expect("known id");
            assert_eq!(suite.id(), id);
        }
        assert!(CipherSuite::from_id(0).is_none());
        assert!(CipherSuite::from_id(17).is_none());
    }

    #[test]
    fn first_free_instance_skips_active_slots() {
        let status = PayloadActivationStatus {
            instance_capacity: 3,
            activated: 0b011,
        };
        assert_eq!(status.first_free_instance(), Some(3));
        assert_eq!(status.activated_count(), 2);

        let full = PayloadActivationStatus {
            instance_capacity: 1,
            activated: 0b1,
        };
        assert_eq!(full.first_free_instance(), None);
        assert!(full.is_active(1));
        assert!(!full.is_active(0));
    }
}
