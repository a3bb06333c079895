//! Typed IPMI commands used to establish, keep alive and tear down SOL.

use crate::error::{Error, Result};
use crate::types::{ActivatedPayload, PayloadActivationStatus, PrivilegeLevel, RawResponse};

/// Application network function.
const NETFN_APP: u8 = 0x06;

/// SOL payload type as carried in payload-management commands.
const PAYLOAD_SOL: u8 = 0x01;

/// A typed IPMI command (single request/response).
pub trait Command {
    /// Parsed output type.
    type Output;

    /// Network Function (NetFn) for the request.
    const NETFN: u8;

    /// Command number.
    const CMD: u8;

    /// Encode request payload bytes (excluding NetFn/Cmd framing).
    fn request_data(&self) -> Vec<u8>;

    /// Parse a raw response into the typed output.
    fn parse_response(&self, response: RawResponse) -> Result<Self::Output>;
}

fn ok_data(response: &RawResponse) -> Result<&[u8]> {
    if response.completion_code != 0x00 {
        return Err(Error::CompletionCode {
            completion_code: response.completion_code,
        });
    }
    Ok(&response.data)
}

/// `Set Session Privilege Level` (App NetFn, cmd 0x3B).
#[derive(Debug, Clone, Copy)]
pub struct SetSessionPrivilegeLevel {
    /// Privilege to switch the session to.
    pub privilege: PrivilegeLevel,
}

impl Command for SetSessionPrivilegeLevel {
    /// The new privilege level reported by the BMC.
    type Output = u8;
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x3B;

    fn request_data(&self) -> Vec<u8> {
        vec![self.privilege.as_u8() & 0x0F]
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let data = ok_data(&response)?;
        data.first()
            .map(|b| b & 0x0F)
            .ok_or(Error::Protocol("Set Session Privilege Level response too short"))
    }
}

/// `Get Payload Activation Status` for the SOL payload (App NetFn, cmd 0x4A).
#[derive(Debug, Clone, Copy)]
pub struct GetPayloadActivationStatus;

impl Command for GetPayloadActivationStatus {
    type Output = PayloadActivationStatus;
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x4A;

    fn request_data(&self) -> Vec<u8> {
        vec![PAYLOAD_SOL]
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let data = ok_data(&response)?;
        if data.len() < 3 {
            return Err(Error::Protocol(
                "Get Payload Activation Status response too short",
            ));
        }
        Ok(PayloadActivationStatus {
            instance_capacity: data[0] & 0x0F,
            activated: u16::from_le_bytes([data[1], data[2]]),
        })
    }
}

/// `Activate Payload` for SOL (App NetFn, cmd 0x48).
#[derive(Debug, Clone, Copy)]
pub struct ActivatePayload {
    /// Payload instance (1-based).
    pub instance: u8,
    /// Encrypt SOL packets for this payload.
    pub encryption: bool,
    /// Authenticate SOL packets for this payload.
    pub authentication: bool,
    /// Shared serial alert behavior (bits 3:2 of the auxiliary byte).
    pub serial_alert: u8,
    /// Ask the BMC to defer serial output until a startup handshake.
    pub startup_handshake: bool,
}

impl ActivatePayload {
    /// Activate `instance` with the given packet protections.
    pub fn new(instance: u8, encryption: bool, authentication: bool) -> Self {
        Self {
            instance,
            encryption,
            authentication,
            serial_alert: 0,
            startup_handshake: false,
        }
    }

    fn aux(&self) -> u8 {
        let mut aux = (self.serial_alert & 0x03) << 2;
        if self.encryption {
            aux |= 0x40;
        }
        if self.authentication {
            aux |= 0x20;
        }
        if self.startup_handshake {
            aux |= 0x02;
        }
        aux
    }
}

impl Command for ActivatePayload {
    type Output = ActivatedPayload;
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x48;

    fn request_data(&self) -> Vec<u8> {
        vec![PAYLOAD_SOL, self.instance & 0x0F, self.aux(), 0x00, 0x00, 0x00]
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let data = ok_data(&response)?;
        if data.len() < 10 {
            return Err(Error::Protocol("Activate Payload response too short"));
        }
        Ok(ActivatedPayload {
            inbound_payload_size: u16::from_le_bytes([data[4], data[5]]),
            outbound_payload_size: u16::from_le_bytes([data[6], data[7]]),
            port: u16::from_le_bytes([data[8], data[9]]),
        })
    }
}

/// `Deactivate Payload` for SOL (App NetFn, cmd 0x49).
#[derive(Debug, Clone, Copy)]
pub struct DeactivatePayload {
    /// Payload instance (1-based).
    pub instance: u8,
}

impl Command for DeactivatePayload {
    type Output = ();
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x49;

    fn request_data(&self) -> Vec<u8> {
        vec![PAYLOAD_SOL, self.instance & 0x0F, 0x00, 0x00, 0x00, 0x00]
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let _ = ok_data(&response)?;
        Ok(())
    }
}

/// `Get Channel Payload Version` for SOL (App NetFn, cmd 0x4F).
///
/// Used as the session keepalive.
#[derive(Debug, Clone, Copy)]
pub struct GetChannelPayloadVersion;

impl Command for GetChannelPayloadVersion {
    /// Format version byte (BCD, major in the high nibble).
    type Output = u8;
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x4F;

    fn request_data(&self) -> Vec<u8> {
        vec![PAYLOAD_SOL]
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let data = ok_data(&response)?;
        data.first()
            .copied()
            .ok_or(Error::Protocol("Get Channel Payload Version response too short"))
    }
}

/// `Close Session` (App NetFn, cmd 0x3C).
#[derive(Debug, Clone, Copy)]
pub struct CloseSession {
    /// The BMC's (managed system) session ID.
    pub session_id: u32,
}

impl Command for CloseSession {
    type Output = ();
    const NETFN: u8 = NETFN_APP;
    const CMD: u8 = 0x3C;

    fn request_data(&self) -> Vec<u8> {
        self.session_id.to_le_bytes().to_vec()
    }

    fn parse_response(&self, response: RawResponse) -> Result<Self::Output> {
        let _ = ok_data(&response)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_payload_aux_bits() {
        let mut cmd = ActivatePayload::new(2, true, true);
        assert_eq!(cmd.request_data(), vec![0x01, 0x02, 0x60, 0, 0, 0]);
        cmd.serial_alert = 0x01;
        cmd.startup_handshake = true;
        assert_eq!(cmd.request_data()[2], 0x66);
        assert_eq!(ActivatePayload::new(1, false, false).request_data()[2], 0x00);
    }

    #[test]
    fn payload_version_requires_data() {
        let empty = RawResponse {
            completion_code: 0,
            data: Vec::new(),
        };
        assert!(GetChannelPayloadVersion.parse_response(empty).is_err());
    }
}
