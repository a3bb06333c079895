//! RMCP+ wire codec: session packets, session-setup payloads and IPMI LAN
//! messages.

use rand::RngCore;

use crate::crypto::{
    AES_BLOCK_LEN, INTEGRITY_CODE_LEN, SHA1_KEY_LEN, SessionKeys, hmac_sha1, hmac_sha1_96,
};
use crate::error::{Error, Result};
use crate::types::{CipherSuite, PrivilegeLevel, RawResponse};

/// RMCP header values.
const RMCP_VERSION: u8 = 0x06;
const RMCP_RESERVED: u8 = 0x00;
const RMCP_SEQ_NO_ACK: u8 = 0xFF;
const RMCP_CLASS_IPMI: u8 = 0x07;

/// RMCP+ session auth type/format.
const RMCPPLUS_AUTH_TYPE: u8 = 0x06;

/// RMCP+ session trailer next header value.
const RMCPPLUS_NEXT_HEADER: u8 = 0x07;

/// RMCP header (4) + RMCP+ session header (12).
const HEADER_LEN: usize = 16;

/// Default RMCP+ port on the BMC.
pub const RMCP_PRIMARY_PORT: u16 = 623;

/// Payload type numbers (IPMI v2.0 Table 13-16).
pub(crate) mod payload_type {
    /// Standard IPMI message.
    pub const IPMI: u8 = 0x00;
    /// Serial-over-LAN.
    pub const SOL: u8 = 0x01;
    /// RMCP+ Open Session Request.
    pub const OPEN_SESSION_REQUEST: u8 = 0x10;
    /// RMCP+ Open Session Response.
    pub const OPEN_SESSION_RESPONSE: u8 = 0x11;
    /// RAKP Message 1.
    pub const RAKP_1: u8 = 0x12;
    /// RAKP Message 2.
    pub const RAKP_2: u8 = 0x13;
    /// RAKP Message 3.
    pub const RAKP_3: u8 = 0x14;
    /// RAKP Message 4.
    pub const RAKP_4: u8 = 0x15;
}

/// Algorithm numbers understood by this crate.
pub(crate) mod algorithm {
    /// No integrity / no confidentiality.
    pub const NONE: u8 = 0x00;
    /// Authentication algorithm: RAKP-HMAC-SHA1.
    pub const AUTH_RAKP_HMAC_SHA1: u8 = 0x01;
    /// Integrity algorithm: HMAC-SHA1-96.
    pub const INTEGRITY_HMAC_SHA1_96: u8 = 0x01;
    /// Confidentiality algorithm: AES-CBC-128.
    pub const CONFIDENTIALITY_AES_CBC_128: u8 = 0x01;
}

/// RAKP role byte flag: look the user up by name only.
const ROLE_NAME_ONLY_LOOKUP: u8 = 0x10;

/// Which protections a session packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Protection {
    pub authenticated: bool,
    pub encrypted: bool,
}

impl Protection {
    pub(crate) const NONE: Protection = Protection {
        authenticated: false,
        encrypted: false,
    };

    fn payload_type_bits(self) -> u8 {
        let mut b = 0;
        if self.authenticated {
            b |= 0x40;
        }
        if self.encrypted {
            b |= 0x80;
        }
        b
    }
}

/// A parsed RMCP+ packet; the payload is verified and decrypted.
#[derive(Debug, Clone)]
pub(crate) struct DecodedPacket {
    pub payload_type: u8,
    pub protection: Protection,
    pub session_id: u32,
    pub session_seq: u32,
    pub payload: Vec<u8>,
}

/// Encode an RMCP+ packet, encrypting and signing it as `protection` asks.
pub(crate) fn encode_packet(
    payload_type_num: u8,
    session_id: u32,
    session_seq: u32,
    payload: &[u8],
    protection: Protection,
    keys: &SessionKeys,
) -> Result<Vec<u8>> {
    let body = if protection.encrypted {
        let mut iv = [0u8; AES_BLOCK_LEN];
        rand::rng().fill_bytes(&mut iv);
        encrypt_payload(keys, &iv, payload)?
    } else {
        payload.to_vec()
    };

    let payload_len: u16 = body
        .len()
        .try_into()
        .map_err(|_| Error::Protocol("payload too large"))?;

    let mut packet = Vec::with_capacity(HEADER_LEN + body.len() + 4 + INTEGRITY_CODE_LEN);
    packet.extend_from_slice(&[RMCP_VERSION, RMCP_RESERVED, RMCP_SEQ_NO_ACK, RMCP_CLASS_IPMI]);
    packet.push(RMCPPLUS_AUTH_TYPE);
    packet.push((payload_type_num & 0x3F) | protection.payload_type_bits());
    packet.extend_from_slice(&session_id.to_le_bytes());
    packet.extend_from_slice(&session_seq.to_le_bytes());
    packet.extend_from_slice(&payload_len.to_le_bytes());
    packet.extend_from_slice(&body);

    if protection.authenticated {
        // Pad so that auth type .. next header is a multiple of 4 bytes.
        let unpadded = packet.len() - 4 + 2;
        let pad_len = (4 - unpadded % 4) % 4;
        packet.extend(std::iter::repeat_n(0xFF, pad_len));
        packet.push(pad_len as u8);
        packet.push(RMCPPLUS_NEXT_HEADER);
        let code = keys.integrity_code(&packet[4..])?;
        packet.extend_from_slice(&code);
    }

    Ok(packet)
}

/// Decode an RMCP+ packet, verifying its integrity code and decrypting its
/// payload with `keys` when the header says it is protected.
pub(crate) fn decode_packet(bytes: &[u8], keys: &SessionKeys) -> Result<DecodedPacket> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Protocol("packet too short"));
    }
    if bytes[0] != RMCP_VERSION {
        return Err(Error::Protocol("unexpected RMCP version"));
    }
    if bytes[3] != RMCP_CLASS_IPMI {
        return Err(Error::Protocol("unexpected RMCP class"));
    }
    if bytes[4] != RMCPPLUS_AUTH_TYPE {
        return Err(Error::Protocol("unsupported RMCP auth type"));
    }

    let type_byte = bytes[5];
    let protection = Protection {
        authenticated: type_byte & 0x40 != 0,
        encrypted: type_byte & 0x80 != 0,
    };
    let payload_type_num = type_byte & 0x3F;
    if payload_type_num == 0x02 {
        return Err(Error::Unsupported("OEM explicit payload is not supported"));
    }

    let session_id = read_u32_le(&bytes[6..10])?;
    let session_seq = read_u32_le(&bytes[10..14])?;
    let payload_len = u16::from_le_bytes([bytes[14], bytes[15]]) as usize;
    let payload_end = HEADER_LEN + payload_len;
    if bytes.len() < payload_end {
        return Err(Error::Protocol("truncated payload"));
    }

    if (protection.authenticated || protection.encrypted) && !keys.is_negotiated() {
        return Err(Error::Protocol(
            "protected packet received before keys were negotiated",
        ));
    }

    if protection.authenticated {
        verify_trailer(bytes, payload_end, keys)?;
    }

    let body = &bytes[HEADER_LEN..payload_end];
    let payload = if protection.encrypted {
        decrypt_payload(keys, body)?
    } else {
        body.to_vec()
    };

    Ok(DecodedPacket {
        payload_type: payload_type_num,
        protection,
        session_id,
        session_seq,
        payload,
    })
}

fn verify_trailer(bytes: &[u8], payload_end: usize, keys: &SessionKeys) -> Result<()> {
    if bytes.len() < payload_end + 2 + INTEGRITY_CODE_LEN {
        return Err(Error::Protocol("authenticated packet too short"));
    }

    let code_start = bytes.len() - INTEGRITY_CODE_LEN;
    let expected = keys.integrity_code(&bytes[4..code_start])?;
    if !crate::crypto::ct_eq(&bytes[code_start..], &expected) {
        return Err(Error::AuthenticationFailed("invalid packet auth code"));
    }

    // Trailer layout: [integrity pad bytes][pad_len][next_header]
    let pad_len = bytes[code_start - 2] as usize;
    if bytes[code_start - 1] != RMCPPLUS_NEXT_HEADER {
        return Err(Error::Protocol("unexpected next header"));
    }
    let pad = &bytes[payload_end..code_start - 2];
    if pad.len() != pad_len {
        return Err(Error::Protocol("pad length mismatch"));
    }
    if pad.iter().any(|&b| b != 0xFF) {
        return Err(Error::Protocol("invalid integrity pad bytes"));
    }
    Ok(())
}

/// AES-CBC-128 with IPMI confidentiality padding; returns `iv || ciphertext`.
fn encrypt_payload(keys: &SessionKeys, iv: &[u8; AES_BLOCK_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let pad_len = (AES_BLOCK_LEN - (plaintext.len() + 1) % AES_BLOCK_LEN) % AES_BLOCK_LEN;
    let mut padded = Vec::with_capacity(plaintext.len() + pad_len + 1);
    padded.extend_from_slice(plaintext);
    padded.extend((1..=pad_len).map(|i| i as u8));
    padded.push(pad_len as u8);

    let ciphertext = keys.encrypt(iv, &padded)?;
    let mut out = Vec::with_capacity(AES_BLOCK_LEN + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_payload(keys: &SessionKeys, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < 2 * AES_BLOCK_LEN {
        return Err(Error::Protocol("encrypted payload too short"));
    }
    let (iv, ciphertext) = body.split_at(AES_BLOCK_LEN);
    if !ciphertext.len().is_multiple_of(AES_BLOCK_LEN) {
        return Err(Error::Protocol("invalid AES-CBC ciphertext length"));
    }
    let iv: [u8; AES_BLOCK_LEN] = iv.try_into().map_err(|_| Error::Protocol("invalid IV"))?;

    let mut plaintext = keys.decrypt(&iv, ciphertext)?;
    let pad_len = *plaintext
        .last()
        .ok_or(Error::Protocol("missing confidentiality pad length"))? as usize;
    if pad_len >= plaintext.len() {
        return Err(Error::Protocol("invalid confidentiality pad length"));
    }
    let data_end = plaintext.len() - 1 - pad_len;
    let pad_ok = plaintext[data_end..plaintext.len() - 1]
        .iter()
        .enumerate()
        .all(|(i, &b)| b == i as u8 + 1);
    if !pad_ok {
        return Err(Error::Protocol("invalid confidentiality pad bytes"));
    }
    plaintext.truncate(data_end);
    Ok(plaintext)
}

fn read_u32_le(bytes: &[u8]) -> Result<u32> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::Protocol("truncated 32-bit field"))?;
    Ok(u32::from_le_bytes(arr))
}

/// Open Session Request payload (Table 13-9).
#[derive(Debug, Clone)]
pub(crate) struct OpenSessionRequest {
    pub message_tag: u8,
    pub privilege: PrivilegeLevel,
    pub remote_console_session_id: u32,
    pub cipher_suite: CipherSuite,
}

impl OpenSessionRequest {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let (auth, integrity, conf) = self.cipher_suite.algorithms();
        // 0 requests the highest level the user is allowed.
        let requested = match self.privilege {
            PrivilegeLevel::Administrator => 0x00,
            other => other.as_u8() & 0x0F,
        };

        let mut p = Vec::with_capacity(32);
        p.extend_from_slice(&[self.message_tag, requested, 0x00, 0x00]);
        p.extend_from_slice(&self.remote_console_session_id.to_le_bytes());
        for (kind, algo) in [(0x00, auth), (0x01, integrity), (0x02, conf)] {
            p.extend_from_slice(&[kind, 0x00, 0x00, 0x08, algo & 0x3F, 0x00, 0x00, 0x00]);
        }
        debug_assert_eq!(p.len(), 32);
        p
    }
}

/// Open Session Response payload (Table 13-10).
#[derive(Debug, Clone)]
pub(crate) struct OpenSessionResponse {
    pub message_tag: u8,
    pub status_code: u8,
    pub remote_console_session_id: u32,
    pub managed_system_session_id: u32,
    pub algorithms: (u8, u8, u8),
}

impl OpenSessionResponse {
    pub(crate) fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 8 {
            return Err(Error::Protocol("open session response payload too short"));
        }
        let message_tag = payload[0];
        let status_code = payload[1];
        let remote_console_session_id = read_u32_le(&payload[4..8])?;

        if status_code != 0x00 {
            return Ok(Self {
                message_tag,
                status_code,
                remote_console_session_id,
                managed_system_session_id: 0,
                algorithms: (0, 0, 0),
            });
        }
        if payload.len() < 36 {
            return Err(Error::Protocol("open session response payload too short"));
        }

        Ok(Self {
            message_tag,
            status_code,
            remote_console_session_id,
            managed_system_session_id: read_u32_le(&payload[8..12])?,
            algorithms: (
                payload[16] & 0x3F,
                payload[24] & 0x3F,
                payload[32] & 0x3F,
            ),
        })
    }
}

/// Values both sides feed into the RAKP authentication codes.
#[derive(Debug, Clone)]
pub(crate) struct RakpTranscript<'a> {
    pub remote_console_session_id: u32,
    pub managed_system_session_id: u32,
    pub console_random: &'a [u8; 16],
    pub bmc_random: &'a [u8; 16],
    pub bmc_guid: &'a [u8; 16],
    pub privilege: PrivilegeLevel,
    pub username: &'a [u8],
}

impl RakpTranscript<'_> {
    fn role(&self) -> u8 {
        role_byte(self.privilege)
    }

    /// RAKP message 2 key exchange auth code, keyed with the user key.
    pub(crate) fn rakp2_auth_code(&self, user_key: &[u8; SHA1_KEY_LEN]) -> Result<[u8; 20]> {
        let mut data = Vec::with_capacity(58 + self.username.len());
        data.extend_from_slice(&self.remote_console_session_id.to_le_bytes());
        data.extend_from_slice(&self.managed_system_session_id.to_le_bytes());
        data.extend_from_slice(self.console_random);
        data.extend_from_slice(self.bmc_random);
        data.extend_from_slice(self.bmc_guid);
        data.push(self.role());
        data.push(self.username.len() as u8);
        data.extend_from_slice(self.username);
        hmac_sha1(user_key, &data)
    }

    /// Session integrity key, keyed with K_g (or the user key).
    pub(crate) fn sik(&self, kg: &[u8; SHA1_KEY_LEN]) -> Result<[u8; SHA1_KEY_LEN]> {
        let mut data = Vec::with_capacity(34 + self.username.len());
        data.extend_from_slice(self.console_random);
        data.extend_from_slice(self.bmc_random);
        data.push(self.role());
        data.push(self.username.len() as u8);
        data.extend_from_slice(self.username);
        hmac_sha1(kg, &data)
    }

    /// RAKP message 3 key exchange auth code, keyed with the user key.
    pub(crate) fn rakp3_auth_code(&self, user_key: &[u8; SHA1_KEY_LEN]) -> Result<[u8; 20]> {
        let mut data = Vec::with_capacity(22 + self.username.len());
        data.extend_from_slice(self.bmc_random);
        data.extend_from_slice(&self.remote_console_session_id.to_le_bytes());
        data.push(self.role());
        data.push(self.username.len() as u8);
        data.extend_from_slice(self.username);
        hmac_sha1(user_key, &data)
    }

    /// RAKP message 4 integrity check value, keyed with SIK.
    pub(crate) fn rakp4_icv(&self, sik: &[u8; SHA1_KEY_LEN]) -> Result<[u8; INTEGRITY_CODE_LEN]> {
        let mut data = Vec::with_capacity(36);
        data.extend_from_slice(self.console_random);
        data.extend_from_slice(&self.managed_system_session_id.to_le_bytes());
        data.extend_from_slice(self.bmc_guid);
        hmac_sha1_96(sik, &data)
    }
}

fn role_byte(privilege: PrivilegeLevel) -> u8 {
    (privilege.as_u8() & 0x0F) | ROLE_NAME_ONLY_LOOKUP
}

/// RAKP Message 1 payload (Table 13-11).
pub(crate) fn encode_rakp1(
    message_tag: u8,
    managed_system_session_id: u32,
    console_random: &[u8; 16],
    privilege: PrivilegeLevel,
    username: &[u8],
) -> Result<Vec<u8>> {
    if username.len() > 16 {
        return Err(Error::InvalidArgument("username too long (max 16 bytes)"));
    }
    let mut p = Vec::with_capacity(28 + username.len());
    p.extend_from_slice(&[message_tag, 0x00, 0x00, 0x00]);
    p.extend_from_slice(&managed_system_session_id.to_le_bytes());
    p.extend_from_slice(console_random);
    p.extend_from_slice(&[role_byte(privilege), 0x00, 0x00]);
    p.push(username.len() as u8);
    p.extend_from_slice(username);
    Ok(p)
}

/// RAKP Message 2 payload (Table 13-12).
#[derive(Debug, Clone)]
pub(crate) struct Rakp2 {
    pub message_tag: u8,
    pub status_code: u8,
    pub remote_console_session_id: u32,
    pub bmc_random: [u8; 16],
    pub bmc_guid: [u8; 16],
    pub key_exchange_auth_code: [u8; 20],
}

impl Rakp2 {
    pub(crate) fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 8 {
            return Err(Error::Protocol("RAKP message 2 payload too short"));
        }
        let mut msg = Self {
            message_tag: payload[0],
            status_code: payload[1],
            remote_console_session_id: read_u32_le(&payload[4..8])?,
            bmc_random: [0u8; 16],
            bmc_guid: [0u8; 16],
            key_exchange_auth_code: [0u8; 20],
        };
        if msg.status_code != 0x00 {
            return Ok(msg);
        }
        if payload.len() < 60 {
            return Err(Error::Protocol("RAKP message 2 payload too short"));
        }
        msg.bmc_random.copy_from_slice(&payload[8..24]);
        msg.bmc_guid.copy_from_slice(&payload[24..40]);
        msg.key_exchange_auth_code.copy_from_slice(&payload[40..60]);
        Ok(msg)
    }
}

/// RAKP Message 3 payload (Table 13-13).
pub(crate) fn encode_rakp3(
    message_tag: u8,
    managed_system_session_id: u32,
    key_exchange_auth_code: &[u8; 20],
) -> Vec<u8> {
    let mut p = Vec::with_capacity(28);
    p.extend_from_slice(&[message_tag, 0x00, 0x00, 0x00]);
    p.extend_from_slice(&managed_system_session_id.to_le_bytes());
    p.extend_from_slice(key_exchange_auth_code);
    p
}

/// RAKP Message 4 payload (Table 13-14).
#[derive(Debug, Clone)]
pub(crate) struct Rakp4 {
    pub message_tag: u8,
    pub status_code: u8,
    pub remote_console_session_id: u32,
    pub integrity_check_value: [u8; INTEGRITY_CODE_LEN],
}

impl Rakp4 {
    pub(crate) fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 8 {
            return Err(Error::Protocol("RAKP message 4 payload too short"));
        }
        let mut msg = Self {
            message_tag: payload[0],
            status_code: payload[1],
            remote_console_session_id: read_u32_le(&payload[4..8])?,
            integrity_check_value: [0u8; INTEGRITY_CODE_LEN],
        };
        if msg.status_code != 0x00 {
            return Ok(msg);
        }
        if payload.len() < 8 + INTEGRITY_CODE_LEN {
            return Err(Error::Protocol("RAKP message 4 payload too short"));
        }
        msg.integrity_check_value
            .copy_from_slice(&payload[8..8 + INTEGRITY_CODE_LEN]);
        Ok(msg)
    }
}

/// IPMB addresses used for LAN sessions.
const RESPONDER_ADDR: u8 = 0x20;
const REQUESTER_ADDR: u8 = 0x81;

/// Standard 2's complement checksum used by IPMI LAN messages.
fn ipmi_checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    sum.wrapping_neg()
}

/// Encode an IPMI LAN request message (LUN 0).
pub(crate) fn encode_lan_request(netfn: u8, cmd: u8, rq_seq: u8, data: &[u8]) -> Result<Vec<u8>> {
    if rq_seq > 0x3F {
        return Err(Error::Protocol("rq_seq must be 6-bit"));
    }
    let netfn_lun = netfn << 2;
    let mut msg = Vec::with_capacity(7 + data.len());
    msg.extend_from_slice(&[RESPONDER_ADDR, netfn_lun]);
    msg.push(ipmi_checksum(&msg[..2]));
    msg.extend_from_slice(&[REQUESTER_ADDR, rq_seq << 2, cmd]);
    msg.extend_from_slice(data);
    let csum = ipmi_checksum(&msg[3..]);
    msg.push(csum);
    Ok(msg)
}

/// Decode and validate an IPMI LAN response to the given request.
pub(crate) fn decode_lan_response(netfn: u8, cmd: u8, rq_seq: u8, msg: &[u8]) -> Result<RawResponse> {
    if msg.len() < 8 {
        return Err(Error::Protocol("IPMI response too short"));
    }
    if ipmi_checksum(&msg[..2]) != msg[2] {
        return Err(Error::Protocol("invalid IPMI checksum1"));
    }
    let (body, csum2) = msg[3..].split_at(msg.len() - 4);
    if ipmi_checksum(body) != csum2[0] {
        return Err(Error::Protocol("invalid IPMI checksum2"));
    }
    if msg[0] != REQUESTER_ADDR || msg[1] != (netfn + 1) << 2 {
        return Err(Error::Protocol("unexpected responder or netfn"));
    }
    if msg[3] != RESPONDER_ADDR {
        return Err(Error::Protocol("unexpected requester address"));
    }
    if msg[4] != rq_seq << 2 {
        return Err(Error::Protocol("unexpected request sequence"));
    }
    if msg[5] != cmd {
        return Err(Error::Protocol("unexpected command"));
    }

    Ok(RawResponse {
        completion_code: msg[6],
        data: msg[7..msg.len() - 1].to_vec(),
    })
}
