//! SOL payload framing (IPMI v2.0 section 15.9).

use crate::error::{Error, Result};

/// SOL payload header length: sequence, ack sequence, accepted count, op/status.
pub(crate) const SOL_HEADER_LEN: usize = 4;

/// Operation bits sent by the remote console.
#[allow(dead_code)]
pub(crate) mod op {
    pub const NACK: u8 = 0x40;
    pub const RING_WOR: u8 = 0x20;
    pub const GENERATE_BREAK: u8 = 0x10;
    pub const CTS_PAUSE: u8 = 0x08;
    pub const DROP_DCD_DSR: u8 = 0x04;
    pub const FLUSH_INBOUND: u8 = 0x02;
    pub const FLUSH_OUTBOUND: u8 = 0x01;
}

/// Status bits sent by the BMC.
#[allow(dead_code)]
pub(crate) mod status {
    pub const NACK: u8 = 0x40;
    pub const CHARACTER_TRANSFER_UNAVAILABLE: u8 = 0x20;
    pub const SOL_DEACTIVATING: u8 = 0x10;
    pub const TRANSMIT_OVERRUN: u8 = 0x08;
    pub const BREAK_DETECTED: u8 = 0x04;
}

/// One SOL payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SolPacket {
    /// Packet sequence (1-15); 0 means ACK-only.
    pub seq: u8,
    /// Sequence number being acknowledged, or 0.
    pub ack_seq: u8,
    /// Characters accepted from the acknowledged packet.
    pub accepted: u8,
    /// Operation (console to BMC) or status (BMC to console) bits.
    pub flags: u8,
    pub data: Vec<u8>,
}

impl SolPacket {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SOL_HEADER_LEN + self.data.len());
        out.push(self.seq & 0x0F);
        out.push(self.ack_seq & 0x0F);
        out.push(self.accepted);
        out.push(self.flags);
        out.extend_from_slice(&self.data);
        out
    }

    pub(crate) fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < SOL_HEADER_LEN {
            return Err(Error::Protocol("SOL payload too short"));
        }
        Ok(Self {
            seq: payload[0] & 0x0F,
            ack_seq: payload[1] & 0x0F,
            accepted: payload[2],
            flags: payload[3],
            data: payload[SOL_HEADER_LEN..].to_vec(),
        })
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.ack_seq != 0
    }

    pub(crate) fn has_flag(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }
}
