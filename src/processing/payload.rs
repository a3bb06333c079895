//! Serial-over-LAN character transfer inside an established session.

use std::time::Instant;

use zeroize::Zeroize;

use super::{packet_error, retransmission_timeout, send_session_payload};
use crate::config::SessionConfig;
use crate::context::SessionContext;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::payload_type;
use crate::sequence::next_sol_seq;
use crate::sol::{SOL_HEADER_LEN, SolPacket, op, status};

/// Characters per packet until the BMC reports its inbound payload size.
const DEFAULT_CHUNK: usize = 64;

/// An outbound SOL packet waiting for its ACK.
#[derive(Debug)]
struct InFlight {
    seq: u8,
    data: Vec<u8>,
    flags: u8,
    sent_at: Instant,
    retransmissions: u32,
}

/// Per-session SOL sequencing state.
#[derive(Debug, Default)]
pub(crate) struct SolChannel {
    /// Max characters per outbound packet; 0 until configured.
    chunk: usize,
    /// Last sequence number used for an outbound data packet.
    seq: u8,
    in_flight: Option<InFlight>,
    /// Last inbound data packet and how many of its characters we took.
    last_inbound: Option<(u8, u8)>,
}

impl SolChannel {
    /// Size outbound packets to the BMC's inbound payload limit.
    pub(crate) fn configure(&mut self, inbound_payload_size: u16) {
        self.chunk = usize::from(inbound_payload_size)
            .saturating_sub(SOL_HEADER_LEN)
            .clamp(1, usize::from(u8::MAX));
    }

    fn chunk(&self) -> usize {
        if self.chunk == 0 { DEFAULT_CHUNK } else { self.chunk }
    }

    pub(crate) fn clear(&mut self) {
        if let Some(mut in_flight) = self.in_flight.take() {
            in_flight.data.zeroize();
        }
        self.seq = 0;
        self.last_inbound = None;
    }

    /// When the in-flight packet is due for retransmission.
    pub(crate) fn deadline(&self, config: &SessionConfig) -> Option<Instant> {
        self.in_flight
            .as_ref()
            .map(|f| f.sent_at + retransmission_timeout(config, f.retransmissions))
    }
}

/// Send pending console input, one packet in flight at a time.
pub(super) fn service(ctx: &mut SessionContext, now: Instant) -> Result<()> {
    if ctx.protocol.sol.in_flight.is_some() {
        return Ok(());
    }

    let pending_break = ctx.break_requested();
    if pending_break == Some(0) {
        ctx.clear_break_request();
        return send_data(ctx, Vec::new(), op::GENERATE_BREAK, now);
    }

    let limit = pending_break.unwrap_or(usize::MAX).min(ctx.protocol.sol.chunk());
    let n = limit.min(ctx.console_in.len());
    if n == 0 {
        return Ok(());
    }
    let data = ctx.console_in.take(n);
    if pending_break.is_some() {
        ctx.break_bytes_sent(n);
    }
    send_data(ctx, data, 0, now)
}

fn send_data(ctx: &mut SessionContext, data: Vec<u8>, flags: u8, now: Instant) -> Result<()> {
    let seq = next_sol_seq(ctx.protocol.sol.seq);
    ctx.protocol.sol.seq = seq;
    let packet = SolPacket {
        seq,
        flags,
        data,
        ..SolPacket::default()
    };
    send_session_payload(ctx, payload_type::SOL, &packet.encode())?;
    ctx.protocol.idle_since = Some(now);
    ctx.protocol.sol.in_flight = Some(InFlight {
        seq,
        data: packet.data,
        flags,
        sent_at: now,
        retransmissions: 0,
    });
    Ok(())
}

/// Resend the in-flight packet under the same sequence number.
pub(super) fn check_retransmit(ctx: &mut SessionContext, now: Instant) -> Result<()> {
    let Some(deadline) = ctx.protocol.sol.deadline(&ctx.config) else {
        return Ok(());
    };
    if now < deadline {
        return Ok(());
    }
    let Some(in_flight) = ctx.protocol.sol.in_flight.as_mut() else {
        return Ok(());
    };
    if in_flight.retransmissions >= ctx.config.max_retransmissions {
        return Err(Error::Session(ErrorCode::ExcessRetransmissions));
    }
    in_flight.retransmissions += 1;
    in_flight.sent_at = now;
    let retransmissions = in_flight.retransmissions;
    let packet = SolPacket {
        seq: in_flight.seq,
        flags: in_flight.flags,
        data: in_flight.data.clone(),
        ..SolPacket::default()
    };
    tracing::trace!(
        session = ctx.id(),
        seq = packet.seq,
        retransmissions,
        "retransmitting SOL packet"
    );
    send_session_payload(ctx, payload_type::SOL, &packet.encode())?;
    ctx.protocol.idle_since = Some(now);
    Ok(())
}

/// Handle an SOL payload from the BMC.
pub(super) fn handle_inbound(ctx: &mut SessionContext, payload: &[u8], now: Instant) -> Result<()> {
    let packet = match SolPacket::parse(payload) {
        Ok(packet) => packet,
        Err(err) => return packet_error(ctx, err),
    };

    if packet.has_flag(status::SOL_DEACTIVATING) {
        ctx.protocol.payload_active = false;
        return Err(Error::Session(ErrorCode::SolStolen));
    }

    if packet.is_ack() {
        on_ack(ctx, &packet, now)?;
    }

    if packet.seq != 0 && !packet.data.is_empty() {
        let accepted = match ctx.protocol.sol.last_inbound {
            // A retransmission of data we already took.
            Some((seq, accepted)) if seq == packet.seq => accepted,
            _ => {
                let n = packet.data.len().min(ctx.console_out.free()).min(usize::from(u8::MAX));
                ctx.console_out.write(&packet.data[..n])?;
                let accepted = n as u8;
                ctx.protocol.sol.last_inbound = Some((packet.seq, accepted));
                accepted
            }
        };
        let ack = SolPacket {
            ack_seq: packet.seq,
            accepted,
            ..SolPacket::default()
        };
        send_session_payload(ctx, payload_type::SOL, &ack.encode())?;
        ctx.protocol.idle_since = Some(now);
    }
    Ok(())
}

fn on_ack(ctx: &mut SessionContext, packet: &SolPacket, now: Instant) -> Result<()> {
    let matches = ctx
        .protocol
        .sol
        .in_flight
        .as_ref()
        .is_some_and(|f| f.seq == packet.ack_seq);
    if !matches {
        return Ok(());
    }
    if packet.has_flag(status::NACK) {
        // The BMC cannot take more characters now; the retransmission timer
        // resends whatever it did not accept.
        tracing::trace!(session = ctx.id(), seq = packet.ack_seq, "SOL packet NACKed");
        if let Some(in_flight) = ctx.protocol.sol.in_flight.as_mut() {
            let accepted = usize::from(packet.accepted).min(in_flight.data.len());
            in_flight.data.drain(..accepted).for_each(drop);
        }
        return Ok(());
    }

    let Some(mut in_flight) = ctx.protocol.sol.in_flight.take() else {
        return Ok(());
    };
    let accepted = usize::from(packet.accepted);
    if accepted < in_flight.data.len() {
        let remainder = in_flight.data.split_off(accepted);
        in_flight.data.zeroize();
        return send_data(ctx, remainder, in_flight.flags, now);
    }
    in_flight.data.zeroize();
    Ok(())
}
