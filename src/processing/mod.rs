//! Default protocol advancer: RMCP+ session setup and Serial-over-LAN.
//!
//! Every context walks the same state machine:
//!
//! ```text
//! Start -> OpenSessionSent -> Rakp1Sent -> Rakp3Sent -> SetPrivilegeSent
//!       -> GetPayloadActivationStatusSent -> ActivatePayloadSent -> SolSession
//!       -> DeactivatePayloadSent -> CloseSessionSent -> End
//! ```
//!
//! One request is outstanding at a time outside `SolSession`; it is rebuilt
//! and resent when its retransmission timer fires.

mod handshake;
mod payload;

use std::time::{Duration, Instant};

use zeroize::Zeroize;

use crate::advance::{Advance, ProtocolAdvancer};
use crate::config::SessionConfig;
use crate::context::SessionContext;
use crate::crypto::SessionKeys;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::{Protection, decode_packet, encode_packet, payload_type};
use crate::sequence::{OutboundSequence, ReplayWindow};
use crate::types::CipherSuite;

pub(crate) use payload::SolChannel;

/// Poll timeout when no context has a pending deadline.
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Start,
    OpenSessionSent,
    Rakp1Sent,
    Rakp3Sent,
    SetPrivilegeSent,
    GetPayloadActivationStatusSent,
    ActivatePayloadSent,
    SolSession,
    DeactivatePayloadSent,
    CloseSessionSent,
    End,
}

/// The unanswered request of the current state.
#[derive(Debug, Clone, Copy)]
struct Pending {
    sent_at: Instant,
    retransmissions: u32,
}

/// Protocol state carried by every session context.
#[derive(Debug)]
pub(crate) struct ProtocolState {
    pub(crate) state: State,
    pub(crate) keys: SessionKeys,
    pub(crate) remote_console_session_id: u32,
    pub(crate) managed_system_session_id: u32,
    pub(crate) message_tag: u8,
    pub(crate) rq_seq: u8,
    pub(crate) console_random: [u8; 16],
    pub(crate) bmc_random: [u8; 16],
    pub(crate) bmc_guid: [u8; 16],
    outbound_seq: OutboundSequence,
    replay: ReplayWindow,
    pending: Option<Pending>,
    /// (netfn, cmd) of the outstanding IPMI request.
    outstanding: Option<(u8, u8)>,
    pub(crate) last_received: Option<Instant>,
    idle_since: Option<Instant>,
    errors: u32,
    close_started: bool,
    /// Port the BMC moved the SOL payload to; the session restarts there.
    pub(crate) try_new_port: Option<u16>,
    pub(crate) deactivate_and_retry: bool,
    /// Activation already followed one deactivate-and-retry.
    activation_retried: bool,
    pub(crate) payload_instance: u8,
    pub(crate) payload_active: bool,
    pub(crate) sol: SolChannel,
}

impl ProtocolState {
    pub(crate) fn new(
        remote_console_session_id: u32,
        message_tag: u8,
        rq_seq: u8,
        console_random: [u8; 16],
    ) -> Self {
        Self {
            state: State::Start,
            keys: SessionKeys::empty(),
            remote_console_session_id,
            managed_system_session_id: 0,
            message_tag,
            rq_seq,
            console_random,
            bmc_random: [0u8; 16],
            bmc_guid: [0u8; 16],
            outbound_seq: OutboundSequence::new(),
            replay: ReplayWindow::default(),
            pending: None,
            outstanding: None,
            last_received: None,
            idle_since: None,
            errors: 0,
            close_started: false,
            try_new_port: None,
            deactivate_and_retry: false,
            activation_retried: false,
            payload_instance: 1,
            payload_active: false,
            sol: SolChannel::default(),
        }
    }

    /// Forget the current session so a new one can start from `Start`.
    fn restart(&mut self, randoms: crate::context::SessionRandoms) {
        let payload_instance = self.payload_instance;
        self.wipe();
        *self = Self::new(
            randoms.remote_console_session_id,
            randoms.message_tag,
            randoms.rq_seq,
            randoms.console_random,
        );
        self.payload_instance = payload_instance;
    }

    /// Zero all key material and buffered console data.
    pub(crate) fn wipe(&mut self) {
        self.keys = SessionKeys::empty();
        self.console_random.zeroize();
        self.bmc_random.zeroize();
        self.sol.clear();
    }
}

fn session_protection(suite: CipherSuite) -> Protection {
    let (_, integrity, confidentiality) = suite.algorithms();
    Protection {
        authenticated: integrity != crate::protocol::algorithm::NONE,
        encrypted: confidentiality != crate::protocol::algorithm::NONE,
    }
}

/// Retransmission timeout after `retransmissions` resends.
pub(crate) fn retransmission_timeout(config: &SessionConfig, retransmissions: u32) -> Duration {
    config.retransmission_timeout * (1 + retransmissions / config.retransmission_backoff_count)
}

/// The [`ProtocolAdvancer`] that establishes IPMI v2.0 SOL sessions.
#[derive(Debug, Default)]
pub struct SolAdvancer {
    _private: (),
}

impl SolAdvancer {
    /// Create the advancer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProtocolAdvancer for SolAdvancer {
    fn advance(&self, contexts: &mut Vec<SessionContext>) -> Advance {
        let now = Instant::now();
        let mut timeout = IDLE_WAIT;
        contexts.retain_mut(|ctx| {
            step(ctx, now);
            if ctx.protocol.state == State::End {
                return false;
            }
            timeout = timeout.min(next_timeout(ctx, now));
            true
        });
        Advance {
            active: contexts.len(),
            timeout,
        }
    }
}

/// Run one protocol pass for `ctx` as of `now`.
pub(crate) fn step(ctx: &mut SessionContext, now: Instant) {
    if ctx.protocol.state == State::End {
        return;
    }
    if let Err(err) = drive(ctx, now) {
        tracing::debug!(session = ctx.id(), error = %err, "session protocol failure");
        fail(ctx, err.code(), now);
    }
}

fn drive(ctx: &mut SessionContext, now: Instant) -> Result<()> {
    if let Some(datagram) = ctx.take_datagram() {
        handle_datagram(ctx, &datagram, now)?;
        if ctx.protocol.state == State::End {
            return Ok(());
        }
    }

    if ctx.protocol.state == State::Start {
        if ctx.is_closing() {
            end(ctx);
            return Ok(());
        }
        ctx.protocol.last_received = Some(now);
        return transition(ctx, State::OpenSessionSent, now);
    }

    if ctx.is_closing() && !ctx.protocol.close_started {
        begin_close(ctx, now)?;
        if ctx.protocol.state == State::End {
            return Ok(());
        }
    }

    check_timers(ctx, now)?;

    if ctx.protocol.state == State::SolSession {
        payload::service(ctx, now)?;
        if ctx.protocol.pending.is_none()
            && ctx
                .protocol
                .idle_since
                .is_some_and(|t| now >= t + ctx.config.keepalive_interval)
        {
            handshake::send_keepalive(ctx)?;
            ctx.protocol.pending = Some(Pending {
                sent_at: now,
                retransmissions: 0,
            });
            ctx.protocol.idle_since = Some(now);
        }
    }
    Ok(())
}

fn check_timers(ctx: &mut SessionContext, now: Instant) -> Result<()> {
    if ctx
        .protocol
        .last_received
        .is_some_and(|t| now >= t + ctx.config.session_timeout)
    {
        return Err(Error::Session(ErrorCode::SessionTimeout));
    }

    if let Some(pending) = ctx.protocol.pending {
        if now >= pending.sent_at + retransmission_timeout(&ctx.config, pending.retransmissions) {
            if pending.retransmissions >= ctx.config.max_retransmissions {
                return Err(Error::Session(ErrorCode::ExcessRetransmissions));
            }
            tracing::debug!(
                session = ctx.id(),
                state = ?ctx.protocol.state,
                retransmissions = pending.retransmissions + 1,
                "retransmitting request"
            );
            handshake::send_state_request(ctx)?;
            ctx.protocol.pending = Some(Pending {
                sent_at: now,
                retransmissions: pending.retransmissions + 1,
            });
        }
    }

    if ctx.protocol.state == State::SolSession {
        payload::check_retransmit(ctx, now)?;
    }
    Ok(())
}

fn next_timeout(ctx: &SessionContext, now: Instant) -> Duration {
    let p = &ctx.protocol;
    let c = &ctx.config;
    let keepalive = (p.state == State::SolSession && p.pending.is_none())
        .then_some(p.idle_since)
        .flatten()
        .map(|t| t + c.keepalive_interval);
    let deadlines = [
        p.last_received.map(|t| t + c.session_timeout),
        p.pending
            .map(|pending| pending.sent_at + retransmission_timeout(c, pending.retransmissions)),
        keepalive,
        p.sol.deadline(c),
    ];
    deadlines
        .into_iter()
        .flatten()
        .min()
        .map_or(IDLE_WAIT, |d| d.saturating_duration_since(now))
}

/// Enter `state` and send its request.
fn transition(ctx: &mut SessionContext, state: State, now: Instant) -> Result<()> {
    tracing::debug!(
        session = ctx.id(),
        from = ?ctx.protocol.state,
        to = ?state,
        "protocol state"
    );
    ctx.protocol.state = state;
    ctx.protocol.pending = None;
    ctx.protocol.outstanding = None;

    match state {
        State::Start | State::End => {}
        State::SolSession => {
            ctx.protocol.idle_since = Some(now);
        }
        _ => {
            handshake::send_state_request(ctx)?;
            ctx.protocol.pending = Some(Pending {
                sent_at: now,
                retransmissions: 0,
            });
        }
    }
    Ok(())
}

fn end(ctx: &mut SessionContext) {
    if ctx.protocol.state != State::End {
        tracing::debug!(session = ctx.id(), from = ?ctx.protocol.state, "session ended");
    }
    ctx.protocol.state = State::End;
    ctx.protocol.pending = None;
    ctx.protocol.outstanding = None;
}

/// Start the close handshake appropriate to the current state.
fn begin_close(ctx: &mut SessionContext, now: Instant) -> Result<()> {
    ctx.protocol.close_started = true;
    match ctx.protocol.state {
        State::Start | State::OpenSessionSent | State::Rakp1Sent | State::Rakp3Sent => {
            end(ctx);
            Ok(())
        }
        State::SolSession if ctx.protocol.payload_active => {
            transition(ctx, State::DeactivatePayloadSent, now)
        }
        State::SetPrivilegeSent
        | State::GetPayloadActivationStatusSent
        | State::ActivatePayloadSent
        | State::SolSession => transition(ctx, State::CloseSessionSent, now),
        State::DeactivatePayloadSent | State::CloseSessionSent | State::End => Ok(()),
    }
}

/// Record `code` and wind the session down.
fn fail(ctx: &mut SessionContext, code: ErrorCode, now: Instant) {
    ctx.close_with(code);
    let abrupt = matches!(
        code,
        ErrorCode::SessionTimeout
            | ErrorCode::ExcessRetransmissions
            | ErrorCode::ExcessErrorsReceived
            | ErrorCode::InternalError
            | ErrorCode::SystemError
            | ErrorCode::TooManyOpenFiles
    );
    if abrupt || ctx.protocol.close_started {
        end(ctx);
        return;
    }
    if let Err(err) = begin_close(ctx, now) {
        tracing::debug!(session = ctx.id(), error = %err, "close handshake failed");
        end(ctx);
        return;
    }
    // Nothing left in flight to finish the close with.
    if ctx.protocol.pending.is_none() {
        end(ctx);
    }
}

/// Count an invalid packet; too many fail the session.
fn packet_error(ctx: &mut SessionContext, err: Error) -> Result<()> {
    ctx.protocol.errors += 1;
    tracing::debug!(
        session = ctx.id(),
        errors = ctx.protocol.errors,
        error = %err,
        "invalid packet"
    );
    if ctx.protocol.errors > ctx.config.max_packet_errors {
        return Err(Error::Session(ErrorCode::ExcessErrorsReceived));
    }
    Ok(())
}

fn handle_datagram(ctx: &mut SessionContext, datagram: &[u8], now: Instant) -> Result<()> {
    let packet = match decode_packet(datagram, &ctx.protocol.keys) {
        Ok(packet) => packet,
        Err(err) => return packet_error(ctx, err),
    };

    match ctx.protocol.state {
        State::Start | State::End => Ok(()),
        State::OpenSessionSent | State::Rakp1Sent | State::Rakp3Sent => {
            handshake::handle_setup(ctx, &packet, now)
        }
        _ => {
            if packet.session_id != ctx.protocol.remote_console_session_id {
                return packet_error(ctx, Error::Protocol("unexpected session id"));
            }
            let required = session_protection(ctx.config.cipher_suite);
            if required.authenticated && !packet.protection.authenticated {
                return packet_error(ctx, Error::Protocol("unauthenticated session packet"));
            }
            if !ctx.protocol.replay.accept(packet.session_seq) {
                tracing::trace!(
                    session = ctx.id(),
                    seq = packet.session_seq,
                    "dropping replayed packet"
                );
                return Ok(());
            }
            ctx.protocol.last_received = Some(now);

            match packet.payload_type {
                payload_type::IPMI => handshake::handle_response(ctx, &packet.payload, now),
                payload_type::SOL if ctx.protocol.state == State::SolSession => {
                    payload::handle_inbound(ctx, &packet.payload, now)
                }
                payload_type::SOL => Ok(()),
                _ => packet_error(ctx, Error::Protocol("unexpected payload type")),
            }
        }
    }
}

/// Wrap `payload` in a session packet and queue it.
fn send_session_payload(ctx: &mut SessionContext, payload_type_num: u8, payload: &[u8]) -> Result<()> {
    let protection = session_protection(ctx.config.cipher_suite);
    let p = &mut ctx.protocol;
    let seq = p.outbound_seq.next();
    let packet = encode_packet(
        payload_type_num,
        p.managed_system_session_id,
        seq,
        payload,
        protection,
        &p.keys,
    )?;
    ctx.network_out.push(packet)
}

/// Queue a pre-session (unauthenticated, session id 0) packet.
fn send_setup_payload(ctx: &mut SessionContext, payload_type_num: u8, payload: &[u8]) -> Result<()> {
    let packet = encode_packet(
        payload_type_num,
        0,
        0,
        payload,
        Protection::NONE,
        &ctx.protocol.keys,
    )?;
    ctx.network_out.push(packet)
}

#[cfg(test)]
mod tests;
