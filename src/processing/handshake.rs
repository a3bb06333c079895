//! RMCP+ session establishment and the IPMI requests around the SOL payload.

use std::time::Instant;

use zeroize::Zeroizing;

use super::{
    State, end, packet_error, send_session_payload, send_setup_payload, session_protection,
    transition,
};
use crate::commands::{
    ActivatePayload, CloseSession, Command, DeactivatePayload, GetChannelPayloadVersion,
    GetPayloadActivationStatus, SetSessionPrivilegeLevel,
};
use crate::context::{SessionContext, SessionRandoms};
use crate::crypto::{SessionKeys, ct_eq};
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::{
    DecodedPacket, OpenSessionRequest, OpenSessionResponse, Rakp2, Rakp4, RakpTranscript,
    decode_lan_response, encode_lan_request, encode_rakp1, encode_rakp3, payload_type,
};
use crate::sequence::next_rq_seq;

/// Completion codes of the payload commands.
const CC_PAYLOAD_ALREADY_ACTIVE: u8 = 0x80;
const CC_PAYLOAD_DISABLED: u8 = 0x81;
const CC_PAYLOAD_LIMIT_REACHED: u8 = 0x82;
const CC_CANNOT_ACTIVATE_WITH_ENCRYPTION: u8 = 0x83;
const CC_CANNOT_ACTIVATE_WITHOUT_ENCRYPTION: u8 = 0x84;
const CC_INSUFFICIENT_PRIVILEGE: u8 = 0xD4;

/// Build and queue the request that belongs to the current state.
pub(super) fn send_state_request(ctx: &mut SessionContext) -> Result<()> {
    let instance = ctx.protocol.payload_instance;
    match ctx.protocol.state {
        State::OpenSessionSent => {
            let request = OpenSessionRequest {
                message_tag: ctx.protocol.message_tag,
                privilege: ctx.config.privilege_level,
                remote_console_session_id: ctx.protocol.remote_console_session_id,
                cipher_suite: ctx.config.cipher_suite,
            };
            send_setup_payload(ctx, payload_type::OPEN_SESSION_REQUEST, &request.encode())
        }
        State::Rakp1Sent => {
            let payload = encode_rakp1(
                ctx.protocol.message_tag,
                ctx.protocol.managed_system_session_id,
                &ctx.protocol.console_random,
                ctx.config.privilege_level,
                &ctx.config.username,
            )?;
            send_setup_payload(ctx, payload_type::RAKP_1, &payload)
        }
        State::Rakp3Sent => {
            let user_key = Zeroizing::new(ctx.config.password.to_key_sha1());
            let code = transcript(ctx).rakp3_auth_code(&user_key)?;
            let payload = encode_rakp3(
                ctx.protocol.message_tag,
                ctx.protocol.managed_system_session_id,
                &code,
            );
            send_setup_payload(ctx, payload_type::RAKP_3, &payload)
        }
        State::SetPrivilegeSent => send_command(
            ctx,
            &SetSessionPrivilegeLevel {
                privilege: ctx.config.privilege_level,
            },
        ),
        State::GetPayloadActivationStatusSent => send_command(ctx, &GetPayloadActivationStatus),
        State::ActivatePayloadSent => {
            let protection = session_protection(ctx.config.cipher_suite);
            send_command(
                ctx,
                &ActivatePayload::new(instance, protection.encrypted, protection.authenticated),
            )
        }
        State::DeactivatePayloadSent => send_command(ctx, &DeactivatePayload { instance }),
        State::CloseSessionSent => send_command(
            ctx,
            &CloseSession {
                session_id: ctx.protocol.managed_system_session_id,
            },
        ),
        State::SolSession => send_keepalive(ctx),
        State::Start | State::End => Ok(()),
    }
}

pub(super) fn send_keepalive(ctx: &mut SessionContext) -> Result<()> {
    send_command(ctx, &GetChannelPayloadVersion)
}

fn send_command<C: Command>(ctx: &mut SessionContext, command: &C) -> Result<()> {
    let rq_seq = next_rq_seq(ctx.protocol.rq_seq);
    ctx.protocol.rq_seq = rq_seq;
    let message = encode_lan_request(C::NETFN, C::CMD, rq_seq, &command.request_data())?;
    ctx.protocol.outstanding = Some((C::NETFN, C::CMD));
    send_session_payload(ctx, payload_type::IPMI, &message)
}

fn transcript(ctx: &SessionContext) -> RakpTranscript<'_> {
    RakpTranscript {
        remote_console_session_id: ctx.protocol.remote_console_session_id,
        managed_system_session_id: ctx.protocol.managed_system_session_id,
        console_random: &ctx.protocol.console_random,
        bmc_random: &ctx.protocol.bmc_random,
        bmc_guid: &ctx.protocol.bmc_guid,
        privilege: ctx.config.privilege_level,
        username: &ctx.config.username,
    }
}

/// Map an RMCP+ status code from Open Session or RAKP to a session error.
pub(crate) fn rmcpplus_status_error(status: u8) -> Error {
    let code = match status {
        0x01 | 0x0B => ErrorCode::BmcBusy,
        0x04..=0x07 | 0x10 | 0x11 => ErrorCode::CipherSuiteUnavailable,
        0x09 | 0x0A => ErrorCode::PrivilegeLevelCannotBeObtained,
        0x0C | 0x0D => ErrorCode::UsernameInvalid,
        // The BMC rejected our RAKP message 3 auth code.
        0x0F => ErrorCode::PasswordInvalid,
        _ => ErrorCode::BmcError,
    };
    Error::Session(code)
}

/// Handle a packet received during Open Session / RAKP.
pub(super) fn handle_setup(ctx: &mut SessionContext, packet: &DecodedPacket, now: Instant) -> Result<()> {
    match ctx.protocol.state {
        State::OpenSessionSent => on_open_session_response(ctx, packet, now),
        State::Rakp1Sent => on_rakp2(ctx, packet, now),
        State::Rakp3Sent => on_rakp4(ctx, packet, now),
        _ => Ok(()),
    }
}

fn on_open_session_response(ctx: &mut SessionContext, packet: &DecodedPacket, now: Instant) -> Result<()> {
    if packet.payload_type != payload_type::OPEN_SESSION_RESPONSE {
        return packet_error(ctx, Error::Protocol("expected open session response"));
    }
    let response = match OpenSessionResponse::parse(&packet.payload) {
        Ok(response) => response,
        Err(err) => return packet_error(ctx, err),
    };
    if response.message_tag != ctx.protocol.message_tag
        || response.remote_console_session_id != ctx.protocol.remote_console_session_id
    {
        return packet_error(ctx, Error::Protocol("open session response for another request"));
    }
    if response.status_code != 0x00 {
        return Err(rmcpplus_status_error(response.status_code));
    }
    if response.algorithms != ctx.config.cipher_suite.algorithms() {
        return Err(Error::Session(ErrorCode::CipherSuiteUnavailable));
    }
    if response.managed_system_session_id == 0 {
        return Err(Error::Protocol("BMC returned a zero session id"));
    }

    ctx.protocol.managed_system_session_id = response.managed_system_session_id;
    ctx.protocol.last_received = Some(now);
    transition(ctx, State::Rakp1Sent, now)
}

fn on_rakp2(ctx: &mut SessionContext, packet: &DecodedPacket, now: Instant) -> Result<()> {
    if packet.payload_type != payload_type::RAKP_2 {
        return packet_error(ctx, Error::Protocol("expected RAKP message 2"));
    }
    let rakp2 = match Rakp2::parse(&packet.payload) {
        Ok(rakp2) => rakp2,
        Err(err) => return packet_error(ctx, err),
    };
    if rakp2.message_tag != ctx.protocol.message_tag
        || rakp2.remote_console_session_id != ctx.protocol.remote_console_session_id
    {
        return packet_error(ctx, Error::Protocol("RAKP message 2 for another request"));
    }
    if rakp2.status_code != 0x00 {
        return Err(rmcpplus_status_error(rakp2.status_code));
    }

    ctx.protocol.bmc_random = rakp2.bmc_random;
    ctx.protocol.bmc_guid = rakp2.bmc_guid;

    let user_key = Zeroizing::new(ctx.config.password.to_key_sha1());
    let sik = {
        let transcript = transcript(ctx);
        let expected = transcript.rakp2_auth_code(&user_key)?;
        if !ct_eq(&expected, &rakp2.key_exchange_auth_code) {
            return Err(Error::Session(ErrorCode::PasswordInvalid));
        }
        let kg = Zeroizing::new(
            ctx.config
                .bmc_key
                .as_ref()
                .map_or(*user_key, |kg| kg.to_key_sha1()),
        );
        transcript.sik(&kg)?
    };
    ctx.protocol.keys = SessionKeys::from_sik(sik)?;
    ctx.protocol.last_received = Some(now);
    transition(ctx, State::Rakp3Sent, now)
}

fn on_rakp4(ctx: &mut SessionContext, packet: &DecodedPacket, now: Instant) -> Result<()> {
    if packet.payload_type != payload_type::RAKP_4 {
        return packet_error(ctx, Error::Protocol("expected RAKP message 4"));
    }
    let rakp4 = match Rakp4::parse(&packet.payload) {
        Ok(rakp4) => rakp4,
        Err(err) => return packet_error(ctx, err),
    };
    if rakp4.message_tag != ctx.protocol.message_tag
        || rakp4.remote_console_session_id != ctx.protocol.remote_console_session_id
    {
        return packet_error(ctx, Error::Protocol("RAKP message 4 for another request"));
    }
    if rakp4.status_code != 0x00 {
        return Err(rmcpplus_status_error(rakp4.status_code));
    }

    let expected = transcript(ctx).rakp4_icv(ctx.protocol.keys.sik())?;
    if !ct_eq(&expected, &rakp4.integrity_check_value) {
        return Err(Error::Session(ErrorCode::KgInvalid));
    }

    tracing::debug!(
        session = ctx.id(),
        managed_session_id = ctx.protocol.managed_system_session_id,
        "RMCP+ session established"
    );
    ctx.protocol.last_received = Some(now);
    transition(ctx, State::SetPrivilegeSent, now)
}

/// Handle an IPMI response inside the session.
pub(super) fn handle_response(ctx: &mut SessionContext, message: &[u8], now: Instant) -> Result<()> {
    let Some((netfn, cmd)) = ctx.protocol.outstanding else {
        tracing::trace!(session = ctx.id(), "ignoring unsolicited IPMI response");
        return Ok(());
    };
    let rq_seq = ctx.protocol.rq_seq;
    if message.len() < 6 || message[4] >> 2 != rq_seq || message[5] != cmd {
        tracing::trace!(session = ctx.id(), "ignoring stale IPMI response");
        return Ok(());
    }
    let raw = match decode_lan_response(netfn, cmd, rq_seq, message) {
        Ok(raw) => raw,
        Err(err) => return packet_error(ctx, err),
    };
    ctx.protocol.outstanding = None;
    ctx.protocol.pending = None;

    match ctx.protocol.state {
        State::SetPrivilegeSent => {
            let command = SetSessionPrivilegeLevel {
                privilege: ctx.config.privilege_level,
            };
            match command.parse_response(raw) {
                Ok(_) => transition(ctx, State::GetPayloadActivationStatusSent, now),
                Err(Error::CompletionCode {
                    completion_code: 0x80 | 0x81,
                }) => Err(Error::Session(ErrorCode::PrivilegeLevelCannotBeObtained)),
                Err(err) => Err(bmc_error(err)),
            }
        }
        State::GetPayloadActivationStatusSent => on_activation_status(ctx, raw, now),
        State::ActivatePayloadSent => on_activate(ctx, raw, now),
        State::DeactivatePayloadSent => on_deactivate(ctx, raw, now),
        State::CloseSessionSent => on_close_session(ctx, now),
        State::SolSession => {
            if let Err(err) = GetChannelPayloadVersion.parse_response(raw) {
                tracing::debug!(session = ctx.id(), error = %err, "keepalive answered with error");
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Completion-code failures become `BmcError`; other errors pass through.
fn bmc_error(err: Error) -> Error {
    match err {
        Error::CompletionCode {
            completion_code: CC_INSUFFICIENT_PRIVILEGE,
        } => Error::Session(ErrorCode::PrivilegeLevelInsufficient),
        Error::CompletionCode { .. } => Error::Session(ErrorCode::BmcError),
        other => other,
    }
}

fn on_activation_status(
    ctx: &mut SessionContext,
    raw: crate::types::RawResponse,
    now: Instant,
) -> Result<()> {
    let status = GetPayloadActivationStatus
        .parse_response(raw)
        .map_err(bmc_error)?;
    if status.instance_capacity == 0 {
        return Err(Error::Session(ErrorCode::SolUnavailable));
    }

    if ctx.config.deactivate_only {
        let active = (1..=status.instance_capacity.min(16)).find(|i| status.is_active(*i));
        return match active {
            Some(instance) => {
                ctx.protocol.payload_instance = instance;
                transition(ctx, State::DeactivatePayloadSent, now)
            }
            None => {
                ctx.mark_deactivated();
                transition(ctx, State::CloseSessionSent, now)
            }
        };
    }

    match status.first_free_instance() {
        Some(instance) => {
            ctx.protocol.payload_instance = instance;
            transition(ctx, State::ActivatePayloadSent, now)
        }
        None if ctx.config.deactivate_if_active => {
            ctx.protocol.payload_instance = 1;
            ctx.protocol.deactivate_and_retry = true;
            transition(ctx, State::DeactivatePayloadSent, now)
        }
        None => Err(Error::Session(ErrorCode::SolInUse)),
    }
}

fn on_activate(ctx: &mut SessionContext, raw: crate::types::RawResponse, now: Instant) -> Result<()> {
    let protection = session_protection(ctx.config.cipher_suite);
    let command = ActivatePayload::new(
        ctx.protocol.payload_instance,
        protection.encrypted,
        protection.authenticated,
    );

    let activated = match command.parse_response(raw) {
        Ok(activated) => activated,
        Err(Error::CompletionCode {
            completion_code: CC_PAYLOAD_ALREADY_ACTIVE,
        }) if ctx.config.deactivate_if_active && !ctx.protocol.activation_retried => {
            ctx.protocol.deactivate_and_retry = true;
            return transition(ctx, State::DeactivatePayloadSent, now);
        }
        Err(Error::CompletionCode { completion_code }) => {
            let code = match completion_code {
                CC_PAYLOAD_ALREADY_ACTIVE | CC_PAYLOAD_LIMIT_REACHED => ErrorCode::SolInUse,
                CC_PAYLOAD_DISABLED => ErrorCode::SolUnavailable,
                CC_CANNOT_ACTIVATE_WITH_ENCRYPTION => ErrorCode::SolRequiresNoEncryption,
                CC_CANNOT_ACTIVATE_WITHOUT_ENCRYPTION => ErrorCode::SolRequiresEncryption,
                CC_INSUFFICIENT_PRIVILEGE => ErrorCode::PrivilegeLevelInsufficient,
                _ => ErrorCode::BmcError,
            };
            return Err(Error::Session(code));
        }
        Err(err) => return Err(err),
    };

    ctx.protocol.payload_active = true;
    ctx.protocol.sol.configure(activated.inbound_payload_size);

    if activated.port != 0 && activated.port != ctx.peer().port() {
        tracing::debug!(
            session = ctx.id(),
            port = activated.port,
            "SOL payload is served on another port; restarting there"
        );
        ctx.protocol.try_new_port = Some(activated.port);
        return transition(ctx, State::CloseSessionSent, now);
    }

    transition(ctx, State::SolSession, now)?;
    ctx.mark_established();
    crate::observe::session_established();
    Ok(())
}

fn on_deactivate(ctx: &mut SessionContext, raw: crate::types::RawResponse, now: Instant) -> Result<()> {
    let command = DeactivatePayload {
        instance: ctx.protocol.payload_instance,
    };
    match command.parse_response(raw) {
        // 0x80: the payload was already inactive.
        Ok(())
        | Err(Error::CompletionCode {
            completion_code: CC_PAYLOAD_ALREADY_ACTIVE,
        }) => {
            if ctx.config.deactivate_only {
                ctx.mark_deactivated();
            }
        }
        Err(err) => {
            tracing::debug!(session = ctx.id(), error = %err, "deactivate payload failed");
            if ctx.config.deactivate_only {
                ctx.close_with(ErrorCode::BmcError);
            }
        }
    }
    ctx.protocol.payload_active = false;

    if ctx.protocol.deactivate_and_retry && !ctx.is_closing() {
        ctx.protocol.deactivate_and_retry = false;
        ctx.protocol.activation_retried = true;
        return transition(ctx, State::ActivatePayloadSent, now);
    }
    transition(ctx, State::CloseSessionSent, now)
}

fn on_close_session(ctx: &mut SessionContext, now: Instant) -> Result<()> {
    if let Some(port) = ctx.protocol.try_new_port.take() {
        if !ctx.is_closing() {
            let randoms = SessionRandoms::draw()?;
            ctx.protocol.restart(randoms);
            ctx.set_peer_port(port);
            ctx.protocol.last_received = Some(now);
            return transition(ctx, State::OpenSessionSent, now);
        }
    }
    end(ctx);
    Ok(())
}
