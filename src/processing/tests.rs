use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::*;
use crate::config::SessionConfig;
use crate::context::tests::local_config;
use crate::protocol::tests::lan_response_for;
use crate::protocol::{DecodedPacket, RakpTranscript};
use crate::sol::{SolPacket, status};
use crate::types::PrivilegeLevel;

const MANAGED_ID: u32 = 0x0200_0A0B;

/// Plays the BMC side of a session against one context.
struct FakeBmc {
    tag: u8,
    remote_id: u32,
    console_random: [u8; 16],
    bmc_random: [u8; 16],
    guid: [u8; 16],
    keys: SessionKeys,
    seq: u32,
    protection: Protection,
}

impl FakeBmc {
    fn new(ctx: &SessionContext) -> Self {
        Self {
            tag: 0,
            remote_id: 0,
            console_random: [0; 16],
            bmc_random: [0x5A; 16],
            guid: [0xA5; 16],
            keys: SessionKeys::empty(),
            seq: 0,
            protection: session_protection(ctx.config.cipher_suite),
        }
    }

    fn sent(&self, ctx: &mut SessionContext) -> DecodedPacket {
        let bytes = ctx.network_out.pop().expect("queued packet");
        decode_packet(&bytes, &self.keys).expect("decode")
    }

    fn deliver_setup(&self, ctx: &mut SessionContext, payload_type_num: u8, payload: &[u8]) {
        let bytes = encode_packet(
            payload_type_num,
            0,
            0,
            payload,
            Protection::NONE,
            &SessionKeys::empty(),
        )
        .expect("encode");
        ctx.network_in.write(&bytes).expect("deliver");
    }

    fn deliver(&mut self, ctx: &mut SessionContext, payload_type_num: u8, payload: &[u8]) {
        self.seq += 1;
        let bytes = encode_packet(
            payload_type_num,
            self.remote_id,
            self.seq,
            payload,
            self.protection,
            &self.keys,
        )
        .expect("encode");
        ctx.network_in.write(&bytes).expect("deliver");
    }

    fn transcript<'a>(&'a self, username: &'a [u8]) -> RakpTranscript<'a> {
        RakpTranscript {
            remote_console_session_id: self.remote_id,
            managed_system_session_id: MANAGED_ID,
            console_random: &self.console_random,
            bmc_random: &self.bmc_random,
            bmc_guid: &self.guid,
            privilege: PrivilegeLevel::Administrator,
            username,
        }
    }

    /// Answer Open Session; leaves the context in `Rakp1Sent`.
    fn open(&mut self, ctx: &mut SessionContext, now: Instant) {
        step(ctx, now);
        let request = self.sent(ctx);
        assert_eq!(request.payload_type, payload_type::OPEN_SESSION_REQUEST);
        self.tag = request.payload[0];
        self.remote_id = u32::from_le_bytes(request.payload[4..8].try_into().expect("id"));

        let (auth, integrity, confidentiality) = ctx.config.cipher_suite.algorithms();
        let mut response = vec![self.tag, 0x00, 0x04, 0x00];
        response.extend_from_slice(&self.remote_id.to_le_bytes());
        response.extend_from_slice(&MANAGED_ID.to_le_bytes());
        for (kind, algo) in [(0x00, auth), (0x01, integrity), (0x02, confidentiality)] {
            response.extend_from_slice(&[kind, 0x00, 0x00, 0x08, algo, 0x00, 0x00, 0x00]);
        }
        self.deliver_setup(ctx, payload_type::OPEN_SESSION_RESPONSE, &response);
        step(ctx, now);
        assert_eq!(ctx.protocol.state, State::Rakp1Sent);
    }

    /// Run RAKP 1-4 with `password` as the BMC's copy of the secret.
    fn rakp(&mut self, ctx: &mut SessionContext, password: &[u8], now: Instant) {
        let rakp1 = self.sent(ctx);
        assert_eq!(rakp1.payload_type, payload_type::RAKP_1);
        self.console_random.copy_from_slice(&rakp1.payload[8..24]);
        let username = rakp1.payload[28..].to_vec();

        let mut user_key = [0u8; 20];
        user_key[..password.len()].copy_from_slice(password);
        let transcript = self.transcript(&username);
        let auth = transcript.rakp2_auth_code(&user_key).expect("rakp2");
        let sik = transcript.sik(&user_key).expect("sik");
        let icv = transcript.rakp4_icv(&sik).expect("icv");
        let rakp3_expected = transcript.rakp3_auth_code(&user_key).expect("rakp3");

        let mut rakp2 = vec![self.tag, 0x00, 0x00, 0x00];
        rakp2.extend_from_slice(&self.remote_id.to_le_bytes());
        rakp2.extend_from_slice(&self.bmc_random);
        rakp2.extend_from_slice(&self.guid);
        rakp2.extend_from_slice(&auth);
        self.deliver_setup(ctx, payload_type::RAKP_2, &rakp2);
        step(ctx, now);
        if ctx.protocol.state != State::Rakp3Sent {
            return;
        }

        let rakp3 = self.sent(ctx);
        assert_eq!(rakp3.payload_type, payload_type::RAKP_3);
        assert_eq!(&rakp3.payload[8..28], &rakp3_expected);

        let mut rakp4 = vec![self.tag, 0x00, 0x00, 0x00];
        rakp4.extend_from_slice(&self.remote_id.to_le_bytes());
        rakp4.extend_from_slice(&icv);
        self.deliver_setup(ctx, payload_type::RAKP_4, &rakp4);
        self.keys = SessionKeys::from_sik(sik).expect("keys");
        step(ctx, now);
    }

    /// Answer the outstanding IPMI request; returns the request message.
    fn respond(&mut self, ctx: &mut SessionContext, cc: u8, data: &[u8], now: Instant) -> Vec<u8> {
        let request = self.sent(ctx);
        assert_eq!(request.payload_type, payload_type::IPMI);
        assert_eq!(request.session_id, MANAGED_ID);
        let response = lan_response_for(&request.payload, cc, data);
        self.deliver(ctx, payload_type::IPMI, &response);
        step(ctx, now);
        request.payload
    }

    /// Drive a fresh context all the way into `SolSession`.
    fn establish(&mut self, ctx: &mut SessionContext, now: Instant) {
        self.open(ctx, now);
        self.rakp(ctx, b"password", now);
        assert_eq!(ctx.protocol.state, State::SetPrivilegeSent);
        self.respond(ctx, 0x00, &[0x04], now);
        self.respond(ctx, 0x00, &[0x01, 0x00, 0x00], now);
        let activate = self.respond(ctx, 0x00, &activated(623), now);
        assert_eq!(activate[5], 0x48);
        assert_eq!(ctx.protocol.state, State::SolSession);
    }
}

/// Activate Payload response data: 64-byte payloads on `port`.
fn activated(port: u16) -> Vec<u8> {
    let mut data = vec![0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x40, 0x00];
    data.extend_from_slice(&port.to_le_bytes());
    data
}

fn context(config: SessionConfig) -> SessionContext {
    SessionContext::create(config).expect("create")
}

fn builder() -> crate::config::SessionConfigBuilder {
    SessionConfig::builder(SocketAddr::from(([127, 0, 0, 1], 623)))
        .username("admin")
        .password("password")
}

#[test]
fn start_queues_open_session_request() {
    let mut ctx = context(local_config());
    step(&mut ctx, Instant::now());
    assert_eq!(ctx.protocol.state, State::OpenSessionSent);
    assert_eq!(ctx.network_out.len(), 1);
    assert!(ctx.protocol.pending.is_some());
}

#[test]
fn close_before_start_ends_without_traffic() {
    let mut ctx = context(local_config());
    ctx.mark_close_requested();
    step(&mut ctx, Instant::now());
    assert_eq!(ctx.protocol.state, State::End);
    assert!(ctx.network_out.is_empty());
}

#[test]
fn retransmits_with_backoff_then_gives_up() {
    let mut ctx = context(local_config());
    let t0 = Instant::now();
    step(&mut ctx, t0);
    ctx.network_out.clear();

    step(&mut ctx, t0 + Duration::from_millis(499));
    assert!(ctx.network_out.is_empty());
    step(&mut ctx, t0 + Duration::from_millis(500));
    assert_eq!(ctx.network_out.len(), 1);
    assert_eq!(ctx.protocol.state, State::OpenSessionSent);

    let mut now = t0 + Duration::from_millis(500);
    let mut resends = 1;
    while ctx.protocol.state != State::End {
        ctx.network_out.clear();
        now += next_timeout(&ctx, now);
        step(&mut ctx, now);
        if !ctx.network_out.is_empty() {
            resends += 1;
        }
    }
    assert_eq!(resends, ctx.config.max_retransmissions);
    assert_eq!(ctx.error_code(), Some(ErrorCode::ExcessRetransmissions));
}

#[test]
fn session_timeout_ends_abruptly() {
    let config = builder()
        .session_timeout(Duration::from_secs(2))
        .build()
        .expect("config");
    let mut ctx = context(config);
    let t0 = Instant::now();
    step(&mut ctx, t0);
    ctx.network_out.clear();

    step(&mut ctx, t0 + Duration::from_secs(2));
    assert_eq!(ctx.protocol.state, State::End);
    assert_eq!(ctx.error_code(), Some(ErrorCode::SessionTimeout));
    assert!(ctx.network_out.is_empty());
}

#[test]
fn wrong_password_is_detected_at_rakp2() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.open(&mut ctx, now);
    bmc.rakp(&mut ctx, b"wrong", now);
    assert_eq!(ctx.protocol.state, State::End);
    assert_eq!(ctx.error_code(), Some(ErrorCode::PasswordInvalid));
}

#[test]
fn mismatched_bmc_key_is_detected_at_rakp4() {
    let config = builder()
        .bmc_key_bytes(b"other-kg".to_vec())
        .build()
        .expect("config");
    let mut ctx = context(config);
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.open(&mut ctx, now);
    // The BMC derives its keys without a K_g, so only the RAKP 4 check fails.
    bmc.rakp(&mut ctx, b"password", now);
    assert_eq!(ctx.protocol.state, State::End);
    assert_eq!(ctx.error_code(), Some(ErrorCode::KgInvalid));
}

#[test]
fn too_many_undecodable_packets_end_the_session() {
    let config = builder().max_packet_errors(3).build().expect("config");
    let mut ctx = context(config);
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.establish(&mut ctx, now);

    for _ in 0..3 {
        ctx.network_in.write(&[0x06, 0x00]).expect("deliver");
        step(&mut ctx, now);
        assert_eq!(ctx.protocol.state, State::SolSession);
    }
    ctx.network_in.write(&[0x06, 0x00]).expect("deliver");
    step(&mut ctx, now);
    assert_eq!(ctx.protocol.state, State::End);
    assert_eq!(ctx.error_code(), Some(ErrorCode::ExcessErrorsReceived));
    assert!(ctx.network_out.is_empty());
}

#[test]
fn open_session_status_maps_to_error_code() {
    let mut ctx = context(local_config());
    let bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    step(&mut ctx, now);
    let request = bmc.sent(&mut ctx);
    let mut response = vec![request.payload[0], 0x11, 0x00, 0x00];
    response.extend_from_slice(&request.payload[4..8]);
    bmc.deliver_setup(&mut ctx, payload_type::OPEN_SESSION_RESPONSE, &response);
    step(&mut ctx, now);
    assert_eq!(ctx.protocol.state, State::End);
    assert_eq!(ctx.error_code(), Some(ErrorCode::CipherSuiteUnavailable));
}

#[test]
fn handshake_reaches_sol_and_moves_characters() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.establish(&mut ctx, now);
    assert!(ctx.protocol.payload_active);
    assert!(ctx.network_out.is_empty());

    ctx.console_input().write(b"hello").expect("input");
    step(&mut ctx, now);
    let sent = bmc.sent(&mut ctx);
    assert_eq!(sent.payload_type, payload_type::SOL);
    let packet = SolPacket::parse(&sent.payload).expect("sol");
    assert_eq!(packet.seq, 1);
    assert_eq!(packet.data, b"hello");
    assert!(ctx.console_input().is_empty());

    let reply = SolPacket {
        seq: 1,
        ack_seq: 1,
        accepted: 5,
        data: b"login: ".to_vec(),
        ..SolPacket::default()
    };
    bmc.deliver(&mut ctx, payload_type::SOL, &reply.encode());
    step(&mut ctx, now);
    assert!(ctx.protocol.sol.deadline(&ctx.config).is_none());
    assert_eq!(ctx.console_output().peek(), b"login: ");

    let ack = SolPacket::parse(&bmc.sent(&mut ctx).payload).expect("ack");
    assert_eq!((ack.ack_seq, ack.accepted), (1, 7));

    // The same packet again is acknowledged without duplicating output.
    bmc.deliver(&mut ctx, payload_type::SOL, &reply.encode());
    step(&mut ctx, now);
    assert_eq!(ctx.console_output().len(), 7);
    let ack = SolPacket::parse(&bmc.sent(&mut ctx).payload).expect("ack");
    assert_eq!((ack.ack_seq, ack.accepted), (1, 7));
}

#[test]
fn partial_ack_resends_the_remainder() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.establish(&mut ctx, now);

    ctx.console_input().write(b"abcdef").expect("input");
    step(&mut ctx, now);
    bmc.sent(&mut ctx);

    let ack = SolPacket {
        ack_seq: 1,
        accepted: 2,
        ..SolPacket::default()
    };
    bmc.deliver(&mut ctx, payload_type::SOL, &ack.encode());
    step(&mut ctx, now);
    let resent = SolPacket::parse(&bmc.sent(&mut ctx).payload).expect("sol");
    assert_eq!(resent.seq, 2);
    assert_eq!(resent.data, b"cdef");
}

#[test]
fn nack_keeps_only_the_unaccepted_characters() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.establish(&mut ctx, now);

    ctx.console_input().write(b"abcdef").expect("input");
    step(&mut ctx, now);
    let first = SolPacket::parse(&bmc.sent(&mut ctx).payload).expect("sol");
    assert_eq!(first.seq, 1);

    let nack = SolPacket {
        ack_seq: 1,
        accepted: 2,
        flags: status::NACK,
        ..SolPacket::default()
    };
    bmc.deliver(&mut ctx, payload_type::SOL, &nack.encode());
    step(&mut ctx, now);
    assert!(ctx.network_out.is_empty());

    let timeout = ctx.config.retransmission_timeout;
    step(&mut ctx, now + timeout);
    let resent = SolPacket::parse(&bmc.sent(&mut ctx).payload).expect("sol");
    assert_eq!(resent.seq, 1);
    assert_eq!(resent.data, b"cdef");
}

#[test]
fn break_follows_the_bytes_typed_before_it() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.establish(&mut ctx, now);

    ctx.console_input().write(b"ab").expect("input");
    ctx.request_break();
    ctx.console_input().write(b"cd").expect("input");
    step(&mut ctx, now);
    let first = SolPacket::parse(&bmc.sent(&mut ctx).payload).expect("sol");
    assert_eq!(first.data, b"ab");

    let ack = SolPacket {
        ack_seq: first.seq,
        accepted: 2,
        ..SolPacket::default()
    };
    bmc.deliver(&mut ctx, payload_type::SOL, &ack.encode());
    step(&mut ctx, now);
    let brk = SolPacket::parse(&bmc.sent(&mut ctx).payload).expect("sol");
    assert!(brk.has_flag(crate::sol::op::GENERATE_BREAK));
    assert!(brk.data.is_empty());
    assert_eq!(ctx.break_requested(), None);
}

#[test]
fn sol_retransmits_under_the_same_sequence() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.establish(&mut ctx, now);

    ctx.console_input().write(b"x").expect("input");
    step(&mut ctx, now);
    let first = SolPacket::parse(&bmc.sent(&mut ctx).payload).expect("sol");

    let timeout = ctx.config.retransmission_timeout;
    step(&mut ctx, now + timeout);
    let again = SolPacket::parse(&bmc.sent(&mut ctx).payload).expect("sol");
    assert_eq!(again.seq, first.seq);
    assert_eq!(again.data, b"x");
}

#[test]
fn deactivating_bmc_reports_stolen_and_closes_session() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.establish(&mut ctx, now);

    let stolen = SolPacket {
        flags: status::SOL_DEACTIVATING,
        ..SolPacket::default()
    };
    bmc.deliver(&mut ctx, payload_type::SOL, &stolen.encode());
    step(&mut ctx, now);
    assert_eq!(ctx.error_code(), Some(ErrorCode::SolStolen));
    assert_eq!(ctx.protocol.state, State::CloseSessionSent);

    let close = bmc.respond(&mut ctx, 0x00, &[], now);
    assert_eq!(close[5], 0x3C);
    assert_eq!(ctx.protocol.state, State::End);
}

#[test]
fn user_close_deactivates_then_closes() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.establish(&mut ctx, now);

    ctx.close_with(ErrorCode::Success);
    step(&mut ctx, now);
    assert_eq!(ctx.protocol.state, State::DeactivatePayloadSent);
    let deactivate = bmc.respond(&mut ctx, 0x00, &[], now);
    assert_eq!(deactivate[5], 0x49);
    assert_eq!(ctx.protocol.state, State::CloseSessionSent);
    bmc.respond(&mut ctx, 0x00, &[], now);
    assert_eq!(ctx.protocol.state, State::End);
    assert_eq!(ctx.error_code(), Some(ErrorCode::Success));
}

#[test]
fn payload_in_use_is_deactivated_and_retried() {
    let config = builder().deactivate_if_active(true).build().expect("config");
    let mut ctx = context(config);
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.open(&mut ctx, now);
    bmc.rakp(&mut ctx, b"password", now);
    bmc.respond(&mut ctx, 0x00, &[0x04], now);
    bmc.respond(&mut ctx, 0x00, &[0x01, 0x00, 0x00], now);

    bmc.respond(&mut ctx, 0x80, &[], now);
    assert_eq!(ctx.protocol.state, State::DeactivatePayloadSent);
    bmc.respond(&mut ctx, 0x00, &[], now);
    assert_eq!(ctx.protocol.state, State::ActivatePayloadSent);

    // A second refusal is final.
    bmc.respond(&mut ctx, 0x80, &[], now);
    assert_eq!(ctx.error_code(), Some(ErrorCode::SolInUse));
    assert_eq!(ctx.protocol.state, State::CloseSessionSent);
}

#[test]
fn payload_in_use_without_deactivate_fails() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.open(&mut ctx, now);
    bmc.rakp(&mut ctx, b"password", now);
    bmc.respond(&mut ctx, 0x00, &[0x04], now);
    // One instance, already active.
    bmc.respond(&mut ctx, 0x00, &[0x01, 0x01, 0x00], now);
    assert_eq!(ctx.error_code(), Some(ErrorCode::SolInUse));
    assert_eq!(ctx.protocol.state, State::CloseSessionSent);
}

#[test]
fn deactivate_only_closes_after_deactivation() {
    let config = builder().deactivate_only(true).build().expect("config");
    let mut ctx = context(config);
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.open(&mut ctx, now);
    bmc.rakp(&mut ctx, b"password", now);
    bmc.respond(&mut ctx, 0x00, &[0x04], now);
    bmc.respond(&mut ctx, 0x00, &[0x02, 0x02, 0x00], now);
    assert_eq!(ctx.protocol.state, State::DeactivatePayloadSent);
    assert_eq!(ctx.protocol.payload_instance, 2);
    bmc.respond(&mut ctx, 0x00, &[], now);
    assert_eq!(ctx.protocol.state, State::CloseSessionSent);
    bmc.respond(&mut ctx, 0x00, &[], now);
    assert_eq!(ctx.protocol.state, State::End);
    assert_eq!(ctx.error_code(), None);
}

#[test]
fn new_payload_port_restarts_the_session_there() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.open(&mut ctx, now);
    bmc.rakp(&mut ctx, b"password", now);
    bmc.respond(&mut ctx, 0x00, &[0x04], now);
    bmc.respond(&mut ctx, 0x00, &[0x01, 0x00, 0x00], now);
    bmc.respond(&mut ctx, 0x00, &activated(6230), now);
    assert_eq!(ctx.protocol.state, State::CloseSessionSent);

    let first_id = bmc.remote_id;
    bmc.respond(&mut ctx, 0x00, &[], now);
    assert_eq!(ctx.protocol.state, State::OpenSessionSent);
    assert_eq!(ctx.peer().port(), 6230);
    assert_ne!(ctx.protocol.remote_console_session_id, first_id);
    assert!(!ctx.protocol.keys.is_negotiated());
}

#[test]
fn replayed_packets_are_dropped_silently() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.establish(&mut ctx, now);

    let data = SolPacket {
        seq: 1,
        data: b"a".to_vec(),
        ..SolPacket::default()
    };
    bmc.deliver(&mut ctx, payload_type::SOL, &data.encode());
    let replay = ctx.network_in.peek().to_vec();
    step(&mut ctx, now);
    bmc.sent(&mut ctx);

    ctx.network_in.write(&replay).expect("deliver");
    step(&mut ctx, now);
    assert!(ctx.network_out.is_empty());
    assert_eq!(ctx.protocol.errors, 0);
}

#[test]
fn keepalive_after_idle_interval() {
    let mut ctx = context(local_config());
    let mut bmc = FakeBmc::new(&ctx);
    let now = Instant::now();
    bmc.establish(&mut ctx, now);

    let later = now + ctx.config.keepalive_interval;
    step(&mut ctx, later);
    let request = bmc.sent(&mut ctx);
    assert_eq!(request.payload[5], 0x4F);

    let response = lan_response_for(&request.payload, 0x00, &[0x10]);
    bmc.deliver(&mut ctx, payload_type::IPMI, &response);
    step(&mut ctx, later);
    assert!(ctx.protocol.pending.is_none());
    assert_eq!(ctx.protocol.state, State::SolSession);
}
