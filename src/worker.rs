//! The per-shard engine loop and its descriptor I/O helpers.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::advance::Advance;
use crate::context::{PACKET_BUFLEN, SIGNAL_GENERATE_BREAK, SessionContext};
use crate::engine::Runtime;
use crate::error::{Error, ErrorCode, Result};
use crate::poll::{Interest, PollSet};
use crate::shard::Shard;

/// Outcome of one helper call on one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoOutcome {
    /// Keep servicing this context.
    Progress,
    /// The context was closed cleanly; skip its remaining events this tick.
    Closed,
}

enum Flow {
    Continue,
    Exit,
}

/// Poll-set slots of one context.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Slots {
    pub(crate) network: usize,
    pub(crate) signal: usize,
    pub(crate) user: usize,
    pub(crate) closing: bool,
}

/// Worker thread body: run ticks until told to stop, then deregister.
pub(crate) fn run(runtime: Arc<Runtime>, index: usize) {
    let shard = &runtime.shards[index];
    tracing::debug!(shard = index, "worker started");

    let mut teardown_propagated = false;
    loop {
        match tick(&runtime, shard, &mut teardown_propagated) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => break,
            Err(err) => {
                tracing::warn!(shard = index, error = %err, "worker stopping on error");
                break;
            }
        }
    }

    runtime.worker_exited(index);
    tracing::debug!(shard = index, "worker exited");
}

fn tick(runtime: &Runtime, shard: &Shard, teardown_propagated: &mut bool) -> Result<Flow> {
    let teardown = runtime.teardown.load(Ordering::Acquire);
    if runtime.teardown_immediate.load(Ordering::Acquire) {
        return Ok(Flow::Exit);
    }

    let mut members = shard.lock()?;
    if teardown && !*teardown_propagated {
        members.teardown_initiate();
        *teardown_propagated = true;
    }

    let Advance { active, timeout } = runtime.advancer.advance(&mut members.contexts);
    if active == 0 {
        drop(members);
        if teardown {
            return Ok(Flow::Exit);
        }
        std::thread::sleep(runtime.config.spin_wait);
        return Ok(Flow::Continue);
    }

    let (mut set, slots) = build_poll_set(&members.contexts);
    let notifier = set.push(shard.notifier_fd(), Interest::READ);
    drop(members);

    if !wait_ready(&mut set, timeout, shard.index()) {
        std::thread::sleep(runtime.config.spin_wait);
        return Ok(Flow::Continue);
    }

    // Submitters only append and only this thread prunes, so the indices
    // captured above still name the same contexts.
    let mut members = shard.lock()?;
    dispatch(&mut members.contexts, &set, &slots);
    drop(members);

    if set.readiness(notifier).readable {
        if let Err(err) = shard.drain_notifier() {
            tracing::warn!(shard = shard.index(), error = %err, "draining wake-ups failed");
        }
    }
    Ok(Flow::Continue)
}

/// Wait on `set`, logging a failed `poll(2)` instead of ending the worker.
///
/// Returns false when the wait failed and readiness must not be dispatched.
pub(crate) fn wait_ready(set: &mut PollSet, timeout: Duration, shard: usize) -> bool {
    match set.wait(timeout) {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(shard, fds = set.len(), error = %err, "poll failed");
            false
        }
    }
}

/// One descriptor triple per context: network, signal, then user (or a
/// no-interest placeholder on the signal descriptor once closing).
pub(crate) fn build_poll_set(contexts: &[SessionContext]) -> (PollSet, Vec<Option<Slots>>) {
    let mut set = PollSet::with_capacity(contexts.len() * 3 + 1);
    let mut slots = Vec::with_capacity(contexts.len());

    for ctx in contexts {
        let Some(net) = ctx.network.as_ref() else {
            slots.push(None);
            continue;
        };
        let network = set.push(
            net.socket_fd(),
            Interest {
                read: true,
                write: !ctx.network_out.is_empty(),
            },
        );
        let signal = set.push(net.signal_fd(), Interest::READ);
        let closing = ctx.is_closing();
        let user = if closing {
            set.push(net.signal_fd(), Interest::NONE)
        } else {
            set.push(
                net.user_fd(),
                Interest {
                    // Read interest only while there is room: a full buffer
                    // would otherwise report readable on every tick.
                    read: ctx.console_in.free() > 0,
                    write: !ctx.console_out.is_empty(),
                },
            )
        };
        slots.push(Some(Slots {
            network,
            signal,
            user,
            closing,
        }));
    }

    (set, slots)
}

fn dispatch(contexts: &mut [SessionContext], set: &PollSet, slots: &[Option<Slots>]) {
    for (ctx, slots) in contexts.iter_mut().zip(slots) {
        let Some(slots) = slots else { continue };
        if let Err(err) = service(ctx, set, slots) {
            tracing::warn!(session = ctx.id(), error = %err, "closing session on I/O failure");
            ctx.close_with(err.code());
        }
    }
}

fn service(ctx: &mut SessionContext, set: &PollSet, slots: &Slots) -> Result<()> {
    let network = set.readiness(slots.network);
    let signal = set.readiness(slots.signal);
    let user = set.readiness(slots.user);

    if network.error || signal.error {
        return Err(Error::Internal("error condition on session descriptor"));
    }
    if !slots.closing && user.error {
        return Err(Error::Internal("error condition on user stream"));
    }

    if network.readable {
        receive(ctx)?;
    }
    if network.writable {
        send(ctx)?;
    }
    if signal.readable {
        read_signal(ctx)?;
    }
    if !slots.closing {
        if user.readable && read_console(ctx)? == IoOutcome::Closed {
            return Ok(());
        }
        if user.writable {
            write_console(ctx)?;
        }
    }
    Ok(())
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Read one datagram from the peer, replacing any unread one.
pub(crate) fn receive(ctx: &mut SessionContext) -> Result<IoOutcome> {
    let net = ctx
        .network
        .as_ref()
        .ok_or(Error::Internal("session network not initialized"))?;

    // One spare byte detects datagrams larger than the buffer.
    let mut buf = [0u8; PACKET_BUFLEN + 1];
    let (n, from) = match net.socket.recv_from(&mut buf) {
        Ok(v) => v,
        Err(e) if would_block(&e) => return Ok(IoOutcome::Progress),
        Err(e) => return Err(e.into()),
    };

    if n == 0 {
        return Ok(IoOutcome::Progress);
    }
    if from.ip() != ctx.peer().ip() {
        tracing::trace!(session = ctx.id(), from = %from, "ignoring datagram from foreign address");
        return Ok(IoOutcome::Progress);
    }
    if !ctx.network_in.is_empty() {
        tracing::debug!(session = ctx.id(), "discarding unread datagram");
        ctx.network_in.clear();
    }
    if n > ctx.network_in.capacity() {
        return Err(Error::Internal("datagram larger than receive buffer"));
    }
    ctx.network_in.write(&buf[..n])?;
    crate::debug::dump_hex("recv", ctx.id(), &buf[..n]);
    Ok(IoOutcome::Progress)
}

/// Send exactly one queued datagram to the peer.
pub(crate) fn send(ctx: &mut SessionContext) -> Result<IoOutcome> {
    let peer = ctx.peer();
    let net = ctx
        .network
        .as_ref()
        .ok_or(Error::Internal("session network not initialized"))?;
    let Some(datagram) = ctx.network_out.pop() else {
        return Ok(IoOutcome::Progress);
    };

    match net.socket.send_to(&datagram, peer) {
        Ok(n) if n == datagram.len() => {
            crate::debug::dump_hex("send", ctx.id(), &datagram);
            Ok(IoOutcome::Progress)
        }
        Ok(_) => Err(Error::Internal("short datagram send")),
        Err(e) if would_block(&e) => {
            ctx.network_out.requeue(datagram);
            Ok(IoOutcome::Progress)
        }
        Err(e) => Err(e.into()),
    }
}

/// Read one control byte from the async-signal pipe.
pub(crate) fn read_signal(ctx: &mut SessionContext) -> Result<IoOutcome> {
    let net = ctx
        .network
        .as_ref()
        .ok_or(Error::Internal("session network not initialized"))?;

    let mut code = [0u8; 1];
    match (&net.signal_rx).read(&mut code) {
        Ok(0) => Err(Error::Internal("async-signal pipe closed")),
        Ok(_) => {
            if code[0] == SIGNAL_GENERATE_BREAK {
                ctx.request_break();
            } else {
                tracing::warn!(session = ctx.id(), code = code[0], "unknown control code ignored");
            }
            Ok(IoOutcome::Progress)
        }
        Err(e) if would_block(&e) => Ok(IoOutcome::Progress),
        Err(e) => Err(e.into()),
    }
}

/// Read console input from the user stream.
pub(crate) fn read_console(ctx: &mut SessionContext) -> Result<IoOutcome> {
    let net = ctx
        .network
        .as_ref()
        .ok_or(Error::Internal("session network not initialized"))?;

    let mut buf = [0u8; PACKET_BUFLEN];
    let want = PACKET_BUFLEN.min(ctx.console_in.free());
    if want == 0 {
        return Ok(IoOutcome::Progress);
    }
    let n = match (&net.user).read(&mut buf[..want]) {
        Ok(n) => n,
        Err(e) if would_block(&e) => return Ok(IoOutcome::Progress),
        Err(e) => return Err(e.into()),
    };

    if n == 0 {
        tracing::debug!(session = ctx.id(), "user closed the console stream");
        ctx.close_with(ErrorCode::Success);
        return Ok(IoOutcome::Closed);
    }
    ctx.console_in.write(&buf[..n])?;
    Ok(IoOutcome::Progress)
}

/// Write buffered console output to the user stream.
pub(crate) fn write_console(ctx: &mut SessionContext) -> Result<IoOutcome> {
    let net = ctx
        .network
        .as_ref()
        .ok_or(Error::Internal("session network not initialized"))?;
    if ctx.console_out.is_empty() {
        return Ok(IoOutcome::Progress);
    }

    let n = match (&net.user).write(ctx.console_out.peek()) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!(session = ctx.id(), "user stream closed while writing");
            ctx.close_with(ErrorCode::Success);
            return Ok(IoOutcome::Closed);
        }
        Err(e) if would_block(&e) => return Ok(IoOutcome::Progress),
        Err(e) => return Err(e.into()),
    };
    ctx.console_out.consume(n);
    Ok(IoOutcome::Progress)
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, UdpSocket};

    use super::*;
    use crate::context::tests::config_for;
    use crate::context::SessionHandle;

    fn bmc_and_context() -> (UdpSocket, SessionContext, SessionHandle) {
        let bmc = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let target = bmc.local_addr().expect("addr");
        let mut ctx = SessionContext::create(config_for(target)).expect("create");
        let handle = ctx.initialize_network().expect("init");
        (bmc, ctx, handle)
    }

    fn context_addr(ctx: &SessionContext) -> SocketAddr {
        let port = ctx
            .network
            .as_ref()
            .expect("network")
            .socket
            .local_addr()
            .expect("addr")
            .port();
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn wait_readable(ctx: &SessionContext) {
        let mut set = PollSet::with_capacity(1);
        let net = ctx.network.as_ref().expect("network");
        set.push(net.socket_fd(), Interest::READ);
        set.wait(Duration::from_secs(5)).expect("poll");
    }

    #[test]
    fn failed_poll_is_contained() {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        #[allow(unsafe_code)]
        // SAFETY: `limit` is a valid, writable `rlimit` for the whole call.
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
        assert_eq!(rc, 0);
        if limit.rlim_cur == libc::RLIM_INFINITY || limit.rlim_cur > 1 << 22 {
            return;
        }

        // More descriptors than the open-file limit makes poll(2) fail with EINVAL.
        let mut set = PollSet::with_capacity(limit.rlim_cur as usize + 1);
        for _ in 0..=limit.rlim_cur {
            set.push(-1, Interest::NONE);
        }
        assert!(!wait_ready(&mut set, Duration::from_millis(10), 0));

        let mut set = PollSet::with_capacity(1);
        set.push(-1, Interest::NONE);
        assert!(wait_ready(&mut set, Duration::from_millis(10), 0));
    }

    #[test]
    fn newer_datagram_replaces_unread_one() {
        let (bmc, mut ctx, _handle) = bmc_and_context();
        let to = context_addr(&ctx);

        bmc.send_to(b"first", to).expect("send");
        wait_readable(&ctx);
        receive(&mut ctx).expect("receive");
        bmc.send_to(b"second", to).expect("send");
        wait_readable(&ctx);
        receive(&mut ctx).expect("receive");

        assert_eq!(ctx.take_datagram(), Some(b"second".to_vec()));
        assert_eq!(ctx.take_datagram(), None);
    }

    #[test]
    fn datagrams_from_other_hosts_are_ignored() {
        let (_bmc, mut ctx, _handle) = bmc_and_context();
        let to = context_addr(&ctx);

        let Ok(stranger) = UdpSocket::bind("127.0.0.2:0") else {
            return;
        };
        stranger.send_to(b"spoof", to).expect("send");
        wait_readable(&ctx);
        receive(&mut ctx).expect("receive");
        assert_eq!(ctx.take_datagram(), None);
    }

    #[test]
    fn send_delivers_one_datagram_per_call() {
        let (bmc, mut ctx, _handle) = bmc_and_context();
        ctx.outbound().push(b"one".to_vec()).expect("queue");
        ctx.outbound().push(b"two".to_vec()).expect("queue");

        send(&mut ctx).expect("send");
        assert_eq!(ctx.outbound().len(), 1);

        bmc.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");
        let mut buf = [0u8; 16];
        let (n, _) = bmc.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], b"one");
    }

    #[test]
    fn two_break_signals_make_one_request() {
        let (_bmc, mut ctx, handle) = bmc_and_context();
        ctx.console_input().write(b"ab").expect("write");
        handle.generate_break().expect("break");
        handle.generate_break().expect("break");

        read_signal(&mut ctx).expect("signal");
        ctx.console_input().write(b"cd").expect("write");
        read_signal(&mut ctx).expect("signal");
        assert_eq!(ctx.break_requested(), Some(2));
    }

    #[test]
    fn user_eof_closes_with_success() {
        let (_bmc, mut ctx, mut handle) = bmc_and_context();
        handle.close().expect("close");

        assert_eq!(read_console(&mut ctx).expect("read"), IoOutcome::Closed);
        assert!(ctx.is_closing());
        assert_eq!(ctx.error_code(), Some(ErrorCode::Success));
    }

    #[test]
    fn console_bytes_flow_both_ways() {
        let (_bmc, mut ctx, handle) = bmc_and_context();
        let mut stream = handle.stream().expect("stream");
        stream.write_all(b"ls\n").expect("write");
        assert_eq!(read_console(&mut ctx).expect("read"), IoOutcome::Progress);
        assert_eq!(ctx.console_input().peek(), b"ls\n");

        ctx.console_output().write(b"ok").expect("buffer");
        write_console(&mut ctx).expect("write");
        assert!(ctx.console_output().is_empty());
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn closing_context_polls_placeholder_instead_of_user_stream() {
        let (_bmc, mut ctx, _handle) = bmc_and_context();
        ctx.console_output().write(b"pending").expect("buffer");
        ctx.mark_close_requested();

        let contexts = vec![ctx];
        let (set, slots) = build_poll_set(&contexts);
        let slots = slots[0].expect("slots");
        assert!(slots.closing);
        assert_eq!(set.len(), 3);
        assert_eq!(set.fd(slots.user), set.fd(slots.signal));
        assert_eq!(set.interest(slots.user), Interest::NONE);
        assert_eq!(set.interest(slots.signal), Interest::READ);
    }
}
