//! Per-session state and the application's handle on it.

use std::io::{self, PipeReader, PipeWriter, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::TryRngCore;
use rand::rngs::OsRng;

use crate::buffer::{ByteBuffer, DatagramQueue};
use crate::config::SessionConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::processing::ProtocolState;
use crate::types::SessionStatus;

/// Size of each console and network buffer.
pub const PACKET_BUFLEN: usize = 1024;

/// Outbound datagrams a context may have queued at once.
const MAX_QUEUED_DATAGRAMS: usize = 16;

/// Control byte on the async-signal pipe: send a serial break.
pub(crate) const SIGNAL_GENERATE_BREAK: u8 = 0x01;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Lifecycle {
    status: SessionStatus,
    code: Option<ErrorCode>,
}

/// Status shared between a context and its handle.
#[derive(Debug)]
pub(crate) struct Shared {
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle {
                status: SessionStatus::NotSubmitted,
                code: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        // Lifecycle is two plain values; a poisoned guard is still coherent.
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, status: SessionStatus, code: Option<ErrorCode>) {
        let mut lifecycle = self.lock();
        if lifecycle.status.is_terminal() {
            return;
        }
        lifecycle.status = status;
        if code.is_some() {
            lifecycle.code = code;
        }
        drop(lifecycle);
        self.changed.notify_all();
    }

    fn wait_until<F>(&self, timeout: Duration, mut done: F) -> Option<(SessionStatus, Option<ErrorCode>)>
    where
        F: FnMut(SessionStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut lifecycle = self.lock();
        loop {
            if done(lifecycle.status) {
                return Some((lifecycle.status, lifecycle.code));
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            lifecycle = self
                .changed
                .wait_timeout(lifecycle, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Per-session random values drawn from the OS CSPRNG.
pub(crate) struct SessionRandoms {
    /// Never zero.
    pub(crate) remote_console_session_id: u32,
    pub(crate) message_tag: u8,
    /// Reduced to 6 bits.
    pub(crate) rq_seq: u8,
    pub(crate) console_random: [u8; 16],
}

impl SessionRandoms {
    pub(crate) fn draw() -> Result<Self> {
        let mut rng = OsRng;
        let mut fill = |buf: &mut [u8]| rng.try_fill_bytes(buf).map_err(|_| Error::Random);

        let mut remote_console_session_id = 0u32;
        while remote_console_session_id == 0 {
            let mut b = [0u8; 4];
            fill(&mut b)?;
            remote_console_session_id = u32::from_le_bytes(b);
        }
        let mut b = [0u8; 2];
        fill(&mut b)?;
        let mut console_random = [0u8; 16];
        fill(&mut console_random)?;

        Ok(Self {
            remote_console_session_id,
            message_tag: b[0],
            rq_seq: b[1] % 64,
            console_random,
        })
    }
}

/// Descriptors owned by an initialized context.
#[derive(Debug)]
pub(crate) struct Network {
    pub(crate) socket: UdpSocket,
    /// Engine end of the user stream.
    pub(crate) user: UnixStream,
    pub(crate) signal_rx: PipeReader,
    /// Retained so the read end never reports hang-up while the context lives.
    _signal_tx: PipeWriter,
}

impl Network {
    pub(crate) fn socket_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub(crate) fn user_fd(&self) -> RawFd {
        self.user.as_raw_fd()
    }

    pub(crate) fn signal_fd(&self) -> RawFd {
        self.signal_rx.as_raw_fd()
    }
}

/// One console session, from creation until the engine drops it.
///
/// Built with [`SessionContext::create`], wired up with
/// [`SessionContext::initialize_network`] and handed to the engine with
/// `Engine::submit`. From then on only the owning worker touches it.
#[derive(Debug)]
pub struct SessionContext {
    id: u64,
    pub(crate) config: SessionConfig,
    peer: SocketAddr,
    pub(crate) network: Option<Network>,
    pub(crate) network_in: ByteBuffer,
    pub(crate) network_out: DatagramQueue,
    pub(crate) console_in: ByteBuffer,
    pub(crate) console_out: ByteBuffer,
    pub(crate) protocol: ProtocolState,
    close_requested: bool,
    break_requested: Option<usize>,
    error_code: Option<ErrorCode>,
    deactivated: bool,
    submitted: bool,
    cleaned_up: bool,
    shared: Arc<Shared>,
}

impl SessionContext {
    /// Allocate a context and draw its session randoms from the OS.
    ///
    /// No descriptors are opened yet.
    pub fn create(config: SessionConfig) -> Result<Self> {
        let randoms = SessionRandoms::draw()?;

        let peer = config.target;
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let protocol = ProtocolState::new(
            randoms.remote_console_session_id,
            randoms.message_tag,
            randoms.rq_seq,
            randoms.console_random,
        );

        tracing::debug!(session = id, peer = %peer, "session context created");
        Ok(Self {
            id,
            config,
            peer,
            network: None,
            network_in: ByteBuffer::with_capacity(PACKET_BUFLEN),
            network_out: DatagramQueue::new(MAX_QUEUED_DATAGRAMS),
            console_in: ByteBuffer::with_capacity(PACKET_BUFLEN),
            console_out: ByteBuffer::with_capacity(PACKET_BUFLEN),
            protocol,
            close_requested: false,
            break_requested: None,
            error_code: None,
            deactivated: false,
            submitted: false,
            cleaned_up: false,
            shared: Arc::new(Shared::new()),
        })
    }

    /// Open the UDP socket, the user stream pair and the async-signal pipe.
    ///
    /// Returns the application's handle. Every descriptor is close-on-exec.
    pub fn initialize_network(&mut self) -> Result<SessionHandle> {
        if self.network.is_some() {
            return Err(Error::InvalidArgument("network already initialized"));
        }

        let bind: SocketAddr = match self.peer {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).map_err(Error::from_resource)?;
        socket.set_nonblocking(true)?;

        let (engine_end, user_end) = UnixStream::pair().map_err(Error::from_resource)?;
        engine_end.set_nonblocking(true)?;

        let (signal_rx, signal_tx) = io::pipe().map_err(Error::from_resource)?;
        let handle_tx = signal_tx.try_clone().map_err(Error::from_resource)?;

        self.network = Some(Network {
            socket,
            user: engine_end,
            signal_rx,
            _signal_tx: signal_tx,
        });

        Ok(SessionHandle {
            id: self.id,
            stream: Some(user_end),
            signal: handle_tx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Identity tag, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current BMC address; the port may change after payload activation.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn set_peer_port(&mut self, port: u16) {
        self.peer.set_port(port);
    }

    /// Whether the network descriptors exist.
    pub fn is_initialized(&self) -> bool {
        self.network.is_some()
    }

    /// Whether the session is shutting down.
    pub fn is_closing(&self) -> bool {
        self.close_requested
    }

    /// Ask the protocol to shut the session down. Idempotent.
    pub fn mark_close_requested(&mut self) {
        self.close_requested = true;
    }

    /// Record `code` as the final disposition (first one wins) and close.
    pub fn close_with(&mut self, code: ErrorCode) {
        if self.error_code.is_none() {
            self.error_code = Some(code);
        }
        self.mark_close_requested();
    }

    /// Final disposition recorded so far.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error_code
    }

    /// Tell the application the console is up.
    pub fn mark_established(&mut self) {
        self.shared.publish(SessionStatus::Established, None);
    }

    pub(crate) fn mark_deactivated(&mut self) {
        self.deactivated = true;
    }

    /// Bytes read from the user, waiting to go to the BMC.
    pub fn console_input(&mut self) -> &mut ByteBuffer {
        &mut self.console_in
    }

    /// Bytes from the BMC, waiting to be written to the user.
    pub fn console_output(&mut self) -> &mut ByteBuffer {
        &mut self.console_out
    }

    /// Datagrams waiting to be sent to the peer.
    pub fn outbound(&mut self) -> &mut DatagramQueue {
        &mut self.network_out
    }

    /// Take the most recent unconsumed datagram, if any.
    pub fn take_datagram(&mut self) -> Option<Vec<u8>> {
        if self.network_in.is_empty() {
            return None;
        }
        let len = self.network_in.len();
        Some(self.network_in.take(len))
    }

    /// Console input length recorded when a serial break was first requested.
    pub fn break_requested(&self) -> Option<usize> {
        self.break_requested
    }

    /// Forget a serviced break request.
    pub fn clear_break_request(&mut self) {
        self.break_requested = None;
    }

    /// Account for `n` pre-break bytes having been sent.
    pub(crate) fn break_bytes_sent(&mut self, n: usize) {
        if let Some(pending) = self.break_requested.as_mut() {
            *pending = pending.saturating_sub(n);
        }
    }

    pub(crate) fn request_break(&mut self) {
        if self.break_requested.is_none() {
            self.break_requested = Some(self.console_in.len());
        }
    }

    pub(crate) fn is_submitted(&self) -> bool {
        self.submitted
    }

    pub(crate) fn mark_submitted(&mut self) {
        debug_assert!(!self.submitted, "context submitted twice");
        self.submitted = true;
        self.shared.publish(SessionStatus::Submitted, None);
    }

    /// Release every resource. Safe to call more than once.
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        let code = self.error_code.unwrap_or(ErrorCode::Success);
        let status = if !code.is_success() {
            SessionStatus::Error
        } else if self.deactivated {
            SessionStatus::Deactivated
        } else {
            SessionStatus::Stopped
        };
        // Publish before the user stream closes so EOF implies a final code.
        self.shared.publish(status, Some(code));

        self.network = None;
        self.network_in.clear();
        self.network_out.clear();
        self.console_in.clear();
        self.console_out.clear();
        self.protocol.wipe();

        tracing::debug!(session = self.id, code = %code, "session context cleaned up");
        crate::observe::session_closed(code);
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// The application's side of a session.
///
/// Console bytes flow over [`SessionHandle::stream`]. Closing or shutting
/// down the stream ends the session.
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    stream: Option<UnixStream>,
    signal: PipeWriter,
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Identity tag of the session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The user end of the console stream, unless it was taken.
    pub fn stream(&self) -> Option<&UnixStream> {
        self.stream.as_ref()
    }

    /// Take ownership of the console stream; the caller now closes it.
    pub fn take_stream(&mut self) -> Option<UnixStream> {
        self.stream.take()
    }

    /// End the session as if the user closed the console.
    pub fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            match stream.shutdown(std::net::Shutdown::Both) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Ask the engine to send a serial break to the BMC.
    pub fn generate_break(&self) -> Result<()> {
        if self.status().is_terminal() {
            return Err(Error::Session(self.error_code().unwrap_or(ErrorCode::Success)));
        }
        (&self.signal).write_all(&[SIGNAL_GENERATE_BREAK])?;
        Ok(())
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.shared.lock().status
    }

    /// Final disposition, once the session has ended.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.shared.lock().code
    }

    /// Block until SOL is established, or the session fails.
    pub fn wait_established(&self, timeout: Duration) -> Result<()> {
        let outcome = self.shared.wait_until(timeout, |s| {
            s == SessionStatus::Established || s.is_terminal()
        });
        match outcome {
            None => Err(Error::Timeout),
            Some((SessionStatus::Established | SessionStatus::Deactivated, _)) => Ok(()),
            Some((_, code)) => Err(Error::Session(code.unwrap_or(ErrorCode::Success))),
        }
    }

    /// Block until the session has ended. Returns false on timeout.
    pub fn wait_exited(&self, timeout: Duration) -> bool {
        self.shared
            .wait_until(timeout, SessionStatus::is_terminal)
            .is_some()
    }
}
