//! Engine and session configuration.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::crypto::{SHA1_KEY_LEN, SecretBytes};
use crate::error::{Error, Result};
use crate::types::{CipherSuite, PrivilegeLevel};

/// Largest worker pool an engine accepts by default.
pub const DEFAULT_MAX_THREADS: usize = 32;

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(crate) max_threads: usize,
    pub(crate) spin_wait: Duration,
    pub(crate) cleanup_poll: Duration,
    pub(crate) thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            spin_wait: Duration::from_millis(250),
            cleanup_poll: Duration::from_millis(10),
            thread_name: "ipmiconsole-worker".to_string(),
        }
    }
}

impl EngineConfig {
    /// Create an [`EngineConfigBuilder`] starting from the defaults.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: EngineConfig::default(),
        }
    }

    /// Upper bound accepted by `Engine::setup`.
    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// How long an idle worker sleeps before checking its shard again.
    pub fn spin_wait(&self) -> Duration {
        self.spin_wait
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Set the largest worker pool `Engine::setup` accepts.
    pub fn max_threads(mut self, max: usize) -> Self {
        self.config.max_threads = max;
        self
    }

    /// Set how long a worker with no sessions sleeps between checks.
    pub fn spin_wait(mut self, wait: Duration) -> Self {
        self.config.spin_wait = wait;
        self
    }

    /// Set how often `Engine::cleanup` re-checks the running worker count.
    pub fn cleanup_poll(mut self, interval: Duration) -> Self {
        self.config.cleanup_poll = interval;
        self
    }

    /// Set the worker thread name prefix; the shard index is appended.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<EngineConfig> {
        let c = self.config;
        if c.max_threads == 0 {
            return Err(Error::InvalidArgument("max_threads must be at least 1"));
        }
        if c.spin_wait.is_zero() || c.cleanup_poll.is_zero() {
            return Err(Error::InvalidArgument("engine intervals must be non-zero"));
        }
        Ok(c)
    }
}

/// Per-session settings: who to connect to, how to authenticate, and the
/// protocol timers.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub(crate) target: SocketAddr,
    pub(crate) username: Vec<u8>,
    pub(crate) password: SecretBytes,
    pub(crate) bmc_key: Option<SecretBytes>,
    pub(crate) privilege_level: PrivilegeLevel,
    pub(crate) cipher_suite: CipherSuite,
    pub(crate) session_timeout: Duration,
    pub(crate) retransmission_timeout: Duration,
    pub(crate) retransmission_backoff_count: u32,
    pub(crate) max_retransmissions: u32,
    pub(crate) keepalive_interval: Duration,
    pub(crate) max_packet_errors: u32,
    pub(crate) deactivate_if_active: bool,
    pub(crate) deactivate_only: bool,
}

impl SessionConfig {
    /// Create a [`SessionConfigBuilder`] for the BMC at `target`.
    pub fn builder(target: SocketAddr) -> SessionConfigBuilder {
        SessionConfigBuilder::new(target)
    }

    /// Like [`SessionConfig::builder`], resolving `target` (for example
    /// `"bmc.example.net:623"`) to its first address.
    pub fn resolve(target: impl ToSocketAddrs) -> Result<SessionConfigBuilder> {
        let addr = target
            .to_socket_addrs()?
            .next()
            .ok_or(Error::InvalidArgument("target did not resolve to an address"))?;
        Ok(SessionConfigBuilder::new(addr))
    }

    /// The BMC address the session starts with.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Whether the session only deactivates an existing SOL payload.
    pub fn deactivate_only(&self) -> bool {
        self.deactivate_only
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug)]
pub struct SessionConfigBuilder {
    target: SocketAddr,
    username: Option<Vec<u8>>,
    password: Option<SecretBytes>,
    bmc_key: Option<SecretBytes>,
    privilege_level: PrivilegeLevel,
    cipher_suite: CipherSuite,
    session_timeout: Duration,
    retransmission_timeout: Duration,
    retransmission_backoff_count: u32,
    max_retransmissions: u32,
    keepalive_interval: Duration,
    max_packet_errors: u32,
    deactivate_if_active: bool,
    deactivate_only: bool,
}

impl SessionConfigBuilder {
    /// Create a new builder.
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            username: None,
            password: None,
            bmc_key: None,
            privilege_level: PrivilegeLevel::Administrator,
            cipher_suite: CipherSuite::default(),
            session_timeout: Duration::from_secs(60),
            retransmission_timeout: Duration::from_millis(500),
            retransmission_backoff_count: 2,
            max_retransmissions: 16,
            keepalive_interval: Duration::from_secs(20),
            max_packet_errors: 16,
            deactivate_if_active: false,
            deactivate_only: false,
        }
    }

    /// Set the username (bytes). An empty username selects the null user.
    pub fn username_bytes(mut self, username: impl Into<Vec<u8>>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the username (UTF-8 string).
    pub fn username(mut self, username: impl AsRef<str>) -> Self {
        self.username = Some(username.as_ref().as_bytes().to_vec());
        self
    }

    /// Set the password (bytes).
    pub fn password_bytes(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(SecretBytes::new(password.into()));
        self
    }

    /// Set the password (UTF-8 string).
    pub fn password(mut self, password: impl AsRef<str>) -> Self {
        self.password = Some(SecretBytes::new(password.as_ref().as_bytes().to_vec()));
        self
    }

    /// Set the optional BMC key (`Kg`) for "two-key" logins.
    ///
    /// If not set, the password key is used to derive the session integrity key.
    pub fn bmc_key_bytes(mut self, kg: impl Into<Vec<u8>>) -> Self {
        self.bmc_key = Some(SecretBytes::new(kg.into()));
        self
    }

    /// Set requested session privilege level.
    pub fn privilege_level(mut self, level: PrivilegeLevel) -> Self {
        self.privilege_level = level;
        self
    }

    /// Set the RMCP+ cipher suite.
    pub fn cipher_suite(mut self, suite: CipherSuite) -> Self {
        self.cipher_suite = suite;
        self
    }

    /// Give up on a BMC that has been silent this long.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Base retransmission timeout for unanswered requests.
    pub fn retransmission_timeout(mut self, timeout: Duration) -> Self {
        self.retransmission_timeout = timeout;
        self
    }

    /// Grow the retransmission timeout by one base step every `count` retries.
    pub fn retransmission_backoff_count(mut self, count: u32) -> Self {
        self.retransmission_backoff_count = count;
        self
    }

    /// Fail the session after this many retransmissions of one request.
    pub fn max_retransmissions(mut self, count: u32) -> Self {
        self.max_retransmissions = count;
        self
    }

    /// Interval between keepalive requests on an idle SOL session.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Fail the session after this many invalid packets.
    pub fn max_packet_errors(mut self, count: u32) -> Self {
        self.max_packet_errors = count;
        self
    }

    /// Deactivate a SOL payload that is already active, then activate ours.
    pub fn deactivate_if_active(mut self, enabled: bool) -> Self {
        self.deactivate_if_active = enabled;
        self
    }

    /// Only deactivate the active SOL payload, then close the session.
    pub fn deactivate_only(mut self, enabled: bool) -> Self {
        self.deactivate_only = enabled;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<SessionConfig> {
        let username = self
            .username
            .ok_or(Error::InvalidArgument("username is required"))?;
        let password = self
            .password
            .ok_or(Error::InvalidArgument("password is required"))?;

        if username.len() > 16 {
            return Err(Error::InvalidArgument("username longer than 16 bytes"));
        }
        if password.len() > SHA1_KEY_LEN {
            return Err(Error::InvalidArgument("password longer than 20 bytes"));
        }
        if self.bmc_key.as_ref().is_some_and(|k| k.len() > SHA1_KEY_LEN) {
            return Err(Error::InvalidArgument("k_g longer than 20 bytes"));
        }
        if self.retransmission_timeout.is_zero() || self.session_timeout.is_zero() {
            return Err(Error::InvalidArgument("timeouts must be non-zero"));
        }
        if self.retransmission_timeout >= self.session_timeout {
            return Err(Error::InvalidArgument(
                "retransmission timeout must be shorter than the session timeout",
            ));
        }
        if self.retransmission_backoff_count == 0 || self.keepalive_interval.is_zero() {
            return Err(Error::InvalidArgument(
                "backoff count and keepalive interval must be non-zero",
            ));
        }

        Ok(SessionConfig {
            target: self.target,
            username,
            password,
            bmc_key: self.bmc_key,
            privilege_level: self.privilege_level,
            cipher_suite: self.cipher_suite,
            session_timeout: self.session_timeout,
            retransmission_timeout: self.retransmission_timeout,
            retransmission_backoff_count: self.retransmission_backoff_count,
            max_retransmissions: self.max_retransmissions,
            keepalive_interval: self.keepalive_interval,
            max_packet_errors: self.max_packet_errors,
            deactivate_if_active: self.deactivate_if_active,
            deactivate_only: self.deactivate_only,
        })
    }
}
