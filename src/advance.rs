use std::time::Duration;

use crate::context::SessionContext;

/// Result of one protocol pass over a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    /// Contexts still in the shard after pruning.
    pub active: usize,
    /// Longest the worker may wait before the next pass.
    pub timeout: Duration,
}

/// Steps every context's protocol state machine.
///
/// Called by a worker with its shard lock held, once per tick. Implementations
/// must not block. They consume inbound datagrams and console input, queue
/// outbound datagrams and console output, and remove contexts whose protocol
/// has finished (dropping a context releases all of its resources).
pub trait ProtocolAdvancer: Send + Sync {
    /// Advance every context and prune the finished ones.
    fn advance(&self, contexts: &mut Vec<SessionContext>) -> Advance;
}
