//! Engine lifecycle: shard setup, worker threads, submission and teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::advance::ProtocolAdvancer;
use crate::config::{EngineConfig, SessionConfig};
use crate::context::{SessionContext, SessionHandle};
use crate::error::{Error, Result};
use crate::processing::SolAdvancer;
use crate::shard::Shard;

/// Worker bookkeeping guarded by the thread-count lock.
#[derive(Debug)]
pub(crate) struct Threads {
    /// `running[i]`: shard `i` has a live worker.
    running: Vec<bool>,
    /// Workers spawned so far; the next one serves this shard index.
    spawned: usize,
}

impl Threads {
    fn count(&self) -> usize {
        self.running.iter().filter(|r| **r).count()
    }
}

/// State shared by the engine and its workers for one setup/cleanup cycle.
pub(crate) struct Runtime {
    pub(crate) shards: Vec<Shard>,
    pub(crate) teardown: AtomicBool,
    pub(crate) teardown_immediate: AtomicBool,
    pub(crate) threads: Mutex<Threads>,
    pub(crate) advancer: Arc<dyn ProtocolAdvancer>,
    pub(crate) config: EngineConfig,
}

impl Runtime {
    fn lock_threads(&self) -> Result<MutexGuard<'_, Threads>> {
        self.threads
            .lock()
            .map_err(|_| Error::Internal("thread-count lock poisoned"))
    }

    pub(crate) fn worker_exited(&self, index: usize) {
        match self.threads.lock() {
            Ok(mut threads) => threads.running[index] = false,
            Err(poisoned) => {
                tracing::warn!(shard = index, "thread-count lock poisoned at worker exit");
                poisoned.into_inner().running[index] = false;
            }
        }
        crate::observe::worker_exited();
    }
}

/// The console session engine.
///
/// An explicit instance replaces process-wide state: build one, call
/// [`Engine::setup`] and [`Engine::thread_create`], then submit sessions.
/// Dropping a running engine tears it down immediately.
pub struct Engine {
    config: EngineConfig,
    advancer: Arc<dyn ProtocolAdvancer>,
    running: AtomicBool,
    /// Engine-setup lock; outermost in the lock hierarchy.
    setup: Mutex<Option<Arc<Runtime>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    /// An engine that establishes SOL sessions with [`SolAdvancer`].
    pub fn new(config: EngineConfig) -> Self {
        Self::with_advancer(config, Arc::new(SolAdvancer::new()))
    }

    /// An engine driven by a custom protocol advancer.
    pub fn with_advancer(config: EngineConfig, advancer: Arc<dyn ProtocolAdvancer>) -> Self {
        Self {
            config,
            advancer,
            running: AtomicBool::new(false),
            setup: Mutex::new(None),
        }
    }

    fn lock_setup(&self) -> MutexGuard<'_, Option<Arc<Runtime>>> {
        // The guarded value is only ever replaced whole.
        self.setup.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn runtime(&self) -> Result<Arc<Runtime>> {
        self.lock_setup().as_ref().map(Arc::clone).ok_or(Error::NotSetup)
    }

    /// Allocate `thread_count` shards. Workers are started separately.
    pub fn setup(&self, thread_count: usize) -> Result<()> {
        let mut setup = self.lock_setup();
        if self.running.load(Ordering::Acquire) {
            return Err(Error::AlreadySetup);
        }
        if thread_count == 0 || thread_count > self.config.max_threads {
            return Err(Error::InvalidArgument("thread count out of range"));
        }

        crate::crypto::init()?;

        // A failure part way through drops the shards built so far.
        let shards = (0..thread_count)
            .map(Shard::new)
            .collect::<Result<Vec<_>>>()?;

        *setup = Some(Arc::new(Runtime {
            shards,
            teardown: AtomicBool::new(false),
            teardown_immediate: AtomicBool::new(false),
            threads: Mutex::new(Threads {
                running: vec![false; thread_count],
                spawned: 0,
            }),
            advancer: Arc::clone(&self.advancer),
            config: self.config.clone(),
        }));
        self.running.store(true, Ordering::Release);
        tracing::debug!(shards = thread_count, "engine set up");
        Ok(())
    }

    /// Whether [`Engine::setup`] has run without a matching cleanup.
    pub fn is_setup(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of running worker threads.
    pub fn thread_count(&self) -> Result<usize> {
        let runtime = self.runtime()?;
        let threads = runtime.lock_threads()?;
        Ok(threads.count())
    }

    /// Start the worker for the next shard without one.
    pub fn thread_create(&self) -> Result<()> {
        let setup = self.lock_setup();
        let runtime = setup.as_ref().ok_or(Error::NotSetup)?;
        let mut threads = runtime.lock_threads()?;

        let index = threads.spawned;
        if index >= runtime.shards.len() {
            return Err(Error::ThreadLimit {
                max: runtime.shards.len(),
            });
        }

        let worker_runtime = Arc::clone(runtime);
        thread::Builder::new()
            .name(format!("{}-{index}", self.config.thread_name))
            .spawn(move || crate::worker::run(worker_runtime, index))
            .map_err(Error::from_resource)?;

        threads.spawned += 1;
        threads.running[index] = true;
        Ok(())
    }

    /// Hand a context to the least loaded running shard.
    ///
    /// On error the context is dropped: its resources are released and its
    /// handle observes the end of the session and the error's code.
    pub fn submit(&self, mut ctx: SessionContext) -> Result<()> {
        debug_assert!(!ctx.is_submitted());
        let runtime = match self.admission(&ctx) {
            Ok(runtime) => runtime,
            Err(err) => return reject(ctx, err),
        };
        let threads = match runtime.lock_threads() {
            Ok(threads) => threads,
            Err(err) => return reject(ctx, err),
        };

        let mut best: Option<(usize, usize)> = None;
        for (index, shard) in runtime.shards.iter().enumerate() {
            if !threads.running[index] {
                continue;
            }
            let count = match shard.lock() {
                Ok(members) => members.contexts.len(),
                Err(err) => return reject(ctx, err),
            };
            if best.is_none_or(|(_, min)| count < min) {
                best = Some((index, count));
            }
        }
        let Some((index, _)) = best else {
            return reject(ctx, Error::NotSetup);
        };

        let shard = &runtime.shards[index];
        let mut members = match shard.lock() {
            Ok(members) => members,
            Err(err) => return reject(ctx, err),
        };
        let id = ctx.id();
        ctx.mark_submitted();
        let count = members.append(ctx);
        if let Err(err) = shard.notify() {
            tracing::warn!(shard = index, error = %err, "failed to wake worker");
        }
        drop(members);
        drop(threads);

        tracing::debug!(session = id, shard = index, members = count, "session submitted");
        crate::observe::session_submitted();
        Ok(())
    }

    fn admission(&self, ctx: &SessionContext) -> Result<Arc<Runtime>> {
        if !ctx.is_initialized() {
            return Err(Error::InvalidArgument("session network not initialized"));
        }
        let runtime = self.runtime()?;
        if runtime.teardown.load(Ordering::Acquire) {
            return Err(Error::NotSetup);
        }
        Ok(runtime)
    }

    /// Create, initialize and submit a session in one call.
    pub fn open(&self, config: SessionConfig) -> Result<SessionHandle> {
        let mut ctx = SessionContext::create(config)?;
        let handle = ctx.initialize_network()?;
        self.submit(ctx)?;
        Ok(handle)
    }

    /// Member count of every shard with a running worker.
    pub fn shard_occupancy(&self) -> Result<Vec<usize>> {
        let runtime = self.runtime()?;
        let threads = runtime.lock_threads()?;
        let mut occupancy = Vec::new();
        for (index, shard) in runtime.shards.iter().enumerate() {
            if threads.running[index] {
                occupancy.push(shard.lock()?.contexts.len());
            }
        }
        Ok(occupancy)
    }

    /// Stop every worker and release every shard.
    ///
    /// A graceful cleanup lets each session close its protocol first; an
    /// immediate one drops them as they are. No-op when not set up.
    pub fn cleanup(&self, graceful: bool) {
        let mut setup = self.lock_setup();
        let Some(runtime) = setup.take() else {
            return;
        };

        runtime.teardown.store(true, Ordering::Release);
        if !graceful {
            runtime.teardown_immediate.store(true, Ordering::Release);
        }
        for shard in &runtime.shards {
            if let Err(err) = shard.notify() {
                tracing::warn!(shard = shard.index(), error = %err, "failed to wake worker");
            }
        }

        loop {
            let remaining = match runtime.threads.lock() {
                Ok(threads) => threads.count(),
                Err(poisoned) => poisoned.into_inner().count(),
            };
            if remaining == 0 {
                break;
            }
            thread::sleep(self.config.cleanup_poll);
        }

        for shard in &runtime.shards {
            match shard.lock() {
                Ok(mut members) => members.contexts.clear(),
                Err(err) => {
                    tracing::warn!(shard = shard.index(), error = %err, "dropping poisoned shard")
                }
            }
        }
        drop(runtime);

        self.running.store(false, Ordering::Release);
        tracing::debug!(graceful, "engine cleaned up");
    }
}

fn reject(mut ctx: SessionContext, err: Error) -> Result<()> {
    tracing::debug!(session = ctx.id(), error = %err, "session rejected");
    ctx.close_with(err.code());
    Err(err)
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_setup() {
            self.cleanup(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::local_config;
    use crate::error::ErrorCode;
    use crate::types::SessionStatus;

    #[test]
    fn setup_validates_thread_count() {
        let engine = Engine::default();
        assert!(matches!(engine.setup(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(engine.setup(33), Err(Error::InvalidArgument(_))));
        assert!(!engine.is_setup());

        engine.setup(1).expect("setup");
        assert!(matches!(engine.setup(1), Err(Error::AlreadySetup)));
        engine.cleanup(false);
        assert!(!engine.is_setup());
        engine.cleanup(false);
    }

    #[test]
    fn submit_without_workers_drops_the_context() {
        let engine = Engine::default();
        engine.setup(1).expect("setup");

        let mut ctx = SessionContext::create(local_config()).expect("create");
        let handle = ctx.initialize_network().expect("init");
        assert!(matches!(engine.submit(ctx), Err(Error::NotSetup)));
        assert_eq!(handle.status(), SessionStatus::Error);
        assert_eq!(handle.error_code(), Some(ErrorCode::InternalError));

        let ctx = SessionContext::create(local_config()).expect("create");
        assert!(matches!(engine.submit(ctx), Err(Error::InvalidArgument(_))));
    }
}
