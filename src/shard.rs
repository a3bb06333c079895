//! A shard: the contexts owned by one worker, plus its wake-up pipe.

use std::io::{self, PipeReader, PipeWriter, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Mutex, MutexGuard};

use crate::context::SessionContext;
use crate::error::{Error, Result};

/// Contexts guarded by the shard lock.
#[derive(Debug, Default)]
pub(crate) struct Members {
    pub(crate) contexts: Vec<SessionContext>,
}

impl Members {
    /// Append a context, returning the new member count.
    pub(crate) fn append(&mut self, ctx: SessionContext) -> usize {
        self.contexts.push(ctx);
        self.contexts.len()
    }

    /// Mark every current member closing. Idempotent.
    pub(crate) fn teardown_initiate(&mut self) {
        for ctx in &mut self.contexts {
            ctx.mark_close_requested();
        }
    }
}

#[derive(Debug)]
pub(crate) struct Shard {
    index: usize,
    members: Mutex<Members>,
    notify_rx: PipeReader,
    notify_tx: PipeWriter,
}

impl Shard {
    pub(crate) fn new(index: usize) -> Result<Self> {
        let (notify_rx, notify_tx) = io::pipe().map_err(Error::from_resource)?;
        Ok(Self {
            index,
            members: Mutex::new(Members::default()),
            notify_rx,
            notify_tx,
        })
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Members>> {
        self.members
            .lock()
            .map_err(|_| Error::Internal("shard lock poisoned"))
    }

    pub(crate) fn notifier_fd(&self) -> RawFd {
        self.notify_rx.as_raw_fd()
    }

    /// Wake the worker out of its readiness wait.
    pub(crate) fn notify(&self) -> Result<()> {
        (&self.notify_tx).write_all(&[0x00])?;
        Ok(())
    }

    /// Consume pending wake-ups. Only call when the notifier is readable.
    pub(crate) fn drain_notifier(&self) -> Result<()> {
        let mut buf = [0u8; 64];
        match (&self.notify_rx).read(&mut buf) {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::local_config;

    #[test]
    fn append_counts_and_teardown_marks_members() {
        let shard = Shard::new(0).expect("shard");
        let mut members = shard.lock().expect("lock");
        let a = SessionContext::create(local_config()).expect("create");
        let b = SessionContext::create(local_config()).expect("create");
        assert_eq!(members.append(a), 1);
        assert_eq!(members.append(b), 2);

        members.teardown_initiate();
        members.teardown_initiate();
        assert!(members.contexts.iter().all(SessionContext::is_closing));
    }

    #[test]
    fn notifier_round_trip() {
        let shard = Shard::new(3).expect("shard");
        assert_eq!(shard.index(), 3);
        shard.notify().expect("notify");
        shard.notify().expect("notify");
        shard.drain_notifier().expect("drain");
    }
}
