//! Write-queue databases
//!
//! The export server pushes every mirrored write into a queue database
//! addressed by a small integer index, and the inferencer reads from the
//! same index. Each session holds its own index for its whole lifetime so
//! two sessions never interleave writes.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{IntrospectionError, Result};
use crate::tools::{run_tool, ToolInvocation};

/// Fixed range of queue indexes
#[derive(Debug, Clone)]
pub struct QueueIndexPool {
    free: Arc<Mutex<BTreeSet<u32>>>,
}

/// One reserved queue index; released on drop
#[derive(Debug)]
pub struct QueueLease {
    index: u32,
    free: Arc<Mutex<BTreeSet<u32>>>,
}

impl QueueLease {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        if let Ok(mut free) = self.free.lock() {
            free.insert(self.index);
        }
    }
}

impl QueueIndexPool {
    /// Indexes `base..base + count`
    pub fn new(base: u32, count: u32) -> Self {
        Self {
            free: Arc::new(Mutex::new((base..base.saturating_add(count)).collect())),
        }
    }

    /// Take the lowest free index
    pub fn reserve(&self) -> Result<QueueLease> {
        let mut free = self
            .free
            .lock()
            .map_err(|_| IntrospectionError::ResourceExhausted("queue pool poisoned".into()))?;
        let index = free
            .iter()
            .next()
            .copied()
            .ok_or_else(|| IntrospectionError::ResourceExhausted("no free queue index".into()))?;
        free.remove(&index);

        Ok(QueueLease {
            index,
            free: Arc::clone(&self.free),
        })
    }

    pub fn available(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

/// Clears a queue database before a session starts using it
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn reset(&self, index: u32) -> Result<()>;
}

/// Resets a queue by running a configured command, `{db}` replaced by the index
///
/// An empty command makes `reset` a no-op.
#[derive(Debug, Clone)]
pub struct CommandQueueStore {
    argv: Vec<String>,
}

impl CommandQueueStore {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn invocation(&self, index: u32) -> Option<ToolInvocation> {
        let (program, args) = self.argv.split_first()?;
        let db = index.to_string();
        Some(
            args.iter()
                .fold(ToolInvocation::new(program), |inv, a| inv.arg(a.replace("{db}", &db))),
        )
    }
}

#[async_trait]
impl QueueStore for CommandQueueStore {
    async fn reset(&self, index: u32) -> Result<()> {
        match self.invocation(index) {
            Some(invocation) => {
                run_tool(&invocation, &CancellationToken::new()).await?;
                tracing::debug!(queue_index = index, "queue reset");
                Ok(())
            }
            None => Ok(()),
        }
    }
}
