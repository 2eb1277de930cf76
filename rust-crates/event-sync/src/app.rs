use crate::{
    Result,
    app::{
        ecs::{
            EcsStore,
            apply_update,
        },
        event_source::StreamService,
        state_storage::StateStorage,
        stream::StreamHandle,
        visibility::{
            ForegroundOutcome,
            VisibilityReconciler,
        },
    },
    events::{
        NetworkEvent,
        SystemCall,
    },
    snapshot::StateCache,
    transform::Decode,
};
use anyhow::Context;
use std::path::Path;
use tokio::sync::{
    broadcast,
    mpsc,
};
use tracing::{
    debug,
    info,
    warn,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub mod ecs;
pub mod event_source;
pub mod gapfill;
pub mod http_stream_service;
pub mod in_memory_state_storage;
pub mod json_rpc_log_source;
pub mod sled_storage;
pub mod state_storage;
pub mod stream;
pub mod visibility;

#[cfg(test)]
pub(crate) mod test_helpers;


pub const DEFAULT_CHECKPOINT_BLOCKS: u64 = 100;
const SYSTEM_CALL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Continue,
    Exit,
}

/// Applies stream batches to the local world state and checkpoints it.
pub struct App<S, D, E, St> {
    events: mpsc::Receiver<Vec<NetworkEvent>>,
    foreground: mpsc::Receiver<()>,
    stream: StreamHandle,
    reconciler: VisibilityReconciler<S, D>,
    ecs: E,
    cache: StateCache,
    storage: St,
    system_calls: broadcast::Sender<SystemCall>,
    checkpoint_blocks: u64,
    last_checkpoint_block: u64,
}

impl<S: StreamService, D: Decode, E: EcsStore, St: StateStorage> App<S, D, E, St> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: mpsc::Receiver<Vec<NetworkEvent>>,
        foreground: mpsc::Receiver<()>,
        stream: StreamHandle,
        reconciler: VisibilityReconciler<S, D>,
        ecs: E,
        cache: StateCache,
        storage: St,
        checkpoint_blocks: u64,
    ) -> Self {
        let (system_calls, _) = broadcast::channel(SYSTEM_CALL_CAPACITY);
        let last_checkpoint_block = cache.block_number;
        Self {
            events,
            foreground,
            stream,
            reconciler,
            ecs,
            cache,
            storage,
            system_calls,
            checkpoint_blocks: checkpoint_blocks.max(1),
            last_checkpoint_block,
        }
    }

    pub fn ecs(&self) -> &E {
        &self.ecs
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn subscribe_system_calls(&self) -> broadcast::Receiver<SystemCall> {
        self.system_calls.subscribe()
    }

    pub async fn run(&mut self, interrupt: impl Future<Output = ()>) -> Result<RunState> {
        tokio::select! {
            batch = self.events.recv() => match batch {
                Some(batch) => {
                    self.reconciler.observe(&batch);
                    self.apply_batch(batch)?;
                    Ok(RunState::Continue)
                }
                None => {
                    warn!("Event stream closed");
                    self.checkpoint()?;
                    Ok(RunState::Exit)
                }
            },
            Some(()) = self.foreground.recv() => {
                self.on_foreground().await?;
                Ok(RunState::Continue)
            }
            _ = interrupt => {
                self.stream.shutdown();
                self.checkpoint()?;
                Ok(RunState::Exit)
            }
        }
    }

    fn apply_batch(&mut self, batch: Vec<NetworkEvent>) -> Result<()> {
        for event in batch {
            match event {
                NetworkEvent::ComponentUpdate(update) => {
                    apply_update(&mut self.ecs, &update);
                    self.cache.store_event(&update);
                }
                NetworkEvent::SystemCall(call) => {
                    // No subscribers is fine.
                    let _ = self.system_calls.send(call);
                }
                NetworkEvent::Keepalive { block_number } => {
                    self.cache.set_block_number(block_number);
                }
            }
        }
        self.maybe_checkpoint()
    }

    async fn on_foreground(&mut self) -> Result<()> {
        match self.reconciler.on_foreground().await {
            ForegroundOutcome::Filled { events, latest_block } => {
                info!(recovered = events.len(), latest_block, "Applied foreground catch-up");
                for update in &events {
                    apply_update(&mut self.ecs, update);
                    self.cache.store_event(update);
                }
                self.cache.set_block_number(latest_block);
                self.maybe_checkpoint()
            }
            outcome => {
                debug!(?outcome, "Foreground check done");
                Ok(())
            }
        }
    }

    fn maybe_checkpoint(&mut self) -> Result<()> {
        if self.cache.block_number >= self.last_checkpoint_block + self.checkpoint_blocks {
            self.checkpoint()?;
        }
        Ok(())
    }

    pub fn checkpoint(&mut self) -> Result<()> {
        self.storage
            .to_store(&self.cache)
            .context("Failed to write state checkpoint")?;
        self.last_checkpoint_block = self.cache.block_number;
        info!(
            block_number = self.cache.block_number,
            values = self.cache.len(),
            "Checkpoint written"
        );
        Ok(())
    }
}

/// Logs to stdout, or to a daily rolling file under `log_dir`. The returned
/// guard must be held for the file writer to flush.
pub fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "syncd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            None
        }
    }
}
