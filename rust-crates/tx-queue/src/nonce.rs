use crate::{
    Error,
    Result,
    signer::{
        Signer,
        SubmissionError,
    },
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{
    debug,
    warn,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NonceState {
    nonce: Option<u64>,
    connected: bool,
    fetching: bool,
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceSnapshot {
    pub nonce: u64,
}

/// Next safe nonce for one signer.
///
/// The cell is `None` while a reset is in flight; readers wait until it
/// resolves. Each reset bumps an epoch so a slow fetch overtaken by a newer
/// reset cannot publish its stale value.
pub struct NonceManager<S> {
    signer: Arc<S>,
    state: watch::Sender<NonceState>,
}

impl<S: Signer> NonceManager<S> {
    pub fn new(signer: Arc<S>) -> Self {
        let (state, _) = watch::channel(NonceState {
            nonce: None,
            connected: true,
            fetching: false,
            epoch: 0,
        });
        Self { signer, state }
    }

    pub fn current(&self) -> Option<u64> {
        self.state.borrow().nonce
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    pub async fn reset(&self) -> Result<u64, SubmissionError> {
        let epoch = self.begin_reset(|_| {});
        self.finish_reset(epoch).await
    }

    fn begin_reset(&self, also: impl FnOnce(&mut NonceState)) -> u64 {
        let mut epoch = 0;
        self.state.send_modify(|state| {
            also(state);
            state.nonce = None;
            state.fetching = true;
            state.epoch += 1;
            epoch = state.epoch;
        });
        epoch
    }

    async fn finish_reset(&self, epoch: u64) -> Result<u64, SubmissionError> {
        let mut guard = FetchGuard {
            state: &self.state,
            epoch,
            armed: true,
        };
        let fetched = self.signer.get_nonce().await;
        guard.armed = false;

        self.state.send_if_modified(|state| {
            if state.epoch != epoch {
                return false;
            }
            state.fetching = false;
            state.nonce = fetched.as_ref().ok().copied();
            true
        });

        match fetched {
            Ok(nonce) => {
                debug!(nonce, epoch, "nonce reset");
                Ok(nonce)
            }
            Err(err) => {
                warn!(%err, "failed to fetch nonce");
                Err(err)
            }
        }
    }

    pub fn increment(&self) {
        self.state.send_if_modified(|state| match state.nonce {
            Some(nonce) => {
                state.nonce = Some(nonce + 1);
                true
            }
            None => false,
        });
    }

    /// Waits for a known nonce on a live connection. Fetches it first when
    /// nobody has yet.
    pub async fn read(&self) -> Result<NonceSnapshot> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.connected {
                if let Some(nonce) = state.nonce {
                    return Ok(NonceSnapshot { nonce });
                }
                if !state.fetching {
                    self.reset().await?;
                    continue;
                }
            }
            rx.changed().await.map_err(|_| Error::NonceUnavailable)?;
        }
    }

    /// A transition to connected re-derives the nonce before any reader sees it.
    pub async fn set_connected(&self, connected: bool) -> Result<()> {
        if self.state.borrow().connected == connected {
            return Ok(());
        }
        if connected {
            let epoch = self.begin_reset(|state| state.connected = true);
            self.finish_reset(epoch).await?;
        } else {
            self.state.send_modify(|state| state.connected = false);
            debug!("signer disconnected");
        }
        Ok(())
    }
}

/// Releases an in-flight fetch whose future was dropped before it could
/// publish, so waiting readers start a fresh one.
struct FetchGuard<'a> {
    state: &'a watch::Sender<NonceState>,
    epoch: u64,
    armed: bool,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let epoch = self.epoch;
        let released = self.state.send_if_modified(|state| {
            if state.epoch != epoch {
                return false;
            }
            state.fetching = false;
            state.epoch += 1;
            true
        });
        if released {
            debug!(epoch, "nonce fetch abandoned");
        }
    }
}
