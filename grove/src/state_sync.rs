//! The working state of an operation, shared between concurrently
//! evaluated vertices.

use grove_core::states::State;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A [`State`] behind a lock.
///
/// Mutations hold the write lock only while they run; provider calls happen
/// outside of it. [`SyncState::snapshot`] copies the whole state under the
/// read lock, so observers never see a half-applied mutation.
#[derive(Debug, Clone)]
pub struct SyncState {
    inner: Arc<RwLock<State>>,
}

impl SyncState {
    pub fn new(state: State) -> Self {
        SyncState {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let state = self.inner.read().await;
        f(&state)
    }

    pub async fn write<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.inner.write().await;
        f(&mut state)
    }

    pub async fn snapshot(&self) -> State {
        self.inner.read().await.clone()
    }
}
