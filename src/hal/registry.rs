use std::{
    pin::pin,
    sync::{PoisonError, RwLock},
};

use rustc_hash::FxHashMap as HashMap;
use tokio::sync::Notify;

use super::sync::Semaphore;
use crate::loom::view::{Buffer, Symbol};

/// Per-device table of live allocations, keyed by their symmetric [`Symbol`].
///
/// Remote operations name their target by symbol. Resolution waits until the target device has
/// allocated the symbol, which is how a peer that runs ahead meets a peer that lags behind.
#[derive(Debug, Default)]
pub struct Registry {
    buffers: RwLock<HashMap<Symbol, Buffer>>,
    semaphores: RwLock<HashMap<Symbol, Semaphore>>,
    notify: Notify,
}

impl Registry {
    pub fn insert_buffer(&self, buffer: Buffer) {
        let symbol = buffer.symbol();
        self.buffers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol, buffer);
        self.notify.notify_waiters();
    }

    pub fn insert_semaphore(&self, semaphore: Semaphore) {
        let symbol = semaphore.symbol();
        self.semaphores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol, semaphore);
        self.notify.notify_waiters();
    }

    /// Forgets a symbol. Handles already resolved stay valid.
    pub fn remove(&self, symbol: Symbol) {
        self.buffers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&symbol);
        self.semaphores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&symbol);
    }

    pub fn buffer(&self, symbol: Symbol) -> Option<Buffer> {
        self.buffers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&symbol)
            .cloned()
    }

    pub fn semaphore(&self, symbol: Symbol) -> Option<Semaphore> {
        self.semaphores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&symbol)
            .cloned()
    }

    async fn resolve<T>(&self, get: impl Fn(&Self) -> Option<T>) -> T {
        loop {
            // register interest before looking, so an insert in between is not missed
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(value) = get(self) {
                return value;
            }
            notified.await;
        }
    }

    pub async fn resolve_buffer(&self, symbol: Symbol) -> Buffer {
        self.resolve(|registry| registry.buffer(symbol)).await
    }

    pub async fn resolve_semaphore(&self, symbol: Symbol) -> Semaphore {
        self.resolve(|registry| registry.semaphore(symbol)).await
    }
}
