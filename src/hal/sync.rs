use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::loom::{
    ErrorClass,
    layout::{IndexFn, Layout, Shape},
    view::Symbol,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Cannot signal non-scalar semaphore {0} of shape {1}, address one slot with `at`")]
    NonScalar(Symbol, Shape),
    #[error("semaphore kind error: semaphore {0} is {1}, expected {2}")]
    Kind(Symbol, SemaphoreKind, SemaphoreKind),
    #[error("semaphore index error: index {1:?} is out of range for semaphore array of shape {0}")]
    Index(Shape, Vec<usize>),
    #[error("semaphore index error: semaphore {0} is already scalar")]
    Scalar(Symbol),
    #[error("semaphore amount error: signalling {1} exceeds the capacity of semaphore {0}")]
    Amount(Symbol, u32),
    #[error("barrier arrival error: barrier {0} expects a positive arrival count")]
    Arrival(Symbol),
    #[error("synchronization error: {0} has been closed")]
    Closed(Symbol),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Closed(_) => ErrorClass::Runtime,
            _ => ErrorClass::Resource,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SemaphoreKind {
    /// Signalled and waited explicitly by kernels.
    #[display("regular")]
    Regular,
    /// Signalled by the DMA engine on transfer completion, waited through copy descriptors.
    #[display("dma")]
    Dma,
}

/// One counting slot.
#[derive(Debug)]
pub(crate) struct Cell {
    permits: tokio::sync::Semaphore,
    /// Transfers that will signal this slot.
    issued: AtomicUsize,
    /// Transfer completions consumed by waits.
    consumed: AtomicUsize,
}

impl Cell {
    fn new() -> Self {
        Self {
            permits: tokio::sync::Semaphore::new(0),
            issued: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
        }
    }

    fn is_drained(&self) -> bool {
        self.permits.available_permits() == 0
            && self.issued.load(Ordering::Acquire) == self.consumed.load(Ordering::Acquire)
    }
}

/// A counting semaphore, or an array of them.
///
/// Handles are cheap to clone and share their counters. An array handle must be narrowed to one
/// slot with [`Semaphore::at`] before it can be signalled, waited or used as a copy completion.
#[derive(Debug, Clone)]
pub struct Semaphore {
    symbol: Symbol,
    kind: SemaphoreKind,
    shape: Option<Shape>,
    cells: Arc<[Cell]>,
    slot: Option<usize>,
}

impl Semaphore {
    pub(crate) fn new(symbol: Symbol, kind: SemaphoreKind, shape: Option<Shape>) -> Self {
        let len = shape.as_ref().map_or(1, Shape::size);
        let cells = (0..len).map(|_| Cell::new()).collect();
        Self {
            symbol,
            kind,
            shape,
            cells,
            slot: None,
        }
    }

    #[inline]
    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    #[inline]
    pub fn kind(&self) -> SemaphoreKind {
        self.kind
    }

    /// Shape of the array, or `None` for a scalar semaphore.
    #[inline]
    pub fn shape(&self) -> Option<&Shape> {
        self.shape.as_ref()
    }

    #[inline]
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    /// Returns `true` if the handle addresses exactly one counter.
    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.shape.is_none() || self.slot.is_some()
    }

    /// Addresses one slot of a semaphore array.
    pub fn at(&self, index: &[usize]) -> Result<Self, SyncError> {
        let shape = match (&self.shape, self.slot) {
            (Some(shape), None) => shape,
            _ => return Err(SyncError::Scalar(self.symbol)),
        };
        let valid = index.len() == shape.len() && index.iter().zip(shape.iter()).all(|(x, n)| x < n);
        if !valid {
            return Err(SyncError::Index(shape.clone(), index.to_vec()));
        }
        let slot = Some(Layout::from_shape(shape.clone()).value(index));
        Ok(Self {
            slot,
            ..self.clone()
        })
    }

    /// Points this handle's slot at the counters of `other`, the same symbol on another device.
    pub(crate) fn rebind(&self, other: &Semaphore) -> Self {
        Self {
            cells: other.cells.clone(),
            ..self.clone()
        }
    }

    pub(crate) fn check_kind(&self, kind: SemaphoreKind) -> Result<(), SyncError> {
        match self.kind {
            x if x == kind => Ok(()),
            x => Err(SyncError::Kind(self.symbol, x, kind)),
        }
    }

    fn cell(&self) -> Result<&Cell, SyncError> {
        match (&self.shape, self.slot) {
            (None, _) => Ok(&self.cells[0]),
            (Some(_), Some(slot)) => Ok(&self.cells[slot]),
            (Some(shape), None) => Err(SyncError::NonScalar(self.symbol, shape.clone())),
        }
    }

    /// Current count of the addressed slot.
    pub fn value(&self) -> Result<usize, SyncError> {
        Ok(self.cell()?.permits.available_permits())
    }

    /// Returns `true` if no slot holds a count and every issued transfer has been waited.
    pub fn is_drained(&self) -> bool {
        self.cells.iter().all(Cell::is_drained)
    }

    /// Sum of counts over all slots.
    pub fn outstanding(&self) -> usize {
        self.cells
            .iter()
            .map(|cell| cell.permits.available_permits())
            .sum()
    }

    pub(crate) fn signal(&self, amount: u32) -> Result<(), SyncError> {
        let cell = self.cell()?;
        let amount = amount as usize;
        if cell.permits.available_permits() + amount > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(SyncError::Amount(self.symbol, amount as u32));
        }
        cell.permits.add_permits(amount);
        Ok(())
    }

    pub(crate) async fn wait(&self, amount: u32) -> Result<(), SyncError> {
        let cell = self.cell()?;
        let permits = cell
            .permits
            .acquire_many(amount)
            .await
            .map_err(|_| SyncError::Closed(self.symbol))?;
        permits.forget();
        Ok(())
    }

    /// Records a transfer that will signal the addressed slot once.
    pub(crate) fn issue(&self) -> Result<(), SyncError> {
        self.check_kind(SemaphoreKind::Dma)?;
        self.cell()?.issued.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Forgets a transfer recorded by [`Semaphore::issue`] that was never submitted.
    pub(crate) fn revoke(&self) {
        if let Ok(cell) = self.cell() {
            cell.issued.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Waits for one transfer completion on the addressed slot.
    pub(crate) async fn wait_transfer(&self) -> Result<(), SyncError> {
        self.check_kind(SemaphoreKind::Dma)?;
        self.wait(1).await?;
        self.cell()?.consumed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[derive(Debug)]
struct BarrierState {
    count: usize,
    arrivals: Mutex<usize>,
    phase: watch::Sender<u64>,
}

/// A phase barrier that completes once a fixed number of arrivals have been observed.
///
/// Phases alternate parity. Each handle tracks the parity it expects next, so a loop of
/// `arrive` and `wait` on the same handle steps through consecutive phases.
#[derive(Debug, Clone)]
pub struct Barrier {
    symbol: Symbol,
    state: Arc<BarrierState>,
    parity: bool,
}

impl Barrier {
    pub(crate) fn new(symbol: Symbol, count: usize) -> Result<Self, SyncError> {
        if count == 0 {
            return Err(SyncError::Arrival(symbol));
        }
        let (phase, _) = watch::channel(0);
        let arrivals = Mutex::new(0);
        let state = Arc::new(BarrierState {
            count,
            arrivals,
            phase,
        });
        Ok(Self {
            symbol,
            state,
            parity: false,
        })
    }

    #[inline]
    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    /// Number of arrivals that complete one phase.
    #[inline]
    pub fn count(&self) -> usize {
        self.state.count
    }

    /// Number of completed phases.
    #[inline]
    pub fn phase(&self) -> u64 {
        *self.state.phase.borrow()
    }

    pub fn arrive(&self) {
        let mut arrivals = self
            .state
            .arrivals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *arrivals += 1;
        if *arrivals == self.state.count {
            *arrivals = 0;
            self.state.phase.send_modify(|phase| *phase += 1);
        }
    }

    /// Waits for the phase of the given parity to complete.
    pub async fn wait_parity(&self, parity: bool) -> Result<(), SyncError> {
        let mut receiver = self.state.phase.subscribe();
        receiver
            .wait_for(|&phase| (phase % 2 == 1) != parity)
            .await
            .map_err(|_| SyncError::Closed(self.symbol))?;
        Ok(())
    }

    /// Waits for the phase this handle expects, then flips its parity.
    pub async fn wait(&mut self) -> Result<(), SyncError> {
        self.wait_parity(self.parity).await?;
        self.parity = !self.parity;
        Ok(())
    }

    /// Returns `true` if no arrivals of an incomplete phase are pending.
    pub fn is_drained(&self) -> bool {
        let arrivals = self
            .state
            .arrivals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *arrivals == 0
    }
}

/// What an asynchronous copy signals when it lands.
#[derive(Debug, Clone)]
pub enum Completion {
    Semaphore(Semaphore),
    Barrier(Barrier),
}

impl From<Semaphore> for Completion {
    fn from(value: Semaphore) -> Self {
        Self::Semaphore(value)
    }
}

impl From<&Semaphore> for Completion {
    fn from(value: &Semaphore) -> Self {
        Self::Semaphore(value.clone())
    }
}

impl From<Barrier> for Completion {
    fn from(value: Barrier) -> Self {
        Self::Barrier(value)
    }
}

impl From<&Barrier> for Completion {
    fn from(value: &Barrier) -> Self {
        Self::Barrier(value.clone())
    }
}

impl Completion {
    /// Validates the completion and records the pending transfer.
    pub(crate) fn issue(&self) -> Result<(), SyncError> {
        match self {
            Completion::Semaphore(semaphore) => semaphore.issue(),
            Completion::Barrier(_) => Ok(()),
        }
    }

    /// Undoes [`Completion::issue`] for a transfer the engine never received.
    pub(crate) fn revoke(&self) {
        if let Completion::Semaphore(semaphore) = self {
            semaphore.revoke();
        }
    }

    /// Called by the engine once the transfer has landed.
    pub(crate) fn complete(&self) -> Result<(), SyncError> {
        match self {
            Completion::Semaphore(semaphore) => semaphore.signal(1),
            Completion::Barrier(barrier) => {
                barrier.arrive();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, time::Duration};

    use super::{Barrier, Semaphore, SemaphoreKind, SyncError};
    use crate::loom::{ErrorClass, view::Symbol};

    #[tokio::test]
    async fn test_semaphore_conservation() -> Result<(), Box<dyn Error>> {
        let semaphore = Semaphore::new(Symbol(1), SemaphoreKind::Regular, None);
        for amount in [2, 3, 1] {
            semaphore.signal(amount)?;
        }
        assert_eq!(semaphore.value()?, 6);

        semaphore.wait(4).await?;
        semaphore.wait(1).await?;
        semaphore.wait(1).await?;
        assert!(semaphore.is_drained());

        // one wait too many never completes
        let extra = tokio::time::timeout(Duration::from_millis(50), semaphore.wait(1)).await;
        assert!(extra.is_err());

        semaphore.signal(1)?;
        semaphore.wait(1).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_semaphore_array() -> Result<(), Box<dyn Error>> {
        let array = Semaphore::new(Symbol(2), SemaphoreKind::Regular, Some([2, 3].into()));
        assert!(!array.is_scalar());

        let err = array.signal(1).unwrap_err();
        assert!(matches!(err, SyncError::NonScalar(..)));
        assert_eq!(err.class(), ErrorClass::Resource);
        assert!(err.to_string().starts_with("Cannot signal non-scalar semaphore"));

        let slot = array.at(&[1, 2])?;
        assert_eq!(slot.slot(), Some(5));
        slot.signal(2)?;
        assert_eq!(slot.value()?, 2);
        assert_eq!(array.at(&[0, 0])?.value()?, 0);
        assert_eq!(array.outstanding(), 2);
        assert!(!array.is_drained());

        slot.wait(2).await?;
        assert!(array.is_drained());

        assert!(matches!(array.at(&[2, 0]), Err(SyncError::Index(..))));
        assert!(matches!(slot.at(&[0, 0]), Err(SyncError::Scalar(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_semaphore_transfer() -> Result<(), Box<dyn Error>> {
        let regular = Semaphore::new(Symbol(3), SemaphoreKind::Regular, None);
        assert!(matches!(regular.issue(), Err(SyncError::Kind(..))));

        let dma = Semaphore::new(Symbol(4), SemaphoreKind::Dma, None);
        dma.issue()?;
        assert!(!dma.is_drained());
        dma.signal(1)?;
        assert!(!dma.is_drained());
        dma.wait_transfer().await?;
        assert!(dma.is_drained());
        Ok(())
    }

    #[tokio::test]
    async fn test_barrier_parity() -> Result<(), Box<dyn Error>> {
        let mut barrier = Barrier::new(Symbol(5), 2)?;
        let other = barrier.clone();

        for phase in 0..4 {
            let pending =
                tokio::time::timeout(Duration::from_millis(20), barrier.wait_parity(phase % 2 == 1))
                    .await;
            assert!(pending.is_err());
            assert!(barrier.is_drained());

            barrier.arrive();
            assert!(!barrier.is_drained());
            other.arrive();
            barrier.wait().await?;
            assert_eq!(barrier.phase(), phase as u64 + 1);
        }

        // a completed phase of the other parity stays observable
        other.wait_parity(true).await?;
        assert!(Barrier::new(Symbol(6), 0).is_err());
        Ok(())
    }
}
