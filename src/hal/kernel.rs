use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use super::{
    copy::{self, AsyncCopy, CopyOptions, CopyPlan, RemoteCopy},
    device::{DeviceError, DeviceId, DmaEvent, Fabric, Limits, Mesh, Transfer},
    error::KernelError,
    frag::{self, PendingWgmma, WgmmaAccumulator, WgmmaOrder, WgmmaQueue},
    registry::Registry,
    scope::{Scope, ScopeError, Usage},
    sync::{Completion, Semaphore, SemaphoreKind},
};
use crate::loom::{
    swizzle::Swizzle,
    view::{self, Symbol, View},
};

/// Everything one device's kernel invocation needs, threaded through the kernel body.
///
/// Owns the per-invocation barrier semaphore and the handle to the device's DMA engine.
#[derive(Debug)]
pub struct KernelContext {
    index: usize,
    mesh: Mesh,
    fabric: Arc<Fabric>,
    registry: Arc<Registry>,
    engine: flume::Sender<DmaEvent>,
    barrier: Semaphore,
    /// Next symbol to hand out. Every device allocates in the same order, so symbols agree.
    symbols: AtomicU64,
    usage: Mutex<Usage>,
    wgmma: Mutex<WgmmaQueue>,
}

impl KernelContext {
    pub(crate) fn new(
        index: usize,
        mesh: Mesh,
        fabric: Arc<Fabric>,
        registry: Arc<Registry>,
        engine: flume::Sender<DmaEvent>,
        barrier: Semaphore,
        first: u64,
    ) -> Self {
        Self {
            index,
            mesh,
            fabric,
            registry,
            engine,
            barrier,
            symbols: AtomicU64::new(first),
            usage: Mutex::new(Usage::default()),
            wgmma: Mutex::new(WgmmaQueue::default()),
        }
    }

    #[inline]
    pub fn device_index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn device_id(&self) -> DeviceId {
        DeviceId::Logical(self.index)
    }

    #[inline]
    pub fn device_count(&self) -> usize {
        self.mesh.len()
    }

    /// Coordinates of this device in the mesh.
    #[inline]
    pub fn coords(&self) -> Vec<usize> {
        self.mesh.coords(self.index)
    }

    #[inline]
    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    #[inline]
    pub fn limits(&self) -> Limits {
        self.mesh.limits()
    }

    /// Resources currently held by all scopes of this invocation.
    pub fn usage(&self) -> Usage {
        *self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn next_symbol(&self) -> Symbol {
        Symbol(self.symbols.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn reserve(&self, demand: Usage) -> Result<(), ScopeError> {
        let limits = self.limits();
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        let checks = [
            ("bytes of shared memory", usage.shared_memory, demand.shared_memory, limits.shared_memory),
            ("bytes of scalar memory", usage.scalar_memory, demand.scalar_memory, limits.scalar_memory),
            ("semaphores", usage.semaphores, demand.semaphores, limits.semaphores),
        ];
        for (resource, used, requested, limit) in checks {
            if used + requested > limit {
                let available = limit.saturating_sub(used);
                return Err(ScopeError::Limit {
                    resource,
                    requested,
                    available,
                });
            }
        }
        *usage += demand;
        Ok(())
    }

    pub(crate) fn release(&self, held: Usage) {
        *self.usage.lock().unwrap_or_else(PoisonError::into_inner) -= held;
    }

    /// Opens a resource scope. Scopes nest; each releases what it allocated.
    #[inline]
    pub fn scope(&self) -> Scope<'_> {
        Scope::new(self)
    }

    /// The invocation-wide barrier semaphore, shared by symbol with every device.
    #[inline]
    pub fn barrier_semaphore(&self) -> Semaphore {
        self.barrier.clone()
    }

    fn submit(&self, transfer: Transfer) -> Result<(), DeviceError> {
        log::trace!(
            "[device {}] issue transfer {:?}: {} -> {}",
            self.index,
            transfer.id,
            transfer.src.symbol(),
            transfer.dst.symbol()
        );
        self.engine
            .send(DmaEvent::Copy(Box::new(transfer)))
            .map_err(|_| DeviceError::Engine(self.index))
    }

    /// Issues a copy between two views of this device. Does not block.
    pub fn async_copy(
        &self,
        src: &View,
        dst: &View,
        completion: impl Into<Completion>,
        options: &CopyOptions,
    ) -> Result<AsyncCopy, KernelError> {
        let completion = completion.into();
        let CopyPlan {
            src,
            src_offsets,
            dst,
            dst_offsets,
        } = copy::plan(src, dst, options)?;
        completion.issue()?;

        let (status, receiver) = flume::bounded(1);
        let transfer = Transfer {
            id: uid::Id::new(),
            src,
            src_offsets,
            dst,
            dst_offsets,
            target: None,
            send: completion.clone(),
            recv: None,
            status,
        };
        if let Err(err) = self.submit(transfer) {
            completion.revoke();
            return Err(err.into());
        }
        Ok(AsyncCopy::new(completion, receiver))
    }

    /// Issues a copy from a local view into the allocation of the same symbol on `target`.
    ///
    /// `send` completes here once the data has left; `recv` is signalled on `target`.
    pub fn async_remote_copy(
        &self,
        src: &View,
        dst: &View,
        send: &Semaphore,
        recv: &Semaphore,
        target: &DeviceId,
        options: &CopyOptions,
    ) -> Result<RemoteCopy, KernelError> {
        let target = self.mesh.resolve(target)?;
        let CopyPlan {
            src,
            src_offsets,
            dst,
            dst_offsets,
        } = copy::plan(src, dst, options)?;
        recv.check_kind(SemaphoreKind::Dma)?;
        recv.value()?;
        send.issue()?;

        let (status, receiver) = flume::bounded(1);
        let transfer = Transfer {
            id: uid::Id::new(),
            src,
            src_offsets,
            dst,
            dst_offsets,
            target: Some(target),
            send: send.into(),
            recv: Some(recv.clone()),
            status,
        };
        if let Err(err) = self.submit(transfer) {
            send.revoke();
            return Err(err.into());
        }
        Ok(RemoteCopy::new(send.clone(), recv.clone(), receiver))
    }

    /// Adds `amount` to a regular semaphore, here or on the device `target`.
    pub async fn semaphore_signal(
        &self,
        semaphore: &Semaphore,
        amount: u32,
        target: Option<&DeviceId>,
    ) -> Result<(), KernelError> {
        semaphore.check_kind(SemaphoreKind::Regular)?;
        match target {
            None => semaphore.signal(amount)?,
            Some(id) => {
                let index = self.mesh.resolve(id)?;
                let registry = self.fabric.registry(index)?;
                let remote = registry.resolve_semaphore(semaphore.symbol()).await;
                semaphore.rebind(&remote).signal(amount)?;
            }
        }
        Ok(())
    }

    /// Blocks until the count reaches `amount`, then subtracts it.
    pub async fn semaphore_wait(&self, semaphore: &Semaphore, amount: u32) -> Result<(), KernelError> {
        semaphore.check_kind(SemaphoreKind::Regular)?;
        semaphore.wait(amount).await?;
        Ok(())
    }

    /// Current count, without blocking.
    pub fn semaphore_read(&self, semaphore: &Semaphore) -> Result<usize, KernelError> {
        Ok(semaphore.value()?)
    }

    /// Signals the barrier semaphore of every device once, then waits for every device's signal.
    pub async fn barrier(&self) -> Result<(), KernelError> {
        let barrier = self.barrier_semaphore();
        for index in 0..self.device_count() {
            let target = DeviceId::Logical(index);
            self.semaphore_signal(&barrier, 1, Some(&target)).await?;
        }
        self.semaphore_wait(&barrier, self.device_count() as u32).await
    }

    /// A lane-cooperative synchronous copy within this device.
    pub fn copy(&self, src: &View, dst: &View, swizzle: Option<Swizzle>) -> Result<(), KernelError> {
        Ok(view::copy(src, dst, swizzle)?)
    }

    /// Issues `acc + a @ b` on shared-memory operands without blocking, see [`frag::wgmma()`].
    ///
    /// The operation joins the open group and runs when a [`wgmma_wait_group`](Self::wgmma_wait_group)
    /// retires that group; operands must stay untouched until then.
    pub fn wgmma_async(
        &self,
        acc: WgmmaAccumulator,
        a: &View,
        b: &View,
        a_order: WgmmaOrder,
        b_order: WgmmaOrder,
    ) -> PendingWgmma {
        let mut queue = self.wgmma.lock().unwrap_or_else(PoisonError::into_inner);
        frag::issue_wgmma(&mut queue, acc, a, b, a_order, b_order)
    }

    /// Closes the group of matrix operations issued since the last commit.
    /// Returns the number of committed groups in flight.
    pub fn wgmma_commit_group(&self) -> usize {
        self.wgmma
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .commit()
    }

    /// Waits until at most `pending` committed groups are still in flight.
    /// Operations issued after the last commit are not waited.
    pub fn wgmma_wait_group(&self, pending: usize) -> usize {
        let groups = self
            .wgmma
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .wait(pending);
        log::trace!("[device {}] wgmma groups in flight: {groups}", self.index);
        groups
    }
}
