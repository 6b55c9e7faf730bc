use std::{future::Future, sync::Arc};

use derive_more::Display;
use instant::Instant;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    error::KernelError,
    kernel::KernelContext,
    registry::Registry,
    sync::{Completion, Semaphore, SemaphoreKind, SyncError},
};
use crate::loom::{
    ErrorClass,
    layout::{IndexFn, Layout, Shape},
    platform,
    view::{Buffer, HostBuffer, MemoryError, MemorySpace, Symbol, View},
};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device id error: {0} is not in mesh of shape {1}")]
    Id(DeviceId, Shape),
    #[error("device engine error: the DMA engine of device {0} has shut down")]
    Engine(usize),
    #[error("device operand error: expected operands for {0} devices, got {1}")]
    Devices(usize, usize),
    #[error("device operand error: device {0} got {1} operands, device 0 got {2}")]
    Operands(usize, usize, usize),
    #[error("device barrier error: barrier semaphore of device {0} holds {1} signals at kernel exit")]
    Barrier(usize, usize),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl DeviceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DeviceError::Id(..) | DeviceError::Devices(..) | DeviceError::Operands(..) => {
                ErrorClass::Structural
            }
            DeviceError::Engine(_) => ErrorClass::Runtime,
            DeviceError::Barrier(..) => ErrorClass::Resource,
            DeviceError::Memory(err) => err.class(),
            DeviceError::Sync(err) => err.class(),
        }
    }
}

/// Names a device of the mesh, either by its logical index or by its mesh coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceId {
    #[display("device({_0})")]
    Logical(usize),
    #[display("device{_0:?}")]
    Mesh(Vec<usize>),
}

impl From<usize> for DeviceId {
    fn from(value: usize) -> Self {
        Self::Logical(value)
    }
}

/// Per-device capacities enforced by scoped allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Limits {
    /// Shared memory in bytes.
    pub shared_memory: usize,
    /// Scalar memory in bytes.
    pub scalar_memory: usize,
    /// Live semaphore slots, barriers included.
    pub semaphores: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            shared_memory: 16 << 20,
            scalar_memory: 16 << 10,
            semaphores: 1024,
        }
    }
}

/// A grid of devices that run one kernel together. Logical ids enumerate the mesh row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mesh {
    shape: Shape,
    limits: Limits,
}

#[derive(Debug, Clone)]
pub struct MeshBuilder {
    shape: Shape,
    limits: Limits,
}

impl MeshBuilder {
    pub fn new(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let limits = Limits::default();
        Self { shape, limits }
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn build(self) -> Mesh {
        let Self { shape, limits } = self;
        Mesh { shape, limits }
    }
}

impl Mesh {
    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Number of devices.
    #[inline]
    pub fn len(&self) -> usize {
        self.shape.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mesh coordinates of a logical device.
    pub fn coords(&self, index: usize) -> Vec<usize> {
        Layout::from_shape(self.shape.clone()).unravel(index).0
    }

    /// Logical index of a device id.
    pub fn resolve(&self, id: &DeviceId) -> Result<usize, DeviceError> {
        let error = || DeviceError::Id(id.clone(), self.shape.clone());
        match id {
            &DeviceId::Logical(index) if index < self.len() => Ok(index),
            DeviceId::Logical(_) => Err(error()),
            DeviceId::Mesh(coords) => {
                let valid = coords.len() == self.shape.len()
                    && coords.iter().zip(self.shape.iter()).all(|(x, n)| x < n);
                match valid {
                    true => Ok(Layout::from_shape(self.shape.clone()).value(coords.as_slice())),
                    false => Err(error()),
                }
            }
        }
    }

    /// Runs `kernel` once per device, concurrently, and returns every device's operands afterwards.
    ///
    /// `operands[d]` are uploaded into global memory of device `d` under symbols `1..=n`,
    /// so the `i`-th operand of every device is the same symbol.
    pub async fn launch<F, Fut>(
        &self,
        operands: Vec<Vec<HostBuffer>>,
        kernel: F,
    ) -> Result<Vec<Vec<HostBuffer>>, KernelError>
    where
        F: Fn(KernelContext, Vec<View>) -> Fut,
        Fut: Future<Output = Result<(), KernelError>>,
    {
        if operands.len() != self.len() {
            return Err(DeviceError::Devices(self.len(), operands.len()).into());
        }
        let count = operands.first().map_or(0, Vec::len);
        if let Some((index, x)) = operands.iter().find_position(|x| x.len() != count) {
            return Err(DeviceError::Operands(index, x.len(), count).into());
        }

        let fabric = Arc::new(Fabric::new(self.len()));

        let kernel = &kernel;
        let futures = operands
            .into_iter()
            .enumerate()
            .map(|(index, operands)| {
                let registry = fabric.registries[index].clone();
                let buffers = operands
                    .iter()
                    .enumerate()
                    .map(|(k, host)| Buffer::from_host(Symbol(k as u64 + 1), MemorySpace::Global, host))
                    .collect_vec();
                for buffer in &buffers {
                    registry.insert_buffer(buffer.clone());
                }

                let barrier = Semaphore::new(Symbol::BARRIER, SemaphoreKind::Regular, None);
                registry.insert_semaphore(barrier.clone());

                let (sender, receiver) = flume::unbounded();
                platform::spawn(serve(index, fabric.clone(), receiver));

                let first = count as u64 + 1;
                let context = KernelContext::new(
                    index,
                    self.clone(),
                    fabric.clone(),
                    registry,
                    sender,
                    barrier.clone(),
                    first,
                );
                let views = buffers.iter().map(Buffer::view).collect_vec();

                async move {
                    log::trace!("[device {index}] kernel start");
                    kernel(context, views).await?;
                    log::trace!("[device {index}] kernel exit");

                    if !barrier.is_drained() {
                        let outstanding = barrier.outstanding();
                        return Err(DeviceError::Barrier(index, outstanding).into());
                    }
                    Ok::<_, KernelError>(buffers.iter().map(Buffer::to_host).collect_vec())
                }
            });
        futures::future::try_join_all(futures).await
    }
}

/// The registries of every device, shared by all contexts and engines of one launch.
#[derive(Debug)]
pub(crate) struct Fabric {
    registries: Vec<Arc<Registry>>,
}

impl Fabric {
    pub fn new(len: usize) -> Self {
        let registries = (0..len).map(|_| Arc::new(Registry::default())).collect();
        Self { registries }
    }

    pub fn registry(&self, index: usize) -> Result<&Registry, DeviceError> {
        let len = self.registries.len();
        self.registries
            .get(index)
            .map(|registry| registry.as_ref())
            .ok_or_else(|| DeviceError::Id(DeviceId::Logical(index), Shape(vec![len])))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId;

/// A planned transfer. Offsets are physical element offsets into the endpoints' buffers.
#[derive(Debug)]
pub(crate) struct Transfer {
    pub id: uid::Id<TransferId>,
    pub src: View,
    pub src_offsets: Vec<usize>,
    /// Destination, addressed on this device or on `target` by its symbol.
    pub dst: View,
    pub dst_offsets: Vec<usize>,
    pub target: Option<usize>,
    pub send: Completion,
    /// Receive semaphore, resolved on `target` by its symbol.
    pub recv: Option<Semaphore>,
    pub status: flume::Sender<Result<(), DeviceError>>,
}

#[derive(Debug)]
pub(crate) enum DmaEvent {
    Copy(Box<Transfer>),
}

async fn serve(index: usize, fabric: Arc<Fabric>, receiver: flume::Receiver<DmaEvent>) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            DmaEvent::Copy(transfer) => {
                let id = transfer.id;
                let status = transfer.status.clone();
                let now = Instant::now();
                let result = execute(&fabric, *transfer).await;
                match &result {
                    Ok(()) => log::trace!("[dma {index}] transfer {id:?}: {:?}", now.elapsed()),
                    Err(err) => log::warn!("[dma {index}] transfer {id:?} failed: {err}"),
                }
                _ = status.send_async(result).await;
            }
        }
    }
    log::trace!("[dma {index}] engine shut down");
}

fn move_elements(
    src: &View,
    src_offsets: &[usize],
    dst: &View,
    dst_offsets: &[usize],
) -> Result<(), MemoryError> {
    src.check_bounds()?;
    dst.check_bounds()?;
    let bytes = src.read_offsets(src_offsets)?;
    dst.write_offsets(dst_offsets, &bytes)
}

#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
async fn execute(fabric: &Fabric, transfer: Transfer) -> Result<(), DeviceError> {
    let Transfer {
        src,
        src_offsets,
        dst,
        dst_offsets,
        target,
        send,
        recv,
        ..
    } = transfer;

    let result = async {
        let (dst, recv) = match target {
            Some(target) => {
                let registry = fabric.registry(target)?;
                let buffer = registry.resolve_buffer(dst.symbol()).await;
                let dst = dst.rebind(buffer)?;
                let recv = match recv {
                    Some(recv) => {
                        let remote = registry.resolve_semaphore(recv.symbol()).await;
                        Some(recv.rebind(&remote))
                    }
                    None => None,
                };
                (dst, recv)
            }
            None => (dst, recv),
        };
        if let Some(recv) = &recv {
            recv.issue()?;
        }
        let moved = move_elements(&src, &src_offsets, &dst, &dst_offsets);
        if let Some(recv) = &recv {
            recv.signal(1)?;
        }
        Ok::<_, DeviceError>(moved?)
    }
    .await;

    // the send completion fires even on failure, the waiter picks the error up from the status
    send.complete()?;
    result
}
