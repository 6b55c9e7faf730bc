use std::pin::pin;

use futures::future::{Either, select};
use thiserror::Error;

use super::{
    device::DeviceError,
    sync::{Completion, Semaphore, SyncError},
};
use crate::loom::{
    ErrorClass,
    layout::{Layout, Transform},
    num::DataType,
    slice::Axis,
    swizzle::Swizzle,
    view::{MemoryError, MemorySpace, View},
};

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("copy space error: {0} memory is not addressable by asynchronous copies")]
    Space(MemorySpace),
    #[error("copy size error: source of {0} elements mismatches destination of {1} elements")]
    Size(usize, usize),
    #[error("copy type error: data type {0} mismatches {1}")]
    Type(DataType, DataType),
    #[error(
        "copy collapse error: view {0} indexes or squeezes one of the two minor-most tiled dimensions"
    )]
    CollapsedMinor(Layout),
    #[error("copy swizzle error: swizzling requires a shared memory endpoint")]
    Swizzle,
    #[error("copy wait error: the {0} completion of this copy has already been waited")]
    AlreadyWaited(&'static str),
    #[error("copy engine error: the DMA engine dropped the transfer before reporting its status")]
    Engine,
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl CopyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CopyError::AlreadyWaited(_) => ErrorClass::Resource,
            CopyError::Engine => ErrorClass::Runtime,
            CopyError::Memory(err) => err.class(),
            CopyError::Sync(err) => err.class(),
            CopyError::Device(err) => err.class(),
            _ => ErrorClass::Structural,
        }
    }
}

/// Optional adjustments of an asynchronous copy.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CopyOptions {
    /// Swizzle of the shared memory endpoint.
    pub swizzle: Option<Swizzle>,
    /// Transforms applied, in order, to the endpoint that is not in shared memory.
    pub transforms: Vec<Transform>,
    /// A dynamic index into the leading dimension of the source.
    pub index: Option<usize>,
}

impl CopyOptions {
    pub fn swizzle(mut self, swizzle: Swizzle) -> Self {
        self.swizzle = Some(swizzle);
        self
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

/// Element offsets of both endpoints, paired in order.
#[derive(Debug, Clone)]
pub(crate) struct CopyPlan {
    pub src: View,
    pub src_offsets: Vec<usize>,
    pub dst: View,
    pub dst_offsets: Vec<usize>,
}

/// Validates a copy and computes its element pairing. Nothing is issued.
pub(crate) fn plan(src: &View, dst: &View, options: &CopyOptions) -> Result<CopyPlan, CopyError> {
    for view in [src, dst] {
        if !view.space().is_addressable() {
            return Err(CopyError::Space(view.space()));
        }
    }
    if src.data_type() != dst.data_type() {
        return Err(CopyError::Type(src.data_type(), dst.data_type()));
    }

    let mut src = match options.index {
        Some(index) => src.slice(Axis::Dyn(index))?,
        None => src.clone(),
    };
    let mut dst = dst.clone();

    // 1. transforms apply at the memory space boundary, on the side outside shared memory
    let shared_dst = dst.space() == MemorySpace::Shared;
    for transform in &options.transforms {
        match shared_dst {
            true => src = src.transform(transform)?,
            false => dst = dst.transform(transform)?,
        }
    }

    // 2. the hardware-tiled minor dimensions must stay whole
    for view in [&src, &dst] {
        if view.is_collapsed() {
            return Err(CopyError::CollapsedMinor(view.layout().clone()));
        }
    }
    if src.len() != dst.len() {
        return Err(CopyError::Size(src.len(), dst.len()));
    }

    // 3. the swizzle lives on the shared memory side
    let (src_swizzle, dst_swizzle) = match options.swizzle {
        None => (None, None),
        Some(swizzle) if shared_dst => (None, Some(swizzle)),
        Some(swizzle) if src.space() == MemorySpace::Shared => (Some(swizzle), None),
        Some(_) => return Err(CopyError::Swizzle),
    };
    let src_offsets = src.swizzled_offsets(src_swizzle)?;
    let dst_offsets = dst.swizzled_offsets(dst_swizzle)?;

    Ok(CopyPlan {
        src,
        src_offsets,
        dst,
        dst_offsets,
    })
}

/// An issued local copy. Must be waited exactly once.
#[derive(Debug)]
#[must_use = "an issued copy must be waited"]
pub struct AsyncCopy {
    completion: Completion,
    status: flume::Receiver<Result<(), DeviceError>>,
    waited: bool,
}

impl AsyncCopy {
    pub(crate) fn new(completion: Completion, status: flume::Receiver<Result<(), DeviceError>>) -> Self {
        Self {
            completion,
            status,
            waited: false,
        }
    }

    /// Blocks until the copy has landed.
    ///
    /// A copy completing on a [`Barrier`](super::sync::Barrier) arrives on it once landed;
    /// waiting the copy then reports the transfer status only.
    pub async fn wait(mut self) -> Result<(), CopyError> {
        self.waited = true;
        match &self.completion {
            Completion::Semaphore(semaphore) => land(semaphore, &self.status).await,
            Completion::Barrier(_) => receive(&self.status).await,
        }
    }
}

impl Drop for AsyncCopy {
    fn drop(&mut self) {
        if !self.waited {
            log::error!("asynchronous copy dropped without being waited");
        }
    }
}

/// Receives the status of a transfer. Each status is received at most once, so a disconnected
/// channel means the engine dropped the transfer unreported.
async fn receive(status: &flume::Receiver<Result<(), DeviceError>>) -> Result<(), CopyError> {
    match status.recv_async().await {
        Ok(result) => Ok(result?),
        Err(_) => Err(CopyError::Engine),
    }
}

/// Waits one transfer completion on `semaphore`, then the transfer's status.
///
/// A transfer the engine drops or fails to complete never signals, so the status is watched
/// alongside the semaphore.
async fn land(
    semaphore: &Semaphore,
    status: &flume::Receiver<Result<(), DeviceError>>,
) -> Result<(), CopyError> {
    let landed = pin!(semaphore.wait_transfer());
    let reported = pin!(status.recv_async());
    match select(landed, reported).await {
        Either::Left((landed, reported)) => {
            landed?;
            match reported.await {
                Ok(result) => Ok(result?),
                Err(_) => Err(CopyError::Engine),
            }
        }
        Either::Right((Ok(Ok(())), landed)) => Ok(landed.await?),
        Either::Right((Ok(Err(err)), _)) => Err(err.into()),
        Either::Right((Err(_), _)) => Err(CopyError::Engine),
    }
}

/// An issued copy to another device, with independent send and receive completions.
///
/// The send side completes on this device once the source has been read out. The receive
/// side waits this device's own receive semaphore, signalled by the symmetric copy a peer sends here.
#[derive(Debug)]
#[must_use = "an issued copy must be waited"]
pub struct RemoteCopy {
    send: Semaphore,
    recv: Semaphore,
    status: flume::Receiver<Result<(), DeviceError>>,
    send_waited: bool,
    recv_waited: bool,
}

impl RemoteCopy {
    pub(crate) fn new(
        send: Semaphore,
        recv: Semaphore,
        status: flume::Receiver<Result<(), DeviceError>>,
    ) -> Self {
        Self {
            send,
            recv,
            status,
            send_waited: false,
            recv_waited: false,
        }
    }

    pub async fn wait_send(&mut self) -> Result<(), CopyError> {
        if self.send_waited {
            return Err(CopyError::AlreadyWaited("send"));
        }
        self.send_waited = true;
        land(&self.send, &self.status).await
    }

    pub async fn wait_recv(&mut self) -> Result<(), CopyError> {
        if self.recv_waited {
            return Err(CopyError::AlreadyWaited("recv"));
        }
        self.recv_waited = true;
        self.recv.wait_transfer().await?;
        Ok(())
    }

    /// Waits both sides, send first.
    pub async fn wait(mut self) -> Result<(), CopyError> {
        if !self.send_waited {
            self.wait_send().await?;
        }
        if !self.recv_waited {
            self.wait_recv().await?;
        }
        Ok(())
    }
}

impl Drop for RemoteCopy {
    fn drop(&mut self) {
        if !self.send_waited || !self.recv_waited {
            log::error!(
                "remote copy dropped without being waited (send: {}, recv: {})",
                self.send_waited,
                self.recv_waited
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{AsyncCopy, CopyError, CopyOptions, plan};
    use crate::{
        hal::{
            device::DeviceError,
            sync::{Barrier, Semaphore, SemaphoreKind},
        },
        loom::{
            ErrorClass,
            layout::Transform,
            num::DataType,
            slice::ds,
            swizzle::Swizzle,
            view::{Buffer, MemorySpace, Symbol, View},
        },
    };

    fn view(space: MemorySpace, shape: &[usize]) -> View {
        Buffer::new(Symbol::HOST, space, shape.to_vec(), DataType::F16).view()
    }

    #[tokio::test]
    async fn test_copy_status() -> Result<(), Box<dyn Error>> {
        let semaphore = Semaphore::new(Symbol(1), SemaphoreKind::Dma, None);

        // landed and reported
        let (sender, receiver) = flume::bounded(1);
        semaphore.issue()?;
        let copy = AsyncCopy::new(semaphore.clone().into(), receiver);
        semaphore.signal(1)?;
        sender.send(Ok(()))?;
        copy.wait().await?;
        assert!(semaphore.is_drained());

        // reported as failed, never landed
        let (sender, receiver) = flume::bounded(1);
        semaphore.issue()?;
        let copy = AsyncCopy::new(semaphore.clone().into(), receiver);
        sender.send(Err(DeviceError::Engine(0)))?;
        let err = copy.wait().await.unwrap_err();
        assert!(matches!(err, CopyError::Device(DeviceError::Engine(0))));
        semaphore.revoke();

        // the engine went away with the transfer
        let (sender, receiver) = flume::bounded(1);
        semaphore.issue()?;
        let copy = AsyncCopy::new(semaphore.clone().into(), receiver);
        drop(sender);
        let err = copy.wait().await.unwrap_err();
        assert!(matches!(err, CopyError::Engine));
        assert_eq!(err.class(), ErrorClass::Runtime);
        semaphore.revoke();
        assert!(semaphore.is_drained());

        let barrier = Barrier::new(Symbol(2), 1)?;
        let (sender, receiver) = flume::bounded::<Result<(), DeviceError>>(1);
        let copy = AsyncCopy::new(barrier.into(), receiver);
        drop(sender);
        assert!(matches!(copy.wait().await, Err(CopyError::Engine)));
        Ok(())
    }

    #[test]
    fn test_plan_transforms() -> Result<(), Box<dyn Error>> {
        let gmem = view(MemorySpace::Global, &[128, 128]);
        let smem = view(MemorySpace::Shared, &[2, 2, 64, 64]);

        let options = CopyOptions::default()
            .transform(Transform::Tile(vec![64, 64]))
            .swizzle(Swizzle::B128);
        let load = plan(&gmem, &smem, &options)?;
        // tile (1, 0) row 3 comes from global row 67
        let index = ((2 + 0) * 64 + 3) * 64;
        assert_eq!(load.src_offsets[index], 67 * 128);
        assert_eq!(load.dst_offsets[index], Swizzle::B128.apply(index, DataType::F16));

        let store = plan(&smem, &gmem, &options)?;
        assert_eq!(store.dst_offsets[index], 67 * 128);
        assert_eq!(store.src_offsets[index], load.dst_offsets[index]);
        Ok(())
    }

    #[test]
    fn test_plan_errors() -> Result<(), Box<dyn Error>> {
        let gmem = view(MemorySpace::Global, &[8, 128]);
        let smem = view(MemorySpace::Shared, &[8, 128]);

        let err = plan(&gmem.at(0)?, &smem.at(0)?, &CopyOptions::default()).unwrap_err();
        assert!(matches!(err, CopyError::CollapsedMinor(_)));
        assert_eq!(err.class(), ErrorClass::Structural);

        let err = plan(&gmem, &smem.slice(ds(0, 4))?, &CopyOptions::default()).unwrap_err();
        assert!(matches!(err, CopyError::Size(1024, 512)));

        let options = CopyOptions::default().swizzle(Swizzle::B128);
        assert!(matches!(plan(&gmem, &gmem, &options), Err(CopyError::Swizzle)));

        let regs = view(MemorySpace::Register, &[8, 128]);
        let err = plan(&gmem, &regs, &CopyOptions::default()).unwrap_err();
        assert!(matches!(err, CopyError::Space(MemorySpace::Register)));

        let words = Buffer::new(Symbol::HOST, MemorySpace::Shared, [8, 128], DataType::F32).view();
        assert!(matches!(
            plan(&gmem, &words, &CopyOptions::default()),
            Err(CopyError::Type(..))
        ));
        Ok(())
    }

    #[test]
    fn test_plan_swizzle_extent() -> Result<(), Box<dyn Error>> {
        // 72 f16 elements are not a whole number of 128-byte rows
        let gmem = view(MemorySpace::Global, &[72]);
        let smem = view(MemorySpace::Shared, &[72]);
        let options = CopyOptions::default().swizzle(Swizzle::B128);
        for err in [
            plan(&gmem, &smem, &options).unwrap_err(),
            plan(&smem, &gmem, &options).unwrap_err(),
        ] {
            assert!(matches!(err, CopyError::Memory(_)));
            assert_eq!(err.class(), ErrorClass::Structural);
        }

        let gmem = view(MemorySpace::Global, &[128]);
        let smem = view(MemorySpace::Shared, &[128]);
        let load = plan(&gmem, &smem, &options)?;
        assert!(load.dst_offsets.iter().all(|&x| x < 128));
        Ok(())
    }

    #[test]
    fn test_plan_index() -> Result<(), Box<dyn Error>> {
        let gmem = view(MemorySpace::Global, &[4, 8, 128]);
        let smem = view(MemorySpace::Shared, &[8, 128]);

        let options = CopyOptions::default().index(2);
        let copy = plan(&gmem, &smem, &options)?;
        assert!(copy.src.is_dynamic());
        assert_eq!(copy.src_offsets[0], 2 * 8 * 128);

        // out of range dynamic indices pass planning and fail at execution
        let options = CopyOptions::default().index(4);
        let copy = plan(&gmem, &smem, &options)?;
        let err = copy.src.check_bounds().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Runtime);
        Ok(())
    }
}
