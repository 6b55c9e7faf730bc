use std::sync::Arc;

use derive_more::Display;
use itertools::Itertools;
use thiserror::Error;

use super::{
    copy::{AsyncCopy, CopyOptions},
    error::KernelError,
    kernel::KernelContext,
    sync::{Semaphore, SemaphoreKind},
};
use crate::loom::{
    ErrorClass,
    layout::{Layout, Shape},
    platform,
    slice::{Slice, ds},
    view::{MemorySpace, View},
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline grid error: grid {0} has no steps")]
    Grid(Shape),
    #[error("pipeline operand error: {0} block specs for {1} operands")]
    Operands(usize, usize),
    #[error("pipeline rank error: block index {0:?} of spec {1} mismatches the operand rank {2}")]
    Rank(Vec<usize>, Shape, usize),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Structural
    }
}

/// Where a step sits in the grid, which decides the copies it issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Phase {
    /// The first of several steps.
    First,
    Steady,
    /// The last of several steps.
    Last,
    /// The only step.
    Single,
}

/// The default copies of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopyActions {
    /// Fetch this step's input blocks even if the working slot seems current.
    pub fetch: bool,
    /// Prefetch the next step's input blocks into the buffering slots.
    pub prefetch: bool,
    /// Write every output block back once the body has run.
    pub flush: bool,
}

impl Phase {
    pub fn of(step: usize, steps: usize) -> Self {
        match (step, steps) {
            (_, 0 | 1) => Phase::Single,
            (0, _) => Phase::First,
            (step, steps) if step + 1 == steps => Phase::Last,
            _ => Phase::Steady,
        }
    }

    pub fn actions(self) -> CopyActions {
        let (fetch, prefetch, flush) = match self {
            Phase::First => (true, true, false),
            Phase::Steady => (false, true, false),
            Phase::Last => (false, false, true),
            Phase::Single => (true, false, true),
        };
        CopyActions {
            fetch,
            prefetch,
            flush,
        }
    }
}

pub type IndexMap = Arc<dyn Fn(&[usize]) -> Vec<usize> + Send + Sync>;

/// The block of an operand a grid point works on.
#[derive(Clone)]
pub struct BlockSpec {
    block_shape: Shape,
    index_map: IndexMap,
}

impl std::fmt::Debug for BlockSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSpec")
            .field("block_shape", &self.block_shape)
            .finish_non_exhaustive()
    }
}

impl BlockSpec {
    /// `index_map` sends a grid point to a block index, counted in blocks.
    pub fn new(
        block_shape: impl Into<Shape>,
        index_map: impl Fn(&[usize]) -> Vec<usize> + Send + Sync + 'static,
    ) -> Self {
        Self {
            block_shape: block_shape.into(),
            index_map: Arc::new(index_map),
        }
    }

    #[inline]
    pub fn block_shape(&self) -> &Shape {
        &self.block_shape
    }

    #[inline]
    pub fn index(&self, point: &[usize]) -> Vec<usize> {
        (self.index_map)(point)
    }

    /// The sub-view of `view` covered by the block at `index`.
    pub fn block(&self, view: &View, index: &[usize]) -> Result<View, KernelError> {
        let rank = view.shape().len();
        if index.len() != rank || self.block_shape.len() != rank {
            let err = PipelineError::Rank(index.to_vec(), self.block_shape.clone(), rank);
            return Err(err.into());
        }
        let axes = index
            .iter()
            .zip_eq(self.block_shape.iter())
            .map(|(&index, &size)| ds(index * size, size))
            .collect_vec();
        Ok(view.slice(Slice::from(axes))?)
    }
}

/// One step of a running pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStep {
    pub index: usize,
    pub point: Vec<usize>,
    pub phase: Phase,
}

/// Caller code run around every step.
#[allow(async_fn_in_trait)]
pub trait PipelineHooks {
    /// Runs before a step's inputs land. Returns `true` to skip the default fetch of them.
    async fn prologue(&mut self, ctx: &KernelContext, step: &PipelineStep) -> Result<bool, KernelError> {
        let _ = (ctx, step);
        Ok(false)
    }

    /// Runs after the body. Returns `true` to leave the step's copies in flight instead of
    /// waiting them here; each is then waited when its slot is next needed.
    async fn epilogue(&mut self, ctx: &KernelContext, step: &PipelineStep) -> Result<bool, KernelError> {
        let _ = (ctx, step);
        Ok(false)
    }
}

/// Hooks that keep every default copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl PipelineHooks for NoHooks {}

/// A prefetch into the buffering slot. The copy is gone once waited.
#[derive(Debug)]
struct Prefetch {
    copy: Option<AsyncCopy>,
    block: Vec<usize>,
}

#[derive(Debug)]
struct InputStream<'a> {
    spec: &'a BlockSpec,
    source: &'a View,
    /// The working and the buffering slot.
    slots: [View; 2],
    working: usize,
    /// Block held by the working slot.
    current: Option<Vec<usize>>,
    pending: Option<Prefetch>,
    semaphore: Semaphore,
}

impl InputStream<'_> {
    async fn land(
        &mut self,
        ctx: &KernelContext,
        point: &[usize],
        fetch: bool,
        skip: bool,
    ) -> Result<(), KernelError> {
        if let Some(Prefetch { copy, block }) = self.pending.take() {
            if let Some(copy) = copy {
                copy.wait().await?;
            }
            self.working ^= 1;
            self.current = Some(block);
        }

        let block = self.spec.index(point);
        let stale = self.current.as_ref() != Some(&block);
        match (fetch || stale, skip) {
            (true, true) => self.current = None,
            (true, false) => {
                let src = self.spec.block(self.source, &block)?;
                let dst = &self.slots[self.working];
                ctx.async_copy(&src, dst, &self.semaphore, &CopyOptions::default())?
                    .wait()
                    .await?;
                self.current = Some(block);
            }
            (false, _) => {}
        }
        Ok(())
    }

    fn prefetch(&mut self, ctx: &KernelContext, point: &[usize]) -> Result<(), KernelError> {
        let block = self.spec.index(point);
        if self.current.as_ref() == Some(&block) {
            return Ok(());
        }
        let src = self.spec.block(self.source, &block)?;
        let dst = &self.slots[self.working ^ 1];
        let copy = ctx.async_copy(&src, dst, &self.semaphore, &CopyOptions::default())?;
        let copy = Some(copy);
        self.pending = Some(Prefetch { copy, block });
        Ok(())
    }

    /// Waits the prefetch in flight, if any. It still swaps in when the next step lands.
    async fn settle(&mut self) -> Result<(), KernelError> {
        if let Some(copy) = self.pending.as_mut().and_then(|prefetch| prefetch.copy.take()) {
            copy.wait().await?;
        }
        Ok(())
    }

    fn working(&self) -> View {
        self.slots[self.working].clone()
    }
}

#[derive(Debug)]
struct OutputSink<'a> {
    spec: &'a BlockSpec,
    target: &'a View,
    /// The working slot the body writes, and the slot draining to the target.
    slots: [View; 2],
    working: usize,
    /// Block held by the working slot.
    current: Option<Vec<usize>>,
    /// The write-back draining the other slot.
    pending: Option<AsyncCopy>,
    semaphore: Semaphore,
}

impl OutputSink<'_> {
    /// Starts writing the working slot back to its block and swaps slots.
    ///
    /// Copies go out asynchronously; accumulation reads the target, so it happens in place.
    async fn write_back(&mut self, ctx: &KernelContext, accumulate: bool) -> Result<(), KernelError> {
        let Some(block) = self.current.take() else {
            return Ok(());
        };
        let dst = self.spec.block(self.target, &block)?;
        // the slot swapped in next must have drained
        self.settle().await?;
        let slot = &self.slots[self.working];
        match accumulate {
            true => dst.accumulate(slot)?,
            false => {
                let copy = ctx.async_copy(slot, &dst, &self.semaphore, &CopyOptions::default())?;
                self.pending = Some(copy);
            }
        }
        self.working ^= 1;
        Ok(())
    }

    async fn settle(&mut self) -> Result<(), KernelError> {
        if let Some(copy) = self.pending.take() {
            copy.wait().await?;
        }
        Ok(())
    }

    fn working(&self) -> View {
        self.slots[self.working].clone()
    }
}

/// A double-buffered software pipeline over a grid.
///
/// Every input is streamed through two shared-memory slots: the next step's block is prefetched
/// into the buffering slot while the body reads the working slot, and the slots swap.
/// Outputs have two slots as well. An output block stays in the working slot until the grid moves
/// to another block; then it drains to its target while the body fills the other slot.
/// Consecutive steps mapping to the same input block fetch it only once.
pub struct Pipeline<B> {
    body: B,
    grid: Shape,
    in_specs: Vec<BlockSpec>,
    out_specs: Vec<BlockSpec>,
    accumulate_out: bool,
}

impl<B> std::fmt::Debug for Pipeline<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("grid", &self.grid)
            .field("in_specs", &self.in_specs)
            .field("out_specs", &self.out_specs)
            .field("accumulate_out", &self.accumulate_out)
            .finish_non_exhaustive()
    }
}

impl<B> Pipeline<B>
where
    B: Fn(&KernelContext, &PipelineStep, &[View], &[View]) -> Result<(), KernelError>,
{
    /// The body receives the working input blocks and the output blocks of every step.
    pub fn new(
        body: B,
        grid: impl Into<Shape>,
        in_specs: Vec<BlockSpec>,
        out_specs: Vec<BlockSpec>,
    ) -> Self {
        Self {
            body,
            grid: grid.into(),
            in_specs,
            out_specs,
            accumulate_out: false,
        }
    }

    /// Adds output blocks into the outputs instead of overwriting them.
    pub fn accumulate_out(mut self, accumulate: bool) -> Self {
        self.accumulate_out = accumulate;
        self
    }

    #[inline]
    pub fn steps(&self) -> usize {
        self.grid.size()
    }

    /// The grid point of a step; the last grid dimension runs fastest.
    pub fn point(&self, step: usize) -> Vec<usize> {
        Layout::from_shape(self.grid.clone()).unravel(step).0
    }

    pub async fn run(
        &self,
        ctx: &KernelContext,
        inputs: &[View],
        outputs: &[View],
    ) -> Result<(), KernelError> {
        self.run_with_hooks(ctx, inputs, outputs, &mut NoHooks).await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn run_with_hooks<H: PipelineHooks>(
        &self,
        ctx: &KernelContext,
        inputs: &[View],
        outputs: &[View],
        hooks: &mut H,
    ) -> Result<(), KernelError> {
        if self.grid.is_empty() || self.steps() == 0 {
            return Err(PipelineError::Grid(self.grid.clone()).into());
        }
        if self.in_specs.len() != inputs.len() {
            return Err(PipelineError::Operands(self.in_specs.len(), inputs.len()).into());
        }
        if self.out_specs.len() != outputs.len() {
            return Err(PipelineError::Operands(self.out_specs.len(), outputs.len()).into());
        }

        // 1. slots and semaphores, allocated in the same order on every device
        let mut scope = ctx.scope();
        let mut streams = vec![];
        for (spec, source) in self.in_specs.iter().zip_eq(inputs) {
            let shape = spec.block_shape().clone();
            let slots = [
                scope.view(MemorySpace::Shared, shape.clone(), source.data_type())?,
                scope.view(MemorySpace::Shared, shape, source.data_type())?,
            ];
            let semaphore = scope.semaphore(SemaphoreKind::Dma)?;
            streams.push(InputStream {
                spec,
                source,
                slots,
                working: 0,
                current: None,
                pending: None,
                semaphore,
            });
        }
        let mut sinks = vec![];
        for (spec, target) in self.out_specs.iter().zip_eq(outputs) {
            let shape = spec.block_shape().clone();
            let slots = [
                scope.view(MemorySpace::Shared, shape.clone(), target.data_type())?,
                scope.view(MemorySpace::Shared, shape, target.data_type())?,
            ];
            let semaphore = scope.semaphore(SemaphoreKind::Dma)?;
            sinks.push(OutputSink {
                spec,
                target,
                slots,
                working: 0,
                current: None,
                pending: None,
                semaphore,
            });
        }

        // 2. drive the grid
        let result = self.drive(ctx, &mut streams, &mut sinks, hooks).await;

        // 3. land copies an early error or a deferred wait left in flight
        for stream in &mut streams {
            if let Err(err) = stream.settle().await {
                log::warn!("[device {}] abandoned prefetch failed: {err}", ctx.device_index());
            }
            stream.pending = None;
        }
        let mut drained = Ok(());
        for sink in &mut sinks {
            if let Err(err) = sink.settle().await {
                log::warn!("[device {}] write-back failed: {err}", ctx.device_index());
                drained = drained.and(Err(err));
            }
        }
        result?;
        drained?;
        scope.close()?;
        Ok(())
    }

    async fn drive<H: PipelineHooks>(
        &self,
        ctx: &KernelContext,
        streams: &mut [InputStream<'_>],
        sinks: &mut [OutputSink<'_>],
        hooks: &mut H,
    ) -> Result<(), KernelError> {
        let steps = self.steps();
        for index in 0..steps {
            let phase = Phase::of(index, steps);
            let actions = phase.actions();
            let step = PipelineStep {
                index,
                point: self.point(index),
                phase,
            };
            log::trace!(
                "[device {}] pipeline step {index} {phase} at {:?}",
                ctx.device_index(),
                step.point
            );

            let skip_fetch = hooks.prologue(ctx, &step).await?;
            for stream in streams.iter_mut() {
                stream.land(ctx, &step.point, actions.fetch, skip_fetch).await?;
            }

            for sink in sinks.iter_mut() {
                let block = sink.spec.index(&step.point);
                if sink.current.as_ref() != Some(&block) {
                    sink.write_back(ctx, self.accumulate_out).await?;
                    sink.current = Some(block);
                }
            }

            if actions.prefetch {
                let next = self.point(index + 1);
                for stream in streams.iter_mut() {
                    stream.prefetch(ctx, &next)?;
                }
            }

            // copies just issued proceed on the engines while the body runs
            platform::yield_now().await;
            let inputs = streams.iter().map(InputStream::working).collect_vec();
            let outputs = sinks.iter().map(OutputSink::working).collect_vec();
            (self.body)(ctx, &step, &inputs, &outputs)?;

            let skip_wait = hooks.epilogue(ctx, &step).await?;
            if !skip_wait {
                for stream in streams.iter_mut() {
                    stream.settle().await?;
                }
                for sink in sinks.iter_mut() {
                    sink.settle().await?;
                }
            }

            if actions.flush {
                for sink in sinks.iter_mut() {
                    sink.write_back(ctx, self.accumulate_out).await?;
                    sink.settle().await?;
                }
            }
        }
        Ok(())
    }
}
