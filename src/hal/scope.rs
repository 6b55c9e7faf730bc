use std::ops::{AddAssign, SubAssign};

use thiserror::Error;

use super::{
    kernel::KernelContext,
    sync::{Barrier, Semaphore, SemaphoreKind, SyncError},
};
use crate::loom::{
    ErrorClass,
    layout::Shape,
    num::DataType,
    view::{Buffer, MemorySpace, Symbol, View},
};

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error(
        "scope capability error: {0} memory cannot be allocated in a scope, registers are held by fragmented arrays"
    )]
    Space(MemorySpace),
    #[error("scope limit error: requested {requested} {resource} with only {available} available")]
    Limit {
        resource: &'static str,
        requested: usize,
        available: usize,
    },
    #[error("scope release error: {0} is not drained")]
    Undrained(Symbol),
    #[error("scope resource error: expected a {0}, found a {1}")]
    Resource(&'static str, &'static str),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ScopeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ScopeError::Space(_) => ErrorClass::Capability,
            ScopeError::Sync(err) => err.class(),
            _ => ErrorClass::Resource,
        }
    }
}

/// A request for scoped resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    Memory {
        space: MemorySpace,
        shape: Shape,
        r#type: DataType,
    },
    /// A scalar semaphore if `shape` is `None`, an array otherwise.
    Semaphores {
        kind: SemaphoreKind,
        shape: Option<Shape>,
    },
    Barrier {
        count: usize,
    },
}

impl Allocation {
    pub fn memory(space: MemorySpace, shape: impl Into<Shape>, r#type: DataType) -> Self {
        let shape = shape.into();
        Self::Memory {
            space,
            shape,
            r#type,
        }
    }

    pub fn semaphore(kind: SemaphoreKind) -> Self {
        Self::Semaphores { kind, shape: None }
    }

    pub fn semaphores(kind: SemaphoreKind, shape: impl Into<Shape>) -> Self {
        let shape = Some(shape.into());
        Self::Semaphores { kind, shape }
    }
}

#[derive(Debug, Clone)]
pub enum Resource {
    View(View),
    Semaphore(Semaphore),
    Barrier(Barrier),
}

impl Resource {
    fn name(&self) -> &'static str {
        match self {
            Resource::View(_) => "view",
            Resource::Semaphore(_) => "semaphore",
            Resource::Barrier(_) => "barrier",
        }
    }

    pub fn into_view(self) -> Result<View, ScopeError> {
        match self {
            Resource::View(view) => Ok(view),
            other => Err(ScopeError::Resource("view", other.name())),
        }
    }

    pub fn into_semaphore(self) -> Result<Semaphore, ScopeError> {
        match self {
            Resource::Semaphore(semaphore) => Ok(semaphore),
            other => Err(ScopeError::Resource("semaphore", other.name())),
        }
    }

    pub fn into_barrier(self) -> Result<Barrier, ScopeError> {
        match self {
            Resource::Barrier(barrier) => Ok(barrier),
            other => Err(ScopeError::Resource("barrier", other.name())),
        }
    }
}

/// Amounts of the per-device resources bounded by [`Limits`](super::device::Limits).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub shared_memory: usize,
    pub scalar_memory: usize,
    pub semaphores: usize,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.shared_memory += rhs.shared_memory;
        self.scalar_memory += rhs.scalar_memory;
        self.semaphores += rhs.semaphores;
    }
}

impl SubAssign for Usage {
    fn sub_assign(&mut self, rhs: Self) {
        self.shared_memory = self.shared_memory.saturating_sub(rhs.shared_memory);
        self.scalar_memory = self.scalar_memory.saturating_sub(rhs.scalar_memory);
        self.semaphores = self.semaphores.saturating_sub(rhs.semaphores);
    }
}

/// Owns everything allocated through it and releases it when closed or dropped.
///
/// Semaphores and barriers must be drained by then. [`Scope::close`] reports an undrained
/// resource as an error; dropping the scope logs it instead, or panics with the `strict` feature.
#[derive(Debug)]
pub struct Scope<'a> {
    context: &'a KernelContext,
    usage: Usage,
    symbols: Vec<Symbol>,
    semaphores: Vec<Semaphore>,
    barriers: Vec<Barrier>,
    closed: bool,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(context: &'a KernelContext) -> Self {
        Self {
            context,
            usage: Usage::default(),
            symbols: vec![],
            semaphores: vec![],
            barriers: vec![],
            closed: false,
        }
    }

    /// Resources held by this scope.
    #[inline]
    pub fn usage(&self) -> Usage {
        self.usage
    }

    fn reserve(&mut self, demand: Usage) -> Result<Symbol, ScopeError> {
        self.context.reserve(demand)?;
        self.usage += demand;
        let symbol = self.context.next_symbol();
        self.symbols.push(symbol);
        Ok(symbol)
    }

    pub fn allocate(&mut self, allocation: Allocation) -> Result<Resource, ScopeError> {
        match allocation {
            Allocation::Memory {
                space,
                shape,
                r#type,
            } => {
                let bytes = shape.size() * r#type.size();
                let demand = match space {
                    MemorySpace::Global => Usage::default(),
                    MemorySpace::Shared => Usage {
                        shared_memory: bytes,
                        ..Default::default()
                    },
                    MemorySpace::Scalar => Usage {
                        scalar_memory: bytes,
                        ..Default::default()
                    },
                    MemorySpace::Register => return Err(ScopeError::Space(space)),
                };
                let symbol = self.reserve(demand)?;
                let buffer = Buffer::new(symbol, space, shape, r#type);
                self.context.registry().insert_buffer(buffer.clone());
                log::debug!(
                    "[device {}] allocate {symbol}: {space} {} of {}",
                    self.context.device_index(),
                    buffer.shape(),
                    buffer.data_type()
                );
                Ok(Resource::View(buffer.view()))
            }
            Allocation::Semaphores { kind, shape } => {
                let semaphores = shape.as_ref().map_or(1, Shape::size);
                let demand = Usage {
                    semaphores,
                    ..Default::default()
                };
                let symbol = self.reserve(demand)?;
                let semaphore = Semaphore::new(symbol, kind, shape);
                self.context.registry().insert_semaphore(semaphore.clone());
                self.semaphores.push(semaphore.clone());
                log::debug!(
                    "[device {}] allocate {symbol}: {semaphores} {kind} semaphore(s)",
                    self.context.device_index()
                );
                Ok(Resource::Semaphore(semaphore))
            }
            Allocation::Barrier { count } => {
                if count == 0 {
                    return Err(SyncError::Arrival(Symbol::HOST).into());
                }
                let demand = Usage {
                    semaphores: 1,
                    ..Default::default()
                };
                let symbol = self.reserve(demand)?;
                let barrier = Barrier::new(symbol, count)?;
                self.barriers.push(barrier.clone());
                Ok(Resource::Barrier(barrier))
            }
        }
    }

    #[inline]
    pub fn view(
        &mut self,
        space: MemorySpace,
        shape: impl Into<Shape>,
        r#type: DataType,
    ) -> Result<View, ScopeError> {
        self.allocate(Allocation::memory(space, shape, r#type))?
            .into_view()
    }

    #[inline]
    pub fn semaphore(&mut self, kind: SemaphoreKind) -> Result<Semaphore, ScopeError> {
        self.allocate(Allocation::semaphore(kind))?.into_semaphore()
    }

    #[inline]
    pub fn semaphores(
        &mut self,
        kind: SemaphoreKind,
        shape: impl Into<Shape>,
    ) -> Result<Semaphore, ScopeError> {
        self.allocate(Allocation::semaphores(kind, shape))?
            .into_semaphore()
    }

    #[inline]
    pub fn barrier(&mut self, count: usize) -> Result<Barrier, ScopeError> {
        self.allocate(Allocation::Barrier { count })?.into_barrier()
    }

    fn undrained(&self) -> Option<Symbol> {
        let semaphores = self
            .semaphores
            .iter()
            .filter(|semaphore| !semaphore.is_drained())
            .map(Semaphore::symbol);
        let barriers = self
            .barriers
            .iter()
            .filter(|barrier| !barrier.is_drained())
            .map(Barrier::symbol);
        semaphores.chain(barriers).next()
    }

    fn release(&mut self) {
        let registry = self.context.registry();
        for symbol in self.symbols.drain(..) {
            registry.remove(symbol);
        }
        self.context.release(self.usage);
        self.usage = Usage::default();
        self.closed = true;
    }

    /// Releases everything, failing if a semaphore or barrier is not drained.
    pub fn close(mut self) -> Result<(), ScopeError> {
        let undrained = self.undrained();
        self.release();
        match undrained {
            Some(symbol) => Err(ScopeError::Undrained(symbol)),
            None => Ok(()),
        }
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let undrained = self.undrained();
        self.release();
        if let Some(symbol) = undrained {
            log::error!(
                "[device {}] scope dropped while {symbol} is not drained",
                self.context.device_index()
            );
            #[cfg(feature = "strict")]
            if !std::thread::panicking() {
                panic!("scope dropped while {symbol} is not drained");
            }
        }
    }
}
