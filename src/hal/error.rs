use thiserror::Error;

use super::{
    copy::CopyError, device::DeviceError, frag::FragmentError, pipeline::PipelineError,
    scope::ScopeError, sync::SyncError,
};
use crate::loom::{ErrorClass, layout::LayoutError, view::MemoryError};

/// Any failure a kernel body can run into.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Copy(#[from] CopyError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Fragment(#[from] FragmentError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl KernelError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KernelError::Layout(err) => err.class(),
            KernelError::Memory(err) => err.class(),
            KernelError::Copy(err) => err.class(),
            KernelError::Sync(err) => err.class(),
            KernelError::Scope(err) => err.class(),
            KernelError::Fragment(err) => err.class(),
            KernelError::Device(err) => err.class(),
            KernelError::Pipeline(err) => err.class(),
        }
    }
}
