//! The `hal` module is the kernel layer: it runs kernel bodies on a mesh of devices and moves data for them.
//!
//! ## Key Components
//! 1. **Devices**:
//!    - A mesh (`Mesh`) of host-emulated devices, each serving its own DMA engine.
//!    - A symmetric symbol table (`Registry`) resolving allocations and semaphores across devices.
//!
//! 2. **Copy & Synchronization**:
//!    - Asynchronous local and remote copies (`AsyncCopy`, `RemoteCopy`) completing on DMA semaphores.
//!    - Counting semaphores (`Semaphore`), parity barriers (`Barrier`), and scoped allocations (`Scope`).
//!
//! 3. **Fragmented Arrays**:
//!    - Register-resident tensors (`FragmentedArray`) under warpgroup layouts (`FragLayout`).
//!    - Elementwise arithmetic, row reductions, and tensor-core style matrix accumulation.
//!
//! 4. **Pipelining**:
//!    - Double-buffered software pipelines (`Pipeline`) overlapping block fetches with compute.
//!
//! ## Design Principles
//! - **Ownership**: Every issued copy is a `#[must_use]` handle consumed by its wait.
//! - **Accountability**: Scopes verify their semaphores are drained when they close.
//! - **Symmetry**: An allocation gets the same symbol on every device, so peers address it by name.

pub mod copy;
pub mod device;
pub mod error;
pub mod frag;
pub mod kernel;
pub mod pipeline;
pub mod registry;
pub mod scope;
pub mod sync;
