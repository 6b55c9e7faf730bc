//! The `loom` module provides the foundational abstractions the kernel layer is woven from.
//! Everything here is synchronous and free of device state.
//!
//! ## Key Components
//! 1. **Strided Views**:
//!    - Row-major layouts (`Layout`) of `(extent, stride)` pairs and their algebra.
//!    - Slicing, squeezing, folding, unfolding, tiling and transposing as bijective `Transform`s.
//!    - Views (`View`) binding a layout and an offset to an allocation in a `MemorySpace`.
//!
//! 2. **Swizzling**:
//!    - The 128-byte shared-memory swizzle (`Swizzle`), bit-exact for every element width.
//!
//! 3. **Numerical System**:
//!    - Scalar types (`f32`, `f16`, `bf16`, `i32`, `u32`, `u8`) and data type metadata (`DataType`).
//!    - Reduced-precision quantization for the tf32 matrix path.
//!
//! ## Design Principles
//! - **Portability**: WASM support via `wasm_bindgen_futures`.
//! - **Safety**: Every transform is validated at construction; dynamic offsets are checked at execution.
//! - **Exactness**: Unsupported transforms fail as "not implemented" instead of computing a wrong stride.

#![cfg_attr(target_arch = "wasm32", allow(async_fn_in_trait))]

use derive_more::Display;

pub mod layout;
pub mod num;
pub mod platform;
pub mod slice;
pub mod swizzle;
pub mod view;

/// Coarse classification of every error the crate reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorClass {
    /// Mismatched or malformed shapes, unsupported transform patterns.
    Structural,
    /// Semaphore kind or shape misuse, exhausted limits, undrained resources.
    Resource,
    /// An operation unsupported for the given dtype, transpose or precision.
    Capability,
    /// Functionality that is known to be missing.
    NotImplemented,
    /// Failures only observable while executing, such as a dynamic slice out of bounds.
    Runtime,
}
