//! `weft` builds tile-parallel accelerator kernels out of three pieces:
//! strided views over on-chip memory ([`loom`]), register fragments distributed over a warpgroup,
//! and asynchronous copies synchronized by semaphores ([`hal`]).
//!
//! Kernels run on a host-emulated mesh of devices, which makes every transfer and register layout observable.

pub mod hal;
pub mod loom;
