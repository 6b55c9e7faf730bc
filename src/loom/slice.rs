use std::sync::Arc;

use casey::snake;
use derive_more::{Deref, DerefMut, Display, From, Into};
use itertools::Itertools;

use super::layout::Layout;

/// Selection along one dimension of a view.
///
/// Static axes are bounds-checked when the slice is applied; dynamic axes carry offsets only known
/// at execution time and are checked by the device when a transfer touches them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Axis {
    #[default]
    #[display("..")]
    Full,
    /// A static index. Removes the dimension.
    #[display("{_0}")]
    One(usize),
    /// A static sub-range.
    #[display("{start}..{}", start + len)]
    Range { start: usize, len: usize },
    /// A dynamic index. Removes the dimension.
    #[display("~{_0}")]
    Dyn(usize),
    /// A dynamic start with a static length.
    #[display("~{start}+{len}")]
    DynRange { start: usize, len: usize },
}

impl Axis {
    #[inline]
    pub fn is_dynamic(self) -> bool {
        matches!(self, Axis::Dyn(_) | Axis::DynRange { .. })
    }
}

/// A static sub-range of `len` elements from `start`.
#[inline]
pub fn ds(start: usize, len: usize) -> Axis {
    Axis::Range { start, len }
}

/// A sub-range of `len` elements whose `start` is only known at execution time.
#[inline]
pub fn dyn_ds(start: usize, len: usize) -> Axis {
    Axis::DynRange { start, len }
}

impl From<usize> for Axis {
    #[inline]
    fn from(value: usize) -> Self {
        Self::One(value)
    }
}

impl From<std::ops::RangeFull> for Axis {
    #[inline]
    fn from(_: std::ops::RangeFull) -> Self {
        Self::Full
    }
}

impl From<std::ops::Range<usize>> for Axis {
    #[inline]
    fn from(value: std::ops::Range<usize>) -> Self {
        let start = value.start;
        let len = value.end.saturating_sub(value.start);
        Self::Range { start, len }
    }
}

/// Per-dimension selection. A slice shorter than the view's rank leaves trailing dimensions full.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, DerefMut, From, Into, Display)]
#[display("[{}]", _0.iter().format(", "))]
pub struct Slice(Arc<[Axis]>);

impl From<Vec<Axis>> for Slice {
    #[inline]
    fn from(value: Vec<Axis>) -> Self {
        Self(value.into())
    }
}

macro_rules! impl_slice_from {
    ($t:ident) => {
        impl<$t: Into<Axis>> From<$t> for Slice {
            #[inline]
            fn from(snake!($t): $t) -> Self {
                Self([snake!($t).into()].into())
            }
        }
    };
    ($($t:ident),+) => {
        impl<$($t),+> From<($($t),+)> for Slice
        where
            $($t: Into<Axis>),+
        {
            #[inline]
            fn from(($(snake!($t)),+): ($($t),+)) -> Self {
                Self([$(snake!($t).into()),+].into())
            }
        }
    };
}

impl_slice_from!(T0);
impl_slice_from!(T0, T1);
impl_slice_from!(T0, T1, T2);
impl_slice_from!(T0, T1, T2, T3);
impl_slice_from!(T0, T1, T2, T3, T4);
impl_slice_from!(T0, T1, T2, T3, T4, T5);

impl Slice {
    /// Creates a full slice of the same rank as a `Layout`.
    #[inline]
    pub fn from_layout(layout: &Layout) -> Self {
        Self::from(vec![Axis::Full; layout.len()])
    }

    /// Returns `true` if the slice contains only full axes.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.iter().all(|&axis| matches!(axis, Axis::Full))
    }

    /// Returns `true` if any axis is dynamic.
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.iter().any(|axis| axis.is_dynamic())
    }
}
