use derive_more::{Deref, DerefMut, Display};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    ErrorClass,
    num::DataType,
    slice::{Axis, Slice},
};

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("layout rank error: shape {0} vs. stride {1}")]
    Rank(Shape, Stride),
    #[error("layout dim error: dimension {1} is out of range for layout {0}")]
    Dim(Layout, usize),
    #[error("layout slice error: slice {1} is not compatible with layout {0}")]
    Slice(Layout, Slice),
    #[error("layout squeeze error: dimension {1} of layout {0} is not of extent 1")]
    Squeeze(Layout, usize),
    #[error("layout unfold error: extent {0} cannot be unfolded into {1:?}")]
    Unfold(usize, Vec<Option<usize>>),
    #[error("layout tile error: tiling {1:?} does not divide layout {0}")]
    Tile(Layout, Vec<usize>),
    #[error("layout transpose error: {1:?} is not a permutation of {0} dimensions")]
    Transpose(usize, Vec<usize>),
    #[error("not implemented: folding non-contiguous dimensions {1}..{2} of layout {0}")]
    Fold(Layout, usize, usize),
    #[error("not implemented: untiling non-contiguous tiles of layout {0}")]
    Untile(Layout),
    #[error("not implemented: swizzle of {0} bytes, only swizzle 128B is implemented")]
    Swizzle(usize),
    #[error("layout swizzle error: {0} elements of {1} are not a whole number of {2}-byte rows")]
    SwizzleExtent(usize, DataType, usize),
    #[error("layout index error: index {1} is out of range for layout {0}")]
    Index(Layout, usize),
}

impl LayoutError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LayoutError::Fold(..) | LayoutError::Untile(_) | LayoutError::Swizzle(_) => {
                ErrorClass::NotImplemented
            }
            _ => ErrorClass::Structural,
        }
    }
}

/// An [`IndexFn`] is a mapping that maps an index to another.
pub trait IndexFn<Index> {
    /// Sends an index to a mapped value.
    fn value(&self, index: Index) -> usize;
}

macro_rules! impl_index_vec {
    ($name:ident) => {
        impl<T: IntoIterator<Item = usize>> From<T> for $name {
            #[inline]
            fn from(value: T) -> Self {
                Self(value.into_iter().collect())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:?}", self.0)
            }
        }
    };
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, DerefMut)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Shape(pub Vec<usize>);

/// Defines the step to add to when increase 1 along coordinates.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, DerefMut)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Stride(pub Vec<usize>);

/// A multi-dimensional coordinate.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, DerefMut)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Coord(pub Vec<usize>);

impl_index_vec!(Shape);
impl_index_vec!(Stride);
impl_index_vec!(Coord);

impl Shape {
    /// Total number of elements the shape contains. A rank-0 shape holds one element.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }
}

/// A row-major [`Layout`]: a sequence of `(extent, stride)` modes, the last mode being the fastest.
/// Strides are in elements.
///
/// For the underlying algebra, check:
/// - [CuTe documents](https://github.com/NVIDIA/cutlass/blob/main/media/docs/cute);
/// - [A note on the algebra of CuTe Layouts](https://leimao.github.io/downloads/article/2024-10-20-CuTe-Layout-Algebra/layout_algebra.pdf).
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Layout(Vec<(usize, usize)>);

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = self.shape();
        let stride = self.stride();
        write!(f, "<{shape}, {stride}>")
    }
}

/// The outcome of [`Layout::slice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sliced {
    pub layout: Layout,
    /// Element offset of the first selected element.
    pub offset: usize,
    /// Dimensions of the input removed by indexing.
    pub removed: Vec<usize>,
    /// Whether any dynamic axis contributed to the offset.
    pub dynamic: bool,
}

impl Layout {
    /// Creates a contiguous row-major layout.
    #[inline]
    pub fn from_shape(shape: impl Into<Shape>) -> Self {
        let shape: Shape = shape.into();
        let stride = shape
            .iter()
            .rev()
            .scan(1, |p, &x| {
                let q = *p;
                *p *= x;
                Some(q)
            })
            .collect_vec();
        Self(shape.iter().copied().zip(stride.into_iter().rev()).collect())
    }

    /// Creates a layout from shape and stride.
    #[inline]
    pub fn from_shape_stride(
        shape: impl Into<Shape>,
        stride: impl Into<Stride>,
    ) -> Result<Self, LayoutError> {
        let shape: Shape = shape.into();
        let stride: Stride = stride.into();
        if shape.len() != stride.len() {
            return Err(LayoutError::Rank(shape, stride));
        }
        Ok(Self(shape.0.into_iter().zip(stride.0).collect()))
    }

    #[inline]
    pub fn modes(&self) -> &[(usize, usize)] {
        &self.0
    }

    /// Retrieves the shape of the layout.
    #[inline]
    pub fn shape(&self) -> Shape {
        Shape(self.0.iter().map(|&(x, _)| x).collect())
    }

    /// Retrieves the stride of the layout.
    #[inline]
    pub fn stride(&self) -> Stride {
        Stride(self.0.iter().map(|&(_, x)| x).collect())
    }

    /// Dimension of the layout.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the layout is of size 0.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of elements in the shape of the layout.
    #[inline]
    pub fn size(&self) -> usize {
        self.shape().size()
    }

    /// The co-domain of the layout mapping: one past the largest offset it produces.
    #[inline]
    pub fn co_size(&self) -> usize {
        match self.size() {
            0 => 0,
            _ => self.0.iter().map(|&(n, d)| (n - 1) * d).sum::<usize>() + 1,
        }
    }

    /// Maps a linear row-major index to a multi-dimensional coordinate.
    pub fn iota(&self, index: usize) -> Result<Coord, LayoutError> {
        match index < self.size() {
            true => Ok(self.unravel(index)),
            false => Err(LayoutError::Index(self.clone(), index)),
        }
    }

    /// Like [`Layout::iota`] but unchecked: the outermost mode is unbounded,
    /// so an index past the size lands past the co-domain instead of aliasing an element.
    #[inline]
    pub fn unravel(&self, index: usize) -> Coord {
        let mut coord = vec![0; self.len()];
        let mut p = 1;
        for (x, &(n, _)) in self.0.iter().enumerate().rev() {
            coord[x] = match x {
                0 => index / p,
                _ => (index / p) % n.max(1),
            };
            p *= n.max(1);
        }
        Coord(coord)
    }

    /// Returns `true` if two layouts are totally equal as index mappings.
    /// Note that this check visits every index so only use it in tests.
    #[inline]
    pub fn check_isomorphic(&self, other: &Layout) -> bool {
        if self.size() != other.size() {
            return false;
        }
        (0..self.size()).all(|index| self.value(index) == other.value(index))
    }

    /// Returns a simplified coalesce of the layout, merging modes that are contiguous
    /// with their faster neighbour and dropping unit modes.
    pub fn coalesced(&self) -> Self {
        let mut modes: Vec<(usize, usize)> = vec![];
        for &(n, d) in self.0.iter().filter(|&&(n, _)| n != 1) {
            match modes.last_mut() {
                Some((m, e)) if *e == n * d => {
                    *m *= n;
                    *e = d;
                }
                _ => modes.push((n, d)),
            }
        }
        Self(modes)
    }

    /// Returns `true` if the layout covers a dense row-major block.
    #[inline]
    pub fn is_contiguous(&self) -> bool {
        matches!(self.coalesced().0.as_slice(), [] | [(_, 1)])
    }

    /// Selects a sub-view. Static axes are bounds-checked; dynamic ones are trusted.
    pub fn slice(&self, slice: &Slice) -> Result<Sliced, LayoutError> {
        let error = || LayoutError::Slice(self.clone(), slice.clone());
        if slice.len() > self.len() {
            return Err(error());
        }

        let mut modes = vec![];
        let mut offset = 0;
        let mut removed = vec![];
        for (x, &(n, d)) in self.0.iter().enumerate() {
            let axis = slice.get(x).copied().unwrap_or_default();
            match axis {
                Axis::Full => modes.push((n, d)),
                Axis::One(index) | Axis::Dyn(index) => {
                    if !axis.is_dynamic() && index >= n {
                        return Err(error());
                    }
                    offset += index * d;
                    removed.push(x);
                }
                Axis::Range { start, len } | Axis::DynRange { start, len } => {
                    if len > n || (!axis.is_dynamic() && start + len > n) {
                        return Err(error());
                    }
                    offset += start * d;
                    modes.push((len, d));
                }
            }
        }

        let layout = Self(modes);
        let dynamic = slice.is_dynamic();
        Ok(Sliced {
            layout,
            offset,
            removed,
            dynamic,
        })
    }

    /// Removes a dimension of extent 1.
    pub fn squeeze(&self, dim: usize) -> Result<Self, LayoutError> {
        match self.0.get(dim) {
            None => Err(LayoutError::Dim(self.clone(), dim)),
            Some(&(1, _)) => {
                let mut modes = self.0.clone();
                modes.remove(dim);
                Ok(Self(modes))
            }
            Some(_) => Err(LayoutError::Squeeze(self.clone(), dim)),
        }
    }

    /// Inserts a dimension of extent 1 before `dim`.
    /// Its stride keeps it contiguous with the dimension it precedes.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self, LayoutError> {
        if dim > self.len() {
            return Err(LayoutError::Dim(self.clone(), dim));
        }
        let stride = self.0.get(dim).map_or(1, |&(n, d)| n * d);
        let mut modes = self.0.clone();
        modes.insert(dim, (1, stride));
        Ok(Self(modes))
    }

    /// Merges `rank` consecutive dimensions from `dim` into one.
    ///
    /// The merged dimensions must satisfy `stride[i] == stride[i + 1] * shape[i + 1]`
    /// (unit dimensions are exempt); otherwise no single stride describes the result.
    pub fn fold(&self, dim: usize, rank: usize) -> Result<Self, LayoutError> {
        let end = dim + rank;
        if rank == 0 || end > self.len() {
            return Err(LayoutError::Dim(self.clone(), end));
        }

        let modes = &self.0[dim..end];
        let contiguous = modes
            .iter()
            .filter(|&&(n, _)| n != 1)
            .tuple_windows()
            .all(|(&(_, d0), &(n1, d1))| d0 == n1 * d1);
        if !contiguous {
            return Err(LayoutError::Fold(self.clone(), dim, end));
        }

        let extent = modes.iter().map(|&(n, _)| n).product();
        let stride = modes
            .iter()
            .rev()
            .find(|&&(n, _)| n != 1)
            .or(modes.last())
            .map_or(1, |&(_, d)| d);

        let modes = [&self.0[..dim], &[(extent, stride)][..], &self.0[end..]].concat();
        Ok(Self(modes))
    }

    /// Splits dimension `dim` into `sizes`, at most one of which may be `None` and is inferred.
    pub fn unfold(&self, dim: usize, sizes: &[Option<usize>]) -> Result<Self, LayoutError> {
        let Some(&(extent, stride)) = self.0.get(dim) else {
            return Err(LayoutError::Dim(self.clone(), dim));
        };
        let error = || LayoutError::Unfold(extent, sizes.to_vec());

        let known: usize = sizes.iter().flatten().product();
        let sizes = match sizes.iter().filter(|x| x.is_none()).count() {
            _ if sizes.is_empty() => return Err(error()),
            0 if known == extent => sizes.iter().flatten().copied().collect_vec(),
            1 if known != 0 && extent % known == 0 => sizes
                .iter()
                .map(|x| x.unwrap_or(extent / known))
                .collect_vec(),
            _ => return Err(error()),
        };

        let strides = sizes
            .iter()
            .rev()
            .scan(stride, |p, &n| {
                let q = *p;
                *p *= n;
                Some(q)
            })
            .collect_vec();
        let unfolded = sizes.into_iter().zip(strides.into_iter().rev()).collect_vec();

        let modes = [&self.0[..dim], unfolded.as_slice(), &self.0[dim + 1..]].concat();
        Ok(Self(modes))
    }

    /// Regroups the trailing dimensions into `(outer..., tile...)` given a tiling that matches a suffix of the shape.
    pub fn tile(&self, tiling: &[usize]) -> Result<Self, LayoutError> {
        let error = || LayoutError::Tile(self.clone(), tiling.to_vec());
        if tiling.len() > self.len() {
            return Err(error());
        }

        let (untiled, tiled) = self.0.split_at(self.len() - tiling.len());
        if tiled
            .iter()
            .zip_eq(tiling)
            .any(|(&(n, _), &t)| t == 0 || n % t != 0)
        {
            return Err(error());
        }

        let outer = tiled
            .iter()
            .zip_eq(tiling)
            .map(|(&(n, d), &t)| (n / t, d * t))
            .collect_vec();
        let inner = tiled
            .iter()
            .zip_eq(tiling)
            .map(|(&(_, d), &t)| (t, d))
            .collect_vec();

        let modes = [untiled, outer.as_slice(), inner.as_slice()].concat();
        Ok(Self(modes))
    }

    /// Inverse of [`Layout::tile`] over the trailing `2 * rank` dimensions.
    pub fn untile(&self, rank: usize) -> Result<Self, LayoutError> {
        if 2 * rank > self.len() {
            return Err(LayoutError::Dim(self.clone(), 2 * rank));
        }

        let split = self.len() - 2 * rank;
        let (untiled, tiled) = self.0.split_at(split);
        let (outer, inner) = tiled.split_at(rank);

        let merged: Vec<_> = outer
            .iter()
            .zip_eq(inner)
            .map(|(&(n0, d0), &(n1, d1))| match n0 == 1 || d0 == n1 * d1 {
                true => Ok((n0 * n1, d1)),
                false => Err(LayoutError::Untile(self.clone())),
            })
            .try_collect()?;

        let modes = [untiled, merged.as_slice()].concat();
        Ok(Self(modes))
    }

    /// Permutes dimensions: dimension `x` of the result is dimension `perm[x]` of the input.
    pub fn transpose(&self, perm: &[usize]) -> Result<Self, LayoutError> {
        let valid =
            perm.len() == self.len() && perm.iter().copied().sorted().eq(0..self.len());
        if !valid {
            return Err(LayoutError::Transpose(self.len(), perm.to_vec()));
        }
        Ok(Self(perm.iter().map(|&x| self.0[x]).collect()))
    }
}

impl IndexFn<&[usize]> for Layout {
    #[inline]
    fn value(&self, index: &[usize]) -> usize {
        self.0
            .iter()
            .zip_eq(index.iter())
            .map(|(&(_, d), &x)| d * x)
            .sum()
    }
}

impl IndexFn<&Coord> for Layout {
    #[inline]
    fn value(&self, index: &Coord) -> usize {
        self.value(index.as_slice())
    }
}

impl IndexFn<Coord> for Layout {
    #[inline]
    fn value(&self, index: Coord) -> usize {
        self.value(index.as_slice())
    }
}

impl<const N: usize> IndexFn<[usize; N]> for Layout {
    #[inline]
    fn value(&self, index: [usize; N]) -> usize {
        self.value(index.as_slice())
    }
}

impl IndexFn<usize> for Layout {
    #[inline]
    fn value(&self, index: usize) -> usize {
        let coord = self.unravel(index);
        self.value(&coord)
    }
}

/// A bijective rewrite of a layout's index space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Transform {
    #[display("squeeze({_0})")]
    Squeeze(usize),
    #[display("unsqueeze({_0})")]
    Unsqueeze(usize),
    #[display("fold({dim}, {rank})")]
    Fold { dim: usize, rank: usize },
    #[display("unfold({dim}, {sizes:?})")]
    Unfold {
        dim: usize,
        sizes: Vec<Option<usize>>,
    },
    #[display("tile({_0:?})")]
    Tile(Vec<usize>),
    #[display("untile({_0})")]
    Untile(usize),
    #[display("transpose({_0:?})")]
    Transpose(Vec<usize>),
}

impl Transform {
    pub fn apply(&self, layout: &Layout) -> Result<Layout, LayoutError> {
        match self {
            Transform::Squeeze(dim) => layout.squeeze(*dim),
            Transform::Unsqueeze(dim) => layout.unsqueeze(*dim),
            Transform::Fold { dim, rank } => layout.fold(*dim, *rank),
            Transform::Unfold { dim, sizes } => layout.unfold(*dim, sizes),
            Transform::Tile(tiling) => layout.tile(tiling),
            Transform::Untile(rank) => layout.untile(*rank),
            Transform::Transpose(perm) => layout.transpose(perm),
        }
    }

    /// Returns the transform that undoes `self`, given the layout `self` is applied to.
    pub fn inverse(&self, input: &Layout) -> Result<Transform, LayoutError> {
        let shape = input.shape();
        let transform = match self {
            Transform::Squeeze(dim) => Transform::Unsqueeze(*dim),
            Transform::Unsqueeze(dim) => Transform::Squeeze(*dim),
            Transform::Fold { dim, rank } => {
                let sizes = shape
                    .get(*dim..dim + rank)
                    .ok_or_else(|| LayoutError::Dim(input.clone(), dim + rank))?;
                let sizes = sizes.iter().copied().map(Some).collect();
                Transform::Unfold { dim: *dim, sizes }
            }
            Transform::Unfold { dim, sizes } => Transform::Fold {
                dim: *dim,
                rank: sizes.len(),
            },
            Transform::Tile(tiling) => Transform::Untile(tiling.len()),
            Transform::Untile(rank) => {
                let tiling = shape
                    .len()
                    .checked_sub(*rank)
                    .and_then(|start| shape.get(start..))
                    .ok_or_else(|| LayoutError::Dim(input.clone(), *rank))?;
                Transform::Tile(tiling.to_vec())
            }
            Transform::Transpose(perm) => {
                let mut inverse = vec![0; perm.len()];
                for (x, &p) in perm.iter().enumerate() {
                    *inverse
                        .get_mut(p)
                        .ok_or_else(|| LayoutError::Transpose(input.len(), perm.clone()))? = x;
                }
                Transform::Transpose(inverse)
            }
        };
        Ok(transform)
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::{Coord, IndexFn, Layout, LayoutError, Transform};
    use crate::loom::{ErrorClass, slice::ds};

    #[test]
    fn test_iota() {
        let layout = Layout::from_shape([2, 3, 4]);
        assert_eq!(layout.stride().0, vec![12, 4, 1]);

        assert_eq!(layout.iota(0).unwrap(), Coord(vec![0, 0, 0]));
        assert_eq!(layout.iota(1).unwrap(), Coord(vec![0, 0, 1]));
        assert_eq!(layout.iota(4).unwrap(), Coord(vec![0, 1, 0]));
        assert_eq!(layout.iota(13).unwrap(), Coord(vec![1, 0, 1]));
        assert_eq!(layout.iota(23).unwrap(), Coord(vec![1, 2, 3]));

        // past the end is rejected, never wrapped onto an element
        let err = layout.iota(24).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Structural);
        assert_eq!(layout.unravel(24), Coord(vec![2, 0, 0]));
        assert_eq!(layout.value(24), 24);

        assert!((0..24usize).all(|index| layout.value(index) == index));
        assert_eq!(layout.co_size(), 24);

        let layout = Layout::from_shape_stride([2, 3], [1, 2]).unwrap();
        assert_eq!(layout.value([1, 2]), 5);
        assert!(!layout.is_contiguous());
        assert!(Layout::from_shape_stride([2, 3], [1]).is_err());
    }

    #[test]
    fn test_coalesce() {
        fn check(layout: Layout) {
            let coalesced = layout.coalesced();
            println!("{layout} → {coalesced}");
            assert!(layout.check_isomorphic(&coalesced))
        }

        check(Layout::from_shape([2, 4]));
        check(Layout::from_shape([2, 4, 6]));
        check(Layout::from_shape([2, 1, 6, 2]));
        check(Layout::from_shape_stride([2, 1, 6], [6, 7, 1]).unwrap());
        check(Layout::from_shape_stride([2, 4, 6], [1, 8, 2]).unwrap());
        check(Layout::from_shape_stride([3, 1, 2], [2, 1, 1]).unwrap());

        assert_eq!(
            Layout::from_shape([2, 4, 6]).coalesced(),
            Layout::from_shape([48])
        );
        assert!(Layout::from_shape([2, 1, 6]).is_contiguous());
    }

    #[test]
    fn test_slice() -> Result<(), LayoutError> {
        let layout = Layout::from_shape([8, 8, 128]);

        let sliced = layout.slice(&(1usize, ds(2, 4)).into())?;
        assert_eq!(sliced.layout, Layout::from_shape_stride([4, 128], [128, 1])?);
        assert_eq!(sliced.offset, 1024 + 256);
        assert_eq!(sliced.removed, vec![0]);
        assert!(!sliced.dynamic);

        let sliced = layout.slice(&(.., .., 5usize).into())?;
        assert_eq!(sliced.layout.shape().0, vec![8, 8]);
        assert_eq!(sliced.removed, vec![2]);

        assert!(layout.slice(&8usize.into()).is_err());
        assert!(layout.slice(&(ds(6, 4)).into()).is_err());
        assert!(layout.slice(&(0usize, 0usize, 0usize, 0usize).into()).is_err());

        // dynamic starts are trusted
        let sliced = layout.slice(&crate::loom::slice::dyn_ds(6, 4).into())?;
        assert!(sliced.dynamic);
        assert_eq!(sliced.offset, 6 * 1024);
        Ok(())
    }

    #[test]
    fn test_fold() -> Result<(), LayoutError> {
        let cases = [
            ("packed", vec![4, 4, 4], vec![16, 4, 1], 1, 2, false),
            ("strided_end", vec![4, 4, 4, 4], vec![256, 64, 16, 4], 1, 2, false),
            ("strided_bot", vec![4, 4, 4, 4], vec![256, 16, 4, 1], 1, 2, false),
            ("strided_top", vec![4, 4, 4, 4], vec![256, 64, 4, 1], 1, 2, true),
            ("strided_mid", vec![4, 4, 4, 4], vec![265, 64, 16, 1], 1, 3, true),
            ("overlap", vec![2, 4, 4], vec![16, 1, 1], 0, 3, true),
        ];
        for (name, shape, stride, dim, rank, not_implemented) in cases {
            let layout = Layout::from_shape_stride(shape.clone(), stride)?;
            let transform = Transform::Fold { dim, rank };
            match transform.apply(&layout) {
                Ok(folded) => {
                    assert!(!not_implemented, "{name}: fold must fail");
                    let extent: usize = shape[dim..dim + rank].iter().product();
                    assert_eq!(folded.shape()[dim], extent, "{name}");

                    let inverse = transform.inverse(&layout)?;
                    let unfolded = inverse.apply(&folded)?;
                    assert_eq!(unfolded.shape(), layout.shape(), "{name}");
                    assert!(unfolded.check_isomorphic(&layout), "{name}");
                }
                Err(err) => {
                    assert!(not_implemented, "{name}: {err}");
                    assert_eq!(err.class(), ErrorClass::NotImplemented, "{name}");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_unfold() -> Result<(), LayoutError> {
        let layout = Layout::from_shape([4, 8, 12]);
        for dim in 0..3 {
            let unfolded = layout.unfold(dim, &[Some(2), Some(2), None])?;
            let mut shape = layout.shape().0;
            let extent = shape.remove(dim);
            shape.splice(dim..dim, [2, 2, extent / 4]);
            assert_eq!(unfolded.shape().0, shape);
            assert!(unfolded.check_isomorphic(&layout));
        }

        let layout = Layout::from_shape_stride([12, 5], [10, 2])?;
        let unfolded = layout.unfold(0, &[None, Some(3)])?;
        assert_eq!(unfolded, Layout::from_shape_stride([4, 3, 5], [30, 10, 2])?);

        assert!(layout.unfold(0, &[Some(5), None]).is_err());
        assert!(layout.unfold(0, &[None, None]).is_err());
        assert!(layout.unfold(0, &[Some(2), Some(2)]).is_err());
        assert!(layout.unfold(0, &[]).is_err());
        Ok(())
    }

    #[test]
    fn test_unsqueeze() -> Result<(), LayoutError> {
        let layout = Layout::from_shape_stride([2, 3, 4], [24, 8, 1])?;
        for dim in 0..=layout.len() {
            let unsqueezed = layout.unsqueeze(dim)?;
            assert_eq!(unsqueezed.len(), 4);
            assert_eq!(unsqueezed.shape()[dim], 1);
            assert!(unsqueezed.check_isomorphic(&layout));
            assert_eq!(unsqueezed.squeeze(dim)?, layout);
        }
        assert!(layout.unsqueeze(4).is_err());
        assert!(layout.squeeze(0).is_err());
        Ok(())
    }

    #[test]
    fn test_tile() -> Result<(), LayoutError> {
        let layout = Layout::from_shape([5, 32, 128]);
        let tiled = layout.tile(&[32, 64])?;
        assert_eq!(tiled.shape().0, vec![5, 1, 2, 32, 64]);

        for (b, j, r, c) in itertools::iproduct!(0..5, 0..2, 0..32, 0..64) {
            let expected = layout.value([b, r, j * 64 + c]);
            assert_eq!(tiled.value([b, 0, j, r, c]), expected);
        }

        let untiled = Transform::Tile(vec![32, 64])
            .inverse(&layout)?
            .apply(&tiled)?;
        assert_eq!(untiled, layout);

        assert!(layout.tile(&[3, 64]).is_err());
        assert!(layout.tile(&[1, 1, 1, 1]).is_err());
        Ok(())
    }

    #[test]
    fn test_transpose() -> Result<(), LayoutError> {
        let layout = Layout::from_shape([2, 3, 4]);
        let perm = vec![2, 0, 1];
        let transform = Transform::Transpose(perm);
        let transposed = transform.apply(&layout)?;
        assert_eq!(transposed.shape().0, vec![4, 2, 3]);
        assert_eq!(transposed.value([3, 1, 2]), layout.value([1, 2, 3]));

        let restored = transform.inverse(&layout)?.apply(&transposed)?;
        assert_eq!(restored, layout);

        assert!(layout.transpose(&[0, 0, 1]).is_err());
        assert!(layout.transpose(&[0, 1]).is_err());
        Ok(())
    }

    #[test]
    fn test_transform_inverse() -> Result<(), LayoutError> {
        let layout = Layout::from_shape_stride([4, 6, 8], [96, 16, 2])?;
        let transforms = [
            Transform::Unsqueeze(1),
            Transform::Fold { dim: 1, rank: 2 },
            Transform::Unfold {
                dim: 2,
                sizes: vec![None, Some(4)],
            },
            Transform::Tile(vec![2, 4]),
            Transform::Transpose(vec![1, 2, 0]),
        ];
        for transform in transforms {
            let output = transform.apply(&layout)?;
            let inverse = transform.inverse(&layout)?;
            let restored = inverse.apply(&output)?;
            println!("{layout} → {transform} → {output} → {inverse} → {restored}");
            assert_eq!(restored.shape(), layout.shape());
            assert!(restored.check_isomorphic(&layout));
        }

        let offsets = (0..layout.size()).map(|x| layout.value(x)).collect_vec();
        assert!(offsets.iter().all_unique());
        Ok(())
    }
}
