use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use derive_more::Display;
use half::{bf16, f16};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    ErrorClass,
    layout::{IndexFn, Layout, LayoutError, Shape, Sliced, Transform},
    num::{DataType, Number, Scalar},
    slice::{Axis, Slice},
    swizzle::Swizzle,
};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory type error: data type {0} mismatches {1}")]
    Type(DataType, DataType),
    #[error("memory size error: {0} elements mismatch {1} values")]
    Size(usize, usize),
    #[error("memory shape error: shape {0} mismatches {1}")]
    Shape(Shape, Shape),
    #[error(
        "memory bounds error: layout {layout} at offset {offset} exceeds allocation of {len} elements"
    )]
    Bounds {
        layout: Layout,
        offset: usize,
        len: usize,
        dynamic: bool,
    },
    #[error("memory arithmetic error: accumulating {0} values overflows")]
    Overflow(DataType),
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

impl MemoryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MemoryError::Bounds { dynamic: true, .. } | MemoryError::Overflow(_) => {
                ErrorClass::Runtime
            }
            MemoryError::Layout(err) => err.class(),
            _ => ErrorClass::Structural,
        }
    }
}

/// Memory tiers a view can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MemorySpace {
    /// Device-global (HBM) memory, also where kernel operands live.
    Global,
    /// On-chip memory shared by the lane group (SMEM on GPUs, VMEM on TPUs).
    Shared,
    /// Scalar memory for indices and small control values.
    Scalar,
    /// Lane registers. Never addressed by views directly, see `FragmentedArray`.
    Register,
}

impl MemorySpace {
    /// Returns `true` if hardware tiles the two minor-most dimensions of buffers in this space.
    #[inline]
    pub const fn is_tiled(self) -> bool {
        matches!(self, MemorySpace::Global | MemorySpace::Shared)
    }

    /// Returns `true` if asynchronous copies can address this space.
    #[inline]
    pub const fn is_addressable(self) -> bool {
        !matches!(self, MemorySpace::Register)
    }
}

/// Name of an allocation, identical on every device running the same kernel.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Symbol(pub u64);

impl Symbol {
    /// The per-kernel barrier semaphore.
    pub const BARRIER: Self = Self(0);
    /// Buffers created outside of any kernel.
    pub const HOST: Self = Self(u64::MAX);
}

/// A flat allocation of elements of one data type in one memory space.
#[derive(Debug, Clone)]
pub struct Buffer {
    symbol: Symbol,
    space: MemorySpace,
    shape: Shape,
    r#type: DataType,
    data: Arc<RwLock<Box<[u8]>>>,
}

impl Buffer {
    /// Creates a zeroed buffer.
    pub fn new(
        symbol: Symbol,
        space: MemorySpace,
        shape: impl Into<Shape>,
        r#type: DataType,
    ) -> Self {
        let shape: Shape = shape.into();
        let data = vec![0u8; shape.size() * r#type.size()].into_boxed_slice();
        let data = Arc::new(RwLock::new(data));
        Self {
            symbol,
            space,
            shape,
            r#type,
            data,
        }
    }

    /// Creates a buffer holding a copy of `host`.
    pub fn from_host(symbol: Symbol, space: MemorySpace, host: &HostBuffer) -> Self {
        let shape = host.shape.clone();
        let r#type = host.r#type;
        let data = Arc::new(RwLock::new(host.data.clone().into_boxed_slice()));
        Self {
            symbol,
            space,
            shape,
            r#type,
            data,
        }
    }

    #[inline]
    pub fn symbol(&self) -> Symbol {
        self.symbol
    }

    #[inline]
    pub fn space(&self) -> MemorySpace {
        self.space
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.shape.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.len() * self.r#type.size()
    }

    /// Returns `true` if both handles point to the same allocation.
    #[inline]
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// A full view of the buffer.
    pub fn view(&self) -> View {
        let layout = Layout::from_shape(self.shape.clone());
        let rank = layout.len();
        let minor = (0..rank).map(|x| x + 2 >= rank).collect();
        View {
            buffer: self.clone(),
            layout,
            offset: 0,
            dynamic: false,
            minor,
            collapsed: false,
        }
    }

    /// Copies the contents out to the host.
    pub fn to_host(&self) -> HostBuffer {
        let shape = self.shape.clone();
        let r#type = self.r#type;
        let data = self.read().to_vec();
        HostBuffer {
            shape,
            r#type,
            data,
        }
    }
}

/// A strided window into a [`Buffer`]. Views never own memory.
#[derive(Debug, Clone)]
pub struct View {
    buffer: Buffer,
    layout: Layout,
    /// Element offset of the first element.
    offset: usize,
    /// Whether a dynamic axis contributed to the offset.
    dynamic: bool,
    /// Per dimension: whether it derives from one of the buffer's two minor-most dimensions.
    minor: Vec<bool>,
    /// Whether a tiled minor dimension has been indexed away.
    collapsed: bool,
}

impl View {
    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.layout.shape()
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.buffer.r#type
    }

    #[inline]
    pub fn space(&self) -> MemorySpace {
        self.buffer.space
    }

    #[inline]
    pub fn symbol(&self) -> Symbol {
        self.buffer.symbol
    }

    /// Number of elements in the view.
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Returns `true` if a hardware-tiled minor dimension was squeezed or indexed away.
    #[inline]
    pub fn is_collapsed(&self) -> bool {
        self.collapsed
    }

    /// Rebinds the view's addressing onto another buffer of the same shape and type.
    pub fn rebind(&self, buffer: Buffer) -> Result<Self, MemoryError> {
        if buffer.shape != self.buffer.shape {
            return Err(MemoryError::Shape(
                buffer.shape.clone(),
                self.buffer.shape.clone(),
            ));
        }
        if buffer.r#type != self.buffer.r#type {
            return Err(MemoryError::Type(buffer.r#type, self.buffer.r#type));
        }
        Ok(Self {
            buffer,
            ..self.clone()
        })
    }

    /// Checks the view against its allocation.
    pub fn check_bounds(&self) -> Result<(), MemoryError> {
        match self.layout.co_size() {
            0 => Ok(()),
            x if self.offset + x <= self.buffer.len() => Ok(()),
            _ => Err(MemoryError::Bounds {
                layout: self.layout.clone(),
                offset: self.offset,
                len: self.buffer.len(),
                dynamic: self.dynamic,
            }),
        }
    }

    /// Element offsets into the buffer, in row-major order of the view.
    pub fn offsets(&self) -> Vec<usize> {
        (0..self.len())
            .map(|index| self.offset + self.layout.value(index))
            .collect()
    }

    /// Element offsets after swizzling their position within the allocation.
    /// The allocation must hold whole swizzle rows so every offset stays inside it.
    pub fn swizzled_offsets(&self, swizzle: Option<Swizzle>) -> Result<Vec<usize>, MemoryError> {
        let r#type = self.data_type();
        let offsets = self.offsets();
        match swizzle {
            Some(swizzle) => {
                swizzle.check(self.buffer.len(), r#type)?;
                Ok(offsets
                    .into_iter()
                    .map(|offset| swizzle.apply(offset, r#type))
                    .collect())
            }
            None => Ok(offsets),
        }
    }

    /// Selects a sub-view. Static out-of-range selections fail here; dynamic ones when touched.
    pub fn slice(&self, slice: impl Into<Slice>) -> Result<Self, MemoryError> {
        let slice: Slice = slice.into();
        let Sliced {
            layout,
            offset,
            removed,
            dynamic,
        } = self.layout.slice(&slice)?;

        let collapsed = self.collapsed
            || (self.space().is_tiled() && removed.iter().any(|&x| self.minor[x]));
        let minor = self
            .minor
            .iter()
            .enumerate()
            .filter(|(x, _)| !removed.contains(x))
            .map(|(_, &minor)| minor)
            .collect();

        let view = Self {
            buffer: self.buffer.clone(),
            layout,
            offset: self.offset + offset,
            dynamic: self.dynamic || dynamic,
            minor,
            collapsed,
        };
        if !view.dynamic {
            view.check_bounds()?;
        }
        Ok(view)
    }

    /// Indexes the leading dimension.
    #[inline]
    pub fn at(&self, index: usize) -> Result<Self, MemoryError> {
        self.slice(Axis::One(index))
    }

    /// Applies a layout transform, keeping track of which dimensions are hardware-tiled.
    pub fn transform(&self, transform: &Transform) -> Result<Self, MemoryError> {
        let layout = transform.apply(&self.layout)?;
        let mut minor = self.minor.clone();
        let mut collapsed = self.collapsed;

        match transform {
            Transform::Squeeze(dim) => {
                let removed = minor.remove(*dim);
                collapsed |= removed && self.space().is_tiled();
            }
            Transform::Unsqueeze(dim) => minor.insert(*dim, false),
            Transform::Fold { dim, rank } => {
                let merged = minor[*dim..dim + rank].iter().any(|&x| x);
                minor.splice(*dim..dim + rank, [merged]);
            }
            Transform::Unfold { dim, sizes } => {
                let split = minor[*dim];
                minor.splice(*dim..=*dim, std::iter::repeat_n(split, sizes.len()));
            }
            Transform::Tile(tiling) => {
                let split = minor.len() - tiling.len();
                let tiled = minor[split..].to_vec();
                minor.extend(tiled);
            }
            Transform::Untile(rank) => {
                let split = minor.len() - 2 * rank;
                let merged = minor[split..split + rank]
                    .iter()
                    .zip_eq(&minor[split + rank..])
                    .map(|(&x, &y)| x || y)
                    .collect_vec();
                minor.truncate(split);
                minor.extend(merged);
            }
            Transform::Transpose(perm) => minor = perm.iter().map(|&x| minor[x]).collect(),
        }

        Ok(Self {
            buffer: self.buffer.clone(),
            layout,
            minor,
            collapsed,
            ..self.clone()
        })
    }

    #[inline]
    pub fn squeeze(&self, dim: usize) -> Result<Self, MemoryError> {
        self.transform(&Transform::Squeeze(dim))
    }

    #[inline]
    pub fn unsqueeze(&self, dim: usize) -> Result<Self, MemoryError> {
        self.transform(&Transform::Unsqueeze(dim))
    }

    #[inline]
    pub fn fold(&self, dim: usize, rank: usize) -> Result<Self, MemoryError> {
        self.transform(&Transform::Fold { dim, rank })
    }

    #[inline]
    pub fn unfold(&self, dim: usize, sizes: &[Option<usize>]) -> Result<Self, MemoryError> {
        let sizes = sizes.to_vec();
        self.transform(&Transform::Unfold { dim, sizes })
    }

    #[inline]
    pub fn tile(&self, tiling: &[usize]) -> Result<Self, MemoryError> {
        self.transform(&Transform::Tile(tiling.to_vec()))
    }

    #[inline]
    pub fn untile(&self, rank: usize) -> Result<Self, MemoryError> {
        self.transform(&Transform::Untile(rank))
    }

    #[inline]
    pub fn transpose(&self, perm: &[usize]) -> Result<Self, MemoryError> {
        self.transform(&Transform::Transpose(perm.to_vec()))
    }

    fn check_offsets(&self, offsets: &[usize]) -> Result<(), MemoryError> {
        match offsets.iter().max() {
            Some(&max) if max >= self.buffer.len() => Err(MemoryError::Bounds {
                layout: self.layout.clone(),
                offset: max,
                len: self.buffer.len(),
                dynamic: self.dynamic,
            }),
            _ => Ok(()),
        }
    }

    /// Reads the buffer elements at `offsets`, concatenating their bytes.
    pub fn read_offsets(&self, offsets: &[usize]) -> Result<Vec<u8>, MemoryError> {
        self.check_offsets(offsets)?;
        let size = self.data_type().size();
        let data = self.buffer.read();
        Ok(offsets
            .iter()
            .flat_map(|&offset| &data[offset * size..(offset + 1) * size])
            .copied()
            .collect())
    }

    /// Writes consecutive elements of `bytes` to the buffer elements at `offsets`.
    pub fn write_offsets(&self, offsets: &[usize], bytes: &[u8]) -> Result<(), MemoryError> {
        let size = self.data_type().size();
        if offsets.len() * size != bytes.len() {
            return Err(MemoryError::Size(offsets.len(), bytes.len() / size));
        }
        self.check_offsets(offsets)?;
        let mut data = self.buffer.write();
        for (&offset, bytes) in offsets.iter().zip_eq(bytes.chunks_exact(size)) {
            data[offset * size..(offset + 1) * size].copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Reads all elements as raw bytes in row-major order.
    pub fn gather(&self) -> Result<Vec<u8>, MemoryError> {
        self.check_bounds()?;
        self.read_offsets(&self.offsets())
    }

    /// Writes raw bytes of all elements in row-major order.
    pub fn scatter(&self, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check_bounds()?;
        self.write_offsets(&self.offsets(), bytes)
    }

    fn check_type<T: Scalar>(&self) -> Result<(), MemoryError> {
        match self.data_type() {
            x if x == T::DATA_TYPE => Ok(()),
            x => Err(MemoryError::Type(x, T::DATA_TYPE)),
        }
    }

    /// Reads the view's elements in row-major order.
    pub fn load<T: Scalar>(&self) -> Result<Vec<T>, MemoryError> {
        self.check_type::<T>()?;
        let bytes = self.gather()?;
        Ok(bytemuck::allocation::pod_collect_to_vec(&bytes))
    }

    /// Writes the view's elements in row-major order.
    pub fn store<T: Scalar>(&self, values: &[T]) -> Result<(), MemoryError> {
        self.check_type::<T>()?;
        if values.len() != self.len() {
            return Err(MemoryError::Size(self.len(), values.len()));
        }
        self.scatter(bytemuck::cast_slice(values))
    }

    pub fn fill<T: Scalar>(&self, value: T) -> Result<(), MemoryError> {
        self.store(&vec![value; self.len()])
    }

    /// Adds `other` into `self` elementwise, in the view's own data type.
    ///
    /// Integer sums that overflow fail with [`MemoryError::Overflow`] and leave `self` untouched.
    pub fn accumulate(&self, other: &View) -> Result<(), MemoryError> {
        fn add<T: Number>(x: &View, y: &View) -> Result<(), MemoryError> {
            let lhs = x.load::<T>()?;
            let rhs = y.load::<T>()?;
            if lhs.len() != rhs.len() {
                return Err(MemoryError::Size(lhs.len(), rhs.len()));
            }
            let sum = lhs
                .into_iter()
                .zip(rhs)
                .map(|(x, y)| x.checked_add(y))
                .collect::<Option<Vec<_>>>()
                .ok_or(MemoryError::Overflow(T::DATA_TYPE))?;
            x.store(&sum)
        }

        if self.data_type() != other.data_type() {
            return Err(MemoryError::Type(self.data_type(), other.data_type()));
        }
        match self.data_type() {
            DataType::F32 => add::<f32>(self, other),
            DataType::F16 => add::<f16>(self, other),
            DataType::BF16 => add::<bf16>(self, other),
            DataType::I32 => add::<i32>(self, other),
            DataType::U32 => add::<u32>(self, other),
            DataType::U8 => add::<u8>(self, other),
        }
    }
}

/// A lane-cooperative synchronous copy between views of equal shape.
///
/// With a swizzle, element `i` (row-major) of `src` lands at the swizzled position of `i` in `dst`,
/// so the same copy applied twice restores the original order.
pub fn copy(src: &View, dst: &View, swizzle: Option<Swizzle>) -> Result<(), MemoryError> {
    if src.shape() != dst.shape() {
        return Err(MemoryError::Shape(src.shape(), dst.shape()));
    }
    if src.data_type() != dst.data_type() {
        return Err(MemoryError::Type(src.data_type(), dst.data_type()));
    }
    dst.check_bounds()?;

    let r#type = dst.data_type();
    let contiguous = Layout::from_shape(dst.shape());
    if let Some(swizzle) = swizzle {
        swizzle.check(contiguous.size(), r#type)?;
    }

    let bytes = src.gather()?;
    let offsets = (0..contiguous.size())
        .map(|index| match swizzle {
            Some(swizzle) => swizzle.apply(index, r#type),
            None => index,
        })
        .map(|index| Ok(dst.offset + dst.layout.value(&contiguous.iota(index)?)))
        .collect::<Result<Vec<_>, LayoutError>>()?;
    dst.write_offsets(&offsets, &bytes)
}

/// Host-side contents of a buffer, used to hand operands into and out of kernels.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HostBuffer {
    shape: Shape,
    r#type: DataType,
    #[cfg_attr(feature = "serde", serde(with = "serde_bytes"))]
    data: Vec<u8>,
}

impl HostBuffer {
    pub fn from_slice<T: Scalar>(shape: impl Into<Shape>, data: &[T]) -> Result<Self, MemoryError> {
        let shape: Shape = shape.into();
        if shape.size() != data.len() {
            return Err(MemoryError::Size(shape.size(), data.len()));
        }
        let r#type = T::DATA_TYPE;
        let data = bytemuck::cast_slice(data).to_vec();
        Ok(Self {
            shape,
            r#type,
            data,
        })
    }

    pub fn zeros(shape: impl Into<Shape>, r#type: DataType) -> Self {
        let shape: Shape = shape.into();
        let data = vec![0; shape.size() * r#type.size()];
        Self {
            shape,
            r#type,
            data,
        }
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>, MemoryError> {
        match self.r#type {
            x if x == T::DATA_TYPE => Ok(bytemuck::allocation::pod_collect_to_vec(&self.data)),
            x => Err(MemoryError::Type(x, T::DATA_TYPE)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{Buffer, HostBuffer, MemoryError, MemorySpace, Symbol, View, copy};
    use crate::loom::{
        ErrorClass,
        layout::LayoutError,
        num::DataType,
        slice::{Axis, ds, dyn_ds},
        swizzle::Swizzle,
    };

    fn arange(space: MemorySpace, shape: &[usize]) -> Result<View, Box<dyn Error>> {
        let size = shape.iter().product::<usize>();
        let data = (0..size).map(|x| x as f32).collect_vec();
        let host = HostBuffer::from_slice(shape.to_vec(), &data)?;
        Ok(Buffer::from_host(Symbol::HOST, space, &host).view())
    }

    fn zeros(space: MemorySpace, shape: &[usize]) -> View {
        Buffer::new(Symbol::HOST, space, shape.to_vec(), DataType::F32).view()
    }

    #[test]
    fn test_copy_swizzle() -> Result<(), Box<dyn Error>> {
        let x = arange(MemorySpace::Global, &[8, 32])?;
        let smem = zeros(MemorySpace::Shared, &[8, 32]);
        let y = zeros(MemorySpace::Global, &[8, 32]);

        copy(&x, &smem, None)?;
        copy(&smem, &y, Some(Swizzle::B128))?;

        let x = x.load::<f32>()?;
        let y = y.load::<f32>()?;
        for (i, j) in itertools::iproduct!(0..8, 0..8) {
            let k = j ^ i;
            assert_eq!(y[i * 32 + j * 4..][..4], x[i * 32 + k * 4..][..4]);
        }
        Ok(())
    }

    #[test]
    fn test_copy_swizzle_noop() -> Result<(), Box<dyn Error>> {
        for shape in [vec![8, 32], vec![16, 64], vec![4, 8, 64]] {
            let x = arange(MemorySpace::Global, &shape)?;
            let smem = zeros(MemorySpace::Shared, &shape);
            let y = zeros(MemorySpace::Global, &shape);

            copy(&x, &smem, Some(Swizzle::B128))?;
            copy(&smem, &y, Some(Swizzle::B128))?;
            assert_eq!(x.load::<f32>()?, y.load::<f32>()?);
        }
        Ok(())
    }

    #[test]
    fn test_copy_swizzle_extent() -> Result<(), Box<dyn Error>> {
        // 72 f32 elements end in a partial 128-byte row
        let x = arange(MemorySpace::Global, &[72])?;
        let y = zeros(MemorySpace::Shared, &[72]);
        let err = copy(&x, &y, Some(Swizzle::B128)).unwrap_err();
        assert!(matches!(err, MemoryError::Layout(LayoutError::SwizzleExtent(72, DataType::F32, 128))));
        assert_eq!(err.class(), ErrorClass::Structural);
        // nothing was written
        assert!(y.load::<f32>()?.iter().all(|&v| v == 0.0));

        // whole rows short of a full tile still form a permutation
        let x = arange(MemorySpace::Global, &[64])?;
        let y = zeros(MemorySpace::Shared, &[64]);
        copy(&x, &y, Some(Swizzle::B128))?;
        let mut y = y.load::<f32>()?;
        y.sort_by(f32::total_cmp);
        assert_eq!(y, x.load::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_copy_shape() {
        let x = zeros(MemorySpace::Global, &[8, 32]);
        let y = zeros(MemorySpace::Global, &[32, 8]);
        let err = copy(&x, &y, None).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Structural);
    }

    #[test]
    fn test_view_slice() -> Result<(), Box<dyn Error>> {
        let x = arange(MemorySpace::Global, &[8, 8, 128])?;

        let row = x.slice((1usize, ds(2, 3)))?;
        assert_eq!(row.shape().0, vec![3, 128]);
        assert_eq!(row.load::<f32>()?[0], (1024 + 256) as f32);
        assert!(!row.is_collapsed());

        let column = x.slice((.., .., 0usize))?;
        assert_eq!(column.shape().0, vec![8, 8]);
        assert!(column.is_collapsed());

        let plane = x.at(3)?;
        assert!(!plane.is_collapsed());
        assert!(plane.at(4)?.is_collapsed());
        assert!(!plane.slice(ds(4, 1))?.is_collapsed());

        // scalar memory is not tiled
        let scalars = arange(MemorySpace::Scalar, &[4, 4])?;
        assert!(!scalars.slice((.., 1usize))?.is_collapsed());

        assert!(x.slice(Axis::One(8)).is_err());
        Ok(())
    }

    #[test]
    fn test_view_dynamic_bounds() -> Result<(), Box<dyn Error>> {
        let x = arange(MemorySpace::Global, &[8, 128])?;

        let view = x.slice(dyn_ds(6, 4))?;
        assert!(view.is_dynamic());
        let err = view.load::<f32>().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Runtime);

        let view = x.slice(dyn_ds(4, 4))?;
        assert_eq!(view.load::<f32>()?[0], 512.0);
        Ok(())
    }

    #[test]
    fn test_view_transform() -> Result<(), Box<dyn Error>> {
        let x = arange(MemorySpace::Shared, &[4, 8, 32])?;

        let folded = x.fold(0, 2)?;
        assert_eq!(folded.shape().0, vec![32, 32]);
        assert_eq!(folded.load::<f32>()?, x.load::<f32>()?);

        let tiled = x.tile(&[4, 16])?;
        assert_eq!(tiled.shape().0, vec![4, 2, 2, 4, 16]);
        let values = tiled.at(1)?.at(1)?.at(0)?.load::<f32>()?;
        assert_eq!(values[0], (256 + 4 * 32) as f32);
        assert_eq!(values[16], (256 + 5 * 32) as f32);

        let restored = tiled.untile(2)?;
        assert_eq!(restored.load::<f32>()?, x.load::<f32>()?);

        let transposed = x.transpose(&[0, 2, 1])?;
        assert_eq!(transposed.load::<f32>()?[1], 32.0);

        let unit = x.unsqueeze(3)?;
        assert!(!unit.squeeze(3)?.is_collapsed());
        let lane = x.slice((.., .., ds(0, 1)))?;
        assert!(lane.squeeze(2)?.is_collapsed());
        Ok(())
    }

    #[test]
    fn test_view_accumulate() -> Result<(), Box<dyn Error>> {
        let x = arange(MemorySpace::Shared, &[4, 4])?;
        let y = arange(MemorySpace::Shared, &[4, 4])?;
        x.accumulate(&y)?;
        let expected = (0..16).map(|x| 2.0 * x as f32).collect_vec();
        assert_eq!(x.load::<f32>()?, expected);

        let z = Buffer::new(Symbol::HOST, MemorySpace::Shared, [4, 4], DataType::I32).view();
        assert!(x.accumulate(&z).is_err());
        assert!(x.store(&[0.0f32; 3]).is_err());
        assert!(x.load::<i32>().is_err());

        let host = HostBuffer::from_slice([2, 2], &[1i32, 2, 3, 4])?;
        assert_eq!(host.to_vec::<i32>()?, vec![1, 2, 3, 4]);
        assert!(HostBuffer::from_slice([2, 3], &[1i32]).is_err());
        Ok(())
    }

    #[test]
    fn test_accumulate_overflow() -> Result<(), Box<dyn Error>> {
        let load = |data: &[u8]| -> Result<View, Box<dyn Error>> {
            let host = HostBuffer::from_slice([4], data)?;
            Ok(Buffer::from_host(Symbol::HOST, MemorySpace::Shared, &host).view())
        };
        let x = load(&[1, 2, 250, 4])?;
        let y = load(&[1, 1, 6, 1])?;
        let err = x.accumulate(&y).unwrap_err();
        assert!(matches!(err, MemoryError::Overflow(DataType::U8)));
        assert_eq!(err.class(), ErrorClass::Runtime);
        assert_eq!(x.load::<u8>()?, vec![1, 2, 250, 4]);

        let y = load(&[1, 1, 5, 1])?;
        x.accumulate(&y)?;
        assert_eq!(x.load::<u8>()?, vec![2, 3, 255, 5]);
        Ok(())
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_host_buffer_serde() -> Result<(), Box<dyn Error>> {
        let host = HostBuffer::from_slice([2, 2], &[1.0f32, 2.0, 3.0, 4.0])?;
        let json = serde_json::to_string(&host)?;
        assert!(json.contains("\"type\":\"F32\""));
        let back: HostBuffer = serde_json::from_str(&json)?;
        assert_eq!(back, host);
        Ok(())
    }
}
