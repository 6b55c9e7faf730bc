//! Fragmented register arrays: logical tensors distributed over the lanes of a warpgroup.
//!
//! Every element of a [`FragmentedArray`] lives in one register slot of one lane, as named by
//! its [`FragLayout`]. Arrays are values; every operation produces a new array.

use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;

use crate::loom::{
    ErrorClass,
    layout::{IndexFn, Layout, Shape},
    num::{DataType, Scalar},
    swizzle::Swizzle,
    view::{MemoryError, MemorySpace, View},
};

mod layout;
mod ops;
mod wgmma;

pub use layout::FragLayout;
pub use ops::{CompareOp, ReduceOp};
pub use wgmma::{PendingWgmma, WgmmaAccumulator, WgmmaOrder, wgmma, wgmma_registers};
pub(crate) use wgmma::{WgmmaQueue, issue as issue_wgmma};

#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("fragment shape error: shape {1} cannot be laid out as {0}")]
    Shape(FragLayout, Shape),
    #[error("fragment layout error: operands are laid out as {0} and {1}")]
    LayoutMismatch(FragLayout, FragLayout),
    #[error("fragment shape error: operand shapes {0} and {1} mismatch")]
    ShapeMismatch(Shape, Shape),
    #[error("fragment reduce error: reducing {0} along axis {1} is not implemented")]
    Reduce(FragLayout, usize),
    #[error("fragment tiling error: expected a tiled view of shape {0}, found {1}")]
    Tiling(Shape, Shape),
    #[error("Transpose only supported in 16-bit WGMMA")]
    Transpose,
    #[error("fragment register error: register operands of type {0} are not supported")]
    RegisterType(DataType),
    #[error("fragment type error: matrix instructions do not take {0} operands")]
    Type(DataType),
    #[error("fragment type error: operand types {0} and {1} mismatch")]
    TypeMismatch(DataType, DataType),
    #[error("fragment space error: matrix operands must live in shared memory, found {0}")]
    Space(MemorySpace),
    #[error("fragment wgmma error: the group of this matrix operation has not been waited")]
    Pending,
    #[error("fragment arithmetic error: {0} of {1} registers overflows or divides by zero")]
    Arithmetic(&'static str, DataType),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl FragmentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FragmentError::Reduce(..) => ErrorClass::NotImplemented,
            FragmentError::Transpose | FragmentError::RegisterType(_) | FragmentError::Type(_) => {
                ErrorClass::Capability
            }
            FragmentError::Pending => ErrorClass::Resource,
            FragmentError::Arithmetic(..) => ErrorClass::Runtime,
            FragmentError::Memory(err) => err.class(),
            _ => ErrorClass::Structural,
        }
    }
}

/// A logical tensor held in registers, `slots` registers per lane, stored lane-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentedArray<T> {
    shape: Shape,
    layout: FragLayout,
    registers: Arc<[T]>,
}

impl<T> FragmentedArray<T> {
    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn layout(&self) -> FragLayout {
        self.layout
    }

    /// Registers per lane.
    #[inline]
    pub fn slots(&self) -> usize {
        self.registers.len() / FragLayout::LANES
    }

    /// All registers, lane-major.
    #[inline]
    pub fn registers(&self) -> &[T] {
        &self.registers
    }

    /// The registers of one lane.
    pub fn lane(&self, lane: usize) -> &[T] {
        let slots = self.slots();
        &self.registers[lane * slots..(lane + 1) * slots]
    }

    pub(crate) fn from_registers(shape: Shape, layout: FragLayout, registers: Arc<[T]>) -> Self {
        debug_assert_eq!(registers.len(), FragLayout::LANES * layout.slots(&shape));
        Self {
            shape,
            layout,
            registers,
        }
    }

    /// Row-major index of the element each register holds, lane-major.
    fn indices(shape: &Shape, layout: FragLayout) -> Vec<usize> {
        let dense = Layout::from_shape(shape.clone());
        itertools::iproduct!(0..FragLayout::LANES, 0..layout.slots(shape))
            .map(|(lane, slot)| dense.value(layout.locate(shape, lane, slot).as_slice()))
            .collect()
    }
}

impl<T: Copy + Send + Sync> FragmentedArray<T> {
    /// Every register holds `value`.
    pub fn splat(value: T, shape: impl Into<Shape>, layout: FragLayout) -> Result<Self, FragmentError> {
        let shape = shape.into();
        layout.check(&shape)?;
        let registers = vec![value; FragLayout::LANES * layout.slots(&shape)].into();
        Ok(Self::from_registers(shape, layout, registers))
    }

    /// Builds an array from the logical coordinates of each element.
    pub fn from_fn(
        shape: impl Into<Shape>,
        layout: FragLayout,
        f: impl Fn(&[usize]) -> T,
    ) -> Result<Self, FragmentError> {
        let shape = shape.into();
        layout.check(&shape)?;
        let registers = itertools::iproduct!(0..FragLayout::LANES, 0..layout.slots(&shape))
            .map(|(lane, slot)| f(&layout.locate(&shape, lane, slot)))
            .collect();
        Ok(Self::from_registers(shape, layout, registers))
    }

    /// Lays out row-major `values` of `shape`.
    pub fn from_values(
        shape: impl Into<Shape>,
        layout: FragLayout,
        values: &[T],
    ) -> Result<Self, FragmentError> {
        let shape = shape.into();
        layout.check(&shape)?;
        if values.len() != shape.size() {
            return Err(MemoryError::Size(shape.size(), values.len()).into());
        }
        let registers = Self::indices(&shape, layout)
            .into_iter()
            .map(|index| values[index])
            .collect();
        Ok(Self::from_registers(shape, layout, registers))
    }

    /// Gathers the logical tensor in row-major order.
    pub fn to_vec(&self) -> Vec<T> {
        let mut values = vec![self.registers[0]; self.shape.size()];
        for (index, &value) in Self::indices(&self.shape, self.layout)
            .into_iter()
            .zip_eq(self.registers.iter())
        {
            values[index] = value;
        }
        values
    }
}

impl<T: Scalar> FragmentedArray<T> {
    /// Each element holds its own coordinate along `axis`.
    pub fn iota(shape: impl Into<Shape>, layout: FragLayout, axis: usize) -> Result<Self, FragmentError> {
        let shape = shape.into();
        if axis >= shape.len() {
            return Err(FragmentError::Shape(layout, shape));
        }
        Self::from_fn(shape, layout, |coord| T::from_f32(coord[axis] as f32))
    }

    /// Loads a view under the widest strided layout whose vectors fit 16 bytes and divide the view.
    pub fn load_strided(view: &View) -> Result<Self, FragmentError> {
        let size = view.len();
        let mut vec_size = (16 / T::DATA_TYPE.size()).max(1);
        while vec_size > 1 && size % (FragLayout::LANES * vec_size) != 0 {
            vec_size /= 2;
        }
        Self::load_untiled(view, FragLayout::Strided { vec_size })
    }

    /// Loads a view in row-major logical order under `layout`.
    pub fn load_untiled(view: &View, layout: FragLayout) -> Result<Self, FragmentError> {
        let values = view.load::<T>()?;
        Self::from_values(view.shape(), layout, &values)
    }

    /// Stores the array into a view of the same logical shape.
    pub fn store_untiled(&self, view: &View) -> Result<(), FragmentError> {
        if view.shape() != self.shape {
            return Err(FragmentError::ShapeMismatch(self.shape.clone(), view.shape()));
        }
        view.store(&self.to_vec())?;
        Ok(())
    }

    /// Element offsets of the row-major logical tensor inside a tiled view.
    ///
    /// A `(m, n)` array lives in a view of shape `(m / 64, n / tn, 64, tn)`, `tn` elements
    /// filling one 128-byte row.
    fn tiled_offsets(
        shape: &Shape,
        view: &View,
        swizzle: Option<Swizzle>,
    ) -> Result<Vec<usize>, FragmentError> {
        let r#type = view.data_type();
        if r#type != T::DATA_TYPE {
            return Err(MemoryError::Type(r#type, T::DATA_TYPE).into());
        }
        let &[m, n] = shape.as_slice() else {
            return Err(FragmentError::Shape(FragLayout::Wgmma, shape.clone()));
        };
        let tn = Swizzle::B128.bytes() / r#type.size();
        let rows = FragLayout::TILE_ROWS;
        let expected = Shape::from([m / rows, n / tn, rows, tn]);
        if m % rows != 0 || n % tn != 0 || view.shape() != expected {
            return Err(FragmentError::Tiling(expected, view.shape()));
        }
        view.check_bounds()?;
        if let Some(swizzle) = swizzle {
            swizzle
                .check(view.buffer().len(), r#type)
                .map_err(MemoryError::from)?;
        }

        let offsets = itertools::iproduct!(0..m, 0..n)
            .map(|(row, col)| view.offset() + view.layout().value([row / rows, col / tn, row % rows, col % tn]))
            .map(|offset| match swizzle {
                Some(swizzle) => swizzle.apply(offset, r#type),
                None => offset,
            })
            .collect();
        Ok(offsets)
    }

    /// Loads a `(m, n)` array from the tiled shared-memory format.
    pub fn load_tiled(
        view: &View,
        shape: impl Into<Shape>,
        layout: FragLayout,
        swizzle: Option<Swizzle>,
    ) -> Result<Self, FragmentError> {
        let shape = shape.into();
        let offsets = Self::tiled_offsets(&shape, view, swizzle)?;
        let bytes = view.read_offsets(&offsets)?;
        let values: Vec<T> = bytemuck::allocation::pod_collect_to_vec(&bytes);
        Self::from_values(shape, layout, &values)
    }

    /// Stores the array in the tiled shared-memory format.
    pub fn store_tiled(&self, view: &View, swizzle: Option<Swizzle>) -> Result<(), FragmentError> {
        let offsets = Self::tiled_offsets(&self.shape, view, swizzle)?;
        let values = self.to_vec();
        view.write_offsets(&offsets, bytemuck::cast_slice(&values))?;
        Ok(())
    }

    /// Converts every element to another scalar type.
    pub fn astype<U: Scalar>(&self) -> FragmentedArray<U> {
        self.map(|x| U::from_f32(x.to_f32()))
    }
}
