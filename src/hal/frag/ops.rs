use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{FragLayout, FragmentError, FragmentedArray};
use crate::loom::{
    layout::Shape,
    num::{Float, Number, Scalar},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ReduceOp {
    Add,
    Max,
    Min,
}

impl ReduceOp {
    /// Returns `None` if an integer sum overflows.
    #[inline]
    fn combine<T: Number>(self, x: T, y: T) -> Option<T> {
        match self {
            ReduceOp::Add => x.checked_add(y),
            ReduceOp::Max if y > x => Some(y),
            ReduceOp::Min if y < x => Some(y),
            _ => Some(x),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    #[inline]
    fn apply<T: PartialOrd>(self, x: T, y: T) -> bool {
        match self {
            CompareOp::Eq => x == y,
            CompareOp::Ne => x != y,
            CompareOp::Lt => x < y,
            CompareOp::Le => x <= y,
            CompareOp::Gt => x > y,
            CompareOp::Ge => x >= y,
        }
    }
}

impl<T: Copy + Send + Sync> FragmentedArray<T> {
    fn check_compatible<U>(&self, other: &FragmentedArray<U>) -> Result<(), FragmentError> {
        if self.layout != other.layout {
            return Err(FragmentError::LayoutMismatch(self.layout, other.layout));
        }
        if self.shape != other.shape {
            return Err(FragmentError::ShapeMismatch(
                self.shape.clone(),
                other.shape.clone(),
            ));
        }
        Ok(())
    }

    /// Applies `f` to every register.
    pub fn map<U, F>(&self, f: F) -> FragmentedArray<U>
    where
        U: Copy + Send + Sync,
        F: Fn(T) -> U + Send + Sync,
    {
        #[cfg(not(feature = "rayon"))]
        let registers = self.registers.iter().map(|&x| f(x)).collect();
        #[cfg(feature = "rayon")]
        let registers = {
            use rayon::prelude::*;
            self.registers
                .par_iter()
                .map(|&x| f(x))
                .collect::<Vec<_>>()
                .into()
        };
        FragmentedArray::from_registers(self.shape.clone(), self.layout, registers)
    }

    /// Combines two arrays of the same shape and layout register by register.
    pub fn zip_with<U, V, F>(
        &self,
        other: &FragmentedArray<U>,
        f: F,
    ) -> Result<FragmentedArray<V>, FragmentError>
    where
        U: Copy + Send + Sync,
        V: Copy + Send + Sync,
        F: Fn(T, U) -> V + Send + Sync,
    {
        self.check_compatible(other)?;

        #[cfg(not(feature = "rayon"))]
        let registers = {
            use itertools::Itertools;
            self.registers
                .iter()
                .zip_eq(other.registers.iter())
                .map(|(&x, &y)| f(x, y))
                .collect()
        };
        #[cfg(feature = "rayon")]
        let registers = {
            use rayon::prelude::*;
            self.registers
                .par_iter()
                .zip_eq(other.registers.par_iter())
                .map(|(&x, &y)| f(x, y))
                .collect::<Vec<_>>()
                .into()
        };
        Ok(FragmentedArray::from_registers(
            self.shape.clone(),
            self.layout,
            registers,
        ))
    }
}

impl<T: Copy + Send + Sync> FragmentedArray<Option<T>> {
    /// Unwraps every register, failing on the first `None`.
    fn flatten(self) -> Option<FragmentedArray<T>> {
        let registers = self.registers.iter().copied().collect::<Option<Vec<_>>>()?;
        Some(FragmentedArray::from_registers(
            self.shape,
            self.layout,
            registers.into(),
        ))
    }
}

impl<T: Number> FragmentedArray<T> {
    fn checked_zip<F>(&self, other: &Self, name: &'static str, f: F) -> Result<Self, FragmentError>
    where
        F: Fn(T, T) -> Option<T> + Send + Sync,
    {
        self.zip_with(other, f)?
            .flatten()
            .ok_or(FragmentError::Arithmetic(name, T::DATA_TYPE))
    }

    /// Integer operands fail with [`FragmentError::Arithmetic`] on overflow; so do the other
    /// `try_*` methods, and [`try_div`](Self::try_div) on a zero divisor.
    pub fn try_add(&self, other: &Self) -> Result<Self, FragmentError> {
        self.checked_zip(other, "addition", Number::checked_add)
    }

    pub fn try_sub(&self, other: &Self) -> Result<Self, FragmentError> {
        self.checked_zip(other, "subtraction", Number::checked_sub)
    }

    pub fn try_mul(&self, other: &Self) -> Result<Self, FragmentError> {
        self.checked_zip(other, "multiplication", Number::checked_mul)
    }

    pub fn try_div(&self, other: &Self) -> Result<Self, FragmentError> {
        self.checked_zip(other, "division", Number::checked_div)
    }

    pub fn max(&self, other: &Self) -> Result<Self, FragmentError> {
        self.zip_with(other, |x, y| if y > x { y } else { x })
    }

    pub fn min(&self, other: &Self) -> Result<Self, FragmentError> {
        self.zip_with(other, |x, y| if y < x { y } else { x })
    }

    /// Reduces along `axis`.
    ///
    /// Only the minor axis of a [`FragLayout::Wgmma`] array is supported; the result is a
    /// [`FragLayout::WgmmaRow`] array with one value per row.
    pub fn reduce(&self, op: ReduceOp, axis: usize) -> Result<Self, FragmentError> {
        let (FragLayout::Wgmma, 1) = (self.layout, axis) else {
            return Err(FragmentError::Reduce(self.layout, axis));
        };
        let (m, n) = (self.shape[0], self.shape[1]);
        let tiles = n / FragLayout::TILE_COLS;
        let slots = self.slots();
        let row_slots = (m / FragLayout::TILE_ROWS) * 2;

        let overflow = || FragmentError::Arithmetic("reduction", T::DATA_TYPE);

        // 1. each lane folds the columns it holds for every one of its rows
        let mut partial = Vec::with_capacity(FragLayout::LANES * row_slots);
        for lane in 0..FragLayout::LANES {
            let registers = &self.registers[lane * slots..(lane + 1) * slots];
            for row_slot in 0..row_slots {
                let (rt, half) = (row_slot / 2, row_slot % 2);
                let mut values = itertools::iproduct!(0..tiles, 0..2)
                    .map(|(ct, e)| registers[((rt * tiles + ct) * 2 + half) * 2 + e]);
                let Some(first) = values.next() else {
                    continue;
                };
                let value = values
                    .try_fold(first, |x, y| op.combine(x, y))
                    .ok_or_else(overflow)?;
                partial.push(value);
            }
        }

        // 2. butterfly over the four lanes of a quad, which share their rows
        for mask in [1, 2] {
            partial = (0..FragLayout::LANES)
                .flat_map(|lane| (0..row_slots).map(move |slot| (lane, slot)))
                .map(|(lane, slot)| {
                    let x = partial[lane * row_slots + slot];
                    let y = partial[(lane ^ mask) * row_slots + slot];
                    op.combine(x, y)
                })
                .collect::<Option<Vec<_>>>()
                .ok_or_else(overflow)?;
        }

        Ok(Self::from_registers(
            Shape::from([m]),
            FragLayout::WgmmaRow,
            partial.into(),
        ))
    }
}

impl<T: Copy + Send + Sync> FragmentedArray<T> {
    /// Broadcasts a [`FragLayout::WgmmaRow`] array of `m` values into a `(m, n)` [`FragLayout::Wgmma`] array.
    pub fn broadcast_minor(&self, n: usize) -> Result<Self, FragmentError> {
        if self.layout != FragLayout::WgmmaRow {
            return Err(FragmentError::LayoutMismatch(self.layout, FragLayout::WgmmaRow));
        }
        let m = self.shape[0];
        let shape = Shape::from([m, n]);
        FragLayout::Wgmma.check(&shape)?;

        let tiles = n / FragLayout::TILE_COLS;
        let slots = FragLayout::Wgmma.slots(&shape);
        let row_slots = self.slots();
        let registers = itertools::iproduct!(0..FragLayout::LANES, 0..slots)
            .map(|(lane, slot)| {
                let half = (slot / 2) % 2;
                let rt = slot / (4 * tiles);
                self.registers[lane * row_slots + rt * 2 + half]
            })
            .collect();
        Ok(Self::from_registers(shape, FragLayout::Wgmma, registers))
    }
}

impl<T: Scalar> FragmentedArray<T> {
    pub fn compare(&self, other: &Self, op: CompareOp) -> Result<FragmentedArray<bool>, FragmentError> {
        self.zip_with(other, |x, y| op.apply(x, y))
    }
}

impl FragmentedArray<bool> {
    /// Picks from `on_true` where the mask is set, from `on_false` elsewhere.
    pub fn select<T: Copy + Send + Sync>(
        &self,
        on_true: &FragmentedArray<T>,
        on_false: &FragmentedArray<T>,
    ) -> Result<FragmentedArray<T>, FragmentError> {
        let picked = self.zip_with(on_true, |mask, x| (mask, x))?;
        picked.zip_with(on_false, |(mask, x), y| if mask { x } else { y })
    }
}

impl<T: Float> FragmentedArray<T> {
    pub fn neg(&self) -> Self {
        self.map(|x| -x)
    }

    pub fn exp(&self) -> Self {
        self.map(Float::exp)
    }

    pub fn abs(&self) -> Self {
        self.map(Float::abs)
    }
}

// The operators panic where the `try_*` methods would return an error.
macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $try:ident) => {
        impl<T: Number> std::ops::$trait for &FragmentedArray<T> {
            type Output = FragmentedArray<T>;

            fn $method(self, rhs: Self) -> Self::Output {
                match self.$try(rhs) {
                    Ok(output) => output,
                    Err(err) => panic!("{err}"),
                }
            }
        }

        impl<T: Number> std::ops::$trait for FragmentedArray<T> {
            type Output = FragmentedArray<T>;

            fn $method(self, rhs: Self) -> Self::Output {
                std::ops::$trait::$method(&self, &rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, try_add);
impl_binary_op!(Sub, sub, try_sub);
impl_binary_op!(Mul, mul, try_mul);
impl_binary_op!(Div, div, try_div);
