use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{FragLayout, FragmentError, FragmentedArray};
use crate::loom::{
    layout::{IndexFn, Shape},
    num::{DataType, Scalar, tf32},
    swizzle::Swizzle,
    view::{MemoryError, MemorySpace, View},
};

/// Which dimension of a matrix operand is contiguous in its tiles.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WgmmaOrder {
    #[default]
    RowMajor,
    ColMajor,
}

/// An `f32` matrix accumulator in the [`FragLayout::Wgmma`] layout.
#[derive(Debug, Clone, PartialEq)]
pub struct WgmmaAccumulator(FragmentedArray<f32>);

impl WgmmaAccumulator {
    pub fn zero(m: usize, n: usize) -> Result<Self, FragmentError> {
        FragmentedArray::splat(0.0, [m, n], FragLayout::Wgmma).map(Self)
    }

    pub fn from_value(value: FragmentedArray<f32>) -> Result<Self, FragmentError> {
        match value.layout() {
            FragLayout::Wgmma => Ok(Self(value)),
            layout => Err(FragmentError::LayoutMismatch(layout, FragLayout::Wgmma)),
        }
    }

    #[inline]
    pub fn value(&self) -> &FragmentedArray<f32> {
        &self.0
    }

    #[inline]
    pub fn into_value(self) -> FragmentedArray<f32> {
        self.0
    }

    fn dims(&self) -> (usize, usize) {
        let shape = self.0.shape();
        (shape[0], shape[1])
    }

    /// Adds the product of row-major `a` (`m × k`) and `b` (`k × n`) into the accumulator.
    fn accumulate(self, a: &[f32], b: &[f32], k: usize) -> Result<Self, FragmentError> {
        let (m, n) = self.dims();
        let mut values = self.0.to_vec();
        let product = |(i, row): (usize, &mut [f32])| {
            let a = &a[i * k..(i + 1) * k];
            for (j, value) in row.iter_mut().enumerate() {
                *value += (0..k).map(|kk| a[kk] * b[kk * n + j]).sum::<f32>();
            }
        };
        #[cfg(not(feature = "rayon"))]
        values.chunks_exact_mut(n).enumerate().for_each(product);
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            values.par_chunks_exact_mut(n).enumerate().for_each(product);
        }
        FragmentedArray::from_values([m, n], FragLayout::Wgmma, &values).map(Self)
    }
}

/// Elements of one 128-byte tile row.
#[inline]
fn tile_size(r#type: DataType) -> usize {
    Swizzle::B128.bytes() / r#type.size()
}

fn check_type(r#type: DataType) -> Result<(), FragmentError> {
    match r#type {
        DataType::F16 | DataType::BF16 | DataType::F32 => Ok(()),
        r#type => Err(FragmentError::Type(r#type)),
    }
}

fn check_operand(view: &View, expected: Shape) -> Result<(), FragmentError> {
    if view.space() != MemorySpace::Shared {
        return Err(FragmentError::Space(view.space()));
    }
    if view.shape() != expected {
        return Err(FragmentError::Tiling(expected, view.shape()));
    }
    view.check_bounds()?;
    Ok(())
}

/// Reads a swizzled tiled operand into a row-major `f32` matrix of `rows × cols`,
/// given the tiled coordinates of each `(row, col)`.
fn read_tiles(
    view: &View,
    rows: usize,
    cols: usize,
    coord: impl Fn(usize, usize) -> [usize; 4],
) -> Result<Vec<f32>, FragmentError> {
    let r#type = view.data_type();
    Swizzle::B128
        .check(view.buffer().len(), r#type)
        .map_err(MemoryError::from)?;
    let offsets = itertools::iproduct!(0..rows, 0..cols)
        .map(|(row, col)| view.offset() + view.layout().value(coord(row, col)))
        .map(|offset| Swizzle::B128.apply(offset, r#type))
        .collect_vec();
    let bytes = view.read_offsets(&offsets)?;
    let values = bytes.chunks_exact(r#type.size()).map(|x| r#type.decode(x));
    Ok(match r#type {
        DataType::F32 => values.map(tf32).collect(),
        _ => values.collect(),
    })
}

/// Reads the left operand of shape `m × k` from tiles `(m / 64, k / tk, 64, tk)`.
fn read_lhs(view: &View, m: usize, order: WgmmaOrder) -> Result<(Vec<f32>, usize), FragmentError> {
    let r#type = view.data_type();
    let rows = FragLayout::TILE_ROWS;
    let tk = match order {
        WgmmaOrder::RowMajor => tile_size(r#type),
        WgmmaOrder::ColMajor => rows,
    };
    let shape = view.shape();
    let k = match shape.as_slice() {
        &[_, kt, _, _] => kt * tk,
        _ => 0,
    };
    let expected = match order {
        WgmmaOrder::RowMajor => Shape::from([m / rows, k / tk, rows, tk]),
        WgmmaOrder::ColMajor => Shape::from([m / rows, k / tk, tk, rows]),
    };
    check_operand(view, expected)?;

    let a = read_tiles(view, m, k, |i, kk| match order {
        WgmmaOrder::RowMajor => [i / rows, kk / tk, i % rows, kk % tk],
        WgmmaOrder::ColMajor => [i / rows, kk / tk, kk % tk, i % rows],
    })?;
    Ok((a, k))
}

/// Reads the right operand of shape `k × n` from tiles `(k / tn, n / tn, tn, tn)`.
fn read_rhs(view: &View, k: usize, n: usize, order: WgmmaOrder) -> Result<Vec<f32>, FragmentError> {
    let tn = tile_size(view.data_type());
    if k % tn != 0 || n % tn != 0 {
        return Err(FragmentError::Tiling(Shape::from([k, n]), view.shape()));
    }
    check_operand(view, Shape::from([k / tn, n / tn, tn, tn]))?;
    read_tiles(view, k, n, |kk, j| match order {
        WgmmaOrder::RowMajor => [kk / tn, j / tn, kk % tn, j % tn],
        WgmmaOrder::ColMajor => [kk / tn, j / tn, j % tn, kk % tn],
    })
}

/// Multiplies two shared-memory operands into the accumulator.
///
/// Operands use the 128-byte swizzled tile format. A row-major `a` of `m × k` is tiled
/// `(m / 64, k / tk, 64, tk)` and a column-major one `(m / 64, k / 64, 64, 64)`; `b` of
/// `k × n` is tiled `(k / tn, n / tn, tn, tn)`, with `tk = tn = 128 / bytes`.
///
/// `f32` operands are rounded to tf32 and must be row-major `a` and column-major `b`.
pub fn wgmma(
    acc: WgmmaAccumulator,
    a: &View,
    b: &View,
    a_order: WgmmaOrder,
    b_order: WgmmaOrder,
) -> Result<WgmmaAccumulator, FragmentError> {
    let r#type = a.data_type();
    check_type(r#type)?;
    if b.data_type() != r#type {
        return Err(FragmentError::TypeMismatch(r#type, b.data_type()));
    }
    if r#type == DataType::F32
        && (a_order != WgmmaOrder::RowMajor || b_order != WgmmaOrder::ColMajor)
    {
        return Err(FragmentError::Transpose);
    }

    let (m, n) = acc.dims();
    let (a, k) = read_lhs(a, m, a_order)?;
    let b = read_rhs(b, k, n, b_order)?;
    acc.accumulate(&a, &b, k)
}

/// Multiplies a register-resident left operand with a shared-memory right operand.
pub fn wgmma_registers<T: Scalar>(
    acc: WgmmaAccumulator,
    a: &FragmentedArray<T>,
    b: &View,
    b_order: WgmmaOrder,
) -> Result<WgmmaAccumulator, FragmentError> {
    let r#type = T::DATA_TYPE;
    if !matches!(r#type, DataType::F16 | DataType::BF16) {
        return Err(FragmentError::RegisterType(r#type));
    }
    if b.data_type() != r#type {
        return Err(FragmentError::TypeMismatch(r#type, b.data_type()));
    }
    if a.layout() != FragLayout::Wgmma {
        return Err(FragmentError::LayoutMismatch(a.layout(), FragLayout::Wgmma));
    }

    let (m, n) = acc.dims();
    let k = a.shape()[1];
    if a.shape()[0] != m {
        return Err(FragmentError::ShapeMismatch(
            a.shape().clone(),
            Shape::from([m, k]),
        ));
    }
    let a = a.to_vec().into_iter().map(Scalar::to_f32).collect_vec();
    let b = read_rhs(b, k, n, b_order)?;
    acc.accumulate(&a, &b, k)
}

type WgmmaJob = Box<dyn FnOnce() -> Result<WgmmaAccumulator, FragmentError> + Send>;
type WgmmaSlot = Arc<Mutex<Option<Result<WgmmaAccumulator, FragmentError>>>>;

/// An issued matrix operation. Its accumulator is readable once the group it was committed
/// with has been waited.
#[derive(Debug)]
#[must_use = "an issued matrix operation must be read after its group is waited"]
pub struct PendingWgmma {
    slot: WgmmaSlot,
}

impl PendingWgmma {
    pub fn is_complete(&self) -> bool {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn result(self) -> Result<WgmmaAccumulator, FragmentError> {
        let result = self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        result.unwrap_or_else(|| Err(FragmentError::Pending))
    }
}

/// Matrix operations in flight: the open group collecting issues, then committed groups in order.
#[derive(Default)]
pub(crate) struct WgmmaQueue {
    open: Vec<(WgmmaJob, WgmmaSlot)>,
    committed: VecDeque<Vec<(WgmmaJob, WgmmaSlot)>>,
}

impl std::fmt::Debug for WgmmaQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgmmaQueue")
            .field("open", &self.open.len())
            .field("committed", &self.committed.len())
            .finish()
    }
}

impl WgmmaQueue {
    pub fn issue(&mut self, job: WgmmaJob) -> PendingWgmma {
        let slot = WgmmaSlot::default();
        self.open.push((job, slot.clone()));
        PendingWgmma { slot }
    }

    /// Closes the open group. Returns the number of committed groups in flight.
    pub fn commit(&mut self) -> usize {
        let group = std::mem::take(&mut self.open);
        self.committed.push_back(group);
        self.committed.len()
    }

    /// Retires the oldest committed groups until at most `pending` remain.
    pub fn wait(&mut self, pending: usize) -> usize {
        while self.committed.len() > pending {
            let Some(group) = self.committed.pop_front() else {
                break;
            };
            for (job, slot) in group {
                let result = job();
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
            }
        }
        self.committed.len()
    }

    /// Issued operations not yet retired.
    pub fn outstanding(&self) -> usize {
        self.open.len() + self.committed.iter().map(Vec::len).sum::<usize>()
    }
}

impl Drop for WgmmaQueue {
    fn drop(&mut self) {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            log::warn!("{outstanding} matrix operations dropped without being waited");
        }
    }
}

/// Issues a shared-memory matrix operation into the open group of `queue`.
/// Operands are read when the group retires.
pub(crate) fn issue(
    queue: &mut WgmmaQueue,
    acc: WgmmaAccumulator,
    a: &View,
    b: &View,
    a_order: WgmmaOrder,
    b_order: WgmmaOrder,
) -> PendingWgmma {
    let (a, b) = (a.clone(), b.clone());
    queue.issue(Box::new(move || wgmma(acc, &a, &b, a_order, b_order)))
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::{bf16, f16};
    use itertools::Itertools;

    use super::{WgmmaAccumulator, WgmmaOrder, WgmmaQueue, issue, wgmma, wgmma_registers};
    use crate::{
        hal::frag::{FragLayout, FragmentError, FragmentedArray},
        loom::{
            ErrorClass,
            layout::Transform,
            num::{DataType, Scalar, tf32},
            swizzle::Swizzle,
            view::{Buffer, HostBuffer, MemorySpace, Symbol, View, copy},
        },
    };

    macro_rules! assert_approx_eq {
        ($i:expr, $a:expr, $b:expr, $eps:expr) => {
            assert!(
                ($a - $b).abs() < $eps,
                "assertion failed at {}: `(left ~= right)`\n  left: `{}`\n right: `{}`",
                $i,
                $a,
                $b
            );
        };
    }

    /// A random row-major matrix, already rounded to `T`.
    fn random<T: Scalar>(rows: usize, cols: usize) -> Vec<T> {
        (0..rows * cols)
            .map(|_| T::from_f32(fastrand::f32() * 2.0 - 1.0))
            .collect()
    }

    fn transpose<T: Copy>(data: &[T], rows: usize, cols: usize) -> Vec<T> {
        itertools::iproduct!(0..cols, 0..rows)
            .map(|(col, row)| data[row * cols + col])
            .collect()
    }

    /// Stages a row-major matrix into swizzled shared-memory tiles, applying `transforms`
    /// to the global view the way a tiled copy would.
    fn stage<T: Scalar>(
        data: &[T],
        shape: [usize; 2],
        transforms: &[Transform],
    ) -> Result<View, Box<dyn Error>> {
        let host = HostBuffer::from_slice(shape, data)?;
        let mut gmem = Buffer::from_host(Symbol::HOST, MemorySpace::Global, &host).view();
        for transform in transforms {
            gmem = gmem.transform(transform)?;
        }
        let smem = Buffer::new(Symbol::HOST, MemorySpace::Shared, gmem.shape(), T::DATA_TYPE).view();
        copy(&gmem, &smem, Some(Swizzle::B128))?;
        Ok(smem)
    }

    /// Dot products in `f32`, summed along `k` in order.
    fn reference(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        itertools::iproduct!(0..m, 0..n)
            .map(|(i, j)| (0..k).map(|kk| a[i * k + kk] * b[kk * n + j]).sum::<f32>())
            .collect()
    }

    fn check<T: Scalar>(a_order: WgmmaOrder, b_order: WgmmaOrder) -> Result<(), Box<dyn Error>> {
        let (m, k, n) = (128, 128, 64);
        let t = 128 / T::DATA_TYPE.size();
        let a = random::<T>(m, k);
        let b = random::<T>(k, n);

        let a_view = match a_order {
            WgmmaOrder::RowMajor => stage(&a, [m, k], &[Transform::Tile(vec![64, t])])?,
            WgmmaOrder::ColMajor => stage(
                &transpose(&a, m, k),
                [k, m],
                &[
                    Transform::Tile(vec![64, 64]),
                    Transform::Transpose(vec![1, 0, 2, 3]),
                ],
            )?,
        };
        let b_view = match b_order {
            WgmmaOrder::RowMajor => stage(&b, [k, n], &[Transform::Tile(vec![t, t])])?,
            WgmmaOrder::ColMajor => stage(
                &transpose(&b, k, n),
                [n, k],
                &[
                    Transform::Tile(vec![t, t]),
                    Transform::Transpose(vec![1, 0, 2, 3]),
                ],
            )?,
        };

        let acc = WgmmaAccumulator::zero(m, n)?;
        let acc = wgmma(acc, &a_view, &b_view, a_order, b_order)?;
        let acc = wgmma(acc, &a_view, &b_view, a_order, b_order)?;

        let a = a.iter().map(|x| tf32(x.to_f32())).collect_vec();
        let b = b.iter().map(|x| tf32(x.to_f32())).collect_vec();
        let eps = match T::DATA_TYPE {
            DataType::F32 => 1e-5,
            _ => 1e-3,
        };
        let expected = reference(&a, &b, m, k, n);
        for (index, (x, y)) in expected.into_iter().zip_eq(acc.value().to_vec()).enumerate() {
            assert_approx_eq!(index, 2.0 * x, y, eps);
        }
        Ok(())
    }

    #[test]
    fn test_wgmma_f16() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        for (a_order, b_order) in itertools::iproduct!(
            [WgmmaOrder::RowMajor, WgmmaOrder::ColMajor],
            [WgmmaOrder::RowMajor, WgmmaOrder::ColMajor]
        ) {
            check::<f16>(a_order, b_order)?;
        }
        Ok(())
    }

    #[test]
    fn test_wgmma_bf16() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        check::<bf16>(WgmmaOrder::RowMajor, WgmmaOrder::ColMajor)?;
        check::<bf16>(WgmmaOrder::ColMajor, WgmmaOrder::RowMajor)?;
        Ok(())
    }

    #[test]
    fn test_wgmma_tf32() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        check::<f32>(WgmmaOrder::RowMajor, WgmmaOrder::ColMajor)?;

        let a = stage(&random::<f32>(64, 64), [64, 64], &[Transform::Tile(vec![64, 64])])?;
        let b = stage(&random::<f32>(64, 64), [64, 64], &[Transform::Tile(vec![32, 32])])?;
        let acc = WgmmaAccumulator::zero(64, 64)?;
        let err = wgmma(acc, &a, &b, WgmmaOrder::ColMajor, WgmmaOrder::ColMajor).unwrap_err();
        assert!(matches!(err, FragmentError::Transpose));
        assert_eq!(err.class(), ErrorClass::Capability);
        assert_eq!(err.to_string(), "Transpose only supported in 16-bit WGMMA");

        let acc = WgmmaAccumulator::zero(64, 64)?;
        let err = wgmma(acc, &b, &b, WgmmaOrder::RowMajor, WgmmaOrder::RowMajor).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Capability);
        Ok(())
    }

    #[test]
    fn test_wgmma_registers() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        let (m, k, n) = (64, 128, 128);
        let a = random::<f16>(m, k);
        let b = random::<f16>(k, n);

        let host = HostBuffer::from_slice([m, k], &a)?;
        let gmem = Buffer::from_host(Symbol::HOST, MemorySpace::Global, &host).view();
        let a_frag = FragmentedArray::<f16>::load_untiled(&gmem, FragLayout::Wgmma)?;
        let b_view = stage(&b, [k, n], &[Transform::Tile(vec![64, 64])])?;

        let acc = WgmmaAccumulator::zero(m, n)?;
        let acc = wgmma_registers(acc, &a_frag, &b_view, WgmmaOrder::RowMajor)?;

        let a = a.iter().map(|x| x.to_f32()).collect_vec();
        let b = b.iter().map(|x| x.to_f32()).collect_vec();
        let expected = reference(&a, &b, m, k, n);
        for (index, (x, y)) in expected.into_iter().zip_eq(acc.value().to_vec()).enumerate() {
            assert_approx_eq!(index, x, y, 1e-3);
        }

        // register operands must be 16-bit
        let words = a_frag.astype::<f32>();
        let acc = WgmmaAccumulator::zero(m, n)?;
        let err = wgmma_registers(acc, &words, &b_view, WgmmaOrder::RowMajor).unwrap_err();
        assert!(matches!(err, FragmentError::RegisterType(DataType::F32)));
        assert_eq!(err.class(), ErrorClass::Capability);
        Ok(())
    }

    #[test]
    fn test_wgmma_groups() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        let (m, k, n) = (64, 64, 64);
        let a = stage(&random::<f16>(m, k), [m, k], &[Transform::Tile(vec![64, 64])])?;
        let b = stage(&random::<f16>(k, n), [k, n], &[Transform::Tile(vec![64, 64])])?;
        let row = WgmmaOrder::RowMajor;
        let once = wgmma(WgmmaAccumulator::zero(m, n)?, &a, &b, row, row)?;

        let mut queue = WgmmaQueue::default();
        let first = issue(&mut queue, WgmmaAccumulator::zero(m, n)?, &a, &b, row, row);
        assert_eq!(queue.commit(), 1);
        let second = issue(&mut queue, once.clone(), &a, &b, row, row);
        assert_eq!(queue.commit(), 2);
        let open = issue(&mut queue, WgmmaAccumulator::zero(m, n)?, &a, &b, row, row);
        assert_eq!(queue.outstanding(), 3);
        assert!(!first.is_complete());

        // the oldest group retires first
        assert_eq!(queue.wait(1), 1);
        assert!(first.is_complete());
        assert!(!second.is_complete());
        assert_eq!(first.result()?, once);

        assert_eq!(queue.wait(0), 0);
        let twice = second.result()?.into_value().to_vec();
        for (index, (x, y)) in once.value().to_vec().into_iter().zip_eq(twice).enumerate() {
            assert_approx_eq!(index, 2.0 * x, y, 1e-5);
        }

        // waiting never covers operations issued after the last commit
        assert!(!open.is_complete());
        let err = open.result().unwrap_err();
        assert!(matches!(err, FragmentError::Pending));
        assert_eq!(err.class(), ErrorClass::Resource);
        assert_eq!(queue.outstanding(), 1);
        Ok(())
    }

    #[test]
    fn test_wgmma_operand_errors() -> Result<(), Box<dyn Error>> {
        let acc = WgmmaAccumulator::zero(64, 64)?;
        let gmem = Buffer::new(Symbol::HOST, MemorySpace::Global, [1, 1, 64, 64], DataType::F16).view();
        let err = wgmma(acc, &gmem, &gmem, WgmmaOrder::RowMajor, WgmmaOrder::RowMajor).unwrap_err();
        assert!(matches!(err, FragmentError::Space(MemorySpace::Global)));

        let acc = WgmmaAccumulator::zero(64, 64)?;
        let smem = Buffer::new(Symbol::HOST, MemorySpace::Shared, [1, 2, 64, 32], DataType::F16).view();
        let err = wgmma(acc, &smem, &smem, WgmmaOrder::RowMajor, WgmmaOrder::RowMajor).unwrap_err();
        assert!(matches!(err, FragmentError::Tiling(..)));

        let acc = WgmmaAccumulator::zero(64, 64)?;
        let ints = Buffer::new(Symbol::HOST, MemorySpace::Shared, [1, 2, 64, 32], DataType::I32).view();
        let err = wgmma(acc, &ints, &ints, WgmmaOrder::RowMajor, WgmmaOrder::RowMajor).unwrap_err();
        assert!(matches!(err, FragmentError::Type(DataType::I32)));
        Ok(())
    }
}
