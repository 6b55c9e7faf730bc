use std::{
    fmt::Debug,
    ops::{Add, Div, Mul, Neg, Sub},
};

use bytemuck::Pod;
use derive_more::Display;
use half::{bf16, f16};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F16,
    BF16,
    I32,
    U32,
    U8,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F16 | DataType::BF16 => 2,
            DataType::U8 => 1,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F16 | DataType::BF16)
    }

    /// Decodes one native-endian element of this type as `f32`.
    ///
    /// **Panics** if `bytes` is not exactly [`DataType::size`] long.
    pub fn decode(self, bytes: &[u8]) -> f32 {
        fn read<T: Scalar>(bytes: &[u8]) -> f32 {
            bytemuck::pod_read_unaligned::<T>(bytes).to_f32()
        }
        match self {
            DataType::F32 => read::<f32>(bytes),
            DataType::F16 => read::<f16>(bytes),
            DataType::BF16 => read::<bf16>(bytes),
            DataType::I32 => read::<i32>(bytes),
            DataType::U32 => read::<u32>(bytes),
            DataType::U8 => read::<u8>(bytes),
        }
    }
}

pub trait Scalar: Sized + Copy + Pod + PartialOrd + Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

/// Scalars closed under the four arithmetic operations.
///
/// The `checked_*` forms return `None` where an integer operation would overflow or divide by
/// zero. Floating point never fails; it produces infinities and NaNs instead.
pub trait Number:
    Scalar + Add<Output = Self> + Sub<Output = Self> + Mul<Output = Self> + Div<Output = Self>
{
    fn checked_add(self, rhs: Self) -> Option<Self>;
    fn checked_sub(self, rhs: Self) -> Option<Self>;
    fn checked_mul(self, rhs: Self) -> Option<Self>;
    fn checked_div(self, rhs: Self) -> Option<Self>;
}

macro_rules! impl_number {
    (float: $($ty:ty),+) => {
        $(
            impl Number for $ty {
                #[inline]
                fn checked_add(self, rhs: Self) -> Option<Self> {
                    Some(self + rhs)
                }

                #[inline]
                fn checked_sub(self, rhs: Self) -> Option<Self> {
                    Some(self - rhs)
                }

                #[inline]
                fn checked_mul(self, rhs: Self) -> Option<Self> {
                    Some(self * rhs)
                }

                #[inline]
                fn checked_div(self, rhs: Self) -> Option<Self> {
                    Some(self / rhs)
                }
            }
        )+
    };
    (int: $($ty:ty),+) => {
        $(
            impl Number for $ty {
                #[inline]
                fn checked_add(self, rhs: Self) -> Option<Self> {
                    <$ty>::checked_add(self, rhs)
                }

                #[inline]
                fn checked_sub(self, rhs: Self) -> Option<Self> {
                    <$ty>::checked_sub(self, rhs)
                }

                #[inline]
                fn checked_mul(self, rhs: Self) -> Option<Self> {
                    <$ty>::checked_mul(self, rhs)
                }

                #[inline]
                fn checked_div(self, rhs: Self) -> Option<Self> {
                    <$ty>::checked_div(self, rhs)
                }
            }
        )+
    };
}

pub trait Float: Number + Neg<Output = Self> {
    fn exp(self) -> Self {
        Self::from_f32(self.to_f32().exp())
    }

    fn abs(self) -> Self {
        Self::from_f32(self.to_f32().abs())
    }
}

macro_rules! impl_scalar {
    ($ty:ty, $data_type:expr, |$x:ident| $to:expr, |$y:ident| $from:expr) => {
        impl Scalar for $ty {
            const DATA_TYPE: DataType = $data_type;

            #[inline]
            fn to_f32(self) -> f32 {
                let $x = self;
                $to
            }

            #[inline]
            fn from_f32(value: f32) -> Self {
                let $y = value;
                $from
            }
        }
    };
}

impl_scalar!(f32, DataType::F32, |x| x, |x| x);
impl_scalar!(f16, DataType::F16, |x| x.to_f32(), |x| f16::from_f32(x));
impl_scalar!(bf16, DataType::BF16, |x| x.to_f32(), |x| bf16::from_f32(x));
impl_scalar!(i32, DataType::I32, |x| x as f32, |x| x as i32);
impl_scalar!(u32, DataType::U32, |x| x as f32, |x| x as u32);
impl_scalar!(u8, DataType::U8, |x| x as f32, |x| x as u8);

impl_number!(float: f32, f16, bf16);
impl_number!(int: i32, u32, u8);

impl Float for f32 {
    #[inline]
    fn exp(self) -> Self {
        f32::exp(self)
    }

    #[inline]
    fn abs(self) -> Self {
        f32::abs(self)
    }
}

impl Float for f16 {}
impl Float for bf16 {}

/// Rounds `value` to `mantissa` explicit mantissa bits, to nearest with ties to even.
/// The 8-bit exponent is kept, so `round_mantissa(x, 10)` is the tf32 value of `x`.
pub fn round_mantissa(value: f32, mantissa: u32) -> f32 {
    if !value.is_finite() || mantissa >= 23 {
        return value;
    }
    let shift = 23 - mantissa;
    let bits = value.to_bits();
    let lsb = (bits >> shift) & 1;
    let bias = (1u32 << (shift - 1)) - 1 + lsb;
    let mask = !((1u32 << shift) - 1);
    f32::from_bits(bits.wrapping_add(bias) & mask)
}

/// Quantizes an `f32` to tf32 (8 exponent bits, 10 mantissa bits).
#[inline]
pub fn tf32(value: f32) -> f32 {
    round_mantissa(value, 10)
}

#[cfg(test)]
mod tests {
    use half::{bf16, f16};

    use super::{DataType, Scalar, tf32};

    #[test]
    fn test_tf32() {
        let ulp = 2.0f32.powi(-10);
        assert_eq!(tf32(1.0), 1.0);
        assert_eq!(tf32(1.0 + ulp), 1.0 + ulp);
        // ties go to the even neighbour
        assert_eq!(tf32(1.0 + ulp / 2.0), 1.0);
        assert_eq!(tf32(1.0 + 1.5 * ulp), 1.0 + 2.0 * ulp);
        assert_eq!(tf32(-3.0 - ulp / 4.0), -3.0);
        assert!(tf32(f32::NAN).is_nan());
        assert_eq!(tf32(f32::INFINITY), f32::INFINITY);

        fastrand::seed(42);
        for _ in 0..1000 {
            let x = fastrand::f32() * 2.0 - 1.0;
            let y = tf32(x);
            assert_eq!(y.to_bits() & 0x1fff, 0);
            assert!((x - y).abs() <= x.abs() * 2.0f32.powi(-11));
        }
    }

    #[test]
    fn test_codec() {
        let cases = [
            (DataType::F32, 1.5f32.to_ne_bytes().to_vec(), 1.5f32),
            (DataType::F16, f16::from_f32(-2.25).to_ne_bytes().to_vec(), -2.25),
            (DataType::BF16, bf16::from_f32(384.0).to_ne_bytes().to_vec(), 384.0),
            (DataType::I32, (-7i32).to_ne_bytes().to_vec(), -7.0),
            (DataType::U32, 4096u32.to_ne_bytes().to_vec(), 4096.0),
            (DataType::U8, vec![255u8], 255.0),
        ];
        for (r#type, bytes, value) in cases {
            assert_eq!(bytes.len(), r#type.size());
            assert_eq!(r#type.decode(&bytes), value, "{type}");
        }

        assert_eq!(f16::DATA_TYPE.size(), 2);
        assert_eq!(bf16::from_f32(3.0).to_f32(), 3.0);
        assert!(!DataType::I32.is_float());
    }
}
