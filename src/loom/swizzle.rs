use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{layout::LayoutError, num::DataType};

/// Shared-memory swizzle: within every 8-row pattern of `period`-byte rows, the 16-byte groups
/// of a row are permuted by XOR-ing the group index with the row index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Swizzle {
    #[display("swizzle(128B)")]
    B128,
}

impl Swizzle {
    const GROUP_BYTES: usize = 16;
    const ROWS: usize = 8;

    /// Selects the swizzle of a period in bytes.
    pub fn from_bytes(bytes: usize) -> Result<Self, LayoutError> {
        match bytes {
            128 => Ok(Self::B128),
            bytes => Err(LayoutError::Swizzle(bytes)),
        }
    }

    /// Row length of the pattern in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Swizzle::B128 => 128,
        }
    }

    /// Number of elements of `r#type` in one pattern tile.
    #[inline]
    pub fn tile_elements(self, r#type: DataType) -> usize {
        self.bytes() * Self::ROWS / r#type.size()
    }

    /// Checks that `len` elements of `r#type` cover whole swizzle rows,
    /// the extent on which [`Swizzle::apply`] is a permutation.
    pub fn check(self, len: usize, r#type: DataType) -> Result<(), LayoutError> {
        match (len * r#type.size()) % self.bytes() {
            0 => Ok(()),
            _ => Err(LayoutError::SwizzleExtent(len, r#type, self.bytes())),
        }
    }

    /// Maps a linear element offset to its swizzled offset.
    /// Offsets keep their tile; applying the mapping twice yields the input.
    pub fn apply(self, offset: usize, r#type: DataType) -> usize {
        let bytes = r#type.size();
        let elems_per_row = self.bytes() / bytes;
        let elems_per_tile = elems_per_row * Self::ROWS;
        let elems_per_group = Self::GROUP_BYTES / bytes;

        let tile_offset = offset % elems_per_tile;
        let tile_start = offset - tile_offset;
        let row = tile_offset / elems_per_row;
        let row_offset = tile_offset % elems_per_row;

        let src_group = row_offset / elems_per_group;
        let group_offset = row_offset % elems_per_group;
        let dst_group = src_group ^ row;

        tile_start + row * elems_per_row + dst_group * elems_per_group + group_offset
    }
}
