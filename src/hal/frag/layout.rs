use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::FragmentError;
use crate::loom::layout::{Layout, Shape};

/// How the elements of a fragmented array are spread over the registers of a warpgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FragLayout {
    /// The matrix accumulator layout. A `(m, n)` array is cut into `64 × 8` register tiles;
    /// in each tile, warp `w` holds rows `16w..16w + 16`, and each lane holds two consecutive
    /// columns of two rows eight apart.
    #[display("wgmma")]
    Wgmma,
    /// One value per row of a [`FragLayout::Wgmma`] array, replicated over the four lanes sharing that row.
    #[display("wgmma_row")]
    WgmmaRow,
    /// Vectors of `vec_size` consecutive elements of the flattened array, dealt round-robin to lanes.
    #[display("strided({vec_size})")]
    Strided { vec_size: usize },
}

impl FragLayout {
    /// Lanes in a warpgroup.
    pub const LANES: usize = 128;
    /// Lanes in a warp.
    pub const WARP: usize = 32;
    /// Rows of one register tile.
    pub const TILE_ROWS: usize = 64;
    /// Columns of one register tile.
    pub const TILE_COLS: usize = 8;

    /// Checks that `shape` can be laid out.
    pub fn check(self, shape: &Shape) -> Result<(), FragmentError> {
        let valid = match (self, shape.as_slice()) {
            (FragLayout::Wgmma, &[m, n]) => {
                m > 0 && n > 0 && m % Self::TILE_ROWS == 0 && n % Self::TILE_COLS == 0
            }
            (FragLayout::WgmmaRow, &[m]) => m > 0 && m % Self::TILE_ROWS == 0,
            (FragLayout::Strided { vec_size }, _) => {
                vec_size > 0 && shape.size() > 0 && shape.size() % (Self::LANES * vec_size) == 0
            }
            _ => false,
        };
        match valid {
            true => Ok(()),
            false => Err(FragmentError::Shape(self, shape.clone())),
        }
    }

    /// Registers per lane.
    pub fn slots(self, shape: &Shape) -> usize {
        match self {
            FragLayout::Wgmma => {
                (shape[0] / Self::TILE_ROWS) * (shape[1] / Self::TILE_COLS) * 4
            }
            FragLayout::WgmmaRow => (shape[0] / Self::TILE_ROWS) * 2,
            FragLayout::Strided { .. } => shape.size() / Self::LANES,
        }
    }

    /// Row held by `lane` in half `half` of a register tile.
    #[inline]
    fn row(lane: usize, half: usize) -> usize {
        (lane / Self::WARP) * 16 + half * 8 + (lane % Self::WARP) / 4
    }

    /// Logical coordinates of the element `lane` holds in register `slot`.
    pub fn locate(self, shape: &Shape, lane: usize, slot: usize) -> Vec<usize> {
        match self {
            FragLayout::Wgmma => {
                let tiles = shape[1] / Self::TILE_COLS;
                let e = slot % 2;
                let half = (slot / 2) % 2;
                let ct = (slot / 4) % tiles;
                let rt = slot / (4 * tiles);
                let row = rt * Self::TILE_ROWS + Self::row(lane, half);
                let col = ct * Self::TILE_COLS + (lane % 4) * 2 + e;
                vec![row, col]
            }
            FragLayout::WgmmaRow => {
                let half = slot % 2;
                let rt = slot / 2;
                vec![rt * Self::TILE_ROWS + Self::row(lane, half)]
            }
            FragLayout::Strided { vec_size } => {
                let index = (slot / vec_size * Self::LANES + lane) * vec_size + slot % vec_size;
                Layout::from_shape(shape.clone()).unravel(index).0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::FragLayout;
    use crate::loom::layout::{IndexFn, Layout, Shape};

    #[test]
    fn test_wgmma_layout() {
        let shape = Shape::from([128, 32]);
        let layout = FragLayout::Wgmma;
        layout.check(&shape).expect("valid shape");
        let slots = layout.slots(&shape);
        assert_eq!(slots, 2 * 4 * 4);

        // lane 37 is in warp 1, group row 1, column pair 1
        assert_eq!(layout.locate(&shape, 37, 0), vec![17, 2]);
        assert_eq!(layout.locate(&shape, 37, 3), vec![25, 3]);
        assert_eq!(layout.locate(&shape, 37, 4), vec![17, 10]);
        assert_eq!(layout.locate(&shape, 37, 16), vec![81, 2]);

        // every element is held exactly once
        let dense = Layout::from_shape(shape.clone());
        let indices = itertools::iproduct!(0..FragLayout::LANES, 0..slots)
            .map(|(lane, slot)| dense.value(layout.locate(&shape, lane, slot).as_slice()))
            .collect_vec();
        assert!(indices.iter().all_unique());
        assert_eq!(indices.len(), shape.size());
    }

    #[test]
    fn test_row_layout() {
        let shape = Shape::from([128]);
        let layout = FragLayout::WgmmaRow;
        assert_eq!(layout.slots(&shape), 4);

        // the four lanes of a quad share their rows
        for lane in 0..FragLayout::LANES {
            for slot in 0..4 {
                let quad = lane - lane % 4;
                assert_eq!(layout.locate(&shape, lane, slot), layout.locate(&shape, quad, slot));
            }
        }
        let rows = itertools::iproduct!((0..FragLayout::LANES).step_by(4), 0..4)
            .map(|(lane, slot)| layout.locate(&shape, lane, slot)[0])
            .sorted()
            .collect_vec();
        assert_eq!(rows, (0..128).collect_vec());
    }

    #[test]
    fn test_strided_layout() {
        let shape = Shape::from([4, 256]);
        let layout = FragLayout::Strided { vec_size: 2 };
        layout.check(&shape).expect("valid shape");
        assert_eq!(layout.slots(&shape), 8);
        assert_eq!(layout.locate(&shape, 1, 1), vec![0, 3]);
        assert_eq!(layout.locate(&shape, 0, 2), vec![1, 0]);

        assert!(FragLayout::Strided { vec_size: 8 }.check(&Shape::from([8, 100])).is_err());
        assert!(FragLayout::Wgmma.check(&Shape::from([64, 12])).is_err());
        assert!(FragLayout::WgmmaRow.check(&Shape::from([64, 8])).is_err());
    }
}
