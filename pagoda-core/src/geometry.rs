//! Fixed addressing geometry shared by every kernel.
//!
//! Layouts, all row-major:
//! - query / output: `[num_q_heads, head_dim]`
//! - cache (keys and values separately): `[layer, block, kv_head, slot, head_dim]`
//! - scores: `[token, num_q_heads]`, so the query heads of one kv-head group
//!   are adjacent
//! - softmax statistics: `[num_q_heads]`

use serde::{Deserialize, Serialize};

use crate::error::{PagodaError, Result};
use crate::types::IterationBound;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawGeometry")]
pub struct Geometry {
    num_q_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    block_size: usize,
}

/// Unchecked wire form; deserialization goes through [`Geometry::new`].
#[derive(Deserialize)]
struct RawGeometry {
    num_q_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    block_size: usize,
}

impl TryFrom<RawGeometry> for Geometry {
    type Error = PagodaError;

    fn try_from(raw: RawGeometry) -> Result<Self> {
        Geometry::new(raw.num_q_heads, raw.num_kv_heads, raw.head_dim, raw.block_size)
    }
}

impl Geometry {
    pub fn new(
        num_q_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        block_size: usize,
    ) -> Result<Self> {
        if num_q_heads == 0 || num_kv_heads == 0 || head_dim == 0 || block_size == 0 {
            return Err(PagodaError::InvalidGeometry(format!(
                "all dimensions must be non-zero (q_heads={num_q_heads}, kv_heads={num_kv_heads}, \
                 head_dim={head_dim}, block_size={block_size})"
            )));
        }
        if num_q_heads % num_kv_heads != 0 {
            return Err(PagodaError::InvalidGeometry(format!(
                "num_q_heads {num_q_heads} is not a multiple of num_kv_heads {num_kv_heads}"
            )));
        }
        Ok(Self {
            num_q_heads,
            num_kv_heads,
            head_dim,
            block_size,
        })
    }

    #[inline]
    pub fn num_q_heads(&self) -> usize {
        self.num_q_heads
    }

    #[inline]
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    #[inline]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Query heads sharing one kv-head.
    #[inline]
    pub fn group_size(&self) -> usize {
        self.num_q_heads / self.num_kv_heads
    }

    #[inline]
    pub fn kv_head_of(&self, q_head: usize) -> usize {
        q_head / self.group_size()
    }

    /// Length of a query or output vector.
    #[inline]
    pub fn q_len(&self) -> usize {
        self.num_q_heads * self.head_dim
    }

    /// num_kv_heads * head_dim: one token's K (or V) row.
    #[inline]
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Elements of one (block, kv_head) tile: `block_size * head_dim`.
    #[inline]
    pub fn head_block_len(&self) -> usize {
        self.block_size * self.head_dim
    }

    /// Elements of one physical block across all kv-heads.
    #[inline]
    pub fn block_len(&self) -> usize {
        self.num_kv_heads * self.head_block_len()
    }

    /// Offset of `(block, kv_head, slot = 0, dim = 0)` inside one layer.
    #[inline]
    pub fn head_block_offset(&self, block_id: usize, kv_head: usize) -> usize {
        block_id * self.block_len() + kv_head * self.head_block_len()
    }

    /// Score buffer length for `seq_len` tokens.
    #[inline]
    pub fn scores_len(&self, seq_len: usize) -> usize {
        seq_len * self.num_q_heads
    }

    /// Valid tokens in logical block `index` of a sequence of `seq_len` tokens.
    #[inline]
    pub fn valid_in_block(&self, index: usize, seq_len: usize) -> usize {
        seq_len
            .saturating_sub(index * self.block_size)
            .min(self.block_size)
    }

    /// Block-table entries a kernel visits under `bound`.
    #[inline]
    pub fn blocks_visited(&self, seq_len: usize, bound: IterationBound) -> usize {
        bound.blocks_visited(seq_len, self.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_integer_group() {
        assert!(Geometry::new(6, 4, 8, 16).is_err());
        assert!(Geometry::new(0, 1, 8, 16).is_err());
        assert!(Geometry::new(8, 2, 8, 0).is_err());
    }

    #[test]
    fn grouped_query_mapping() {
        let g = Geometry::new(8, 2, 4, 16).unwrap();
        assert_eq!(g.group_size(), 4);
        assert_eq!(g.kv_head_of(0), 0);
        assert_eq!(g.kv_head_of(3), 0);
        assert_eq!(g.kv_head_of(4), 1);
        assert_eq!(g.kv_head_of(7), 1);
        assert_eq!(g.q_len(), 32);
        assert_eq!(g.kv_dim(), 8);
    }

    #[test]
    fn cache_offsets() {
        let g = Geometry::new(4, 2, 3, 5).unwrap();
        assert_eq!(g.head_block_len(), 15);
        assert_eq!(g.block_len(), 30);
        assert_eq!(g.head_block_offset(0, 1), 15);
        assert_eq!(g.head_block_offset(2, 1), 75);
    }

    #[test]
    fn partial_final_block() {
        let g = Geometry::new(1, 1, 1, 4).unwrap();
        assert_eq!(g.valid_in_block(0, 10), 4);
        assert_eq!(g.valid_in_block(2, 10), 2);
        assert_eq!(g.valid_in_block(3, 12), 0);
    }

    #[test]
    fn deserialize_validates_dimensions() {
        let g: Geometry = serde_json::from_str(
            r#"{"num_q_heads":8,"num_kv_heads":2,"head_dim":4,"block_size":16}"#,
        )
        .unwrap();
        assert_eq!(g, Geometry::new(8, 2, 4, 16).unwrap());
        assert_eq!(serde_json::from_str::<Geometry>(&serde_json::to_string(&g).unwrap()).unwrap(), g);

        let uneven = serde_json::from_str::<Geometry>(
            r#"{"num_q_heads":3,"num_kv_heads":2,"head_dim":1,"block_size":1}"#,
        );
        assert!(uneven.unwrap_err().to_string().contains("not a multiple"));

        for zero in [
            r#"{"num_q_heads":2,"num_kv_heads":0,"head_dim":1,"block_size":1}"#,
            r#"{"num_q_heads":2,"num_kv_heads":1,"head_dim":0,"block_size":1}"#,
        ] {
            assert!(serde_json::from_str::<Geometry>(zero).is_err());
        }
    }
}
