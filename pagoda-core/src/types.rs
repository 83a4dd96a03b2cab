use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PagodaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F64 => 8,
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F64 => "f64",
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
        }
    }
}

impl FromStr for DType {
    type Err = PagodaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f64" => Ok(DType::F64),
            "f32" => Ok(DType::F32),
            "f16" => Ok(DType::F16),
            "bf16" => Ok(DType::BF16),
            other => Err(PagodaError::InvalidArgument(format!("unknown dtype '{other}'"))),
        }
    }
}

/// How many block-table entries the score and weighted-sum kernels visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationBound {
    /// `ceil(seq_len / block_size)` entries.
    #[default]
    Exact,
    /// `seq_len / block_size + 1` entries. When `seq_len` is a multiple of the
    /// block size the trailing entry is read and its cache block touched, but
    /// no position in it is processed. The caller must populate that slot.
    Legacy,
}

impl IterationBound {
    pub fn blocks_visited(&self, seq_len: usize, block_size: usize) -> usize {
        match self {
            IterationBound::Exact => seq_len.div_ceil(block_size),
            IterationBound::Legacy => seq_len / block_size + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_bound_is_ceil() {
        assert_eq!(IterationBound::Exact.blocks_visited(0, 4), 0);
        assert_eq!(IterationBound::Exact.blocks_visited(3, 4), 1);
        assert_eq!(IterationBound::Exact.blocks_visited(8, 4), 2);
        assert_eq!(IterationBound::Exact.blocks_visited(9, 4), 3);
    }

    #[test]
    fn legacy_bound_reads_one_extra_slot_on_exact_multiples() {
        assert_eq!(IterationBound::Legacy.blocks_visited(8, 4), 3);
        assert_eq!(IterationBound::Legacy.blocks_visited(9, 4), 3);
        assert_eq!(IterationBound::Legacy.blocks_visited(3, 4), 1);
    }

    #[test]
    fn dtype_sizes() {
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
    }

    #[test]
    fn dtype_names_round_trip() {
        for dtype in [DType::F64, DType::F32, DType::F16, DType::BF16] {
            assert_eq!(dtype.name().parse::<DType>().unwrap(), dtype);
        }
        assert_eq!("BF16".parse::<DType>().unwrap(), DType::BF16);
        assert!("f8".parse::<DType>().is_err());
    }
}
