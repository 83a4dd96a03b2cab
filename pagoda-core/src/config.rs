use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PagodaError, Result};
use crate::geometry::Geometry;
use crate::types::{DType, IterationBound};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub head_dim: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
    #[serde(default = "default_max_blocks_per_seq")]
    pub max_blocks_per_seq: usize,
    #[serde(default)]
    pub iteration_bound: IterationBound,
    #[serde(default = "default_cache_dtype")]
    pub cache_dtype: DType,
    /// Softmax scale; `1 / sqrt(head_dim)` when absent.
    #[serde(default)]
    pub softmax_scale: Option<f32>,
}

fn default_num_layers() -> usize {
    1
}
fn default_block_size() -> usize {
    16
}
fn default_num_blocks() -> usize {
    1024
}
fn default_max_blocks_per_seq() -> usize {
    512
}
fn default_cache_dtype() -> DType {
    DType::F32
}

impl EngineConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.geometry()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(
            self.num_attention_heads,
            self.num_key_value_heads.unwrap_or(self.num_attention_heads),
            self.head_dim,
            self.block_size,
        )
    }

    /// Maximum sequence length in tokens.
    pub fn max_seq_len(&self) -> usize {
        self.block_size * self.max_blocks_per_seq
    }

    /// Maximum number of tokens the whole pool can hold.
    pub fn max_cached_tokens(&self) -> usize {
        self.block_size * self.num_blocks
    }

    pub fn softmax_scale(&self) -> f32 {
        self.softmax_scale
            .unwrap_or_else(|| 1.0 / (self.head_dim as f32).sqrt())
    }

    pub fn check_seq_len(&self, seq_len: usize) -> Result<()> {
        if seq_len == 0 || seq_len > self.max_seq_len() {
            return Err(PagodaError::InvalidArgument(format!(
                "sequence length {seq_len} outside 1..={}",
                self.max_seq_len()
            )));
        }
        Ok(())
    }
}
