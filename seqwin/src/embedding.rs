//! Lookup tables mapping token IDs (or positions) to dense vectors, built on `burn`'s
//! [`Embedding`] layer.
//!
//! Training the weights is out of scope here; a table either comes with weights, or starts out
//! with the standard normal weights of a freshly constructed layer.
use crate::error::{InvalidParameterSnafu, TensorConversionSnafu, TokenOutOfRangeSnafu};
use crate::loader::Batch;
use crate::tokenize::TokenId;
use crate::Result;
use burn::module::Param;
use burn::nn::Embedding;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Int, Tensor, TensorData};
use serde::{Deserialize, Serialize};
use snafu::ensure;
use std::sync::{Mutex, PoisonError};
use tracing::*;

/// Vocabulary size of the GPT-2 BPE encoding
pub const GPT2_VOCAB_SIZE: usize = 50257;

/// The backend tables are built on unless a caller picks another one
pub type DefaultBackend = burn::backend::NdArray;

/// Backends seed a single global RNG, so seeding and drawing the weights must not interleave with
/// another table doing the same.
static BACKEND_RNG: Mutex<()> = Mutex::new(());

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    pub vocab_size: usize,
    pub output_dim: usize,

    /// Seed for the random initial weights.  With no seed they differ on every run.
    ///
    /// The positional table is seeded with `seed + 1` so the two tables are independent.
    pub seed: Option<u64>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            vocab_size: GPT2_VOCAB_SIZE,
            output_dim: 256,
            seed: None,
        }
    }
}

/// A `vocab_size x output_dim` embedding layer; row `i` of its weights is the vector for token
/// `i`.
#[derive(Clone, Debug)]
pub struct EmbeddingTable<B: Backend = DefaultBackend> {
    layer: Embedding<B>,
    vocab_size: usize,
    output_dim: usize,
}

impl<B: Backend> EmbeddingTable<B> {
    /// Make a table from row-major `weights`, which must hold exactly `vocab_size * output_dim`
    /// values.
    pub fn from_weights(
        vocab_size: usize,
        output_dim: usize,
        weights: Vec<f32>,
        device: &B::Device,
    ) -> Result<Self> {
        let len = check_dimensions(vocab_size, output_dim)?;
        ensure!(
            weights.len() == len,
            InvalidParameterSnafu {
                name: "weights",
                reason: format!(
                    "expected {vocab_size} x {output_dim} weights but got {}",
                    weights.len()
                ),
            }
        );

        let weights =
            Tensor::<B, 2>::from_data(TensorData::new(weights, [vocab_size, output_dim]), device);

        Ok(Self::from_tensor(weights))
    }

    /// Make a table with weights drawn from N(0, 1), the initialization of a new `Embedding`
    /// layer.  With a `seed` the weights are the same on every run.
    pub fn random(
        vocab_size: usize,
        output_dim: usize,
        seed: Option<u64>,
        device: &B::Device,
    ) -> Result<Self> {
        check_dimensions(vocab_size, output_dim)?;

        let weights = {
            let _guard = BACKEND_RNG.lock().unwrap_or_else(PoisonError::into_inner);
            B::seed(seed.unwrap_or_else(rand::random));
            Tensor::<B, 2>::random(
                [vocab_size, output_dim],
                Distribution::Normal(0.0, 1.0),
                device,
            )
        };

        debug!(vocab_size, output_dim, ?seed, "Initialized random embedding table");

        Ok(Self::from_tensor(weights))
    }

    /// The token table described by `config`.
    pub fn from_config(config: &EmbeddingConfig, device: &B::Device) -> Result<Self> {
        Self::random(config.vocab_size, config.output_dim, config.seed, device)
    }

    /// The absolute position table matching the token table of `config`: one row for each of
    /// `context_length` positions, with the same `output_dim`.
    ///
    /// Its seed is derived from, but never equal to, the token table's seed.
    pub fn positions(
        config: &EmbeddingConfig,
        context_length: usize,
        device: &B::Device,
    ) -> Result<Self> {
        Self::random(
            context_length,
            config.output_dim,
            config.seed.map(|seed| seed.wrapping_add(1)),
            device,
        )
    }

    fn from_tensor(weights: Tensor<B, 2>) -> Self {
        let [vocab_size, output_dim] = weights.dims();

        Self {
            layer: Embedding {
                weight: Param::from_tensor(weights),
            },
            vocab_size,
            output_dim,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// The `vocab_size x output_dim` weight matrix
    pub fn weights(&self) -> Tensor<B, 2> {
        self.layer.weight.val()
    }

    /// The vector for `token`.
    pub fn lookup(&self, token: TokenId) -> Result<Vec<f32>> {
        self.check_token(token)?;

        to_vec(
            self.weights()
                .slice([token..token + 1, 0..self.output_dim]),
        )
    }

    /// Look up every input token of `batch`, producing a `[rows, max_length, output_dim]` tensor.
    pub fn embed(&self, batch: &Batch) -> Result<Tensor<B, 3>> {
        for &token in batch.inputs() {
            self.check_token(token)?;
        }

        Ok(self.layer.forward(input_ids(batch, &self.device())))
    }

    /// Add absolute position embeddings to `embeddings`, treating this table as the position
    /// table: row `p` is added to the vector at position `p` of every sequence.
    ///
    /// The table must have the same `output_dim` as `embeddings` and at least as many rows as the
    /// sequences are long.
    pub fn add_positional(&self, embeddings: Tensor<B, 3>) -> Result<Tensor<B, 3>> {
        let [_, length, dim] = embeddings.dims();

        ensure!(
            self.output_dim == dim,
            InvalidParameterSnafu {
                name: "positions",
                reason: format!(
                    "positional vectors have {} dimensions but token vectors have {dim}",
                    self.output_dim
                ),
            }
        );
        ensure!(
            self.vocab_size >= length,
            InvalidParameterSnafu {
                name: "positions",
                reason: format!(
                    "{} positions cannot cover sequences of length {length}",
                    self.vocab_size
                ),
            }
        );

        let positions = Tensor::<B, 1, Int>::arange(0..length as i64, &self.device()).unsqueeze();
        let offsets = self.layer.forward(positions);

        Ok(embeddings.clone() + offsets.expand(embeddings.shape()))
    }

    fn device(&self) -> B::Device {
        self.layer.weight.val().device()
    }

    fn check_token(&self, token: TokenId) -> Result<()> {
        ensure!(
            token < self.vocab_size,
            TokenOutOfRangeSnafu {
                token,
                vocab_size: self.vocab_size,
            }
        );

        Ok(())
    }
}

/// The input tokens of `batch` as a `[rows, max_length]` integer tensor
pub fn input_ids<B: Backend>(batch: &Batch, device: &B::Device) -> Tensor<B, 2, Int> {
    let (rows, max_length) = batch.shape();
    let ids: Vec<i64> = batch.inputs().iter().map(|&token| token as i64).collect();

    Tensor::from_data(TensorData::new(ids, [rows, max_length]), device)
}

/// Copy the values of a float tensor out in row-major order.
pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| {
            TensorConversionSnafu {
                reason: format!("{err:?}"),
            }
            .build()
        })
}

/// Checks both dimensions are positive, returning the number of weights in the table.
fn check_dimensions(vocab_size: usize, output_dim: usize) -> Result<usize> {
    ensure!(
        vocab_size > 0,
        InvalidParameterSnafu {
            name: "vocab_size",
            reason: "an embedding table needs at least one row",
        }
    );
    ensure!(
        output_dim > 0,
        InvalidParameterSnafu {
            name: "output_dim",
            reason: "embedding vectors need at least one dimension",
        }
    );

    vocab_size.checked_mul(output_dim).ok_or_else(|| {
        InvalidParameterSnafu {
            name: "output_dim",
            reason: format!("a {vocab_size} x {output_dim} table does not fit in memory"),
        }
        .build()
    })
}
