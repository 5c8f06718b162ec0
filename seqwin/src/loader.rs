//! Grouping samples into fixed size batches for a training loop, optionally shuffled.
use crate::error::{InvalidParameterSnafu, NoDataAvailableSnafu};
use crate::sampler::SampleSet;
use crate::tokenize::{TextEncoder, TokenId};
use crate::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tracing::*;

/// Parameters for [`create_dataloader`].
///
/// `max_length` and `stride` control how the token sequence is cut into samples; the rest control
/// how the samples are served up as batches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub max_length: usize,
    pub stride: usize,

    /// Visit the samples in a new random order on every epoch
    pub shuffle: bool,

    /// Skip the last batch of an epoch if it has fewer than `batch_size` samples
    pub drop_last: bool,

    /// Seed for the shuffle order.  With no seed the order is different on every run.
    pub seed: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            max_length: 256,
            stride: 128,
            shuffle: true,
            drop_last: true,
            seed: None,
        }
    }
}

/// A group of samples, stored row-major: row `i` of the inputs is
/// `inputs[i * max_length..(i + 1) * max_length]`, and likewise for the targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    rows: usize,
    max_length: usize,
    inputs: Vec<TokenId>,
    targets: Vec<TokenId>,
}

impl Batch {
    /// `(rows, max_length)`, the shape of both the inputs and the targets
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.max_length)
    }

    pub fn inputs(&self) -> &[TokenId] {
        &self.inputs
    }

    pub fn targets(&self) -> &[TokenId] {
        &self.targets
    }

    pub fn input_row(&self, row: usize) -> Option<&[TokenId]> {
        Self::row(&self.inputs, self.max_length, row)
    }

    pub fn target_row(&self, row: usize) -> Option<&[TokenId]> {
        Self::row(&self.targets, self.max_length, row)
    }

    /// Iterate over the `(input, target)` rows of the batch
    pub fn rows(&self) -> impl Iterator<Item = (&[TokenId], &[TokenId])> {
        self.inputs
            .chunks_exact(self.max_length)
            .zip(self.targets.chunks_exact(self.max_length))
    }

    fn row(tokens: &[TokenId], max_length: usize, row: usize) -> Option<&[TokenId]> {
        let start = row.checked_mul(max_length)?;
        tokens.get(start..start.checked_add(max_length)?)
    }
}

/// Serves the samples of a [`SampleSet`] as batches, one epoch at a time.
#[derive(Debug)]
pub struct DataLoader {
    samples: SampleSet,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    rng: StdRng,
}

impl DataLoader {
    /// Wrap `samples` in a loader configured by the batching fields of `config`.
    ///
    /// Fails with `NoDataAvailable` if not a single batch could be produced: either because the
    /// sample set is empty, or because it's smaller than one batch and `drop_last` is set.
    pub fn new(samples: SampleSet, config: &LoaderConfig) -> Result<Self> {
        ensure!(
            config.batch_size > 0,
            InvalidParameterSnafu {
                name: "batch_size",
                reason: "the batch size must be positive",
            }
        );
        ensure!(
            !samples.is_empty(),
            NoDataAvailableSnafu {
                reason: format!(
                    "a token sequence of length {} is too short for windows of {} tokens",
                    samples.tokens().len(),
                    samples.max_length()
                ),
            }
        );
        ensure!(
            !config.drop_last || samples.len() >= config.batch_size,
            NoDataAvailableSnafu {
                reason: format!(
                    "only {} samples, which is less than one batch of {} and the last partial \
                    batch is dropped",
                    samples.len(),
                    config.batch_size
                ),
            }
        );

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let loader = Self {
            samples,
            batch_size: config.batch_size,
            shuffle: config.shuffle,
            drop_last: config.drop_last,
            rng,
        };

        debug!(
            samples = loader.samples.len(),
            batch_size = loader.batch_size,
            batches = loader.num_batches(),
            shuffle = loader.shuffle,
            drop_last = loader.drop_last,
            "Created data loader"
        );

        Ok(loader)
    }

    /// Number of samples, including any that a dropped last batch would skip
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Always `false`; a loader is never created over an empty sample set.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &SampleSet {
        &self.samples
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches in each epoch
    pub fn num_batches(&self) -> usize {
        if self.drop_last {
            self.samples.len() / self.batch_size
        } else {
            self.samples.len().div_ceil(self.batch_size)
        }
    }

    /// Start a new epoch.
    ///
    /// With shuffling enabled every call visits the samples in a fresh random order.
    pub fn iter(&mut self) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }

        Batches {
            samples: &self.samples,
            order,
            batch_size: self.batch_size,
            drop_last: self.drop_last,
            pos: 0,
        }
    }
}

/// Iterator over the batches of one epoch.  See [`DataLoader::iter`].
pub struct Batches<'a> {
    samples: &'a SampleSet,

    /// Sample indexes in the order they are served in this epoch
    order: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    pos: usize,
}

impl Batches<'_> {
    fn remaining(&self) -> usize {
        let left = self.order.len() - self.pos;

        if self.drop_last {
            left / self.batch_size
        } else {
            left.div_ceil(self.batch_size)
        }
    }
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining() == 0 {
            return None;
        }

        let rows = std::cmp::min(self.batch_size, self.order.len() - self.pos);
        let max_length = self.samples.max_length();
        let mut inputs = Vec::with_capacity(rows * max_length);
        let mut targets = Vec::with_capacity(rows * max_length);

        for sample in self.order[self.pos..self.pos + rows]
            .iter()
            .filter_map(|&index| self.samples.get(index))
        {
            inputs.extend_from_slice(sample.input);
            targets.extend_from_slice(sample.target);
        }
        debug_assert_eq!(rows * max_length, inputs.len());

        self.pos += rows;
        trace!(rows, pos = self.pos, "Assembled batch");

        Some(Batch {
            rows,
            max_length,
            inputs,
            targets,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}

/// Tokenize `text`, cut it into samples and wrap them in a [`DataLoader`], all according to
/// `config`.
pub fn create_dataloader<T: TextEncoder + ?Sized>(
    text: &str,
    tokenizer: &T,
    config: &LoaderConfig,
) -> Result<DataLoader> {
    let tokens = tokenizer.encode(text);
    let samples = SampleSet::build(tokens, config.max_length, config.stride)?;

    DataLoader::new(samples, config)
}
