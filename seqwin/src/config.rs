//! Configuration of a whole pipeline, from raw text to embedded batches, loadable from a JSON file.
use crate::embedding::EmbeddingConfig;
use crate::error::{ConfigParseSnafu, FileIoSnafu};
use crate::loader::LoaderConfig;
use crate::tokenize::TokenizerConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::path::Path;
use tracing::*;

/// Every section is optional in the file; missing sections and fields take their defaults, and
/// unknown fields are rejected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub tokenizer: TokenizerConfig,
    pub loader: LoaderConfig,
    pub embedding: EmbeddingConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let json = std::fs::read_to_string(path).with_context(|_| FileIoSnafu { path })?;
        let config = serde_json::from_str(&json).with_context(|_| ConfigParseSnafu { path })?;

        debug!(path = %path.display(), ?config, "Loaded config");

        Ok(config)
    }
}
