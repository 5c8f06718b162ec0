//! Tokenization functions which process raw text into the integer token IDs consumed by the
//! sampler.
//!
//! The BPE algorithm itself is provided by `tiktoken-rs`; this module only decides which encoding
//! to load, how to get text off of the filesystem, and how to fan out over many files.
use crate::error::{DecodeSnafu, FileIoSnafu, TokenizerSnafu, WalkDirSnafu};
use crate::Result;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::{EnumIter, EnumString, EnumVariantNames};
use tracing::*;

/// A token in its integer form, which is the rank of that token in the encoding's vocabulary.
pub type TokenId = usize;

/// The BPE encoding to use to tokenize text.
///
/// Each of these uses a subword tokenizing approach, but with different sets of tokens and ranks.
/// `gpt2` is the default since that's what GPT-2 style models are trained on.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    EnumString,
    EnumIter,
    EnumVariantNames,
    strum::Display,
    Serialize,
    Deserialize,
)]
pub enum EncodingType {
    #[strum(serialize = "cl100k_base")]
    #[serde(rename = "cl100k_base")]
    Cl100kBase,
    #[strum(serialize = "p50k_base")]
    #[serde(rename = "p50k_base")]
    P50kBase,
    #[strum(serialize = "r50k_base")]
    #[serde(rename = "r50k_base")]
    R50kBase,
    #[strum(serialize = "p50k_edit")]
    #[serde(rename = "p50k_edit")]
    P50kEdit,
    #[default]
    #[strum(serialize = "gpt2")]
    #[serde(rename = "gpt2")]
    Gpt2,
}

impl EncodingType {
    fn tiktoken_tokenizer(self) -> tiktoken_rs::tokenizer::Tokenizer {
        use tiktoken_rs::tokenizer::Tokenizer;

        match self {
            EncodingType::Cl100kBase => Tokenizer::Cl100kBase,
            EncodingType::P50kBase => Tokenizer::P50kBase,
            EncodingType::R50kBase => Tokenizer::R50kBase,
            EncodingType::P50kEdit => Tokenizer::P50kEdit,
            EncodingType::Gpt2 => Tokenizer::Gpt2,
        }
    }
}

/// How to build a [`BpeTokenizer`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenizerConfig {
    pub encoding: EncodingType,

    /// Encode special token strings like `<|endoftext|>` into their special token IDs.  When this
    /// is `false` they are broken up into subword tokens like any other text.
    pub allow_special: bool,
}

/// Anything that can turn text into token IDs and back again.
///
/// Encoding must be deterministic: the same text always yields the same tokens.
pub trait TextEncoder {
    fn encode(&self, text: &str) -> Vec<TokenId>;

    /// Decode tokens back into text.
    ///
    /// This is fallible because a sequence of tokens doesn't necessarily end on a UTF-8
    /// boundary.
    fn decode(&self, tokens: &[TokenId]) -> Result<String>;
}

/// A [`TextEncoder`] backed by one of the `tiktoken` BPE encodings.
///
/// Cloning is cheap; the encoder tables are shared.
#[derive(Clone)]
pub struct BpeTokenizer {
    config: TokenizerConfig,
    bpe: Arc<tiktoken_rs::CoreBPE>,
}

impl BpeTokenizer {
    pub fn new(config: TokenizerConfig) -> Result<Self> {
        let bpe = tiktoken_rs::get_bpe_from_tokenizer(config.encoding.tiktoken_tokenizer())
            .map_err(|e| TokenizerSnafu { inner: e }.build())?;

        debug!(
            encoding = %config.encoding,
            allow_special = config.allow_special,
            "Loaded tokenizer"
        );

        Ok(Self {
            config,
            bpe: Arc::new(bpe),
        })
    }

    pub fn encoding(&self) -> EncodingType {
        self.config.encoding
    }
}

impl std::fmt::Debug for BpeTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpeTokenizer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TextEncoder for BpeTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        if self.config.allow_special {
            self.bpe.encode_with_special_tokens(text)
        } else {
            self.bpe.encode_ordinary(text)
        }
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|e| DecodeSnafu { inner: e }.build())
    }
}

/// The tokens produced from one input file.
#[derive(Debug, Clone)]
pub struct TokenizedFile {
    pub path: Arc<PathBuf>,

    /// Length of the decoded text, in bytes
    pub text_len: usize,

    pub tokens: Vec<TokenId>,
}

/// Read a text file into a `String`.
///
/// The file might or might not be valid UTF-8.  Rather than fail, invalid bytes are replaced with
/// the Unicode replacement character and a warning is logged.
pub async fn read_text(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();

    let contents = tokio::fs::read(path)
        .await
        .with_context(|_| FileIoSnafu { path })?;

    match String::from_utf8(contents) {
        Ok(text) => Ok(text),
        Err(e) => {
            warn!(path = %path.display(),
                "Input file did not decode as clean UTF-8.   \
                Invalid bytes have been replaced with a UTF-8 placeholder sequence.   \
                The resulting tokens will not be able to precisely reproduce this file");
            Ok(String::from_utf8_lossy(e.as_bytes()).into_owned())
        }
    }
}

/// Tokenize a single file.
///
/// If you need to tokenize many files, [`tokenize_files`] or [`tokenize_files_streaming`] will
/// read them concurrently.
pub async fn tokenize_file<T: TextEncoder + ?Sized>(
    tokenizer: &T,
    path: impl Into<PathBuf>,
) -> Result<TokenizedFile> {
    let path = path.into();
    let text = read_text(&path).await?;
    let tokens = tokenizer.encode(&text);

    debug!(path = %path.display(), bytes = text.len(), tokens = tokens.len(), "Tokenized file");

    Ok(TokenizedFile {
        path: Arc::new(path),
        text_len: text.len(),
        tokens,
    })
}

/// Expand the given paths into the list of regular files they denote.
///
/// Files are passed through as-is.  Directories are walked recursively and every regular file
/// below them is included, in file name order.
pub fn expand_paths<I, P>(paths: I) -> Result<Vec<PathBuf>>
where
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    let mut files = Vec::new();

    for path in paths {
        let path = path.into();

        if path.is_dir() {
            for entry in walkdir::WalkDir::new(&path).sort_by_file_name() {
                let entry = entry.with_context(|_| WalkDirSnafu { path: path.clone() })?;
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
        } else {
            files.push(path);
        }
    }

    Ok(files)
}

fn max_parallel_files() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Tokenize one or more files (or directories of files) concurrently.
///
/// The result is a `Stream` that yields the results of tokenizing each file, in whatever order
/// they complete.
pub fn tokenize_files_streaming<'a, T, I, P>(
    tokenizer: &'a T,
    paths: I,
) -> Result<impl Stream<Item = Result<TokenizedFile>> + 'a>
where
    T: TextEncoder + ?Sized,
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    let files = expand_paths(paths)?;

    Ok(stream_files(tokenizer, files))
}

fn stream_files<'a, T: TextEncoder + ?Sized>(
    tokenizer: &'a T,
    files: Vec<PathBuf>,
) -> impl Stream<Item = Result<TokenizedFile>> + 'a {
    let tokenize_futs = files
        .into_iter()
        .map(move |file| tokenize_file(tokenizer, file));

    futures::stream::iter(tokenize_futs).buffer_unordered(max_parallel_files())
}

/// Tokenize one or more files (or directories of files) concurrently.
///
/// Unlike [`tokenize_files_streaming`], results are returned in the same order as the expanded
/// input paths, and nothing is returned until every file has been processed.
pub async fn tokenize_files<T, I, P>(
    tokenizer: &T,
    paths: I,
) -> Result<Vec<Result<TokenizedFile>>>
where
    T: TextEncoder + ?Sized,
    I: IntoIterator<Item = P>,
    P: Into<PathBuf>,
{
    let files = expand_paths(paths)?;

    let tokenize_futs = files
        .into_iter()
        .map(|file| tokenize_file(tokenizer, file));

    let results = futures::stream::iter(tokenize_futs)
        .buffered(max_parallel_files())
        .collect()
        .await;

    Ok(results)
}
