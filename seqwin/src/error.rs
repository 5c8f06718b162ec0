use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SeqwinError {
    #[snafu(display("Invalid value for parameter '{name}': {reason}"))]
    InvalidParameter { name: &'static str, reason: String },

    /// A batch was requested but the sample set cannot produce one.
    ///
    /// Building a sample set from a short token sequence is not an error in itself; it simply
    /// yields nothing.  Asking a loader to serve batches from that nothing is.
    #[snafu(display("No data available: {reason}"))]
    NoDataAvailable { reason: String },

    #[snafu(display("Token {token} is outside of the embedding vocabulary of size {vocab_size}"))]
    TokenOutOfRange { token: usize, vocab_size: usize },

    #[snafu(display("Failed to read tensor values: {reason}"))]
    TensorConversion { reason: String },

    /// `tiktoken-rs` reports its errors as `anyhow::Error`
    #[snafu(display("Failed to load the tokenizer: {inner:#}"))]
    Tokenizer { inner: anyhow::Error },

    #[snafu(display("Failed to decode tokens into text: {inner:#}"))]
    Decode { inner: anyhow::Error },

    #[snafu(display("File I/O error on file '{}'", path.display()))]
    FileIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error walking directory '{}'", path.display()))]
    WalkDir {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[snafu(display("Invalid config file '{}'", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
