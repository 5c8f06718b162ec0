//! Turn raw text into the (input, target) token sequences a language model is trained on.
//!
//! The pipeline is: [`tokenize`] text into token IDs, cut the token sequence into overlapping
//! windows with the [`sampler`], group the windows into batches with the [`loader`], and map token
//! IDs to vectors with an [`embedding`] table.
pub mod config;
pub mod embedding;
mod error;
pub mod loader;
pub mod sampler;
pub mod tokenize;

pub use config::Config;
pub use embedding::{DefaultBackend, EmbeddingConfig, EmbeddingTable, GPT2_VOCAB_SIZE};
pub use error::SeqwinError;
pub use loader::{create_dataloader, Batch, Batches, DataLoader, LoaderConfig};
pub use sampler::{next_token_pairs, Sample, SampleSet};
pub use tokenize::{BpeTokenizer, EncodingType, TextEncoder, TokenId, TokenizerConfig};

pub type Result<T> = std::result::Result<T, SeqwinError>;

#[cfg(test)]
pub mod test_helpers {
    use std::sync::OnceLock;
    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

    static TRACING: OnceLock<()> = OnceLock::new();

    /// Initialize tracing for tests with a stdout subscriber.
    /// Safe to call multiple times - will only initialize once.
    pub fn init_test_logging() {
        TRACING.get_or_init(|| {
            let filter = std::env::var("RUST_LOG")
                .map(EnvFilter::new)
                .unwrap_or_else(|_| EnvFilter::new("debug"));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_test_writer()
                .try_init()
                .ok();
        });
    }
}
