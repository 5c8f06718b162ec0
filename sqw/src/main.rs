use clap::{Args, Parser, Subcommand};
use seqwin::{
    BpeTokenizer, Config, DataLoader, EmbeddingTable, EncodingType, SampleSet, TextEncoder,
    TokenId,
};
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::*;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    globals: Globals,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Globals {
    /// Read tokenizer, loader and embedding settings from a JSON config file.
    ///
    /// Command line options override the values in the file.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,

    /// The BPE encoding used to tokenize the input text
    #[arg(long, env = "SQW_ENCODING", global = true)]
    encoding: Option<EncodingType>,

    /// Encode special token strings like `<|endoftext|>` as special tokens
    #[arg(long, global = true)]
    allow_special: bool,
}

/// Options controlling how the token sequence is cut into windows
#[derive(Args)]
struct WindowArgs {
    /// Number of tokens in each input window
    #[arg(long)]
    max_length: Option<usize>,

    /// Number of tokens between the starts of consecutive windows
    #[arg(long)]
    stride: Option<usize>,
}

/// Options controlling how windows are grouped into batches
#[derive(Args)]
struct BatchArgs {
    #[command(flatten)]
    window: WindowArgs,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Serve the samples in random order
    #[arg(long, overrides_with = "no_shuffle")]
    shuffle: bool,

    /// Serve the samples in order
    #[arg(long)]
    no_shuffle: bool,

    /// Skip a final batch which has fewer than `batch_size` samples
    #[arg(long, overrides_with = "keep_last")]
    drop_last: bool,

    /// Keep a final batch which has fewer than `batch_size` samples
    #[arg(long)]
    keep_last: bool,

    /// Seed for the shuffle order, for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Tokenize files (or every file in a directory) and report their tokens
    Tokenize {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// How many of the leading token IDs to print for each file
        #[arg(long, default_value_t = 20)]
        show: usize,
    },

    /// Show the growing contexts and the token each one should predict
    Contexts {
        file: PathBuf,

        #[arg(long, default_value_t = 4)]
        context_size: usize,

        /// Number of leading tokens to skip before building contexts
        #[arg(long, default_value_t = 50)]
        offset: usize,
    },

    /// Print the (input, target) samples produced by the sliding window
    Samples {
        file: PathBuf,

        #[command(flatten)]
        window: WindowArgs,

        /// Print at most this many samples
        #[arg(long, default_value_t = 2)]
        limit: usize,
    },

    /// Print the batches served by the data loader for one epoch
    Batches {
        file: PathBuf,

        #[command(flatten)]
        batch: BatchArgs,

        /// Print at most this many batches
        #[arg(long, default_value_t = 1)]
        limit: usize,
    },

    /// Embed the first batch and report the shapes of the resulting tensors
    Embed {
        file: PathBuf,

        #[command(flatten)]
        batch: BatchArgs,

        /// Dimension of the embedding vectors
        #[arg(long)]
        output_dim: Option<usize>,

        /// Number of rows in the token embedding table
        #[arg(long)]
        vocab_size: Option<usize>,

        /// Seed for the random embedding weights
        #[arg(long)]
        embedding_seed: Option<u64>,
    },
}

impl Globals {
    /// Load the config file, if any, and apply the global command line overrides to it
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                debug!("Value for config: {}", path.display());
                Config::load(path)?
            }
            None => Config::default(),
        };

        if let Some(encoding) = self.encoding {
            config.tokenizer.encoding = encoding;
        }
        if self.allow_special {
            config.tokenizer.allow_special = true;
        }

        Ok(config)
    }
}

impl WindowArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(max_length) = self.max_length {
            config.loader.max_length = max_length;
        }
        if let Some(stride) = self.stride {
            config.loader.stride = stride;
        }
    }
}

impl BatchArgs {
    fn apply(&self, config: &mut Config) {
        self.window.apply(config);

        if let Some(batch_size) = self.batch_size {
            config.loader.batch_size = batch_size;
        }
        if self.shuffle {
            config.loader.shuffle = true;
        }
        if self.no_shuffle {
            config.loader.shuffle = false;
        }
        if self.drop_last {
            config.loader.drop_last = true;
        }
        if self.keep_last {
            config.loader.drop_last = false;
        }
        if self.seed.is_some() {
            config.loader.seed = self.seed;
        }
    }
}

/// Read and tokenize a single input file
async fn load_tokens(tokenizer: &BpeTokenizer, path: &Path) -> anyhow::Result<Vec<TokenId>> {
    let file = seqwin::tokenize::tokenize_file(tokenizer, path).await?;
    info!(path = %path.display(), tokens = file.tokens.len(), "Tokenized input");

    Ok(file.tokens)
}

/// Decode `tokens` for display.  Tokens which don't end on a UTF-8 boundary can't be decoded on
/// their own; those are logged and shown as a placeholder.
fn decode_for_display<T: TextEncoder + ?Sized>(tokenizer: &T, tokens: &[TokenId]) -> String {
    match tokenizer.decode(tokens) {
        Ok(text) => text,
        Err(e) => {
            error!(
                err = e.to_string(),
                ?tokens,
                "Decoding tokens into a string failed.  Probably they don't end on a UTF-8 boundary"
            );
            UNDECODABLE.to_string()
        }
    }
}

const UNDECODABLE: &str = "<undecodable>";

fn format_row(tokens: &[TokenId]) -> String {
    tokens
        .iter()
        .map(|token| format!("{token:>6}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Commands {
    async fn execute(self, globals: &Globals) -> anyhow::Result<()> {
        use Commands::*;

        let mut config = globals.load_config()?;

        match self {
            Tokenize { files, show } => {
                let tokenizer = BpeTokenizer::new(config.tokenizer)?;

                for result in seqwin::tokenize::tokenize_files(&tokenizer, files).await? {
                    let file = result?;
                    let shown = &file.tokens[..show.min(file.tokens.len())];

                    println!(
                        "{}: {} bytes, {} tokens",
                        file.path.display(),
                        file.text_len,
                        file.tokens.len()
                    );
                    println!("  {:?}", shown);
                }
            }
            Contexts {
                file,
                context_size,
                offset,
            } => {
                let tokenizer = BpeTokenizer::new(config.tokenizer)?;
                let tokens = load_tokens(&tokenizer, &file).await?;
                let tokens = tokens.get(offset..).unwrap_or_default();

                for (context, desired) in seqwin::next_token_pairs(tokens, context_size) {
                    println!("{:?} ----> {}", context, desired);
                }
                for (context, desired) in seqwin::next_token_pairs(tokens, context_size) {
                    println!(
                        "{} ----> {}",
                        decode_for_display(&tokenizer, context),
                        decode_for_display(&tokenizer, &[desired])
                    );
                }
            }
            Samples {
                file,
                window,
                limit,
            } => {
                window.apply(&mut config);
                let tokenizer = BpeTokenizer::new(config.tokenizer)?;
                let tokens = load_tokens(&tokenizer, &file).await?;

                let samples =
                    SampleSet::build(tokens, config.loader.max_length, config.loader.stride)?;
                println!(
                    "{} samples of length {} with stride {}",
                    samples.len(),
                    samples.max_length(),
                    samples.stride()
                );

                for sample in samples.iter().take(limit) {
                    println!("{sample}");
                }
            }
            Batches { file, batch, limit } => {
                batch.apply(&mut config);
                let tokenizer = BpeTokenizer::new(config.tokenizer)?;
                let tokens = load_tokens(&tokenizer, &file).await?;

                let samples =
                    SampleSet::build(tokens, config.loader.max_length, config.loader.stride)?;
                let mut loader = DataLoader::new(samples, &config.loader)?;
                println!(
                    "{} samples in {} batches of {}",
                    loader.len(),
                    loader.num_batches(),
                    loader.batch_size()
                );

                for (index, batch) in loader.iter().take(limit).enumerate() {
                    let (rows, max_length) = batch.shape();
                    println!("Batch {index} ({rows} x {max_length})");
                    println!("Inputs:");
                    for (input, _) in batch.rows() {
                        println!("  {}", format_row(input));
                    }
                    println!("Targets:");
                    for (_, target) in batch.rows() {
                        println!("  {}", format_row(target));
                    }
                }
            }
            Embed {
                file,
                batch,
                output_dim,
                vocab_size,
                embedding_seed,
            } => {
                batch.apply(&mut config);
                if let Some(output_dim) = output_dim {
                    config.embedding.output_dim = output_dim;
                }
                if let Some(vocab_size) = vocab_size {
                    config.embedding.vocab_size = vocab_size;
                }
                if embedding_seed.is_some() {
                    config.embedding.seed = embedding_seed;
                }

                let tokenizer = BpeTokenizer::new(config.tokenizer)?;
                let text = seqwin::tokenize::read_text(&file).await?;
                let mut loader = seqwin::create_dataloader(&text, &tokenizer, &config.loader)?;
                let Some(batch) = loader.iter().next() else {
                    anyhow::bail!("The data loader produced no batches");
                };

                let device = Default::default();
                let token_table: EmbeddingTable =
                    EmbeddingTable::from_config(&config.embedding, &device)?;
                let position_table: EmbeddingTable = EmbeddingTable::positions(
                    &config.embedding,
                    config.loader.max_length,
                    &device,
                )?;

                let ids = seqwin::embedding::input_ids::<seqwin::DefaultBackend>(&batch, &device);
                println!("Token IDs shape: {:?}", ids.dims());

                let embeddings = token_table.embed(&batch)?;
                println!("Token embeddings shape: {:?}", embeddings.dims());

                let embeddings = position_table.add_positional(embeddings)?;
                println!("Input embeddings shape: {:?}", embeddings.dims());
            }
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_log_directive = match cli.globals.debug {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_directive.into())
                .from_env_lossy(),
        )
        .json()
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    if let Err(e) = cli.command.execute(&cli.globals).await {
        error!("{:#}", e);
        exit(1);
    } else {
        debug!("command executed successfully");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify that there aren't any invalid attributes in the CLI specification that can only be
    /// detected at runtime
    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn command_line_overrides_config() {
        let cli = Cli::try_parse_from([
            "sqw",
            "--encoding",
            "cl100k_base",
            "batches",
            "input.txt",
            "--max-length",
            "4",
            "--stride",
            "2",
            "--no-shuffle",
            "--keep-last",
            "--seed",
            "7",
        ])
        .unwrap();

        let mut config = cli.globals.load_config().unwrap();
        assert_eq!(EncodingType::Cl100kBase, config.tokenizer.encoding);

        let Commands::Batches { batch, .. } = cli.command else {
            panic!("expected the batches command");
        };
        batch.apply(&mut config);

        assert_eq!(4, config.loader.max_length);
        assert_eq!(2, config.loader.stride);
        assert_eq!(4, config.loader.batch_size);
        assert!(!config.loader.shuffle);
        assert!(!config.loader.drop_last);
        assert_eq!(Some(7), config.loader.seed);
    }

    #[test]
    fn undecodable_tokens_are_shown_as_a_placeholder() {
        let tokenizer = BpeTokenizer::new(Default::default()).unwrap();

        // GPT-2 token 94 is the lone byte 0xA1, a UTF-8 continuation byte
        assert_eq!(UNDECODABLE, decode_for_display(&tokenizer, &[94]));
        assert_eq!(UNDECODABLE, decode_for_display(&tokenizer, &[40, 94]));
        assert_eq!("Hello", decode_for_display(&tokenizer, &tokenizer.encode("Hello")));
    }
}
