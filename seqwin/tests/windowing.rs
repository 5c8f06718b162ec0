//! Properties of the sliding-window sampler that must hold for any token sequence and any valid
//! window parameters, plus an end-to-end check against known GPT-2 tokens.
use proptest::prelude::*;
use seqwin::{
    create_dataloader, BpeTokenizer, EmbeddingTable, LoaderConfig, SampleSet, TokenId,
    TokenizerConfig,
};

const VERDICT_OPENING: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/test_data/the-verdict-opening.txt");

fn expected_len(num_tokens: usize, max_length: usize, stride: usize) -> usize {
    if num_tokens > max_length {
        (num_tokens - max_length - 1) / stride + 1
    } else {
        0
    }
}

proptest! {
    #[test]
    fn windows_are_shifted_pairs(
        tokens in prop::collection::vec(0usize..50_257, 0..300),
        max_length in 1usize..40,
        stride in 1usize..40,
    ) {
        let samples = SampleSet::build(tokens.clone(), max_length, stride).unwrap();

        prop_assert_eq!(expected_len(tokens.len(), max_length, stride), samples.len());

        for (index, sample) in samples.iter().enumerate() {
            prop_assert_eq!(index * stride, sample.start);
            prop_assert_eq!(max_length, sample.input.len());
            prop_assert_eq!(max_length, sample.target.len());
            prop_assert!(sample.start + max_length <= tokens.len() - 1);

            prop_assert_eq!(&sample.input[1..], &sample.target[..max_length - 1]);
            prop_assert_eq!(tokens[sample.start + max_length], sample.target[max_length - 1]);
            prop_assert_eq!(&tokens[sample.start..sample.start + max_length], sample.input);
        }
    }

    #[test]
    fn building_is_deterministic(
        tokens in prop::collection::vec(any::<usize>(), 0..200),
        max_length in 1usize..20,
        stride in 1usize..20,
    ) {
        let first = SampleSet::build(tokens.clone(), max_length, stride).unwrap();
        let second = SampleSet::build(tokens, max_length, stride).unwrap();

        prop_assert!(first.iter().eq(second.iter()));
    }

    #[test]
    fn boundary_window_lengths(
        tokens in prop::collection::vec(any::<usize>(), 1..100),
        stride in 1usize..10,
    ) {
        let n = tokens.len();

        prop_assert_eq!(0, SampleSet::build(tokens.clone(), n, stride).unwrap().len());
        prop_assert_eq!(0, SampleSet::build(tokens.clone(), n + 1, stride).unwrap().len());
        if n > 1 {
            prop_assert_eq!(1, SampleSet::build(tokens, n - 1, stride).unwrap().len());
        }
    }
}

#[tokio::test]
async fn verdict_batches_match_the_book() {
    let tokenizer = BpeTokenizer::new(TokenizerConfig::default()).unwrap();
    let text = seqwin::tokenize::read_text(VERDICT_OPENING).await.unwrap();

    let config = LoaderConfig {
        batch_size: 8,
        max_length: 4,
        stride: 4,
        shuffle: false,
        ..LoaderConfig::default()
    };
    let mut loader = create_dataloader(&text, &tokenizer, &config).unwrap();
    let batch = loader.iter().next().unwrap();

    let inputs: Vec<Vec<TokenId>> = batch.rows().map(|(input, _)| input.to_vec()).collect();
    let targets: Vec<Vec<TokenId>> = batch.rows().map(|(_, target)| target.to_vec()).collect();

    assert_eq!(
        vec![
            vec![40, 367, 2885, 1464],
            vec![1807, 3619, 402, 271],
            vec![10899, 2138, 257, 7026],
            vec![15632, 438, 2016, 257],
            vec![922, 5891, 1576, 438],
            vec![568, 340, 373, 645],
            vec![1049, 5975, 284, 502],
            vec![284, 3285, 326, 11],
        ],
        inputs
    );
    assert_eq!(
        vec![
            vec![367, 2885, 1464, 1807],
            vec![3619, 402, 271, 10899],
            vec![2138, 257, 7026, 15632],
            vec![438, 2016, 257, 922],
            vec![5891, 1576, 438, 568],
            vec![340, 373, 645, 1049],
            vec![5975, 284, 502, 284],
            vec![3285, 326, 11, 287],
        ],
        targets
    );

    // Token embeddings of this batch, then with absolute positions added
    let device = Default::default();
    let embedding = seqwin::EmbeddingConfig {
        seed: Some(123),
        ..Default::default()
    };
    let tokens: EmbeddingTable = EmbeddingTable::from_config(&embedding, &device).unwrap();
    let positions: EmbeddingTable =
        EmbeddingTable::positions(&embedding, config.max_length, &device).unwrap();

    let embeddings = tokens.embed(&batch).unwrap();
    assert_eq!([8, 4, 256], embeddings.dims());
    let first = seqwin::embedding::to_vec(embeddings.clone().slice([0..1, 0..1, 0..256])).unwrap();
    assert_eq!(tokens.lookup(40).unwrap(), first);

    let embeddings = positions.add_positional(embeddings).unwrap();
    assert_eq!([8, 4, 256], embeddings.dims());
    let first = seqwin::embedding::to_vec(embeddings.slice([0..1, 0..1, 0..256])).unwrap();
    let expected: Vec<f32> = tokens
        .lookup(40)
        .unwrap()
        .iter()
        .zip(positions.lookup(0).unwrap())
        .map(|(token, position)| token + position)
        .collect();
    assert_eq!(expected, first);
}
