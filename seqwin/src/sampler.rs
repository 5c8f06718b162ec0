//! Sliding-window construction of next-token prediction samples.
//!
//! A window of `max_length` tokens slides over the token sequence, advancing `stride` tokens at a
//! time.  Each window is paired with the same window shifted forward by one token, which is what
//! the model is trained to predict.
use crate::error::InvalidParameterSnafu;
use crate::tokenize::TokenId;
use crate::Result;
use snafu::ensure;
use std::fmt::Display;
use std::iter::StepBy;
use std::ops::Range;
use std::sync::Arc;
use tracing::*;

/// One training sample: a window of input tokens and the tokens that follow each of them.
///
/// Both windows borrow from the [`SampleSet`]'s token buffer, so samples are cheap to produce and
/// to copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample<'a> {
    /// Offset of `input[0]` in the token sequence
    pub start: usize,

    pub input: &'a [TokenId],

    /// `input` shifted forward by one position; `target[j]` is the token following `input[j]`
    pub target: &'a [TokenId],
}

impl Display for Sample<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ----> {:?}", self.input, self.target)
    }
}

/// Every (input, target) sample of a token sequence, in increasing order of start offset.
///
/// The set holds the token sequence behind an `Arc` and computes windows on demand.  It is
/// immutable once built, so it can be cloned cheaply and read from multiple threads at once.
#[derive(Clone, Debug)]
pub struct SampleSet {
    tokens: Arc<[TokenId]>,
    max_length: usize,
    stride: usize,
    len: usize,
}

impl SampleSet {
    /// Build the samples of `tokens` for the given window length and stride.
    ///
    /// Window starts are `0, stride, 2 * stride, ...` for as long as `start + max_length` is still
    /// a valid index, since the target needs one token past the end of the input window.  If
    /// `max_length` is not shorter than the token sequence the result is empty, which is not an
    /// error.
    ///
    /// Fails if `max_length` or `stride` is zero.
    pub fn build(
        tokens: impl Into<Arc<[TokenId]>>,
        max_length: usize,
        stride: usize,
    ) -> Result<Self> {
        ensure!(
            max_length > 0,
            InvalidParameterSnafu {
                name: "max_length",
                reason: "the window length must be positive",
            }
        );
        ensure!(
            stride > 0,
            InvalidParameterSnafu {
                name: "stride",
                reason: "the stride must be positive",
            }
        );

        let tokens = tokens.into();
        let len = starts(tokens.len(), max_length, stride).len();

        debug!(
            tokens = tokens.len(),
            max_length, stride, samples = len, "Built sample set"
        );

        Ok(Self {
            tokens,
            max_length,
            stride,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The full token sequence the samples are drawn from.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    /// The sample at `index`, or `None` if `index >= self.len()`.
    pub fn get(&self, index: usize) -> Option<Sample<'_>> {
        (index < self.len).then(|| self.sample_at(index * self.stride))
    }

    /// Iterate over all samples in increasing order of start offset.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = Sample<'_>> + DoubleEndedIterator {
        starts(self.tokens.len(), self.max_length, self.stride)
            .map(move |start| self.sample_at(start))
    }

    fn sample_at(&self, start: usize) -> Sample<'_> {
        let end = start + self.max_length;

        Sample {
            start,
            input: &self.tokens[start..end],
            target: &self.tokens[start + 1..end + 1],
        }
    }
}

impl<'a> IntoIterator for &'a SampleSet {
    type Item = Sample<'a>;
    type IntoIter = Box<dyn DoubleEndedIterator<Item = Sample<'a>> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Start offsets of all windows.  The range end is exclusive because one extra token past the
/// input window is needed for the target.
fn starts(num_tokens: usize, max_length: usize, stride: usize) -> StepBy<Range<usize>> {
    (0..num_tokens.saturating_sub(max_length)).step_by(stride)
}

/// The growing-context view of next-token prediction: for each `i` in `1..=context_size`, the
/// first `i` tokens paired with the token that follows them.
///
/// Stops early if `tokens` is too short to supply a following token.
pub fn next_token_pairs(
    tokens: &[TokenId],
    context_size: usize,
) -> impl Iterator<Item = (&[TokenId], TokenId)> {
    (1..=context_size)
        .take_while(move |&i| i < tokens.len())
        .map(move |i| (&tokens[..i], tokens[i]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SeqwinError;
    use assert_matches::assert_matches;

    /// The first tokens of "The Verdict" under the GPT-2 encoding
    const VERDICT: &[TokenId] = &[
        40, 367, 2885, 1464, 1807, 3619, 402, 271, 10899, 2138, 257, 7026,
    ];

    fn pair(sample: Sample<'_>) -> (Vec<TokenId>, Vec<TokenId>) {
        (sample.input.to_vec(), sample.target.to_vec())
    }

    #[test]
    fn stride_one_overlaps_windows() {
        crate::test_helpers::init_test_logging();
        let samples = SampleSet::build(VERDICT, 4, 1).unwrap();

        assert_eq!(8, samples.len());
        assert_eq!(
            (vec![40, 367, 2885, 1464], vec![367, 2885, 1464, 1807]),
            pair(samples.get(0).unwrap())
        );
        assert_eq!(
            (vec![367, 2885, 1464, 1807], vec![2885, 1464, 1807, 3619]),
            pair(samples.get(1).unwrap())
        );
    }

    #[test]
    fn stride_two_skips_tokens() {
        let samples = SampleSet::build(VERDICT, 2, 2).unwrap();

        assert_eq!(
            (vec![40, 367], vec![367, 2885]),
            pair(samples.get(0).unwrap())
        );
        assert_eq!(
            (vec![2885, 1464], vec![1464, 1807]),
            pair(samples.get(1).unwrap())
        );
    }

    #[test]
    fn length_eight_stride_two() {
        let samples = SampleSet::build(VERDICT, 8, 2).unwrap();

        assert_eq!(2, samples.len());
        assert_eq!(
            (
                vec![40, 367, 2885, 1464, 1807, 3619, 402, 271],
                vec![367, 2885, 1464, 1807, 3619, 402, 271, 10899]
            ),
            pair(samples.get(0).unwrap())
        );
        assert_eq!(
            (
                vec![2885, 1464, 1807, 3619, 402, 271, 10899, 2138],
                vec![1464, 1807, 3619, 402, 271, 10899, 2138, 257]
            ),
            pair(samples.get(1).unwrap())
        );
        assert!(samples.get(2).is_none());
    }

    #[test]
    fn stride_equal_to_length_does_not_overlap() {
        let samples = SampleSet::build(VERDICT, 4, 4).unwrap();

        // 12 tokens: starts 0 and 4 fit, start 8 would need index 12 for its last target
        let starts: Vec<_> = samples.iter().map(|s| s.start).collect();
        assert_eq!(vec![0, 4], starts);
    }

    #[test]
    fn longest_window_yields_one_sample() {
        let samples = SampleSet::build(VERDICT, VERDICT.len() - 1, 3).unwrap();

        assert_eq!(1, samples.len());
        let sample = samples.get(0).unwrap();
        assert_eq!(&VERDICT[..VERDICT.len() - 1], sample.input);
        assert_eq!(&VERDICT[1..], sample.target);
    }

    #[test]
    fn too_long_window_yields_nothing() {
        for max_length in [VERDICT.len(), VERDICT.len() + 1, 1000] {
            let samples = SampleSet::build(VERDICT, max_length, 1).unwrap();
            assert!(samples.is_empty());
            assert_eq!(0, samples.iter().count());
            assert!(samples.get(0).is_none());
        }

        assert!(SampleSet::build(Vec::<TokenId>::new(), 1, 1).unwrap().is_empty());
    }

    #[test]
    fn zero_parameters_are_rejected() {
        assert_matches!(
            SampleSet::build(VERDICT, 0, 1),
            Err(SeqwinError::InvalidParameter {
                name: "max_length",
                ..
            })
        );
        assert_matches!(
            SampleSet::build(VERDICT, 4, 0),
            Err(SeqwinError::InvalidParameter { name: "stride", .. })
        );
    }

    #[test]
    fn iter_matches_get() {
        let samples = SampleSet::build(VERDICT, 3, 2).unwrap();

        let iterated: Vec<_> = samples.iter().collect();
        let indexed: Vec<_> = (0..samples.len())
            .map(|i| samples.get(i).unwrap())
            .collect();
        assert_eq!(indexed, iterated);
        assert_eq!(samples.len(), samples.iter().len());

        let reversed: Vec<_> = samples.iter().rev().map(|s| s.start).collect();
        assert_eq!(vec![8, 6, 4, 2, 0], reversed);
        assert_eq!(5, (&samples).into_iter().count());
    }

    #[test]
    fn sample_display() {
        let samples = SampleSet::build(VERDICT, 4, 1).unwrap();

        expect_test::expect!["[40, 367, 2885, 1464] ----> [367, 2885, 1464, 1807]"]
            .assert_eq(&samples.get(0).unwrap().to_string());
    }

    #[test]
    fn next_token_pairs_grow_the_context() {
        let tokens = [290, 4920, 2241, 287, 257];

        let pairs: Vec<_> = next_token_pairs(&tokens, 4).collect();
        assert_eq!(
            vec![
                (&tokens[..1], 4920),
                (&tokens[..2], 2241),
                (&tokens[..3], 287),
                (&tokens[..4], 257),
            ],
            pairs
        );

        // Not enough tokens for a fourth pair
        assert_eq!(2, next_token_pairs(&tokens[..3], 4).count());
        assert_eq!(0, next_token_pairs(&[], 4).count());
    }
}
