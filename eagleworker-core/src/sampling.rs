//! RNG-backed sampling primitives shared by `DraftLoop`'s top-k selection
//! replay and the `Verifier`'s acceptance draws (spec §4.3, §4.5). Grounded
//! on `pipeline/speculative.rs`'s per-sequence `Isaac64Rng` seeding, which
//! is how the teacher keeps sampling reproducible per request even though
//! requests in a batch share one forward pass.

use rand::{distributions::WeightedIndex, prelude::Distribution, SeedableRng};
use rand_isaac::Isaac64Rng;

use crate::error::{Result, WorkerError};

/// A per-request sampler seeded once from the request's own seed (spec
/// §4.5: "a random draw (seeded by the request's sampler)"). Re-seeding per
/// request, rather than sharing one batch-wide RNG, is what makes
/// acceptance draws reproducible independent of what other requests are in
/// the same batch.
pub struct RequestSampler {
    rng: Isaac64Rng,
}

impl RequestSampler {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Isaac64Rng::seed_from_u64(seed),
        }
    }

    /// Draws one token id from `probs` (assumed to already sum to ~1, e.g.
    /// the output of a temperature-scaled softmax). Used both for the
    /// per-node acceptance-check sample at verification (spec §4.5) and for
    /// the fallback sample when no draft child matches.
    pub fn sample(&mut self, probs: &[f32]) -> Result<usize> {
        if probs.is_empty() {
            return Err(WorkerError::Invariant(
                "cannot sample from an empty distribution".into(),
            ));
        }
        let dist = WeightedIndex::new(probs)
            .map_err(|e| WorkerError::Numeric(format!("invalid sampling distribution: {e}")))?;
        Ok(dist.sample(&mut self.rng))
    }

    /// Argmax sample, used when `temperature == 0` (greedy decoding);
    /// avoids constructing a `WeightedIndex` over a near-delta distribution.
    pub fn sample_greedy(probs: &[f32]) -> Result<usize> {
        probs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
            .ok_or_else(|| WorkerError::Invariant("cannot argmax an empty distribution".into()))
    }
}

/// Applies temperature scaling then softmax to raw logits, matching the
/// teacher's `candle_nn::ops::softmax_last_dim(&(&logits / temperature)?)`
/// pattern (`sampler.rs`) but operating on plain host floats since this
/// crate's sampling surface (acceptance draws, logprob attachment) works
/// entirely on already-extracted vectors (spec §9 "Tree as arrays, not
/// pointers" extends naturally to the per-node distributions built from
/// them).
pub fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    debug_assert!(temperature > 0.0, "temperature must be positive");
    let scaled: Vec<f32> = logits.iter().map(|&x| x / temperature).collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scaled.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&x| x / sum).collect()
}

/// `log_softmax`, used by `LogprobAttachment` (spec §4.7).
pub fn log_softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let scaled: Vec<f32> = logits.iter().map(|&x| x / temperature).collect();
    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum_exp = scaled.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
    scaled.iter().map(|&x| x - log_sum_exp).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax_with_temperature(&[1.0, 2.0, 3.0], 1.0);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn greedy_sample_picks_argmax() {
        let probs = vec![0.1, 0.7, 0.2];
        assert_eq!(RequestSampler::sample_greedy(&probs).unwrap(), 1);
    }

    #[test]
    fn sampler_is_reproducible_given_same_seed() {
        let probs = vec![0.2, 0.3, 0.5];
        let mut a = RequestSampler::from_seed(42);
        let mut b = RequestSampler::from_seed(42);
        let draws_a: Vec<usize> = (0..20).map(|_| a.sample(&probs).unwrap()).collect();
        let draws_b: Vec<usize> = (0..20).map(|_| b.sample(&probs).unwrap()).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn log_softmax_matches_log_of_softmax() {
        let logits = vec![1.0, 2.0, 3.0];
        let probs = softmax_with_temperature(&logits, 1.0);
        let logp = log_softmax(&logits, 1.0);
        for (p, lp) in probs.iter().zip(logp.iter()) {
            assert!((p.ln() - lp).abs() < 1e-4);
        }
    }
}
