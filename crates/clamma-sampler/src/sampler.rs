//! Temperature / top-p token sampling (spec component G), grounded on
//! `original_source/sampler.c`'s `clamma_sampler_sample` and its
//! `sample_argmax`/`sample_mult`/`sample_topp` helpers.

use crate::rng::Xorshift64Star;

/// One candidate in the top-p scratch list: `(token id, probability)`.
#[derive(Debug, Clone, Copy)]
struct ProbIndex {
    index: u32,
    prob: f32,
}

/// Resolved sampler parameters (already clamped by the caller's Query step:
/// `temperature = max(0, t)`, `topp = 0.9` if outside `(0, 1]`).
#[derive(Debug, Clone, Copy)]
pub struct SamplerParams {
    pub temperature: f32,
    pub topp: f32,
    pub seed: u64,
}

/// A per-session sampler: owns the RNG stream and the top-p scratch buffer
/// so sampling a step never allocates.
pub struct Sampler {
    temperature: f32,
    topp: f32,
    rng: Xorshift64Star,
    probindex: Vec<ProbIndex>,
}

impl Sampler {
    pub fn new(vocab_size: usize, params: SamplerParams) -> Self {
        Self {
            temperature: params.temperature,
            topp: params.topp,
            rng: Xorshift64Star::new(params.seed),
            probindex: Vec::with_capacity(vocab_size),
        }
    }

    /// Sample the next token id from `logits`, mutating `logits` in place
    /// into a probability distribution when `temperature != 0`.
    pub fn sample(&mut self, logits: &mut [f32]) -> u32 {
        let coin = self.rng.next_f32();

        if self.temperature == 0.0 {
            return argmax(logits);
        }

        for v in logits.iter_mut() {
            *v /= self.temperature;
        }
        softmax(logits);

        if self.topp <= 0.0 || self.topp >= 1.0 {
            return sample_mult(logits, coin);
        }

        sample_topp(logits, self.topp, &mut self.probindex, coin)
    }
}

fn softmax(x: &mut [f32]) {
    let max_val = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// First maximum wins on ties.
fn argmax(probabilities: &[f32]) -> u32 {
    let mut max_i = 0;
    let mut max_p = probabilities[0];
    for (i, &p) in probabilities.iter().enumerate().skip(1) {
        if p > max_p {
            max_i = i;
            max_p = p;
        }
    }
    max_i as u32
}

/// Sample an index from `probabilities` (must sum to 1) by CDF comparison
/// against `coin`, a draw from `[0, 1)`.
fn sample_mult(probabilities: &[f32], coin: f32) -> u32 {
    let mut cdf = 0.0f32;
    for (i, &p) in probabilities.iter().enumerate() {
        cdf += p;
        if coin < cdf {
            return i as u32;
        }
    }
    (probabilities.len() - 1) as u32
}

/// Nucleus sampling: crop out entries below `(1 - topp) / (n - 1)`, sort the
/// survivors descending, truncate at the first index whose cumulative
/// probability exceeds `topp`, then sample within that prefix using
/// `coin * cumulative`.
fn sample_topp(probabilities: &[f32], topp: f32, scratch: &mut Vec<ProbIndex>, coin: f32) -> u32 {
    let n = probabilities.len();
    let cutoff = (1.0 - topp) / (n - 1) as f32;

    scratch.clear();
    for (i, &p) in probabilities.iter().enumerate() {
        if p >= cutoff {
            scratch.push(ProbIndex {
                index: i as u32,
                prob: p,
            });
        }
    }

    scratch.sort_by(|a, b| b.prob.partial_cmp(&a.prob).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumulative_prob = 0.0f32;
    let mut last_idx = scratch.len() - 1;
    for (i, entry) in scratch.iter().enumerate() {
        cumulative_prob += entry.prob;
        if cumulative_prob > topp {
            last_idx = i;
            break;
        }
    }

    let r = coin * cumulative_prob;
    let mut cdf = 0.0f32;
    for entry in &scratch[..=last_idx] {
        cdf += entry.prob;
        if r < cdf {
            return entry.index;
        }
    }
    scratch[last_idx].index
}
