//! Exact binomial tail probabilities and small descriptive summaries.
//!
//! Everything here is computed in a fixed summation order so repeated runs on
//! the same input give bit-identical results.

use serde::{Deserialize, Serialize};

fn ln_factorials(n: u64) -> Vec<f64> {
    let mut out = Vec::with_capacity(n as usize + 1);
    let mut acc = 0.0f64;
    out.push(acc);
    for j in 1..=n {
        acc += (j as f64).ln();
        out.push(acc);
    }
    out
}

/// `P(X >= k)` for `X ~ Binomial(n, q)`.
pub fn binomial_upper_tail(n: u64, k: u64, q: f64) -> f64 {
    if k == 0 {
        return 1.0;
    }
    if k > n {
        return 0.0;
    }
    if q <= 0.0 {
        return 0.0;
    }
    if q >= 1.0 {
        return 1.0;
    }

    let lf = ln_factorials(n);
    let (ln_q, ln_1q) = (q.ln(), (1.0 - q).ln());
    let terms: Vec<f64> = (k..=n)
        .map(|i| {
            let (i_us, n_us) = (i as usize, n as usize);
            lf[n_us] - lf[i_us] - lf[n_us - i_us] + (i as f64) * ln_q + ((n - i) as f64) * ln_1q
        })
        .collect();
    let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let sum: f64 = terms.iter().map(|t| (t - max).exp()).sum();
    (max + sum.ln()).exp().clamp(0.0, 1.0)
}

/// One-sided sign test: probability of at least `k` successes in `n` fair coin flips.
pub fn sign_test(n: u64, k: u64) -> f64 {
    binomial_upper_tail(n, k, 0.5)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MagnitudeSummary {
    pub count: usize,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub median: f64,
}

pub fn summarize(values: &[i64]) -> Option<MagnitudeSummary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    let sum: i128 = sorted.iter().map(|&v| i128::from(v)).sum();
    let median = if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] as f64 + sorted[n / 2] as f64) / 2.0
    };
    Some(MagnitudeSummary {
        count: n,
        min: sorted[0],
        max: sorted[n - 1],
        mean: sum as f64 / n as f64,
        median,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn binomial_tail_matches_exact_counts() {
        // C(20,17)+C(20,18)+C(20,19)+C(20,20) = 1351 of 2^20 outcomes.
        assert!(close(sign_test(20, 17), 1351.0 / 1_048_576.0));
        assert!(close(sign_test(10, 0), 1.0));
        assert!(close(sign_test(1, 1), 0.5));
        assert_eq!(sign_test(5, 6), 0.0);
        assert!(close(binomial_upper_tail(3, 3, 0.1), 0.001));
    }

    #[test]
    fn tail_is_deterministic() {
        let a = binomial_upper_tail(200, 130, 0.47);
        let b = binomial_upper_tail(200, 130, 0.47);
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn summary_of_even_and_odd_samples() {
        let s = summarize(&[10, -2, 4, 10]).unwrap();
        assert_eq!((s.min, s.max, s.count), (-2, 10, 4));
        assert!(close(s.mean, 5.5));
        assert!(close(s.median, 7.0));
        assert_eq!(summarize(&[3]).unwrap().median, 3.0);
        assert!(summarize(&[]).is_none());
    }
}
