//! Poisson sampling for mutation edit counts.

use rand::Rng;

/// Largest rate handed to a single multiplication run; `exp(-λ)` stays well
/// inside `f64` range below it.
const CHUNK: f64 = 30.0;

/// Draw from Poisson(`lambda`) using Knuth's multiplication method.
///
/// Large rates are split into chunks and the draws summed, since the sum of
/// independent Poisson variables is Poisson with the summed rate.
pub fn sample_poisson<R: Rng + ?Sized>(rng: &mut R, lambda: f64) -> u32 {
    if !lambda.is_finite() || lambda <= 0.0 {
        return 0;
    }
    let mut remaining = lambda;
    let mut total = 0u32;
    while remaining > 0.0 {
        let rate = remaining.min(CHUNK);
        remaining -= rate;
        total = total.saturating_add(knuth(rng, rate));
    }
    total
}

fn knuth<R: Rng + ?Sized>(rng: &mut R, lambda: f64) -> u32 {
    let limit = (-lambda).exp();
    let mut k = 0u32;
    let mut p = 1.0f64;
    loop {
        p *= rng.gen::<f64>();
        if p <= limit {
            return k;
        }
        k += 1;
    }
}

/// Number of edits one mutation applies: a Poisson draw, at least one.
pub fn mutation_edit_count<R: Rng + ?Sized>(rng: &mut R, lambda: f64) -> usize {
    sample_poisson(rng, lambda).max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_sample_mean_matches_lambda() {
        let mut rng = StdRng::seed_from_u64(42);
        let draws: Vec<u32> = (0..1000).map(|_| sample_poisson(&mut rng, 2.0)).collect();
        let mean = draws.iter().map(|&d| d as f64).sum::<f64>() / draws.len() as f64;
        assert_eq!(mean.round(), 2.0);
    }

    #[test]
    fn test_large_lambda_is_chunked() {
        let mut rng = StdRng::seed_from_u64(7);
        let draws: Vec<u32> = (0..200).map(|_| sample_poisson(&mut rng, 100.0)).collect();
        let mean = draws.iter().map(|&d| d as f64).sum::<f64>() / draws.len() as f64;
        assert!((90.0..110.0).contains(&mean), "mean was {}", mean);
    }

    #[test]
    fn test_degenerate_rates() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sample_poisson(&mut rng, 0.0), 0);
        assert_eq!(sample_poisson(&mut rng, -1.0), 0);
        assert_eq!(sample_poisson(&mut rng, f64::NAN), 0);
        assert_eq!(mutation_edit_count(&mut rng, 0.0), 1);
    }
}
