use std::cmp::Ordering;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::genome::WorkflowGenome;

fn by_score_desc(a: &WorkflowGenome, b: &WorkflowGenome) -> Ordering {
    b.score()
        .unwrap_or(f64::MIN)
        .partial_cmp(&a.score().unwrap_or(f64::MIN))
        .unwrap_or(Ordering::Equal)
}

/// Keep the best `survival_rate` share of the evaluated genomes.
///
/// Failed or unevaluated genomes never survive. At least one genome is kept
/// when any is eligible.
pub fn survivors(population: &[WorkflowGenome], survival_rate: f64) -> Vec<WorkflowGenome> {
    let mut ranked: Vec<&WorkflowGenome> = population
        .iter()
        .filter(|g| !g.evaluation_failed && g.fitness.is_some())
        .collect();
    if ranked.is_empty() {
        return Vec::new();
    }
    ranked.sort_by(|a, b| by_score_desc(a, b));

    let rate = survival_rate.clamp(0.0, 1.0);
    let keep = ((ranked.len() as f64 * rate).ceil() as usize).max(1);
    ranked.into_iter().take(keep).cloned().collect()
}

/// Pick `size` genomes at random and return the fittest of them.
pub fn tournament<'a, R: Rng + ?Sized>(
    pool: &'a [WorkflowGenome],
    size: usize,
    rng: &mut R,
) -> Option<&'a WorkflowGenome> {
    pool.choose_multiple(rng, size.max(1))
        .min_by(|a, b| by_score_desc(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::GenomeOrigin;
    use evoflow_agent::FitnessOfWorkflow;
    use evoflow_test_utils::linear_workflow;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn genome(score: Option<f64>, failed: bool) -> WorkflowGenome {
        let mut g = WorkflowGenome::new(linear_workflow(), 0, GenomeOrigin::Seed, vec![]);
        g.fitness = score.map(|score| FitnessOfWorkflow {
            score,
            accuracy: score,
            feedback: String::new(),
            total_cost_usd: 0.0,
            total_time_seconds: 0.0,
        });
        g.evaluation_failed = failed;
        g
    }

    #[test]
    fn test_survivors_ranked_and_filtered() {
        let population = vec![
            genome(Some(40.0), false),
            genome(Some(90.0), false),
            genome(None, true),
            genome(Some(70.0), false),
            genome(Some(10.0), false),
        ];
        let kept = survivors(&population, 0.5);
        let scores: Vec<f64> = kept.iter().filter_map(|g| g.score()).collect();
        assert_eq!(scores, vec![90.0, 70.0]);
    }

    #[test]
    fn test_survivors_keep_at_least_one() {
        let population = vec![genome(Some(5.0), false), genome(None, true)];
        assert_eq!(survivors(&population, 0.0).len(), 1);
        assert!(survivors(&[genome(None, true)], 1.0).is_empty());
    }

    #[test]
    fn test_full_tournament_picks_best() {
        let pool = vec![
            genome(Some(20.0), false),
            genome(Some(80.0), false),
            genome(Some(50.0), false),
        ];
        let mut rng = StdRng::seed_from_u64(3);
        let winner = tournament(&pool, 3, &mut rng).unwrap();
        assert_eq!(winner.score(), Some(80.0));
        assert!(tournament(&[], 3, &mut rng).is_none());
    }
}
