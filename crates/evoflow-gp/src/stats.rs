use std::time::Duration;

use serde::Serialize;

use crate::genome::WorkflowGenome;

/// Summary of one evaluated generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopulationStats {
    pub generation: u32,
    pub size: usize,
    pub evaluated: usize,
    pub failed: usize,
    pub best_fitness: f64,
    pub avg_fitness: f64,
    pub worst_fitness: f64,
    pub fitness_std_dev: f64,
    /// Spend on this generation: building and repairing its new genomes,
    /// then running and judging them.
    pub evaluation_cost: f64,
    pub evaluations_per_hour: f64,
    /// Best fitness minus the previous generation's best.
    pub improvement_rate: f64,
}

impl PopulationStats {
    /// `evaluations` and `elapsed` cover only the work done in this generation.
    pub fn from_population(
        generation: u32,
        population: &[WorkflowGenome],
        evaluations: usize,
        evaluation_cost: f64,
        elapsed: Duration,
        previous: Option<&PopulationStats>,
    ) -> Self {
        let scores: Vec<f64> = population.iter().filter_map(WorkflowGenome::score).collect();
        let failed = population.iter().filter(|g| g.evaluation_failed).count();
        let hours = elapsed.as_secs_f64() / 3600.0;
        let evaluations_per_hour = if hours > 0.0 {
            evaluations as f64 / hours
        } else {
            0.0
        };

        let mut stats = Self {
            generation,
            size: population.len(),
            evaluated: scores.len(),
            failed,
            evaluation_cost,
            evaluations_per_hour,
            ..Self::default()
        };
        if scores.is_empty() {
            return stats;
        }

        let n = scores.len() as f64;
        stats.best_fitness = scores.iter().copied().fold(f64::MIN, f64::max);
        stats.worst_fitness = scores.iter().copied().fold(f64::MAX, f64::min);
        stats.avg_fitness = scores.iter().sum::<f64>() / n;
        stats.fitness_std_dev = (scores
            .iter()
            .map(|s| (s - stats.avg_fitness).powi(2))
            .sum::<f64>()
            / n)
            .sqrt();
        stats.improvement_rate = previous.map_or(0.0, |p| stats.best_fitness - p.best_fitness);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::GenomeOrigin;
    use evoflow_agent::FitnessOfWorkflow;
    use evoflow_test_utils::linear_workflow;

    fn population(scores: &[Option<f64>]) -> Vec<WorkflowGenome> {
        scores
            .iter()
            .map(|score| {
                let mut g = WorkflowGenome::new(linear_workflow(), 2, GenomeOrigin::Random, vec![]);
                g.fitness = score.map(|score| FitnessOfWorkflow {
                    score,
                    accuracy: score,
                    feedback: String::new(),
                    total_cost_usd: 0.01,
                    total_time_seconds: 1.0,
                });
                g.evaluation_failed = score.is_none();
                g
            })
            .collect()
    }

    #[test]
    fn test_stats_over_mixed_population() {
        let previous = PopulationStats {
            best_fitness: 50.0,
            ..PopulationStats::default()
        };
        let stats = PopulationStats::from_population(
            2,
            &population(&[Some(30.0), Some(60.0), None]),
            3,
            0.05,
            Duration::from_secs(360),
            Some(&previous),
        );
        assert_eq!(stats.size, 3);
        assert_eq!(stats.evaluated, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.best_fitness, 60.0);
        assert_eq!(stats.worst_fitness, 30.0);
        assert_eq!(stats.avg_fitness, 45.0);
        assert_eq!(stats.fitness_std_dev, 15.0);
        assert_eq!(stats.improvement_rate, 10.0);
        assert!((stats.evaluations_per_hour - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_of_unevaluated_population() {
        let stats = PopulationStats::from_population(
            0,
            &population(&[None]),
            0,
            0.0,
            Duration::ZERO,
            None,
        );
        assert_eq!(stats.evaluated, 0);
        assert_eq!(stats.best_fitness, 0.0);
        assert_eq!(stats.evaluations_per_hour, 0.0);
    }
}
