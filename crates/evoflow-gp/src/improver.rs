//! The generational loop: evaluate, select, breed, repair.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use evoflow_agent::{EvaluationInput, FitnessEvaluator, WorkflowInput, WorkflowOrchestrator};
use evoflow_core::config::GpConfig;
use evoflow_core::error::Result;
use evoflow_core::event::EventBus;
use evoflow_core::store::{InvocationStatus, InvocationUpdate};
use evoflow_core::traits::WorkflowStore;
use evoflow_core::types::WorkflowEvent;
use evoflow_core::workflow::WorkflowConfig;

use crate::crossover::crossover;
use crate::gene_pool::GenePool;
use crate::genome::{GenomeOrigin, WorkflowGenome};
use crate::mutation::{Edit, Mutator, PromptRewriter};
use crate::repair::Repairer;
use crate::selection::{survivors, tournament};
use crate::stats::PopulationStats;

/// Smallest population the loop will run with.
pub const MIN_POPULATION: usize = 4;

/// The problem every genome is evaluated on.
#[derive(Debug, Clone)]
pub struct EvolutionTask {
    pub prompt: String,
    /// Expected answer or grading rubric for the judge.
    pub rubric: String,
}

impl EvolutionTask {
    pub fn new(prompt: impl Into<String>, rubric: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            rubric: rubric.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Generations,
    TimeLimit,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct EvolutionResult {
    /// Fittest genome seen in any generation.
    pub best: Option<WorkflowGenome>,
    pub history: Vec<PopulationStats>,
    pub generations_run: u32,
    pub total_cost_usd: f64,
    pub stopped_by: StopReason,
}

/// Offspring before rewriting and repair.
struct Offspring {
    config: WorkflowConfig,
    origin: GenomeOrigin,
    parent_ids: Vec<String>,
    edits: Vec<Edit>,
}

pub struct GpImprover {
    orchestrator: Arc<WorkflowOrchestrator>,
    evaluator: Arc<FitnessEvaluator>,
    repairer: Arc<Repairer>,
    mutator: Mutator,
    rewriter: Option<PromptRewriter>,
    pool: Arc<GenePool>,
    store: Arc<dyn WorkflowStore>,
    event_bus: Arc<EventBus>,
    config: GpConfig,
    workflow_id: String,
}

impl GpImprover {
    pub fn new(
        orchestrator: Arc<WorkflowOrchestrator>,
        evaluator: Arc<FitnessEvaluator>,
        repairer: Arc<Repairer>,
        pool: Arc<GenePool>,
        event_bus: Arc<EventBus>,
        config: GpConfig,
    ) -> Self {
        Self {
            store: orchestrator.store().clone(),
            mutator: Mutator::new(pool.clone(), config.mutation_lambda),
            orchestrator,
            evaluator,
            repairer,
            rewriter: None,
            pool,
            event_bus,
            config,
            workflow_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Let a model rewrite prompts touched by prompt mutations.
    pub fn with_prompt_rewriter(mut self, rewriter: PromptRewriter) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = workflow_id.into();
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Evolve a population for `task`, starting from `seeds` topped up with
    /// random workflows.
    ///
    /// Stops after `generation_amount` generations, when
    /// `maximum_time_minutes` have passed, or when `cancel` fires.
    pub async fn evolve(
        &self,
        task: &EvolutionTask,
        seeds: Vec<WorkflowConfig>,
        cancel: &CancellationToken,
    ) -> Result<EvolutionResult> {
        let time_limit = Duration::from_secs(self.config.maximum_time_minutes.saturating_mul(60));
        let run_cancel = cancel.child_token();
        let timer = {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(time_limit).await;
                token.cancel();
            })
        };

        let result = self.run(task, seeds, cancel, &run_cancel, time_limit).await;
        timer.abort();
        result
    }

    async fn run(
        &self,
        task: &EvolutionTask,
        seeds: Vec<WorkflowConfig>,
        cancel: &CancellationToken,
        run_cancel: &CancellationToken,
        time_limit: Duration,
    ) -> Result<EvolutionResult> {
        let started = Instant::now();
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        if let Err(e) = self
            .store
            .ensure_workflow_exists(self.workflow_id.clone(), task.prompt.clone())
            .await
        {
            warn!(error = %e, "Failed to record workflow");
        }

        let size = self.config.population_size.max(MIN_POPULATION);
        let mut total_cost = 0.0;
        let mut raw = Vec::with_capacity(size);
        for config in seeds.into_iter().take(size) {
            raw.push(Offspring {
                config,
                origin: GenomeOrigin::Seed,
                parent_ids: vec![],
                edits: vec![],
            });
        }
        while raw.len() < size {
            raw.push(Offspring {
                config: self.pool.random_workflow(&mut rng),
                origin: GenomeOrigin::Random,
                parent_ids: vec![],
                edits: vec![],
            });
        }
        let (mut population, init_cost) = self.finish_offspring(raw, 0, run_cancel).await;
        total_cost += init_cost;
        // Building a generation is billed to that generation's stats.
        let mut offspring_cost = init_cost;

        info!(
            workflow_id = %self.workflow_id,
            population = population.len(),
            generations = self.config.generation_amount,
            "Evolution started"
        );

        let mut history: Vec<PopulationStats> = Vec::new();
        let mut best: Option<WorkflowGenome> = None;
        let mut generations_run = 0u32;
        let mut stopped_by = StopReason::Generations;

        for generation in 0..self.config.generation_amount {
            if let Some(reason) = stop_reason(cancel, run_cancel, started, time_limit) {
                stopped_by = reason;
                break;
            }

            let generation_started = Instant::now();
            let (pending, done): (Vec<_>, Vec<_>) =
                population.into_iter().partition(WorkflowGenome::needs_evaluation);
            let evaluations = pending.len();
            let concurrency = self.config.max_concurrent_evaluations.max(1);
            let evaluated: Vec<(WorkflowGenome, f64)> = stream::iter(pending)
                .map(|genome| self.evaluate(genome, task, run_cancel))
                .buffer_unordered(concurrency)
                .collect()
                .await;

            let mut evaluation_cost = 0.0;
            population = done;
            for (genome, cost) in evaluated {
                evaluation_cost += cost;
                population.push(genome);
            }
            total_cost += evaluation_cost;
            let generation_cost = std::mem::take(&mut offspring_cost) + evaluation_cost;
            generations_run += 1;

            let stats = PopulationStats::from_population(
                generation,
                &population,
                evaluations,
                generation_cost,
                generation_started.elapsed(),
                history.last(),
            );
            info!(
                generation,
                best = stats.best_fitness,
                avg = stats.avg_fitness,
                failed = stats.failed,
                cost = stats.evaluation_cost,
                "Generation evaluated"
            );
            self.event_bus.publish(WorkflowEvent::GenerationCompleted {
                generation,
                best_fitness: stats.best_fitness,
                avg_fitness: stats.avg_fitness,
                evaluation_cost: stats.evaluation_cost,
            });
            history.push(stats);

            if let Some(leader) = fittest(&population) {
                if best.as_ref().and_then(WorkflowGenome::score) < leader.score() {
                    best = Some(leader.clone());
                }
            }

            if let Some(reason) = stop_reason(cancel, run_cancel, started, time_limit) {
                stopped_by = reason;
                break;
            }
            if generation + 1 == self.config.generation_amount {
                break;
            }

            let kept = survivors(&population, self.config.survival_rate);
            if kept.is_empty() {
                warn!(generation, "No genome survived; refilling with immigrants");
            }
            let raw = self.breed(&kept, size.saturating_sub(kept.len()), &mut rng);
            let (children, breed_cost) = self.finish_offspring(raw, generation + 1, run_cancel).await;
            total_cost += breed_cost;
            offspring_cost = breed_cost;
            population = kept.into_iter().chain(children).collect();
        }

        info!(
            workflow_id = %self.workflow_id,
            generations = generations_run,
            best = best.as_ref().and_then(WorkflowGenome::score).unwrap_or(0.0),
            cost = total_cost,
            reason = ?stopped_by,
            "Evolution finished"
        );

        Ok(EvolutionResult {
            best,
            history,
            generations_run,
            total_cost_usd: total_cost,
            stopped_by,
        })
    }

    /// Draw `count` offspring from the survivors using the weighted operators.
    fn breed(&self, parents: &[WorkflowGenome], count: usize, rng: &mut StdRng) -> Vec<Offspring> {
        let weights = [
            self.config.mutation_rate.max(0.0),
            self.config.crossover_rate.max(0.0),
            self.config.immigration_rate.max(0.0),
        ];
        let operators = WeightedIndex::new(weights).ok();
        let tournament_size = self.config.tournament_size;

        (0..count)
            .map(|_| {
                let op = operators.as_ref().map_or(0, |w| w.sample(rng));
                let Some(first) = tournament(parents, tournament_size, rng) else {
                    return self.immigrant(rng);
                };
                match op {
                    1 if parents.len() >= 2 => {
                        let second = tournament(parents, tournament_size, rng)
                            .filter(|g| g.wf_version_id != first.wf_version_id)
                            .or_else(|| parents.iter().find(|g| g.wf_version_id != first.wf_version_id))
                            .unwrap_or(first);
                        Offspring {
                            config: crossover(&first.config, &second.config, rng),
                            origin: GenomeOrigin::Crossover,
                            parent_ids: vec![first.wf_version_id.clone(), second.wf_version_id.clone()],
                            edits: vec![],
                        }
                    }
                    2 => self.immigrant(rng),
                    _ => {
                        let (config, edits) = self.mutator.mutate(&first.config, rng);
                        Offspring {
                            config,
                            origin: GenomeOrigin::Mutation,
                            parent_ids: vec![first.wf_version_id.clone()],
                            edits,
                        }
                    }
                }
            })
            .collect()
    }

    fn immigrant(&self, rng: &mut StdRng) -> Offspring {
        Offspring {
            config: self.pool.random_workflow(rng),
            origin: GenomeOrigin::Immigration,
            parent_ids: vec![],
            edits: vec![],
        }
    }

    /// Rewrite tweaked prompts (when enabled) and repair each offspring.
    async fn finish_offspring(
        &self,
        raw: Vec<Offspring>,
        generation: u32,
        cancel: &CancellationToken,
    ) -> (Vec<WorkflowGenome>, f64) {
        let mut cost = 0.0;
        let mut genomes = Vec::with_capacity(raw.len());
        for mut child in raw {
            if let Some(rewriter) = &self.rewriter {
                for edit in &child.edits {
                    let Edit::PromptTweak { node_id } = edit else {
                        continue;
                    };
                    let Some(node) = child.config.node_mut(node_id) else {
                        continue;
                    };
                    match rewriter.rewrite(node, cancel).await {
                        Ok((prompt, usd)) => {
                            cost += usd;
                            node.system_prompt = prompt;
                        }
                        Err(failure) => {
                            cost += failure.usd_cost;
                            debug!(node_id = %node_id, error = %failure, "Prompt rewrite skipped");
                        }
                    }
                }
            }

            let repaired = self.repairer.repair(child.config, cancel).await;
            cost += repaired.usd_cost;
            debug!(
                origin = child.origin.as_str(),
                method = ?repaired.method,
                edits = child.edits.len(),
                "Offspring ready"
            );
            genomes.push(WorkflowGenome::new(
                repaired.config,
                generation,
                child.origin,
                child.parent_ids,
            ));
        }
        (genomes, cost)
    }

    /// Run and judge one genome. Any failure marks it as failed.
    async fn evaluate(
        &self,
        mut genome: WorkflowGenome,
        task: &EvolutionTask,
        cancel: &CancellationToken,
    ) -> (WorkflowGenome, f64) {
        if let Err(e) = self
            .store
            .create_workflow_version(genome.version_record(&self.workflow_id))
            .await
        {
            warn!(error = %e, "Failed to record workflow version");
        }
        for record in genome.node_version_records() {
            if let Err(e) = self.store.save_node_version(record).await {
                warn!(error = %e, "Failed to record node version");
            }
        }

        let input = WorkflowInput::new(task.prompt.clone()).with_version(genome.wf_version_id.clone());
        let run = match self.orchestrator.invoke(&genome.config, input, cancel).await {
            Ok(run) => run,
            Err(e) => {
                warn!(wf_version_id = %genome.wf_version_id, error = %e, "Genome could not run");
                genome.evaluation_failed = true;
                return (genome, 0.0);
            }
        };
        if !run.is_success() {
            warn!(
                wf_version_id = %genome.wf_version_id,
                cancelled = run.cancelled,
                failed_nodes = run.failed_nodes(),
                "Genome produced no final output"
            );
            genome.evaluation_failed = true;
            return (genome, run.usd_cost);
        }

        let input = EvaluationInput::from_run(&run, task.rubric.clone());
        let fitness = match self.evaluator.evaluate(&input, cancel).await {
            Ok(fitness) => fitness,
            Err(failure) => {
                warn!(wf_version_id = %genome.wf_version_id, error = %failure, "Judging failed");
                genome.evaluation_failed = true;
                return (genome, run.usd_cost + failure.usd_cost);
            }
        };

        if let Err(e) = self
            .store
            .update_workflow_invocation(
                run.workflow_invocation_id.clone(),
                InvocationUpdate {
                    status: InvocationStatus::Completed,
                    usd_cost: fitness.total_cost_usd,
                    final_output: Some(run.final_output()),
                    fitness: Some(fitness.score),
                    feedback: Some(fitness.feedback.clone()),
                    finished_at: Utc::now(),
                },
            )
            .await
        {
            warn!(error = %e, "Failed to record fitness");
        }

        debug!(
            wf_version_id = %genome.wf_version_id,
            score = fitness.score,
            accuracy = fitness.accuracy,
            "Genome evaluated"
        );
        let cost = fitness.total_cost_usd;
        genome.config = run.updated_config(&genome.config);
        genome.fitness = Some(fitness);
        (genome, cost)
    }
}

fn stop_reason(
    cancel: &CancellationToken,
    run_cancel: &CancellationToken,
    started: Instant,
    time_limit: Duration,
) -> Option<StopReason> {
    if cancel.is_cancelled() {
        Some(StopReason::Cancelled)
    } else if run_cancel.is_cancelled() || started.elapsed() >= time_limit {
        Some(StopReason::TimeLimit)
    } else {
        None
    }
}

fn fittest(population: &[WorkflowGenome]) -> Option<&WorkflowGenome> {
    population
        .iter()
        .filter(|g| g.score().is_some())
        .max_by(|a, b| {
            a.score()
                .partial_cmp(&b.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}
