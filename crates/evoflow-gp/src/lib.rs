pub mod crossover;
pub mod gene_pool;
pub mod genome;
pub mod improver;
pub mod mutation;
pub mod poisson;
pub mod repair;
pub mod selection;
pub mod stats;

pub use crossover::crossover;
pub use gene_pool::GenePool;
pub use genome::{load_seed_population, GenomeOrigin, WorkflowGenome};
pub use improver::{EvolutionResult, EvolutionTask, GpImprover, StopReason};
pub use mutation::{Edit, Mutator, PromptRewriter};
pub use poisson::{mutation_edit_count, sample_poisson};
pub use repair::{RepairMethod, Repaired, Repairer};
pub use selection::{survivors, tournament};
pub use stats::PopulationStats;
