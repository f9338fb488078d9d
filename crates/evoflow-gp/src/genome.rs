use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use evoflow_agent::FitnessOfWorkflow;
use evoflow_core::error::{EvoflowError, Result};
use evoflow_core::store::{NodeVersionRecord, WorkflowVersionRecord};
use evoflow_core::workflow::WorkflowConfig;

/// How a genome came into the population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenomeOrigin {
    Seed,
    Random,
    Mutation,
    Crossover,
    Immigration,
}

impl GenomeOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Random => "random",
            Self::Mutation => "mutation",
            Self::Crossover => "crossover",
            Self::Immigration => "immigration",
        }
    }
}

/// One individual: a workflow version plus its evaluation.
#[derive(Debug, Clone)]
pub struct WorkflowGenome {
    pub config: WorkflowConfig,
    pub wf_version_id: String,
    pub generation: u32,
    pub parent_ids: Vec<String>,
    pub origin: GenomeOrigin,
    pub created_at: DateTime<Utc>,
    pub fitness: Option<FitnessOfWorkflow>,
    /// Set when evaluation failed; such genomes never survive selection.
    pub evaluation_failed: bool,
}

impl WorkflowGenome {
    pub fn new(
        config: WorkflowConfig,
        generation: u32,
        origin: GenomeOrigin,
        parent_ids: Vec<String>,
    ) -> Self {
        Self {
            config,
            wf_version_id: Uuid::new_v4().to_string(),
            generation,
            parent_ids,
            origin,
            created_at: Utc::now(),
            fitness: None,
            evaluation_failed: false,
        }
    }

    pub fn score(&self) -> Option<f64> {
        self.fitness.as_ref().map(|f| f.score)
    }

    pub fn needs_evaluation(&self) -> bool {
        self.fitness.is_none() && !self.evaluation_failed
    }

    pub fn version_record(&self, workflow_id: &str) -> WorkflowVersionRecord {
        WorkflowVersionRecord {
            wf_version_id: self.wf_version_id.clone(),
            workflow_id: workflow_id.to_string(),
            generation: self.generation,
            parent_ids: self.parent_ids.clone(),
            operator: self.origin.as_str().to_string(),
            config: self.config.clone(),
            created_at: self.created_at,
        }
    }

    pub fn node_version_records(&self) -> Vec<NodeVersionRecord> {
        self.config
            .nodes
            .iter()
            .map(|node| NodeVersionRecord {
                node_version_id: format!("{}:{}", self.wf_version_id, node.node_id),
                wf_version_id: self.wf_version_id.clone(),
                config: node.clone(),
            })
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedFile {
    Many(Vec<WorkflowConfig>),
    One(Box<WorkflowConfig>),
}

/// Read seed workflows from a JSON file holding one config or an array of them.
pub fn load_seed_population(path: &Path) -> Result<Vec<WorkflowConfig>> {
    let content = std::fs::read_to_string(path)
        .map_err(|_| EvoflowError::ConfigNotFound(path.display().to_string()))?;
    let seeds = match serde_json::from_str::<SeedFile>(&content)? {
        SeedFile::Many(configs) => configs,
        SeedFile::One(config) => vec![*config],
    };
    if seeds.is_empty() {
        return Err(EvoflowError::Config(format!(
            "seed file {} contains no workflows",
            path.display()
        )));
    }
    Ok(seeds)
}
