use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use evoflow_agent::{
    resolver_for, AdmissionController, FitnessEvaluator, ModelDispatcher, NodeExecutor,
    SelfImprover, WorkflowOrchestrator,
};
use evoflow_core::config::{AppConfig, PersistenceBackend};
use evoflow_core::event::EventBus;
use evoflow_core::pricing::StaticCatalog;
use evoflow_core::traits::{ModelClient, WorkflowStore};
use evoflow_core::workflow::VerifyOptions;
use evoflow_core::NoopStore;
use evoflow_gp::{GenePool, GpImprover, PromptRewriter, Repairer};
use evoflow_memory::SqliteStore;
use evoflow_tools::ToolRegistry;

/// Everything a command needs, wired from one [`AppConfig`].
pub struct Runtime {
    pub config: AppConfig,
    pub event_bus: Arc<EventBus>,
    pub tools: Arc<ToolRegistry>,
    pub dispatcher: Arc<ModelDispatcher>,
    pub orchestrator: Arc<WorkflowOrchestrator>,
}

impl Runtime {
    pub fn build(config: AppConfig, client: Arc<dyn ModelClient>) -> anyhow::Result<Self> {
        let event_bus = Arc::new(EventBus::default());
        let store = open_store(&config)?;
        let tools = Arc::new(ToolRegistry::with_builtins());

        let dispatcher = Arc::new(ModelDispatcher::new(
            client,
            Arc::new(StaticCatalog::from_entries(&config.pricing)),
            Arc::new(AdmissionController::new(&config.limits)),
            config.retry(),
            event_bus.clone(),
        ));

        let mut executor = NodeExecutor::new(
            dispatcher.clone(),
            tools.clone(),
            resolver_for(&config.coordination.coordination_type)?,
            config.agent.clone(),
        );
        if config.agent.self_improve {
            executor = executor.with_self_improvement(SelfImprover::new(
                dispatcher.clone(),
                store.clone(),
                config.agent.summary_history,
            ));
        }

        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            Arc::new(executor),
            store,
            event_bus.clone(),
            config.agent.clone(),
        ));

        Ok(Self {
            config,
            event_bus,
            tools,
            dispatcher,
            orchestrator,
        })
    }

    pub fn verify_options(&self) -> VerifyOptions {
        verify_options(&self.config, &self.tools)
    }

    pub fn improver(&self) -> GpImprover {
        let gp = &self.config.gp;
        let operator_model = gp
            .operator_model
            .clone()
            .unwrap_or_else(|| self.config.evaluation.judge_model.clone());

        let pool = Arc::new(GenePool::from_config(gp, &self.config.agent));
        let mut options = self.verify_options();
        options.allowed_models = Some(pool.models.iter().cloned().collect());

        let repairer = Repairer::new(pool.clone(), options)
            .with_model(self.dispatcher.clone(), operator_model.clone());
        let evaluator = FitnessEvaluator::new(self.dispatcher.clone(), &self.config.evaluation);

        let improver = GpImprover::new(
            self.orchestrator.clone(),
            Arc::new(evaluator),
            Arc::new(repairer),
            pool,
            self.event_bus.clone(),
            gp.clone(),
        );
        if gp.llm_prompt_mutation {
            improver.with_prompt_rewriter(PromptRewriter::new(self.dispatcher.clone(), operator_model))
        } else {
            improver
        }
    }

    pub fn evaluator(&self) -> FitnessEvaluator {
        FitnessEvaluator::new(self.dispatcher.clone(), &self.config.evaluation)
    }
}

/// Limits used by `verify` and by repair during evolution.
pub fn verify_options(config: &AppConfig, tools: &ToolRegistry) -> VerifyOptions {
    let active: HashSet<String> = if config.gp.allowed_tools.is_empty() {
        tools.list().into_iter().map(str::to_string).collect()
    } else {
        config.gp.allowed_tools.iter().cloned().collect()
    };
    VerifyOptions {
        max_tools_per_agent: config.agent.max_tools_per_agent,
        active_tools: Some(active),
        allowed_models: None,
    }
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn WorkflowStore>> {
    Ok(match config.persistence.backend {
        PersistenceBackend::None => Arc::new(NoopStore),
        PersistenceBackend::Sqlite => {
            let path = Path::new(&config.persistence.path);
            info!(path = %path.display(), "Using SQLite persistence");
            Arc::new(SqliteStore::open(path)?)
        }
    })
}
