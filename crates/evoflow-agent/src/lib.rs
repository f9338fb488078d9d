pub mod dispatch;
pub mod fitness;
pub mod graph;
pub mod guard;
pub mod handoff;
pub mod node;
pub mod orchestrator;
pub mod self_improve;
pub mod sink;

pub use dispatch::{extract_json, DispatchFailure, DispatchResult, Dispatched, ModelDispatcher};
pub use fitness::{
    EvaluationInput, FitnessEvaluator, FitnessOfWorkflow, ScorePolicy, ThresholdScorePolicy,
};
pub use graph::WorkflowGraph;
pub use guard::AdmissionController;
pub use handoff::{
    resolver_for, HandoffInput, HandoffResolver, HandoffResult, HierarchicalResolver,
    SequentialResolver,
};
pub use node::{NodeError, NodeExecutor, NodeInvocationContext, NodeInvocationResult};
pub use orchestrator::{
    FinalOutput, UnfiredJoin, WorkflowInput, WorkflowOrchestrator, WorkflowRunResult,
};
pub use self_improve::{Improvement, SelfImprover};
pub use sink::MessageSink;
