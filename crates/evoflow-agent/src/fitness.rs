//! Scoring a finished workflow run with an LLM judge.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use evoflow_core::config::EvaluationConfig;
use evoflow_core::types::{ChatMessage, ModelRequest};

use crate::dispatch::{truncate, DispatchFailure, ModelDispatcher};
use crate::orchestrator::WorkflowRunResult;

const TRANSCRIPT_CHARS: usize = 12_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitnessOfWorkflow {
    /// Overall fitness in [0, 100].
    pub score: f64,
    /// Judge accuracy in [1, 100].
    pub accuracy: f64,
    pub feedback: String,
    /// Run cost plus the cost of judging it.
    pub total_cost_usd: f64,
    pub total_time_seconds: f64,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationInput {
    pub transcript: String,
    pub total_time_ms: u64,
    pub cost_so_far: f64,
    /// Expected answer or grading rubric.
    pub rubric: String,
    pub final_output: String,
}

impl EvaluationInput {
    pub fn from_run(run: &WorkflowRunResult, rubric: impl Into<String>) -> Self {
        Self {
            transcript: run.transcript(),
            total_time_ms: run.elapsed_ms,
            cost_so_far: run.usd_cost,
            rubric: rubric.into(),
            final_output: run.final_output(),
        }
    }
}

/// Combines accuracy, cost and time into one score.
pub trait ScorePolicy: Send + Sync + 'static {
    fn score(&self, accuracy: f64, cost_usd: f64, time_seconds: f64) -> f64;
}

/// Weighted accuracy, plus cost and time bonuses once accuracy clears a threshold.
#[derive(Debug, Clone)]
pub struct ThresholdScorePolicy {
    pub accuracy_weight: f64,
    pub cost_weight: f64,
    pub time_weight: f64,
    pub accuracy_threshold: f64,
    pub cost_budget_usd: f64,
    pub time_budget_seconds: f64,
}

impl ThresholdScorePolicy {
    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self {
            accuracy_weight: config.accuracy_weight,
            cost_weight: config.cost_weight,
            time_weight: config.time_weight,
            accuracy_threshold: config.accuracy_threshold,
            cost_budget_usd: config.cost_budget_usd,
            time_budget_seconds: config.time_budget_seconds,
        }
    }
}

impl Default for ThresholdScorePolicy {
    fn default() -> Self {
        Self::from_config(&EvaluationConfig::default())
    }
}

/// 100 at zero usage, 0 at or beyond the budget.
fn bonus(used: f64, budget: f64) -> f64 {
    if budget <= 0.0 || !used.is_finite() {
        return 0.0;
    }
    100.0 * (1.0 - (used.max(0.0) / budget).min(1.0))
}

impl ScorePolicy for ThresholdScorePolicy {
    fn score(&self, accuracy: f64, cost_usd: f64, time_seconds: f64) -> f64 {
        let mut score = self.accuracy_weight * accuracy;
        if accuracy >= self.accuracy_threshold {
            score += self.cost_weight * bonus(cost_usd, self.cost_budget_usd);
            score += self.time_weight * bonus(time_seconds, self.time_budget_seconds);
        }
        score
    }
}

#[derive(Deserialize)]
struct JudgeReply {
    #[serde(default)]
    accuracy: Value,
    #[serde(default)]
    feedback: String,
}

/// Read the judge's accuracy, tolerating strings like `"85"` or `"85%"`.
fn parse_accuracy(value: &Value) -> f64 {
    let raw = match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s
            .trim()
            .trim_end_matches('%')
            .trim()
            .parse::<f64>()
            .unwrap_or(f64::NAN),
        _ => f64::NAN,
    };
    if raw.is_nan() {
        1.0
    } else {
        raw.clamp(1.0, 100.0)
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

pub struct FitnessEvaluator {
    dispatcher: Arc<ModelDispatcher>,
    judge_model: String,
    policy: Arc<dyn ScorePolicy>,
}

impl FitnessEvaluator {
    pub fn new(dispatcher: Arc<ModelDispatcher>, config: &EvaluationConfig) -> Self {
        Self {
            dispatcher,
            judge_model: config.judge_model.clone(),
            policy: Arc::new(ThresholdScorePolicy::from_config(config)),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ScorePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Judge one run. A failed judge call still reports what it spent.
    pub async fn evaluate(
        &self,
        input: &EvaluationInput,
        cancel: &CancellationToken,
    ) -> Result<FitnessOfWorkflow, DispatchFailure> {
        let prompt = format!(
            "Expected answer or rubric:\n{}\n\nFinal output of the workflow:\n{}\n\nExecution transcript:\n{}",
            input.rubric,
            input.final_output,
            truncate(&input.transcript, TRANSCRIPT_CHARS),
        );
        let request = ModelRequest::structured(
            self.judge_model.clone(),
            vec![
                ChatMessage::system(
                    "You grade the output of a multi-agent workflow. Rate accuracy from 1 to 100 \
                     against the rubric and give short, actionable feedback for the agents.",
                ),
                ChatMessage::user(prompt),
            ],
            serde_json::json!({
                "type": "object",
                "properties": {
                    "accuracy": { "type": "number", "minimum": 1, "maximum": 100 },
                    "feedback": { "type": "string" }
                },
                "required": ["accuracy", "feedback"]
            }),
        );

        let reply = self
            .dispatcher
            .dispatch_structured::<JudgeReply>(request, cancel)
            .await?;

        let accuracy = parse_accuracy(&reply.value.accuracy);
        let total_cost_usd = input.cost_so_far + reply.usd_cost;
        let total_time_seconds = input.total_time_ms as f64 / 1000.0;
        let score = clamp_score(self.policy.score(accuracy, total_cost_usd, total_time_seconds));

        info!(accuracy, score, total_cost_usd, total_time_seconds, "Workflow evaluated");

        Ok(FitnessOfWorkflow {
            score,
            accuracy,
            feedback: reply.value.feedback,
            total_cost_usd,
            total_time_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::AdmissionController;
    use evoflow_core::config::RetryConfig;
    use evoflow_core::event::EventBus;
    use evoflow_core::pricing::StaticCatalog;
    use evoflow_test_utils::{json_response, ScriptedModelClient};
    use serde_json::json;

    fn evaluator(client: Arc<ScriptedModelClient>) -> FitnessEvaluator {
        let dispatcher = Arc::new(ModelDispatcher::new(
            client,
            Arc::new(StaticCatalog::with_defaults()),
            Arc::new(AdmissionController::unlimited()),
            RetryConfig::default(),
            Arc::new(EventBus::default()),
        ));
        FitnessEvaluator::new(dispatcher, &EvaluationConfig::default())
    }

    fn input() -> EvaluationInput {
        EvaluationInput {
            transcript: "a: 42".into(),
            total_time_ms: 1500,
            cost_so_far: 0.01,
            rubric: "42".into(),
            final_output: "42".into(),
        }
    }

    #[tokio::test]
    async fn test_judge_cost_and_time_are_reported() {
        let client = Arc::new(
            ScriptedModelClient::new().then(json_response(json!({"accuracy": 90, "feedback": "good"}))),
        );
        let fitness = evaluator(client)
            .evaluate(&input(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fitness.accuracy, 90.0);
        assert_eq!(fitness.feedback, "good");
        assert!(fitness.total_cost_usd > 0.01);
        assert_eq!(fitness.total_time_seconds, 1.5);
        assert!(fitness.score > 72.0 && fitness.score <= 100.0);
    }

    #[tokio::test]
    async fn test_out_of_range_accuracy_is_clamped() {
        let client = Arc::new(
            ScriptedModelClient::new()
                .then(json_response(json!({"accuracy": 250, "feedback": ""})))
                .then(json_response(json!({"accuracy": "-3", "feedback": ""})))
                .then(json_response(json!({"accuracy": "excellent", "feedback": ""}))),
        );
        let eval = evaluator(client);
        let cancel = CancellationToken::new();
        for expected in [100.0, 1.0, 1.0] {
            let f = eval.evaluate(&input(), &cancel).await.unwrap();
            assert_eq!(f.accuracy, expected);
            assert!((0.0..=100.0).contains(&f.score));
        }
    }

    #[test]
    fn test_parse_accuracy_variants() {
        assert_eq!(parse_accuracy(&json!("85%")), 85.0);
        assert_eq!(parse_accuracy(&json!(" 70 ")), 70.0);
        assert_eq!(parse_accuracy(&json!(null)), 1.0);
        assert_eq!(parse_accuracy(&json!(0.2)), 1.0);
    }

    #[test]
    fn test_threshold_policy_bonuses() {
        let policy = ThresholdScorePolicy::default();
        // Below the threshold only accuracy counts.
        assert!((policy.score(50.0, 0.0, 0.0) - 40.0).abs() < 1e-9);
        // Free and instant at full accuracy reaches 100.
        assert!((policy.score(100.0, 0.0, 0.0) - 100.0).abs() < 1e-9);
        // Budget exhausted leaves the weighted accuracy.
        assert!((policy.score(100.0, 10.0, 1e6) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_clamp() {
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(140.0), 100.0);
        assert_eq!(clamp_score(-5.0), 0.0);
    }
}
