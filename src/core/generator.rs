//! Streaming plan generation.
//!
//! Drives one generation cycle: `GENERATE_PLAN_START`, one
//! `GENERATE_PLAN_STREAM` per chunk in arrival order, then exactly one of
//! `GENERATE_PLAN_SUCCESS` (with steps and the policy verdict) or
//! `GENERATE_PLAN_FAILURE`.

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::adapters::{AnalysisProvider, GenerationError, PlanRequest};
use crate::domain::{
    Analysis, DeploymentPlanAction, DeploymentPlanState, DeploymentStep, SafetyThresholds,
};

use super::policy::PolicyGate;
use super::safety::{SafetyEvaluator, SafetySettings};
use super::store::Dispatcher;

/// Generates plans and gates them
pub struct PlanGenerator {
    evaluator: SafetyEvaluator,
    thresholds: SafetyThresholds,
    gate: PolicyGate,
}

impl PlanGenerator {
    pub fn new(evaluator: SafetyEvaluator, thresholds: SafetyThresholds, gate: PolicyGate) -> Self {
        Self {
            evaluator,
            thresholds,
            gate,
        }
    }

    pub fn from_settings(safety: &SafetySettings, gate: PolicyGate) -> Self {
        Self::new(SafetyEvaluator::from_settings(safety), safety.thresholds, gate)
    }

    pub fn gate(&self) -> &PolicyGate {
        &self.gate
    }

    /// Run one generation cycle against the store behind `dispatcher`.
    ///
    /// Returns the state after the terminal action. If the store refuses
    /// `GENERATE_PLAN_START` (a plan is already generating, awaiting approval
    /// or running) nothing else is dispatched and the unchanged state is
    /// returned. Chunks and the outcome are dispatched within the epoch
    /// opened by the start, so a reset mid-generation drops them.
    ///
    /// When the provider's final analysis carries no explanations, the
    /// streamed text becomes the explanations that get evaluated.
    #[instrument(skip(self, provider, request, dispatcher), fields(provider = provider.name()))]
    pub async fn run(
        &self,
        provider: &dyn AnalysisProvider,
        request: &PlanRequest,
        dispatcher: &Dispatcher,
    ) -> Result<DeploymentPlanState> {
        let (epoch, state) = dispatcher
            .apply_tracked(DeploymentPlanAction::GeneratePlanStart)
            .await?;
        if !matches!(state, DeploymentPlanState::Generating { .. }) {
            warn!(status = %state.status(), "Generation not started");
            return Ok(state);
        }
        info!(epoch, "Generating plan");

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();

        // The provider drops the sender when it returns, ending the forward loop
        let forward = async {
            let mut streamed = String::new();
            while let Some(chunk) = chunk_rx.recv().await {
                streamed.push_str(&chunk);
                let accepted = dispatcher
                    .apply_in(epoch, DeploymentPlanAction::stream(chunk))
                    .await?;
                if accepted.is_none() {
                    return Ok(None);
                }
            }
            Ok::<_, anyhow::Error>(Some(streamed))
        };
        let (outcome, forwarded) = tokio::join!(provider.generate(request, chunk_tx), forward);
        let Some(streamed) = forwarded? else {
            info!("Generation superseded by a newer plan");
            return Ok(dispatcher.snapshot());
        };

        let action = match outcome.and_then(validate) {
            Ok(mut analysis) => {
                if analysis.explanations.is_empty() {
                    analysis.explanations = streamed;
                }

                let steps = DeploymentStep::from_actions(&analysis.actions);
                let report = self.evaluator.evaluate(&analysis, &self.thresholds);
                let decision = self.gate.decide(&analysis, &report);

                info!(
                    steps = steps.len(),
                    safety_ok = report.ok,
                    requires_approval = decision.requires_approval,
                    "Plan generated"
                );

                DeploymentPlanAction::GeneratePlanSuccess {
                    analysis,
                    steps,
                    policy_result: decision.into_result(report),
                }
            }
            Err(e) => {
                error!(error = %e, "Plan generation failed");
                DeploymentPlanAction::GeneratePlanFailure {
                    error: e.to_string(),
                }
            }
        };

        match dispatcher.apply_in(epoch, action).await? {
            Some(state) => Ok(state),
            None => {
                info!("Generation superseded by a newer plan");
                Ok(dispatcher.snapshot())
            }
        }
    }
}

fn validate(analysis: Analysis) -> Result<Analysis, GenerationError> {
    if !analysis.has_valid_confidence() {
        return Err(GenerationError::InvalidAnalysis(format!(
            "confidence {} is outside [0, 1]",
            analysis.confidence
        )));
    }
    Ok(analysis)
}
