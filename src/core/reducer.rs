//! The plan reducer: a total, pure transition function.
//!
//! | From | Action | To |
//! |---|---|---|
//! | idle, failed, completed, execution_failed | GENERATE_PLAN_START | generating |
//! | generating | GENERATE_PLAN_STREAM | generating (chunk appended) |
//! | generating | GENERATE_PLAN_SUCCESS | awaiting_approval |
//! | generating | GENERATE_PLAN_FAILURE | failed |
//! | awaiting_approval | APPROVE_AND_EXECUTE | running (index 0) |
//! | running | SET_CURRENT_STEP | running |
//! | running | UPDATE_STEP | running |
//! | running | EXECUTION_FAILURE | execution_failed |
//! | running | COMPLETE_EXECUTION | completed |
//! | any | RESET | idle |
//!
//! Every other combination returns the input state unchanged. Step indices
//! out of range and step updates that would regress a step are ignored too.

use crate::domain::{DeploymentPlanAction, DeploymentPlanState, Plan};

/// Result of reducing one action
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: DeploymentPlanState,

    /// False when the action was ignored and `state` is the input state
    pub applied: bool,
}

impl Transition {
    fn applied(state: DeploymentPlanState) -> Self {
        Self {
            state,
            applied: true,
        }
    }

    fn ignored(state: DeploymentPlanState) -> Self {
        Self {
            state,
            applied: false,
        }
    }
}

/// Reduce `action` against `state`
pub fn reduce(state: DeploymentPlanState, action: DeploymentPlanAction) -> DeploymentPlanState {
    transition(state, action).state
}

/// Reduce `action` against `state`, reporting whether it was applied
pub fn transition(state: DeploymentPlanState, action: DeploymentPlanAction) -> Transition {
    use DeploymentPlanAction as A;
    use DeploymentPlanState as S;

    match (state, action) {
        (_, A::Reset) => Transition::applied(S::Idle),

        (
            S::Idle | S::Failed { .. } | S::Completed { .. } | S::ExecutionFailed { .. },
            A::GeneratePlanStart,
        ) => Transition::applied(S::Generating {
            partial_analysis: None,
        }),

        (S::Generating { partial_analysis }, A::GeneratePlanStream { explanations_chunk }) => {
            let mut partial = partial_analysis.unwrap_or_default();
            partial.explanations.push_str(&explanations_chunk);
            Transition::applied(S::Generating {
                partial_analysis: Some(partial),
            })
        }

        (
            S::Generating { .. },
            A::GeneratePlanSuccess {
                analysis,
                steps,
                policy_result,
            },
        ) => Transition::applied(S::AwaitingApproval {
            plan: Plan {
                analysis,
                steps,
                safety_report: policy_result.safety_report,
            },
            policy_notes: policy_result.notes,
            requires_approval: policy_result.requires_approval,
        }),

        (S::Generating { .. }, A::GeneratePlanFailure { error }) => {
            Transition::applied(S::Failed { error })
        }

        (S::AwaitingApproval { plan, .. }, A::ApproveAndExecute) => {
            Transition::applied(S::Running {
                plan,
                current_step_index: 0,
            })
        }

        (
            S::Running {
                plan,
                current_step_index,
            },
            A::SetCurrentStep { step_index },
        ) => {
            if step_index < plan.steps.len() {
                Transition::applied(S::Running {
                    plan,
                    current_step_index: step_index,
                })
            } else {
                Transition::ignored(S::Running {
                    plan,
                    current_step_index,
                })
            }
        }

        (
            S::Running {
                mut plan,
                current_step_index,
            },
            A::UpdateStep {
                step_index,
                new_status,
                duration,
            },
        ) => {
            let advanced = plan
                .steps
                .get_mut(step_index)
                .map(|step| step.advance(new_status, duration))
                .unwrap_or(false);

            let state = S::Running {
                plan,
                current_step_index,
            };
            if advanced {
                Transition::applied(state)
            } else {
                Transition::ignored(state)
            }
        }

        (
            S::Running {
                plan,
                current_step_index,
            },
            A::ExecutionFailure { error },
        ) => Transition::applied(S::ExecutionFailed {
            plan,
            current_step_index,
            error,
        }),

        (
            S::Running {
                plan,
                current_step_index,
            },
            A::CompleteExecution,
        ) => Transition::applied(S::Completed {
            plan,
            current_step_index,
        }),

        (state, _) => Transition::ignored(state),
    }
}
