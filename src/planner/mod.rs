// Author: BlackIce Project
// License: MIT

pub mod schema;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::error::PlannerError;
use crate::core::plan::Plan;
use crate::guard::patterns;

pub use schema::{AdaptRequest, ErrorContext, IntentTags, PlanRequest, ScreenAnalysis, SystemContext};

/// Sentinel string the planner may return instead of an adapted plan.
const CANNOT_RECOVER: &str = "CannotRecover";

/// The external AI planner. Implementations own transport and prompting;
/// the façade owns timeouts, redaction, and schema validation.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<serde_json::Value, PlannerError>;
    async fn adapt(&self, request: &AdaptRequest) -> Result<serde_json::Value, PlannerError>;
    async fn interpret(&self, intent: &str) -> Result<serde_json::Value, PlannerError>;
}

/// Normalizes the planner's output into validated [`Plan`] values. The
/// orchestrator never sees free-form JSON.
pub struct PlannerFacade {
    backend: Arc<dyn Planner>,
    call_timeout: Duration,
}

impl PlannerFacade {
    pub fn new(backend: Arc<dyn Planner>, call_timeout: Duration) -> Self {
        Self {
            backend,
            call_timeout,
        }
    }

    pub async fn plan(
        &self,
        intent: &str,
        screen: ScreenAnalysis,
        system: SystemContext,
    ) -> Result<Plan, PlannerError> {
        let request = PlanRequest {
            intent: redact_blocklisted(intent),
            screen,
            system,
        };

        let value = self.bounded(self.backend.plan(&request)).await?;
        let plan = parse_plan(value)?;
        debug!(task_id = %plan.task_id, steps = plan.steps.len(), "plan validated");
        Ok(plan)
    }

    pub async fn adapt(
        &self,
        plan: &Plan,
        cursor: usize,
        error_context: ErrorContext,
        screen: ScreenAnalysis,
    ) -> Result<Plan, PlannerError> {
        let request = AdaptRequest {
            plan: plan.clone(),
            cursor,
            error_context,
            screen,
        };

        let value = self.bounded(self.backend.adapt(&request)).await?;

        if value.as_str() == Some(CANNOT_RECOVER) {
            return Err(PlannerError::CannotRecover);
        }

        parse_plan(value)
    }

    pub async fn interpret(&self, intent: &str) -> Result<IntentTags, PlannerError> {
        let redacted = redact_blocklisted(intent);
        let value = self.bounded(self.backend.interpret(&redacted)).await?;
        let tags: IntentTags =
            serde_json::from_value(value).map_err(|e| PlannerError::Malformed(e.to_string()))?;
        if !(0.0..=1.0).contains(&tags.confidence) {
            return Err(PlannerError::Malformed("confidence outside [0, 1]".into()));
        }
        Ok(tags)
    }

    async fn bounded(
        &self,
        call: impl std::future::Future<Output = Result<serde_json::Value, PlannerError>>,
    ) -> Result<serde_json::Value, PlannerError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PlannerError::Timeout),
        }
    }
}

/// Placeholder backend for deployments where no planner endpoint has been
/// wired in yet; every call reports the planner as unavailable so tasks
/// fail fast with the right exit code.
pub struct UnconfiguredPlanner;

#[async_trait]
impl Planner for UnconfiguredPlanner {
    async fn plan(&self, _request: &PlanRequest) -> Result<serde_json::Value, PlannerError> {
        Err(PlannerError::Unavailable(
            "no planner backend configured".to_string(),
        ))
    }

    async fn adapt(&self, _request: &AdaptRequest) -> Result<serde_json::Value, PlannerError> {
        Err(PlannerError::Unavailable(
            "no planner backend configured".to_string(),
        ))
    }

    async fn interpret(&self, _intent: &str) -> Result<serde_json::Value, PlannerError> {
        Err(PlannerError::Unavailable(
            "no planner backend configured".to_string(),
        ))
    }
}

fn parse_plan(value: serde_json::Value) -> Result<Plan, PlannerError> {
    let plan: Plan =
        serde_json::from_value(value).map_err(|e| PlannerError::Malformed(e.to_string()))?;
    plan.validate()
        .map_err(|e| PlannerError::Malformed(e.to_string()))?;
    Ok(plan)
}

/// Intent text that trips the command blocklist never travels verbatim to
/// an external service.
fn redact_blocklisted(intent: &str) -> String {
    let mut out = intent.to_string();
    for pattern in patterns::BLOCKED_COMMANDS.iter() {
        if pattern.re.is_match(&out) {
            warn!(pattern = pattern.label, "redacting blocklisted intent text");
            out = pattern.re.replace_all(&out, "[REDACTED]").into_owned();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    struct ScriptedPlanner {
        plan_outputs: Mutex<Vec<Result<serde_json::Value, PlannerError>>>,
        adapt_output: Option<serde_json::Value>,
        seen_intents: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn plan(
            &self,
            request: &PlanRequest,
        ) -> Result<serde_json::Value, PlannerError> {
            self.seen_intents
                .lock()
                .unwrap()
                .push(request.intent.clone());
            self.plan_outputs
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(PlannerError::Unavailable("no script".into())))
        }

        async fn adapt(&self, _request: &AdaptRequest) -> Result<serde_json::Value, PlannerError> {
            self.adapt_output
                .clone()
                .ok_or(PlannerError::Unavailable("no script".into()))
        }

        async fn interpret(&self, _intent: &str) -> Result<serde_json::Value, PlannerError> {
            Ok(serde_json::json!({
                "intent_kind": "automation",
                "estimated_steps": 2,
                "confidence": 0.8,
                "requires_confirmation": false
            }))
        }
    }

    fn wire_plan(confidence: f32) -> serde_json::Value {
        serde_json::json!({
            "task_id": "t-1",
            "intent": "open calculator",
            "steps": [{
                "id": "s1",
                "order": 1,
                "description": "open the calculator",
                "action": {"type": "open_application", "alias": "calculator"},
                "timeout_ms": 5000,
                "retry_policy": {"kind": "none"}
            }],
            "success_criterion": "calculator visible",
            "confidence": confidence,
            "created_at": Utc::now().to_rfc3339(),
        })
    }

    fn facade(outputs: Vec<Result<serde_json::Value, PlannerError>>) -> PlannerFacade {
        PlannerFacade::new(
            Arc::new(ScriptedPlanner {
                plan_outputs: Mutex::new(outputs),
                adapt_output: None,
                seen_intents: Mutex::new(Vec::new()),
            }),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn valid_wire_plan_round_trips() {
        let f = facade(vec![Ok(wire_plan(0.9))]);
        let plan = f
            .plan("open calculator", ScreenAnalysis::default(), SystemContext::default())
            .await
            .unwrap();
        assert_eq!(plan.task_id, "t-1");
        assert_eq!(plan.steps.len(), 1);

        // Round trip through the serializer is identity.
        let json = serde_json::to_value(&plan).unwrap();
        let back: Plan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_malformed() {
        let f = facade(vec![Ok(wire_plan(1.7))]);
        let err = f
            .plan("x", ScreenAnalysis::default(), SystemContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::Malformed(_)));
    }

    #[tokio::test]
    async fn unknown_action_type_is_malformed() {
        let mut wire = wire_plan(0.9);
        wire["steps"][0]["action"] = serde_json::json!({"type": "drag_drop", "x": 1, "y": 2});
        let f = facade(vec![Ok(wire)]);
        let err = f
            .plan("x", ScreenAnalysis::default(), SystemContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::Malformed(_)));
    }

    #[tokio::test]
    async fn cannot_recover_sentinel_is_typed() {
        let backend = ScriptedPlanner {
            plan_outputs: Mutex::new(vec![]),
            adapt_output: Some(serde_json::Value::String(CANNOT_RECOVER.to_string())),
            seen_intents: Mutex::new(Vec::new()),
        };
        let f = PlannerFacade::new(Arc::new(backend), Duration::from_secs(5));

        let plan: Plan = serde_json::from_value(wire_plan(0.9)).unwrap();
        let err = f
            .adapt(
                &plan,
                0,
                ErrorContext {
                    current_step: 0,
                    completed_steps: 0,
                    last_errors: vec![],
                    retry_count: 0,
                    disruptions: vec![],
                },
                ScreenAnalysis::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::CannotRecover));
    }

    #[tokio::test]
    async fn blocklisted_intent_is_redacted_before_the_backend() {
        let backend = Arc::new(ScriptedPlanner {
            plan_outputs: Mutex::new(vec![Ok(wire_plan(0.9))]),
            adapt_output: None,
            seen_intents: Mutex::new(Vec::new()),
        });
        let f = PlannerFacade::new(Arc::clone(&backend) as Arc<dyn Planner>, Duration::from_secs(5));

        let _ = f
            .plan(
                "please type rm -rf / into the shell",
                ScreenAnalysis::default(),
                SystemContext::default(),
            )
            .await;

        let seen = backend.seen_intents.lock().unwrap();
        assert!(!seen[0].contains("rm -rf"));
        assert!(seen[0].contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        struct SlowPlanner;

        #[async_trait]
        impl Planner for SlowPlanner {
            async fn plan(&self, _: &PlanRequest) -> Result<serde_json::Value, PlannerError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(serde_json::Value::Null)
            }
            async fn adapt(&self, _: &AdaptRequest) -> Result<serde_json::Value, PlannerError> {
                unreachable!()
            }
            async fn interpret(&self, _: &str) -> Result<serde_json::Value, PlannerError> {
                unreachable!()
            }
        }

        tokio::time::pause();
        let f = PlannerFacade::new(Arc::new(SlowPlanner), Duration::from_millis(100));
        let err = f
            .plan("x", ScreenAnalysis::default(), SystemContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::Timeout));
    }

    #[tokio::test]
    async fn interpret_parses_tags() {
        let f = facade(vec![]);
        let tags = f.interpret("open calculator").await.unwrap();
        assert_eq!(tags.intent_kind, "automation");
        assert!(!tags.requires_confirmation);
    }
}
