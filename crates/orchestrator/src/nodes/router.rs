//! Router stage.
//!
//! Decides whether the query needs the tool-execution stage. The primary
//! [`DecisionProvider`] is wrapped in a [`FallbackDecider`] so an unavailable
//! model degrades to keyword rules. A [`HeuristicOverride`] may then replace
//! the decision when it disagrees with enough confidence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::engine::state::{Decision, DecisionSource, NodeName, RetrievedItem, WorkflowState};
use crate::error::{CollaboratorError, NodeError};
use crate::hitl::SuspensionKind;
use crate::services::DecisionProvider;

use super::{with_timeout, Node, NodeContext, NodeOutcome};

/// Phrases suggesting the answer needs data from the datasource.
const DATA_SIGNALS: &[&str] = &[
    "how many",
    "total",
    "sum of",
    "average",
    "count",
    "top ",
    "per ",
    " by ",
    "trend",
    "compare",
    "highest",
    "lowest",
    "list all",
    "show me",
];

/// Phrases suggesting a definitional or explanatory question.
const CONCEPT_SIGNALS: &[&str] = &[
    "what is",
    "what are",
    "what does",
    "define",
    "definition of",
    "meaning of",
    "explain",
    "why",
    "how does",
    "describe",
];

/// Router tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouterPolicy {
    pub heuristic_override: bool,
    /// The heuristic wins only with a confidence strictly above this.
    pub heuristic_threshold: f64,
    /// Interrupt for human review when the final confidence is below this.
    pub review_below_confidence: Option<f64>,
}

impl Default for RouterPolicy {
    fn default() -> Self {
        Self {
            heuristic_override: true,
            heuristic_threshold: 0.8,
            review_below_confidence: None,
        }
    }
}

fn matches<'a>(query: &str, signals: &[&'a str]) -> Vec<&'a str> {
    signals.iter().copied().filter(|s| query.contains(s)).collect()
}

/// Keyword rules. Always available.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedDecider;

impl RuleBasedDecider {
    pub fn evaluate(&self, query: &str) -> Decision {
        let q = format!(" {} ", query.to_lowercase());
        let data = matches(&q, DATA_SIGNALS);
        let concept = matches(&q, CONCEPT_SIGNALS);

        let (needs_tool, hits, rationale) = if data.len() > concept.len() {
            (true, data.len(), format!("matched data signals: {}", data.join(", ")))
        } else if !concept.is_empty() {
            (false, concept.len(), format!("matched concept signals: {}", concept.join(", ")))
        } else {
            (false, 0, "no data signals; answering from retrieved context".to_string())
        };

        Decision {
            needs_tool,
            rationale,
            confidence: (0.5 + 0.1 * hits as f64).min(0.9),
            source: DecisionSource::Primary,
        }
    }
}

#[async_trait]
impl DecisionProvider for RuleBasedDecider {
    async fn decide(&self, query: &str, _context: &[RetrievedItem]) -> Result<Decision, CollaboratorError> {
        Ok(self.evaluate(query))
    }
}

/// A primary provider backed by [`RuleBasedDecider`].
#[derive(Clone)]
pub struct FallbackDecider {
    primary: Arc<dyn DecisionProvider>,
    fallback: RuleBasedDecider,
}

impl FallbackDecider {
    pub fn new(primary: Arc<dyn DecisionProvider>) -> Self {
        Self {
            primary,
            fallback: RuleBasedDecider,
        }
    }

    /// Ask the primary under `timeout`; use the rules if it fails.
    pub async fn decide_within(&self, query: &str, context: &[RetrievedItem], timeout: Option<Duration>) -> Decision {
        match with_timeout(timeout, self.primary.decide(query, context)).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "Decision provider failed, using rule-based fallback");
                let decision = self.fallback.evaluate(query);
                Decision {
                    rationale: format!("{} (fallback: {})", decision.rationale, e),
                    source: DecisionSource::Fallback,
                    ..decision
                }
            }
        }
    }
}

#[async_trait]
impl DecisionProvider for FallbackDecider {
    async fn decide(&self, query: &str, context: &[RetrievedItem]) -> Result<Decision, CollaboratorError> {
        Ok(self.decide_within(query, context, None).await)
    }
}

/// Output of [`HeuristicOverride::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicSignal {
    pub needs_tool: bool,
    pub confidence: f64,
    pub reason: String,
}

/// Secondary heuristic over query shape and retrieval coverage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeuristicOverride {
    /// Top context score at which the context is considered sufficient.
    pub coverage_score: f64,
    pub concept_confidence: f64,
    pub aggregation_confidence: f64,
}

impl Default for HeuristicOverride {
    fn default() -> Self {
        Self {
            coverage_score: 0.9,
            concept_confidence: 0.9,
            aggregation_confidence: 0.85,
        }
    }
}

impl HeuristicOverride {
    pub fn evaluate(&self, query: &str, context: &[RetrievedItem]) -> Option<HeuristicSignal> {
        let q = format!(" {} ", query.trim().to_lowercase());
        if let Some(signal) = matches(&q, DATA_SIGNALS).first() {
            return Some(HeuristicSignal {
                needs_tool: true,
                confidence: self.aggregation_confidence,
                reason: format!("aggregation requested ('{}')", signal.trim()),
            });
        }

        let head = q.trim_start();
        if let Some(signal) = CONCEPT_SIGNALS.iter().find(|s| head.starts_with(*s)) {
            return Some(HeuristicSignal {
                needs_tool: false,
                confidence: self.concept_confidence,
                reason: format!("conceptual question ('{}')", signal),
            });
        }

        let best = context.iter().map(|i| i.score).fold(f64::NAN, f64::max);
        (best >= self.coverage_score).then(|| HeuristicSignal {
            needs_tool: false,
            confidence: best.min(1.0),
            reason: format!("retrieved context covers the query (score {:.2})", best),
        })
    }
}

pub struct RouteNode {
    decider: FallbackDecider,
    heuristic: HeuristicOverride,
    policy: RouterPolicy,
}

impl RouteNode {
    pub fn new(decider: Arc<dyn DecisionProvider>, policy: RouterPolicy) -> Self {
        Self {
            decider: FallbackDecider::new(decider),
            heuristic: HeuristicOverride::default(),
            policy,
        }
    }

    /// Apply the heuristic override to a provider decision.
    pub fn reconcile(&self, decision: Decision, query: &str, context: &[RetrievedItem]) -> Decision {
        if !self.policy.heuristic_override {
            return decision;
        }
        match self.heuristic.evaluate(query, context) {
            Some(signal)
                if signal.needs_tool != decision.needs_tool
                    && signal.confidence > self.policy.heuristic_threshold =>
            {
                info!(
                    needs_tool = signal.needs_tool,
                    confidence = signal.confidence,
                    reason = %signal.reason,
                    "Heuristic override applied to router decision"
                );
                Decision {
                    needs_tool: signal.needs_tool,
                    rationale: format!("{} (heuristic override: {})", decision.rationale, signal.reason),
                    confidence: signal.confidence,
                    source: DecisionSource::HeuristicOverride,
                }
            }
            _ => decision,
        }
    }

    async fn execute(&self, state: &WorkflowState, ctx: &NodeContext) -> Result<(WorkflowState, Decision), NodeError> {
        let context = state.context_items();
        let decision = self
            .decider
            .decide_within(&state.query, context, ctx.timeout())
            .await;
        let decision = self.reconcile(decision, &state.query, context);

        let mut next = state.clone();
        next.set_decision(decision.clone())?;
        Ok((next, decision))
    }
}

#[async_trait]
impl Node for RouteNode {
    fn name(&self) -> NodeName {
        NodeName::Route
    }

    async fn run(&self, state: &WorkflowState, ctx: &NodeContext) -> NodeOutcome {
        let (next, decision) = match self.execute(state, ctx).await {
            Ok(result) => result,
            Err(e) => return NodeOutcome::Fail(e),
        };

        match self.policy.review_below_confidence {
            Some(floor) if decision.confidence < floor => NodeOutcome::Suspend {
                state: next,
                kind: SuspensionKind::Interrupt,
                reason: Some(format!(
                    "decision confidence {:.2} below review threshold {:.2}",
                    decision.confidence, floor
                )),
            },
            _ => NodeOutcome::Continue(next),
        }
    }
}
