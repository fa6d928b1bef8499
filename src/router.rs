//! Strategy router
//!
//! Chooses between replaying a known procedure (deterministic mode) and
//! asking the planner for a fresh graph (dynamic mode). Match confidence is
//! an opaque input produced by the procedure matcher.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

use crate::core::errors::{AuraError, Result};
use crate::external::{Constraints, ProcedureMatch};

/// Absorbs float error when confidences are exactly `tie_epsilon` apart
const TIE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Minimum confidence for deterministic mode (inclusive)
    pub confidence_threshold: f64,
    /// Candidates this close to the top score count as tied
    pub tie_epsilon: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            tie_epsilon: 0.01,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(AuraError::configuration_field(
                "confidence_threshold must be within [0, 1]",
                "router.confidence_threshold",
            ));
        }
        if !self.tie_epsilon.is_finite() || self.tie_epsilon < 0.0 {
            return Err(AuraError::configuration_field(
                "tie_epsilon must be a non-negative number",
                "router.tie_epsilon",
            ));
        }
        Ok(())
    }
}

/// Caller-requested override of the routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestedMode {
    Deterministic,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    Deterministic { procedure_id: String },
    Dynamic,
}

impl ExecutionMode {
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Self::Deterministic { .. })
    }

    pub fn procedure_id(&self) -> Option<&str> {
        match self {
            Self::Deterministic { procedure_id } => Some(procedure_id),
            Self::Dynamic => None,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deterministic { procedure_id } => write!(f, "deterministic({})", procedure_id),
            Self::Dynamic => f.write_str("dynamic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub mode: ExecutionMode,
    pub rationale: String,
    /// The candidate the decision was based on, if any
    pub candidate: Option<ProcedureMatch>,
}

impl RoutingDecision {
    fn dynamic(rationale: impl Into<String>, candidate: Option<ProcedureMatch>) -> Self {
        Self {
            mode: ExecutionMode::Dynamic,
            rationale: rationale.into(),
            candidate,
        }
    }
}

/// Goal as seen by the router
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest<'a> {
    pub goal: &'a str,
    pub target_domain: Option<String>,
    pub requested: Option<RequestedMode>,
    pub fallback: bool,
}

impl<'a> RouteRequest<'a> {
    /// Target domain taken from the first domain-like token of the goal
    pub fn new(goal: &'a str) -> Self {
        Self {
            goal,
            target_domain: extract_domain(goal),
            requested: None,
            fallback: false,
        }
    }

    /// `constraints["domain"]` wins over the goal text
    pub fn with_constraints(goal: &'a str, constraints: &Constraints) -> Self {
        let mut request = Self::new(goal);
        if let Some(domain) = constraints.get("domain").and_then(|v| v.as_str()) {
            request.target_domain = Some(normalize_domain(domain));
        }
        request
    }

    pub fn requested(mut self, mode: Option<RequestedMode>) -> Self {
        self.requested = mode;
        self
    }

    /// Re-route after a failed deterministic run
    pub fn fallback(mut self) -> Self {
        self.requested = Some(RequestedMode::Dynamic);
        self.fallback = true;
        self
    }
}

fn normalize_domain(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let host = without_scheme.split(['/', '?', '#']).next().unwrap_or("");
    let host = host.split(':').next().unwrap_or("");
    host.strip_prefix("www.").unwrap_or(host).to_string()
}

fn looks_like_domain(host: &str) -> bool {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let valid_labels = labels.iter().all(|l| {
        !l.is_empty() && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    let tld = labels[labels.len() - 1];
    valid_labels && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// First domain-like token in free text, normalized (lowercase, no `www.`)
pub fn extract_domain(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|token| token.trim_matches(|c: char| matches!(c, ',' | '.' | ';' | ':' | '!' | '?' | '(' | ')' | '"' | '\'')))
        .map(normalize_domain)
        .find(|host| looks_like_domain(host))
}

/// Whether a procedure declared for `declared` may serve `target`.
///
/// `*` serves everything; otherwise the target must equal the declared
/// domain or be a subdomain of it. An unknown target only matches `*`.
pub fn domain_compatible(declared: &str, target: Option<&str>) -> bool {
    let declared = declared.trim().to_lowercase();
    if declared == "*" {
        return true;
    }
    let Some(target) = target else {
        return false;
    };
    let declared = declared.strip_prefix("*.").unwrap_or(&declared);
    let declared = normalize_domain(declared);
    target == declared || target.ends_with(&format!(".{}", declared))
}

#[derive(Debug, Clone, Default)]
pub struct StrategyRouter {
    config: RouterConfig,
}

impl StrategyRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Decide without historical statistics; ties fall back to id order
    pub fn decide(&self, request: &RouteRequest<'_>, candidates: &[ProcedureMatch]) -> RoutingDecision {
        self.decide_with_stats(request, candidates, |_| None)
    }

    /// Decide, breaking confidence ties by historical success rate
    pub fn decide_with_stats<F>(
        &self,
        request: &RouteRequest<'_>,
        candidates: &[ProcedureMatch],
        success_rate: F,
    ) -> RoutingDecision
    where
        F: Fn(&str) -> Option<f64>,
    {
        let decision = self.route(request, candidates, success_rate);
        debug!(
            goal = request.goal,
            mode = %decision.mode,
            "Routing decision: {}",
            decision.rationale
        );
        decision
    }

    fn route<F>(
        &self,
        request: &RouteRequest<'_>,
        candidates: &[ProcedureMatch],
        success_rate: F,
    ) -> RoutingDecision
    where
        F: Fn(&str) -> Option<f64>,
    {
        if request.fallback {
            return RoutingDecision::dynamic("fallback after structural mismatch", None);
        }
        if request.requested == Some(RequestedMode::Dynamic) {
            return RoutingDecision::dynamic("dynamic mode requested", None);
        }

        let mut ranked: Vec<&ProcedureMatch> = candidates
            .iter()
            .filter(|c| c.confidence.is_finite())
            .collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let Some(top) = ranked.first().map(|c| c.confidence) else {
            return RoutingDecision::dynamic("no candidate procedures", None);
        };

        let target = request.target_domain.as_deref();
        let compatible = |c: &ProcedureMatch| domain_compatible(&c.declared_domain, target);

        let mut tied: Vec<&ProcedureMatch> = ranked
            .iter()
            .copied()
            .filter(|c| top - c.confidence <= self.config.tie_epsilon + TIE_TOLERANCE)
            .collect();
        tied.sort_by(|a, b| {
            compatible(*b)
                .cmp(&compatible(*a))
                .then_with(|| {
                    compare_rates(
                        success_rate(a.procedure_id.as_str()),
                        success_rate(b.procedure_id.as_str()),
                    )
                })
                .then_with(|| a.procedure_id.cmp(&b.procedure_id))
        });
        let Some(chosen) = tied.first().copied() else {
            return RoutingDecision::dynamic("no candidate procedures", None);
        };

        if !compatible(chosen) {
            return RoutingDecision::dynamic(
                format!(
                    "procedure '{}' declares domain '{}' which does not cover '{}'",
                    chosen.procedure_id,
                    chosen.declared_domain,
                    target.unwrap_or("unknown")
                ),
                Some(chosen.clone()),
            );
        }

        let forced = request.requested == Some(RequestedMode::Deterministic);
        if chosen.confidence >= self.config.confidence_threshold || forced {
            let rationale = if forced && chosen.confidence < self.config.confidence_threshold {
                format!(
                    "deterministic mode requested; using '{}' at confidence {:.2}",
                    chosen.procedure_id, chosen.confidence
                )
            } else {
                format!(
                    "procedure '{}' matched with confidence {:.2} (threshold {:.2})",
                    chosen.procedure_id, chosen.confidence, self.config.confidence_threshold
                )
            };
            return RoutingDecision {
                mode: ExecutionMode::Deterministic {
                    procedure_id: chosen.procedure_id.clone(),
                },
                rationale,
                candidate: Some(chosen.clone()),
            };
        }

        RoutingDecision::dynamic(
            format!(
                "best match '{}' has confidence {:.2}, below threshold {:.2}",
                chosen.procedure_id, chosen.confidence, self.config.confidence_threshold
            ),
            Some(chosen.clone()),
        )
    }
}

/// Higher rates first, unknown rates last
fn compare_rates(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GOAL: &str = "search for Kindle on example.com";

    fn decide(confidence: f64) -> RoutingDecision {
        StrategyRouter::default().decide(
            &RouteRequest::new(GOAL),
            &[ProcedureMatch::new("site-search", confidence, "example.com")],
        )
    }

    #[test]
    fn test_threshold_boundaries() {
        assert!(decide(0.90).mode.is_deterministic());
        assert_eq!(decide(0.80).mode, ExecutionMode::Dynamic);
        // the threshold is inclusive
        assert_eq!(
            decide(0.85).mode,
            ExecutionMode::Deterministic {
                procedure_id: "site-search".into()
            }
        );
    }

    #[test]
    fn test_no_candidates_is_dynamic() {
        let decision = StrategyRouter::default().decide(&RouteRequest::new(GOAL), &[]);
        assert_eq!(decision.mode, ExecutionMode::Dynamic);
        let decision = StrategyRouter::default().decide(
            &RouteRequest::new(GOAL),
            &[ProcedureMatch::new("nan", f64::NAN, "*")],
        );
        assert_eq!(decision.mode, ExecutionMode::Dynamic);
    }

    #[test]
    fn test_domain_mismatch_is_dynamic() {
        let decision = StrategyRouter::default().decide(
            &RouteRequest::new(GOAL),
            &[ProcedureMatch::new("other", 0.99, "other.org")],
        );
        assert_eq!(decision.mode, ExecutionMode::Dynamic);
        assert!(decision.rationale.contains("other.org"));
    }

    #[test]
    fn test_ties_prefer_success_rate_then_id() {
        let candidates = [
            ProcedureMatch::new("b-proc", 0.95, "example.com"),
            ProcedureMatch::new("a-proc", 0.945, "*"),
            ProcedureMatch::new("c-proc", 0.90, "example.com"),
        ];
        let router = StrategyRouter::default();
        let request = RouteRequest::new(GOAL);

        let by_id = router.decide(&request, &candidates);
        assert_eq!(by_id.mode.procedure_id(), Some("a-proc"));

        let by_rate = router.decide_with_stats(&request, &candidates, |id| match id {
            "b-proc" => Some(0.9),
            "a-proc" => Some(0.4),
            _ => None,
        });
        assert_eq!(by_rate.mode.procedure_id(), Some("b-proc"));

        let unknown_last = router.decide_with_stats(&request, &candidates, |id| {
            (id == "b-proc").then_some(0.1)
        });
        assert_eq!(unknown_last.mode.procedure_id(), Some("b-proc"));
    }

    #[test]
    fn test_scores_exactly_epsilon_apart_are_tied() {
        let candidates = [
            ProcedureMatch::new("b-proc", 0.95, "example.com"),
            ProcedureMatch::new("a-proc", 0.94, "example.com"),
        ];
        let decision = StrategyRouter::default().decide_with_stats(
            &RouteRequest::new(GOAL),
            &candidates,
            |id| match id {
                "a-proc" => Some(1.0),
                "b-proc" => Some(0.0),
                _ => None,
            },
        );
        assert_eq!(decision.mode.procedure_id(), Some("a-proc"));

        let apart = [
            ProcedureMatch::new("b-proc", 0.95, "example.com"),
            ProcedureMatch::new("a-proc", 0.939, "example.com"),
        ];
        let decision = StrategyRouter::default()
            .decide_with_stats(&RouteRequest::new(GOAL), &apart, |id| (id == "a-proc").then_some(1.0));
        assert_eq!(decision.mode.procedure_id(), Some("b-proc"));
    }

    #[test]
    fn test_overrides_and_fallback() {
        let router = StrategyRouter::default();
        let candidates = [ProcedureMatch::new("p", 0.99, "*")];
        let request = RouteRequest::new(GOAL).requested(Some(RequestedMode::Dynamic));
        assert_eq!(router.decide(&request, &candidates).mode, ExecutionMode::Dynamic);

        let weak = [ProcedureMatch::new("p", 0.3, "*")];
        let request = RouteRequest::new(GOAL).requested(Some(RequestedMode::Deterministic));
        assert!(router.decide(&request, &weak).mode.is_deterministic());

        let decision = router.decide(&RouteRequest::new(GOAL).fallback(), &candidates);
        assert_eq!(decision.mode, ExecutionMode::Dynamic);
    }

    #[test]
    fn test_domain_extraction_and_compatibility() {
        assert_eq!(extract_domain(GOAL).as_deref(), Some("example.com"));
        assert_eq!(
            extract_domain("open https://www.Shop.Example.com/cart now").as_deref(),
            Some("shop.example.com")
        );
        assert_eq!(extract_domain("buy 2.5 kg of rice"), None);

        assert!(domain_compatible("*", None));
        assert!(!domain_compatible("example.com", None));
        assert!(domain_compatible("example.com", Some("shop.example.com")));
        assert!(domain_compatible("*.example.com", Some("example.com")));
        assert!(!domain_compatible("example.com", Some("badexample.com")));

        let mut constraints = Constraints::new();
        constraints.insert("domain".into(), json!("https://other.org/path"));
        let request = RouteRequest::with_constraints(GOAL, &constraints);
        assert_eq!(request.target_domain.as_deref(), Some("other.org"));
    }
}
