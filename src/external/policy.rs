use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ApprovalRequirement, PolicyDecision, PolicyGate, PolicyVerdict};
use crate::graph::{ActionGraph, OperationKind};
use crate::supervisor::{RiskLevel, TaskView};

/// Policy gate that approves everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyGate for AllowAllPolicy {
    async fn evaluate(&self, _task: &TaskView, _graph: &ActionGraph) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Task risk level is at least this high
    RiskAtLeast { level: RiskLevel },
    /// Goal text mentions any of these words or phrases as whole words
    /// (case-insensitive)
    GoalMentions { words: Vec<String> },
    /// A type-text node targets a descriptor containing any of these fragments
    TypesInto { fragments: Vec<String> },
    /// The graph contains a node of this kind
    Performs { kind: OperationKind },
    /// The graph performs no side-effecting operation
    ReadOnly,
}

impl RuleCondition {
    fn matches(&self, task: &TaskView, graph: &ActionGraph) -> bool {
        match self {
            Self::RiskAtLeast { level } => task.risk >= *level,
            Self::GoalMentions { words } => {
                let goal = words_of(&task.goal);
                words.iter().any(|phrase| {
                    let phrase = words_of(phrase);
                    !phrase.is_empty() && goal.windows(phrase.len()).any(|w| w == phrase.as_slice())
                })
            }
            Self::TypesInto { fragments } => graph.nodes.iter().any(|node| {
                node.kind == OperationKind::TypeText
                    && node.target.as_ref().map_or(false, |t| {
                        let target = t.as_str().to_lowercase();
                        fragments.iter().any(|f| target.contains(&f.to_lowercase()))
                    })
            }),
            Self::Performs { kind } => graph.nodes.iter().any(|n| n.kind == *kind),
            Self::ReadOnly => !graph.nodes.iter().any(|n| n.kind.is_side_effecting()),
        }
    }
}

fn words_of(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    /// Higher priority rules are consulted first
    pub priority: i32,
    pub verdict: PolicyVerdict,
    pub condition: RuleCondition,
    #[serde(default)]
    pub reason: String,
}

impl PolicyRule {
    pub fn new(
        id: impl Into<String>,
        priority: i32,
        verdict: PolicyVerdict,
        condition: RuleCondition,
    ) -> Self {
        Self {
            id: id.into(),
            priority,
            verdict,
            condition,
            reason: String::new(),
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

/// Priority-ordered rule engine.
///
/// The highest-priority matching rule decides the verdict; every matching
/// rule is reported. With no match the verdict is ALLOW.
#[derive(Debug, Clone)]
pub struct RulePolicyGate {
    rules: Vec<PolicyRule>,
}

impl RulePolicyGate {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        let mut gate = Self { rules: Vec::new() };
        for rule in rules {
            gate.add_rule(rule);
        }
        gate
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
        // stable: equal priorities keep insertion order
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn decide(&self, task: &TaskView, graph: &ActionGraph) -> PolicyDecision {
        let matched: Vec<&PolicyRule> = self
            .rules
            .iter()
            .filter(|r| r.condition.matches(task, graph))
            .collect();

        let Some(first) = matched.first() else {
            return PolicyDecision::allow();
        };
        debug!(
            "Policy rule '{}' decided {:?} for task {}",
            first.id, first.verdict, task.id
        );

        PolicyDecision {
            verdict: first.verdict,
            matched_rules: matched.iter().map(|r| r.id.clone()).collect(),
            approval: (first.verdict == PolicyVerdict::RequireApproval).then(|| {
                ApprovalRequirement {
                    reason: first.reason.clone(),
                    approver: None,
                }
            }),
        }
    }
}

impl Default for RulePolicyGate {
    fn default() -> Self {
        Self::new(vec![
            PolicyRule::new(
                "deny-sensitive-input",
                100,
                PolicyVerdict::Deny,
                RuleCondition::TypesInto {
                    fragments: ["password", "card-number", "cvv", "ssn"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                },
            )
            .reason("typing credentials or card data is not automated"),
            PolicyRule::new(
                "approve-financial",
                90,
                PolicyVerdict::RequireApproval,
                RuleCondition::GoalMentions {
                    words: ["pay", "payment", "purchase", "checkout", "transfer", "buy"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                },
            )
            .reason("financial actions need human approval"),
            PolicyRule::new(
                "approve-critical-risk",
                80,
                PolicyVerdict::RequireApproval,
                RuleCondition::RiskAtLeast {
                    level: RiskLevel::Critical,
                },
            )
            .reason("critical risk tasks need human approval"),
            PolicyRule::new(
                "allow-read-only",
                10,
                PolicyVerdict::Allow,
                RuleCondition::ReadOnly,
            ),
        ])
    }
}

#[async_trait]
impl PolicyGate for RulePolicyGate {
    async fn evaluate(&self, task: &TaskView, graph: &ActionGraph) -> PolicyDecision {
        self.decide(task, graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ActionGraphBuilder, ActionNode};
    use crate::supervisor::{TaskRequest, TaskView};

    fn view(goal: &str, risk: RiskLevel) -> TaskView {
        TaskView::pending(TaskRequest::new(goal).risk(risk))
    }

    fn graph(nodes: Vec<ActionNode>) -> ActionGraph {
        ActionGraphBuilder::new("g", "goal").chain(nodes).build_unchecked()
    }

    #[test]
    fn test_sensitive_input_is_denied() {
        let gate = RulePolicyGate::default();
        let g = graph(vec![
            ActionNode::navigate("open", "https://example.com/login"),
            ActionNode::type_text("pw", "login-password", "hunter2"),
        ]);
        let decision = gate.decide(&view("log in", RiskLevel::Low), &g);
        assert_eq!(decision.verdict, PolicyVerdict::Deny);
        assert_eq!(decision.matched_rules, vec!["deny-sensitive-input".to_string()]);
    }

    #[test]
    fn test_financial_goal_requires_approval() {
        let gate = RulePolicyGate::default();
        let g = graph(vec![ActionNode::click("buy", "buy-button")]);
        let decision = gate.decide(&view("Buy the Kindle", RiskLevel::Critical), &g);
        assert_eq!(decision.verdict, PolicyVerdict::RequireApproval);
        assert_eq!(
            decision.matched_rules,
            vec!["approve-financial".to_string(), "approve-critical-risk".to_string()]
        );
        assert!(decision.approval.is_some());
    }

    #[test]
    fn test_goal_words_match_whole_words_only() {
        let gate = RulePolicyGate::default();
        let g = graph(vec![ActionNode::click("send", "send-button")]);
        for goal in ["inspect the payload", "message the buyer", "open the paywall"] {
            let decision = gate.decide(&view(goal, RiskLevel::Low), &g);
            assert_eq!(decision, PolicyDecision::allow(), "{}", goal);
        }

        let decision = gate.decide(&view("Pay, then leave", RiskLevel::Low), &g);
        assert_eq!(decision.verdict, PolicyVerdict::RequireApproval);

        let phrase = RulePolicyGate::new(vec![PolicyRule::new(
            "deny-wire",
            1,
            PolicyVerdict::Deny,
            RuleCondition::GoalMentions {
                words: vec!["wire transfer".to_string()],
            },
        )]);
        assert_eq!(
            phrase.decide(&view("start a Wire Transfer now", RiskLevel::Low), &g).verdict,
            PolicyVerdict::Deny
        );
        assert_eq!(
            phrase.decide(&view("transfer the wire", RiskLevel::Low), &g),
            PolicyDecision::allow()
        );
    }

    #[test]
    fn test_read_only_and_default_allow() {
        let gate = RulePolicyGate::default();
        let g = graph(vec![ActionNode::extract("price", "price-label")]);
        let decision = gate.decide(&view("check price", RiskLevel::Low), &g);
        assert_eq!(decision.verdict, PolicyVerdict::Allow);
        assert_eq!(decision.matched_rules, vec!["allow-read-only".to_string()]);

        let g = graph(vec![ActionNode::click("next", "next-page")]);
        let decision = gate.decide(&view("browse", RiskLevel::Medium), &g);
        assert_eq!(decision, PolicyDecision::allow());
    }
}
