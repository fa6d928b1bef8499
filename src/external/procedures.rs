//! In-memory procedure library
//!
//! Procedures are graph templates whose string parameters and target
//! descriptors may contain `{{name}}` placeholders filled from the task's
//! constraints. The library also keeps per-procedure success statistics and
//! offers a keyword-overlap matcher as a baseline scorer.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use super::{Constraints, ProcedureError, ProcedureLibrary, ProcedureMatch, ProcedureMatcher};
use crate::graph::{ActionGraph, TargetDescriptor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureTemplate {
    pub id: String,
    /// `*` for any domain
    #[serde(default = "any_domain")]
    pub declared_domain: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub required_params: Vec<String>,
    pub graph: ActionGraph,
}

fn any_domain() -> String {
    "*".to_string()
}

impl ProcedureTemplate {
    pub fn new(id: impl Into<String>, declared_domain: impl Into<String>, graph: ActionGraph) -> Self {
        Self {
            id: id.into(),
            declared_domain: declared_domain.into(),
            keywords: Vec::new(),
            required_params: Vec::new(),
            graph,
        }
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(|k| k.into().to_lowercase()).collect();
        self
    }

    pub fn requires(mut self, param: impl Into<String>) -> Self {
        self.required_params.push(param.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureStats {
    pub successes: u64,
    pub failures: u64,
}

impl ProcedureStats {
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.successes + self.failures;
        (total > 0).then(|| self.successes as f64 / total as f64)
    }
}

#[derive(Default)]
pub struct InMemoryProcedureLibrary {
    templates: DashMap<String, ProcedureTemplate>,
    stats: DashMap<String, ProcedureStats>,
}

impl InMemoryProcedureLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, template: ProcedureTemplate) {
        debug!("Registering procedure '{}'", template.id);
        self.templates.insert(template.id.clone(), template);
    }

    pub fn with_procedure(self, template: ProcedureTemplate) -> Self {
        self.register(template);
        self
    }

    pub fn contains(&self, procedure_id: &str) -> bool {
        self.templates.contains_key(procedure_id)
    }

    pub fn stats(&self, procedure_id: &str) -> ProcedureStats {
        self.stats
            .get(procedure_id)
            .map(|s| *s)
            .unwrap_or_default()
    }

    fn instantiate(
        template: &ProcedureTemplate,
        parameters: &Constraints,
    ) -> Result<ActionGraph, ProcedureError> {
        let incompatible = |detail: String| ProcedureError::IncompatibleParameters {
            procedure_id: template.id.clone(),
            detail,
        };

        let missing: Vec<&str> = template
            .required_params
            .iter()
            .filter(|p| parameters.get(p.as_str()).map_or(true, Value::is_null))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(incompatible(format!("missing parameter(s): {}", missing.join(", "))));
        }

        let mut graph = template.graph.clone();
        graph.id = format!("{}_{}", template.id, cuid2::create_id());
        for node in &mut graph.nodes {
            for value in node.params.values_mut() {
                substitute_value(value, parameters).map_err(&incompatible)?;
            }
            if let Some(target) = &node.target {
                let filled = substitute(target.as_str(), parameters).map_err(&incompatible)?;
                node.target = Some(TargetDescriptor::new(filled));
            }
        }
        graph
            .metadata
            .insert("procedure_id".to_string(), Value::String(template.id.clone()));
        Ok(graph)
    }
}

fn substitute(text: &str, parameters: &Constraints) -> Result<String, String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unterminated placeholder in '{}'", text))?;
        let name = after[..end].trim();
        match parameters.get(name) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => return Err(format!("no value for placeholder '{}'", name)),
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn substitute_value(value: &mut Value, parameters: &Constraints) -> Result<(), String> {
    match value {
        Value::String(s) if s.contains("{{") => {
            *s = substitute(s, parameters)?;
        }
        Value::Array(items) => {
            for item in items {
                substitute_value(item, parameters)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute_value(item, parameters)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[async_trait]
impl ProcedureLibrary for InMemoryProcedureLibrary {
    async fn get_graph(
        &self,
        procedure_id: &str,
        parameters: &Constraints,
    ) -> Result<ActionGraph, ProcedureError> {
        let template = self
            .templates
            .get(procedure_id)
            .ok_or_else(|| ProcedureError::NotFound {
                procedure_id: procedure_id.to_string(),
            })?;
        Self::instantiate(&template, parameters)
    }

    fn success_rate(&self, procedure_id: &str) -> Option<f64> {
        self.stats.get(procedure_id).and_then(|s| s.success_rate())
    }

    fn record_outcome(&self, procedure_id: &str, succeeded: bool) {
        let mut entry = self.stats.entry(procedure_id.to_string()).or_default();
        if succeeded {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }
}

#[async_trait]
impl ProcedureMatcher for InMemoryProcedureLibrary {
    /// Fraction of a procedure's keywords present in the goal
    async fn match_goal(
        &self,
        goal: &str,
        _constraints: &Constraints,
    ) -> anyhow::Result<Vec<ProcedureMatch>> {
        let tokens: HashSet<String> = goal
            .split(|c: char| !c.is_alphanumeric() && c != '.' && c != '-')
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut matches: Vec<ProcedureMatch> = self
            .templates
            .iter()
            .filter(|t| !t.keywords.is_empty())
            .filter_map(|t| {
                let hits = t.keywords.iter().filter(|k| tokens.contains(*k)).count();
                (hits > 0).then(|| {
                    ProcedureMatch::new(
                        t.id.clone(),
                        hits as f64 / t.keywords.len() as f64,
                        t.declared_domain.clone(),
                    )
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.procedure_id.cmp(&b.procedure_id))
        });
        Ok(matches)
    }
}
