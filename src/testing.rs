//! Scripted collaborators
//!
//! Deterministic stand-ins for the locator resolver, execution surface,
//! matcher, planner and approval handler. Used by the crate's tests and handy
//! for dry runs of graph documents.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::external::{
    ApprovalHandler, ApprovalOutcome, Constraints, ExecutionSurface, LocatorResolver,
    PlanningFailed, Planner, PolicyDecision, ProcedureMatch, ProcedureMatcher, SurfaceError,
    TargetHandle, Unresolvable,
};
use crate::graph::{ActionGraph, OperationKind, TargetDescriptor};
use crate::supervisor::TaskView;

/// Resolves every descriptor to `css=<descriptor>` unless told otherwise
#[derive(Default)]
pub struct StaticResolver {
    never: HashSet<String>,
    failures_left: Mutex<HashMap<String, u32>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unresolvable(mut self, descriptor: &str) -> Self {
        self.never.insert(descriptor.to_string());
        self
    }

    /// Fail the first `times` resolutions of `descriptor`
    pub fn flaky(self, descriptor: &str, times: u32) -> Self {
        self.failures_left.lock().insert(descriptor.to_string(), times);
        self
    }
}

#[async_trait]
impl LocatorResolver for StaticResolver {
    async fn resolve(&self, target: &TargetDescriptor) -> Result<TargetHandle, Unresolvable> {
        let unresolvable = |reason: &str| Unresolvable {
            descriptor: target.clone(),
            reason: reason.to_string(),
        };
        if self.never.contains(target.as_str()) {
            return Err(unresolvable("no locator matches"));
        }
        if let Some(left) = self.failures_left.lock().get_mut(target.as_str()) {
            if *left > 0 {
                *left -= 1;
                return Err(unresolvable("locator not found yet"));
            }
        }
        Ok(TargetHandle::new(target.clone(), format!("css={}", target)))
    }
}

/// One call observed by the scripted surface
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceCall {
    pub kind: OperationKind,
    pub target: Option<String>,
}

/// Execution surface replaying scripted outcomes.
///
/// Outcomes are keyed by target descriptor, or by the kind name for
/// untargeted operations. Once a script runs dry the default applies:
/// `true` for asserts, an echo object for everything else.
#[derive(Default)]
pub struct ScriptedSurface {
    scripts: Mutex<HashMap<String, VecDeque<Result<Value, SurfaceError>>>>,
    calls: Mutex<Vec<SurfaceCall>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation takes at least `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(
        self,
        key: &str,
        outcomes: impl IntoIterator<Item = Result<Value, SurfaceError>>,
    ) -> Self {
        self.scripts
            .lock()
            .entry(key.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of operations observed in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionSurface for ScriptedSurface {
    async fn perform(
        &self,
        kind: OperationKind,
        target: Option<&TargetHandle>,
        params: &HashMap<String, Value>,
    ) -> Result<Value, SurfaceError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        let key = target
            .map(|t| t.descriptor.as_str().to_string())
            .unwrap_or_else(|| kind.as_str().to_string());
        self.calls.lock().push(SurfaceCall {
            kind,
            target: target.map(|t| t.descriptor.as_str().to_string()),
        });
        let scripted = self.scripts.lock().get_mut(&key).and_then(VecDeque::pop_front);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        scripted.unwrap_or_else(|| match kind {
            OperationKind::Assert => Ok(Value::Bool(true)),
            _ => Ok(json!({
                "kind": kind.as_str(),
                "target": target.map(|t| t.locator.clone()),
                "params": params,
            })),
        })
    }
}

/// Matcher returning the same candidates for every goal
#[derive(Default)]
pub struct StaticMatcher {
    matches: Vec<ProcedureMatch>,
}

impl StaticMatcher {
    pub fn new(matches: Vec<ProcedureMatch>) -> Self {
        Self { matches }
    }
}

#[async_trait]
impl ProcedureMatcher for StaticMatcher {
    async fn match_goal(
        &self,
        _goal: &str,
        _constraints: &Constraints,
    ) -> anyhow::Result<Vec<ProcedureMatch>> {
        Ok(self.matches.clone())
    }
}

/// Planner handing out prepared graphs in order, then failing
#[derive(Default)]
pub struct ScriptedPlanner {
    graphs: Mutex<VecDeque<Result<ActionGraph, PlanningFailed>>>,
    calls: AtomicUsize,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn returning(graph: ActionGraph) -> Self {
        Self::new().then(Ok(graph))
    }

    pub fn failing(reason: &str) -> Self {
        Self::new().then(Err(PlanningFailed::new(reason)))
    }

    pub fn then(self, outcome: Result<ActionGraph, PlanningFailed>) -> Self {
        self.graphs.lock().push_back(outcome);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(
        &self,
        _goal: &str,
        _constraints: &Constraints,
        _budget: u64,
    ) -> Result<ActionGraph, PlanningFailed> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut graphs = self.graphs.lock();
        // the last prepared outcome repeats
        match graphs.len() {
            0 => Err(PlanningFailed::new("no plan available")),
            1 => graphs
                .front()
                .cloned()
                .unwrap_or_else(|| Err(PlanningFailed::new("no plan available"))),
            _ => graphs
                .pop_front()
                .unwrap_or_else(|| Err(PlanningFailed::new("no plan available"))),
        }
    }
}

/// Approval handler with a fixed answer that remembers what it was asked
pub struct FixedApprovals {
    outcome: ApprovalOutcome,
    requests: Mutex<Vec<String>>,
}

impl FixedApprovals {
    pub fn new(outcome: ApprovalOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ApprovalHandler for FixedApprovals {
    async fn request_approval(
        &self,
        task: &TaskView,
        _graph: &ActionGraph,
        _decision: &PolicyDecision,
    ) -> ApprovalOutcome {
        self.requests.lock().push(task.id.clone());
        self.outcome
    }
}
