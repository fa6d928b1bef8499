use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::errors::ReasonCode;

/// Outcome of checking whether the next dispatch may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitCheck {
    Within,
    BudgetExhausted { needed: u64, remaining: u64 },
    DeadlineExceeded { overrun: Duration },
}

impl LimitCheck {
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            Self::Within => None,
            Self::BudgetExhausted { .. } => Some(ReasonCode::BudgetExhausted),
            Self::DeadlineExceeded { .. } => Some(ReasonCode::DeadlineExceeded),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Within => "within limits".to_string(),
            Self::BudgetExhausted { needed, remaining } => format!(
                "next layer needs {} budget unit(s) but only {} remain",
                needed, remaining
            ),
            Self::DeadlineExceeded { overrun } => {
                format!("deadline exceeded by {}ms", overrun.as_millis())
            }
        }
    }
}

/// Per-run budget and deadline accounting.
///
/// Owned by the scheduler driving a single run, so no synchronization is
/// needed. Budget is counted in abstract cost units.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    budget: u64,
    consumed: u64,
    started: Instant,
    deadline: Instant,
}

impl BudgetTracker {
    pub fn new(budget: u64, deadline: Instant) -> Self {
        Self {
            budget,
            consumed: 0,
            started: Instant::now(),
            deadline,
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.consumed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Deadline is checked before budget: a late run is late regardless of cost.
    pub fn check(&self, next_cost: u64) -> LimitCheck {
        let now = Instant::now();
        if now >= self.deadline {
            return LimitCheck::DeadlineExceeded {
                overrun: now.saturating_duration_since(self.deadline),
            };
        }
        if next_cost > self.remaining() {
            return LimitCheck::BudgetExhausted {
                needed: next_cost,
                remaining: self.remaining(),
            };
        }
        LimitCheck::Within
    }

    pub fn charge(&mut self, units: u64) {
        self.consumed = self.consumed.saturating_add(units);
        debug!(
            "Charged {} unit(s), consumed {}/{}",
            units, self.consumed, self.budget
        );
    }
}
