//! Consecutive-failure budget for automated code retries.

/// Consecutive all-failed code turns tolerated before asking the user for help.
pub const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;

/// Counts code turns in a row where no block succeeded.
///
/// The budget is exhausted once the count *exceeds* the limit, so with the
/// default limit the model gets four failed attempts before the user is asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureBudget {
    consecutive: u32,
    limit: u32,
}

impl Default for FailureBudget {
    fn default() -> Self {
        Self::new(CONSECUTIVE_FAILURE_LIMIT)
    }
}

impl FailureBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn is_exhausted(&self) -> bool {
        self.consecutive > self.limit
    }

    pub fn record_failure(&mut self) {
        self.consecutive += 1;
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}
