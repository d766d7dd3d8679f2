//! Manager-wide configuration.

use crate::session::Filter;
use crate::transaction::{ErrorPolicy, ExistingTxnPolicy};

/// Configuration shared by every scope a manager opens.
#[derive(Debug, Clone)]
pub struct Config {
    /// Policy used when neither a running transactional function nor the
    /// scope itself sets one.
    pub error_policy: ErrorPolicy,
    /// What a root scope does with a transaction it did not begin.
    pub existing_txn_policy: ExistingTxnPolicy,
    /// Whether scopes join an ambient root unless told otherwise.
    pub join: bool,
    /// Filters applied to CRUD queries on every model declaring the column.
    pub global_filters: Vec<Filter>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::Raise,
            existing_txn_policy: ExistingTxnPolicy::Error,
            join: true,
            global_filters: Vec::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn existing_txn_policy(mut self, policy: ExistingTxnPolicy) -> Self {
        self.existing_txn_policy = policy;
        self
    }

    pub fn join(mut self, join: bool) -> Self {
        self.join = join;
        self
    }

    /// Add a global filter.
    pub fn global_filter(mut self, filter: Filter) -> Self {
        self.global_filters.push(filter);
        self
    }
}
