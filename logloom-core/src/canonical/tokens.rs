//! Token estimation and budget allocation

use std::collections::HashMap;

/// Cheap token estimator: ~4 characters per token. Good enough for
/// budget accounting; the narratives go to models whose tokenizers we
/// do not want to link in here.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn new() -> Self {
        Self
    }

    pub fn estimate(&self, text: &str) -> i64 {
        (text.chars().count() as i64 + 3) / 4
    }
}

/// Splits one token budget into named shares.
#[derive(Debug)]
pub struct BudgetAllocator {
    total: i64,
    allocations: HashMap<String, i64>,
}

impl BudgetAllocator {
    pub fn new(total: i64) -> Self {
        Self {
            total,
            allocations: HashMap::new(),
        }
    }

    /// Allocate `fraction` of the total to `name`.
    pub fn allocate(&mut self, name: &str, fraction: f64) {
        let share = (self.total as f64 * fraction) as i64;
        self.allocations.insert(name.to_string(), share);
    }

    /// Tokens allocated to `name` (0 if never allocated).
    pub fn share(&self, name: &str) -> i64 {
        self.allocations.get(name).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_up() {
        let estimator = TokenEstimator::new();
        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(estimator.estimate("abc"), 1);
        assert_eq!(estimator.estimate("abcd"), 1);
        assert_eq!(estimator.estimate("abcde"), 2);
    }

    #[test]
    fn test_allocation_shares() {
        let mut allocator = BudgetAllocator::new(8000);
        allocator.allocate("metadata", 0.10);
        allocator.allocate("children", 0.30);
        allocator.allocate("main_messages", 0.60);

        assert_eq!(allocator.share("metadata"), 800);
        assert_eq!(allocator.share("children"), 2400);
        assert_eq!(allocator.share("main_messages"), 4800);
        assert_eq!(allocator.share("unknown"), 0);
    }
}
