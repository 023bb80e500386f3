//! Store counters.
//!
//! Counters are owned by the store and exported through a caller-supplied
//! [`prometheus::Registry`]; the store never touches a global registry.

use prometheus::{IntCounter, Opts, Registry};

/// Operation counters for one store.
#[derive(Debug, Clone)]
pub struct StoreMetrics {
    gets: IntCounter,
    transactions: IntCounter,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self {
            gets: counter("kinetic_get", "Point lookups issued to the device"),
            transactions: counter(
                "kinetic_transaction",
                "Transactions committed to the device",
            ),
        }
    }

    /// Registers both counters with `registry`.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.gets.clone()))?;
        registry.register(Box::new(self.transactions.clone()))?;
        Ok(())
    }

    pub fn gets(&self) -> u64 {
        self.gets.get()
    }

    pub fn transactions(&self) -> u64 {
        self.transactions.get()
    }

    pub(crate) fn record_get(&self) {
        self.gets.inc();
    }

    pub(crate) fn record_transaction(&self) {
        self.transactions.inc();
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// Name and help are static and valid, so construction cannot fail.
fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("static counter options are valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_exposes_both_counters() {
        let metrics = StoreMetrics::new();
        metrics.record_get();
        metrics.record_get();
        metrics.record_transaction();

        let registry = Registry::new();
        metrics.register(&registry).unwrap();

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.name().to_string()).collect();
        assert!(names.contains(&"kinetic_get".to_string()));
        assert!(names.contains(&"kinetic_transaction".to_string()));
        assert_eq!(metrics.gets(), 2);
        assert_eq!(metrics.transactions(), 1);
    }

    #[test]
    fn double_registration_fails() {
        let metrics = StoreMetrics::new();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }
}
