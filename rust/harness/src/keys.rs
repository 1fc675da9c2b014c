//! Unique identifiers for models and searches of one run.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Source of per-name instance numbers. The built-in one starts at 1.
pub trait InstanceCounter: std::fmt::Debug + Send + Sync {
    fn next(&self, name: &str) -> u32;
}

/// Mutex-guarded counter map.
#[derive(Debug, Default)]
pub struct CounterMap {
    counts: Mutex<HashMap<String, u32>>,
}

impl InstanceCounter for CounterMap {
    fn next(&self, name: &str) -> u32 {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let n = counts.entry(name.to_string()).or_insert(0);
        *n += 1;
        *n
    }
}

/// Key generator for one run. All keys carry the run stamp.
pub struct RunKeys {
    stamp: String,
    models: Arc<dyn InstanceCounter>,
    grids: Arc<dyn InstanceCounter>,
}

impl RunKeys {
    #[must_use]
    pub fn new(stamp: impl Into<String>) -> Self {
        Self::with_counters(
            stamp,
            Arc::new(CounterMap::default()),
            Arc::new(CounterMap::default()),
        )
    }

    #[must_use]
    pub fn with_counters(
        stamp: impl Into<String>,
        models: Arc<dyn InstanceCounter>,
        grids: Arc<dyn InstanceCounter>,
    ) -> Self {
        Self {
            stamp: stamp.into(),
            models,
            grids,
        }
    }

    #[must_use]
    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// `<name>_<n>_AutoML_<stamp>`
    pub fn model_key(&self, name: &str) -> String {
        let n = self.models.next(name);
        format!("{name}_{n}_AutoML_{}", self.stamp)
    }

    /// `<name>_grid_<n>_AutoML_<stamp>`
    pub fn grid_key(&self, name: &str) -> String {
        let n = self.grids.next(name);
        format!("{name}_grid_{n}_AutoML_{}", self.stamp)
    }

    /// `<name>_AutoML_<stamp>`, no counter.
    #[must_use]
    pub fn unique_key(&self, name: &str) -> String {
        format!("{name}_AutoML_{}", self.stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_name() {
        let keys = RunKeys::new("20240517_100000");
        assert_eq!(keys.model_key("GBM"), "GBM_1_AutoML_20240517_100000");
        assert_eq!(keys.model_key("GBM"), "GBM_2_AutoML_20240517_100000");
        assert_eq!(keys.model_key("DRF"), "DRF_1_AutoML_20240517_100000");
        assert_eq!(keys.grid_key("GBM"), "GBM_grid_1_AutoML_20240517_100000");
        assert_eq!(
            keys.unique_key("StackedEnsemble_AllModels"),
            "StackedEnsemble_AllModels_AutoML_20240517_100000"
        );
    }

    #[test]
    fn test_injected_counters_number_keys() {
        #[derive(Debug)]
        struct StartAt(u32, CounterMap);
        impl InstanceCounter for StartAt {
            fn next(&self, name: &str) -> u32 {
                self.0 + self.1.next(name) - 1
            }
        }

        let keys = RunKeys::with_counters(
            "20240517_100000",
            Arc::new(StartAt(7, CounterMap::default())),
            Arc::new(CounterMap::default()),
        );
        assert_eq!(keys.model_key("GBM"), "GBM_7_AutoML_20240517_100000");
        assert_eq!(keys.model_key("GBM"), "GBM_8_AutoML_20240517_100000");
        assert_eq!(keys.grid_key("GBM"), "GBM_grid_1_AutoML_20240517_100000");
    }

    #[test]
    fn test_counter_map_is_thread_safe() {
        let counter = Arc::new(CounterMap::default());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    (0..100).map(|_| counter.next("x")).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u32> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=800).collect::<Vec<_>>());
    }
}
