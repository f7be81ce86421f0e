//! Parameter update logic
//!
//! The updater is the only domain-specific piece of a parameter server.
//! Everything else routes, queues and transports opaque keys and values.

use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Add;

/// Defines default values and how pushed preValues are merged into values.
///
/// Implementations must be pure and deterministic: the server calls them from
/// several partition threads at once, and the same inputs must always give
/// the same outputs.
pub trait ParameterUpdater: Send + Sync + 'static {
    /// Parameter key
    type Key: Eq + Hash + Clone + Send + 'static;

    /// Payload pushed by workers, before processing
    type PreValue: Send + 'static;

    /// Result of processing a preValue, merged into the stored value
    type Delta;

    /// Stored parameter value, returned on pull
    type Value: Clone + Send + 'static;

    /// Value of a key that has never been pushed to
    fn init_value(&self, key: &Self::Key) -> Self::Value;

    /// Turn a pushed preValue into a delta
    fn process(&self, key: &Self::Key, pre_value: Self::PreValue) -> Self::Delta;

    /// Merge `delta` into `old_value`
    fn update(&self, old_value: Self::Value, delta: Self::Delta) -> Self::Value;
}

/// Sums pushed values, starting from `T::default()`
pub struct AddUpdater<K, T> {
    _phantom: PhantomData<fn() -> (K, T)>,
}

impl<K, T> AddUpdater<K, T> {
    /// Create an additive updater
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<K, T> Default for AddUpdater<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> ParameterUpdater for AddUpdater<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Add<Output = T> + Default + Clone + Send + 'static,
{
    type Key = K;
    type PreValue = T;
    type Delta = T;
    type Value = T;

    fn init_value(&self, _key: &K) -> T {
        T::default()
    }

    fn process(&self, _key: &K, pre_value: T) -> T {
        pre_value
    }

    fn update(&self, old_value: T, delta: T) -> T {
        old_value + delta
    }
}

/// Plain gradient descent on dense `f64` vectors.
///
/// Workers push gradients; the stored value is the parameter vector. A
/// gradient whose length differs from the parameter vector only updates the
/// overlapping prefix.
#[derive(Debug, Clone)]
pub struct SgdUpdater<K> {
    dimension: usize,
    learning_rate: f64,
    _phantom: PhantomData<fn() -> K>,
}

impl<K> SgdUpdater<K> {
    /// Parameters of `dimension` zeros, updated with `learning_rate`
    pub fn new(dimension: usize, learning_rate: f64) -> Self {
        Self {
            dimension,
            learning_rate,
            _phantom: PhantomData,
        }
    }
}

impl<K> ParameterUpdater for SgdUpdater<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    type Key = K;
    type PreValue = Vec<f64>;
    type Delta = Vec<f64>;
    type Value = Vec<f64>;

    fn init_value(&self, _key: &K) -> Vec<f64> {
        vec![0.0; self.dimension]
    }

    fn process(&self, _key: &K, gradient: Vec<f64>) -> Vec<f64> {
        gradient.into_iter().map(|g| g * self.learning_rate).collect()
    }

    fn update(&self, mut params: Vec<f64>, step: Vec<f64>) -> Vec<f64> {
        for (p, s) in params.iter_mut().zip(step) {
            *p -= s;
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_updater() {
        let updater = AddUpdater::<i32, i64>::new();
        let delta = updater.process(&1, 5);
        assert_eq!(updater.init_value(&1), 0);
        assert_eq!(updater.update(updater.init_value(&1), delta), 5);
    }

    #[test]
    fn test_sgd_updater() {
        let updater = SgdUpdater::<String>::new(3, 0.5);
        let key = "w".to_string();
        let start = updater.init_value(&key);
        assert_eq!(start, vec![0.0; 3]);

        let step = updater.process(&key, vec![2.0, -4.0, 1.0]);
        assert_eq!(updater.update(start, step), vec![-1.0, 2.0, -0.5]);
    }

    #[test]
    fn test_sgd_short_gradient_updates_prefix() {
        let updater = SgdUpdater::<u32>::new(3, 1.0);
        let step = updater.process(&0, vec![1.0]);
        assert_eq!(updater.update(vec![1.0, 1.0, 1.0], step), vec![0.0, 1.0, 1.0]);
    }
}
