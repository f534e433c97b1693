//! Single-writer cache cells with equality-gated invalidation.
//!
//! Functionals that precompute geometry (distance grids, barrier
//! constraint sets) keep one of these per instance.  The cell remembers the
//! key it was last built for and only rebuilds when the key changes.

use crate::types::Result;

#[derive(Debug, Clone)]
pub struct EqualityGated<K, V> {
    key: Option<K>,
    value: Option<V>,
    rebuilds: usize,
}

impl<K, V> Default for EqualityGated<K, V> {
    fn default() -> Self {
        Self {
            key: None,
            value: None,
            rebuilds: 0,
        }
    }
}

impl<K: PartialEq + Clone, V> EqualityGated<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild with `build` unless the cell already holds a value for `key`.
    ///
    /// Returns whether a rebuild happened.  A failed build leaves the cell
    /// empty so the next call retries.
    pub fn refresh<F>(&mut self, key: &K, build: F) -> Result<bool>
    where
        F: FnOnce(&K) -> Result<V>,
    {
        if self.value.is_some() && self.key.as_ref() == Some(key) {
            return Ok(false);
        }
        self.invalidate();
        let value = build(key)?;
        self.key = Some(key.clone());
        self.value = Some(value);
        self.rebuilds += 1;
        Ok(true)
    }

    pub fn get(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// In-place growth of a built value (lazy grids add cells this way).
    pub fn get_mut(&mut self) -> Option<&mut V> {
        self.value.as_mut()
    }

    /// Number of successful builds so far.
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }

    pub fn invalidate(&mut self) {
        self.key = None;
        self.value = None;
    }
}
