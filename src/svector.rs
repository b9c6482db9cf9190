//! Module implement the sorted-on-insert vector.
//!
//! [SVector] is the workhorse collection of the hierarchy. With a
//! comparator it keeps its elements sorted and answers lookups with a
//! binary search; without one it behaves as a plain append-only stack
//! with dense index access. These vectors stay small and their mutation
//! cost is dominated by traversal I/O.

use std::cmp::Ordering;

use crate::Result;

/// Sorted-on-insert vector of values.
#[derive(Clone)]
pub struct SVector<T> {
    compar: Option<fn(&T, &T) -> Ordering>,
    data: Vec<T>,
}

impl<T> Default for SVector<T> {
    fn default() -> SVector<T> {
        SVector { compar: None, data: Vec::new() }
    }
}

impl<T> SVector<T> {
    /// Create a vector with an initial capacity and an optional
    /// comparator. A comparator turns the vector into a sorted set-like
    /// sequence.
    pub fn new(initial_cap: usize, compar: Option<fn(&T, &T) -> Ordering>) -> SVector<T> {
        SVector { compar, data: Vec::with_capacity(initial_cap) }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Insert a value keeping the sort order; without a comparator this
    /// is an append.
    pub fn insert(&mut self, value: T) {
        match self.compar {
            Some(compar) => {
                let pos = match self.data.binary_search_by(|x| compar(x, &value)) {
                    Ok(pos) => pos,
                    Err(pos) => pos,
                };
                self.data.insert(pos, value);
            }
            None => self.data.push(value),
        }
    }

    /// Insert skipping duplicates. Only meaningful with a comparator.
    pub fn insert_fast(&mut self, value: T) -> Result<()> {
        let compar = match self.compar {
            Some(compar) => compar,
            None => return err_at!(NotSupported, msg: "insert_fast without comparator"),
        };
        match self.data.binary_search_by(|x| compar(x, &value)) {
            Ok(_) => err_at!(Exists, msg: "duplicate element"),
            Err(pos) => {
                self.data.insert(pos, value);
                Ok(())
            }
        }
    }

    /// Binary search for `key`. Only meaningful with a comparator.
    pub fn search(&self, key: &T) -> Option<&T> {
        let compar = self.compar?;
        match self.data.binary_search_by(|x| compar(x, key)) {
            Ok(pos) => self.data.get(pos),
            Err(_) => None,
        }
    }

    pub fn contains(&self, key: &T) -> bool {
        match self.compar {
            Some(_) => self.search(key).is_some(),
            None => false,
        }
    }

    /// Remove `key` from a sorted vector.
    pub fn remove(&mut self, key: &T) -> Option<T> {
        let compar = self.compar?;
        match self.data.binary_search_by(|x| compar(x, key)) {
            Ok(pos) => Some(self.data.remove(pos)),
            Err(_) => None,
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        self.data.pop()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.data.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.data.get_mut(index)
    }

    /// Overwrite the value at `index`, returning the previous value.
    pub fn set(&mut self, index: usize, value: T) -> Result<T> {
        if index >= self.data.len() {
            return err_at!(InvalidInput, msg: "index {} out of {}", index, self.data.len());
        }
        Ok(std::mem::replace(&mut self.data[index], value))
    }

    pub fn insert_index(&mut self, index: usize, value: T) -> Result<()> {
        if index > self.data.len() {
            return err_at!(InvalidInput, msg: "index {} out of {}", index, self.data.len());
        }
        self.data.insert(index, value);
        Ok(())
    }

    pub fn remove_index(&mut self, index: usize) -> Result<T> {
        if index >= self.data.len() {
            return err_at!(InvalidInput, msg: "index {} out of {}", index, self.data.len());
        }
        Ok(self.data.remove(index))
    }

    pub fn iter(&self) -> std::slice::Iter<T> {
        self.data.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<T> {
        self.data.iter_mut()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.data.clone()
    }
}

impl<'a, T> IntoIterator for &'a SVector<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.data.iter()
    }
}

impl<T> std::fmt::Debug for SVector<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.data)
    }
}

#[cfg(test)]
#[path = "svector_test.rs"]
mod svector_test;
