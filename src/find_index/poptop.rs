//! Top-K selector with a moving cut limit.
//!
//! Tracks `(score, payload)` entries and, on every maintenance sweep,
//! keeps roughly the better half up to the configured size; everything
//! below the new cut limit is dropped and handed back to the caller.

/// The selector.
pub struct PopTop {
    max: usize,
    cut: f32,
    list: Vec<(f32, Vec<u8>)>,
}

impl PopTop {
    pub fn new(max: usize) -> PopTop {
        PopTop { max: max.max(1), cut: 0.0, list: vec![] }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn cut_limit(&self) -> f32 {
        self.cut
    }

    /// Add or re-score an entry unconditionally.
    pub fn insert(&mut self, score: f32, payload: &[u8]) {
        if let Some(el) = self.list.iter_mut().find(|(_, p)| p.as_slice() == payload) {
            el.0 = score;
        } else {
            self.list.push((score, payload.to_vec()));
        }
    }

    /// Add or re-score an entry; entries under the current cut limit are
    /// not admitted.
    pub fn maybe_add(&mut self, score: f32, payload: &[u8]) -> bool {
        if let Some(el) = self.list.iter_mut().find(|(_, p)| p.as_slice() == payload) {
            el.0 = score;
            return true;
        }
        if score >= self.cut {
            self.list.push((score, payload.to_vec()));
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, payload: &[u8]) {
        self.list.retain(|(_, p)| p.as_slice() != payload);
    }

    pub fn contains(&self, payload: &[u8]) -> bool {
        self.list.iter().any(|(_, p)| p.as_slice() == payload)
    }

    /// Maintenance sweep: keep the better half, bounded by the size
    /// limit, raise the cut to the weakest kept score and return the
    /// dropped payloads.
    pub fn maintenance(&mut self) -> Vec<Vec<u8>> {
        if self.list.is_empty() {
            return vec![];
        }
        self.list.sort_by(|a, b| b.0.total_cmp(&a.0));
        let keep = ((self.list.len() + 1) / 2).min(self.max);
        let dropped: Vec<Vec<u8>> =
            self.list.split_off(keep).into_iter().map(|(_, p)| p).collect();
        self.cut = self.list.last().map(|(s, _)| *s).unwrap_or(0.0);
        dropped
    }

    /// Current entries, best first after a maintenance sweep.
    pub fn iter(&self) -> impl Iterator<Item = (f32, &[u8])> {
        self.list.iter().map(|(s, p)| (*s, p.as_slice()))
    }
}

#[cfg(test)]
#[path = "poptop_test.rs"]
mod poptop_test;
