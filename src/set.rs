//! Module implement the typed set.
//!
//! A [SelvaSet] is a sum type over four ordered sets, one per element
//! type. The element type is fixed when the set is created and every
//! operation against the wrong type fails with `TypeMismatch`, except
//! `has` which answers false.

use std::{cmp::Ordering, collections::BTreeSet, fmt};

use crate::{sstring::SelvaString, types::NodeId, Result};

/// Element type of a [SelvaSet].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SetType {
    Str = 0,
    Double = 1,
    LongLong = 2,
    NodeId = 3,
}

impl SetType {
    pub fn from_u8(v: u8) -> Result<SetType> {
        match v {
            0 => Ok(SetType::Str),
            1 => Ok(SetType::Double),
            2 => Ok(SetType::LongLong),
            3 => Ok(SetType::NodeId),
            _ => err_at!(TypeMismatch, msg: "set type {}", v),
        }
    }
}

/// f64 wrapper with total ordering, NaN is rejected before it can enter
/// a set.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct TotalF64(pub f64);

impl Eq for TotalF64 {}

impl PartialOrd for TotalF64 {
    fn partial_cmp(&self, other: &TotalF64) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF64 {
    fn cmp(&self, other: &TotalF64) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Typed set over interned strings, doubles, 64-bit integers or node
/// ids.
#[derive(Clone, PartialEq)]
pub enum SelvaSet {
    Str(BTreeSet<SelvaString>),
    Double(BTreeSet<TotalF64>),
    LongLong(BTreeSet<i64>),
    NodeId(BTreeSet<NodeId>),
}

/// Borrowed view of one set element, yielded by [SelvaSet::iter].
#[derive(Clone, Copy, Debug)]
pub enum SetValue<'a> {
    Str(&'a SelvaString),
    Double(f64),
    LongLong(i64),
    NodeId(&'a NodeId),
}

impl SelvaSet {
    pub fn new(t: SetType) -> SelvaSet {
        match t {
            SetType::Str => SelvaSet::Str(BTreeSet::new()),
            SetType::Double => SelvaSet::Double(BTreeSet::new()),
            SetType::LongLong => SelvaSet::LongLong(BTreeSet::new()),
            SetType::NodeId => SelvaSet::NodeId(BTreeSet::new()),
        }
    }

    pub fn set_type(&self) -> SetType {
        match self {
            SelvaSet::Str(_) => SetType::Str,
            SelvaSet::Double(_) => SetType::Double,
            SelvaSet::LongLong(_) => SetType::LongLong,
            SelvaSet::NodeId(_) => SetType::NodeId,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            SelvaSet::Str(s) => s.len(),
            SelvaSet::Double(s) => s.len(),
            SelvaSet::LongLong(s) => s.len(),
            SelvaSet::NodeId(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn add_str(&mut self, value: SelvaString) -> Result<()> {
        match self {
            SelvaSet::Str(s) if s.contains(&value) => err_at!(Exists, msg: "{:?}", value),
            SelvaSet::Str(s) => {
                s.insert(value);
                Ok(())
            }
            _ => err_at!(TypeMismatch, msg: "string into {:?} set", self.set_type()),
        }
    }

    pub fn add_double(&mut self, value: f64) -> Result<()> {
        if value.is_nan() {
            return err_at!(InvalidInput, msg: "NaN");
        }
        match self {
            SelvaSet::Double(s) if s.contains(&TotalF64(value)) => {
                err_at!(Exists, msg: "{}", value)
            }
            SelvaSet::Double(s) => {
                s.insert(TotalF64(value));
                Ok(())
            }
            _ => err_at!(TypeMismatch, msg: "double into {:?} set", self.set_type()),
        }
    }

    pub fn add_long_long(&mut self, value: i64) -> Result<()> {
        match self {
            SelvaSet::LongLong(s) if s.contains(&value) => err_at!(Exists, msg: "{}", value),
            SelvaSet::LongLong(s) => {
                s.insert(value);
                Ok(())
            }
            _ => err_at!(TypeMismatch, msg: "long long into {:?} set", self.set_type()),
        }
    }

    pub fn add_node_id(&mut self, value: NodeId) -> Result<()> {
        match self {
            SelvaSet::NodeId(s) if s.contains(&value) => err_at!(Exists, msg: "{}", value),
            SelvaSet::NodeId(s) => {
                s.insert(value);
                Ok(())
            }
            _ => err_at!(TypeMismatch, msg: "node id into {:?} set", self.set_type()),
        }
    }

    pub fn has_str(&self, value: &SelvaString) -> bool {
        match self {
            SelvaSet::Str(s) => s.contains(value),
            _ => false,
        }
    }

    pub fn has_double(&self, value: f64) -> bool {
        match self {
            SelvaSet::Double(s) => s.contains(&TotalF64(value)),
            _ => false,
        }
    }

    pub fn has_long_long(&self, value: i64) -> bool {
        match self {
            SelvaSet::LongLong(s) => s.contains(&value),
            _ => false,
        }
    }

    pub fn has_node_id(&self, value: &NodeId) -> bool {
        match self {
            SelvaSet::NodeId(s) => s.contains(value),
            _ => false,
        }
    }

    /// Look for a string equal to `value` in the set.
    pub fn find_str(&self, value: &SelvaString) -> Option<&SelvaString> {
        match self {
            SelvaSet::Str(s) => s.get(value),
            _ => None,
        }
    }

    pub fn remove_str(&mut self, value: &SelvaString) -> Option<SelvaString> {
        match self {
            SelvaSet::Str(s) => s.take(value),
            _ => None,
        }
    }

    pub fn remove_double(&mut self, value: f64) -> Option<f64> {
        match self {
            SelvaSet::Double(s) => s.take(&TotalF64(value)).map(|v| v.0),
            _ => None,
        }
    }

    pub fn remove_long_long(&mut self, value: i64) -> Option<i64> {
        match self {
            SelvaSet::LongLong(s) => s.take(&value),
            _ => None,
        }
    }

    pub fn remove_node_id(&mut self, value: &NodeId) -> Option<NodeId> {
        match self {
            SelvaSet::NodeId(s) => s.take(value),
            _ => None,
        }
    }

    /// Iterate the elements in their set order.
    pub fn iter(&self) -> impl Iterator<Item = SetValue> {
        let values: Vec<SetValue> = match self {
            SelvaSet::Str(s) => s.iter().map(SetValue::Str).collect(),
            SelvaSet::Double(s) => s.iter().map(|v| SetValue::Double(v.0)).collect(),
            SelvaSet::LongLong(s) => s.iter().map(|v| SetValue::LongLong(*v)).collect(),
            SelvaSet::NodeId(s) => s.iter().map(SetValue::NodeId).collect(),
        };
        values.into_iter()
    }

    /// Node ids of a node-id set.
    pub fn node_ids(&self) -> Vec<NodeId> {
        match self {
            SelvaSet::NodeId(s) => s.iter().cloned().collect(),
            _ => vec![],
        }
    }

    /// Move elements from `src` into `self`. Only elements missing from
    /// `self` are moved, duplicates stay in `src`.
    pub fn merge(&mut self, src: &mut SelvaSet) -> Result<()> {
        if self.set_type() != src.set_type() {
            return err_at!(
                TypeMismatch, msg: "merge {:?} into {:?}", src.set_type(), self.set_type()
            );
        }
        match (self, src) {
            (SelvaSet::Str(dst), SelvaSet::Str(src)) => {
                let moved: Vec<SelvaString> =
                    src.iter().filter(|v| !dst.contains(*v)).cloned().collect();
                for v in moved {
                    src.remove(&v);
                    dst.insert(v);
                }
            }
            (SelvaSet::Double(dst), SelvaSet::Double(src)) => {
                let moved: Vec<TotalF64> =
                    src.iter().filter(|v| !dst.contains(*v)).cloned().collect();
                for v in moved {
                    src.remove(&v);
                    dst.insert(v);
                }
            }
            (SelvaSet::LongLong(dst), SelvaSet::LongLong(src)) => {
                let moved: Vec<i64> = src.iter().filter(|v| !dst.contains(*v)).cloned().collect();
                for v in moved {
                    src.remove(&v);
                    dst.insert(v);
                }
            }
            (SelvaSet::NodeId(dst), SelvaSet::NodeId(src)) => {
                let moved: Vec<NodeId> =
                    src.iter().filter(|v| !dst.contains(*v)).cloned().collect();
                for v in moved {
                    src.remove(&v);
                    dst.insert(v);
                }
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Union of the given sets, cloned into `res`.
    pub fn union_into(res: &mut SelvaSet, sets: &[&SelvaSet]) -> Result<()> {
        for set in sets {
            if set.set_type() != res.set_type() {
                return err_at!(
                    TypeMismatch, msg: "union {:?} into {:?}", set.set_type(), res.set_type()
                );
            }
            match (&mut *res, set) {
                (SelvaSet::Str(dst), SelvaSet::Str(src)) => {
                    dst.extend(src.iter().cloned());
                }
                (SelvaSet::Double(dst), SelvaSet::Double(src)) => {
                    dst.extend(src.iter().cloned());
                }
                (SelvaSet::LongLong(dst), SelvaSet::LongLong(src)) => {
                    dst.extend(src.iter().cloned());
                }
                (SelvaSet::NodeId(dst), SelvaSet::NodeId(src)) => {
                    dst.extend(src.iter().cloned());
                }
                _ => unreachable!(),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SelvaSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SelvaSet::Str(s) => write!(f, "SelvaSet::Str({:?})", s),
            SelvaSet::Double(s) => write!(f, "SelvaSet::Double({:?})", s),
            SelvaSet::LongLong(s) => write!(f, "SelvaSet::LongLong({:?})", s),
            SelvaSet::NodeId(s) => write!(f, "SelvaSet::NodeId({:?})", s),
        }
    }
}

#[cfg(test)]
#[path = "set_test.rs"]
mod set_test;
