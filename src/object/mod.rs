//! Module implement the typed dynamic object.
//!
//! A [SelvaObject] maps short key names to tagged values; keys are
//! addressable with dotted paths, `a.b.c`, where a path segment can carry
//! a trailing array index, `name[i]`, and negative indices count from the
//! end. The first few keys of every object live inline in the object
//! header to keep allocator traffic down, the rest spill to the heap.

use tinyvec::TinyVec;

use std::{any::Any, fmt, rc::Rc};

use crate::{
    object::hll::HyperLogLog,
    set::{SelvaSet, SetType},
    sstring::SelvaString,
    types::NodeId,
    Result,
};

pub mod hll;

/// SelvaObject user meta values.
pub const META_SUBTYPE_OBJECT: u32 = 0;
pub const META_SUBTYPE_RECORD: u32 = 1;
pub const META_SUBTYPE_TEXT: u32 = 2;
pub const META_SUBTYPE_TIMESERIES: u32 = 3;

/// Longest accepted key name.
pub const KEY_NAME_MAX: usize = 0xffff;

/// Number of keys stored inline in the object header.
const INLINE_KEYS: usize = 4;

/// Object key types. The numbers are used in the serialization format,
/// do not reorder.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueType {
    Null = 0,
    Double = 1,
    LongLong = 2,
    Str = 3,
    Object = 4,
    Set = 5,
    Array = 6,
    Pointer = 7,
    Hll = 8,
}

impl ValueType {
    pub fn from_u8(v: u8) -> Result<ValueType> {
        match v {
            0 => Ok(ValueType::Null),
            1 => Ok(ValueType::Double),
            2 => Ok(ValueType::LongLong),
            3 => Ok(ValueType::Str),
            4 => Ok(ValueType::Object),
            5 => Ok(ValueType::Set),
            6 => Ok(ValueType::Array),
            7 => Ok(ValueType::Pointer),
            8 => Ok(ValueType::Hll),
            _ => err_at!(TypeMismatch, msg: "object value type {}", v),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Double => "double",
            ValueType::LongLong => "long long",
            ValueType::Str => "string",
            ValueType::Object => "object",
            ValueType::Set => "selva_set",
            ValueType::Array => "array",
            ValueType::Pointer => "pointer",
            ValueType::Hll => "hll",
        }
    }
}

/// Opaque external reference stored in an object. Freeing is the Drop
/// of the shared value; serialization happens only for pointer types
/// with a registered save/load pair, of which there are none here.
#[derive(Clone)]
pub struct SelvaPointer {
    /// Type id for serialization; zero means the pointer is never
    /// serialized.
    pub type_id: u32,
    pub value: Rc<dyn Any>,
    /// Optional length hook, item count or byte size of the value.
    pub len_cb: Option<fn(&Rc<dyn Any>) -> usize>,
    /// Optional reply hook rendering the value for the client.
    pub reply_cb: Option<fn(&Rc<dyn Any>) -> crate::proto::Value>,
}

impl SelvaPointer {
    pub fn new(type_id: u32, value: Rc<dyn Any>) -> SelvaPointer {
        SelvaPointer { type_id, value, len_cb: None, reply_cb: None }
    }

    pub fn len(&self) -> usize {
        match self.len_cb {
            Some(cb) => cb(&self.value),
            None => 0,
        }
    }

    /// Reply value of the pointer; null without a reply hook.
    pub fn reply(&self) -> crate::proto::Value {
        match self.reply_cb {
            Some(cb) => cb(&self.value),
            None => crate::proto::Value::Null,
        }
    }
}

impl PartialEq for SelvaPointer {
    fn eq(&self, other: &SelvaPointer) -> bool {
        self.type_id == other.type_id && Rc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for SelvaPointer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SelvaPointer(type_id:{})", self.type_id)
    }
}

/// One array element, used when inserting into array fields.
#[derive(Clone, Debug)]
pub enum ArrayItem {
    Double(f64),
    LongLong(i64),
    Str(SelvaString),
    Object(SelvaObject),
    Hll(HyperLogLog),
    Pointer(SelvaPointer),
}

impl ArrayItem {
    pub fn subtype(&self) -> ValueType {
        match self {
            ArrayItem::Double(_) => ValueType::Double,
            ArrayItem::LongLong(_) => ValueType::LongLong,
            ArrayItem::Str(_) => ValueType::Str,
            ArrayItem::Object(_) => ValueType::Object,
            ArrayItem::Hll(_) => ValueType::Hll,
            ArrayItem::Pointer(_) => ValueType::Pointer,
        }
    }
}

/// Array storage; the sub-type is fixed once chosen.
#[derive(Clone, Debug)]
pub enum ObjArray {
    Double(Vec<f64>),
    LongLong(Vec<i64>),
    Str(Vec<SelvaString>),
    Object(Vec<SelvaObject>),
    Hll(Vec<HyperLogLog>),
    Pointer(Vec<SelvaPointer>),
}

impl ObjArray {
    fn new(subtype: ValueType) -> Result<ObjArray> {
        match subtype {
            ValueType::Double => Ok(ObjArray::Double(vec![])),
            ValueType::LongLong => Ok(ObjArray::LongLong(vec![])),
            ValueType::Str => Ok(ObjArray::Str(vec![])),
            ValueType::Object => Ok(ObjArray::Object(vec![])),
            ValueType::Hll => Ok(ObjArray::Hll(vec![])),
            ValueType::Pointer => Ok(ObjArray::Pointer(vec![])),
            _ => err_at!(TypeMismatch, msg: "array subtype {:?}", subtype),
        }
    }

    pub fn subtype(&self) -> ValueType {
        match self {
            ObjArray::Double(_) => ValueType::Double,
            ObjArray::LongLong(_) => ValueType::LongLong,
            ObjArray::Str(_) => ValueType::Str,
            ObjArray::Object(_) => ValueType::Object,
            ObjArray::Hll(_) => ValueType::Hll,
            ObjArray::Pointer(_) => ValueType::Pointer,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ObjArray::Double(v) => v.len(),
            ObjArray::LongLong(v) => v.len(),
            ObjArray::Str(v) => v.len(),
            ObjArray::Object(v) => v.len(),
            ObjArray::Hll(v) => v.len(),
            ObjArray::Pointer(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, item: ArrayItem) -> Result<()> {
        match (self, item) {
            (ObjArray::Double(v), ArrayItem::Double(x)) => v.push(x),
            (ObjArray::LongLong(v), ArrayItem::LongLong(x)) => v.push(x),
            (ObjArray::Str(v), ArrayItem::Str(x)) => v.push(x),
            (ObjArray::Object(v), ArrayItem::Object(x)) => v.push(x),
            (ObjArray::Hll(v), ArrayItem::Hll(x)) => v.push(x),
            (ObjArray::Pointer(v), ArrayItem::Pointer(x)) => v.push(x),
            (arr, item) => {
                return err_at!(
                    TypeMismatch, msg: "{:?} into {:?} array", item.subtype(), arr.subtype()
                )
            }
        }
        Ok(())
    }

    // Grow the array with default fill up to and including `index`.
    fn grow_to(&mut self, index: usize) -> Result<()> {
        if index < self.len() {
            return Ok(());
        }
        let n = index + 1;
        match self {
            ObjArray::Double(v) => v.resize(n, 0.0),
            ObjArray::LongLong(v) => v.resize(n, 0),
            ObjArray::Str(v) => v.resize(n, SelvaString::from_bytes(b"")),
            ObjArray::Object(v) => v.resize(n, SelvaObject::new()),
            ObjArray::Hll(v) => v.resize(n, HyperLogLog::new()),
            ObjArray::Pointer(_) => {
                return err_at!(NotSupported, msg: "no default fill for pointer arrays")
            }
        }
        Ok(())
    }

    fn assign(&mut self, index: usize, item: ArrayItem) -> Result<()> {
        self.grow_to(index)?;
        match (self, item) {
            (ObjArray::Double(v), ArrayItem::Double(x)) => v[index] = x,
            (ObjArray::LongLong(v), ArrayItem::LongLong(x)) => v[index] = x,
            (ObjArray::Str(v), ArrayItem::Str(x)) => v[index] = x,
            (ObjArray::Object(v), ArrayItem::Object(x)) => v[index] = x,
            (ObjArray::Hll(v), ArrayItem::Hll(x)) => v[index] = x,
            (ObjArray::Pointer(v), ArrayItem::Pointer(x)) => v[index] = x,
            (arr, item) => {
                return err_at!(
                    TypeMismatch, msg: "{:?} into {:?} array", item.subtype(), arr.subtype()
                )
            }
        }
        Ok(())
    }

    fn insert_at(&mut self, index: usize, item: ArrayItem) -> Result<()> {
        if index > self.len() {
            self.grow_to(index - 1)?;
        }
        match (self, item) {
            (ObjArray::Double(v), ArrayItem::Double(x)) => v.insert(index, x),
            (ObjArray::LongLong(v), ArrayItem::LongLong(x)) => v.insert(index, x),
            (ObjArray::Str(v), ArrayItem::Str(x)) => v.insert(index, x),
            (ObjArray::Object(v), ArrayItem::Object(x)) => v.insert(index, x),
            (ObjArray::Hll(v), ArrayItem::Hll(x)) => v.insert(index, x),
            (ObjArray::Pointer(v), ArrayItem::Pointer(x)) => v.insert(index, x),
            (arr, item) => {
                return err_at!(
                    TypeMismatch, msg: "{:?} into {:?} array", item.subtype(), arr.subtype()
                )
            }
        }
        Ok(())
    }

    fn remove_at(&mut self, index: usize) -> Result<()> {
        if index >= self.len() {
            return err_at!(InvalidInput, msg: "index {} out of {}", index, self.len());
        }
        match self {
            ObjArray::Double(v) => {
                v.remove(index);
            }
            ObjArray::LongLong(v) => {
                v.remove(index);
            }
            ObjArray::Str(v) => {
                v.remove(index);
            }
            ObjArray::Object(v) => {
                v.remove(index);
            }
            ObjArray::Hll(v) => {
                v.remove(index);
            }
            ObjArray::Pointer(v) => {
                v.remove(index);
            }
        }
        Ok(())
    }
}

/// A tagged object value.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Double(f64),
    LongLong(i64),
    Str(SelvaString),
    Object(Box<SelvaObject>),
    Set(SelvaSet),
    Array(ObjArray),
    Pointer(SelvaPointer),
    Hll(HyperLogLog),
}

impl Default for Value {
    fn default() -> Value {
        Value::Null
    }
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Double(_) => ValueType::Double,
            Value::LongLong(_) => ValueType::LongLong,
            Value::Str(_) => ValueType::Str,
            Value::Object(_) => ValueType::Object,
            Value::Set(_) => ValueType::Set,
            Value::Array(_) => ValueType::Array,
            Value::Pointer(_) => ValueType::Pointer,
            Value::Hll(_) => ValueType::Hll,
        }
    }
}

/// Borrowed view of a value, with array elements dereferenced.
#[derive(Clone, Copy, Debug)]
pub enum ValueView<'a> {
    Null,
    Double(f64),
    LongLong(i64),
    Str(&'a SelvaString),
    Object(&'a SelvaObject),
    Set(&'a SelvaSet),
    Array(&'a ObjArray),
    Pointer(&'a SelvaPointer),
    Hll(&'a HyperLogLog),
}

/// One `name => value` entry of an object, with the per-key user meta
/// tag.
#[derive(Clone, Debug, Default)]
pub struct ObjKey {
    name: String,
    meta: u32,
    value: Value,
}

impl ObjKey {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> u32 {
        self.meta
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }
}

/// The typed dynamic object.
#[derive(Clone, Debug, Default)]
pub struct SelvaObject {
    keys: TinyVec<[ObjKey; INLINE_KEYS]>, // sorted by name
}

// One parsed path segment.
#[derive(Clone, Copy, Debug)]
struct Seg<'a> {
    name: &'a str,
    index: Option<isize>,
}

fn parse_path(path: &str) -> Result<Vec<Seg>> {
    if path.is_empty() {
        return err_at!(InvalidInput, msg: "empty key name");
    }
    let mut segs = vec![];
    for part in path.split('.') {
        let (name, index) = match (part.find('['), part.ends_with(']')) {
            (Some(open), true) => {
                let idx_str = &part[open + 1..part.len() - 1];
                let index = err_at!(RangeError, idx_str.parse::<isize>(), "{:?}", part)?;
                (&part[..open], Some(index))
            }
            (None, false) => (part, None),
            _ => return err_at!(InvalidInput, msg: "malformed segment {:?}", part),
        };
        if name.is_empty() {
            return err_at!(InvalidInput, msg: "empty segment in {:?}", path);
        } else if name.len() > KEY_NAME_MAX {
            return err_at!(NameTooLong, msg: "{} bytes", name.len());
        }
        segs.push(Seg { name, index });
    }
    Ok(segs)
}

// Resolve a possibly negative index against `len`. Returns None when a
// negative index reaches before the first element.
fn norm_index(index: isize, len: usize) -> Option<usize> {
    if index < 0 {
        let i = len as isize + index;
        if i < 0 {
            None
        } else {
            Some(i as usize)
        }
    } else {
        Some(index as usize)
    }
}

impl SelvaObject {
    pub fn new() -> SelvaObject {
        SelvaObject { keys: TinyVec::new() }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate keys in name order.
    pub fn iter_keys(&self) -> impl Iterator<Item = &ObjKey> {
        self.keys.iter()
    }

    fn key_pos(&self, name: &str) -> std::result::Result<usize, usize> {
        self.keys.binary_search_by(|k| k.name.as_str().cmp(name))
    }

    pub(crate) fn get_key(&self, name: &str) -> Option<&ObjKey> {
        match self.key_pos(name) {
            Ok(pos) => self.keys.get(pos),
            Err(_) => None,
        }
    }

    // Insert or replace a key without path parsing; the snapshot loader
    // rebuilds objects through this.
    pub(crate) fn insert_key_raw(&mut self, name: String, meta: u32, value: Value) {
        match self.key_pos(&name) {
            Ok(pos) => self.keys[pos] = ObjKey { name, meta, value },
            Err(pos) => self.keys.insert(pos, ObjKey { name, meta, value }),
        }
    }

    // Walk all but the last segment, read-only.
    fn descend(&self, segs: &[Seg]) -> Option<(&ObjKey, Option<isize>)> {
        let mut obj = self;
        let last = segs.len() - 1;
        for (i, seg) in segs.iter().enumerate() {
            let key = obj.get_key(seg.name)?;
            if i == last {
                return Some((key, seg.index));
            }
            obj = match (&key.value, seg.index) {
                (Value::Object(o), None) => o,
                (Value::Array(ObjArray::Object(v)), Some(index)) => {
                    v.get(norm_index(index, v.len())?)?
                }
                _ => return None,
            };
        }
        unreachable!();
    }

    // Walk all but the last segment, creating intermediate objects (or
    // object arrays for indexed segments) when `create` is set. Returns
    // the final key and the optional trailing array index.
    fn descend_mut(
        &mut self,
        segs: &[Seg],
        create: bool,
    ) -> Result<(&mut ObjKey, Option<isize>)> {
        let last = segs.len() - 1;
        let mut obj: &mut SelvaObject = self;
        for seg in &segs[..last] {
            // move the reference before narrowing it, the borrow must
            // survive the loop iteration
            let cur = obj;
            let pos = match cur.key_pos(seg.name) {
                Ok(pos) => pos,
                Err(pos) if create => {
                    cur.keys.insert(pos, ObjKey::default());
                    cur.keys[pos].name = seg.name.to_string();
                    pos
                }
                Err(_) => return err_at!(NotFound, msg: "key {:?}", seg.name),
            };
            let key = &mut cur.keys[pos];
            if create && matches!(key.value, Value::Null) {
                key.value = match seg.index {
                    None => Value::Object(Box::new(SelvaObject::new())),
                    Some(_) => Value::Array(ObjArray::Object(vec![])),
                };
            }
            obj = match (&mut key.value, seg.index) {
                (Value::Object(o), None) => o,
                (Value::Array(ObjArray::Object(v)), Some(index)) => {
                    let i = match norm_index(index, v.len()) {
                        Some(i) => i,
                        None => return err_at!(InvalidInput, msg: "index {}", index),
                    };
                    if i >= v.len() {
                        if !create || index < 0 {
                            return err_at!(NotFound, msg: "index {} in {:?}", index, seg.name);
                        }
                        v.resize(i + 1, SelvaObject::new());
                    }
                    &mut v[i]
                }
                _ => return err_at!(TypeMismatch, msg: "not an object at {:?}", seg.name),
            };
        }

        let seg = &segs[last];
        let pos = match obj.key_pos(seg.name) {
            Ok(pos) => pos,
            Err(pos) if create => {
                obj.keys.insert(pos, ObjKey::default());
                obj.keys[pos].name = seg.name.to_string();
                pos
            }
            Err(_) => return err_at!(NotFound, msg: "key {:?}", seg.name),
        };
        Ok((&mut obj.keys[pos], seg.index))
    }

    fn view_at<'a>(key: &'a ObjKey, index: Option<isize>) -> Result<ValueView<'a>> {
        match index {
            None => Ok(match &key.value {
                Value::Null => ValueView::Null,
                Value::Double(v) => ValueView::Double(*v),
                Value::LongLong(v) => ValueView::LongLong(*v),
                Value::Str(v) => ValueView::Str(v),
                Value::Object(v) => ValueView::Object(v),
                Value::Set(v) => ValueView::Set(v),
                Value::Array(v) => ValueView::Array(v),
                Value::Pointer(v) => ValueView::Pointer(v),
                Value::Hll(v) => ValueView::Hll(v),
            }),
            Some(index) => {
                let arr = match &key.value {
                    Value::Array(arr) => arr,
                    _ => return err_at!(TypeMismatch, msg: "{:?} is not an array", key.name),
                };
                let i = match norm_index(index, arr.len()) {
                    Some(i) if i < arr.len() => i,
                    _ => return err_at!(NotFound, msg: "index {} in {:?}", index, key.name),
                };
                Ok(match arr {
                    ObjArray::Double(v) => ValueView::Double(v[i]),
                    ObjArray::LongLong(v) => ValueView::LongLong(v[i]),
                    ObjArray::Str(v) => ValueView::Str(&v[i]),
                    ObjArray::Object(v) => ValueView::Object(&v[i]),
                    ObjArray::Hll(v) => ValueView::Hll(&v[i]),
                    ObjArray::Pointer(v) => ValueView::Pointer(&v[i]),
                })
            }
        }
    }

    /// Any-typed read with array index dereferencing.
    pub fn get_any(&self, path: &str) -> Result<ValueView> {
        let segs = parse_path(path)?;
        match self.descend(&segs) {
            Some((key, index)) => Self::view_at(key, index),
            None => err_at!(NotFound, msg: "key {:?}", path),
        }
    }

    /// Like [SelvaObject::get_any] but transparently dereference `text`
    /// objects by the language preference list.
    pub fn get_any_lang(&self, path: &str, langs: &[&str]) -> Result<ValueView> {
        let segs = parse_path(path)?;
        let (key, index) = match self.descend(&segs) {
            Some(found) => found,
            None => return err_at!(NotFound, msg: "key {:?}", path),
        };
        if key.meta == META_SUBTYPE_TEXT {
            if let Value::Object(o) = &key.value {
                return o.text_value(langs).map(ValueView::Str);
            }
        }
        Self::view_at(key, index)
    }

    // Pick a text translation by language preference, falling back to
    // the first available one.
    fn text_value(&self, langs: &[&str]) -> Result<&SelvaString> {
        for lang in langs {
            if let Some(key) = self.get_key(lang) {
                if let Value::Str(s) = &key.value {
                    return Ok(s);
                }
            }
        }
        for key in self.keys.iter() {
            if let Value::Str(s) = &key.value {
                return Ok(s);
            }
        }
        err_at!(NotFound, msg: "no translation")
    }

    /// Type of the value at `path`; `Null` when the key is missing.
    pub fn get_type(&self, path: &str) -> ValueType {
        match parse_path(path) {
            Ok(segs) => match self.descend(&segs) {
                Some((key, None)) => key.value.value_type(),
                Some((key, Some(index))) => match Self::view_at(key, Some(index)) {
                    Ok(ValueView::Double(_)) => ValueType::Double,
                    Ok(ValueView::LongLong(_)) => ValueType::LongLong,
                    Ok(ValueView::Str(_)) => ValueType::Str,
                    Ok(ValueView::Object(_)) => ValueType::Object,
                    Ok(ValueView::Hll(_)) => ValueType::Hll,
                    Ok(ValueView::Pointer(_)) => ValueType::Pointer,
                    _ => ValueType::Null,
                },
                None => ValueType::Null,
            },
            Err(_) => ValueType::Null,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        match parse_path(path) {
            Ok(segs) => match self.descend(&segs) {
                Some((key, index)) => Self::view_at(key, index).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Check only the first path segment.
    pub fn exists_top_level(&self, path: &str) -> bool {
        match parse_path(path) {
            Ok(segs) => self.get_key(segs[0].name).is_some(),
            Err(_) => false,
        }
    }

    pub fn get_double(&self, path: &str) -> Result<f64> {
        match self.get_any(path)? {
            ValueView::Double(v) => Ok(v),
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v, path),
        }
    }

    pub fn get_long_long(&self, path: &str) -> Result<i64> {
        match self.get_any(path)? {
            ValueView::LongLong(v) => Ok(v),
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v, path),
        }
    }

    pub fn get_str(&self, path: &str) -> Result<&SelvaString> {
        match self.get_any(path)? {
            ValueView::Str(v) => Ok(v),
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v, path),
        }
    }

    pub fn get_object(&self, path: &str) -> Result<&SelvaObject> {
        match self.get_any(path)? {
            ValueView::Object(v) => Ok(v),
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v, path),
        }
    }

    pub fn get_object_mut(&mut self, path: &str) -> Result<&mut SelvaObject> {
        let segs = parse_path(path)?;
        let (key, _) = self.descend_mut(&segs, false)?;
        match &mut key.value {
            Value::Object(o) => Ok(o),
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
        }
    }

    pub fn get_set(&self, path: &str) -> Option<&SelvaSet> {
        match self.get_any(path) {
            Ok(ValueView::Set(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_array(&self, path: &str) -> Result<&ObjArray> {
        match self.get_any(path)? {
            ValueView::Array(v) => Ok(v),
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v, path),
        }
    }

    pub fn get_pointer(&self, path: &str) -> Result<&SelvaPointer> {
        match self.get_any(path)? {
            ValueView::Pointer(v) => Ok(v),
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v, path),
        }
    }

    // Write one scalar; a trailing array index turns the write into an
    // array assignment. Replacing a value destructively drops the old
    // value, including nested subtrees.
    fn set_scalar(&mut self, path: &str, item: ArrayItem) -> Result<()> {
        let segs = parse_path(path)?;
        let (key, index) = self.descend_mut(&segs, true)?;
        match index {
            None => {
                key.value = match item {
                    ArrayItem::Double(v) => Value::Double(v),
                    ArrayItem::LongLong(v) => Value::LongLong(v),
                    ArrayItem::Str(v) => Value::Str(v),
                    ArrayItem::Object(v) => Value::Object(Box::new(v)),
                    ArrayItem::Hll(v) => Value::Hll(v),
                    ArrayItem::Pointer(v) => Value::Pointer(v),
                };
                Ok(())
            }
            Some(index) => {
                if matches!(key.value, Value::Null) {
                    key.value = Value::Array(ObjArray::new(item.subtype())?);
                }
                let arr = match &mut key.value {
                    Value::Array(arr) => arr,
                    v => {
                        return err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path)
                    }
                };
                let i = match norm_index(index, arr.len()) {
                    Some(i) => i,
                    None => return err_at!(InvalidInput, msg: "index {}", index),
                };
                arr.assign(i, item)
            }
        }
    }

    pub fn set_double(&mut self, path: &str, value: f64) -> Result<()> {
        self.set_scalar(path, ArrayItem::Double(value))
    }

    pub fn set_long_long(&mut self, path: &str, value: i64) -> Result<()> {
        self.set_scalar(path, ArrayItem::LongLong(value))
    }

    pub fn set_str(&mut self, path: &str, value: SelvaString) -> Result<()> {
        self.set_scalar(path, ArrayItem::Str(value))
    }

    pub fn set_object(&mut self, path: &str, value: SelvaObject) -> Result<()> {
        self.set_scalar(path, ArrayItem::Object(value))
    }

    pub fn set_pointer(&mut self, path: &str, value: SelvaPointer) -> Result<()> {
        self.set_scalar(path, ArrayItem::Pointer(value))
    }

    pub fn set_double_default(&mut self, path: &str, value: f64) -> Result<()> {
        if !self.exists(path) {
            self.set_double(path, value)?;
        }
        Ok(())
    }

    pub fn set_long_long_default(&mut self, path: &str, value: i64) -> Result<()> {
        if !self.exists(path) {
            self.set_long_long(path, value)?;
        }
        Ok(())
    }

    pub fn set_str_default(&mut self, path: &str, value: SelvaString) -> Result<()> {
        if !self.exists(path) {
            self.set_str(path, value)?;
        }
        Ok(())
    }

    /// Set `value`, failing with `Exists` when the stored value is
    /// already equal, so callers can skip change events.
    pub fn update_double(&mut self, path: &str, value: f64) -> Result<()> {
        if let Ok(old) = self.get_double(path) {
            if old == value {
                return err_at!(Exists, msg: "unchanged {:?}", path);
            }
        }
        self.set_double(path, value)
    }

    pub fn update_long_long(&mut self, path: &str, value: i64) -> Result<()> {
        if let Ok(old) = self.get_long_long(path) {
            if old == value {
                return err_at!(Exists, msg: "unchanged {:?}", path);
            }
        }
        self.set_long_long(path, value)
    }

    pub fn update_str(&mut self, path: &str, value: SelvaString) -> Result<()> {
        if let Ok(old) = self.get_str(path) {
            if *old == value {
                return err_at!(Exists, msg: "unchanged {:?}", path);
            }
        }
        self.set_str(path, value)
    }

    /// Increment a long long, taking `default` when the key is absent. An
    /// absent array slot initializes from the array default fill before
    /// the increment.
    pub fn increment_long_long(&mut self, path: &str, default: i64, incr: i64) -> Result<i64> {
        let segs = parse_path(path)?;
        let (key, index) = self.descend_mut(&segs, true)?;
        match index {
            None => match &mut key.value {
                Value::LongLong(v) => {
                    *v += incr;
                    Ok(*v)
                }
                Value::Null => {
                    key.value = Value::LongLong(default);
                    Ok(default)
                }
                v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
            },
            Some(index) => {
                if matches!(key.value, Value::Null) {
                    key.value = Value::Array(ObjArray::LongLong(vec![]));
                }
                match &mut key.value {
                    Value::Array(ObjArray::LongLong(v)) => {
                        let i = match norm_index(index, v.len()) {
                            Some(i) => i,
                            None => return err_at!(InvalidInput, msg: "index {}", index),
                        };
                        if i >= v.len() {
                            v.resize(i + 1, 0);
                        }
                        v[i] += incr;
                        Ok(v[i])
                    }
                    v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
                }
            }
        }
    }

    /// Increment a double, taking `default` when the key is absent. An
    /// absent array slot initializes from 0.0 before the increment.
    pub fn increment_double(&mut self, path: &str, default: f64, incr: f64) -> Result<f64> {
        let segs = parse_path(path)?;
        let (key, index) = self.descend_mut(&segs, true)?;
        match index {
            None => match &mut key.value {
                Value::Double(v) => {
                    *v += incr;
                    Ok(*v)
                }
                Value::Null => {
                    key.value = Value::Double(default);
                    Ok(default)
                }
                v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
            },
            Some(index) => {
                if matches!(key.value, Value::Null) {
                    key.value = Value::Array(ObjArray::Double(vec![]));
                }
                match &mut key.value {
                    Value::Array(ObjArray::Double(v)) => {
                        let i = match norm_index(index, v.len()) {
                            Some(i) => i,
                            None => return err_at!(InvalidInput, msg: "index {}", index),
                        };
                        if i >= v.len() {
                            v.resize(i + 1, 0.0);
                        }
                        v[i] += incr;
                        Ok(v[i])
                    }
                    v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
                }
            }
        }
    }

    /// Delete a key and its value; with a trailing index, delete one
    /// array element.
    pub fn del_key(&mut self, path: &str) -> Result<()> {
        let segs = parse_path(path)?;
        let last = segs[segs.len() - 1];
        let (key, index) = self.descend_mut(&segs, false)?;
        match index {
            None => {}
            Some(index) => {
                let arr = match &mut key.value {
                    Value::Array(arr) => arr,
                    v => return err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
                };
                let i = match norm_index(index, arr.len()) {
                    Some(i) => i,
                    None => return err_at!(NotFound, msg: "index {}", index),
                };
                return arr.remove_at(i);
            }
        }
        // deleting the whole key needs the parent object again
        let parent_segs = &segs[..segs.len() - 1];
        let parent = if parent_segs.is_empty() {
            self
        } else {
            let (key, _) = self.descend_mut(parent_segs, false)?;
            match &mut key.value {
                Value::Object(o) => o,
                v => return err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
            }
        };
        match parent.key_pos(last.name) {
            Ok(pos) => {
                parent.keys.remove(pos);
                Ok(())
            }
            Err(_) => err_at!(NotFound, msg: "key {:?}", path),
        }
    }

    /// Clear all keys except the listed top-level names.
    pub fn clear(&mut self, exclude: &[&str]) {
        let keep: Vec<ObjKey> =
            self.keys.iter().filter(|k| exclude.contains(&k.name.as_str())).cloned().collect();
        self.keys.clear();
        for key in keep {
            let pos = self.key_pos(&key.name).unwrap_err();
            self.keys.insert(pos, key);
        }
    }

    /// Element count for containers, byte length for strings, key count
    /// for `path = ""`.
    pub fn len_of(&self, path: &str) -> Result<usize> {
        if path.is_empty() {
            return Ok(self.keys.len());
        }
        match self.get_any(path)? {
            ValueView::Null => Ok(0),
            ValueView::Double(_) | ValueView::LongLong(_) => Ok(1),
            ValueView::Str(s) => Ok(s.len()),
            ValueView::Object(o) => Ok(o.key_count()),
            ValueView::Set(s) => Ok(s.size()),
            ValueView::Array(a) => Ok(a.len()),
            ValueView::Pointer(p) => Ok(p.len()),
            ValueView::Hll(h) => Ok(h.count() as usize),
        }
    }

    pub fn get_user_meta(&self, path: &str) -> Result<u32> {
        let segs = parse_path(path)?;
        match self.descend(&segs) {
            Some((key, _)) => Ok(key.meta),
            None => err_at!(NotFound, msg: "key {:?}", path),
        }
    }

    pub fn set_user_meta(&mut self, path: &str, meta: u32) -> Result<u32> {
        let segs = parse_path(path)?;
        let (key, _) = self.descend_mut(&segs, false)?;
        let old = key.meta;
        key.meta = meta;
        Ok(old)
    }

    fn set_in_set(&mut self, path: &str, set_type: SetType) -> Result<&mut SelvaSet> {
        let segs = parse_path(path)?;
        let (key, _) = self.descend_mut(&segs, true)?;
        if matches!(key.value, Value::Null) {
            key.value = Value::Set(SelvaSet::new(set_type));
        }
        match &mut key.value {
            Value::Set(set) => Ok(set),
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
        }
    }

    pub fn add_set_str(&mut self, path: &str, value: SelvaString) -> Result<()> {
        self.set_in_set(path, SetType::Str)?.add_str(value)
    }

    pub fn add_set_double(&mut self, path: &str, value: f64) -> Result<()> {
        self.set_in_set(path, SetType::Double)?.add_double(value)
    }

    pub fn add_set_long_long(&mut self, path: &str, value: i64) -> Result<()> {
        self.set_in_set(path, SetType::LongLong)?.add_long_long(value)
    }

    pub fn add_set_node_id(&mut self, path: &str, value: NodeId) -> Result<()> {
        self.set_in_set(path, SetType::NodeId)?.add_node_id(value)
    }

    fn existing_set(&mut self, path: &str) -> Result<&mut SelvaSet> {
        let segs = parse_path(path)?;
        let (key, _) = self.descend_mut(&segs, false)?;
        match &mut key.value {
            Value::Set(set) => Ok(set),
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
        }
    }

    pub fn rem_set_str(&mut self, path: &str, value: &SelvaString) -> Result<()> {
        match self.existing_set(path)?.remove_str(value) {
            Some(_) => Ok(()),
            None => err_at!(NotFound, msg: "{:?} in {:?}", value, path),
        }
    }

    pub fn rem_set_double(&mut self, path: &str, value: f64) -> Result<()> {
        match self.existing_set(path)?.remove_double(value) {
            Some(_) => Ok(()),
            None => err_at!(NotFound, msg: "{} in {:?}", value, path),
        }
    }

    pub fn rem_set_long_long(&mut self, path: &str, value: i64) -> Result<()> {
        match self.existing_set(path)?.remove_long_long(value) {
            Some(_) => Ok(()),
            None => err_at!(NotFound, msg: "{} in {:?}", value, path),
        }
    }

    pub fn rem_set_node_id(&mut self, path: &str, value: &NodeId) -> Result<()> {
        match self.existing_set(path)?.remove_node_id(value) {
            Some(_) => Ok(()),
            None => err_at!(NotFound, msg: "{} in {:?}", value, path),
        }
    }

    /// Append to an array field, creating it with the item's sub-type.
    pub fn insert_array(&mut self, path: &str, item: ArrayItem) -> Result<()> {
        let segs = parse_path(path)?;
        let (key, _) = self.descend_mut(&segs, true)?;
        if matches!(key.value, Value::Null) {
            key.value = Value::Array(ObjArray::new(item.subtype())?);
        }
        match &mut key.value {
            Value::Array(arr) => arr.push(item),
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
        }
    }

    pub fn assign_array_index(&mut self, path: &str, index: isize, item: ArrayItem) -> Result<()> {
        let segs = parse_path(path)?;
        let (key, _) = self.descend_mut(&segs, true)?;
        if matches!(key.value, Value::Null) {
            key.value = Value::Array(ObjArray::new(item.subtype())?);
        }
        match &mut key.value {
            Value::Array(arr) => {
                let i = match norm_index(index, arr.len()) {
                    Some(i) => i,
                    None => return err_at!(InvalidInput, msg: "index {}", index),
                };
                arr.assign(i, item)
            }
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
        }
    }

    pub fn insert_array_index(&mut self, path: &str, index: isize, item: ArrayItem) -> Result<()> {
        let segs = parse_path(path)?;
        let (key, _) = self.descend_mut(&segs, true)?;
        if matches!(key.value, Value::Null) {
            key.value = Value::Array(ObjArray::new(item.subtype())?);
        }
        match &mut key.value {
            Value::Array(arr) => {
                let i = match norm_index(index, arr.len()) {
                    Some(i) => i,
                    None => return err_at!(InvalidInput, msg: "index {}", index),
                };
                arr.insert_at(i, item)
            }
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
        }
    }

    pub fn remove_array_index(&mut self, path: &str, index: isize) -> Result<()> {
        let segs = parse_path(path)?;
        let (key, _) = self.descend_mut(&segs, false)?;
        match &mut key.value {
            Value::Array(arr) => {
                let i = match norm_index(index, arr.len()) {
                    Some(i) if i < arr.len() => i,
                    _ => return err_at!(NotFound, msg: "index {}", index),
                };
                arr.remove_at(i)
            }
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
        }
    }

    pub fn get_array_len(&self, path: &str) -> usize {
        match self.get_any(path) {
            Ok(ValueView::Array(arr)) => arr.len(),
            _ => 0,
        }
    }

    /// Add an element to a HyperLogLog field, creating the sketch on
    /// first use. Returns whether the field was modified.
    pub fn add_hll(&mut self, path: &str, element: &[u8]) -> Result<bool> {
        let segs = parse_path(path)?;
        let (key, _) = self.descend_mut(&segs, true)?;
        if matches!(key.value, Value::Null) {
            key.value = Value::Hll(HyperLogLog::new());
        }
        match &mut key.value {
            Value::Hll(hll) => Ok(hll.add(element)),
            v => err_at!(TypeMismatch, msg: "{:?} at {:?}", v.value_type(), path),
        }
    }

    /// Expand a pattern with `*` segments into the concrete key paths
    /// existing in this object.
    pub fn wildcard_paths(&self, pattern: &str) -> Vec<String> {
        let segs: Vec<&str> = pattern.split('.').collect();
        let mut acc = vec![];
        self.expand_wildcard(&segs, String::new(), &mut acc);
        acc
    }

    fn expand_wildcard(&self, segs: &[&str], prefix: String, acc: &mut Vec<String>) {
        if segs.is_empty() {
            return;
        }
        let names: Vec<String> = if segs[0] == "*" {
            self.keys.iter().map(|k| k.name.clone()).collect()
        } else {
            vec![segs[0].to_string()]
        };
        for name in names {
            let key = match self.get_key(&name) {
                Some(key) => key,
                None => continue,
            };
            let path = if prefix.is_empty() { name.clone() } else { format!("{}.{}", prefix, name) };
            if segs.len() == 1 {
                acc.push(path);
            } else if let Value::Object(o) = &key.value {
                o.expand_wildcard(&segs[1..], path, acc);
            }
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
