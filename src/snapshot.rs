//! Module implement the stable serialization layout of the database.
//!
//! Snapshots encode, in order: version, the hierarchy graph (nodes with
//! id, object, parent/child lists and edge container), the edge
//! constraint table, the subscription registry, the alias and type
//! tables and the detached subtree index. Pointer values serialize only
//! when their options carry a registered type id with save/load hooks;
//! none do here, so they are skipped. The file and process handling
//! around these bytes belongs to the IO module outside the core.

use cbordata::{Cbor, Cborize, FromCbor, IntoCbor};

use std::convert::TryInto;

use crate::{
    edge::{ConstraintFlags, DynConstraintParams, EdgeField},
    hierarchy::{traversal::TraversalDir, Node, SelvaHierarchy},
    object::hll::HyperLogLog,
    object::{ObjArray, SelvaObject, Value, ValueType},
    set::SelvaSet,
    sstring::SelvaString,
    subscriptions::{self, MarkerAction, MarkerSpec},
    svector::SVector,
    types::{NodeId, NodeType, TriggerType},
    Config, Result,
};

/// Layout version; bump on every shape change.
pub const SNAPSHOT_VERSION: u32 = 5;

const SNAP_STRING_VER: u32 = 0x000A0001;
const SNAP_VALUE_VER: u32 = 0x000A0002;
const SNAP_KEY_VER: u32 = 0x000A0003;
const SNAP_OBJECT_VER: u32 = 0x000A0004;
const SNAP_EDGE_VER: u32 = 0x000A0005;
const SNAP_NODE_VER: u32 = 0x000A0006;
const SNAP_CONSTRAINT_VER: u32 = 0x000A0007;
const SNAP_MARKER_VER: u32 = 0x000A0008;
const SNAP_SUBTREE_VER: u32 = 0x000A0009;
const SNAP_DETACHED_VER: u32 = 0x000A000A;
const SNAP_DB_VER: u32 = 0x000A000B;

#[derive(Clone, Debug, Cborize)]
pub struct SnapString {
    flags: u8,
    compressed: bool,
    uncompressed_len: u64,
    data: Vec<u8>,
}

impl SnapString {
    pub const ID: u32 = SNAP_STRING_VER;

    fn from_sstring(s: &SelvaString) -> SnapString {
        let (flags, compressed, uncompressed_len, data) = s.snapshot_parts();
        SnapString { flags, compressed, uncompressed_len, data: data.to_vec() }
    }

    fn to_sstring(&self) -> SelvaString {
        SelvaString::from_snapshot_parts(
            self.flags,
            self.compressed,
            self.uncompressed_len,
            &self.data,
        )
    }
}

#[derive(Clone, Debug, Cborize)]
pub enum SnapValue {
    Double { value: f64 },
    LongLong { value: i64 },
    Str { value: SnapString },
    Object { value: SnapObject },
    SetStr { values: Vec<SnapString> },
    SetDouble { values: Vec<f64> },
    SetLongLong { values: Vec<i64> },
    SetNodeId { values: Vec<Vec<u8>> },
    ArrDouble { values: Vec<f64> },
    ArrLongLong { values: Vec<i64> },
    ArrStr { values: Vec<SnapString> },
    ArrObject { values: Vec<SnapObject> },
    ArrHll { values: Vec<Vec<u8>> },
    Hll { registers: Vec<u8> },
}

impl SnapValue {
    pub const ID: u32 = SNAP_VALUE_VER;
}

#[derive(Clone, Debug, Cborize)]
pub struct SnapKey {
    name: String,
    type_tag: u8,
    user_meta: u32,
    value: SnapValue,
}

impl SnapKey {
    pub const ID: u32 = SNAP_KEY_VER;
}

#[derive(Clone, Debug, Cborize)]
pub struct SnapObject {
    keys: Vec<SnapKey>,
}

impl SnapObject {
    pub const ID: u32 = SNAP_OBJECT_VER;
}

#[derive(Clone, Debug, Cborize)]
pub struct SnapEdgeField {
    field: String,
    constraint_id: u32,
    arcs: Vec<Vec<u8>>,
    /// Zero or one metadata objects; a Vec stands in for an optional.
    metadata: Vec<SnapObject>,
}

impl SnapEdgeField {
    pub const ID: u32 = SNAP_EDGE_VER;
}

#[derive(Clone, Debug, Cborize)]
pub struct SnapNode {
    pub(crate) id: Vec<u8>,
    obj: SnapObject,
    parents: Vec<Vec<u8>>,
    children: Vec<Vec<u8>>,
    edges: Vec<SnapEdgeField>,
}

impl SnapNode {
    pub const ID: u32 = SNAP_NODE_VER;
}

#[derive(Clone, Debug, Cborize)]
pub struct SnapConstraint {
    flags: u8,
    src_node_type: Vec<u8>,
    fwd_field: String,
    bck_field: String,
}

impl SnapConstraint {
    pub const ID: u32 = SNAP_CONSTRAINT_VER;
}

#[derive(Clone, Debug, Cborize)]
pub struct SnapMarker {
    sub_id: Vec<u8>,
    marker_id: i64,
    flags: u32,
    node_id: Vec<u8>,
    dir_bits: u32,
    ref_field: String,
    dir_expression: String,
    filter: String,
    fields: String,
    alias: String,
    /// Trigger event kind; -1 when the marker is not a trigger.
    trigger: i64,
}

impl SnapMarker {
    pub const ID: u32 = SNAP_MARKER_VER;
}

#[derive(Clone, Debug, Cborize)]
pub struct SnapSubtree {
    pub(crate) attach: Vec<u8>,
    pub(crate) nodes: Vec<SnapNode>,
}

impl SnapSubtree {
    pub const ID: u32 = SNAP_SUBTREE_VER;
}

#[derive(Clone, Debug, Cborize)]
pub struct SnapDetached {
    node_id: Vec<u8>,
    blob: Vec<u8>,
}

impl SnapDetached {
    pub const ID: u32 = SNAP_DETACHED_VER;
}

#[derive(Clone, Debug, Cborize)]
pub struct SnapDb {
    version: u32,
    nodes: Vec<SnapNode>,
    constraints: Vec<SnapConstraint>,
    markers: Vec<SnapMarker>,
    aliases: SnapObject,
    types: SnapObject,
    detached: Vec<SnapDetached>,
}

impl SnapDb {
    pub const ID: u32 = SNAP_DB_VER;
}

/// Serialize a value implementing IntoCbor into a byte string.
pub(crate) fn into_cbor_bytes<T>(val: T) -> Result<Vec<u8>>
where
    T: IntoCbor,
{
    let mut data: Vec<u8> = vec![];
    err_at!(FailCbor, err_at!(FailCbor, val.into_cbor())?.encode(&mut data))?;
    Ok(data)
}

/// Deserialize a value implementing FromCbor from a byte string.
pub(crate) fn from_cbor_bytes<T>(mut data: &[u8]) -> Result<T>
where
    T: FromCbor,
{
    let (val, _) = err_at!(FailCbor, Cbor::decode(&mut data))?;
    err_at!(FailCbor, T::from_cbor(val))
}

fn snap_value(value: &Value) -> Option<SnapValue> {
    let sv = match value {
        Value::Null => return None,
        Value::Double(v) => SnapValue::Double { value: *v },
        Value::LongLong(v) => SnapValue::LongLong { value: *v },
        Value::Str(s) => SnapValue::Str { value: SnapString::from_sstring(s) },
        Value::Object(o) => SnapValue::Object { value: snapshot_object(o) },
        Value::Set(SelvaSet::Str(set)) => SnapValue::SetStr {
            values: set.iter().map(SnapString::from_sstring).collect(),
        },
        Value::Set(SelvaSet::Double(set)) => {
            SnapValue::SetDouble { values: set.iter().map(|v| v.0).collect() }
        }
        Value::Set(SelvaSet::LongLong(set)) => {
            SnapValue::SetLongLong { values: set.iter().cloned().collect() }
        }
        Value::Set(SelvaSet::NodeId(set)) => SnapValue::SetNodeId {
            values: set.iter().map(|id| id.as_bytes().to_vec()).collect(),
        },
        Value::Array(ObjArray::Double(v)) => SnapValue::ArrDouble { values: v.clone() },
        Value::Array(ObjArray::LongLong(v)) => SnapValue::ArrLongLong { values: v.clone() },
        Value::Array(ObjArray::Str(v)) => {
            SnapValue::ArrStr { values: v.iter().map(SnapString::from_sstring).collect() }
        }
        Value::Array(ObjArray::Object(v)) => {
            SnapValue::ArrObject { values: v.iter().map(snapshot_object).collect() }
        }
        Value::Array(ObjArray::Hll(v)) => {
            SnapValue::ArrHll { values: v.iter().map(|h| h.to_bytes()).collect() }
        }
        Value::Hll(h) => SnapValue::Hll { registers: h.to_bytes() },
        // pointers carry no registered save hook
        Value::Pointer(_) | Value::Array(ObjArray::Pointer(_)) => return None,
    };
    Some(sv)
}

/// Serialize one object.
pub fn snapshot_object(obj: &SelvaObject) -> SnapObject {
    let mut keys = vec![];
    for key in obj.iter_keys() {
        if let Some(value) = snap_value(key.value()) {
            keys.push(SnapKey {
                name: key.name().to_string(),
                type_tag: key.value_type() as u8,
                user_meta: key.meta(),
                value,
            });
        }
    }
    SnapObject { keys }
}

fn restore_value(value: &SnapValue) -> Result<Value> {
    let v = match value {
        SnapValue::Double { value } => Value::Double(*value),
        SnapValue::LongLong { value } => Value::LongLong(*value),
        SnapValue::Str { value } => Value::Str(value.to_sstring()),
        SnapValue::Object { value } => Value::Object(Box::new(restore_object(value)?)),
        SnapValue::SetStr { values } => {
            Value::Set(SelvaSet::Str(values.iter().map(|s| s.to_sstring()).collect()))
        }
        SnapValue::SetDouble { values } => Value::Set(SelvaSet::Double(
            values.iter().map(|v| crate::set::TotalF64(*v)).collect(),
        )),
        SnapValue::SetLongLong { values } => {
            Value::Set(SelvaSet::LongLong(values.iter().cloned().collect()))
        }
        SnapValue::SetNodeId { values } => Value::Set(SelvaSet::NodeId(
            values.iter().map(|v| NodeId::new(v)).collect(),
        )),
        SnapValue::ArrDouble { values } => Value::Array(ObjArray::Double(values.clone())),
        SnapValue::ArrLongLong { values } => Value::Array(ObjArray::LongLong(values.clone())),
        SnapValue::ArrStr { values } => {
            Value::Array(ObjArray::Str(values.iter().map(|s| s.to_sstring()).collect()))
        }
        SnapValue::ArrObject { values } => {
            let mut out = vec![];
            for o in values {
                out.push(restore_object(o)?);
            }
            Value::Array(ObjArray::Object(out))
        }
        SnapValue::ArrHll { values } => {
            let mut out = vec![];
            for regs in values {
                out.push(HyperLogLog::from_bytes(regs)?);
            }
            Value::Array(ObjArray::Hll(out))
        }
        SnapValue::Hll { registers } => Value::Hll(HyperLogLog::from_bytes(registers)?),
    };
    Ok(v)
}

/// Rebuild one object.
pub fn restore_object(snap: &SnapObject) -> Result<SelvaObject> {
    let mut obj = SelvaObject::new();
    for key in snap.keys.iter() {
        ValueType::from_u8(key.type_tag)?;
        let value = restore_value(&key.value)?;
        obj.insert_key_raw(key.name.clone(), key.user_meta, value);
    }
    Ok(obj)
}

/// Serialize one hierarchy node with its links and edge fields.
pub fn snapshot_node(node: &Node) -> SnapNode {
    let mut edges = vec![];
    if let Some(container) = node.edges() {
        for (field, edge_field) in container.edges.iter() {
            edges.push(SnapEdgeField {
                field: field.clone(),
                constraint_id: edge_field.constraint_id,
                arcs: edge_field.arcs.iter().map(|id| id.as_bytes().to_vec()).collect(),
                metadata: edge_field.metadata.iter().map(snapshot_object).collect(),
            });
        }
    }
    SnapNode {
        id: node.id().as_bytes().to_vec(),
        obj: snapshot_object(node.obj()),
        parents: node.parents().iter().map(|id| id.as_bytes().to_vec()).collect(),
        children: node.children().iter().map(|id| id.as_bytes().to_vec()).collect(),
        edges,
    }
}

/// Rebuild nodes into the hierarchy without firing events: objects
/// first, then the links, then the edge fields. Links and arcs into
/// nodes that do not exist are dropped.
pub(crate) fn restore_nodes(h: &mut SelvaHierarchy, nodes: &[SnapNode]) -> Result<usize> {
    for sn in nodes {
        let id = NodeId::new(&sn.id);
        if !h.index.contains_key(&id) {
            h.index.insert(id, Node::new(id, false));
            h.heads.insert_fast(id).ok();
        }
        let obj = restore_object(&sn.obj)?;
        *h.node_mut(&id).unwrap().obj_mut() = obj;
    }

    for sn in nodes {
        let id = NodeId::new(&sn.id);
        for p in sn.parents.iter() {
            let p = NodeId::new(p);
            if h.node_exists(&p) {
                h.link_raw(&p, &id);
            }
        }
        for c in sn.children.iter() {
            let c = NodeId::new(c);
            if h.node_exists(&c) {
                h.link_raw(&id, &c);
            }
        }
    }

    for sn in nodes {
        let id = NodeId::new(&sn.id);
        for se in sn.edges.iter() {
            let constraint = h.constraints.get(se.constraint_id, id.node_type(), &se.field)?;
            let mut edge_field = EdgeField {
                constraint_id: se.constraint_id,
                flags: constraint.flags,
                bck_field: constraint.bck_field.clone(),
                arcs: SVector::new(se.arcs.len(), Some(|a: &NodeId, b: &NodeId| a.cmp(b))),
                metadata: match se.metadata.first() {
                    Some(snap) => Some(restore_object(snap)?),
                    None => None,
                },
            };
            let arcs: Vec<NodeId> = se
                .arcs
                .iter()
                .map(|a| NodeId::new(a))
                .filter(|a| h.node_exists(a))
                .collect();
            for dst in arcs.iter() {
                edge_field.arcs.insert_fast(*dst).ok();
            }
            h.node_mut(&id).unwrap().edges_mut().edges.insert(se.field.clone(), edge_field);
            for dst in arcs {
                h.node_mut(&dst)
                    .unwrap()
                    .edges_mut()
                    .origins
                    .entry(id)
                    .or_insert_with(Default::default)
                    .insert(se.field.clone());
            }
        }
    }
    Ok(nodes.len())
}

fn snap_marker(m: &subscriptions::Marker) -> SnapMarker {
    SnapMarker {
        sub_id: m.key.sub_id.to_vec(),
        marker_id: m.key.marker_id,
        flags: m.flags as u32,
        node_id: m.node_id.as_bytes().to_vec(),
        dir_bits: m.dir.bits() as u32,
        ref_field: m.ref_field.clone().unwrap_or_default(),
        dir_expression: m.traversal_expr.as_ref().map(|e| e.source().to_string()).unwrap_or_default(),
        filter: m.filter.as_ref().map(|e| e.source().to_string()).unwrap_or_default(),
        fields: m.fields.clone().unwrap_or_default(),
        alias: m.alias.clone().unwrap_or_default(),
        trigger: m.event_type.map(|t| t as i64).unwrap_or(-1),
    }
}

fn nonempty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Serialize the whole database.
pub fn save(h: &SelvaHierarchy) -> Result<Vec<u8>> {
    let nodes: Vec<SnapNode> =
        h.index.values().map(snapshot_node).collect();
    let constraints: Vec<SnapConstraint> = h
        .constraints
        .dyn_constraints()
        .map(|c| SnapConstraint {
            flags: c.flags.0,
            src_node_type: c.src_node_type.map(|t| t.0.to_vec()).unwrap_or_default(),
            fwd_field: c.fwd_field.clone(),
            bck_field: c.bck_field.clone().unwrap_or_default(),
        })
        .collect();
    // index markers rebuild themselves from hot traffic, skip them
    let markers: Vec<SnapMarker> = h
        .subs
        .markers
        .values()
        .filter(|m| m.action == MarkerAction::DeferEvent)
        .map(snap_marker)
        .collect();
    let mut detached = vec![];
    for (node_id, store) in h.detached.entries() {
        detached.push(SnapDetached {
            node_id: node_id.as_bytes().to_vec(),
            blob: crate::hierarchy::detached::read_blob(&store)?,
        });
    }
    let db = SnapDb {
        version: SNAPSHOT_VERSION,
        nodes,
        constraints,
        markers,
        aliases: snapshot_object(&h.aliases),
        types: snapshot_object(&h.types),
        detached,
    };
    into_cbor_bytes(db)
}

/// Rebuild a database from serialized bytes.
pub fn load(data: &[u8], config: Config) -> Result<SelvaHierarchy> {
    let db: SnapDb = from_cbor_bytes(data)?;
    if db.version != SNAPSHOT_VERSION {
        return err_at!(InvalidInput, msg: "snapshot version {}", db.version);
    }
    let mut h = SelvaHierarchy::new(config);

    for c in db.constraints.iter() {
        let src_node_type = match c.src_node_type.as_slice().try_into() {
            Ok(t) => NodeType(t),
            Err(_) => return err_at!(InvalidInput, msg: "constraint node type"),
        };
        h.constraints.new_dyn_constraint(DynConstraintParams {
            flags: ConstraintFlags(c.flags),
            src_node_type,
            fwd_field: c.fwd_field.clone(),
            bck_field: nonempty(&c.bck_field),
        })?;
    }

    restore_nodes(&mut h, &db.nodes)?;
    h.aliases = restore_object(&db.aliases)?;
    h.types = restore_object(&db.types)?;

    for d in db.detached.iter() {
        h.detached.put(
            NodeId::new(&d.node_id),
            crate::hierarchy::detached::DetachedStore::in_mem(d.blob.clone()),
        );
    }

    for m in db.markers.iter() {
        let sub_id = match m.sub_id.as_slice().try_into() {
            Ok(sub_id) => sub_id,
            Err(_) => return err_at!(InvalidInput, msg: "marker sub id"),
        };
        let spec = MarkerSpec {
            sub_id,
            marker_id: m.marker_id,
            flags: m.flags as u16,
            node_id: NodeId::new(&m.node_id),
            event_type: match m.trigger {
                -1 => None,
                t => Some(TriggerType::from_u8(t as u8)?),
            },
            dir: TraversalDir::from_bits(m.dir_bits as u16)?,
            ref_field: nonempty(&m.ref_field),
            dir_expression: nonempty(&m.dir_expression),
            filter: nonempty(&m.filter),
            filter_regs: vec![],
            fields: nonempty(&m.fields),
            alias: nonempty(&m.alias),
            action: MarkerAction::DeferEvent,
            action_ctx: vec![],
        };
        subscriptions::add_marker(&mut h, spec)?;
        let key = subscriptions::MarkerKey { sub_id, marker_id: m.marker_id };
        subscriptions::refresh_marker(&mut h, &key).ok();
    }
    subscriptions::destroy_deferred_events(&mut h);

    Ok(h)
}

#[cfg(test)]
#[path = "snapshot_test.rs"]
mod snapshot_test;
