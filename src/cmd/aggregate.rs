//! The `hierarchy.aggregate` command.

use std::collections::BTreeSet;

use crate::{
    hierarchy::{traversal, SelvaHierarchy},
    object::ValueView,
    proto::Value,
    types::NodeId,
    Result,
};

use super::{find, ArgCursor};

// Aggregate function codes.
const AGG_COUNT: i64 = 0;
const AGG_COUNT_UNIQUE: i64 = 1;
const AGG_SUM: i64 = 2;
const AGG_AVG: i64 = 3;
const AGG_MIN: i64 = 4;
const AGG_MAX: i64 = 5;

pub fn cmd_aggregate(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let (opts, agg_fn) = super::parse_query_opts_agg(&mut cursor, true)?;

    if matches!(
        opts.dir,
        crate::hierarchy::traversal::TraversalDir::Array
            | crate::hierarchy::traversal::TraversalDir::Set
    ) {
        return field_aggregate(h, &opts, agg_fn);
    }

    let ids = find::matched_ids(h, &opts)?;
    let langs = opts.langs();

    let agg_field = opts.fields.as_ref().and_then(|fields| fields.first().cloned());

    let reply = match agg_fn {
        AGG_COUNT => Value::LongLong(ids.len() as i64),
        AGG_COUNT_UNIQUE => {
            let field = match &agg_field {
                Some(field) => field,
                None => return err_at!(InvalidInput, msg: "count-unique needs a field"),
            };
            let mut uniq: BTreeSet<Vec<u8>> = BTreeSet::new();
            for id in ids.iter() {
                let walked = traversal::foreach_in_field(h, id, field, &mut |v| {
                    uniq.insert(match v {
                        traversal::FieldValue::Id(id) => id.trimmed().to_vec(),
                        traversal::FieldValue::Str(s) => s,
                        traversal::FieldValue::Double(d) => format!("{}", d).into_bytes(),
                        traversal::FieldValue::LongLong(v) => format!("{}", v).into_bytes(),
                    });
                    Ok(())
                });
                if walked.is_ok() {
                    continue;
                }
                // scalar fields count their single value
                let node = match h.node(id) {
                    Some(node) => node,
                    None => continue,
                };
                match node.obj().get_any_lang(field, &langs) {
                    Ok(ValueView::Double(v)) => {
                        uniq.insert(format!("{}", v).into_bytes());
                    }
                    Ok(ValueView::LongLong(v)) => {
                        uniq.insert(format!("{}", v).into_bytes());
                    }
                    Ok(ValueView::Str(s)) => {
                        uniq.insert(s.as_bytes().to_vec());
                    }
                    _ => (),
                }
            }
            Value::LongLong(uniq.len() as i64)
        }
        AGG_SUM | AGG_AVG | AGG_MIN | AGG_MAX => {
            let field = match &agg_field {
                Some(field) => field,
                None => return err_at!(InvalidInput, msg: "numeric aggregate needs a field"),
            };
            let values = numeric_values(h, &ids, field, &langs);
            match agg_fn {
                AGG_SUM => Value::Double(values.iter().sum()),
                AGG_AVG => {
                    if values.is_empty() {
                        Value::Double(0.0)
                    } else {
                        Value::Double(values.iter().sum::<f64>() / values.len() as f64)
                    }
                }
                AGG_MIN => Value::Double(values.iter().cloned().fold(f64::INFINITY, f64::min)),
                _ => Value::Double(values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)),
            }
        }
        code => return err_at!(InvalidInput, msg: "aggregate function {}", code),
    };
    Ok(vec![reply])
}

// Aggregate directly over the values of an array or set field.
fn field_aggregate(h: &SelvaHierarchy, opts: &super::QueryOpts, agg_fn: i64) -> Result<Vec<Value>> {
    let field = match &opts.ref_field {
        Some(field) => field,
        None => return err_at!(InvalidInput, msg: "field traversal needs a field"),
    };
    let mut count = 0_usize;
    let mut uniq: BTreeSet<Vec<u8>> = BTreeSet::new();
    let mut values: Vec<f64> = vec![];
    for start in opts.node_ids.iter() {
        traversal::foreach_in_field(h, start, field, &mut |v| {
            count += 1;
            match v {
                traversal::FieldValue::Double(d) => {
                    values.push(d);
                    uniq.insert(format!("{}", d).into_bytes());
                }
                traversal::FieldValue::LongLong(v) => {
                    values.push(v as f64);
                    uniq.insert(format!("{}", v).into_bytes());
                }
                traversal::FieldValue::Str(s) => {
                    uniq.insert(s);
                }
                traversal::FieldValue::Id(id) => {
                    uniq.insert(id.trimmed().to_vec());
                }
            }
            Ok(())
        })
        .ok();
    }
    let reply = match agg_fn {
        AGG_COUNT => Value::LongLong(count as i64),
        AGG_COUNT_UNIQUE => Value::LongLong(uniq.len() as i64),
        AGG_SUM => Value::Double(values.iter().sum()),
        AGG_AVG if values.is_empty() => Value::Double(0.0),
        AGG_AVG => Value::Double(values.iter().sum::<f64>() / values.len() as f64),
        AGG_MIN => Value::Double(values.iter().cloned().fold(f64::INFINITY, f64::min)),
        AGG_MAX => Value::Double(values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)),
        code => return err_at!(InvalidInput, msg: "aggregate function {}", code),
    };
    Ok(vec![reply])
}

fn numeric_values(h: &SelvaHierarchy, ids: &[NodeId], field: &str, langs: &[&str]) -> Vec<f64> {
    let mut values = vec![];
    for id in ids {
        let node = match h.node(id) {
            Some(node) => node,
            None => continue,
        };
        match node.obj().get_any_lang(field, langs) {
            Ok(ValueView::Double(v)) => values.push(v),
            Ok(ValueView::LongLong(v)) => values.push(v as f64),
            _ => (),
        }
    }
    values
}
