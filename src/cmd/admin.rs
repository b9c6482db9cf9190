//! Administrative commands: ping, echo, lscmd, config, loglevel.

use log::LevelFilter;

use crate::{config::CONFIG_KEYS, hierarchy::SelvaHierarchy, proto::Value, Result};

use super::ArgCursor;

pub fn cmd_ping(_h: &mut SelvaHierarchy, _args: &[Value]) -> Result<Vec<Value>> {
    Ok(vec![Value::str("pong")])
}

pub fn cmd_echo(_h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    Ok(args.to_vec())
}

pub fn cmd_lscmd(_h: &mut SelvaHierarchy, _args: &[Value]) -> Result<Vec<Value>> {
    let rows: Vec<Value> = super::command_table()
        .into_iter()
        .map(|(id, name)| Value::Array(vec![Value::LongLong(id as i64), Value::str(name)]))
        .collect();
    Ok(vec![Value::Array(rows)])
}

/// `config` lists all keys, `config key` reads one, `config key value`
/// writes one.
pub fn cmd_config(h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    if cursor.is_done() {
        let rows: Vec<Value> = CONFIG_KEYS
            .iter()
            .map(|key| {
                let value = h.config().get(key).unwrap_or_default();
                Value::str(&format!("{}={}", key, value))
            })
            .collect();
        return Ok(vec![Value::Array(rows)]);
    }
    let key = cursor.next_str()?.to_string();
    if cursor.is_done() {
        let value = h.config().get(&key)?;
        Ok(vec![Value::str(&value)])
    } else {
        let value = cursor.next_str()?.to_string();
        h.config_mut().set(&key, &value)?;
        Ok(vec![Value::LongLong(1)])
    }
}

/// `loglevel N` with 0=off .. 5=trace.
pub fn cmd_loglevel(_h: &mut SelvaHierarchy, args: &[Value]) -> Result<Vec<Value>> {
    let mut cursor = ArgCursor::new(args);
    let level = match cursor.next_ll()? {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        5 => LevelFilter::Trace,
        v => return err_at!(InvalidInput, msg: "log level {}", v),
    };
    log::set_max_level(level);
    Ok(vec![Value::LongLong(1)])
}
