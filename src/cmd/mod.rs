//! Module implement the command surface.
//!
//! A server loop decodes a request frame into [proto::Value]s and hands
//! them to [dispatch] with the command id from the frame header. Every
//! command parses its arguments into typed options, runs against the
//! hierarchy and returns reply values; deferred subscription events are
//! flushed after the reply is built.

use std::convert::TryFrom;

use crate::{
    hierarchy::{
        order::ResultOrder,
        traversal::TraversalDir,
        SelvaHierarchy,
    },
    proto::Value,
    rpn::{RpnExpression, RpnValue},
    subscriptions,
    types::{self, NodeId},
    Result,
};

pub mod admin;
pub mod aggregate;
pub mod find;
pub mod index;
pub mod subscribe;
pub mod update;

/// Stable command ids.
pub const CMD_PING: u8 = 0;
pub const CMD_ECHO: u8 = 1;
pub const CMD_LSCMD: u8 = 2;
pub const CMD_CONFIG: u8 = 3;
pub const CMD_LOGLEVEL: u8 = 4;
pub const CMD_FIND: u8 = 16;
pub const CMD_AGGREGATE: u8 = 17;
pub const CMD_UPDATE: u8 = 18;
pub const CMD_HIERARCHY_DEL: u8 = 19;
pub const CMD_SUB_ADD: u8 = 32;
pub const CMD_SUB_ADD_ALIAS: u8 = 33;
pub const CMD_SUB_ADD_MISSING: u8 = 34;
pub const CMD_SUB_ADD_TRIGGER: u8 = 35;
pub const CMD_SUB_REFRESH: u8 = 36;
pub const CMD_SUB_LIST: u8 = 37;
pub const CMD_SUB_LIST_MISSING: u8 = 38;
pub const CMD_SUB_DEBUG: u8 = 39;
pub const CMD_SUB_DEL: u8 = 40;
pub const CMD_SUB_DEL_MARKER: u8 = 41;
pub const CMD_INDEX_LIST: u8 = 48;
pub const CMD_INDEX_NEW: u8 = 49;
pub const CMD_INDEX_DEL: u8 = 50;
pub const CMD_INDEX_DEBUG: u8 = 51;
pub const CMD_INDEX_INFO: u8 = 52;

/// The command table, `(id, name)`, as listed by `lscmd`.
pub fn command_table() -> Vec<(u8, &'static str)> {
    vec![
        (CMD_PING, "ping"),
        (CMD_ECHO, "echo"),
        (CMD_LSCMD, "lscmd"),
        (CMD_CONFIG, "config"),
        (CMD_LOGLEVEL, "loglevel"),
        (CMD_FIND, "hierarchy.find"),
        (CMD_AGGREGATE, "hierarchy.aggregate"),
        (CMD_UPDATE, "update"),
        (CMD_HIERARCHY_DEL, "hierarchy.del"),
        (CMD_SUB_ADD, "subscriptions.add"),
        (CMD_SUB_ADD_ALIAS, "subscriptions.addAlias"),
        (CMD_SUB_ADD_MISSING, "subscriptions.addMissing"),
        (CMD_SUB_ADD_TRIGGER, "subscriptions.addTrigger"),
        (CMD_SUB_REFRESH, "subscriptions.refresh"),
        (CMD_SUB_LIST, "subscriptions.list"),
        (CMD_SUB_LIST_MISSING, "subscriptions.listMissing"),
        (CMD_SUB_DEBUG, "subscriptions.debug"),
        (CMD_SUB_DEL, "subscriptions.del"),
        (CMD_SUB_DEL_MARKER, "subscriptions.delMarker"),
        (CMD_INDEX_LIST, "index.list"),
        (CMD_INDEX_NEW, "index.new"),
        (CMD_INDEX_DEL, "index.del"),
        (CMD_INDEX_DEBUG, "index.debug"),
        (CMD_INDEX_INFO, "index.info"),
    ]
}

/// Demux a decoded request to its command handler. Errors frame as a
/// single error value. Deferred subscription events flush after the
/// reply is built, in mutation order, deduplicated per batch.
pub fn dispatch(h: &mut SelvaHierarchy, cmd: u8, args: &[Value]) -> Vec<Value> {
    let result = match cmd {
        CMD_PING => admin::cmd_ping(h, args),
        CMD_ECHO => admin::cmd_echo(h, args),
        CMD_LSCMD => admin::cmd_lscmd(h, args),
        CMD_CONFIG => admin::cmd_config(h, args),
        CMD_LOGLEVEL => admin::cmd_loglevel(h, args),
        CMD_FIND => find::cmd_find(h, args),
        CMD_AGGREGATE => aggregate::cmd_aggregate(h, args),
        CMD_UPDATE => update::cmd_update(h, args),
        CMD_HIERARCHY_DEL => update::cmd_del_node(h, args),
        CMD_SUB_ADD => subscribe::cmd_add(h, args),
        CMD_SUB_ADD_ALIAS => subscribe::cmd_add_alias(h, args),
        CMD_SUB_ADD_MISSING => subscribe::cmd_add_missing(h, args),
        CMD_SUB_ADD_TRIGGER => subscribe::cmd_add_trigger(h, args),
        CMD_SUB_REFRESH => subscribe::cmd_refresh(h, args),
        CMD_SUB_LIST => subscribe::cmd_list(h, args),
        CMD_SUB_LIST_MISSING => subscribe::cmd_list_missing(h, args),
        CMD_SUB_DEBUG => subscribe::cmd_debug(h, args),
        CMD_SUB_DEL => subscribe::cmd_del(h, args),
        CMD_SUB_DEL_MARKER => subscribe::cmd_del_marker(h, args),
        CMD_INDEX_LIST => index::cmd_list(h, args),
        CMD_INDEX_NEW => index::cmd_new(h, args),
        CMD_INDEX_DEL => index::cmd_del(h, args),
        CMD_INDEX_DEBUG => index::cmd_debug(h, args),
        CMD_INDEX_INFO => index::cmd_info(h, args),
        _ => err_at!(InvalidInput, msg: "unknown command {}", cmd),
    };
    let reply = match result {
        Ok(values) => values,
        Err(err) => vec![Value::from_err(&err)],
    };
    subscriptions::send_deferred_events(h);
    reply
}

/// Cursor over the argument values of one command.
pub struct ArgCursor<'a> {
    args: &'a [Value],
    pos: usize,
}

impl<'a> ArgCursor<'a> {
    pub fn new(args: &'a [Value]) -> ArgCursor<'a> {
        ArgCursor { args, pos: 0 }
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.args.len()
    }

    pub fn remaining(&self) -> usize {
        self.args.len() - self.pos
    }

    pub fn next(&mut self) -> Result<&'a Value> {
        match self.args.get(self.pos) {
            Some(v) => {
                self.pos += 1;
                Ok(v)
            }
            None => err_at!(InvalidInput, msg: "missing argument at {}", self.pos),
        }
    }

    pub fn next_str(&mut self) -> Result<&'a str> {
        self.next()?.as_str()
    }

    pub fn next_data(&mut self) -> Result<Vec<u8>> {
        self.next()?.to_data()
    }

    pub fn next_ll(&mut self) -> Result<i64> {
        self.next()?.to_long_long()
    }

    pub fn peek_str(&self) -> Option<&'a str> {
        self.args.get(self.pos).and_then(|v| v.as_str().ok())
    }

    /// Consume the next argument when it equals `token`.
    pub fn accept(&mut self, token: &str) -> bool {
        if self.peek_str() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

/// Result merge strategies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MergeStrategy {
    None,
    All,
    /// `merge` with a fields list present.
    Named,
    Deep,
}

/// Parsed options shared by `hierarchy.find`, `hierarchy.aggregate` and
/// `update`.
pub struct QueryOpts {
    pub lang: String,
    pub dir: TraversalDir,
    pub ref_field: Option<String>,
    pub dir_expression: Option<(RpnExpression, String)>,
    pub edge_filter: Option<RpnExpression>,
    pub index_hints: Vec<String>,
    pub order: ResultOrder,
    pub order_field: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub merge: MergeStrategy,
    pub merge_path: Option<String>,
    pub fields: Option<Vec<String>>,
    pub fields_expression: Option<RpnExpression>,
    pub inherit: Vec<String>,
    pub node_ids: Vec<NodeId>,
    pub filter: Option<(RpnExpression, String)>,
    pub filter_regs: Vec<(usize, RpnValue)>,
}

impl QueryOpts {
    pub fn langs(&self) -> Vec<&str> {
        self.lang.split(',').filter(|s| !s.is_empty()).collect()
    }
}

// Split a fields list argument: newline separated names with an
// optional `N=` list prefix.
fn parse_fields_list(arg: &str) -> Vec<String> {
    arg.split('\n')
        .filter(|s| !s.is_empty())
        .map(|s| match s.split_once('=') {
            Some((prefix, name)) if prefix.chars().all(|c| c.is_ascii_digit()) => {
                name.to_string()
            }
            _ => s.to_string(),
        })
        .collect()
}

/// Parse the shared query option grammar:
/// `lang dir [ref_field|expr] [edge_filter e] [index hint]*
///  [order field asc|desc] [offset N] [limit N] [merge|deepMerge path]
///  [fields list|fields_rpn expr] [inherit list] node_ids
///  [filter_expr filter_args...]`.
pub fn parse_query_opts(cursor: &mut ArgCursor, with_lang: bool) -> Result<QueryOpts> {
    parse_query_opts_inner(cursor, with_lang, &mut None)
}

/// The aggregate variant of the grammar carries the aggregate function
/// code as the last positional before the node ids.
pub(crate) fn parse_query_opts_agg(
    cursor: &mut ArgCursor,
    with_lang: bool,
) -> Result<(QueryOpts, i64)> {
    let mut agg = Some(0);
    let opts = parse_query_opts_inner(cursor, with_lang, &mut agg)?;
    Ok((opts, agg.unwrap()))
}

fn parse_query_opts_inner(
    cursor: &mut ArgCursor,
    with_lang: bool,
    agg: &mut Option<i64>,
) -> Result<QueryOpts> {
    let lang = if with_lang { cursor.next_str()?.to_string() } else { String::new() };
    let dir = TraversalDir::from_token(cursor.next_str()?)?;

    let mut ref_field = None;
    let mut dir_expression = None;
    if dir.needs_field() {
        ref_field = Some(cursor.next_str()?.to_string());
    } else if dir.needs_expression() {
        let src = cursor.next_str()?.to_string();
        dir_expression = Some((RpnExpression::compile(&src)?, src));
    }

    let mut edge_filter = None;
    if cursor.accept("edge_filter") {
        edge_filter = Some(RpnExpression::compile(cursor.next_str()?)?);
    }

    let mut index_hints = vec![];
    while cursor.accept("index") {
        index_hints.push(cursor.next_str()?.to_string());
    }

    let (mut order, mut order_field) = (ResultOrder::None, None);
    if cursor.accept("order") {
        let field = cursor.next_str()?.to_string();
        order = ResultOrder::from_token(cursor.next_str()?)?;
        if order != ResultOrder::None {
            order_field = Some(field);
        }
    }

    let mut offset = 0;
    if cursor.accept("offset") {
        let v = cursor.next_ll()?;
        offset = err_at!(RangeError, usize::try_from(v), "offset")?;
    }

    let mut limit = None;
    if cursor.accept("limit") {
        let v = cursor.next_ll()?;
        if v >= 0 {
            limit = Some(v as usize);
        }
    }

    let mut merge = MergeStrategy::None;
    let mut merge_path = None;
    if cursor.accept("merge") {
        merge = MergeStrategy::All;
        merge_path = Some(cursor.next_str()?.to_string());
    } else if cursor.accept("deepMerge") {
        merge = MergeStrategy::Deep;
        merge_path = Some(cursor.next_str()?.to_string());
    }

    let mut fields = None;
    let mut fields_expression = None;
    if cursor.accept("fields") {
        fields = Some(parse_fields_list(cursor.next_str()?));
        if merge == MergeStrategy::All {
            // an explicit fields list turns merge into a named merge
            merge = MergeStrategy::Named;
        }
    } else if cursor.accept("fields_rpn") {
        fields_expression = Some(RpnExpression::compile(cursor.next_str()?)?);
    }

    let mut inherit = vec![];
    if cursor.accept("inherit") {
        inherit = parse_fields_list(cursor.next_str()?);
    }

    if agg.is_some() {
        *agg = Some(cursor.next_ll()?);
    }

    let node_ids = types::node_ids_from_arg(&cursor.next_data()?)?;

    let mut filter = None;
    let mut filter_regs = vec![];
    if !cursor.is_done() {
        let src = cursor.next_str()?.to_string();
        filter = Some((RpnExpression::compile(&src)?, src));
        let mut reg = 1;
        while !cursor.is_done() {
            let value = match cursor.next()? {
                Value::LongLong(v) => RpnValue::Num(*v as f64),
                Value::Double(v) => RpnValue::Num(*v),
                v => RpnValue::Str(v.to_data()?),
            };
            filter_regs.push((reg, value));
            reg += 1;
        }
    }

    Ok(QueryOpts {
        lang,
        dir,
        ref_field,
        dir_expression,
        edge_filter,
        index_hints,
        order,
        order_field,
        offset,
        limit,
        merge,
        merge_path,
        fields,
        fields_expression,
        inherit,
        node_ids,
        filter,
        filter_regs,
    })
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
