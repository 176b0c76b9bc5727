//! Mapping between domain records and their Redis representation.
//!
//! Run metadata is a flat hash of strings, node states are one JSON blob per
//! run and events are stream entries whose id is `{seq}-0`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::domain::{Event, NodeState, RunMeta};
use crate::storage::{StoreError, StoreResult};

/// Redis keys of one run. All share the run's TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKeys {
    pub meta: String,
    pub seq: String,
    pub events: String,
    pub nodes: String,
    pub outputs: String,
    pub plan: String,
}

impl RunKeys {
    pub fn new(prefix: &str, run_id: &str) -> Self {
        let key = |suffix: &str| format!("{}:{}:{}", prefix, run_id, suffix);
        Self {
            meta: key("meta"),
            seq: key("seq"),
            events: key("events"),
            nodes: key("nodes"),
            outputs: key("outputs"),
            plan: key("plan"),
        }
    }

    /// Every key in the order the Lua scripts expect them.
    pub fn all(&self) -> [&str; 6] {
        [
            &self.meta,
            &self.seq,
            &self.events,
            &self.nodes,
            &self.outputs,
            &self.plan,
        ]
    }
}

/// `SCAN MATCH` pattern for every run's metadata key. Glob characters in the
/// prefix match literally.
pub fn meta_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 8);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str(":*:meta");
    pattern
}

/// Recover the run id from a metadata key. Keys under a nested prefix
/// (`{prefix}:other:{id}:meta`) are not runs of this store.
pub fn run_id_from_meta_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)?
        .strip_prefix(':')?
        .strip_suffix(":meta")
        .filter(|id| !id.is_empty() && !id.contains(':'))
}

pub fn fmt_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_time(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

fn parse_opt_time(raw: Option<&String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.filter(|s| !s.is_empty())
        .map(|s| parse_time(s))
        .transpose()
}

pub fn stream_id(seq: u64) -> String {
    format!("{}-0", seq)
}

pub fn parse_stream_id(id: &str) -> Option<u64> {
    id.split_once('-')
        .map_or(id, |(ms, _)| ms)
        .parse()
        .ok()
}

/// Hash fields written when a run is created.
pub fn meta_fields(meta: &RunMeta) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("id", meta.id.clone()),
        ("name", meta.name.clone()),
        ("status", meta.status.to_string()),
        ("cancelled", if meta.cancelled { "1" } else { "0" }.to_string()),
        ("created_at", fmt_time(&meta.created_at)),
        ("updated_at", fmt_time(&meta.updated_at)),
    ];
    if let Some(ref at) = meta.started_at {
        fields.push(("started_at", fmt_time(at)));
    }
    if let Some(ref at) = meta.finished_at {
        fields.push(("finished_at", fmt_time(at)));
    }
    if let Some(ref error) = meta.error {
        fields.push(("error", error.clone()));
    }
    fields
}

/// Decode a metadata hash. An empty hash means the run does not exist.
pub fn decode_meta(run_id: &str, fields: HashMap<String, String>) -> StoreResult<Option<RunMeta>> {
    if fields.is_empty() {
        return Ok(None);
    }
    let required = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| StoreError::Corrupt(format!("run {} meta lacks {}", run_id, name)))
    };

    let status = required("status")?
        .parse()
        .map_err(StoreError::Corrupt)?;
    Ok(Some(RunMeta {
        id: fields.get("id").cloned().unwrap_or_else(|| run_id.to_string()),
        name: fields.get("name").cloned().unwrap_or_default(),
        status,
        started_at: parse_opt_time(fields.get("started_at"))?,
        finished_at: parse_opt_time(fields.get("finished_at"))?,
        error: fields.get("error").filter(|e| !e.is_empty()).cloned(),
        cancelled: fields.get("cancelled").is_some_and(|c| c == "1"),
        created_at: parse_time(required("created_at")?)?,
        updated_at: parse_time(required("updated_at")?)?,
    }))
}

pub type NodeBlob = BTreeMap<String, NodeState>;

pub fn decode_nodes(raw: Option<String>) -> StoreResult<NodeBlob> {
    match raw {
        Some(json) if !json.is_empty() => Ok(serde_json::from_str(&json)?),
        _ => Ok(NodeBlob::new()),
    }
}

/// Raw stream entry: id plus a flat field/value list.
pub type StreamEntry = (String, Vec<String>);

pub fn decode_event(run_id: &str, (id, flat): StreamEntry) -> StoreResult<Event> {
    let seq = parse_stream_id(&id)
        .ok_or_else(|| StoreError::Corrupt(format!("bad stream id {:?}", id)))?;
    let fields: HashMap<&str, &str> = flat
        .chunks_exact(2)
        .map(|pair| (pair[0].as_str(), pair[1].as_str()))
        .collect();
    let field = |name: &str| {
        fields
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::Corrupt(format!("event {} lacks {}", id, name)))
    };

    let event_type = field("type")?.parse().map_err(StoreError::Corrupt)?;
    let data = match fields.get("data") {
        Some(raw) => serde_json::from_str(raw)?,
        None => serde_json::Value::Null,
    };
    Ok(Event {
        seq,
        run_id: run_id.to_string(),
        event_type,
        node_id: fields.get("node_id").map(|n| n.to_string()),
        timestamp: parse_time(field("timestamp")?)?,
        data,
    })
}

pub fn decode_events(run_id: &str, entries: Vec<StreamEntry>) -> StoreResult<Vec<Event>> {
    entries
        .into_iter()
        .map(|entry| decode_event(run_id, entry))
        .collect()
}
