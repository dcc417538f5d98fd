//! Deterministic bounding of tool output before it re-enters reasoning.
//!
//! Every result passes through redaction first, then one of three shapes:
//! trees (nodes carrying a `children` array), listings, or free text.

pub mod truncate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::GuardConfig;
use crate::domain::tool::{Backend, ToolPayload, ToolResult};

pub use truncate::{truncate_text, TruncatedText};

pub const REDACTED: &str = "[redacted]";
const LISTING_KEYS: [&str; 5] = ["records", "items", "results", "entries", "files"];
const TOTAL_KEYS: [&str; 3] = ["totalSize", "total_count", "total"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardPolicy {
    pub max_items: usize,
    pub max_bytes: usize,
    pub max_depth: usize,
    pub redact: Vec<String>,
}

impl GuardPolicy {
    pub fn defaults_for(backend: Backend) -> Self {
        let (max_items, max_bytes, max_depth) = match backend {
            Backend::Crm => (25, 8_000, 3),
            Backend::RepoHost => (30, 12_000, 3),
            Backend::Filesystem => (50, 16_000, 2),
        };
        Self { max_items, max_bytes, max_depth, redact: default_redactions() }
    }

    fn redacts(&self, key: &str) -> bool {
        self.redact.iter().any(|candidate| candidate.eq_ignore_ascii_case(key))
    }
}

pub fn default_redactions() -> Vec<String> {
    ["access_token", "refresh_token", "password", "api_key"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundedResult {
    pub content: ToolPayload,
    pub truncated: bool,
    pub total_items: Option<usize>,
    pub shown_items: Option<usize>,
}

impl BoundedResult {
    /// Renders the bounded content for prompts and raw-output appendices.
    pub fn render(&self) -> String {
        match &self.content {
            ToolPayload::Text(text) => text.clone(),
            ToolPayload::Json(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{backend} result rejected: depth {depth} exceeds {max_depth}")]
pub struct GuardRejected {
    pub backend: Backend,
    pub depth: usize,
    pub max_depth: usize,
    pub guidance: String,
}

/// Holds one immutable policy per backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputGuard {
    policies: BTreeMap<Backend, GuardPolicy>,
}

impl Default for OutputGuard {
    fn default() -> Self {
        Self::new(
            Backend::ALL.into_iter().map(|backend| (backend, GuardPolicy::defaults_for(backend))),
        )
    }
}

impl OutputGuard {
    pub fn new(policies: impl IntoIterator<Item = (Backend, GuardPolicy)>) -> Self {
        let mut map: BTreeMap<Backend, GuardPolicy> = policies.into_iter().collect();
        for backend in Backend::ALL {
            map.entry(backend).or_insert_with(|| GuardPolicy::defaults_for(backend));
        }
        Self { policies: map }
    }

    pub fn from_config(config: &GuardConfig) -> Self {
        let policies = Backend::ALL.map(|backend| (backend, config.policy(backend).clone()));
        Self::new(policies)
    }

    pub fn policy(&self, backend: Backend) -> GuardPolicy {
        self.policies
            .get(&backend)
            .cloned()
            .unwrap_or_else(|| GuardPolicy::defaults_for(backend))
    }

    pub fn reduce(
        &self,
        backend: Backend,
        result: ToolResult,
    ) -> Result<BoundedResult, GuardRejected> {
        let policy = self.policy(backend);

        let value = match result.payload {
            ToolPayload::Json(value) => value,
            ToolPayload::Text(text) => match parse_embedded_json(&text) {
                Some(value) => value,
                None => return Ok(reduce_text(&policy, &text)),
            },
        };
        let value = redact(value, &policy);

        let depth = tree_depth(&value);
        if depth > 0 {
            if backend == Backend::Filesystem && depth > policy.max_depth {
                return Err(GuardRejected {
                    backend,
                    depth,
                    max_depth: policy.max_depth,
                    guidance: format!(
                        "That directory tree is {depth} levels deep, more than the {} I can \
                         show. Ask for a specific subdirectory, or list a single folder instead \
                         of the full tree.",
                        policy.max_depth
                    ),
                });
            }
            return Ok(reduce_tree(&policy, value));
        }

        if let Some(bounded) = reduce_listing(&policy, &value) {
            return Ok(bounded);
        }

        Ok(reduce_serialized(&policy, &value))
    }
}

fn parse_embedded_json(text: &str) -> Option<Value> {
    let trimmed = text.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn redact(value: Value, policy: &GuardPolicy) -> Value {
    if policy.redact.is_empty() {
        return value;
    }
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, inner)| {
                    if policy.redacts(&key) {
                        (key, Value::String(REDACTED.to_owned()))
                    } else {
                        (key, redact(inner, policy))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|item| redact(item, policy)).collect())
        }
        other => other,
    }
}

fn children(value: &Value) -> Option<&Vec<Value>> {
    value.as_object()?.get("children")?.as_array()
}

/// Depth of a tree-shaped value, or 0 when no node carries `children`.
fn tree_depth(value: &Value) -> usize {
    fn node_depth(node: &Value) -> usize {
        let deepest_child =
            children(node).and_then(|kids| kids.iter().map(node_depth).max()).unwrap_or(0);
        1 + deepest_child
    }

    match value {
        Value::Array(nodes) if nodes.iter().any(|node| children(node).is_some()) => {
            nodes.iter().map(node_depth).max().unwrap_or(0)
        }
        Value::Object(_) if children(value).is_some() => node_depth(value),
        _ => 0,
    }
}

fn reduce_tree(policy: &GuardPolicy, value: Value) -> BoundedResult {
    fn cap_level(
        nodes: Vec<Value>,
        max_items: usize,
        dropped: &mut usize,
        seen: &mut usize,
    ) -> Vec<Value> {
        *seen += nodes.len();
        if nodes.len() > max_items {
            *dropped += nodes.len() - max_items;
        }
        nodes
            .into_iter()
            .take(max_items)
            .map(|node| cap_node(node, max_items, dropped, seen))
            .collect()
    }

    fn cap_node(node: Value, max_items: usize, dropped: &mut usize, seen: &mut usize) -> Value {
        match node {
            Value::Object(mut map) => {
                if let Some(Value::Array(kids)) = map.get_mut("children") {
                    let level = std::mem::take(kids);
                    *kids = cap_level(level, max_items, dropped, seen);
                }
                Value::Object(map)
            }
            other => other,
        }
    }

    let mut dropped = 0;
    let mut seen = 0;
    let capped = match value {
        Value::Array(nodes) => {
            Value::Array(cap_level(nodes, policy.max_items, &mut dropped, &mut seen))
        }
        node => {
            seen += 1;
            cap_node(node, policy.max_items, &mut dropped, &mut seen)
        }
    };

    let mut bounded = fit_json(policy, capped);
    if dropped > 0 {
        bounded.truncated = true;
    }
    bounded.total_items = Some(seen);
    bounded.shown_items = Some(seen - dropped);
    bounded
}

fn reduce_listing(policy: &GuardPolicy, value: &Value) -> Option<BoundedResult> {
    match value {
        Value::Array(items) => Some(bound_items(policy, items, None, Value::Array)),
        Value::Object(map) => {
            let key =
                LISTING_KEYS.iter().find(|key| map.get(**key).is_some_and(Value::is_array))?;
            let items = map.get(*key).and_then(Value::as_array)?;
            let hint = TOTAL_KEYS
                .iter()
                .find_map(|total| map.get(*total).and_then(Value::as_u64))
                .and_then(|total| usize::try_from(total).ok());
            Some(bound_items(policy, items, hint, |shown| {
                let mut wrapper: Map<String, Value> = map.clone();
                wrapper.insert((*key).to_owned(), Value::Array(shown));
                Value::Object(wrapper)
            }))
        }
        _ => None,
    }
}

fn bound_items(
    policy: &GuardPolicy,
    items: &[Value],
    total_hint: Option<usize>,
    rebuild: impl Fn(Vec<Value>) -> Value,
) -> BoundedResult {
    let total = total_hint.unwrap_or(items.len()).max(items.len());
    let mut shown = items.len().min(policy.max_items);

    // Drop trailing items until the serialized listing fits the byte cap.
    let mut rendered = rebuild(items[..shown].to_vec());
    while shown > 0 && rendered.to_string().len() > policy.max_bytes {
        shown -= 1;
        rendered = rebuild(items[..shown].to_vec());
    }

    BoundedResult {
        content: ToolPayload::Json(rendered),
        truncated: shown < total,
        total_items: Some(total),
        shown_items: Some(shown),
    }
}

fn is_text_listing(text: &str) -> bool {
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty()).peekable();
    lines.peek().is_some()
        && lines.all(|line| line.starts_with("[FILE]") || line.starts_with("[DIR]"))
}

fn reduce_text(policy: &GuardPolicy, text: &str) -> BoundedResult {
    if is_text_listing(text) {
        let entries: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
        let total = entries.len();
        let shown = total.min(policy.max_items);
        let joined = entries[..shown].join("\n");
        let capped = truncate_text(&joined, policy.max_bytes);
        return BoundedResult {
            content: ToolPayload::Text(capped.text),
            truncated: shown < total || capped.truncated,
            total_items: Some(total),
            shown_items: Some(shown),
        };
    }

    let capped = truncate_text(text, policy.max_bytes);
    BoundedResult {
        content: ToolPayload::Text(capped.text),
        truncated: capped.truncated,
        total_items: None,
        shown_items: None,
    }
}

fn fit_json(policy: &GuardPolicy, value: Value) -> BoundedResult {
    if value.to_string().len() <= policy.max_bytes {
        return BoundedResult {
            content: ToolPayload::Json(value),
            truncated: false,
            total_items: None,
            shown_items: None,
        };
    }
    reduce_serialized(policy, &value)
}

fn reduce_serialized(policy: &GuardPolicy, value: &Value) -> BoundedResult {
    if let Value::String(text) = value {
        return reduce_text(policy, text);
    }
    let serialized = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    if serialized.len() <= policy.max_bytes {
        return BoundedResult {
            content: ToolPayload::Json(value.clone()),
            truncated: false,
            total_items: None,
            shown_items: None,
        };
    }
    let capped = truncate_text(&serialized, policy.max_bytes);
    BoundedResult {
        content: ToolPayload::Text(capped.text),
        truncated: true,
        total_items: None,
        shown_items: None,
    }
}
