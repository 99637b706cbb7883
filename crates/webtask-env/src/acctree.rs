//! Turns the raw CDP payloads (full accessibility tree + DOM snapshot)
//! into the line-oriented text observation the agent reads, plus a
//! registry mapping the printed element ids back to screen coordinates
//! for click targeting.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

/// Accessibility properties that add noise without informing the agent.
const IGNORED_PROPERTIES: &[&str] = &[
    "focusable",
    "editable",
    "readonly",
    "level",
    "settable",
    "multiline",
    "invalid",
];

/// Wrapper roles that carry no name and no properties and so print as
/// blank lines.
const SKIPPABLE_EMPTY_ROLES: &[&str] = &[
    "generic",
    "img",
    "list",
    "strong",
    "paragraph",
    "banner",
    "navigation",
    "Section",
    "LabelText",
    "Legend",
    "listitem",
];

pub use webtask_core::Viewport;

/// Visible window in page coordinates: the viewport shifted by the
/// current scroll offsets.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScrollOffset {
    pub x: f64,
    pub y: f64,
}

/// Everything needed to act on an element the agent referred to by id.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub backend_id: i64,
    /// [x, y, width, height] in page coordinates.
    pub union_bound: [f64; 4],
    pub text: String,
}

impl NodeInfo {
    pub fn center(&self) -> (f64, f64) {
        let [x, y, w, h] = self.union_bound;
        (x + w / 2.0, y + h / 2.0)
    }
}

#[derive(Debug, Default)]
pub struct ProcessedTree {
    pub tree_text: String,
    pub nodes: HashMap<String, NodeInfo>,
}

#[derive(Debug)]
struct AxNode {
    node_id: String,
    backend_id: Option<i64>,
    role: String,
    name: String,
    properties: Vec<(String, String)>,
    child_ids: Vec<String>,
    parent_id: Option<String>,
    union_bound: Option<[f64; 4]>,
}

fn json_str(v: &Value, path: &[&str]) -> Option<String> {
    let mut cur = v;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str().map(|s| s.to_string())
}

fn property_value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_ax_nodes(ax_tree: &Value) -> Vec<AxNode> {
    let raw_nodes = ax_tree
        .get("nodes")
        .and_then(|n| n.as_array())
        .or_else(|| ax_tree.as_array());
    let Some(raw_nodes) = raw_nodes else {
        return Vec::new();
    };
    let mut seen = std::collections::HashSet::new();
    let mut nodes = Vec::new();
    for raw in raw_nodes {
        let Some(node_id) = json_str(raw, &["nodeId"]) else {
            continue;
        };
        // CDP occasionally repeats nodes; first occurrence wins.
        if !seen.insert(node_id.clone()) {
            continue;
        }
        let properties = raw
            .get("properties")
            .and_then(|p| p.as_array())
            .map(|props| {
                props
                    .iter()
                    .filter_map(|p| {
                        let name = p.get("name")?.as_str()?;
                        if IGNORED_PROPERTIES.contains(&name) {
                            return None;
                        }
                        let value = property_value_to_string(p.get("value")?.get("value")?)?;
                        Some((name.to_string(), value))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let child_ids = raw
            .get("childIds")
            .and_then(|c| c.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        nodes.push(AxNode {
            node_id,
            backend_id: raw.get("backendDOMNodeId").and_then(|b| b.as_i64()),
            role: json_str(raw, &["role", "value"]).unwrap_or_default(),
            name: json_str(raw, &["name", "value"]).unwrap_or_default(),
            properties,
            child_ids,
            parent_id: json_str(raw, &["parentId"]),
            union_bound: None,
        });
    }
    nodes
}

/// backend node id -> bounding box, from the DOM snapshot's layout
/// table. Bounds are rescaled so the document width equals the viewport
/// width, compensating for snapshots captured at a different scale.
fn backend_bounds(snapshot: &Value, viewport: Viewport) -> HashMap<i64, [f64; 4]> {
    let mut map = HashMap::new();
    let Some(document) = snapshot
        .get("documents")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
    else {
        return map;
    };
    let backend_ids: Vec<i64> = document
        .get("nodes")
        .and_then(|n| n.get("backendNodeId"))
        .and_then(|b| b.as_array())
        .map(|ids| ids.iter().filter_map(|v| v.as_i64()).collect())
        .unwrap_or_default();
    let layout = document.get("layout");
    let node_index: Vec<usize> = layout
        .and_then(|l| l.get("nodeIndex"))
        .and_then(|n| n.as_array())
        .map(|idx| idx.iter().filter_map(|v| v.as_u64().map(|u| u as usize)).collect())
        .unwrap_or_default();
    let mut bounds: Vec<[f64; 4]> = layout
        .and_then(|l| l.get("bounds"))
        .and_then(|b| b.as_array())
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    let mut rect = [0.0f64; 4];
                    if let Some(vals) = row.as_array() {
                        for (i, v) in vals.iter().take(4).enumerate() {
                            rect[i] = v.as_f64().unwrap_or(0.0);
                        }
                    }
                    rect
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some(first) = bounds.first() {
        let scale = first[2] / viewport.width;
        if scale.is_finite() && scale > 0.0 && (scale - 1.0).abs() > f64::EPSILON {
            for rect in &mut bounds {
                for v in rect.iter_mut() {
                    *v /= scale;
                }
            }
        }
    }

    for (cursor, &idx) in node_index.iter().enumerate() {
        let (Some(&backend_id), Some(&rect)) = (backend_ids.get(idx), bounds.get(cursor)) else {
            continue;
        };
        map.insert(backend_id, rect);
    }
    map
}

/// Nodes without a box of their own inherit the nearest ancestor's.
/// Deliberate approximation: a hidden node inside a visible parent gets
/// the parent's box.
fn attach_bounds(nodes: &mut [AxNode], bounds: &HashMap<i64, [f64; 4]>) {
    let index_of: HashMap<String, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.node_id.clone(), i))
        .collect();
    for node in nodes.iter_mut() {
        node.union_bound = node.backend_id.and_then(|id| bounds.get(&id).copied());
    }
    let resolved: Vec<Option<[f64; 4]>> = nodes.iter().map(|n| n.union_bound).collect();
    let parents: Vec<Option<usize>> = nodes
        .iter()
        .map(|n| {
            n.parent_id
                .as_ref()
                .and_then(|p| index_of.get(p).copied())
        })
        .collect();
    for i in 0..nodes.len() {
        if nodes[i].union_bound.is_some() || nodes[i].backend_id.is_none() {
            continue;
        }
        let mut cursor = parents[i];
        while let Some(p) = cursor {
            if let Some(rect) = resolved[p] {
                nodes[i].union_bound = Some(rect);
                break;
            }
            cursor = parents[p];
        }
    }
}

fn in_window(bound: [f64; 4], viewport: Viewport, scroll: ScrollOffset) -> bool {
    let [x, y, w, h] = bound;
    x < scroll.x + viewport.width
        && x + w >= scroll.x
        && y < scroll.y + viewport.height
        && y + h >= scroll.y
}

/// Process one snapshot pair into agent-facing text plus the id
/// registry. `current_viewport_only` limits output to elements at least
/// partially inside the scrolled window.
pub fn process_snapshot(
    ax_tree: &Value,
    dom_snapshot: &Value,
    viewport: Viewport,
    scroll: ScrollOffset,
    current_viewport_only: bool,
) -> ProcessedTree {
    let mut nodes = parse_ax_nodes(ax_tree);
    if nodes.is_empty() {
        warn!("empty accessibility tree");
        return ProcessedTree::default();
    }
    let bounds = backend_bounds(dom_snapshot, viewport);
    attach_bounds(&mut nodes, &bounds);

    if current_viewport_only {
        nodes.retain(|n| match n.union_bound {
            Some(b) => in_window(b, viewport, scroll),
            None => false,
        });
        if nodes.is_empty() {
            return ProcessedTree::default();
        }
    }

    let index_of: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.node_id.as_str(), i))
        .collect();
    let mut registry = HashMap::new();
    let mut lines = Vec::new();
    render(&nodes, &index_of, 0, 0, &mut lines, &mut registry);
    ProcessedTree {
        tree_text: dedup_static_text(&lines),
        nodes: registry,
    }
}

fn render(
    nodes: &[AxNode],
    index_of: &HashMap<&str, usize>,
    idx: usize,
    depth: usize,
    lines: &mut Vec<String>,
    registry: &mut HashMap<String, NodeInfo>,
) {
    let node = &nodes[idx];
    let mut node_str = format!("[{}] {} '{}'", node.node_id, node.role, node.name);
    for (name, value) in &node.properties {
        node_str.push_str(&format!(" {name}: {value}"));
    }

    let mut valid = !node.role.is_empty();
    if node.name.trim().is_empty() {
        if node.properties.is_empty() {
            if SKIPPABLE_EMPTY_ROLES.contains(&node.role.as_str()) {
                valid = false;
            }
        } else if node.role == "listitem" {
            valid = false;
        }
    }

    if valid {
        lines.push(format!("{}{}", "\t".repeat(depth), node_str));
        if let (Some(backend_id), Some(union_bound)) = (node.backend_id, node.union_bound) {
            registry.insert(
                node.node_id.clone(),
                NodeInfo {
                    backend_id,
                    union_bound,
                    text: node_str,
                },
            );
        }
    }

    // Skipped wrappers do not indent their children.
    let child_depth = if valid { depth + 1 } else { depth };
    for child_id in &node.child_ids {
        if let Some(&child_idx) = index_of.get(child_id.as_str()) {
            render(nodes, index_of, child_idx, child_depth, lines, registry);
        }
    }
}

/// Drop StaticText lines whose text already appeared in one of the
/// previous three kept lines; pages repeat label text endlessly.
fn dedup_static_text(lines: &[String]) -> String {
    static STATIC_TEXT: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\[\d+\] StaticText '([^']+)'").unwrap());
    let mut kept: Vec<&String> = Vec::new();
    for line in lines {
        if line.to_lowercase().contains("statictext") {
            match STATIC_TEXT.captures(line) {
                Some(caps) => {
                    let text = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                    let window = kept.iter().rev().take(3);
                    let repeated = window.into_iter().any(|prev| prev.contains(text));
                    if !repeated {
                        kept.push(line);
                    }
                }
                // Empty or oddly quoted names never capture; keep them.
                None => kept.push(line),
            }
        } else {
            kept.push(line);
        }
    }
    kept.iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
