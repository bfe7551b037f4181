//! Causal graph over memories: typed edges, breadth-first traversal, and
//! JSON/Mermaid export.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::memory::Memory;
use crate::storage::{EdgeRow, Storage};

const DEFAULT_MAX_DEPTH: u32 = 5;
const EXPORT_TOPIC_DEPTH: u32 = 2;

/// The five relationship kinds a causal edge may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    LedTo,
    Supersedes,
    DependsOn,
    ConflictsWith,
    RelatedTo,
}

impl Relationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relationship::LedTo => "led_to",
            Relationship::Supersedes => "supersedes",
            Relationship::DependsOn => "depends_on",
            Relationship::ConflictsWith => "conflicts_with",
            Relationship::RelatedTo => "related_to",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "led_to" => Some(Relationship::LedTo),
            "supersedes" => Some(Relationship::Supersedes),
            "depends_on" => Some(Relationship::DependsOn),
            "conflicts_with" => Some(Relationship::ConflictsWith),
            "related_to" => Some(Relationship::RelatedTo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
    Both,
}

/// A causal edge, as returned from traversal and export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: i64,
    pub source_id: i64,
    pub target_id: i64,
    pub relationship: String,
    pub description: Option<String>,
    pub confidence: f64,
}

/// The result of `trace`: the visited nodes and the ordered edges that
/// connect them, in BFS discovery order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subgraph {
    pub nodes: Vec<Memory>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Mermaid,
}

/// How `Engine::export_graph` seeds the subgraph to export: either an
/// explicit set of memory ids, or a topic resolved to its top memory ids
/// via hybrid search (see [`crate::engine::Engine::export_graph`]).
#[derive(Debug, Clone)]
pub enum ExportSeed {
    Ids(Vec<i64>),
    Topic(String),
}

pub struct Graph<'a> {
    storage: &'a Storage,
}

impl<'a> Graph<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    /// Create an edge. Rejects self-edges; duplicate (source, target,
    /// relationship) triples surface as `Conflict` from the storage layer.
    /// Creating an edge never un-archives either endpoint.
    pub fn link(
        &self,
        source_id: i64,
        target_id: i64,
        relationship: Relationship,
        description: Option<&str>,
        confidence: f64,
    ) -> Result<i64> {
        if source_id == target_id {
            return Err(EngineError::InvalidInput("an edge cannot connect a memory to itself".into()));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::InvalidInput("confidence must be in [0, 1]".into()));
        }
        self.storage
            .get_memory(source_id)?
            .ok_or_else(|| EngineError::NotFound(format!("memory {source_id}")))?;
        self.storage
            .get_memory(target_id)?
            .ok_or_else(|| EngineError::NotFound(format!("memory {target_id}")))?;
        self.storage
            .insert_edge(source_id, target_id, relationship.as_str(), description, confidence)
    }

    pub fn unlink(&self, edge_id: i64) -> Result<()> {
        self.storage.delete_edge(edge_id)
    }

    /// Breadth-first traversal from `start`, cycle-safe via a visited set,
    /// depth-limited (default [`DEFAULT_MAX_DEPTH`]).
    pub fn trace(
        &self,
        start: i64,
        direction: Direction,
        relationship_filter: Option<&[Relationship]>,
        max_depth: Option<u32>,
    ) -> Result<Subgraph> {
        let max_depth = max_depth.unwrap_or(DEFAULT_MAX_DEPTH);
        let mut visited: HashSet<i64> = HashSet::from([start]);
        let mut queue: VecDeque<(i64, u32)> = VecDeque::from([(start, 0)]);
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut seen_edges: HashSet<i64> = HashSet::new();

        if let Some(row) = self.storage.get_memory(start)? {
            nodes.push(crate::memory::manager::memory_from_row(row, false));
        }

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let touching = self.storage.edges_touching(current)?;
            for edge_row in touching {
                if let Some(allowed) = relationship_filter {
                    if !allowed.iter().any(|r| r.as_str() == edge_row.relationship) {
                        continue;
                    }
                }
                let neighbor = match direction {
                    Direction::Forward if edge_row.source_id == current => Some(edge_row.target_id),
                    Direction::Backward if edge_row.target_id == current => Some(edge_row.source_id),
                    Direction::Both => {
                        if edge_row.source_id == current {
                            Some(edge_row.target_id)
                        } else {
                            Some(edge_row.source_id)
                        }
                    }
                    _ => None,
                };
                let Some(neighbor) = neighbor else { continue };

                if seen_edges.insert(edge_row.id) {
                    edges.push(to_edge(&edge_row));
                }
                if visited.insert(neighbor) {
                    if let Some(row) = self.storage.get_memory(neighbor)? {
                        nodes.push(crate::memory::manager::memory_from_row(row, false));
                    }
                    queue.push_back((neighbor, depth + 1));
                }
            }
        }

        Ok(Subgraph { nodes, edges })
    }

    /// Export a subgraph seeded by `ids`, each expanded via `trace` at
    /// depth 2. Topic-seeded export (resolving a topic to its top memory
    /// ids via hybrid search before calling this) lives on `Engine`, which
    /// is the layer with access to `MemoryManager::recall`.
    pub fn export(
        &self,
        format: ExportFormat,
        ids: &[i64],
        include_orphans: bool,
    ) -> Result<String> {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut seen_nodes = HashSet::new();
        let mut seen_edges = HashSet::new();

        for &id in ids {
            let sub = self.trace(id, Direction::Both, None, Some(EXPORT_TOPIC_DEPTH))?;
            for node in sub.nodes {
                if seen_nodes.insert(node.id) {
                    nodes.push(node);
                }
            }
            for edge in sub.edges {
                if seen_edges.insert(edge.id) {
                    edges.push(edge);
                }
            }
        }

        if !include_orphans {
            let connected: HashSet<i64> = edges
                .iter()
                .flat_map(|e| [e.source_id, e.target_id])
                .collect();
            nodes.retain(|n| connected.contains(&n.id) || ids.contains(&n.id));
        }

        match format {
            ExportFormat::Json => {
                let value = serde_json::json!({ "nodes": nodes, "edges": edges });
                serde_json::to_string_pretty(&value).map_err(EngineError::from)
            }
            ExportFormat::Mermaid => Ok(to_mermaid(&nodes, &edges)),
        }
    }
}

fn to_edge(row: &EdgeRow) -> Edge {
    Edge {
        id: row.id,
        source_id: row.source_id,
        target_id: row.target_id,
        relationship: row.relationship.clone(),
        description: row.description.clone(),
        confidence: row.confidence,
    }
}

/// Render a Mermaid `graph TD` block, eliding self-edges and back-edges
/// (edges whose target was discovered at or before their source in BFS
/// order — i.e. they close a cycle back into the already-explored set
/// rather than reaching a new node). JSON export keeps all of them; only
/// the Mermaid rendering drops them, for readability.
fn to_mermaid(nodes: &[Memory], edges: &[Edge]) -> String {
    let order: std::collections::HashMap<i64, usize> =
        nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();

    let mut out = String::from("graph TD\n");
    for node in nodes {
        let label = node.content.replace('"', "'").chars().take(60).collect::<String>();
        out.push_str(&format!("    m{}[\"{}\"]\n", node.id, label));
    }
    for edge in edges {
        if edge.source_id == edge.target_id {
            continue;
        }
        let is_back_edge = match (order.get(&edge.source_id), order.get(&edge.target_id)) {
            (Some(&src), Some(&dst)) => dst <= src,
            _ => false,
        };
        if is_back_edge {
            continue;
        }
        out.push_str(&format!(
            "    m{} -->|{}| m{}\n",
            edge.source_id, edge.relationship, edge.target_id
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewMemoryRow;

    fn store_with_memories(n: usize) -> (Storage, Vec<i64>) {
        let storage = Storage::open_in_memory().unwrap();
        let ids = (0..n)
            .map(|i| {
                storage
                    .insert_memory(&NewMemoryRow {
                        category: "decision".into(),
                        content: format!("memory {i}"),
                        rationale: None,
                        context: None,
                        tags_json: "[]".into(),
                        keywords_json: "[]".into(),
                        file_path: None,
                        is_permanent: false,
                    })
                    .unwrap()
            })
            .collect();
        (storage, ids)
    }

    #[test]
    fn test_self_edge_rejected() {
        let (storage, ids) = store_with_memories(1);
        let graph = Graph::new(&storage);
        let err = graph.link(ids[0], ids[0], Relationship::LedTo, None, 1.0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_trace_follows_forward_chain() {
        let (storage, ids) = store_with_memories(3);
        let graph = Graph::new(&storage);
        graph.link(ids[0], ids[1], Relationship::LedTo, None, 1.0).unwrap();
        graph.link(ids[1], ids[2], Relationship::LedTo, None, 1.0).unwrap();

        let sub = graph.trace(ids[0], Direction::Forward, None, None).unwrap();
        assert_eq!(sub.nodes.len(), 3);
        assert_eq!(sub.edges.len(), 2);
    }

    #[test]
    fn test_trace_depth_limit() {
        let (storage, ids) = store_with_memories(3);
        let graph = Graph::new(&storage);
        graph.link(ids[0], ids[1], Relationship::LedTo, None, 1.0).unwrap();
        graph.link(ids[1], ids[2], Relationship::LedTo, None, 1.0).unwrap();

        let sub = graph.trace(ids[0], Direction::Forward, None, Some(1)).unwrap();
        assert_eq!(sub.nodes.len(), 2);
    }

    #[test]
    fn test_trace_handles_cycles() {
        let (storage, ids) = store_with_memories(2);
        let graph = Graph::new(&storage);
        graph.link(ids[0], ids[1], Relationship::LedTo, None, 1.0).unwrap();
        graph.link(ids[1], ids[0], Relationship::LedTo, None, 1.0).unwrap();

        let sub = graph.trace(ids[0], Direction::Both, None, Some(10)).unwrap();
        assert_eq!(sub.nodes.len(), 2);
    }

    #[test]
    fn test_export_mermaid_contains_nodes_and_edges() {
        let (storage, ids) = store_with_memories(2);
        let graph = Graph::new(&storage);
        graph.link(ids[0], ids[1], Relationship::Supersedes, None, 1.0).unwrap();
        let mermaid = graph.export(ExportFormat::Mermaid, &[ids[0]], true).unwrap();
        assert!(mermaid.contains("graph TD"));
        assert!(mermaid.contains("supersedes"));
    }

    #[test]
    fn test_export_mermaid_elides_back_edge_but_json_keeps_it() {
        let (storage, ids) = store_with_memories(2);
        let graph = Graph::new(&storage);
        graph.link(ids[0], ids[1], Relationship::LedTo, None, 1.0).unwrap();
        graph.link(ids[1], ids[0], Relationship::LedTo, None, 1.0).unwrap();

        let mermaid = graph.export(ExportFormat::Mermaid, &[ids[0]], true).unwrap();
        assert_eq!(mermaid.matches("-->").count(), 1);

        let json = graph.export(ExportFormat::Json, &[ids[0]], true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["edges"].as_array().unwrap().len(), 2);
    }
}
