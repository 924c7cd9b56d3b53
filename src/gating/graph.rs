//! Prerequisite graph of a course and the cycle checks run over it.
//!
//! Nodes are outline items keyed by `(kind, id)`; an edge `a -> b` means
//! "`a` requires `b`". Enrollment prerequisites point outside the course and
//! never become edges.

use std::collections::{BTreeMap, HashSet};

use crate::gating::errors::{CyclePath, GatingError};
use crate::gating::types::{AccessControl, AccessControlConfig, ResourceKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrerequisiteLink {
    pub from: ResourceKey,
    pub to: ResourceKey,
}

/// Adjacency list keyed by resource. `BTreeMap` keeps traversal order, and
/// so reported cycle paths, deterministic.
#[derive(Debug, Clone, Default)]
pub struct PrerequisiteGraph {
    edges: BTreeMap<ResourceKey, Vec<ResourceKey>>,
}

impl PrerequisiteGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_links<'a>(links: impl IntoIterator<Item = &'a PrerequisiteLink>) -> Self {
        let mut graph = Self::new();
        for link in links {
            graph.add_edge(link.from.clone(), link.to.clone());
        }
        graph
    }

    /// Build from the active PREREQUISITE rules in `rules`. Rules whose
    /// configuration does not decode contribute no edges.
    pub fn from_rules(rules: &[AccessControl]) -> Self {
        let links: Vec<PrerequisiteLink> = rules.iter().flat_map(links_for_rule).collect();
        Self::from_links(&links)
    }

    pub fn add_edge(&mut self, from: ResourceKey, to: ResourceKey) {
        let targets = self.edges.entry(from).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
    }

    pub fn dependencies(&self, key: &ResourceKey) -> &[ResourceKey] {
        self.edges.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|v| v.len()).sum()
    }

    /// Depth-first walk from `start`; returns the first cycle reachable from
    /// it, if any.
    pub fn find_cycle_from(&self, start: &ResourceKey) -> Option<Vec<ResourceKey>> {
        Walk::default().visit(self, start)
    }

    /// Check every node. Fully explored nodes are shared across start points,
    /// so the whole pass stays O(V+E).
    pub fn find_any_cycle(&self) -> Option<Vec<ResourceKey>> {
        let mut walk = Walk::default();
        self.edges.keys().find_map(|node| walk.visit(self, node))
    }
}

/// Visited-set DFS state shared by the write-time validator and the
/// evaluation-time re-check.
#[derive(Default)]
struct Walk {
    done: HashSet<ResourceKey>,
    on_stack: HashSet<ResourceKey>,
    stack: Vec<ResourceKey>,
}

impl Walk {
    /// Iterative so that long prerequisite chains cannot overflow the stack.
    fn visit(
        &mut self,
        graph: &PrerequisiteGraph,
        start: &ResourceKey,
    ) -> Option<Vec<ResourceKey>> {
        if self.done.contains(start) {
            return None;
        }
        // node and the index of its next dependency to follow
        let mut frames = vec![(start, 0usize)];
        self.enter(start);

        while let Some(frame) = frames.last_mut() {
            let (node, next) = *frame;
            frame.1 += 1;
            let Some(dep) = graph.dependencies(node).get(next) else {
                frames.pop();
                self.leave(node);
                continue;
            };
            if self.on_stack.contains(dep) {
                let pos = self.stack.iter().position(|k| k == dep)?;
                let mut cycle = self.stack[pos..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !self.done.contains(dep) {
                self.enter(dep);
                frames.push((dep, 0));
            }
        }
        None
    }

    fn enter(&mut self, node: &ResourceKey) {
        self.stack.push(node.clone());
        self.on_stack.insert(node.clone());
    }

    fn leave(&mut self, node: &ResourceKey) {
        self.stack.pop();
        self.on_stack.remove(node);
        self.done.insert(node.clone());
    }
}

/// Edges contributed by a single rule (empty unless it is an active,
/// decodable PREREQUISITE rule).
pub fn links_for_rule(rule: &AccessControl) -> Vec<PrerequisiteLink> {
    if !rule.active {
        return Vec::new();
    }
    let Ok(AccessControlConfig::Prerequisite(config)) = rule.config() else {
        return Vec::new();
    };
    let from = rule.resource_key();
    config
        .prerequisites
        .iter()
        .filter_map(|edge| edge.target())
        .map(|to| PrerequisiteLink {
            from: from.clone(),
            to,
        })
        .collect()
}

/// Edges the course would have after writing `candidate`: every existing
/// rule except the one being replaced, plus the candidate.
pub fn candidate_links(
    existing: &[AccessControl],
    candidate: &AccessControl,
) -> Vec<PrerequisiteLink> {
    existing
        .iter()
        .filter(|r| r.id != candidate.id)
        .chain(std::iter::once(candidate))
        .flat_map(links_for_rule)
        .collect()
}

/// Reject `candidate_links` if they contain a cycle through `origin`, the
/// resource being added or edited.
pub fn validate(
    course_id: &str,
    candidate_links: &[PrerequisiteLink],
    origin: &ResourceKey,
) -> Result<(), GatingError> {
    let graph = PrerequisiteGraph::from_links(candidate_links);
    match graph.find_cycle_from(origin) {
        Some(path) => Err(GatingError::CycleDetected {
            course_id: course_id.to_string(),
            path: CyclePath(path),
        }),
        None => Ok(()),
    }
}

/// Whole-course check, used by consistency audits.
pub fn validate_course(course_id: &str, rules: &[AccessControl]) -> Result<(), GatingError> {
    match PrerequisiteGraph::from_rules(rules).find_any_cycle() {
        Some(path) => Err(GatingError::CycleDetected {
            course_id: course_id.to_string(),
            path: CyclePath(path),
        }),
        None => Ok(()),
    }
}
