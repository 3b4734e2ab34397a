//! Dependency graph over tables/views/indexes and topological sort
//! (component C).

use indexmap::{IndexMap, IndexSet};

use crate::ast::SqlFile;

/// One edge `from -> to` in the dependency graph: `from` depends on `to`
/// (i.e. `to` must exist, and be created, before `from`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// The dependency graph plus the result of sorting it.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Declaration order of every relation name (tables, views, indexes).
    pub nodes: IndexSet<String>,
    pub edges: Vec<Edge>,
    /// Edge targets that do not name a known node.
    pub missing_references: Vec<String>,
}

impl DependencyGraph {
    /// Builds the graph per §4.C: FK edges `table -> referenced table`,
    /// view/trigger edges `entity -> dependency`, index edges `index -> table`.
    #[must_use]
    pub fn build(file: &SqlFile) -> Self {
        let mut nodes: IndexSet<String> = IndexSet::new();
        for t in &file.tables {
            nodes.insert(t.name.clone());
        }
        for v in &file.views {
            nodes.insert(v.name.clone());
        }
        for i in &file.indexes {
            nodes.insert(i.name.clone());
        }

        let known = |name: &str| nodes.iter().any(|n| n.eq_ignore_ascii_case(name));

        let mut edges = Vec::new();
        let mut missing = Vec::new();

        for t in &file.tables {
            for fk in t.foreign_keys() {
                if known(&fk.ref_table) {
                    edges.push(Edge {
                        from: t.name.clone(),
                        to: fk.ref_table.clone(),
                    });
                } else {
                    missing.push(fk.ref_table.clone());
                }
            }
        }
        for v in &file.views {
            for d in &v.dependencies {
                if known(d) {
                    edges.push(Edge {
                        from: v.name.clone(),
                        to: d.clone(),
                    });
                } else {
                    missing.push(d.clone());
                }
            }
        }
        for trg in &file.triggers {
            for d in &trg.dependencies {
                if known(d) {
                    edges.push(Edge {
                        from: trg.name.clone(),
                        to: d.clone(),
                    });
                } else {
                    missing.push(d.clone());
                }
            }
        }
        for idx in &file.indexes {
            if known(&idx.table) {
                edges.push(Edge {
                    from: idx.name.clone(),
                    to: idx.table.clone(),
                });
            } else {
                missing.push(idx.table.clone());
            }
        }

        Self {
            nodes,
            edges,
            missing_references: missing,
        }
    }

    #[must_use]
    pub fn has_missing_references(&self) -> bool {
        !self.missing_references.is_empty()
    }

    /// Topologically sorts with leaves (most-depended-upon) first: for every
    /// edge `u -> v`, `v` appears before `u`. Within a rank, original
    /// declaration order is preserved. Cycles are broken by treating
    /// already-visited nodes as satisfied rather than looping forever.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        let mut adjacency: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for n in &self.nodes {
            adjacency.insert(n.as_str(), Vec::new());
        }
        for e in &self.edges {
            if let Some(list) = adjacency.get_mut(e.from.as_str()) {
                list.push(e.to.as_str());
            }
        }

        let mut visited: IndexSet<&str> = IndexSet::new();
        let mut in_progress: IndexSet<&str> = IndexSet::new();
        let mut out: Vec<String> = Vec::new();

        fn visit<'a>(
            node: &'a str,
            adjacency: &IndexMap<&'a str, Vec<&'a str>>,
            visited: &mut IndexSet<&'a str>,
            in_progress: &mut IndexSet<&'a str>,
            out: &mut Vec<String>,
        ) {
            if visited.contains(node) || in_progress.contains(node) {
                return;
            }
            in_progress.insert(node);
            if let Some(deps) = adjacency.get(node) {
                for dep in deps {
                    visit(dep, adjacency, visited, in_progress, out);
                }
            }
            in_progress.shift_remove(node);
            visited.insert(node);
            out.push(node.to_string());
        }

        for n in &self.nodes {
            visit(n.as_str(), &adjacency, &mut visited, &mut in_progress, &mut out);
        }
        out
    }

    /// Returns true if the graph contains at least one cycle (self-edges
    /// included), used by the planner to decide whether `PRAGMA
    /// foreign_keys` bookends are required.
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        let mut adjacency: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for n in &self.nodes {
            adjacency.insert(n.as_str(), Vec::new());
        }
        for e in &self.edges {
            if let Some(list) = adjacency.get_mut(e.from.as_str()) {
                list.push(e.to.as_str());
            }
        }
        let mut state: IndexMap<&str, u8> = IndexMap::new(); // 0=white 1=gray 2=black

        fn dfs<'a>(node: &'a str, adjacency: &IndexMap<&'a str, Vec<&'a str>>, state: &mut IndexMap<&'a str, u8>) -> bool {
            match state.get(node).copied().unwrap_or(0) {
                1 => return true,
                2 => return false,
                _ => {}
            }
            state.insert(node, 1);
            if let Some(deps) = adjacency.get(node) {
                for d in deps {
                    if dfs(d, adjacency, state) {
                        return true;
                    }
                }
            }
            state.insert(node, 2);
            false
        }

        for n in &self.nodes {
            if dfs(n.as_str(), &adjacency, &mut state) {
                return true;
            }
        }
        false
    }

    /// Index of `name` in the topological order, used to compare relative
    /// ordering of two relations.
    #[must_use]
    pub fn order_index(order: &[String], name: &str) -> Option<usize> {
        order.iter().position(|n| n.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn leaves_first_order() {
        let sql = "CREATE TABLE parent(id integer PRIMARY KEY);\
                   CREATE TABLE child(id integer PRIMARY KEY, parent_id integer REFERENCES parent(id));";
        let file = parse("t.sql", sql).unwrap();
        let graph = DependencyGraph::build(&file);
        assert!(!graph.has_missing_references());
        let order = graph.topological_order();
        let parent_idx = DependencyGraph::order_index(&order, "parent").unwrap();
        let child_idx = DependencyGraph::order_index(&order, "child").unwrap();
        assert!(parent_idx < child_idx, "parent (leaf) must sort before child");
    }

    #[test]
    fn missing_reference_reported() {
        let sql = "CREATE TABLE child(id integer PRIMARY KEY, parent_id integer REFERENCES ghost(id));";
        let file = parse("t.sql", sql).unwrap();
        let graph = DependencyGraph::build(&file);
        assert!(graph.has_missing_references());
        assert_eq!(graph.missing_references, vec!["ghost".to_string()]);
    }

    #[test]
    fn self_referential_fk_does_not_loop() {
        let sql = "CREATE TABLE node(id integer PRIMARY KEY, parent_id integer REFERENCES node(id));";
        let file = parse("t.sql", sql).unwrap();
        let graph = DependencyGraph::build(&file);
        let order = graph.topological_order();
        assert_eq!(order, vec!["node".to_string()]);
    }

    #[test]
    fn view_depends_on_table_sorts_after() {
        let sql = "CREATE TABLE child(id integer PRIMARY KEY);\
                   CREATE VIEW child_view AS SELECT id FROM child;";
        let file = parse("t.sql", sql).unwrap();
        let graph = DependencyGraph::build(&file);
        let order = graph.topological_order();
        let table_idx = DependencyGraph::order_index(&order, "child").unwrap();
        let view_idx = DependencyGraph::order_index(&order, "child_view").unwrap();
        assert!(table_idx < view_idx);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn pt_config() -> ProptestConfig {
            ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            }
        }

        /// A DAG built directly against `DependencyGraph`'s public fields:
        /// `node_count` nodes `n0..nK`, with edges only running from a
        /// higher-numbered node to a lower-numbered one so the graph is
        /// acyclic by construction.
        fn arb_dag() -> impl Strategy<Value = DependencyGraph> {
            (2usize..8).prop_flat_map(|node_count| {
                let names: Vec<String> = (0..node_count).map(|i| format!("n{i}")).collect();
                let mut possible_edges = Vec::new();
                for i in 0..node_count {
                    for j in 0..i {
                        possible_edges.push((i, j));
                    }
                }
                proptest::collection::vec(any::<bool>(), possible_edges.len()).prop_map(move |picks| {
                    let nodes: IndexSet<String> = names.iter().cloned().collect();
                    let edges = picks
                        .into_iter()
                        .zip(possible_edges.iter())
                        .filter(|(take, _)| *take)
                        .map(|(_, &(i, j))| Edge {
                            from: names[i].clone(),
                            to: names[j].clone(),
                        })
                        .collect();
                    DependencyGraph {
                        nodes,
                        edges,
                        missing_references: Vec::new(),
                    }
                })
            })
        }

        proptest! {
            #![proptest_config(pt_config())]

            /// For every edge `u -> v`, `index(u) > index(v)` in the
            /// topological order (spec.md:276).
            #[test]
            fn topological_order_respects_every_edge(graph in arb_dag()) {
                let order = graph.topological_order();
                prop_assert_eq!(order.len(), graph.nodes.len());
                for edge in &graph.edges {
                    let u = DependencyGraph::order_index(&order, &edge.from).expect("from node present");
                    let v = DependencyGraph::order_index(&order, &edge.to).expect("to node present");
                    prop_assert!(u > v, "edge {} -> {} violated ordering", edge.from, edge.to);
                }
            }
        }
    }
}
