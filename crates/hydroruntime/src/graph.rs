use hydrocore::{ports, BlockKind, BlockNode, Connection, FlowDefinition, GraphError};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Executable view of a flow definition.
///
/// Blocks keep their definition order and outgoing connections keep their
/// input order, so "first matching connection" is well defined. The petgraph
/// structure carries one node per block and one edge per connection.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    flow_id: String,
    blocks: Vec<BlockNode>,
    node_to_index: HashMap<String, NodeIndex>,
    graph: DiGraph<usize, usize>,
    connections: Vec<Connection>,
    outgoing: HashMap<String, Vec<usize>>,
    start_blocks: Vec<String>,
    declared_entry: Option<String>,
}

impl ExecutionGraph {
    /// Builds the graph. Duplicate block ids and connections that name an
    /// unknown block are rejected.
    pub fn build(flow: &FlowDefinition) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut node_to_index = HashMap::new();
        let mut blocks = Vec::with_capacity(flow.blocks.len());

        for (position, def) in flow.blocks.iter().enumerate() {
            if node_to_index.contains_key(&def.id) {
                return Err(GraphError::DuplicateBlock(def.id.clone()));
            }
            let idx = graph.add_node(position);
            node_to_index.insert(def.id.clone(), idx);
            blocks.push(BlockNode::from_definition(def));
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        for (position, conn) in flow.connections.iter().enumerate() {
            let endpoints = (
                node_to_index.get(&conn.source_block_id),
                node_to_index.get(&conn.target_block_id),
            );
            let (Some(from), Some(to)) = endpoints else {
                return Err(GraphError::DanglingConnection {
                    source_block: conn.source_block_id.clone(),
                    source_port: conn.source_port_id.clone(),
                    target_block: conn.target_block_id.clone(),
                });
            };
            graph.add_edge(*from, *to, position);
            outgoing
                .entry(conn.source_block_id.clone())
                .or_default()
                .push(position);
        }

        let mut execution_graph = Self {
            flow_id: flow.id.clone(),
            blocks,
            node_to_index,
            graph,
            connections: flow.connections.clone(),
            outgoing,
            start_blocks: Vec::new(),
            declared_entry: None,
        };

        execution_graph.start_blocks = match declared_start_blocks(flow) {
            Some(declared) => declared,
            None => execution_graph
                .blocks
                .iter()
                .filter(|b| !execution_graph.has_incoming(&b.id))
                .map(|b| b.id.clone())
                .collect(),
        };
        execution_graph.declared_entry = flow
            .meta
            .get("startBlockId")
            .and_then(|v| v.as_str())
            .filter(|id| execution_graph.contains(id))
            .map(str::to_string);

        tracing::debug!(
            flow_id = %flow.id,
            blocks = execution_graph.blocks.len(),
            connections = execution_graph.connections.len(),
            "execution graph built"
        );
        Ok(execution_graph)
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, block_id: &str) -> bool {
        self.node_to_index.contains_key(block_id)
    }

    pub fn block(&self, block_id: &str) -> Option<&BlockNode> {
        let idx = self.node_to_index.get(block_id)?;
        self.blocks.get(self.graph[*idx])
    }

    /// Blocks in definition order.
    pub fn blocks(&self) -> impl Iterator<Item = &BlockNode> {
        self.blocks.iter()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Outgoing connections of `block_id`, in input order.
    pub fn outgoing(&self, block_id: &str) -> impl Iterator<Item = &Connection> {
        self.outgoing
            .get(block_id)
            .into_iter()
            .flatten()
            .filter_map(|&i| self.connections.get(i))
    }

    pub fn next_blocks<'a>(&'a self, block_id: &str, port: &'a str) -> impl Iterator<Item = &'a Connection> {
        self.outgoing(block_id)
            .filter(move |c| c.source_port_id == port)
    }

    /// Target of the first connection leaving `block_id` through `port`.
    /// Further connections on the same port are ignored.
    pub fn first_target<'a>(&'a self, block_id: &str, port: &'a str) -> Option<&'a str> {
        self.next_blocks(block_id, port)
            .next()
            .map(|c| c.target_block_id.as_str())
    }

    pub fn has_incoming(&self, block_id: &str) -> bool {
        self.incoming_count(block_id) > 0
    }

    pub fn incoming_count(&self, block_id: &str) -> usize {
        self.node_to_index
            .get(block_id)
            .map(|idx| self.graph.edges_directed(*idx, Direction::Incoming).count())
            .unwrap_or(0)
    }

    /// Blocks a run may begin from: `meta.startBlocks` when the flow declares
    /// it, otherwise every block without incoming connections.
    pub fn start_blocks(&self) -> &[String] {
        &self.start_blocks
    }

    /// Block the run begins with: `meta.startBlockId`, else a `system.start`
    /// start block, else the first start block that is not an error handler.
    pub fn entry_block(&self) -> Result<&str, GraphError> {
        if let Some(id) = &self.declared_entry {
            return Ok(id.as_str());
        }

        let candidates = || {
            self.start_blocks
                .iter()
                .filter_map(|id| self.block(id))
        };
        candidates()
            .find(|b| b.kind == Some(BlockKind::SystemStart))
            .or_else(|| candidates().find(|b| b.kind != Some(BlockKind::ErrorHandler)))
            .map(|b| b.id.as_str())
            .ok_or(GraphError::NoStartBlock)
    }

    /// Error handler linked to `block_id`: an `errorHandler` block with a
    /// connection into the block's `onErrorIn` port.
    pub fn find_error_handler_for(&self, block_id: &str) -> Option<&BlockNode> {
        self.blocks
            .iter()
            .filter(|b| b.kind == Some(BlockKind::ErrorHandler))
            .find(|handler| {
                self.outgoing(&handler.id).any(|c| {
                    c.target_block_id == block_id && c.target_port_id == ports::ON_ERROR_IN
                })
            })
    }

    /// First `system.end` block in definition order.
    pub fn system_end_block(&self) -> Option<&BlockNode> {
        self.blocks
            .iter()
            .find(|b| b.kind == Some(BlockKind::SystemEnd))
    }

    /// Depth-first search for a back edge, with an explicit stack.
    pub fn has_cycle(&self) -> bool {
        let count = self.graph.node_count();
        let mut visited = vec![false; count];
        let mut on_path = vec![false; count];

        for root in self.graph.node_indices() {
            if visited[root.index()] {
                continue;
            }
            visited[root.index()] = true;
            on_path[root.index()] = true;
            let mut stack = vec![(root, self.graph.neighbors_directed(root, Direction::Outgoing))];

            while let Some((node, neighbors)) = stack.last_mut() {
                match neighbors.next() {
                    Some(next) if on_path[next.index()] => return true,
                    Some(next) if !visited[next.index()] => {
                        visited[next.index()] = true;
                        on_path[next.index()] = true;
                        stack.push((next, self.graph.neighbors_directed(next, Direction::Outgoing)));
                    }
                    Some(_) => {}
                    None => {
                        on_path[node.index()] = false;
                        stack.pop();
                    }
                }
            }
        }
        false
    }

    /// Blocks reachable from the start blocks through connections or GOTO targets.
    pub fn reachable_blocks(&self) -> HashSet<&str> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&str> = self.start_blocks.iter().map(String::as_str).collect();

        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            pending.extend(self.outgoing(id).map(|c| c.target_block_id.as_str()));
            if let Some(block) = self.block(id) {
                if block.kind == Some(BlockKind::Goto) {
                    if let Some(target) = block.param_str("targetBlockId") {
                        if let Some(target) = self.block(target) {
                            pending.push(target.id.as_str());
                        }
                    }
                }
            }
        }
        seen
    }

    /// Distinct device ids referenced by block parameters.
    pub fn device_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.blocks
            .iter()
            .filter_map(|b| b.device_id())
            .filter(|id| seen.insert(*id))
            .collect()
    }
}

fn declared_start_blocks(flow: &FlowDefinition) -> Option<Vec<String>> {
    let list = flow.meta.get("startBlocks")?.as_array()?;
    Some(
        list.iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrocore::BlockDefinition;
    use serde_json::json;

    fn chain(ids: &[(&str, &str)]) -> FlowDefinition {
        let mut flow = FlowDefinition::new("f");
        for (id, kind) in ids {
            flow.add_block(BlockDefinition::new(*id, *kind));
        }
        for pair in ids.windows(2) {
            flow.connect(pair[0].0, ports::FLOW_OUT, pair[1].0, ports::FLOW_IN);
        }
        flow
    }

    #[test]
    fn start_blocks_have_no_incoming_connections() {
        let flow = chain(&[("s", "system.start"), ("w", "wait"), ("e", "system.end")]);
        let graph = ExecutionGraph::build(&flow).unwrap();
        assert_eq!(graph.start_blocks(), ["s".to_string()]);
        assert_eq!(graph.entry_block().unwrap(), "s");
        assert_eq!(graph.first_target("s", ports::FLOW_OUT), Some("w"));
        assert_eq!(graph.incoming_count("e"), 1);
    }

    #[test]
    fn rejects_unknown_endpoints_and_duplicates() {
        let mut flow = chain(&[("s", "system.start")]);
        flow.connect("s", ports::FLOW_OUT, "ghost", ports::FLOW_IN);
        assert!(matches!(
            ExecutionGraph::build(&flow),
            Err(GraphError::DanglingConnection { .. })
        ));

        let flow = chain(&[("s", "system.start"), ("s", "wait")]);
        assert_eq!(
            ExecutionGraph::build(&flow).unwrap_err(),
            GraphError::DuplicateBlock("s".into())
        );
    }

    #[test]
    fn detects_cycles() {
        let mut looped = chain(&[("a", "wait"), ("b", "wait")]);
        looped.connect("b", ports::FLOW_OUT, "a", ports::FLOW_IN);
        let graph = ExecutionGraph::build(&looped).unwrap();
        assert!(graph.has_cycle());
        assert!(petgraph::algo::is_cyclic_directed(&graph.graph));

        let dag = chain(&[("a", "wait"), ("b", "wait")]);
        let graph = ExecutionGraph::build(&dag).unwrap();
        assert!(!graph.has_cycle());
        assert!(!petgraph::algo::is_cyclic_directed(&graph.graph));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut flow = chain(&[("a", "wait")]);
        flow.connect("a", ports::FLOW_OUT, "a", ports::FLOW_IN);
        assert!(ExecutionGraph::build(&flow).unwrap().has_cycle());
    }

    #[test]
    fn entry_skips_error_handlers() {
        let mut flow = FlowDefinition::new("f");
        flow.add_block(BlockDefinition::new("eh", "errorHandler"));
        flow.add_block(BlockDefinition::new("w", "wait"));
        flow.add_block(BlockDefinition::new("a", "actuator"));
        flow.connect("w", ports::FLOW_OUT, "a", ports::FLOW_IN);
        flow.connect("eh", ports::FLOW_OUT, "a", ports::ON_ERROR_IN);

        let graph = ExecutionGraph::build(&flow).unwrap();
        assert_eq!(graph.entry_block().unwrap(), "w");
        assert_eq!(graph.find_error_handler_for("a").map(|b| b.id.as_str()), Some("eh"));
        assert!(graph.find_error_handler_for("w").is_none());
    }

    #[test]
    fn declared_start_blocks_override() {
        let mut flow = chain(&[("s", "system.start"), ("e", "system.end")]);
        flow.add_block(BlockDefinition::new("stray", "wait"));
        flow.meta.insert("startBlocks".into(), json!(["s"]));
        let graph = ExecutionGraph::build(&flow).unwrap();
        assert_eq!(graph.start_blocks(), ["s".to_string()]);
        assert!(!graph.reachable_blocks().contains("stray"));
    }

    #[test]
    fn first_connection_wins_on_shared_port() {
        let mut flow = FlowDefinition::new("f");
        for id in ["s", "x", "y"] {
            flow.add_block(BlockDefinition::new(id, "wait"));
        }
        flow.connect("s", ports::FLOW_OUT, "y", ports::FLOW_IN);
        flow.connect("s", ports::FLOW_OUT, "x", ports::FLOW_IN);
        let graph = ExecutionGraph::build(&flow).unwrap();
        assert_eq!(graph.first_target("s", ports::FLOW_OUT), Some("y"));
        assert_eq!(graph.next_blocks("s", ports::FLOW_OUT).count(), 2);
    }

    #[test]
    fn goto_targets_count_as_reachable() {
        let mut flow = chain(&[("s", "system.start"), ("g", "goto")]);
        flow.blocks[1]
            .parameters
            .insert("targetBlockId".into(), json!("t"));
        flow.add_block(BlockDefinition::new("t", "wait"));
        flow.meta.insert("startBlocks".into(), json!(["s"]));
        let graph = ExecutionGraph::build(&flow).unwrap();
        assert!(graph.reachable_blocks().contains("t"));
    }
}
