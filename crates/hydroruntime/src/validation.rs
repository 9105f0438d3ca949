use crate::graph::ExecutionGraph;
use hydrocore::{ports, BlockKind, FlowDefinition, FlowError, GraphError};

/// Structural problems found in a flow. Errors block execution, warnings don't.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<GraphError>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// The warnings when valid, otherwise every error joined into one.
    pub fn into_result(self) -> Result<Vec<String>, FlowError> {
        if self.is_valid() {
            return Ok(self.warnings);
        }
        let message = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(FlowError::Validation(message))
    }
}

/// Builds the graph for `flow` and validates it.
pub fn validate(flow: &FlowDefinition) -> ValidationReport {
    match ExecutionGraph::build(flow) {
        Ok(graph) => validate_graph(&graph),
        Err(e) => ValidationReport {
            errors: vec![e],
            warnings: Vec::new(),
        },
    }
}

pub fn validate_graph(graph: &ExecutionGraph) -> ValidationReport {
    let mut report = ValidationReport::default();
    let starts = graph.start_blocks();

    for block in graph.blocks() {
        // Error handlers attach through their own outgoing links and
        // variable declarations are never on the execution path.
        let detached = matches!(
            block.kind,
            Some(BlockKind::ErrorHandler) | Some(BlockKind::SetVarName)
        );
        if !detached && !graph.has_incoming(&block.id) && !starts.contains(&block.id) {
            report
                .errors
                .push(GraphError::UnreachableBlock(block.id.clone()));
        }

        if block.has_output_port(ports::FLOW_OUT) && graph.outgoing(&block.id).next().is_none() {
            report
                .warnings
                .push(format!("Block {} has no outgoing connections", block.id));
        }
    }

    if graph.has_cycle() {
        report.errors.push(GraphError::CircularDependency);
    }

    if graph.entry_block().is_err() {
        report.errors.push(GraphError::NoStartBlock);
    }

    let reachable = graph.reachable_blocks();
    for block in graph.blocks() {
        let detached = matches!(
            block.kind,
            Some(BlockKind::ErrorHandler) | Some(BlockKind::SetVarName)
        );
        if !detached && graph.has_incoming(&block.id) && !reachable.contains(block.id.as_str()) {
            report
                .warnings
                .push(format!("Block {} is not reachable from any start block", block.id));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrocore::BlockDefinition;
    use serde_json::json;

    fn linear() -> FlowDefinition {
        let mut flow = FlowDefinition::new("f");
        flow.add_block(BlockDefinition::new("s", "system.start"));
        flow.add_block(BlockDefinition::new("w", "wait").with_param("duration", 1));
        flow.add_block(BlockDefinition::new("e", "system.end"));
        flow.connect("s", ports::FLOW_OUT, "w", ports::FLOW_IN);
        flow.connect("w", ports::FLOW_OUT, "e", ports::FLOW_IN);
        flow
    }

    #[test]
    fn linear_flow_is_valid() {
        let report = validate(&linear());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn two_block_cycle_is_rejected() {
        let mut flow = FlowDefinition::new("f");
        flow.add_block(BlockDefinition::new("s", "system.start"));
        flow.add_block(BlockDefinition::new("a", "wait"));
        flow.add_block(BlockDefinition::new("b", "wait"));
        flow.connect("s", ports::FLOW_OUT, "a", ports::FLOW_IN);
        flow.connect("a", ports::FLOW_OUT, "b", ports::FLOW_IN);
        flow.connect("b", ports::FLOW_OUT, "a", ports::FLOW_IN);

        let report = validate(&flow);
        assert!(report.errors.contains(&GraphError::CircularDependency));
        assert!(report.into_result().is_err());
    }

    #[test]
    fn orphan_is_flagged_when_start_blocks_are_declared() {
        let mut flow = linear();
        flow.add_block(BlockDefinition::new("orphan", "wait"));
        flow.meta.insert("startBlocks".into(), json!(["s"]));

        let report = validate(&flow);
        assert_eq!(report.errors, vec![GraphError::UnreachableBlock("orphan".into())]);
    }

    #[test]
    fn error_handlers_are_not_orphans() {
        let mut flow = linear();
        flow.add_block(BlockDefinition::new("eh", "errorHandler"));
        flow.connect("eh", ports::FLOW_OUT, "w", ports::ON_ERROR_IN);
        flow.meta.insert("startBlocks".into(), json!(["s"]));
        assert!(validate(&flow).is_valid());
    }

    #[test]
    fn dangling_flow_out_is_only_a_warning() {
        let mut flow = FlowDefinition::new("f");
        flow.add_block(BlockDefinition::new("s", "system.start").with_output(ports::FLOW_OUT));

        let report = validate(&flow);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn unknown_connection_endpoint_is_an_error() {
        let mut flow = linear();
        flow.connect("w", ports::FLOW_OUT, "missing", ports::FLOW_IN);
        let report = validate(&flow);
        assert!(matches!(
            report.errors.as_slice(),
            [GraphError::DanglingConnection { .. }]
        ));
    }

    #[test]
    fn empty_flow_has_no_start() {
        let report = validate(&FlowDefinition::new("empty"));
        assert_eq!(report.errors, vec![GraphError::NoStartBlock]);
    }
}
