//! Static description of every block kind: category, ports and required parameters.

use hydrocore::{ports, BlockKind};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PortDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

const fn port(name: &'static str, description: &'static str, required: bool) -> PortDefinition {
    PortDefinition {
        name,
        description,
        required,
    }
}

/// Metadata about a block kind
#[derive(Debug, Clone, Serialize)]
pub struct BlockMetadata {
    pub kind: BlockKind,
    pub description: &'static str,
    pub category: &'static str,
    pub required_params: &'static [&'static str],
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

pub fn metadata(kind: BlockKind) -> BlockMetadata {
    let flow_in = || port(ports::FLOW_IN, "Incoming flow", true);
    let flow_out = || port(ports::FLOW_OUT, "Continue", false);
    let on_error = || port(ports::ON_ERROR_OUT, "Taken when the block fails", false);

    let (category, required_params, inputs, outputs): (_, &'static [&'static str], _, _) = match kind {
        BlockKind::Sensor => (
            "devices",
            &["deviceId"],
            vec![flow_in()],
            vec![flow_out(), on_error()],
        ),
        BlockKind::Actuator => (
            "devices",
            &["deviceId", "actionType"],
            vec![flow_in()],
            vec![flow_out(), on_error()],
        ),
        BlockKind::Wait => ("control", &["duration"], vec![flow_in()], vec![flow_out()]),
        BlockKind::If => (
            "logic",
            &["conditions"],
            vec![flow_in()],
            vec![
                port(ports::FLOW_OUT_TRUE, "Condition holds", false),
                port(ports::FLOW_OUT_FALSE, "Condition does not hold", false),
            ],
        ),
        BlockKind::Loop => (
            "logic",
            &[],
            vec![flow_in()],
            vec![
                port(ports::LOOP_OUT, "Loop body", false),
                port(ports::FLOW_OUT, "After the last iteration", false),
            ],
        ),
        BlockKind::Goto => ("control", &["targetBlockId"], vec![flow_in()], vec![]),
        BlockKind::Merge => ("control", &[], vec![flow_in()], vec![flow_out()]),
        BlockKind::ErrorHandler => (
            "errors",
            &[],
            vec![port(ports::ON_ERROR_IN, "Failing block", true)],
            vec![
                flow_out(),
                port(ports::FLOW_OUT_STOP, "Stops the run", false),
            ],
        ),
        BlockKind::SystemStart => ("system", &[], vec![], vec![flow_out()]),
        BlockKind::SystemEnd => ("system", &[], vec![flow_in()], vec![]),
        BlockKind::SetVarName => (
            "variables",
            &["internalVar"],
            vec![],
            vec![port(ports::SET_VAR_NAME_OUT, "Declared variable", false)],
        ),
        BlockKind::SetVarData => (
            "variables",
            &["variableName"],
            vec![flow_in()],
            vec![flow_out()],
        ),
    };

    BlockMetadata {
        kind,
        description: kind.description(),
        category,
        required_params,
        inputs,
        outputs,
    }
}

/// Metadata for all block kinds, in declaration order.
pub fn all() -> Vec<BlockMetadata> {
    BlockKind::ALL.iter().copied().map(metadata).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_is_described() {
        let catalog = all();
        assert_eq!(catalog.len(), BlockKind::ALL.len());
        assert!(catalog.iter().all(|m| !m.description.is_empty()));
    }

    #[test]
    fn end_block_has_no_outputs() {
        assert!(metadata(BlockKind::SystemEnd).outputs.is_empty());
        assert_eq!(metadata(BlockKind::Actuator).required_params, ["deviceId", "actionType"]);
    }
}
