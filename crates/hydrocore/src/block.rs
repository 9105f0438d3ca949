use crate::{BlockDefinition, BlockError, ExecutionError, Parameters};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known port identifiers
pub mod ports {
    pub const FLOW_IN: &str = "flowIn";
    pub const FLOW_OUT: &str = "flowOut";
    pub const FLOW_OUT_TRUE: &str = "flowOutTrue";
    pub const FLOW_OUT_FALSE: &str = "flowOutFalse";
    pub const LOOP_OUT: &str = "loopOut";
    pub const FLOW_OUT_STOP: &str = "flowOutStop";
    pub const ON_ERROR_IN: &str = "onErrorIn";
    pub const ON_ERROR_OUT: &str = "onErrorOut";
    pub const SET_VAR_NAME_OUT: &str = "setVarNameOut";
    /// Pseudo-port of a GOTO result; the target is carried in the payload.
    pub const REDIRECT: &str = "REDIRECT";
    /// Output port of the end block. Nothing is ever wired to it.
    pub const END: &str = "";
}

/// The closed set of block kinds the executor can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    #[serde(rename = "sensor")]
    Sensor,
    #[serde(rename = "actuator")]
    Actuator,
    #[serde(rename = "wait")]
    Wait,
    #[serde(rename = "if")]
    If,
    #[serde(rename = "loop")]
    Loop,
    #[serde(rename = "goto")]
    Goto,
    #[serde(rename = "merge")]
    Merge,
    #[serde(rename = "errorHandler")]
    ErrorHandler,
    #[serde(rename = "system.start")]
    SystemStart,
    #[serde(rename = "system.end")]
    SystemEnd,
    #[serde(rename = "setVarName")]
    SetVarName,
    #[serde(rename = "setVarData")]
    SetVarData,
}

impl BlockKind {
    pub const ALL: [BlockKind; 12] = [
        BlockKind::Sensor,
        BlockKind::Actuator,
        BlockKind::Wait,
        BlockKind::If,
        BlockKind::Loop,
        BlockKind::Goto,
        BlockKind::Merge,
        BlockKind::ErrorHandler,
        BlockKind::SystemStart,
        BlockKind::SystemEnd,
        BlockKind::SetVarName,
        BlockKind::SetVarData,
    ];

    pub fn parse(definition_id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == definition_id)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Sensor => "sensor",
            BlockKind::Actuator => "actuator",
            BlockKind::Wait => "wait",
            BlockKind::If => "if",
            BlockKind::Loop => "loop",
            BlockKind::Goto => "goto",
            BlockKind::Merge => "merge",
            BlockKind::ErrorHandler => "errorHandler",
            BlockKind::SystemStart => "system.start",
            BlockKind::SystemEnd => "system.end",
            BlockKind::SetVarName => "setVarName",
            BlockKind::SetVarData => "setVarData",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            BlockKind::Sensor => "Read a sensor and store the value in a variable",
            BlockKind::Actuator => "Command an actuator (on/off, timed, power, fades)",
            BlockKind::Wait => "Pause the flow for a number of seconds",
            BlockKind::If => "Branch on a comparison",
            BlockKind::Loop => "Repeat a section until an exit condition or bound",
            BlockKind::Goto => "Jump to another block",
            BlockKind::Merge => "Join branches",
            BlockKind::ErrorHandler => "Retry, log or stop when a linked block fails",
            BlockKind::SystemStart => "Flow entry point",
            BlockKind::SystemEnd => "Flow exit point",
            BlockKind::SetVarName => "Declare a variable",
            BlockKind::SetVarData => "Assign a variable",
        }
    }

    /// Kinds whose executions are persisted as run records.
    pub fn is_trackable(&self) -> bool {
        matches!(self, BlockKind::Sensor | BlockKind::Actuator)
    }

    /// Kinds that produce progress events for the operator UI.
    pub fn is_ui_visible(&self) -> bool {
        matches!(
            self,
            BlockKind::Sensor | BlockKind::Actuator | BlockKind::If | BlockKind::Loop
        )
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block as the runtime sees it: identity, kind, parameters and declared ports
#[derive(Debug, Clone)]
pub struct BlockNode {
    pub id: String,
    pub definition_id: String,
    /// `None` when the definition id names no known kind.
    pub kind: Option<BlockKind>,
    pub parameters: Parameters,
    pub input_ports: Vec<String>,
    pub output_ports: Vec<String>,
}

impl BlockNode {
    pub fn from_definition(def: &BlockDefinition) -> Self {
        Self {
            id: def.id.clone(),
            definition_id: def.definition_id.clone(),
            kind: BlockKind::parse(&def.definition_id),
            parameters: def.parameters.clone(),
            input_ports: def.connections.inputs.keys().cloned().collect(),
            output_ports: def.connections.outputs.keys().cloned().collect(),
        }
    }

    /// Deserializes the parameter map into a typed parameter struct.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, BlockError> {
        serde_json::from_value(serde_json::Value::Object(self.parameters.clone()))
            .map_err(|e| BlockError::InvalidParameters(format!("{}: {}", self.id, e)))
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn device_id(&self) -> Option<&str> {
        self.param_str("deviceId")
    }

    pub fn display_name(&self) -> String {
        if let Some(name) = self.param_str("name").or_else(|| self.param_str("blockName")) {
            return name.to_string();
        }
        let skip = self.id.chars().count().saturating_sub(6);
        let short: String = self.id.chars().skip(skip).collect();
        format!("{} ({})", self.definition_id, short)
    }

    pub fn has_output_port(&self, port: &str) -> bool {
        self.output_ports.iter().any(|p| p == port)
    }
}

/// Outcome of executing one block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output_port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ExecutionResult {
    pub fn success(port: impl Into<String>) -> Self {
        Self {
            success: true,
            output_port: port.into(),
            error: None,
            data: None,
        }
    }

    pub fn failure(error: ExecutionError) -> Self {
        Self {
            success: false,
            output_port: ports::ON_ERROR_OUT.to_string(),
            error: Some(error),
            data: None,
        }
    }

    pub fn redirect(target_block_id: &str) -> Self {
        Self::success(ports::REDIRECT)
            .with_data(serde_json::json!({ "targetBlockId": target_block_id }))
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_redirect(&self) -> bool {
        self.output_port == ports::REDIRECT
    }

    pub fn redirect_target(&self) -> Option<&str> {
        self.data.as_ref()?.get("targetBlockId")?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_definition_ids() {
        for kind in BlockKind::ALL {
            assert_eq!(BlockKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(BlockKind::parse("pump"), None);
    }

    #[test]
    fn unknown_definition_keeps_block() {
        let def = BlockDefinition::new("b1", "mystery").with_output(ports::FLOW_OUT);
        let node = BlockNode::from_definition(&def);
        assert!(node.kind.is_none());
        assert!(node.has_output_port(ports::FLOW_OUT));
    }

    #[test]
    fn redirect_carries_target() {
        let result = ExecutionResult::redirect("b7");
        assert!(result.is_redirect());
        assert_eq!(result.redirect_target(), Some("b7"));
    }

    #[test]
    fn display_name_falls_back_to_kind_and_id() {
        let node = BlockNode::from_definition(&BlockDefinition::new("block_123456789", "wait"));
        assert_eq!(node.display_name(), "wait (456789)");
        let named = BlockNode::from_definition(
            &BlockDefinition::new("b", "wait").with_param("name", "Soak"),
        );
        assert_eq!(named.display_name(), "Soak");
    }
}
