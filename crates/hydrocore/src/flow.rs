use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type BlockId = String;

/// Block parameters as authored in the editor
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Complete flow definition, as produced by the flow editor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub blocks: Vec<BlockDefinition>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default, alias = "metadata")]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            blocks: Vec::new(),
            connections: Vec::new(),
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn add_block(&mut self, block: BlockDefinition) -> BlockId {
        let id = block.id.clone();
        self.blocks.push(block);
        id
    }

    /// Adds a connection and registers the port slots on both endpoints.
    pub fn connect(
        &mut self,
        source_block: &str,
        source_port: impl Into<String>,
        target_block: &str,
        target_port: impl Into<String>,
    ) {
        let connection = Connection {
            id: Some(format!("conn_{}", self.connections.len() + 1)),
            source_block_id: source_block.to_string(),
            source_port_id: source_port.into(),
            target_block_id: target_block.to_string(),
            target_port_id: target_port.into(),
        };

        let conn_id = connection.id.clone().unwrap_or_default();
        if let Some(source) = self.blocks.iter_mut().find(|b| b.id == source_block) {
            source
                .connections
                .outputs
                .entry(connection.source_port_id.clone())
                .or_default()
                .push(conn_id.clone());
        }
        if let Some(target) = self.blocks.iter_mut().find(|b| b.id == target_block) {
            target
                .connections
                .inputs
                .entry(connection.target_port_id.clone())
                .or_default()
                .push(conn_id);
        }

        self.connections.push(connection);
    }

    pub fn find_block(&self, id: &str) -> Option<&BlockDefinition> {
        self.blocks.iter().find(|b| b.id == id)
    }
}

/// One block placed on the canvas
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDefinition {
    pub id: BlockId,
    pub definition_id: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub connections: PortSlots,
}

impl BlockDefinition {
    pub fn new(id: impl Into<String>, definition_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            definition_id: definition_id.into(),
            parameters: Parameters::new(),
            connections: PortSlots::default(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Declares an output port even when nothing is wired to it yet.
    pub fn with_output(mut self, port: impl Into<String>) -> Self {
        self.connections.outputs.entry(port.into()).or_default();
        self
    }

    pub fn with_input(mut self, port: impl Into<String>) -> Self {
        self.connections.inputs.entry(port.into()).or_default();
        self
    }
}

/// Port slots of a block, each listing the ids of the connections attached to it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortSlots {
    #[serde(default)]
    pub inputs: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Vec<String>>,
}

/// Directed edge from an output port to an input port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source_block_id: BlockId,
    pub source_port_id: String,
    pub target_block_id: BlockId,
    pub target_port_id: String,
}
