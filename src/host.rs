//! Capability interface onto the 3D application and the handler table that
//! maps wire commands onto it.

use crate::protocol::{CommandMessage, ResultMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Unknown command type: {0}")]
    UnknownCommand(String),
    #[error("Invalid params for {command}: {reason}")]
    InvalidParams { command: String, reason: String },
    #[error("Object not found: {0}")]
    ObjectNotFound(String),
    #[error("Node group not found: {0}")]
    NodeGroupNotFound(String),
    #[error("Node group '{group}' has no input named '{input}'")]
    InputNotFound { group: String, input: String },
    #[error("Unknown part slot: {0} (expected head, waist, arms or legs)")]
    UnknownSlot(String),
    #[error("Asset '{asset}' is not available for slot {slot}")]
    UnknownAsset { slot: PartSlot, asset: String },
    #[error("No assets are available for slot {0}")]
    EmptyLibrary(PartSlot),
    #[error("No character model is loaded; call init_model first")]
    ModelNotLoaded,
    #[error("This host cannot run {0}")]
    Unsupported(&'static str),
    #[error("Code execution error: {0}")]
    Script(String),
    #[error("Could not encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type HostResult<T> = std::result::Result<T, HostError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartSlot {
    Head,
    Waist,
    Arms,
    Legs,
}

impl PartSlot {
    pub const ALL: [PartSlot; 4] = [PartSlot::Head, PartSlot::Waist, PartSlot::Arms, PartSlot::Legs];

    /// Prefix carried by asset names for this slot, e.g. `Arm_Armored`.
    pub fn asset_prefix(self) -> &'static str {
        match self {
            PartSlot::Head => "Head",
            PartSlot::Waist => "Waist",
            PartSlot::Arms => "Arm",
            PartSlot::Legs => "Leg",
        }
    }
}

impl fmt::Display for PartSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartSlot::Head => "head",
            PartSlot::Waist => "waist",
            PartSlot::Arms => "arms",
            PartSlot::Legs => "legs",
        };
        f.write_str(name)
    }
}

impl FromStr for PartSlot {
    type Err = HostError;

    fn from_str(s: &str) -> HostResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "head" | "heads" => Ok(PartSlot::Head),
            "waist" | "waists" => Ok(PartSlot::Waist),
            "arm" | "arms" => Ok(PartSlot::Arms),
            "leg" | "legs" => Ok(PartSlot::Legs),
            _ => Err(HostError::UnknownSlot(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectKind {
    Mesh,
    Empty,
    Camera,
    Light,
    Curve,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub location: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneInfo {
    pub name: String,
    pub object_count: usize,
    pub objects: Vec<ObjectSummary>,
    pub materials_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshStats {
    pub vertices: usize,
    pub edges: usize,
    pub polygons: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub location: [f64; 3],
    pub rotation: [f64; 3],
    pub scale: [f64; 3],
    pub visible: bool,
    pub materials: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_bounding_box: Option<[[f64; 3]; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshStats>,
}

/// `status`/`message` pair the add-on returns for character operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: String,
    pub message: String,
}

impl StatusReport {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartListing {
    /// Asset currently bound to each slot; empty until a model is loaded.
    pub bound: BTreeMap<PartSlot, String>,
    pub available: BTreeMap<PartSlot, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupInputInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub default: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInputUpdate {
    pub modified_modifiers: usize,
    pub group: String,
    pub input: String,
    pub new_value: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeOutput {
    pub executed: bool,
    pub result: String,
}

/// Everything the executor needs from the 3D application. Implementations
/// are only ever called from the single tick driver, one command at a time.
pub trait SceneHost {
    fn get_scene_info(&self) -> HostResult<SceneInfo>;

    fn get_object_info(&self, name: &str) -> HostResult<ObjectInfo>;

    fn init_model(&mut self) -> HostResult<StatusReport>;

    fn list_parts(&self) -> HostResult<PartListing>;

    fn replace_part(&mut self, slot: PartSlot, asset: &str) -> HostResult<StatusReport>;

    fn has_node_group(&self, name: &str) -> bool;

    fn get_node_group_inputs(&self, name: &str) -> HostResult<Vec<NodeGroupInputInfo>>;

    fn set_node_group_input(
        &mut self,
        group: &str,
        input: &str,
        value: JsonValue,
    ) -> HostResult<NodeInputUpdate>;

    /// Runs a script inside the application and returns what it printed.
    fn execute_code(&mut self, _code: &str) -> HostResult<CodeOutput> {
        Err(HostError::Unsupported("scripts"))
    }
}

#[derive(Deserialize)]
struct ObjectParams {
    #[serde(alias = "object_name")]
    name: String,
}

#[derive(Deserialize)]
struct CodeParams {
    code: String,
}

#[derive(Deserialize)]
struct ReplacePartParams {
    #[serde(alias = "slot")]
    part_type: String,
    #[serde(alias = "asset_id")]
    new_name: String,
}

#[derive(Deserialize)]
struct GroupParams {
    #[serde(alias = "name")]
    group_name: String,
}

#[derive(Deserialize)]
struct SetInputParams {
    #[serde(alias = "name")]
    group_name: String,
    #[serde(alias = "input")]
    input_name: String,
    value: JsonValue,
}

fn params<T: DeserializeOwned>(command: &str, params: Map<String, JsonValue>) -> HostResult<T> {
    serde_json::from_value(JsonValue::Object(params)).map_err(|err| HostError::InvalidParams {
        command: command.to_string(),
        reason: err.to_string(),
    })
}

fn run_handler<H: SceneHost + ?Sized>(
    host: &mut H,
    kind: &str,
    raw: Map<String, JsonValue>,
) -> HostResult<JsonValue> {
    let result = match kind {
        "get_scene_info" => serde_json::to_value(host.get_scene_info()?)?,
        "get_object_info" => {
            let p: ObjectParams = params(kind, raw)?;
            serde_json::to_value(host.get_object_info(&p.name)?)?
        }
        "execute_code" => {
            let p: CodeParams = params(kind, raw)?;
            serde_json::to_value(host.execute_code(&p.code)?)?
        }
        "init_model" => serde_json::to_value(host.init_model()?)?,
        "list_parts" => serde_json::to_value(host.list_parts()?)?,
        "replace_part" => {
            let p: ReplacePartParams = params(kind, raw)?;
            let slot = p.part_type.parse()?;
            serde_json::to_value(host.replace_part(slot, &p.new_name)?)?
        }
        "has_node_group" => {
            let p: GroupParams = params(kind, raw)?;
            JsonValue::Bool(host.has_node_group(&p.group_name))
        }
        "get_node_group_inputs" => {
            let p: GroupParams = params(kind, raw)?;
            serde_json::to_value(host.get_node_group_inputs(&p.group_name)?)?
        }
        "set_node_group_input" => {
            let p: SetInputParams = params(kind, raw)?;
            serde_json::to_value(host.set_node_group_input(&p.group_name, &p.input_name, p.value)?)?
        }
        other => return Err(HostError::UnknownCommand(other.to_string())),
    };
    Ok(result)
}

/// Executes one command against `host`. Always produces exactly one result
/// carrying the command's id; handler failures become error results.
pub fn handle_command<H: SceneHost + ?Sized>(host: &mut H, command: CommandMessage) -> ResultMessage {
    let CommandMessage { kind, params, id } = command;
    tracing::info!("Executing handler for {kind}");
    match run_handler(host, &kind, params) {
        Ok(result) => {
            tracing::debug!("Handler execution complete");
            ResultMessage::success(id, result)
        }
        Err(err) => {
            tracing::warn!("Error in handler for {kind}: {err}");
            ResultMessage::error(id, err.to_string())
        }
    }
}
