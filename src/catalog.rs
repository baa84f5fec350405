//! The fixed set of tools the dispatch server exposes, with the parameter
//! schema used to validate calls before anything is sent to Blender.

use crate::error::{DispatchError, DispatchResult};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    /// Any JSON value, `null` included.
    Any,
}

impl ParamKind {
    fn accepts(self, value: &JsonValue) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Any => true,
        }
    }

    fn label(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    /// Name the agent uses.
    pub name: &'static str,
    /// Name the Blender add-on expects in `params`.
    pub wire_name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

const fn required(name: &'static str, wire_name: &'static str, kind: ParamKind) -> ParamSpec {
    ParamSpec {
        name,
        wire_name,
        kind,
        required: true,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    /// Command `type` sent over the wire.
    pub command: &'static str,
    pub params: &'static [ParamSpec],
    /// Only callable when arbitrary code execution has been switched on.
    pub gated: bool,
}

impl ToolDescriptor {
    /// Checks `args` against the schema and renames them to their wire names.
    pub fn wire_params(
        &self,
        args: &Map<String, JsonValue>,
    ) -> DispatchResult<Map<String, JsonValue>> {
        if let Some(unknown) = args
            .keys()
            .find(|key| !self.params.iter().any(|p| p.name == key.as_str()))
        {
            return Err(DispatchError::invalid(
                self.name,
                format!("unexpected argument `{unknown}`"),
            ));
        }

        let mut wire = Map::new();
        for spec in self.params {
            // `null` only stands for a value when any value is allowed.
            let given = args
                .get(spec.name)
                .filter(|value| !value.is_null() || spec.kind == ParamKind::Any);
            match given {
                None if spec.required => {
                    return Err(DispatchError::invalid(
                        self.name,
                        format!("missing required argument `{}`", spec.name),
                    ));
                }
                None => {}
                Some(value) if !spec.kind.accepts(value) => {
                    return Err(DispatchError::invalid(
                        self.name,
                        format!("argument `{}` must be a {}", spec.name, spec.kind.label()),
                    ));
                }
                Some(value) => {
                    wire.insert(spec.wire_name.to_string(), value.clone());
                }
            }
        }
        Ok(wire)
    }
}

pub const TOOLS: &[ToolDescriptor] = &[
    ToolDescriptor {
        name: "get_scene_info",
        description: "Get basic info about the current Blender scene (objects, materials).",
        command: "get_scene_info",
        params: &[],
        gated: false,
    },
    ToolDescriptor {
        name: "list_parts",
        description: "List the asset bound to each character slot and the variants available for Head/Waist/Arms/Legs.",
        command: "list_parts",
        params: &[],
        gated: false,
    },
    ToolDescriptor {
        name: "get_object_info",
        description: "Get detailed info about a named object.",
        command: "get_object_info",
        params: &[required("name", "name", ParamKind::String)],
        gated: false,
    },
    ToolDescriptor {
        name: "init_model",
        description: "Load the base character mesh plus its Marker_ objects.",
        command: "init_model",
        params: &[],
        gated: false,
    },
    ToolDescriptor {
        name: "execute_blender_code",
        description: "Run arbitrary Python code in Blender and return what it printed. Only available when the server was started with --allow-code-execution.",
        command: "execute_code",
        params: &[required("code", "code", ParamKind::String)],
        gated: true,
    },
    ToolDescriptor {
        name: "replace_part",
        description: "Swap the asset bound to a character slot (head, waist, arms, legs).",
        command: "replace_part",
        params: &[
            required("slot", "part_type", ParamKind::String),
            required("asset_id", "new_name", ParamKind::String),
        ],
        gated: false,
    },
    ToolDescriptor {
        name: "has_node_group",
        description: "Check if a Geometry Node Group exists.",
        command: "has_node_group",
        params: &[required("name", "group_name", ParamKind::String)],
        gated: false,
    },
    ToolDescriptor {
        name: "get_node_group_inputs",
        description: "Get the input sockets of a node group.",
        command: "get_node_group_inputs",
        params: &[required("name", "group_name", ParamKind::String)],
        gated: false,
    },
    ToolDescriptor {
        name: "set_node_group_input",
        description: "Set the value of a node group input.",
        command: "set_node_group_input",
        params: &[
            required("name", "group_name", ParamKind::String),
            required("input", "input_name", ParamKind::String),
            required("value", "value", ParamKind::Any),
        ],
        gated: false,
    },
];

pub fn lookup(name: &str) -> DispatchResult<&'static ToolDescriptor> {
    TOOLS
        .iter()
        .find(|tool| tool.name == name)
        .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))
}
