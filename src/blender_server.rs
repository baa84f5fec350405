use crate::dispatch::{Dispatcher, Transport};
use crate::error::DispatchResult;
use crate::prompts;
use rmcp::{
    handler::server::tool::{Parameters, ToolRouter},
    model::{
        CallToolResult, Content, GetPromptRequestParam, GetPromptResult, Implementation,
        ListPromptsResult, PaginatedRequestParam, ProtocolVersion, ServerCapabilities, ServerInfo,
    },
    schemars,
    service::RequestContext,
    tool, tool_handler, tool_router, ErrorData, RoleServer, ServerHandler,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::future::Future;
use std::sync::Arc;

pub const NODE_CITY_GROUP: &str = "NodeCity";

pub type SharedDispatcher = Arc<Dispatcher<Box<dyn Transport>>>;

#[derive(Clone)]
pub struct BlenderServer {
    dispatcher: SharedDispatcher,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for BlenderServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_prompts()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Inspect and edit the open Blender scene. Call init_model before list_parts or \
                 replace_part, and use the node group tools to tune NodeCity."
                    .to_string(),
            ),
        }
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, ErrorData> {
        Ok(ListPromptsResult {
            next_cursor: None,
            prompts: prompts::list(),
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, ErrorData> {
        prompts::get(&request.name, request.arguments.as_ref())
    }
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema, Clone)]
struct ObjectName {
    #[schemars(description = "Name of the object in the scene")]
    name: String,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema, Clone)]
struct RunCode {
    #[schemars(description = "Python code to run inside Blender")]
    code: String,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema, Clone)]
struct ReplacePart {
    #[schemars(description = "Character slot: head, waist, arms or legs")]
    slot: String,
    #[schemars(description = "Asset to bind, as listed by list_parts")]
    asset_id: String,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema, Clone)]
struct NodeGroupName {
    #[schemars(description = "Name of the geometry node group")]
    name: String,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema, Clone)]
struct NodeGroupInputValue {
    #[schemars(description = "Name of the geometry node group")]
    name: String,
    #[schemars(description = "Name of the group input to change")]
    input: String,
    #[schemars(description = "New default value for the input")]
    value: JsonValue,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema, Clone)]
struct NodeCityParams {
    #[schemars(description = "NodeCity input names mapped to their new values")]
    params: Map<String, JsonValue>,
}

#[tool_router]
impl BlenderServer {
    pub fn new(dispatcher: SharedDispatcher) -> Self {
        let mut tool_router = Self::tool_router();
        if !dispatcher.allows_code_execution() {
            tool_router.remove_route::<(), ()>("execute_blender_code");
        }
        Self {
            dispatcher,
            tool_router,
        }
    }

    #[tool(description = "Get basic info about the current Blender scene (objects, materials).")]
    async fn get_scene_info(&self) -> Result<CallToolResult, ErrorData> {
        self.generic_tool_run("get_scene_info", JsonValue::Null, pretty)
            .await
    }

    #[tool(
        description = "List the asset bound to each character slot and the variants available for Head/Waist/Arms/Legs."
    )]
    async fn list_parts(&self) -> Result<CallToolResult, ErrorData> {
        self.generic_tool_run("list_parts", JsonValue::Null, pretty)
            .await
    }

    #[tool(description = "Get detailed info about a named object.")]
    async fn get_object_info(
        &self,
        Parameters(args): Parameters<ObjectName>,
    ) -> Result<CallToolResult, ErrorData> {
        self.generic_tool_run("get_object_info", json!({"name": args.name}), pretty)
            .await
    }

    #[tool(description = "Load the base character mesh plus its Marker_ objects.")]
    async fn init_model(&self) -> Result<CallToolResult, ErrorData> {
        self.generic_tool_run("init_model", JsonValue::Null, status_message)
            .await
    }

    #[tool(
        description = "Run arbitrary Python code in Blender and return what it printed. Only available when the server was started with --allow-code-execution."
    )]
    async fn execute_blender_code(
        &self,
        Parameters(args): Parameters<RunCode>,
    ) -> Result<CallToolResult, ErrorData> {
        self.generic_tool_run("execute_blender_code", json!({"code": args.code}), code_output)
            .await
    }

    #[tool(description = "Swap the asset bound to a character slot (head, waist, arms, legs).")]
    async fn replace_part(
        &self,
        Parameters(args): Parameters<ReplacePart>,
    ) -> Result<CallToolResult, ErrorData> {
        let args = json!({"slot": args.slot, "asset_id": args.asset_id});
        self.generic_tool_run("replace_part", args, status_message)
            .await
    }

    #[tool(description = "Check if a Geometry Node Group exists.")]
    async fn has_node_group(
        &self,
        Parameters(args): Parameters<NodeGroupName>,
    ) -> Result<CallToolResult, ErrorData> {
        let name = args.name;
        self.generic_tool_run("has_node_group", json!({"name": name}), |result| {
            group_exists(&name, &result)
        })
        .await
    }

    #[tool(description = "Get the input sockets of a node group.")]
    async fn get_node_group_inputs(
        &self,
        Parameters(args): Parameters<NodeGroupName>,
    ) -> Result<CallToolResult, ErrorData> {
        let name = args.name;
        self.generic_tool_run("get_node_group_inputs", json!({"name": name}), |result| {
            input_listing(&name, &result)
        })
        .await
    }

    #[tool(description = "Set the value of a node group input.")]
    async fn set_node_group_input(
        &self,
        Parameters(args): Parameters<NodeGroupInputValue>,
    ) -> Result<CallToolResult, ErrorData> {
        let input = args.input.clone();
        let args = json!({"name": args.name, "input": args.input, "value": args.value});
        self.generic_tool_run("set_node_group_input", args, |result| {
            input_updated(&input, &result)
        })
        .await
    }

    #[tool(description = "Scan and return all input sockets of the 'NodeCity' node group.")]
    async fn scan_nodecity_inputs(&self) -> Result<CallToolResult, ErrorData> {
        self.generic_tool_run(
            "get_node_group_inputs",
            json!({"name": NODE_CITY_GROUP}),
            |result| input_listing(NODE_CITY_GROUP, &result),
        )
        .await
    }

    #[tool(
        description = "Set several 'NodeCity' inputs at once; each entry of params maps an input name to its new value."
    )]
    async fn create_nodecity(
        &self,
        Parameters(args): Parameters<NodeCityParams>,
    ) -> Result<CallToolResult, ErrorData> {
        if args.params.is_empty() {
            return Ok(CallToolResult::error(vec![Content::text(
                "No NodeCity inputs were given",
            )]));
        }

        let mut lines = Vec::with_capacity(args.params.len());
        let mut failures = 0;
        for (input, value) in args.params {
            let call = json!({"name": NODE_CITY_GROUP, "input": &input, "value": value});
            match self.dispatcher.call("set_node_group_input", call).await {
                Ok(result) => lines.push(input_updated(&input, &result)),
                Err(err) => {
                    tracing::warn!("Setting {NODE_CITY_GROUP}.{input} failed: {err}");
                    failures += 1;
                    lines.push(format!("Failed to set {input}: {err}"));
                }
            }
        }

        let text = vec![Content::text(lines.join("\n"))];
        if failures == lines.len() {
            Ok(CallToolResult::error(text))
        } else {
            Ok(CallToolResult::success(text))
        }
    }

    async fn generic_tool_run<F>(
        &self,
        tool: &str,
        args: JsonValue,
        shape: F,
    ) -> Result<CallToolResult, ErrorData>
    where
        F: FnOnce(JsonValue) -> String,
    {
        tracing::debug!("Running tool {tool} with {args}");
        match self.dispatcher.call(tool, args).await {
            Ok(result) => {
                let text = shape(result);
                tracing::debug!("Sending to MCP: {text}");
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(err) => {
                tracing::error!("Tool {tool} failed: {err}");
                Ok(CallToolResult::error(vec![Content::text(err.to_string())]))
            }
        }
    }

    /// Logs whether `group` is present in the open file.
    pub async fn check_startup_node_group(&self, group: &str) -> DispatchResult<bool> {
        let result = self
            .dispatcher
            .call("has_node_group", json!({"name": group}))
            .await
            .inspect_err(|e| tracing::error!("Error checking {group}: {e}"))?;
        let found = exists(&result);
        if found {
            tracing::info!("Found '{group}' node group");
        } else {
            tracing::warn!("'{group}' node group not found in project");
        }
        Ok(found)
    }
}

fn pretty(result: JsonValue) -> String {
    serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string())
}

/// Renders a value the way it reads in a sentence: strings unquoted.
fn plain(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn status_message(result: JsonValue) -> String {
    match result.get("message").and_then(JsonValue::as_str) {
        Some(message) => message.to_string(),
        None => pretty(result),
    }
}

fn code_output(result: JsonValue) -> String {
    let output = result.get("result").map(plain).unwrap_or_default();
    format!("Code executed successfully: {output}")
}

// Older add-ons wrap the flag as {"result": bool}.
fn exists(result: &JsonValue) -> bool {
    match result {
        JsonValue::Bool(found) => *found,
        JsonValue::Object(map) => map.get("result").and_then(JsonValue::as_bool).unwrap_or(false),
        _ => false,
    }
}

fn group_exists(group: &str, result: &JsonValue) -> String {
    let found = if exists(result) { "True" } else { "False" };
    format!("Node group '{group}' exists: {found}")
}

fn input_listing(group: &str, result: &JsonValue) -> String {
    let inputs: &[JsonValue] = match result {
        JsonValue::Array(inputs) => inputs.as_slice(),
        JsonValue::Object(map) => map
            .get("result")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    };
    if inputs.is_empty() {
        return format!("No inputs for '{group}'");
    }
    let lines: Vec<String> = inputs
        .iter()
        .map(|input| {
            let field = |key: &str| input.get(key).map(plain).unwrap_or_default();
            format!(
                "- {} ({}), default={}",
                field("name"),
                field("type"),
                field("default")
            )
        })
        .collect();
    format!("Inputs for '{group}':\n{}", lines.join("\n"))
}

fn input_updated(input: &str, result: &JsonValue) -> String {
    let input = result.get("input").and_then(JsonValue::as_str).unwrap_or(input);
    match result.get("new_value") {
        Some(value) => format!("{input} default set to {}", plain(value)),
        None => format!("{input} updated"),
    }
}
