//! Prompts that turn a plain-language request into the add-on command it
//! asks for. Each prompt takes the user's text and answers with the command
//! JSON, or with no messages when the text is not about its command.

use regex::Regex;
use rmcp::model::{
    GetPromptResult, JsonObject, Prompt, PromptArgument, PromptMessage, PromptMessageRole,
};
use rmcp::ErrorData;
use serde_json::{json, Value as JsonValue};
use std::sync::LazyLock;

pub const USER_INPUT: &str = "user_input";

static CHARACTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(female|role|character|human)\b").unwrap());
static PART_QUESTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(what|which|list|get)\b.*\b(arm|leg|head|waist)s?\b").unwrap()
});
static ASSET_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]+_[A-Za-z]+").unwrap());
static REPLACEMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(Head|Arm|Leg|Waist)_([A-Za-z0-9]+)\b").unwrap());

struct PromptRoute {
    name: &'static str,
    description: &'static str,
    route: fn(&str) -> Option<JsonValue>,
}

const ROUTES: &[PromptRoute] = &[
    PromptRoute {
        name: "init_model_prompt",
        description: "Start a new character when the request mentions one.",
        route: init_model_route,
    },
    PromptRoute {
        name: "list_parts_prompt",
        description: "List body-part variants when the request asks which ones exist.",
        route: list_parts_route,
    },
    PromptRoute {
        name: "replace_part_prompt",
        description: "Swap in a part when the request names a variant such as Head_Helmet.",
        route: replace_part_route,
    },
];

fn command(kind: &str, params: JsonValue) -> JsonValue {
    json!({ "type": kind, "params": params })
}

pub fn init_model_route(input: &str) -> Option<JsonValue> {
    CHARACTER_RE
        .is_match(input)
        .then(|| command("init_model", json!({})))
}

/// Questions that already name a concrete asset are left to `replace_part_route`.
pub fn list_parts_route(input: &str) -> Option<JsonValue> {
    (PART_QUESTION_RE.is_match(input) && !ASSET_NAME_RE.is_match(input))
        .then(|| command("list_parts", json!({})))
}

pub fn replace_part_route(input: &str) -> Option<JsonValue> {
    let captures = REPLACEMENT_RE.captures(input)?;
    let part_type = &captures[1];
    Some(command(
        "replace_part",
        json!({
            "part_type": part_type,
            "new_name": format!("{part_type}_{}", &captures[2]),
        }),
    ))
}

pub fn list() -> Vec<Prompt> {
    ROUTES
        .iter()
        .map(|route| {
            Prompt::new(
                route.name,
                Some(route.description),
                Some(vec![PromptArgument {
                    name: USER_INPUT.to_string(),
                    description: Some("What the user asked for".to_string()),
                    required: Some(true),
                }]),
            )
        })
        .collect()
}

pub fn get(name: &str, arguments: Option<&JsonObject>) -> Result<GetPromptResult, ErrorData> {
    let route = ROUTES
        .iter()
        .find(|route| route.name == name)
        .ok_or_else(|| ErrorData::invalid_params(format!("Unknown prompt: {name}"), None))?;
    let input = arguments
        .and_then(|args| args.get(USER_INPUT))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| {
            ErrorData::invalid_params(format!("{name} needs a `{USER_INPUT}` string"), None)
        })?;

    Ok(match (route.route)(input) {
        Some(command) => {
            tracing::debug!("{name} matched: {command}");
            GetPromptResult {
                description: Some(route.description.to_string()),
                messages: vec![PromptMessage::new_text(
                    PromptMessageRole::User,
                    command.to_string(),
                )],
            }
        }
        None => GetPromptResult {
            description: Some(format!("{name} does not apply to this request")),
            messages: Vec::new(),
        },
    })
}
