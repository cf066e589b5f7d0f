//! The stdio MCP tool-call surface: newline-delimited JSON requests on
//! stdin, newline-delimited JSON responses on stdout. A malformed request
//! or a validation failure is reported as text, never a protocol error —
//! the boundary between a caller's tool call and its argument never
//! produces an uncaught exception (the teacher's `web.rs` plays the same
//! role for REST with `ApiError`; this is the stdio analogue).

use crate::model::{Entry, GroupDeleteMode, StructuredData};
use crate::runtime::Runtime;
use crate::selfmodel;
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(serde::Deserialize)]
struct ToolRequest {
    tool: String,
    #[serde(default)]
    arguments: Value,
}

/// Reads one JSON request per line from `stdin` until EOF, dispatches it,
/// and writes one JSON response per line to `stdout`.
pub async fn run(runtime: Arc<Runtime>) -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ToolRequest>(&line) {
            Ok(req) => {
                let text = dispatch(&runtime, &req.tool, req.arguments).await;
                tool_response(text)
            }
            Err(err) => {
                warn!("malformed MCP request: {err}");
                tool_response(format!("error: malformed request: {err}"))
            }
        };
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn tool_response(text: String) -> String {
    json!({"content": [{"type": "text", "text": text}]}).to_string()
}

async fn dispatch(runtime: &Runtime, tool: &str, args: Value) -> String {
    let result = match tool {
        // ---- entries ----
        "save_context" => save_context(runtime, &args).await,
        "recall_context" => recall_context(runtime, &args).await,
        "list_contexts" => list_contexts(runtime, &args).await,
        "update_context" => update_context(runtime, &args).await,
        "delete_context" => delete_context(runtime, &args).await,
        "search_context" => search_context(runtime, &args).await,

        // ---- groups ----
        "create_group" => create_group(runtime, &args).await,
        "list_groups" => list_groups(runtime).await,
        "update_group" => update_group(runtime, &args).await,
        "delete_group" => delete_group(runtime, &args).await,

        // ---- named ----
        "describe_schema" => Ok(runtime.describe_schema()),
        "save_typed_context" => save_typed_context(runtime, &args).await,
        "query_by_type" => query_by_type(runtime, &args).await,
        "introspect" => introspect(runtime, &args).await,
        "get_gaps" => get_gaps(runtime).await,
        "report_usefulness" => report_usefulness(runtime, &args).await,
        "analyze_contradictions" => analyze_contradictions(runtime).await,
        "suggest_schema" => suggest_schema(runtime).await,
        "summarize_context" => summarize_context(runtime, &args).await,
        "get_improvements" => get_improvements(runtime, &args).await,
        "review_pending_actions" => review_pending_actions(runtime).await,
        "approve_action" => approve_action(runtime, &args).await,
        "dismiss_action" => dismiss_action(runtime, &args).await,

        other => Err(format!("unknown tool: {other}")),
    };
    match result {
        Ok(text) => text,
        Err(message) => {
            error!("tool {tool} failed: {message}");
            format!("error: {message}")
        }
    }
}

// ---- argument helpers -------------------------------------------------

fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required string argument \"{key}\""))
}

fn arg_str_opt<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn arg_bool_opt(args: &Value, key: &str) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn arg_vec_str(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn arg_structured_data(args: &Value, key: &str) -> Result<StructuredData, String> {
    let Some(value) = args.get(key) else {
        return Ok(StructuredData::new());
    };
    serde_json::from_value(value.clone()).map_err(|err| format!("invalid \"{key}\": {err}"))
}

fn to_text<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|err| format!("failed to render result: {err}"))
}

fn describe_entries(entries: &[Entry]) -> Result<String, String> {
    if entries.is_empty() {
        return Ok("no matching entries".to_string());
    }
    to_text(entries)
}

// ---- entry tools --------------------------------------------------------

async fn save_context(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let content = arg_str(args, "content")?.to_string();
    let tags = arg_vec_str(args, "tags");
    let source = arg_str_opt(args, "source").unwrap_or("agent").to_string();
    let group_id = arg_str_opt(args, "bubbleId").map(str::to_string);
    let entry = runtime
        .save_context(content, tags, source, group_id)
        .map_err(|e| e.to_string())?;
    to_text(&entry)
}

async fn recall_context(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let query = arg_str(args, "query")?;
    let entries = runtime.recall_context(query).map_err(|e| e.to_string())?;
    describe_entries(&entries)
}

async fn search_context(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let query = arg_str(args, "query")?;
    let entries = runtime.search_context(query).map_err(|e| e.to_string())?;
    describe_entries(&entries)
}

async fn list_contexts(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let tag = arg_str_opt(args, "tag");
    let entries = runtime.list_contexts(tag).map_err(|e| e.to_string())?;
    describe_entries(&entries)
}

async fn update_context(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let id = arg_str(args, "id")?;
    let content = arg_str_opt(args, "content").map(str::to_string);
    let tags = args.get("tags").map(|_| arg_vec_str(args, "tags"));
    let entry = runtime
        .update_context(id, content, tags)
        .map_err(|e| e.to_string())?;
    to_text(&entry)
}

async fn delete_context(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let id = arg_str(args, "id")?;
    runtime.delete_context(id).map_err(|e| e.to_string())?;
    Ok(format!("deleted {id}"))
}

// ---- group tools ----------------------------------------------------------

async fn create_group(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let name = arg_str(args, "name")?.to_string();
    let description = arg_str_opt(args, "description").map(str::to_string);
    let group = runtime
        .create_group(name, description)
        .map_err(|e| e.to_string())?;
    to_text(&group)
}

async fn list_groups(runtime: &Runtime) -> Result<String, String> {
    let groups = runtime.list_groups().map_err(|e| e.to_string())?;
    to_text(&groups)
}

async fn update_group(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let id = arg_str(args, "id")?;
    let name = arg_str_opt(args, "name").map(str::to_string);
    let description = arg_str_opt(args, "description").map(str::to_string);
    let group = runtime
        .update_group(id, name, description)
        .map_err(|e| e.to_string())?;
    to_text(&group)
}

async fn delete_group(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let id = arg_str(args, "id")?;
    let mode = if arg_bool_opt(args, "cascade") {
        GroupDeleteMode::Cascade
    } else {
        GroupDeleteMode::Orphan
    };
    runtime.delete_group(id, mode).map_err(|e| e.to_string())?;
    Ok(format!("deleted group {id}"))
}

// ---- named tools ------------------------------------------------------

async fn save_typed_context(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let type_name = arg_str(args, "typeName")?;
    let data = arg_structured_data(args, "data")?;
    let tags = arg_vec_str(args, "tags");
    let source = arg_str_opt(args, "source").unwrap_or("agent").to_string();
    let (entry, errors) = runtime
        .save_typed_context(type_name, data, tags, source)
        .map_err(|e| e.to_string())?;
    to_text(&json!({"entry": entry, "validationErrors": errors}))
}

async fn query_by_type(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let type_name = arg_str(args, "typeName")?;
    let filter = arg_structured_data(args, "filter")?;
    let ranked = arg_bool_opt(args, "ranked");
    let entries = runtime
        .query_by_type(type_name, &filter, ranked)
        .await
        .map_err(|e| e.to_string())?;
    describe_entries(&entries)
}

async fn introspect(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let deep = arg_bool_opt(args, "deep");
    let model = runtime.introspect(deep).await.map_err(|e| e.to_string())?;
    Ok(selfmodel::render(&model))
}

async fn get_gaps(runtime: &Runtime) -> Result<String, String> {
    let gaps = runtime.get_gaps().await.map_err(|e| e.to_string())?;
    if gaps.is_empty() {
        return Ok("no gaps identified".to_string());
    }
    to_text(&gaps)
}

async fn report_usefulness(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let id = arg_str(args, "id")?;
    let helpful = arg_bool_opt(args, "helpful");
    runtime
        .report_usefulness(id, helpful)
        .map_err(|e| e.to_string())?;
    Ok("recorded".to_string())
}

async fn analyze_contradictions(runtime: &Runtime) -> Result<String, String> {
    let contradictions = runtime
        .analyze_contradictions()
        .await
        .map_err(|e| e.to_string())?;
    if contradictions.is_empty() {
        return Ok("no contradictions found".to_string());
    }
    to_text(&contradictions)
}

async fn suggest_schema(runtime: &Runtime) -> Result<String, String> {
    let suggestions = runtime.suggest_schema().await.map_err(|e| e.to_string())?;
    if suggestions.is_empty() {
        return Ok("no schema suggestions".to_string());
    }
    to_text(&suggestions)
}

async fn summarize_context(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let focus = arg_str_opt(args, "focus");
    runtime
        .summarize_context(focus)
        .await
        .map_err(|e| e.to_string())
}

async fn get_improvements(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let since = arg_str_opt(args, "since")
        .map(|s| {
            chrono::DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|err| format!("invalid \"since\": {err}"))
        })
        .transpose()?;
    let records = runtime.get_improvements(since).map_err(|e| e.to_string())?;
    if records.is_empty() {
        return Ok("no improvement records".to_string());
    }
    to_text(&records)
}

async fn review_pending_actions(runtime: &Runtime) -> Result<String, String> {
    let pending = runtime
        .review_pending_actions()
        .map_err(|e| e.to_string())?;
    if pending.is_empty() {
        return Ok("no pending actions".to_string());
    }
    to_text(&pending)
}

async fn approve_action(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let id = arg_str(args, "id")?;
    let action = runtime.approve_action(id).map_err(|e| e.to_string())?;
    match action {
        Some(action) => to_text(&json!({"executed": true, "action": action})),
        None => Ok(format!("no pending action with id {id}")),
    }
}

async fn dismiss_action(runtime: &Runtime, args: &Value) -> Result<String, String> {
    let id = arg_str(args, "id")?;
    let reason = arg_str_opt(args, "reason").map(str::to_string);
    let dismissed = runtime
        .dismiss_action(id, reason)
        .map_err(|e| e.to_string())?;
    if dismissed {
        Ok(format!("dismissed {id}"))
    } else {
        Ok(format!("no pending action with id {id}"))
    }
}
