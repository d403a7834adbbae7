use std::sync::Arc;

use serde_json::{json, Value};
use toolbridge_client::ApiClient;
use toolbridge_common::EntityKind;

use crate::rpc::RpcError;
use crate::session::{ContextAttachment, SessionTable};

/// A tool as surfaced by `tools/list`.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDef {
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

/// Tool-name prefix for an entity kind (`notes.create`, `tasks.process`).
pub fn tool_prefix(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Note => "notes",
        EntityKind::Task => "tasks",
        EntityKind::TaskList => "task_lists",
        EntityKind::Comment => "comments",
        EntityKind::Chat => "chats",
        EntityKind::ChatMessage => "chat_messages",
    }
}

fn kind_for_prefix(prefix: &str) -> Option<EntityKind> {
    EntityKind::ALL.into_iter().find(|kind| tool_prefix(*kind) == prefix)
}

fn uid_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"uid": {"type": "string", "description": "Entity UUID"}},
        "required": ["uid"],
    })
}

/// The full registry: CRUD + archive + process per kind, the raw sync
/// surface, and the session-scoped context attachments.
pub fn list_tools() -> Vec<ToolDef> {
    let mut tools = Vec::new();
    for kind in EntityKind::ALL {
        let prefix = tool_prefix(kind);
        let singular = kind.singular();
        tools.push(ToolDef {
            name: format!("{prefix}.create"),
            description: format!("Create a {singular}"),
            input_schema: json!({
                "type": "object",
                "properties": {"payload": {"type": "object", "description": "Entity document"}},
                "required": ["payload"],
            }),
        });
        tools.push(ToolDef {
            name: format!("{prefix}.get"),
            description: format!("Fetch a {singular} by uid"),
            input_schema: uid_schema(),
        });
        tools.push(ToolDef {
            name: format!("{prefix}.list"),
            description: format!("List {prefix} with cursor pagination"),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "cursor": {"type": "string"},
                    "includeDeleted": {"type": "boolean"},
                },
            }),
        });
        tools.push(ToolDef {
            name: format!("{prefix}.update"),
            description: format!("Replace a {singular}; optional optimistic lock"),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "uid": {"type": "string"},
                    "payload": {"type": "object"},
                    "ifMatch": {"type": "integer", "description": "Expected version"},
                },
                "required": ["uid", "payload"],
            }),
        });
        tools.push(ToolDef {
            name: format!("{prefix}.patch"),
            description: format!("Partially update a {singular}; null removes a field"),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "uid": {"type": "string"},
                    "payload": {"type": "object"},
                },
                "required": ["uid", "payload"],
            }),
        });
        tools.push(ToolDef {
            name: format!("{prefix}.delete"),
            description: format!("Soft-delete a {singular}"),
            input_schema: uid_schema(),
        });
        tools.push(ToolDef {
            name: format!("{prefix}.archive"),
            description: format!("Archive a {singular} (payload state, not deletion)"),
            input_schema: uid_schema(),
        });
        tools.push(ToolDef {
            name: format!("{prefix}.process"),
            description: format!("Run a named state transition on a {singular}"),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "uid": {"type": "string"},
                    "action": {"type": "string"},
                },
                "required": ["uid", "action"],
            }),
        });
    }

    tools.push(ToolDef {
        name: "sync.push".to_string(),
        description: "Push a batch of documents through the delta-sync engine".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "kind": {"type": "string", "description": "Entity kind path segment"},
                "items": {"type": "array", "items": {"type": "object"}},
            },
            "required": ["kind", "items"],
        }),
    });
    tools.push(ToolDef {
        name: "sync.pull".to_string(),
        description: "Pull upserts and tombstones since a cursor".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "kind": {"type": "string"},
                "cursor": {"type": "string"},
                "limit": {"type": "integer"},
            },
            "required": ["kind"],
        }),
    });
    tools.push(ToolDef {
        name: "context.attach".to_string(),
        description: "Pin an entity reference to this MCP session".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "entityUid": {"type": "string"},
                "entityKind": {"type": "string"},
                "title": {"type": "string"},
            },
            "required": ["entityUid", "entityKind", "title"],
        }),
    });
    tools.push(ToolDef {
        name: "context.list".to_string(),
        description: "List this session's pinned entity references".to_string(),
        input_schema: json!({"type": "object", "properties": {}}),
    });

    tools
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params(format!("missing string argument {key:?}")))
}

fn object_arg(args: &Value, key: &str) -> Result<Value, RpcError> {
    let value = args
        .get(key)
        .ok_or_else(|| RpcError::invalid_params(format!("missing argument {key:?}")))?;
    if !value.is_object() {
        return Err(RpcError::invalid_params(format!("argument {key:?} must be an object")));
    }
    Ok(value.clone())
}

fn kind_arg(args: &Value) -> Result<EntityKind, RpcError> {
    str_arg(args, "kind")?
        .parse()
        .map_err(|_| RpcError::invalid_params("unknown entity kind"))
}

/// Execute one tool call against the upstream API with the session's
/// passthrough client.
pub async fn dispatch(
    name: &str,
    args: &Value,
    client: &Arc<ApiClient>,
    sessions: &SessionTable,
    session_id: &str,
) -> Result<Value, RpcError> {
    let Some((prefix, op)) = name.split_once('.') else {
        return Err(RpcError::method_not_found(name));
    };

    match prefix {
        "sync" => match op {
            "push" => {
                let kind = kind_arg(args)?;
                let items = args
                    .get("items")
                    .and_then(Value::as_array)
                    .ok_or_else(|| RpcError::invalid_params("missing array argument \"items\""))?
                    .clone();
                let acks = client.push(kind, items).await?;
                Ok(serde_json::to_value(acks).unwrap_or_default())
            }
            "pull" => {
                let kind = kind_arg(args)?;
                let cursor = args.get("cursor").and_then(Value::as_str);
                let limit = args.get("limit").and_then(Value::as_u64).map(|v| v as usize);
                let page = client.pull(kind, cursor, limit).await?;
                Ok(serde_json::to_value(page).unwrap_or_default())
            }
            _ => Err(RpcError::method_not_found(name)),
        },
        "context" => match op {
            "attach" => {
                let attachment = ContextAttachment {
                    entity_uid: str_arg(args, "entityUid")?.to_string(),
                    entity_kind: str_arg(args, "entityKind")?.to_string(),
                    title: str_arg(args, "title")?.to_string(),
                };
                sessions.attach(session_id, attachment).await;
                let count = sessions.attachments(session_id).await.len();
                Ok(json!({"attached": true, "count": count}))
            }
            "list" => {
                let attachments = sessions.attachments(session_id).await;
                Ok(serde_json::to_value(attachments).unwrap_or_default())
            }
            _ => Err(RpcError::method_not_found(name)),
        },
        _ => {
            let Some(kind) = kind_for_prefix(prefix) else {
                return Err(RpcError::method_not_found(name));
            };
            dispatch_entity(kind, op, name, args, client).await
        }
    }
}

async fn dispatch_entity(
    kind: EntityKind,
    op: &str,
    name: &str,
    args: &Value,
    client: &Arc<ApiClient>,
) -> Result<Value, RpcError> {
    match op {
        "create" => {
            let payload = object_arg(args, "payload")?;
            let item = client.create(kind, payload).await?;
            Ok(item.payload)
        }
        "get" => {
            let item = client.get(kind, str_arg(args, "uid")?).await?;
            Ok(item.payload)
        }
        "list" => {
            let cursor = args.get("cursor").and_then(Value::as_str);
            let include_deleted = args
                .get("includeDeleted")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let page = client.list(kind, cursor, include_deleted).await?;
            Ok(serde_json::to_value(page).unwrap_or_default())
        }
        "update" => {
            let uid = str_arg(args, "uid")?;
            let payload = object_arg(args, "payload")?;
            let if_match = args.get("ifMatch").and_then(Value::as_u64);
            let item = client.update(kind, uid, payload, if_match).await?;
            Ok(item.payload)
        }
        "patch" => {
            let uid = str_arg(args, "uid")?;
            let payload = object_arg(args, "payload")?;
            let item = client.patch(kind, uid, payload).await?;
            Ok(item.payload)
        }
        "delete" => {
            client.delete(kind, str_arg(args, "uid")?).await?;
            Ok(json!({"deleted": true}))
        }
        "archive" => {
            let item = client.archive(kind, str_arg(args, "uid")?).await?;
            Ok(item.payload)
        }
        "process" => {
            let uid = str_arg(args, "uid")?;
            let action = str_arg(args, "action")?;
            let item = client.process(kind, uid, action).await?;
            Ok(item.payload)
        }
        _ => Err(RpcError::method_not_found(name)),
    }
}
