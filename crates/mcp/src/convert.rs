//! Mapping between rmcp wire types and parley's tool domain.

use parley_core::{Backend, ToolOperation, ToolPayload, ToolResult};
use rmcp::model::{CallToolResult, RawContent, Tool};
use serde_json::Value;

pub fn operation_from_tool(backend: Backend, tool: Tool) -> ToolOperation {
    ToolOperation {
        backend,
        name: tool.name.to_string(),
        description: tool.description.map(|text| text.to_string()).unwrap_or_default(),
        argument_schema: Value::Object((*tool.input_schema).clone()),
    }
}

/// Structured content wins; otherwise text blocks are joined with newlines.
/// Non-text blocks are summarised by kind so nothing binary reaches the guard.
pub fn result_from_call(result: CallToolResult) -> ToolResult {
    let is_error = result.is_error.unwrap_or(false);
    if let Some(structured) = result.structured_content {
        return ToolResult { payload: ToolPayload::Json(structured), is_error };
    }

    let text = result
        .content
        .into_iter()
        .map(|content| match content.raw {
            RawContent::Text(text) => text.text,
            RawContent::Image(image) => format!("[image: {}]", image.mime_type),
            RawContent::Audio(audio) => format!("[audio: {}]", audio.mime_type),
            RawContent::Resource(_) => "[embedded resource]".to_string(),
            RawContent::ResourceLink(link) => format!("[resource: {}]", link.uri),
        })
        .collect::<Vec<_>>()
        .join("\n");

    ToolResult { payload: ToolPayload::Text(text), is_error }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parley_core::{Backend, ToolPayload};
    use rmcp::model::{CallToolResult, Content, Tool};
    use serde_json::{json, Map, Value};

    use super::{operation_from_tool, result_from_call};

    fn schema() -> Map<String, Value> {
        let Value::Object(map) = json!({
            "type": "object",
            "required": ["path"],
            "properties": {"path": {"type": "string"}}
        }) else {
            return Map::new();
        };
        map
    }

    #[test]
    fn tool_maps_to_operation_with_schema() {
        let tool = Tool::new("list_directory", "List entries in a directory", Arc::new(schema()));

        let operation = operation_from_tool(Backend::Filesystem, tool);

        assert_eq!(operation.backend, Backend::Filesystem);
        assert_eq!(operation.name, "list_directory");
        assert_eq!(operation.description, "List entries in a directory");
        assert_eq!(operation.argument_schema["required"], json!(["path"]));
    }

    #[test]
    fn text_blocks_are_joined() {
        let result = CallToolResult::success(vec![
            Content::text("[DIR] src"),
            Content::text("[FILE] Cargo.toml"),
        ]);

        let mapped = result_from_call(result);

        assert!(!mapped.is_error);
        assert_eq!(mapped.payload, ToolPayload::Text("[DIR] src\n[FILE] Cargo.toml".into()));
    }

    #[test]
    fn error_flag_is_preserved() {
        let result = CallToolResult::error(vec![Content::text("Access denied")]);
        let mapped = result_from_call(result);
        assert!(mapped.is_error);
    }

    #[test]
    fn structured_content_is_preferred() {
        let result = CallToolResult::structured(json!({"totalSize": 1, "records": [{"Id": "1"}]}));
        let mapped = result_from_call(result);
        assert!(matches!(mapped.payload, ToolPayload::Json(ref value) if value["totalSize"] == 1));
    }
}
