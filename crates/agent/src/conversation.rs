use std::collections::BTreeMap;
use std::path::Path;

use parley_core::{Backend, BoundedResult, ToolError, ToolOperation};
use serde_json::{json, Value};

use crate::llm::{ComposedToolResult, ToolOutcome};

/// Builds the system context handed to every oracle call.
pub fn system_context(working_directory: &Path) -> String {
    let directory = working_directory.display();
    format!(
        "You are a helpful assistant with access to tools on connected systems.\n\
         \n\
         Your working directory is: {directory}\n\
         \n\
         Tool usage:\n\
         1. Use a tool when it gives accurate, current information for the question.\n\
         2. If a tool needs a directory or path argument, use \"{directory}\".\n\
         3. Call at most one tool per message.\n\
         4. Present tool results in clear natural language.\n\
         5. Do not show raw JSON unless the user asks for it.\n\
         6. If a tool fails, explain what happened and suggest an alternative.\n\
         \n\
         Filesystem rules:\n\
         - Never request full directory trees.\n\
         - Limit directory depth to 2 levels.\n\
         - Prefer listing folder names only.\n\
         - Never return full file contents unless explicitly asked.\n\
         \n\
         Style: conversational, summarise data (\"I found 5 accounts\"), format lists readably."
    )
}

fn backend_label(backend: Backend) -> &'static str {
    match backend {
        Backend::Crm => "the CRM",
        Backend::RepoHost => "the code repository host",
        Backend::Filesystem => "the local filesystem",
    }
}

/// One-paragraph description of what the connected backends can do.
pub fn capability_summary(operations: &[ToolOperation]) -> String {
    if operations.is_empty() {
        return "I can answer general questions, but no tool backends are connected right now."
            .to_string();
    }

    let mut grouped: BTreeMap<Backend, Vec<&str>> = BTreeMap::new();
    for operation in operations {
        grouped.entry(operation.backend).or_default().push(operation.name.as_str());
    }

    let parts = grouped
        .iter()
        .map(|(backend, names)| {
            let preview = names.iter().take(4).copied().collect::<Vec<_>>().join(", ");
            let more = names.len().saturating_sub(4);
            if more > 0 {
                format!("{} ({preview} and {more} more)", backend_label(*backend))
            } else {
                format!("{} ({preview})", backend_label(*backend))
            }
        })
        .collect::<Vec<_>>();

    format!("I can look things up for you using {}.", parts.join("; "))
}

/// Plain-language notice for a tool step that did not produce a result.
/// `attempts` is how many times the call was dispatched.
pub fn failure_notice(error: &ToolError, attempts: u32) -> String {
    match error {
        ToolError::BackendUnavailable { backend, .. } => format!(
            "I couldn't reach {} right now, so I wasn't able to complete that request. \
             Please try again later.",
            backend_label(*backend)
        ),
        ToolError::BackendError { backend, .. } => {
            let retried = if attempts > 1 { ", even after a retry" } else { "" };
            format!(
                "{} returned an error while handling that request{retried}. \
                 You could try again or rephrase the request.",
                capitalize(backend_label(*backend))
            )
        }
        ToolError::InvalidArguments { operation, reason } => format!(
            "I couldn't run `{operation}` because the request was missing or had invalid \
             details ({reason}). Could you be more specific?"
        ),
    }
}

pub fn truncation_suffix(bounded: &BoundedResult) -> Option<String> {
    if !bounded.truncated {
        return None;
    }
    match (bounded.shown_items, bounded.total_items) {
        (Some(shown), Some(total)) => Some(format!(
            "(Showing {shown} of {total} items. Narrow the request to see the rest.)"
        )),
        _ => Some("(The output was long, so it was truncated.)".to_string()),
    }
}

/// Deterministic reply used when the compose call fails. Never echoes the payload.
pub fn fallback_reply(tool_result: Option<ComposedToolResult<'_>>) -> String {
    match tool_result {
        None => {
            "I'm having trouble putting together an answer right now. Please try again.".to_string()
        }
        Some(ComposedToolResult { call, bounded }) => {
            let mut reply = format!(
                "I ran `{}` on {}, but couldn't summarise the result just now.",
                call.operation,
                backend_label(call.backend)
            );
            if let Some(shown) = bounded.shown_items {
                reply.push_str(&format!(" It returned {shown} items."));
            }
            if let Some(suffix) = truncation_suffix(bounded) {
                reply.push(' ');
                reply.push_str(&suffix);
            }
            reply
        }
    }
}

pub fn raw_appendix(bounded: &BoundedResult) -> String {
    format!("\n\n```\n{}\n```", bounded.render())
}

/// Structured record stored as the tool turn.
pub fn tool_record(outcome: &ToolOutcome) -> Value {
    let detail = match outcome {
        ToolOutcome::None => Value::Null,
        ToolOutcome::Completed { bounded, .. } => json!({
            "shown_items": bounded.shown_items,
            "total_items": bounded.total_items,
        }),
        ToolOutcome::Rejected { guidance, .. } => Value::String(guidance.clone()),
        ToolOutcome::Failed { notice, .. } => Value::String(notice.clone()),
    };
    let call = outcome.call();
    json!({
        "backend": call.map(|call| call.backend.as_str()),
        "operation": call.map(|call| call.operation.as_str()),
        "status": outcome.status(),
        "truncated": outcome.truncated(),
        "detail": detail,
    })
}

fn capitalize(text: &str) -> String {
    let mut characters = text.chars();
    match characters.next() {
        Some(first) => first.to_uppercase().chain(characters).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use parley_core::{Backend, BoundedResult, ToolCallRef, ToolError, ToolPayload};
    use serde_json::json;

    use super::{
        capability_summary, failure_notice, fallback_reply, system_context, tool_record,
        truncation_suffix,
    };
    use crate::llm::{ComposedToolResult, ToolOutcome};
    use crate::testing::operation;

    fn listing(shown: usize, total: usize) -> BoundedResult {
        BoundedResult {
            content: ToolPayload::Json(json!(["a"])),
            truncated: shown < total,
            total_items: Some(total),
            shown_items: Some(shown),
        }
    }

    #[test]
    fn system_context_names_working_directory_and_depth_rule() {
        let context = system_context(Path::new("/srv/project"));
        assert!(context.contains("Your working directory is: /srv/project"));
        assert!(context.contains("Limit directory depth to 2 levels"));
    }

    #[test]
    fn capability_summary_groups_by_backend() {
        let operations = vec![
            operation(Backend::Filesystem, "list_directory", json!({})),
            operation(Backend::Crm, "run_soql_query", json!({})),
            operation(Backend::Filesystem, "read_file", json!({})),
        ];
        let summary = capability_summary(&operations);
        assert_eq!(
            summary,
            "I can look things up for you using the CRM (run_soql_query); \
             the local filesystem (list_directory, read_file)."
        );
        assert!(capability_summary(&[]).contains("no tool backends"));
    }

    #[test]
    fn failure_notice_never_contains_backend_detail() {
        let notice = failure_notice(
            &ToolError::BackendUnavailable {
                backend: Backend::Crm,
                reason: "ECONNREFUSED 10.0.0.7:443".to_owned(),
            },
            1,
        );
        assert!(notice.contains("couldn't reach the CRM"));
        assert!(!notice.contains("ECONNREFUSED"));
    }

    #[test]
    fn backend_error_notice_mentions_retry_only_when_one_happened() {
        let error = ToolError::BackendError {
            backend: Backend::RepoHost,
            message: "401 Bad credentials".to_owned(),
        };

        let once = failure_notice(&error, 1);
        assert!(once.starts_with("The code repository host returned an error"));
        assert!(!once.contains("retry"));
        assert!(!once.contains("Bad credentials"));

        assert!(failure_notice(&error, 2).contains("even after a retry"));
    }

    #[test]
    fn truncation_suffix_reports_counts() {
        assert_eq!(
            truncation_suffix(&listing(50, 500)).as_deref(),
            Some("(Showing 50 of 500 items. Narrow the request to see the rest.)")
        );
        assert_eq!(truncation_suffix(&listing(3, 3)), None);
    }

    #[test]
    fn fallback_reply_does_not_echo_payload() {
        let call = ToolCallRef { backend: Backend::Filesystem, operation: "list_directory".into() };
        let bounded = BoundedResult {
            content: ToolPayload::Text("secret-looking-content".into()),
            truncated: false,
            total_items: None,
            shown_items: None,
        };
        let reply = fallback_reply(Some(ComposedToolResult { call: &call, bounded: &bounded }));
        assert!(reply.contains("list_directory"));
        assert!(!reply.contains("secret-looking-content"));
    }

    #[test]
    fn tool_record_captures_status() {
        let call = ToolCallRef { backend: Backend::Crm, operation: "run_soql_query".into() };
        let record = tool_record(&ToolOutcome::Failed { call, notice: "down".into() });
        assert_eq!(record["backend"], "crm");
        assert_eq!(record["status"], "failed");
        assert_eq!(record["truncated"], false);
    }
}
