//! Decodes one assembled frame into a [`Delta`].

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("invalid JSON frame: {source}")]
pub struct DecodeError {
    #[source]
    source: serde_json::Error,
}

/// One tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub function_name: String,
    pub command: String,
    pub reason: String,
}

/// Semantic content of one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    ContentChunk(String),
    ToolInvocations {
        invocations: Vec<ToolInvocation>,
        /// The `tool_calls` array exactly as received, for the conversation log.
        raw: serde_json::Value,
    },
    EndOfTurn,
}

// `null` and a missing field decode the same way.
#[derive(Debug, Deserialize)]
struct ChunkWire {
    #[serde(default)]
    choices: Option<Vec<ChoiceWire>>,
}

#[derive(Debug, Deserialize)]
struct ChoiceWire {
    #[serde(default)]
    delta: Option<DeltaWire>,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaWire {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolCallWire {
    #[serde(default)]
    id: String,
    #[serde(default)]
    function: FunctionWire,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionWire {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Decodes a frame. `Ok(None)` means the frame had no choice to act on
/// (usage-only or keep-alive payloads).
pub fn decode_frame(frame: &str) -> Result<Option<Delta>, DecodeError> {
    let chunk: ChunkWire = serde_json::from_str(frame).map_err(|source| DecodeError { source })?;
    let Some(choice) = chunk.choices.unwrap_or_default().into_iter().next() else {
        return Ok(None);
    };
    let delta = choice.delta.unwrap_or_default();

    if let Some(calls) = delta.tool_calls.filter(|calls| !calls.is_empty()) {
        let invocations = calls.iter().map(tool_invocation).collect();
        return Ok(Some(Delta::ToolInvocations {
            invocations,
            raw: serde_json::Value::Array(calls),
        }));
    }

    match delta.content {
        Some(text) if !text.is_empty() => Ok(Some(Delta::ContentChunk(text))),
        _ => Ok(Some(Delta::EndOfTurn)),
    }
}

fn tool_invocation(value: &serde_json::Value) -> ToolInvocation {
    let call: ToolCallWire = serde_json::from_value(value.clone()).unwrap_or_default();
    // OpenAI-style APIs send arguments as a JSON-encoded string.
    let arguments = match call.function.arguments {
        serde_json::Value::String(encoded) => {
            serde_json::from_str(&encoded).unwrap_or(serde_json::Value::Null)
        }
        other => other,
    };
    let field = |key: &str| {
        arguments
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    ToolInvocation {
        id: call.id,
        function_name: call.function.name,
        command: field("command"),
        reason: field("tool_reason"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_frame_decodes_to_chunk() {
        let delta = decode_frame(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#).expect("decode");
        assert_eq!(delta, Some(Delta::ContentChunk("Hi".into())));
    }

    #[test]
    fn null_delta_and_null_choices_are_not_decode_errors() {
        let delta = decode_frame(r#"{"choices":[{"delta":null,"finish_reason":"stop"}]}"#)
            .expect("null delta decodes");
        assert_eq!(delta, Some(Delta::EndOfTurn));
        assert_eq!(decode_frame(r#"{"choices":null}"#).expect("null choices decode"), None);
    }

    #[test]
    fn empty_or_missing_content_is_end_of_turn() {
        for frame in [
            r#"{"choices":[{"delta":{"content":""}}]}"#,
            r#"{"choices":[{"delta":{}}]}"#,
            r#"{"choices":[{"delta":{"content":null},"finish_reason":"stop"}]}"#,
        ] {
            assert_eq!(decode_frame(frame).expect("decode"), Some(Delta::EndOfTurn), "{frame}");
        }
    }

    #[test]
    fn no_choices_yields_nothing() {
        assert_eq!(decode_frame(r#"{"choices":[],"usage":{"total_tokens":3}}"#).expect("decode"), None);
        assert_eq!(decode_frame(r#"{"id":"gen-1"}"#).expect("decode"), None);
    }

    #[test]
    fn malformed_frame_is_an_error() {
        assert!(decode_frame(r#"{"choices":[{"delta":"#).is_err());
    }

    #[test]
    fn tool_calls_with_object_arguments() {
        let frame = r#"{"choices":[{"delta":{"tool_calls":[{"id":"call_1","function":{"name":"run_shell","arguments":{"command":"ls","tool_reason":"list files"}}}]}}]}"#;
        let Some(Delta::ToolInvocations { invocations, raw }) = decode_frame(frame).expect("decode")
        else {
            panic!("expected tool invocations");
        };
        assert_eq!(
            invocations,
            vec![ToolInvocation {
                id: "call_1".into(),
                function_name: "run_shell".into(),
                command: "ls".into(),
                reason: "list files".into(),
            }]
        );
        assert_eq!(raw[0]["id"], "call_1");
    }

    #[test]
    fn tool_calls_with_encoded_arguments_and_missing_fields() {
        let frame = r#"{"choices":[{"delta":{"content":"ignored","tool_calls":[{"id":"a","function":{"name":"f","arguments":"{\"command\":\"pwd\"}"}},{"type":"function"}]}}]}"#;
        let Some(Delta::ToolInvocations { invocations, .. }) = decode_frame(frame).expect("decode")
        else {
            panic!("expected tool invocations");
        };
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].command, "pwd");
        assert_eq!(invocations[0].reason, "");
        assert_eq!(invocations[1].id, "");
        assert_eq!(invocations[1].function_name, "");
    }
}
