//! Accumulation of streamed chat events into one assembled response.

use cohere_core::{LlmResponse, LlmToolCall, StreamEvent};
use serde_json::Value;
use std::collections::BTreeMap;

/// Map one decoded Cohere v2 SSE payload to a `StreamEvent`. Returns `None`
/// for event types the loop does not consume (message-start, citations, ...).
pub fn parse_stream_event(value: &Value) -> Option<StreamEvent> {
    match value.get("type").and_then(|v| v.as_str())? {
        "content-delta" => {
            let text = value
                .pointer("/delta/message/content/text")
                .and_then(|v| v.as_str())?;
            Some(StreamEvent::ContentDelta(text.to_string()))
        }
        "tool-plan-delta" => {
            let text = value
                .pointer("/delta/message/tool_plan")
                .and_then(|v| v.as_str())?;
            Some(StreamEvent::ReasoningDelta(text.to_string()))
        }
        "tool-call-start" => {
            let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            let call = value.pointer("/delta/message/tool_calls")?;
            let id = call
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let name = call
                .pointer("/function/name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(StreamEvent::ToolCallStart { index, id, name })
        }
        "tool-call-delta" => {
            let index = value.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            let arguments = value
                .pointer("/delta/message/tool_calls/function/arguments")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(StreamEvent::ToolCallDelta { index, arguments })
        }
        "message-end" => Some(StreamEvent::Done),
        _ => None,
    }
}

#[derive(Default)]
struct ToolCallSlot {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Folds a stream of events into `{text, thought, tool_calls}`.
///
/// Slots are keyed by the wire index; a `ToolCallDelta` for an index that was
/// never opened by a `ToolCallStart` is dropped rather than guessed at.
#[derive(Default)]
pub struct StreamAccumulator {
    text: String,
    thought: String,
    slots: BTreeMap<u64, ToolCallSlot>,
    finish_reason: Option<String>,
    dropped_deltas: u64,
}

impl StreamAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::ContentDelta(text) => self.text.push_str(text),
            StreamEvent::ReasoningDelta(text) => self.thought.push_str(text),
            StreamEvent::ToolCallStart { index, id, name } => {
                let slot = self.slots.entry(*index).or_default();
                if !id.trim().is_empty() {
                    slot.id = Some(id.clone());
                }
                if !name.trim().is_empty() {
                    slot.name = name.clone();
                }
            }
            StreamEvent::ToolCallDelta { index, arguments } => {
                match self.slots.get_mut(index) {
                    Some(slot) => slot.arguments.push_str(arguments),
                    None => self.dropped_deltas += 1,
                }
            }
            StreamEvent::Done => {}
        }
    }

    pub fn set_finish_reason(&mut self, reason: String) {
        self.finish_reason = Some(reason);
    }

    /// Count of argument deltas that arrived for an unopened slot.
    #[must_use]
    pub fn dropped_deltas(&self) -> u64 {
        self.dropped_deltas
    }

    /// Assemble the final response. Tool calls come out in ascending slot
    /// order; a missing id falls back to a positional `tool_call_N`. A turn
    /// with no text and no calls yields a single-space placeholder so the
    /// assistant message is never empty.
    #[must_use]
    pub fn finish(self) -> LlmResponse {
        let tool_calls: Vec<LlmToolCall> = self
            .slots
            .into_iter()
            .filter(|(_, slot)| !slot.name.trim().is_empty())
            .map(|(index, slot)| LlmToolCall {
                id: slot
                    .id
                    .unwrap_or_else(|| format!("tool_call_{}", index + 1)),
                name: slot.name,
                arguments: slot.arguments,
            })
            .collect();

        let text = if self.text.is_empty() && tool_calls.is_empty() {
            " ".to_string()
        } else {
            self.text
        };

        LlmResponse {
            text,
            thought: self.thought,
            tool_calls,
            finish_reason: self.finish_reason.unwrap_or_else(|| "stop".to_string()),
        }
    }
}
