//! Incremental SSE event draining shared by both HTTP transports.
//!
//! SSE events are delimited by `\n\n`. Each event block may contain
//! `event:`, `data:`, `id:`, or `retry:` lines; we keep the event name
//! (the legacy transport distinguishes `endpoint` from `message` events)
//! and join multi-line `data:` payloads with `\n` as SSE requires.
//!
//! The buffer is drained in-place: consumed bytes are removed and any
//! trailing partial event remains for the next call.

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `message` when the block carries no `event:` line.
    pub event: String,
    pub data: String,
}

/// Name SSE assigns to events without an explicit `event:` line.
pub const DEFAULT_EVENT: &str = "message";

/// Extract complete events from an SSE buffer.
pub fn drain_events(buffer: &mut String) -> Vec<SseEvent> {
    let mut events = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2); // remove the \n\n delimiter

        let mut event = DEFAULT_EVENT.to_string();
        let mut data_lines: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                data_lines.push(data.trim());
            }
        }

        let data = data_lines.join("\n");
        if !data.is_empty() {
            events.push(SseEvent { event, data });
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
