//! Merges fragmented tool-call stream events into whole calls.

/// A tool call whose argument text has been fully received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub call_id: String,
    pub tool_name: String,
    /// Raw JSON argument text, possibly empty.
    pub arguments: String,
}

/// Buffers tool-call fragments in arrival order.
///
/// A `start` opens a new call; `delta` text always extends the most
/// recently started call. Deltas before any start are dropped.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: Vec<PendingCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, call_id: String, tool_name: String) {
        // A repeated id continues the existing call instead of opening a
        // duplicate one.
        if let Some(existing) = self.calls.iter().position(|c| c.call_id == call_id) {
            let call = self.calls.remove(existing);
            self.calls.push(call);
            return;
        }
        self.calls.push(PendingCall {
            call_id,
            tool_name,
            arguments: String::new(),
        });
    }

    pub fn delta(&mut self, fragment: &str) {
        match self.calls.last_mut() {
            Some(call) => call.arguments.push_str(fragment),
            None => tracing::warn!(len = fragment.len(), "tool-call delta without a started call"),
        }
    }

    /// Calls in the order they were started.
    pub fn finish(self) -> Vec<PendingCall> {
        self.calls
    }
}
