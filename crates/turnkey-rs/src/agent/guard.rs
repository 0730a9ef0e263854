//! Repeated-action detection.
//!
//! Models sometimes get stuck issuing the same tool call over and over. The
//! [`RepetitionGuard`] tracks the signature of the last dispatched call and
//! yields a warning once a streak reaches the threshold.

use serde_json::Value;

/// Separates the tool name from the canonical input in a signature.
const SIGNATURE_SEPARATOR: char = '\u{1f}';

/// Stable signature of a tool call: name plus canonical JSON input.
///
/// Object keys are sorted recursively so argument order does not matter.
/// Input that does not parse as JSON is used verbatim after trimming.
pub fn canonical_signature(tool: &str, input: &str) -> String {
    let canonical = match serde_json::from_str::<Value>(input) {
        Ok(value) => canonical_json(&value),
        Err(_) => input.trim().to_string(),
    };
    format!("{tool}{SIGNATURE_SEPARATOR}{canonical}")
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Counts consecutive identical tool calls.
#[derive(Debug, Clone)]
pub struct RepetitionGuard {
    threshold: u32,
    last_signature: Option<String>,
    repeat_count: u32,
    warned: bool,
}

impl RepetitionGuard {
    /// `threshold` is clamped to at least 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            last_signature: None,
            repeat_count: 0,
            warned: false,
        }
    }

    /// Record a call about to be dispatched. Returns the warning text the
    /// first time the current streak reaches the threshold.
    pub fn observe(&mut self, tool: &str, input: &str) -> Option<String> {
        let signature = canonical_signature(tool, input);
        if self.last_signature.as_deref() == Some(signature.as_str()) {
            self.repeat_count += 1;
        } else {
            self.last_signature = Some(signature);
            self.repeat_count = 1;
            self.warned = false;
        }

        if self.repeat_count >= self.threshold && !self.warned {
            self.warned = true;
            Some(repetition_warning(tool, self.repeat_count))
        } else {
            None
        }
    }

    /// Forget the streak, e.g. after a step without tool calls.
    pub fn reset(&mut self) {
        self.last_signature = None;
        self.repeat_count = 0;
        self.warned = false;
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }
}

/// System message injected when a streak hits the threshold.
pub fn repetition_warning(tool: &str, count: u32) -> String {
    format!(
        "Warning: you have called '{tool}' with identical input {count} times in a row. \
         You may be stuck in a loop; try a different approach or give a final answer."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_ignores_key_order_and_whitespace() {
        let a = canonical_signature("grep", r#"{"pattern": "x", "opts": {"b": 1, "a": [2, 3]}}"#);
        let b = canonical_signature("grep", r#"{"opts":{"a":[2,3],"b":1},"pattern":"x"}"#);
        assert_eq!(a, b);
        assert_ne!(a, canonical_signature("find", r#"{"pattern":"x","opts":{"a":[2,3],"b":1}}"#));
    }

    #[test]
    fn unparseable_input_is_trimmed_verbatim() {
        assert_eq!(canonical_signature("t", "  not json \n"), "t\u{1f}not json");
    }

    #[test]
    fn warns_once_at_threshold() {
        let mut guard = RepetitionGuard::new(3);
        assert_eq!(guard.observe("ls", r#"{"path":"."}"#), None);
        assert_eq!(guard.observe("ls", r#"{"path": "."}"#), None);
        let warning = guard.observe("ls", r#"{"path":"."}"#).unwrap();
        assert!(warning.contains("'ls'"));
        assert!(warning.contains("3 times"));
        assert_eq!(guard.observe("ls", r#"{"path":"."}"#), None);
        assert_eq!(guard.repeat_count(), 4);
    }

    #[test]
    fn different_call_restarts_the_streak() {
        let mut guard = RepetitionGuard::new(3);
        guard.observe("ls", "{}");
        guard.observe("ls", "{}");
        guard.observe("cat", "{}");
        assert_eq!(guard.repeat_count(), 1);
        guard.observe("ls", "{}");
        guard.observe("ls", "{}");
        assert!(guard.observe("ls", "{}").is_some());
    }

    #[test]
    fn reset_clears_the_streak() {
        let mut guard = RepetitionGuard::new(2);
        guard.observe("ls", "{}");
        guard.reset();
        assert_eq!(guard.observe("ls", "{}"), None);
        assert!(guard.observe("ls", "{}").is_some());
    }
}
