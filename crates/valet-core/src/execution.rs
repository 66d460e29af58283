//! Request-scoped execution context: the step-id -> result map that drives
//! `$step_<id>` parameter substitution, plus the normalized tool-call
//! records accumulated over a turn. Owned by exactly one request, never
//! persisted or shared.

use std::collections::HashMap;

use valet_schema::{ExecutedTool, ToolCallRecord};

#[derive(Default)]
pub struct ExecutionContext {
    results: HashMap<u32, serde_json::Value>,
    records: Vec<(u32, ToolCallRecord)>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_step_number(&self) -> u32 {
        self.records.len() as u32 + 1
    }

    pub fn record(&mut self, step_number: u32, record: ToolCallRecord) {
        self.results.insert(step_number, record.result.clone());
        self.records.push((step_number, record));
    }

    pub fn result_for(&self, step_number: u32) -> Option<&serde_json::Value> {
        self.results.get(&step_number)
    }

    pub fn records(&self) -> Vec<ToolCallRecord> {
        self.records.iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn executed_tools(&self) -> Vec<ExecutedTool> {
        self.records
            .iter()
            .map(|(step_number, record)| ExecutedTool {
                name: record.name.clone(),
                args: record.args.clone(),
                result: record.result.clone(),
                step_number: *step_number,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replace every string of the exact form `$step_<id>` with the stored
    /// result of that step. Unknown references are logged and left as-is.
    pub fn substitute_args(&self, args: &serde_json::Value) -> serde_json::Value {
        match args {
            serde_json::Value::String(s) => match parse_step_ref(s) {
                Some(id) => match self.results.get(&id) {
                    Some(result) => result.clone(),
                    None => {
                        tracing::warn!("unknown step reference left unsubstituted: {s}");
                        args.clone()
                    }
                },
                None => args.clone(),
            },
            serde_json::Value::Array(items) => serde_json::Value::Array(
                items.iter().map(|item| self.substitute_args(item)).collect(),
            ),
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute_args(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn parse_step_ref(raw: &str) -> Option<u32> {
    raw.strip_prefix("$step_")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, result: serde_json::Value) -> ToolCallRecord {
        ToolCallRecord {
            name: name.into(),
            args: serde_json::json!({}),
            result,
            tool_call_id: format!("call_{name}"),
        }
    }

    #[test]
    fn step_numbers_increment() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.next_step_number(), 1);
        ctx.record(1, record("a", serde_json::json!({"id": "x"})));
        assert_eq!(ctx.next_step_number(), 2);
    }

    #[test]
    fn substitutes_known_step_reference() {
        let mut ctx = ExecutionContext::new();
        ctx.record(1, record("create_doc", serde_json::json!({"documentId": "d1"})));

        let args = serde_json::json!({"source": "$step_1", "title": "Report"});
        let substituted = ctx.substitute_args(&args);
        assert_eq!(substituted["source"]["documentId"], "d1");
        assert_eq!(substituted["title"], "Report");
    }

    #[test]
    fn substitutes_inside_nested_arrays_and_objects() {
        let mut ctx = ExecutionContext::new();
        ctx.record(2, record("fetch", serde_json::json!("attachment-url")));

        let args = serde_json::json!({"files": [{"ref": "$step_2"}]});
        let substituted = ctx.substitute_args(&args);
        assert_eq!(substituted["files"][0]["ref"], "attachment-url");
    }

    #[test]
    fn unknown_reference_left_unchanged() {
        let ctx = ExecutionContext::new();
        let args = serde_json::json!({"ref": "$step_9"});
        let substituted = ctx.substitute_args(&args);
        assert_eq!(substituted["ref"], "$step_9");
    }

    #[test]
    fn non_reference_strings_untouched() {
        let ctx = ExecutionContext::new();
        let args = serde_json::json!({"text": "$stepladder", "n": 3, "flag": true});
        assert_eq!(ctx.substitute_args(&args), args);
    }

    #[test]
    fn executed_tools_carry_step_numbers() {
        let mut ctx = ExecutionContext::new();
        ctx.record(1, record("a", serde_json::json!({})));
        ctx.record(2, record("b", serde_json::json!({"error": "nope"})));

        let executed = ctx.executed_tools();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[0].step_number, 1);
        assert_eq!(executed[1].name, "b");
    }

    #[test]
    fn parse_step_ref_shapes() {
        assert_eq!(parse_step_ref("$step_1"), Some(1));
        assert_eq!(parse_step_ref("$step_42"), Some(42));
        assert_eq!(parse_step_ref("$step_"), None);
        assert_eq!(parse_step_ref("$step_x"), None);
        assert_eq!(parse_step_ref("step_1"), None);
    }
}
