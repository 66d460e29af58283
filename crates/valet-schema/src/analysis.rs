//! The structured analysis record produced once per turn by the analysis
//! model, plus the session-level conversation summary it carries.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[serde(alias = "med")]
    Medium,
    High,
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPriority {
    Critical,
    High,
    #[serde(alias = "med")]
    Medium,
    Low,
}

impl Default for StepPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// One planned step of the execution DAG. `dependencies` reference earlier
/// `step_number`s only; the dispatcher computes a topological order before
/// acting on the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub step_number: u32,
    pub description: String,
    #[serde(default)]
    pub required_data: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_category: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<u32>,
    #[serde(default)]
    pub priority: StepPriority,
}

/// Per-app priority hint, 1..=10.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPriority {
    pub app_name: String,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryState {
    InformationGathering,
    ReadyToExecute,
    Executed,
    ClarificationNeeded,
    Completed,
}

impl Default for SummaryState {
    fn default() -> Self {
        Self::InformationGathering
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextualDetails {
    #[serde(default)]
    pub gathered: Vec<String>,
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default)]
    pub preferences: Vec<String>,
    #[serde(default)]
    pub previous_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEntity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
    #[serde(default)]
    pub confidence: f64,
}

/// Session-level rolling summary, overwritten each turn (last-write-wins).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(default)]
    pub current_intent: String,
    #[serde(default)]
    pub contextual_details: ContextualDetails,
    #[serde(default)]
    pub state: SummaryState,
    #[serde(default)]
    pub key_entities: Vec<KeyEntity>,
    #[serde(default)]
    pub next_expected_action: String,
    #[serde(default)]
    pub topic_shifts: Vec<String>,
}

/// The per-turn analysis record. Produced by the structured-output model and
/// validated before use; the fallback variant never enters the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComprehensiveAnalysis {
    pub query_analysis: String,
    pub is_query_clear: bool,
    pub confidence_score: f64,
    pub requires_tool_execution: bool,
    #[serde(default)]
    pub execution_steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub estimated_complexity: Complexity,
    #[serde(default)]
    pub requires_sequential_execution: bool,
    #[serde(default)]
    pub needs_info_gathering: bool,
    #[serde(default)]
    pub missing_information: Vec<String>,
    #[serde(default)]
    pub search_queries: Vec<String>,
    #[serde(default)]
    pub clarification_needed: Vec<String>,
    #[serde(default)]
    pub can_proceed_with_defaults: bool,
    #[serde(default)]
    pub conversation_summary: ConversationSummary,
    #[serde(default)]
    pub recommended_apps: Vec<String>,
    #[serde(default)]
    pub tool_priorities: Vec<ToolPriority>,
}

impl ComprehensiveAnalysis {
    /// Deterministic fallback used when the analysis model fails or returns
    /// something that does not validate.
    pub fn fallback(query: &str) -> Self {
        Self {
            query_analysis: format!("Unable to analyze query: {query}"),
            is_query_clear: false,
            confidence_score: 0.1,
            requires_tool_execution: false,
            execution_steps: vec![ExecutionStep {
                step_number: 1,
                description: "Respond conversationally to the user".into(),
                required_data: Vec::new(),
                app_name: None,
                tool_category: None,
                dependencies: Vec::new(),
                priority: StepPriority::Low,
            }],
            estimated_complexity: Complexity::Low,
            requires_sequential_execution: false,
            needs_info_gathering: true,
            missing_information: Vec::new(),
            search_queries: Vec::new(),
            clarification_needed: Vec::new(),
            can_proceed_with_defaults: false,
            conversation_summary: ConversationSummary {
                current_intent: query.chars().take(120).collect(),
                state: SummaryState::InformationGathering,
                ..Default::default()
            },
            recommended_apps: Vec::new(),
            tool_priorities: Vec::new(),
        }
    }

    /// Schema-level validation. Rejects out-of-range confidences and
    /// priorities, and execution plans that are not a DAG over prior steps.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(anyhow!(
                "confidenceScore out of range: {}",
                self.confidence_score
            ));
        }
        for entity in &self.conversation_summary.key_entities {
            if !(0.0..=1.0).contains(&entity.confidence) {
                return Err(anyhow!(
                    "entity confidence out of range for {}: {}",
                    entity.value,
                    entity.confidence
                ));
            }
        }
        for tp in &self.tool_priorities {
            if !(1..=10).contains(&tp.priority) {
                return Err(anyhow!(
                    "tool priority out of range for {}: {}",
                    tp.app_name,
                    tp.priority
                ));
            }
        }
        let known: HashSet<u32> = self.execution_steps.iter().map(|s| s.step_number).collect();
        if known.len() != self.execution_steps.len() {
            return Err(anyhow!("duplicate stepNumber in executionSteps"));
        }
        for step in &self.execution_steps {
            for dep in &step.dependencies {
                if !known.contains(dep) {
                    return Err(anyhow!(
                        "step {} depends on unknown step {dep}",
                        step.step_number
                    ));
                }
                if *dep >= step.step_number {
                    return Err(anyhow!(
                        "step {} depends on non-prior step {dep}",
                        step.step_number
                    ));
                }
            }
        }
        self.execution_order()?;
        Ok(())
    }

    /// Kahn topological order over `dependencies`. A cycle is a validation
    /// error and triggers the fallback analysis upstream.
    pub fn execution_order(&self) -> Result<Vec<&ExecutionStep>> {
        let by_number: HashMap<u32, &ExecutionStep> = self
            .execution_steps
            .iter()
            .map(|s| (s.step_number, s))
            .collect();

        let mut in_degree: HashMap<u32, usize> = HashMap::new();
        let mut dependents: HashMap<u32, Vec<u32>> = HashMap::new();
        for step in &self.execution_steps {
            in_degree.entry(step.step_number).or_insert(0);
            for dep in &step.dependencies {
                *in_degree.entry(step.step_number).or_insert(0) += 1;
                dependents.entry(*dep).or_default().push(step.step_number);
            }
        }

        let mut ready: Vec<u32> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        ready.sort();

        let mut order = Vec::with_capacity(self.execution_steps.len());
        while let Some(next) = ready.first().copied() {
            ready.remove(0);
            if let Some(step) = by_number.get(&next) {
                order.push(*step);
            }
            for dependent in dependents.get(&next).cloned().unwrap_or_default() {
                let degree = in_degree.entry(dependent).or_insert(0);
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    let pos = ready.partition_point(|n| *n < dependent);
                    ready.insert(pos, dependent);
                }
            }
        }

        if order.len() != self.execution_steps.len() {
            return Err(anyhow!("executionSteps contain a dependency cycle"));
        }
        Ok(order)
    }
}
