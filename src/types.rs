use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Concrete option values for one placed instance. Keys are option ids, the
/// values are whatever the option schema describes — the bridge never
/// interprets them.
pub type OptionValues = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Parameters of the host's `init` call.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    pub label: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_dir: Option<String>,
}

/// Parameters of `updateConfigAndLabel`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigAndLabel {
    pub label: String,
    #[serde(default)]
    pub config: Value,
}

/// One placed usage of an action definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActionInstance {
    pub id: String,
    pub control_id: String,
    /// Id of the owning definition.
    pub action_id: String,
    #[serde(default)]
    pub options: OptionValues,
    #[serde(default)]
    pub disabled: bool,
    /// Index of the last migration script this instance passed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_index: Option<i64>,
}

/// One placed usage of a feedback definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackInstance {
    pub id: String,
    pub control_id: String,
    /// Id of the owning definition.
    pub feedback_id: String,
    #[serde(default)]
    pub options: OptionValues,
    #[serde(default)]
    pub disabled: bool,
    /// Style overrides applied when the feedback is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Value>,
    #[serde(default)]
    pub is_inverted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_index: Option<i64>,
}

/// Instance deltas pushed by the host: `None` means "this id was removed".
pub type InstanceDeltas<T> = HashMap<String, Option<T>>;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActionInstanceDeltas {
    #[serde(default)]
    pub actions: InstanceDeltas<ActionInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackInstanceDeltas {
    #[serde(default)]
    pub feedbacks: InstanceDeltas<FeedbackInstance>,
}

/// Latest computed value for one feedback instance, as shipped to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackValue {
    pub id: String,
    pub control_id: String,
    pub value: Value,
}

/// Batch payload of `updateFeedbackValues`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackValuesBatch {
    pub values: Vec<FeedbackValue>,
}

/// Parameters of `executeAction`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteActionParams {
    pub action: ActionInstance,
    #[serde(default)]
    pub surface_id: Option<String>,
}

/// Structured result of an action execution. The host never receives a raw
/// throw across the process boundary; failures land here instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExecuteActionResult {
    pub fn ok() -> Self {
        Self { success: true, error_message: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, error_message: Some(message.into()) }
    }
}

/// Parameters of `learnAction` / `learnFeedback`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LearnActionParams {
    pub action: ActionInstance,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LearnFeedbackParams {
    pub feedback: FeedbackInstance,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Partial option values produced by a learn callback.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LearnedOptions {
    pub options: OptionValues,
}

/// Host-facing summary of one action definition, published on registration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinitionSummary {
    pub id: String,
    pub name: String,
    /// Opaque serialized option field schema.
    pub option_schema: Value,
    pub has_learn: bool,
}

/// Host-facing summary of one feedback definition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackDefinitionSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FeedbackKind,
    pub option_schema: Value,
    pub has_learn: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_style: Option<Value>,
}

/// Parameters of `runUpgradePass`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePassParams {
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub secrets: Value,
    #[serde(default)]
    pub default_index: Option<i64>,
    #[serde(default)]
    pub skip_config: bool,
    #[serde(default)]
    pub actions: Vec<ActionInstance>,
    #[serde(default)]
    pub feedbacks: Vec<FeedbackInstance>,
}

/// Result of `runUpgradePass`: every item with its final upgrade index —
/// including items that were merely acknowledged as current — plus the ids
/// whose payloads actually changed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePassReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_secrets: Option<Value>,
    pub actions: Vec<ActionInstance>,
    pub feedbacks: Vec<FeedbackInstance>,
    pub updated_action_ids: Vec<String>,
    pub updated_feedback_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    /// Callback resolves to a boolean; the host applies the instance style.
    #[default]
    Boolean,
    /// Callback resolves to a full style object of its own making.
    Advanced,
}
