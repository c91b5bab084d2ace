use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// Logical message envelopes exchanged between a module process and its host.
///
/// Two shapes flow over the transport: a call (optionally expecting a reply,
/// signalled by the presence of `callbackId`) and a response correlated back
/// to its call by that id. The envelopes are **transport-agnostic** — any
/// per-message-reliable byte pipe can carry them; ordering across messages is
/// not assumed.
///
/// `payload` is an opaque JSON value. Absent and `null` are distinct: an
/// absent payload is omitted from the wire entirely.
pub const DIRECTION_CALL: &str = "call";
pub const DIRECTION_RESPONSE: &str = "response";

/// One outbound invocation. `callback_id` is present only when the sender
/// expects a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    #[serde(default = "call_direction")]
    pub direction: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<u32>,
}

fn call_direction() -> String {
    DIRECTION_CALL.to_owned()
}

/// Reply to a [`CallEnvelope`]. `callback_id` is always present; exactly one
/// of success/failure is conveyed by the flag, with the payload carrying the
/// result or the serialized error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(default = "response_direction")]
    pub direction: String,
    pub callback_id: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

fn response_direction() -> String {
    DIRECTION_RESPONSE.to_owned()
}

/// Convenience union so receivers can deserialize a line without inspecting
/// the `direction` field first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Response(ResponseEnvelope),
    Call(CallEnvelope),
}

// -----------------------------------------------------------------------------
// Helper constructors
// -----------------------------------------------------------------------------
impl CallEnvelope {
    /// A call that expects no reply.
    pub fn fire_and_forget(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            direction: DIRECTION_CALL.to_owned(),
            name: name.into(),
            payload,
            callback_id: None,
        }
    }

    /// A call expecting a correlated response.
    pub fn with_callback(name: impl Into<String>, payload: Option<Value>, callback_id: u32) -> Self {
        Self {
            direction: DIRECTION_CALL.to_owned(),
            name: name.into(),
            payload,
            callback_id: Some(callback_id),
        }
    }
}

impl ResponseEnvelope {
    pub fn success(callback_id: u32, payload: Option<Value>) -> Self {
        Self {
            direction: DIRECTION_RESPONSE.to_owned(),
            callback_id,
            success: true,
            payload,
        }
    }

    pub fn fail(callback_id: u32, payload: Option<Value>) -> Self {
        Self {
            direction: DIRECTION_RESPONSE.to_owned(),
            callback_id,
            success: false,
            payload,
        }
    }
}

/// Calls the host issues against the module side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum HostMethod {
    Init,
    Destroy,
    UpdateConfigAndLabel,
    UpdateActionInstances,
    UpdateFeedbackInstances,
    ExecuteAction,
    LearnAction,
    LearnFeedback,
    RunUpgradePass,
}

/// Calls the module issues against the host side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum ModuleMethod {
    SetActionDefinitions,
    SetFeedbackDefinitions,
    UpdateFeedbackValues,
    SaveConfig,
    RecordAction,
    SetCustomVariable,
}
