use punchcard_core::UpdateError;
use serde::Serialize;
use serde_json::{json, Value};

/// Uniform result of every operator command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Envelope {
    pub success: bool,
    pub message: String,
    pub data: Value,
    /// Extra lines for the text renderer; not part of the JSON contract.
    #[serde(skip)]
    pub details: Vec<String>,
}

impl Envelope {
    pub fn ok(message: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: to_data(data),
            details: Vec::new(),
        }
    }

    pub fn failed(message: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: to_data(data),
            details: Vec::new(),
        }
    }

    pub fn from_error(err: &UpdateError) -> Self {
        Self::failed(err.to_string(), json!({ "kind": err.kind() }))
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|err| {
            json!({
                "success": false,
                "message": format!("failed to encode response: {err}"),
                "data": Value::Null,
            })
            .to_string()
        })
    }
}

fn to_data(data: impl Serialize) -> Value {
    serde_json::to_value(data).unwrap_or(Value::Null)
}
