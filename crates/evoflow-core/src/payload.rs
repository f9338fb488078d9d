//! Inter-node message contents.
//!
//! A [`Payload`] is what one node hands to the next. The variant set is closed:
//! [`extract_text_from_payload`] matches exhaustively, so adding a kind without
//! teaching the extractor about it fails to compile.

use serde::{de, Deserialize, Deserializer, Serialize};

/// Signal carried by a `control` payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlFlag {
    Data,
    Error,
    Feedback,
}

/// One predecessor's contribution to an aggregated payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedEntry {
    pub from_node_id: String,
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Payload {
    Sequential {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    Delegation {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    Result {
        work_done: String,
    },
    ResultError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        work_done: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    Control {
        flag: ControlFlag,
    },
    Aggregated {
        #[serde(deserialize_with = "non_empty_entries")]
        messages: Vec<AggregatedEntry>,
    },
}

fn non_empty_entries<'de, D>(deserializer: D) -> Result<Vec<AggregatedEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let messages = Vec::<AggregatedEntry>::deserialize(deserializer)?;
    if messages.is_empty() {
        return Err(de::Error::invalid_length(0, &"at least one aggregated entry"));
    }
    Ok(messages)
}

impl Payload {
    pub fn sequential(prompt: impl Into<String>) -> Self {
        Self::Sequential {
            prompt: prompt.into(),
            context: None,
        }
    }

    pub fn delegation(prompt: impl Into<String>) -> Self {
        Self::Delegation {
            prompt: prompt.into(),
            context: None,
        }
    }

    pub fn result(work_done: impl Into<String>) -> Self {
        Self::Result {
            work_done: work_done.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            stack: None,
        }
    }

    /// Build an `aggregated` payload. Returns `None` for an empty list: an
    /// aggregate only exists once a join has collected its predecessors.
    pub fn aggregated(messages: Vec<AggregatedEntry>) -> Option<Self> {
        if messages.is_empty() {
            None
        } else {
            Some(Self::Aggregated { messages })
        }
    }

    /// The `kind` discriminant as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sequential { .. } => "sequential",
            Self::Delegation { .. } => "delegation",
            Self::Result { .. } => "result",
            Self::ResultError { .. } => "result-error",
            Self::Error { .. } => "error",
            Self::Control { .. } => "control",
            Self::Aggregated { .. } => "aggregated",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::ResultError { .. })
    }
}

/// Recover human-readable text from any payload.
///
/// `aggregated` payloads join their children's text with `"\n"`, recursively.
/// `control` payloads carry no text.
pub fn extract_text_from_payload(payload: &Payload) -> String {
    match payload {
        Payload::Sequential { prompt, .. } => prompt.clone(),
        Payload::Delegation { prompt, .. } => prompt.clone(),
        Payload::Result { work_done } => work_done.clone(),
        Payload::ResultError { message, .. } => message.clone(),
        Payload::Error { message, .. } => message.clone(),
        Payload::Control { .. } => String::new(),
        Payload::Aggregated { messages } => messages
            .iter()
            .map(|m| extract_text_from_payload(&m.payload))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
