//! Client-to-server messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use instruct_engine::{Attachment, BackendKind, SamplingDefaults, SamplingError, SamplingParams};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::generation::UserTurn;

/// A request rejected before any task was created.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid sampling parameters: {0}")]
    Sampling(#[from] SamplingError),
    #[error("attachment {index} is not valid base64: {source}")]
    Attachment {
        index: usize,
        #[source]
        source: base64::DecodeError,
    },
}

/// Anything a client may send over the socket.
#[derive(Debug)]
pub enum ClientMessage {
    /// `{"abort": "<task id>"}`
    Abort { task_id: String },
    Generate(Box<GenerateRequest>),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_str(text)?;
        if let Some(task_id) = value.get("abort") {
            let task_id = match task_id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(ClientMessage::Abort { task_id });
        }
        let request = serde_json::from_value(value)?;
        Ok(ClientMessage::Generate(Box::new(request)))
    }
}

/// A generation request. Fields other than the named ones are sampling
/// parameters, validated against the active engine's schema.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub reply_prefix: Option<String>,
    #[serde(default)]
    pub attachments: Option<Vec<String>>,
    /// Single-attachment form kept for older clients.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(flatten)]
    pub sampling: Map<String, Value>,
}

impl GenerateRequest {
    /// Validate sampling and decode attachments.
    pub fn prepare(
        self,
        engine: BackendKind,
        defaults: &SamplingDefaults,
    ) -> Result<(UserTurn, SamplingParams), RequestError> {
        let params = engine.validate_sampling(&Value::Object(self.sampling), defaults)?;

        let encoded = self
            .attachments
            .unwrap_or_default()
            .into_iter()
            .chain(self.image)
            .filter(|s| !s.trim().is_empty());
        let attachments = encoded
            .enumerate()
            .map(|(index, data)| {
                decode_attachment(&data).map_err(|source| RequestError::Attachment { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let turn = UserTurn {
            system_prompt: self.system_prompt.filter(|s| !s.is_empty()),
            prompt: self.prompt,
            reply_prefix: self.reply_prefix.unwrap_or_default(),
            attachments,
        };
        Ok((turn, params))
    }
}

/// Decode base64 image data, stripping an optional `data:image/<subtype>;base64,`
/// header.
pub fn decode_attachment(data: &str) -> Result<Attachment, base64::DecodeError> {
    let data = data.trim();
    let (mime, payload) = match data.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
        Some((header, payload)) => {
            let media = header.strip_suffix(";base64").unwrap_or(header);
            let subtype = media.strip_prefix("image/").unwrap_or(media);
            let mime = (!subtype.is_empty()).then(|| subtype.to_string());
            (mime, payload)
        }
        None => (None, data),
    };
    Ok(Attachment {
        mime,
        data: STANDARD.decode(payload)?,
    })
}

/// Body of `POST /abort`.
#[derive(Debug, Deserialize)]
pub struct AbortRequest {
    #[serde(alias = "request_id")]
    pub task_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AbortResponse {
    pub task_id: String,
    /// Whether a running or waiting task was flagged by this call.
    pub signaled: bool,
}
