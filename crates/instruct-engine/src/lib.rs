//! # instruct-engine
//!
//! The "narrow waist" of the instruct.rs stack. Defines the [`GenerationBackend`]
//! capability trait and the types every other crate agrees on: conversation
//! [`Turn`]s, backend tags ([`BackendKind`]) and the per-engine sampling schemas
//! ([`SamplingParams`]). Backends can be swapped without touching the scheduler
//! or the session protocol.
//!
//! ## Design Notes
//!
//! ### Lazy fragments
//! [`GenerationBackend::generate`] returns a boxed stream of text fragments.
//! The caller pulls one fragment at a time and simply drops the stream to stop
//! generation early; backends must release their resources on drop.
//!
//! ### Open sampling schemas
//! Each engine accepts a different set of sampling knobs (repetition penalty on
//! every engine except the mock one, frequency/presence penalties only on
//! vLLM and llama.cpp). [`BackendKind::validate_sampling`] maps an open JSON
//! record onto the schema of the selected engine.

use std::fmt;
use std::str::FromStr;

use futures::stream::BoxStream;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod sampling;

pub use sampling::{
    HfSamplingParams, LlamaCppSamplingParams, MockSamplingParams, SamplingDefaults,
    SamplingError, SamplingParams, VllmSamplingParams,
};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by a backend while producing fragments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("unsupported input: {0}")]
    Unsupported(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A decoded image attached to a user turn.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Image subtype taken from a `data:image/<subtype>;base64,` header, if any.
    pub mime: Option<String>,
    /// Raw image bytes.
    pub data: Vec<u8>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("mime", &self.mime)
            .field("len", &self.data.len())
            .finish()
    }
}

/// One role-tagged message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Attach images to this turn.
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Configuration tag selecting a backend and its sampling schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Hugging Face text-generation pipeline.
    Hf,
    /// vLLM batched serving engine.
    Vllm,
    /// llama.cpp quantized local engine.
    LlamaCpp,
    /// Built-in deterministic engine.
    Mock,
}

impl BackendKind {
    /// All known backend tags.
    pub fn all() -> &'static [BackendKind] {
        &[
            BackendKind::Hf,
            BackendKind::Vllm,
            BackendKind::LlamaCpp,
            BackendKind::Mock,
        ]
    }

    /// The tag used in configuration files.
    pub fn tag(&self) -> &'static str {
        match self {
            BackendKind::Hf => "HFEngine",
            BackendKind::Vllm => "VLLMEngine",
            BackendKind::LlamaCpp => "LlamaCppEngine",
            BackendKind::Mock => "MockEngine",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Unknown backend tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown engine `{0}` (expected one of HFEngine, VLLMEngine, LlamaCppEngine, MockEngine)")]
pub struct UnknownBackend(pub String);

impl FromStr for BackendKind {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "HFEngine" | "hf" => Ok(BackendKind::Hf),
            "VLLMEngine" | "vllm" => Ok(BackendKind::Vllm),
            "LlamaCppEngine" | "llama_cpp" | "llamacpp" => Ok(BackendKind::LlamaCpp),
            "MockEngine" | "mock" => Ok(BackendKind::Mock),
            other => Err(UnknownBackend(other.to_string())),
        }
    }
}

impl Serialize for BackendKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for BackendKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(serde::de::Error::custom)
    }
}

/// Everything a backend needs to produce one reply.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Identifier of the task driving this call; engines with native
    /// request-level abort key on it.
    pub request_id: String,
    /// Conversation so far, ending with the new user turn.
    pub history: Vec<Turn>,
    /// Text that pre-seeds the assistant reply (empty for none). The backend
    /// continues after it and does not emit it.
    pub reply_prefix: String,
    pub params: SamplingParams,
}

/// Lazily produced reply fragments. Dropping the stream stops generation.
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// The capability every generation engine provides.
pub trait GenerationBackend: Send + Sync {
    /// Tag this backend was selected by.
    fn kind(&self) -> BackendKind;

    /// Start producing fragments for `request`.
    fn generate(&self, request: GenerationRequest) -> FragmentStream;

    /// Ask the engine to stop work for `request_id`. The fragment stream may
    /// still be dropped afterwards; engines without native abort ignore this.
    fn abort(&self, _request_id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_tags_round_trip_through_from_str() {
        for kind in BackendKind::all() {
            assert_eq!(kind.tag().parse::<BackendKind>().unwrap(), *kind);
        }
        assert_eq!("llama_cpp".parse::<BackendKind>().unwrap(), BackendKind::LlamaCpp);
        assert!("TGIEngine".parse::<BackendKind>().is_err());
    }

    #[test]
    fn backend_kind_deserializes_from_tag() {
        let kind: BackendKind = serde_json::from_str("\"VLLMEngine\"").unwrap();
        assert_eq!(kind, BackendKind::Vllm);
        let err = serde_json::from_str::<BackendKind>("\"nope\"").unwrap_err();
        assert!(err.to_string().contains("unknown engine"));
    }

    #[test]
    fn attachment_debug_hides_bytes() {
        let att = Attachment {
            mime: Some("png".to_string()),
            data: vec![0u8; 4096],
        };
        let dbg = format!("{att:?}");
        assert!(dbg.contains("4096"));
        assert!(dbg.len() < 100);
    }
}
