//! Per-engine sampling schemas.
//!
//! Requests carry an open JSON record. Validation picks the fields the selected
//! engine understands, fills the missing ones from [`SamplingDefaults`], ignores
//! everything else, and rejects values outside the documented bounds.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::BackendKind;

const MAX_NEW_TOKENS: RangeInclusive<u32> = 1..=32_768;
const TEMPERATURE: RangeInclusive<f32> = 0.0..=2.0;
const TOP_P: RangeInclusive<f32> = 0.0..=1.0;
const REPETITION_PENALTY: RangeInclusive<f32> = 0.0..=10.0;
const FREQUENCY_PENALTY: RangeInclusive<f32> = 0.0..=2.0;
const PRESENCE_PENALTY: RangeInclusive<f32> = 0.0..=2.0;

/// Invalid sampling input.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("sampling parameters must be a JSON object")]
    NotAnObject,
    #[error("`{field}` must be a number")]
    InvalidType { field: &'static str },
    #[error("`{field}` = {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Engine-independent defaults, usually taken from the `sampling` section of
/// the service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingDefaults {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            max_new_tokens: 1000,
            temperature: 0.6,
            top_p: 0.95,
            repetition_penalty: 1.2,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl SamplingDefaults {
    /// Check the defaults against the same bounds applied to requests.
    pub fn validate(&self) -> Result<(), SamplingError> {
        check_count("max_new_tokens", self.max_new_tokens, &MAX_NEW_TOKENS)?;
        check_float("temperature", self.temperature, &TEMPERATURE)?;
        check_float("top_p", self.top_p, &TOP_P)?;
        check_float("repetition_penalty", self.repetition_penalty, &REPETITION_PENALTY)?;
        check_float("frequency_penalty", self.frequency_penalty, &FREQUENCY_PENALTY)?;
        check_float("presence_penalty", self.presence_penalty, &PRESENCE_PENALTY)?;
        Ok(())
    }
}

/// Sampling knobs understood by the Hugging Face pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HfSamplingParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
}

/// Sampling knobs understood by vLLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VllmSamplingParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

/// Sampling knobs understood by llama.cpp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaCppSamplingParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

/// Sampling knobs understood by the built-in mock engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockSamplingParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

/// Validated sampling parameters, one variant per engine schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "snake_case")]
pub enum SamplingParams {
    Hf(HfSamplingParams),
    Vllm(VllmSamplingParams),
    LlamaCpp(LlamaCppSamplingParams),
    Mock(MockSamplingParams),
}

impl SamplingParams {
    pub fn max_new_tokens(&self) -> u32 {
        match self {
            SamplingParams::Hf(p) => p.max_new_tokens,
            SamplingParams::Vllm(p) => p.max_new_tokens,
            SamplingParams::LlamaCpp(p) => p.max_new_tokens,
            SamplingParams::Mock(p) => p.max_new_tokens,
        }
    }

    pub fn temperature(&self) -> f32 {
        match self {
            SamplingParams::Hf(p) => p.temperature,
            SamplingParams::Vllm(p) => p.temperature,
            SamplingParams::LlamaCpp(p) => p.temperature,
            SamplingParams::Mock(p) => p.temperature,
        }
    }

    pub fn top_p(&self) -> f32 {
        match self {
            SamplingParams::Hf(p) => p.top_p,
            SamplingParams::Vllm(p) => p.top_p,
            SamplingParams::LlamaCpp(p) => p.top_p,
            SamplingParams::Mock(p) => p.top_p,
        }
    }

    /// `None` for engines without a repetition penalty.
    pub fn repetition_penalty(&self) -> Option<f32> {
        match self {
            SamplingParams::Hf(p) => Some(p.repetition_penalty),
            SamplingParams::Vllm(p) => Some(p.repetition_penalty),
            SamplingParams::LlamaCpp(p) => Some(p.repetition_penalty),
            SamplingParams::Mock(_) => None,
        }
    }
}

impl BackendKind {
    /// Validate an open JSON record against this engine's sampling schema.
    ///
    /// Unknown fields are ignored, missing or `null` fields take the value from
    /// `defaults`.
    pub fn validate_sampling(
        &self,
        raw: &Value,
        defaults: &SamplingDefaults,
    ) -> Result<SamplingParams, SamplingError> {
        let fields = match raw {
            Value::Object(map) => FieldReader { map },
            _ => return Err(SamplingError::NotAnObject),
        };

        let max_new_tokens =
            fields.count("max_new_tokens", defaults.max_new_tokens, &MAX_NEW_TOKENS)?;
        let temperature = fields.float("temperature", defaults.temperature, &TEMPERATURE)?;
        let top_p = fields.float("top_p", defaults.top_p, &TOP_P)?;

        let params = match self {
            BackendKind::Mock => SamplingParams::Mock(MockSamplingParams {
                max_new_tokens,
                temperature,
                top_p,
            }),
            BackendKind::Hf => SamplingParams::Hf(HfSamplingParams {
                max_new_tokens,
                temperature,
                top_p,
                repetition_penalty: fields.float(
                    "repetition_penalty",
                    defaults.repetition_penalty,
                    &REPETITION_PENALTY,
                )?,
            }),
            BackendKind::Vllm => SamplingParams::Vllm(VllmSamplingParams {
                max_new_tokens,
                temperature,
                top_p,
                repetition_penalty: fields.float(
                    "repetition_penalty",
                    defaults.repetition_penalty,
                    &REPETITION_PENALTY,
                )?,
                frequency_penalty: fields.float(
                    "frequency_penalty",
                    defaults.frequency_penalty,
                    &FREQUENCY_PENALTY,
                )?,
                presence_penalty: fields.float(
                    "presence_penalty",
                    defaults.presence_penalty,
                    &PRESENCE_PENALTY,
                )?,
            }),
            BackendKind::LlamaCpp => SamplingParams::LlamaCpp(LlamaCppSamplingParams {
                max_new_tokens,
                temperature,
                top_p,
                repetition_penalty: fields.float(
                    "repetition_penalty",
                    defaults.repetition_penalty,
                    &REPETITION_PENALTY,
                )?,
                frequency_penalty: fields.float(
                    "frequency_penalty",
                    defaults.frequency_penalty,
                    &FREQUENCY_PENALTY,
                )?,
                presence_penalty: fields.float(
                    "presence_penalty",
                    defaults.presence_penalty,
                    &PRESENCE_PENALTY,
                )?,
            }),
        };
        Ok(params)
    }
}

struct FieldReader<'a> {
    map: &'a Map<String, Value>,
}

impl FieldReader<'_> {
    fn lookup(&self, field: &'static str) -> Option<&Value> {
        self.map.get(field).filter(|v| !v.is_null())
    }

    fn float(
        &self,
        field: &'static str,
        default: f32,
        bounds: &RangeInclusive<f32>,
    ) -> Result<f32, SamplingError> {
        let value = match self.lookup(field) {
            None => return Ok(default),
            Some(v) => v.as_f64().ok_or(SamplingError::InvalidType { field })?,
        };
        check_float(field, value as f32, bounds)
    }

    fn count(
        &self,
        field: &'static str,
        default: u32,
        bounds: &RangeInclusive<u32>,
    ) -> Result<u32, SamplingError> {
        let value = match self.lookup(field) {
            None => return Ok(default),
            Some(v) => v.as_f64().ok_or(SamplingError::InvalidType { field })?,
        };
        if value.fract() != 0.0 {
            return Err(SamplingError::InvalidType { field });
        }
        if value < f64::from(*bounds.start()) || value > f64::from(*bounds.end()) {
            return Err(out_of_range(field, value, *bounds.start(), *bounds.end()));
        }
        Ok(value as u32)
    }
}

fn check_float(
    field: &'static str,
    value: f32,
    bounds: &RangeInclusive<f32>,
) -> Result<f32, SamplingError> {
    if !value.is_finite() || !bounds.contains(&value) {
        return Err(out_of_range(field, value, *bounds.start(), *bounds.end()));
    }
    Ok(value)
}

fn check_count(
    field: &'static str,
    value: u32,
    bounds: &RangeInclusive<u32>,
) -> Result<u32, SamplingError> {
    if !bounds.contains(&value) {
        return Err(out_of_range(field, value, *bounds.start(), *bounds.end()));
    }
    Ok(value)
}

fn out_of_range(
    field: &'static str,
    value: impl Into<f64>,
    min: impl Into<f64>,
    max: impl Into<f64>,
) -> SamplingError {
    SamplingError::OutOfRange {
        field,
        value: value.into(),
        min: min.into(),
        max: max.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_fields_take_defaults() {
        let params = BackendKind::Hf
            .validate_sampling(&json!({}), &SamplingDefaults::default())
            .unwrap();
        assert_eq!(
            params,
            SamplingParams::Hf(HfSamplingParams {
                max_new_tokens: 1000,
                temperature: 0.6,
                top_p: 0.95,
                repetition_penalty: 1.2,
            })
        );
    }

    #[test]
    fn null_is_treated_as_missing() {
        let params = BackendKind::Mock
            .validate_sampling(&json!({"temperature": null}), &SamplingDefaults::default())
            .unwrap();
        assert_eq!(params.temperature(), 0.6);
    }

    #[test]
    fn integral_float_is_accepted_for_counts() {
        let params = BackendKind::Mock
            .validate_sampling(&json!({"max_new_tokens": 12.0}), &SamplingDefaults::default())
            .unwrap();
        assert_eq!(params.max_new_tokens(), 12);
    }

    #[test]
    fn fractional_count_is_rejected() {
        let err = BackendKind::Mock
            .validate_sampling(&json!({"max_new_tokens": 1.5}), &SamplingDefaults::default())
            .unwrap_err();
        assert_eq!(
            err,
            SamplingError::InvalidType {
                field: "max_new_tokens"
            }
        );
    }

    #[test]
    fn zero_max_new_tokens_is_out_of_range() {
        let err = BackendKind::Mock
            .validate_sampling(&json!({"max_new_tokens": 0}), &SamplingDefaults::default())
            .unwrap_err();
        assert!(matches!(
            err,
            SamplingError::OutOfRange {
                field: "max_new_tokens",
                ..
            }
        ));
    }

    #[test]
    fn defaults_validation_catches_bad_config() {
        let defaults = SamplingDefaults {
            top_p: 1.5,
            ..SamplingDefaults::default()
        };
        assert!(defaults.validate().is_err());
        assert!(SamplingDefaults::default().validate().is_ok());
    }
}
