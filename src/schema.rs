//! Declared parameter schemas, one per provider kind.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::types::{Parameters, ProviderKind};
use crate::Error;

/// Accepted shape of a single parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Bool,
    Number { min: f64, max: f64 },
    Integer { min: i64, max: i64 },
    StringList,
    OneOf(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub field_type: FieldType,
    pub required: bool,
}

/// Named fields a provider kind accepts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an optional field.
    pub fn optional(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                required: false,
            },
        );
        self
    }

    /// Add a required field.
    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                required: true,
            },
        );
        self
    }

    /// The built-in schema for a provider kind.
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::TextCompletion => Self::chat_completion(),
            ProviderKind::MediaJob => Self::image_job(),
        }
    }

    /// OpenAI-compatible chat completion options.
    pub fn chat_completion() -> Self {
        Self::new()
            .optional("model", FieldType::String)
            .optional("system", FieldType::String)
            .optional("temperature", FieldType::Number { min: 0.0, max: 2.0 })
            .optional("top_p", FieldType::Number { min: 0.0, max: 1.0 })
            .optional("max_tokens", FieldType::Integer { min: 1, max: 1_000_000 })
            .optional("stop", FieldType::StringList)
            .optional("presence_penalty", FieldType::Number { min: -2.0, max: 2.0 })
            .optional("frequency_penalty", FieldType::Number { min: -2.0, max: 2.0 })
    }

    /// Flux-style text-to-image job options.
    pub fn image_job() -> Self {
        let sizes = [
            "square_hd",
            "square",
            "portrait_4_3",
            "portrait_16_9",
            "landscape_4_3",
            "landscape_16_9",
        ];
        Self::new()
            .optional("model", FieldType::String)
            .optional("negative_prompt", FieldType::String)
            .optional(
                "image_size",
                FieldType::OneOf(sizes.iter().map(|s| s.to_string()).collect()),
            )
            .optional("num_inference_steps", FieldType::Integer { min: 1, max: 100 })
            .optional("guidance_scale", FieldType::Number { min: 0.0, max: 20.0 })
            .optional("scheduler", FieldType::String)
            .optional("seed", FieldType::Integer { min: -1, max: i64::MAX })
            .optional("num_images", FieldType::Integer { min: 1, max: 4 })
            .optional("enable_safety_checker", FieldType::Bool)
            .optional("sync_mode", FieldType::Bool)
    }

    /// Check `parameters` against this schema.
    pub fn validate(&self, parameters: &Parameters) -> Result<(), Error> {
        for (name, value) in parameters {
            let spec = self
                .fields
                .get(name)
                .ok_or_else(|| Error::validation(format!("unknown parameter '{name}'")))?;
            check_type(name, &spec.field_type, value)?;
        }

        if let Some((name, _)) = self
            .fields
            .iter()
            .find(|(name, spec)| spec.required && !parameters.contains_key(*name))
        {
            return Err(Error::validation(format!("missing parameter '{name}'")));
        }

        Ok(())
    }
}

fn check_type(name: &str, field_type: &FieldType, value: &Value) -> Result<(), Error> {
    let mismatch = |expected: &str| {
        Error::validation(format!("parameter '{name}' must be {expected}, got {value}"))
    };

    match field_type {
        FieldType::String => {
            value.as_str().ok_or_else(|| mismatch("a string"))?;
        }
        FieldType::Bool => {
            value.as_bool().ok_or_else(|| mismatch("a boolean"))?;
        }
        FieldType::Number { min, max } => {
            let n = value.as_f64().ok_or_else(|| mismatch("a number"))?;
            if n < *min || n > *max {
                return Err(mismatch(&format!("between {min} and {max}")));
            }
        }
        FieldType::Integer { min, max } => {
            let n = value.as_i64().ok_or_else(|| mismatch("an integer"))?;
            if n < *min || n > *max {
                return Err(mismatch(&format!("between {min} and {max}")));
            }
        }
        FieldType::StringList => {
            let ok = value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string));
            if !ok {
                return Err(mismatch("a list of strings"));
            }
        }
        FieldType::OneOf(choices) => {
            let s = value.as_str().ok_or_else(|| mismatch("a string"))?;
            if !choices.iter().any(|c| c == s) {
                return Err(mismatch(&format!("one of {}", choices.join(", "))));
            }
        }
    }

    Ok(())
}
