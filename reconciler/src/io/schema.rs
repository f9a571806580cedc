//! JSON Schema checks for process directives and queue payloads.

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;

pub const PROCESS_DIRECTIVE_SCHEMA: &str =
    include_str!("../../schemas/process_directive.schema.json");
pub const DIRECTIVE_SCHEMA: &str = include_str!("../../schemas/directive.schema.json");

/// A compiled schema, reusable for many instances.
pub struct SchemaValidator {
    name: &'static str,
    validator: Validator,
}

impl SchemaValidator {
    pub fn compile(name: &'static str, source: &str) -> Result<Self> {
        let schema: Value =
            serde_json::from_str(source).with_context(|| format!("parse {name} schema"))?;
        let validator =
            validator_for(&schema).map_err(|err| anyhow!("invalid {name} schema: {err}"))?;
        Ok(Self { name, validator })
    }

    pub fn process_directive() -> Result<Self> {
        Self::compile("process directive", PROCESS_DIRECTIVE_SCHEMA)
    }

    pub fn directive() -> Result<Self> {
        Self::compile("directive", DIRECTIVE_SCHEMA)
    }

    /// All violations of `instance`, joined into one message.
    pub fn check(&self, instance: &Value) -> std::result::Result<(), String> {
        if self.validator.is_valid(instance) {
            return Ok(());
        }
        let messages = self
            .validator
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        Err(format!(
            "{} schema validation failed: {}",
            self.name,
            messages.join("; ")
        ))
    }
}
