// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Capability Registry (C2): a pure table of (capability, operation,
//! parameter schema) tuples. No state, no side effects.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::ParamError;

/// Parameter schema for a single named parameter.
#[derive(Debug, Clone)]
pub enum ParamSchema {
    String,
    Number,
    Bool,
    Enum(&'static [&'static str]),
    Object,
}

impl ParamSchema {
    fn type_name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Enum(_) => "enum",
            Self::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Enum(allowed) => value.as_str().map(|s| allowed.contains(&s)).unwrap_or(false),
        }
    }
}

/// A single named, optionally-required parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub schema: ParamSchema,
    pub required: bool,
}

/// Describes one operation a capability supports.
#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub name: &'static str,
    pub params: Vec<ParamSpec>,
}

/// `(id, name, operations, param_schema, requires_connection)` (spec §3).
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    pub id: String,
    pub name: String,
    pub operations: Vec<OperationSpec>,
    pub requires_connection: bool,
}

impl CapabilityDescriptor {
    fn operation(&self, operation: &str) -> Option<&OperationSpec> {
        self.operations.iter().find(|op| op.name == operation)
    }
}

/// Pure, immutable lookup table built once at process start from each
/// connector implementation's manifest (spec §4.1). No interior mutability:
/// a `CapabilityRegistry` is constructed once and shared via `Arc`.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    descriptors: HashMap<String, CapabilityDescriptor>,
}

impl CapabilityRegistry {
    pub fn from_descriptors(descriptors: Vec<CapabilityDescriptor>) -> Self {
        Self { descriptors: descriptors.into_iter().map(|d| (d.id.clone(), d)).collect() }
    }

    /// `lookup(capability_id) -> Descriptor`.
    pub fn lookup(&self, capability_id: &str) -> Option<&CapabilityDescriptor> {
        self.descriptors.get(capability_id)
    }

    /// `validate(capability_id, operation, parameters) -> Ok | ParamError`.
    ///
    /// Returns `Ok(None)` for an unknown capability/operation so callers can
    /// distinguish "not found" from "found but invalid params" — the
    /// `ExecuteError::UnknownCapability`/`UnknownOperation` variants carry
    /// that distinction at the connector-runtime layer.
    pub fn validate(
        &self,
        capability_id: &str,
        operation: &str,
        parameters: &serde_json::Map<String, Value>,
    ) -> Result<(), ValidationOutcome> {
        let Some(descriptor) = self.descriptors.get(capability_id) else {
            return Err(ValidationOutcome::UnknownCapability);
        };
        let Some(op) = descriptor.operation(operation) else {
            return Err(ValidationOutcome::UnknownOperation);
        };

        for spec in &op.params {
            match parameters.get(spec.name) {
                Some(value) => {
                    if !spec.schema.matches(value) {
                        return Err(ValidationOutcome::Param(ParamError::WrongType {
                            name: spec.name.to_owned(),
                            expected: spec.schema.type_name(),
                            got: value.to_string(),
                        }));
                    }
                    if let ParamSchema::Enum(allowed) = &spec.schema {
                        if let Some(s) = value.as_str() {
                            if !allowed.contains(&s) {
                                return Err(ValidationOutcome::Param(ParamError::NotAllowed {
                                    name: spec.name.to_owned(),
                                    allowed: allowed.to_vec(),
                                    got: s.to_owned(),
                                }));
                            }
                        }
                    }
                }
                None if spec.required => {
                    return Err(ValidationOutcome::Param(ParamError::Missing(spec.name.to_owned())));
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Outcome of a failed validation, distinguishing the three ways a call can
/// be rejected structurally before any I/O happens.
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    UnknownCapability,
    UnknownOperation,
    Param(ParamError),
}

#[cfg(test)]
mod registry_tests;
