//! Structured-response definitions sent to the model as callable functions.
//!
//! Each definition carries a JSON Schema used both as the function's
//! `parameters` on the wire and to validate whatever the model returns.

use anyhow::{Result, anyhow};
use jsonschema::validator_for;
use serde::Serialize;
use serde_json::{Value, json};

/// A single function the model may call to return structured data.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl FunctionDef {
    /// Validate `value` against this function's parameter schema.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let compiled = validator_for(&self.parameters)
            .map_err(|err| anyhow!("invalid schema for {}: {}", self.name, err))?;
        if compiled.is_valid(value) {
            return Ok(());
        }
        let messages = compiled
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        Err(anyhow!(
            "{} response failed schema validation: {}",
            self.name,
            messages.join("; ")
        ))
    }
}

/// The schema a structured reply must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSet {
    pub definitions: Vec<FunctionDef>,
}

impl FunctionSet {
    /// The function the model is forced to call (first definition).
    pub fn primary(&self) -> Option<&FunctionDef> {
        self.definitions.first()
    }

    pub fn find(&self, name: &str) -> Option<&FunctionDef> {
        self.definitions.iter().find(|def| def.name == name)
    }
}

fn command_schema() -> Value {
    json!({
        "type": "object",
        "required": ["command"],
        "properties": {
            "command": {"type": "string", "minLength": 1},
            "timeout": {"type": "integer"},
            "success_message": {"type": "string"},
            "command_id": {"type": "string"}
        }
    })
}

fn step_schema() -> Value {
    json!({
        "oneOf": [
            {
                "type": "object",
                "required": ["type", "command"],
                "properties": {
                    "type": {"const": "command"},
                    "command": command_schema(),
                    "need_to_see_output": {"type": "boolean"},
                    "check_if_fixed": {"type": "boolean"}
                }
            },
            {
                "type": "object",
                "required": ["type", "code_change"],
                "properties": {
                    "type": {"const": "code_change"},
                    "code_change": {
                        "type": "object",
                        "required": ["path", "content"],
                        "properties": {
                            "path": {"type": "string", "minLength": 1},
                            "content": {"type": "string"}
                        }
                    },
                    "check_if_fixed": {"type": "boolean"}
                }
            },
            {
                "type": "object",
                "required": ["type", "human_intervention_description"],
                "properties": {
                    "type": {"const": "human_intervention"},
                    "human_intervention_description": {"type": "string"}
                }
            }
        ]
    })
}

/// Reply shape for the debug prompt: reasoning plus an ordered list of repair steps.
pub fn debug_steps_breakdown() -> FunctionSet {
    FunctionSet {
        definitions: vec![FunctionDef {
            name: "start_debugging".to_string(),
            description: "Starts the debugging process based on the list of steps that need to be done to debug the problem.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["thoughts", "reasoning", "steps"],
                "properties": {
                    "thoughts": {"type": "string"},
                    "reasoning": {"type": "string"},
                    "steps": {"type": "array", "items": step_schema()}
                }
            }),
        }],
    }
}

/// Reply shape for the task breakdown and update prompts.
pub fn development_task() -> FunctionSet {
    FunctionSet {
        definitions: vec![FunctionDef {
            name: "break_down_development_task".to_string(),
            description: "Breaks down the development task into smaller steps that need to be done to implement the entire task.".to_string(),
            parameters: json!({
                "type": "object",
                "required": ["steps"],
                "properties": {
                    "steps": {"type": "array", "items": step_schema()},
                    "test_command": command_schema()
                }
            }),
        }],
    }
}
