//! Prompt template rendering.
//!
//! Templates are compiled into the binary and rendered with minijinja in
//! strict mode, so a missing variable is an error rather than an empty string.

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{AgentRole, PromptTemplate};

const TEMPLATES: &[(PromptTemplate, &str)] = &[
    (
        PromptTemplate::System(AgentRole::ProductOwner),
        include_str!("prompts/system/product_owner.md"),
    ),
    (
        PromptTemplate::System(AgentRole::Architect),
        include_str!("prompts/system/architect.md"),
    ),
    (
        PromptTemplate::System(AgentRole::TechLead),
        include_str!("prompts/system/tech_lead.md"),
    ),
    (
        PromptTemplate::System(AgentRole::FullStackDeveloper),
        include_str!("prompts/system/full_stack_developer.md"),
    ),
    (
        PromptTemplate::System(AgentRole::DevOps),
        include_str!("prompts/system/dev_ops.md"),
    ),
    (
        PromptTemplate::System(AgentRole::CodeMonkey),
        include_str!("prompts/system/code_monkey.md"),
    ),
    (PromptTemplate::Debug, include_str!("prompts/dev_ops/debug.md")),
    (
        PromptTemplate::RanCommand,
        include_str!("prompts/dev_ops/ran_command.md"),
    ),
    (
        PromptTemplate::TaskBreakdown,
        include_str!("prompts/development/task/breakdown.md"),
    ),
    (
        PromptTemplate::UpdateTask,
        include_str!("prompts/development/task/update_task.md"),
    ),
];

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        for (template, source) in TEMPLATES {
            env.add_template(template.name(), *source)
                .with_context(|| format!("compile template {}", template.name()))?;
        }
        Ok(Self { env })
    }

    /// Render `template` with `data`. Unresolved variables are an error.
    pub fn render<S: Serialize>(&self, template: PromptTemplate, data: &S) -> Result<String> {
        let name = template.name();
        let compiled = self
            .env
            .get_template(name)
            .with_context(|| format!("lookup template {name}"))?;
        let rendered = compiled
            .render(data)
            .with_context(|| format!("render template {name}"))?;
        debug!(template = name, chars = rendered.len(), "rendered prompt");
        Ok(rendered.trim().to_string())
    }
}
