//! Development step model consumed by the task executor and produced by plans.

use serde::{Deserialize, Serialize};

/// A shell command to run as part of a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    /// Requested run time in milliseconds (values below 1000 are read as seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    /// Output fragment that signals the command has done its job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_message: Option<String>,
    /// Stable logical name for a long-running (background) process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
            success_message: None,
            command_id: None,
        }
    }

    pub fn with_timeout(mut self, timeout: i64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_success_message(mut self, marker: impl Into<String>) -> Self {
        self.success_message = Some(marker.into());
        self
    }

    pub fn with_command_id(mut self, id: impl Into<String>) -> Self {
        self.command_id = Some(id.into());
        self
    }
}

/// Full replacement contents for one file, relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeChange {
    pub path: String,
    pub content: String,
}

fn default_true() -> bool {
    true
}

/// One unit of work in a development or repair plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Command {
        command: CommandSpec,
        /// Stop the task after this command so the plan can be revised.
        #[serde(default)]
        need_to_see_output: bool,
        #[serde(default)]
        check_if_fixed: bool,
    },
    CodeChange {
        code_change: CodeChange,
        #[serde(default = "default_true")]
        check_if_fixed: bool,
    },
    HumanIntervention {
        human_intervention_description: String,
    },
}

/// Discriminant of [`Step`], used for logging and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Command,
    CodeChange,
    HumanIntervention,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Command => "command",
            StepKind::CodeChange => "code_change",
            StepKind::HumanIntervention => "human_intervention",
        }
    }
}

impl Step {
    pub fn command(spec: CommandSpec) -> Self {
        Step::Command {
            command: spec,
            need_to_see_output: false,
            check_if_fixed: false,
        }
    }

    pub fn code_change(path: impl Into<String>, content: impl Into<String>) -> Self {
        Step::CodeChange {
            code_change: CodeChange {
                path: path.into(),
                content: content.into(),
            },
            check_if_fixed: true,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Step::Command { .. } => StepKind::Command,
            Step::CodeChange { .. } => StepKind::CodeChange,
            Step::HumanIntervention { .. } => StepKind::HumanIntervention,
        }
    }

    pub fn check_if_fixed(&self) -> bool {
        match self {
            Step::Command { check_if_fixed, .. } | Step::CodeChange { check_if_fixed, .. } => {
                *check_if_fixed
            }
            Step::HumanIntervention { .. } => false,
        }
    }

    /// One-line human readable summary used in prompts and logs.
    pub fn describe(&self) -> String {
        match self {
            Step::Command { command, .. } => format!("run `{}`", command.command),
            Step::CodeChange { code_change, .. } => format!("write {}", code_change.path),
            Step::HumanIntervention {
                human_intervention_description,
            } => format!("ask human: {human_intervention_description}"),
        }
    }
}

/// Structured reply to the debug prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebugPlan {
    #[serde(default)]
    pub thoughts: String,
    #[serde(default)]
    pub reasoning: String,
    pub steps: Vec<Step>,
}

/// Structured reply to the task breakdown and update prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPlan {
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<CommandSpec>,
}

/// Paths touched by code-change steps, in plan order without duplicates.
pub fn touched_paths(steps: &[Step]) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for step in steps {
        if let Step::CodeChange { code_change, .. } = step
            && !paths.contains(&code_change.path)
        {
            paths.push(code_change.path.clone());
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Verifies the tagged wire shape and the `check_if_fixed` defaults.
    #[test]
    fn steps_deserialize_from_tagged_json() {
        let steps: Vec<Step> = serde_json::from_value(json!([
            {"type": "command", "command": {"command": "npm test", "timeout": 30}},
            {"type": "code_change", "code_change": {"path": "a.js", "content": "x"}},
            {"type": "human_intervention", "human_intervention_description": "start db"}
        ]))
        .expect("deserialize");

        assert_eq!(steps[0].kind(), StepKind::Command);
        assert!(!steps[0].check_if_fixed());
        assert!(steps[1].check_if_fixed());
        assert_eq!(steps[2].describe(), "ask human: start db");
        match &steps[0] {
            Step::Command { command, .. } => assert_eq!(command.timeout, Some(30)),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn touched_paths_dedupes_in_order() {
        let steps = vec![
            Step::code_change("b.rs", "1"),
            Step::command(CommandSpec::new("ls")),
            Step::code_change("a.rs", "2"),
            Step::code_change("b.rs", "3"),
        ];
        assert_eq!(touched_paths(&steps), vec!["b.rs", "a.rs"]);
    }
}
