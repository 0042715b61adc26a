//! Shared types for conversation transcripts, agent roles and command verdicts.

use serde::{Deserialize, Serialize};

/// Who authored a transcript message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// One transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Role-bound agent that owns a conversation.
///
/// Each role maps to exactly one system prompt template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    ProductOwner,
    Architect,
    TechLead,
    FullStackDeveloper,
    DevOps,
    CodeMonkey,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        AgentRole::ProductOwner,
        AgentRole::Architect,
        AgentRole::TechLead,
        AgentRole::FullStackDeveloper,
        AgentRole::DevOps,
        AgentRole::CodeMonkey,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::ProductOwner => "product_owner",
            AgentRole::Architect => "architect",
            AgentRole::TechLead => "tech_lead",
            AgentRole::FullStackDeveloper => "full_stack_developer",
            AgentRole::DevOps => "dev_ops",
            AgentRole::CodeMonkey => "code_monkey",
        }
    }

    pub fn system_template(self) -> PromptTemplate {
        PromptTemplate::System(self)
    }
}

/// Closed set of prompt templates the core renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptTemplate {
    /// Fixed system prompt for an agent role.
    System(AgentRole),
    /// Ask for a breakdown of repair steps.
    Debug,
    /// Ask for an updated plan after a task stopped mid-way.
    UpdateTask,
    /// Ask for a verdict on captured command output.
    RanCommand,
    /// Ask for the initial development plan.
    TaskBreakdown,
}

impl PromptTemplate {
    pub fn name(self) -> &'static str {
        match self {
            PromptTemplate::System(AgentRole::ProductOwner) => "system/product_owner",
            PromptTemplate::System(AgentRole::Architect) => "system/architect",
            PromptTemplate::System(AgentRole::TechLead) => "system/tech_lead",
            PromptTemplate::System(AgentRole::FullStackDeveloper) => "system/full_stack_developer",
            PromptTemplate::System(AgentRole::DevOps) => "system/dev_ops",
            PromptTemplate::System(AgentRole::CodeMonkey) => "system/code_monkey",
            PromptTemplate::Debug => "dev_ops/debug",
            PromptTemplate::UpdateTask => "development/task/update_task",
            PromptTemplate::RanCommand => "dev_ops/ran_command",
            PromptTemplate::TaskBreakdown => "development/task/breakdown",
        }
    }
}

/// Closed-vocabulary judgement about a command's outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Done,
    Bug,
    NeedsDebugging,
    Timeout,
    Skipped,
    Interrupted,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Done => "DONE",
            Verdict::Bug => "BUG",
            Verdict::NeedsDebugging => "NEEDS_DEBUGGING",
            Verdict::Timeout => "TIMEOUT",
            Verdict::Skipped => "SKIPPED",
            Verdict::Interrupted => "INTERRUPTED",
        }
    }

    /// Parse a verdict token as the judging model returns it.
    ///
    /// Only the tokens a judge may emit are accepted (`DONE`, `BUG`,
    /// `NEEDS_DEBUGGING`); surrounding whitespace, punctuation and
    /// backticks are ignored.
    pub fn from_reply(reply: &str) -> Option<Verdict> {
        let token = reply
            .trim()
            .trim_matches(|c: char| c == '`' || c == '.' || c == '"' || c == '\'')
            .trim()
            .to_ascii_uppercase()
            .replace([' ', '-'], "_");
        match token.as_str() {
            "DONE" => Some(Verdict::Done),
            "BUG" => Some(Verdict::Bug),
            "NEEDS_DEBUGGING" => Some(Verdict::NeedsDebugging),
            _ => None,
        }
    }

    /// Verdicts that let a task continue with the next step.
    pub fn is_success(self) -> bool {
        matches!(self, Verdict::Done | Verdict::Skipped)
    }
}

/// Outcome of running and judging one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Formatted output, `None` when the run was cut short by force or skipped.
    pub cli_response: Option<String>,
    pub verdict: Verdict,
    /// `None` when the process was signalled, still running, or never started.
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_parses_decorated_tokens() {
        assert_eq!(Verdict::from_reply(" `DONE`.\n"), Some(Verdict::Done));
        assert_eq!(Verdict::from_reply("bug"), Some(Verdict::Bug));
        assert_eq!(
            Verdict::from_reply("needs debugging"),
            Some(Verdict::NeedsDebugging)
        );
        assert_eq!(Verdict::from_reply("it worked I think"), None);
        assert_eq!(Verdict::from_reply("TIMEOUT"), None);
    }

    /// Verifies every role has a distinct system template.
    #[test]
    fn roles_map_to_distinct_system_templates() {
        let mut names: Vec<_> = AgentRole::ALL
            .iter()
            .map(|role| role.system_template().name())
            .collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), AgentRole::ALL.len());
    }
}
