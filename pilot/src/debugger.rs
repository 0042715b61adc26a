//! Bounded, branch-rewinding repair loop for failed steps.
//!
//! `debug()` asks the model for a repair plan, runs it through a
//! [`TaskRunner`], and revises the plan when the runner stops mid-way. Each
//! call owns one conversation branch saved on entry; every recoverable
//! failure rewinds to it. Nesting is bounded by a recursion layer that is
//! restored on every exit path by a scoped guard.

use std::cell::Cell;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::conversation::Conversation;
use crate::core::answers::is_affirmative;
use crate::core::functions::{debug_steps_breakdown, development_task};
use crate::core::recursion::{RecursionGuard, TokenLimitAction, token_limit_action};
use crate::core::steps::{CommandSpec, DebugPlan, Step, TaskPlan};
use crate::core::types::PromptTemplate;
use crate::developer::{TaskOptions, TaskResult, TaskRunner, TaskSource, describe_steps};
use crate::error::{LlmError, TooDeepRecursionError, is_token_limit};
use crate::io::files::render_file_blocks;
use crate::io::store::RecordKind;
use crate::session::Session;

/// What to debug and how.
#[derive(Debug, Clone, Default)]
pub struct DebugRequest {
    /// The command that failed; re-run as the test after each repair step.
    pub command: Option<CommandSpec>,
    pub cli_response: Option<String>,
    /// What the human reported (for failures found by manual testing).
    pub user_input: Option<String>,
    pub issue_description: Option<String>,
    /// Steps of the task being debugged, for context.
    pub task_steps: Vec<Step>,
    /// Index of the failing step within `task_steps`.
    pub step_index: Option<usize>,
    /// Files whose current contents are shown to the model.
    pub context_files: Vec<String>,
    pub ask_before_debug: bool,
}

/// Result of one step of the repair loop, consumed by exhaustive matching.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The repair task ran to completion with the given outcome.
    Completed { success: bool },
    /// Replans within the attempt were used up; start a new attempt.
    RetryWithNewPlan,
    TokenLimitExceeded(anyhow::Error),
    RecursionExceeded(anyhow::Error),
    MalformedResponse(anyhow::Error),
    /// Anything else; ends the debug call.
    Fatal(anyhow::Error),
}

impl AttemptOutcome {
    pub fn from_error(err: anyhow::Error) -> Self {
        if is_token_limit(&err) {
            return AttemptOutcome::TokenLimitExceeded(err);
        }
        if err
            .chain()
            .any(|cause| cause.downcast_ref::<TooDeepRecursionError>().is_some())
        {
            return AttemptOutcome::RecursionExceeded(err);
        }
        if err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<LlmError>(),
                Some(LlmError::MalformedResponse(_))
            )
        }) {
            return AttemptOutcome::MalformedResponse(err);
        }
        AttemptOutcome::Fatal(err)
    }
}

pub struct Debugger<'a> {
    session: Session<'a>,
    recursion_layer: Cell<u32>,
    max_recursion_layer: u32,
    max_tries: u32,
}

impl<'a> Debugger<'a> {
    pub fn new(session: Session<'a>) -> Self {
        Self {
            session,
            recursion_layer: Cell::new(0),
            max_recursion_layer: session.config.max_recursion_layer,
            max_tries: session.config.max_command_debug_tries,
        }
    }

    /// Current nesting depth (0 when no debug call is active).
    pub fn recursion_layer(&self) -> u32 {
        self.recursion_layer.get()
    }

    /// Try to repair the failure described by `request`.
    ///
    /// Returns `Ok(true)` when a repair task succeeded and `Ok(false)` when it
    /// failed or the attempts ran out. Errors:
    /// - [`TooDeepRecursionError`] when nesting exceeds the configured maximum;
    /// - token-limit errors from nested calls, after rewinding this call's branch;
    /// - anything unrecoverable (API, I/O, interrupt).
    ///
    /// The recursion layer is back at its entry value whenever this returns.
    #[instrument(skip_all, fields(command = ?request.command.as_ref().map(|c| c.command.as_str())))]
    pub fn debug<T: TaskRunner + ?Sized>(
        &self,
        tasks: &T,
        convo: &mut Conversation<'_>,
        request: &DebugRequest,
    ) -> Result<bool> {
        let guard = RecursionGuard::enter(&self.recursion_layer);
        let layer = guard.depth();
        info!(layer, "debugging");
        self.session.record_step(
            RecordKind::Debugging,
            &json!({
                "recursion_layer": layer,
                "command": request.command.as_ref().map(|c| c.command.as_str()),
                "user_input": request.user_input,
                "issue_description": request.issue_description,
            }),
        )?;
        if guard.exceeds(self.max_recursion_layer) {
            warn!(layer, max = self.max_recursion_layer, "debugging recursion too deep");
            return Err(TooDeepRecursionError {
                max: self.max_recursion_layer,
            }
            .into());
        }

        if request.ask_before_debug {
            let answer = self
                .session
                .human
                .ask("Do you want me to debug this issue? (press ENTER to start, or \"no\" to skip)", None)?;
            if !is_affirmative(&answer) {
                info!("debugging declined by user");
                return Ok(false);
            }
        }

        let branch = convo.save_branch(None);
        for attempt in 1..=self.max_tries {
            debug!(attempt, layer, "debug attempt");
            match self.attempt(tasks, convo, request) {
                AttemptOutcome::Completed { success } => {
                    info!(attempt, success, "repair task finished");
                    return Ok(success);
                }
                AttemptOutcome::RetryWithNewPlan => {
                    debug!(attempt, "plan revisions used up");
                }
                AttemptOutcome::TokenLimitExceeded(err) => {
                    convo.load_branch(&branch, true)?;
                    match token_limit_action(layer) {
                        TokenLimitAction::Propagate => {
                            warn!(layer, "token limit inside debugging, unwinding");
                            return Err(err);
                        }
                        TokenLimitAction::RewindAndRetry => {
                            info!(err = %err, "token limit at outermost debugging, retrying");
                        }
                    }
                }
                AttemptOutcome::RecursionExceeded(err) => {
                    convo.load_branch(&branch, true)?;
                    return Err(err);
                }
                AttemptOutcome::MalformedResponse(err) => {
                    debug!(err = %err, "malformed repair plan, retrying");
                    convo.load_branch(&branch, true)?;
                }
                AttemptOutcome::Fatal(err) => return Err(err),
            }
        }
        info!(layer, tries = self.max_tries, "debugging attempts exhausted");
        Ok(false)
    }

    /// Ask for a plan and run it, revising it while the runner stops mid-way.
    fn attempt<T: TaskRunner + ?Sized>(
        &self,
        tasks: &T,
        convo: &mut Conversation<'_>,
        request: &DebugRequest,
    ) -> AttemptOutcome {
        let plan = match self.request_plan(convo, request) {
            Ok(plan) => plan,
            Err(err) => return AttemptOutcome::from_error(err),
        };
        if plan.steps.is_empty() {
            return AttemptOutcome::MalformedResponse(
                LlmError::MalformedResponse("repair plan has no steps".into()).into(),
            );
        }
        debug!(thoughts = %plan.thoughts, steps = plan.steps.len(), "received repair plan");

        let mut completed: Vec<Step> = Vec::new();
        let mut pending = plan.steps;
        for _ in 0..self.max_tries {
            let steps: Vec<Step> = completed.iter().chain(pending.iter()).cloned().collect();
            let options = TaskOptions {
                test_command: request.command.clone(),
                test_after_code_changes: true,
                continue_from_step: completed.len(),
                is_root_task: false,
                source: TaskSource::Debugger,
            };
            match tasks.execute_task(convo, &steps, &options) {
                Ok(TaskResult::Finished { success, .. }) => {
                    return AttemptOutcome::Completed { success };
                }
                Ok(TaskResult::NeedsReplan {
                    step_index,
                    cli_response,
                }) => {
                    let through = step_index.min(steps.len().saturating_sub(1));
                    completed = steps[..=through].to_vec();
                    convo.remove_last_x_messages(2);
                    match self.request_update(convo, &completed, cli_response.as_deref()) {
                        Ok(plan) => pending = plan.steps,
                        Err(err) => return AttemptOutcome::from_error(err),
                    }
                }
                Err(err) => return AttemptOutcome::from_error(err),
            }
        }
        AttemptOutcome::RetryWithNewPlan
    }

    fn request_plan(&self, convo: &mut Conversation<'_>, request: &DebugRequest) -> Result<DebugPlan> {
        let file_blocks = Some(render_file_blocks(
            self.session.project_root,
            &request.context_files,
        ))
        .filter(|blocks| !blocks.is_empty());
        let task_steps =
            (!request.task_steps.is_empty()).then(|| describe_steps(&request.task_steps));
        convo.send_as(
            PromptTemplate::Debug,
            &json!({
                "command": request.command.as_ref().map(|c| c.command.as_str()),
                "cli_response": request.cli_response,
                "issue_description": request.issue_description,
                "user_input": request.user_input,
                "task_steps": task_steps,
                "step_index": request.step_index,
                "file_blocks": file_blocks,
            }),
            &debug_steps_breakdown(),
        )
    }

    fn request_update(
        &self,
        convo: &mut Conversation<'_>,
        completed: &[Step],
        cli_response: Option<&str>,
    ) -> Result<TaskPlan> {
        convo.send_as(
            PromptTemplate::UpdateTask,
            &json!({
                "completed_steps": describe_steps(completed),
                "last_step": completed.last().map(Step::describe),
                "cli_response": cli_response,
            }),
            &development_task(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AgentRole;
    use crate::test_support::TestHarness;
    use std::cell::RefCell;

    fn plan(commands: &[&str]) -> serde_json::Value {
        let steps: Vec<_> = commands
            .iter()
            .map(|c| json!({"type": "command", "command": {"command": c}}))
            .collect();
        json!({"thoughts": "t", "reasoning": "r", "steps": steps})
    }

    /// Task runner returning scripted results and recording what it was given.
    struct ScriptedTasks {
        results: RefCell<Vec<Result<TaskResult>>>,
        calls: RefCell<Vec<(usize, usize)>>,
    }

    impl ScriptedTasks {
        fn new(results: Vec<Result<TaskResult>>) -> Self {
            Self {
                results: RefCell::new(results.into_iter().rev().collect()),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl TaskRunner for ScriptedTasks {
        fn execute_task(
            &self,
            _convo: &mut Conversation<'_>,
            steps: &[Step],
            options: &TaskOptions,
        ) -> Result<TaskResult> {
            self.calls
                .borrow_mut()
                .push((steps.len(), options.continue_from_step));
            self.results
                .borrow_mut()
                .pop()
                .unwrap_or(Ok(TaskResult::Finished {
                    success: false,
                    cli_response: None,
                }))
        }
    }

    fn finished(success: bool) -> Result<TaskResult> {
        Ok(TaskResult::Finished {
            success,
            cli_response: None,
        })
    }

    #[test]
    fn successful_repair_returns_true_and_restores_layer() {
        let harness = TestHarness::new();
        harness.llm.push_json(&plan(&["npm install"]));
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
        let debugger = Debugger::new(session);
        let tasks = ScriptedTasks::new(vec![finished(true)]);

        let fixed = debugger
            .debug(&tasks, &mut convo, &DebugRequest::default())
            .expect("debug");
        assert!(fixed);
        assert_eq!(debugger.recursion_layer(), 0);
        assert_eq!(convo.branch_names().len(), 1);
        let records = harness.store.steps_of(RecordKind::Debugging);
        assert_eq!(records[0]["recursion_layer"], 1);
    }

    /// Verifies a mid-way stop trims the plan, drops the stale exchange and re-asks.
    #[test]
    fn needs_replan_resumes_after_completed_steps() {
        let harness = TestHarness::new();
        harness.llm.push_json(&plan(&["ls", "cat package.json", "npm i"]));
        harness.llm.push_json(&json!({"steps": [
            {"type": "command", "command": {"command": "npm ci"}}
        ]}));
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
        let debugger = Debugger::new(session);
        let tasks = ScriptedTasks::new(vec![
            Ok(TaskResult::NeedsReplan {
                step_index: 1,
                cli_response: Some("{\"name\":\"app\"}".into()),
            }),
            finished(true),
        ]);

        assert!(
            debugger
                .debug(&tasks, &mut convo, &DebugRequest::default())
                .expect("debug")
        );
        // First run: 3 steps from 0. Second: 2 completed + 1 new, from 2.
        assert_eq!(*tasks.calls.borrow(), vec![(3, 0), (3, 2)]);
        let update = &harness.llm.requests()[1];
        let prompt = &update.messages.last().expect("prompt").content;
        assert!(prompt.contains("1. run `ls`\n2. run `cat package.json`"));
        assert!(prompt.contains("{\"name\":\"app\"}"));
        // The debug exchange was removed before the update was sent.
        assert_eq!(update.messages.len(), 2);
    }

    #[test]
    fn malformed_plans_are_retried_until_attempts_run_out() {
        let harness = TestHarness::with_config(|cfg| cfg.max_command_debug_tries = 2);
        for _ in 0..4 {
            harness.llm.push_text("not json");
        }
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
        let before = convo.messages().to_vec();
        let debugger = Debugger::new(session);
        let tasks = ScriptedTasks::new(Vec::new());

        let fixed = debugger
            .debug(&tasks, &mut convo, &DebugRequest::default())
            .expect("debug");
        assert!(!fixed);
        assert_eq!(debugger.recursion_layer(), 0);
        assert_eq!(convo.messages(), before.as_slice());
        assert!(tasks.calls.borrow().is_empty());
    }

    #[test]
    fn empty_plan_counts_as_malformed() {
        let harness = TestHarness::with_config(|cfg| cfg.max_command_debug_tries = 1);
        harness.llm.push_json(&plan(&[]));
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
        let debugger = Debugger::new(session);
        let tasks = ScriptedTasks::new(Vec::new());
        assert!(
            !debugger
                .debug(&tasks, &mut convo, &DebugRequest::default())
                .expect("debug")
        );
        assert_eq!(convo.messages().len(), 1);
    }

    #[test]
    fn declined_debugging_makes_no_attempt() {
        let harness = TestHarness::new();
        harness.human.push_answer("no");
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
        let debugger = Debugger::new(session);
        let request = DebugRequest {
            ask_before_debug: true,
            ..DebugRequest::default()
        };
        let tasks = ScriptedTasks::new(Vec::new());
        assert!(!debugger.debug(&tasks, &mut convo, &request).expect("debug"));
        assert_eq!(harness.llm.call_count(), 0);
        assert_eq!(debugger.recursion_layer(), 0);
    }

    /// Verifies API failures end the call without retrying.
    #[test]
    fn fatal_errors_propagate_and_restore_layer() {
        let harness = TestHarness::new();
        harness.llm.push_api_error("401 unauthorized");
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
        let debugger = Debugger::new(session);
        let tasks = ScriptedTasks::new(Vec::new());
        let err = debugger
            .debug(&tasks, &mut convo, &DebugRequest::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LlmError>(),
            Some(LlmError::Api(_))
        ));
        assert_eq!(debugger.recursion_layer(), 0);
        assert_eq!(harness.llm.call_count(), 1);
    }

    #[test]
    fn outcome_classification_sees_through_context() {
        use anyhow::Context;
        let too_deep = Err::<(), _>(TooDeepRecursionError { max: 3 })
            .context("run repair step")
            .unwrap_err();
        assert!(matches!(
            AttemptOutcome::from_error(too_deep),
            AttemptOutcome::RecursionExceeded(_)
        ));
        let io = anyhow::anyhow!("disk full");
        assert!(matches!(
            AttemptOutcome::from_error(io),
            AttemptOutcome::Fatal(_)
        ));
    }
}
