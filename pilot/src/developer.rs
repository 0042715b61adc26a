//! Task Step Executor: runs a plan's steps in order with a resumable cursor.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::command::{CommandExecutor, RunEnd};
use crate::conversation::Conversation;
use crate::core::answers::is_affirmative;
use crate::core::steps::{CommandSpec, Step, touched_paths};
use crate::core::types::Verdict;
use crate::core::verdict::format_cli_response;
use crate::debugger::{DebugRequest, Debugger};
use crate::error::InterruptedError;
use crate::io::files::write_file;
use crate::io::store::RecordKind;
use crate::session::Session;

/// Who asked for a task to be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    Root,
    Debugger,
    UxTest,
}

impl TaskSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskSource::Root => "root",
            TaskSource::Debugger => "debugger",
            TaskSource::UxTest => "ux_test",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Command that tells whether the task achieved its goal.
    pub test_command: Option<CommandSpec>,
    /// Re-run the test after every step marked `check_if_fixed`.
    pub test_after_code_changes: bool,
    /// Steps before this index are treated as already done.
    pub continue_from_step: usize,
    /// Persist the cursor on the app record after each step.
    pub is_root_task: bool,
    pub source: TaskSource,
}

impl TaskOptions {
    pub fn root(continue_from_step: usize) -> Self {
        Self {
            test_command: None,
            test_after_code_changes: false,
            continue_from_step,
            is_root_task: true,
            source: TaskSource::Root,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// Every step ran (or the test passed early).
    Finished {
        success: bool,
        cli_response: Option<String>,
    },
    /// Stopped after `step_index` so the plan can be revised from its output.
    NeedsReplan {
        step_index: usize,
        cli_response: Option<String>,
    },
}

/// Runs a list of steps. The Debugger depends on this seam, not on [`Developer`].
pub trait TaskRunner {
    fn execute_task(
        &self,
        convo: &mut Conversation<'_>,
        steps: &[Step],
        options: &TaskOptions,
    ) -> Result<TaskResult>;
}

/// Numbered one-line summaries, as shown to the model.
pub fn describe_steps(steps: &[Step]) -> String {
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{}. {}", i + 1, step.describe()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result of [`Developer::run_command_until_success`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub cli_response: Option<String>,
}

pub struct Developer<'a> {
    session: Session<'a>,
    executor: CommandExecutor<'a>,
    debugger: Debugger<'a>,
}

impl<'a> Developer<'a> {
    pub fn new(session: Session<'a>) -> Self {
        Self {
            session,
            executor: CommandExecutor::new(session),
            debugger: Debugger::new(session),
        }
    }

    pub fn debugger(&self) -> &Debugger<'a> {
        &self.debugger
    }

    pub fn executor(&self) -> &CommandExecutor<'a> {
        &self.executor
    }

    /// Execute `spec`; when it does not succeed, debug it.
    ///
    /// `steps` and `index` locate the command within its task and are shown
    /// to the model as context.
    pub fn run_command_until_success(
        &self,
        convo: &mut Conversation<'_>,
        spec: &CommandSpec,
        steps: &[Step],
        index: Option<usize>,
    ) -> Result<CommandOutcome> {
        let result = self.executor.execute(convo, spec, None)?;
        match result.verdict {
            Verdict::Done | Verdict::Skipped => {
                return Ok(CommandOutcome {
                    success: true,
                    cli_response: result.cli_response,
                });
            }
            Verdict::Interrupted => return Err(InterruptedError.into()),
            Verdict::Bug | Verdict::NeedsDebugging | Verdict::Timeout => {}
        }

        info!(command = %spec.command, verdict = result.verdict.as_str(), "command failed, debugging");
        let request = DebugRequest {
            command: Some(spec.clone()),
            cli_response: result.cli_response.clone(),
            task_steps: steps.to_vec(),
            step_index: index,
            context_files: touched_paths(steps),
            ..DebugRequest::default()
        };
        let success = self.debugger.debug(self, convo, &request)?;
        Ok(CommandOutcome {
            success,
            cli_response: result.cli_response,
        })
    }

    fn run_test(
        &self,
        convo: &mut Conversation<'_>,
        test_command: &CommandSpec,
    ) -> Result<CommandOutcome> {
        let result = self.executor.execute(convo, test_command, None)?;
        if result.verdict == Verdict::Interrupted {
            return Err(InterruptedError.into());
        }
        Ok(CommandOutcome {
            success: result.verdict.is_success(),
            cli_response: result.cli_response,
        })
    }

    fn save_cursor(&self, index: usize) -> Result<()> {
        let Some(mut app) = self.session.store.get_app(self.session.app_id)? else {
            warn!(app_id = self.session.app_id, "no app record, cursor not saved");
            return Ok(());
        };
        app.completed_through = Some(index);
        self.session.store.save_app(&app)
    }
}

impl TaskRunner for Developer<'_> {
    #[instrument(skip_all, fields(steps = steps.len(), from = options.continue_from_step, source = options.source.as_str()))]
    fn execute_task(
        &self,
        convo: &mut Conversation<'_>,
        steps: &[Step],
        options: &TaskOptions,
    ) -> Result<TaskResult> {
        for (index, step) in steps.iter().enumerate().skip(options.continue_from_step) {
            if self.session.interrupt.is_set() {
                warn!(index, "interrupted between steps");
                return Err(InterruptedError.into());
            }
            self.session.record_step(
                RecordKind::TaskStep,
                &json!({
                    "index": index,
                    "step": step,
                    "source": options.source.as_str(),
                }),
            )?;
            println!(
                "\n--------- STEP {}/{} ({}) ----------\n{}",
                index + 1,
                steps.len(),
                step.kind().as_str(),
                step.describe()
            );

            match step {
                Step::Command {
                    command,
                    need_to_see_output: true,
                    ..
                } => {
                    let run = self.executor.run(command)?;
                    if run.end == RunEnd::Interrupted {
                        return Err(InterruptedError.into());
                    }
                    let cli_response = (run.end != RunEnd::Skipped).then(|| {
                        format_cli_response(
                            &run.stdout,
                            &run.stderr,
                            self.session.config.max_command_output_length,
                        )
                    });
                    self.session.store.record_command_run(
                        self.session.app_id,
                        &command.command,
                        cli_response.as_deref(),
                        run.exit_code,
                    )?;
                    if options.is_root_task {
                        self.save_cursor(index)?;
                    }
                    debug!(index, "stopping for plan update");
                    return Ok(TaskResult::NeedsReplan {
                        step_index: index,
                        cli_response,
                    });
                }
                Step::Command { command, .. } => {
                    let outcome = self.run_command_until_success(convo, command, steps, Some(index))?;
                    if !outcome.success {
                        return Ok(TaskResult::Finished {
                            success: false,
                            cli_response: outcome.cli_response,
                        });
                    }
                }
                Step::CodeChange { code_change, .. } => {
                    let written = write_file(
                        self.session.project_root,
                        &code_change.path,
                        &code_change.content,
                    )
                    .with_context(|| format!("apply code change to {}", code_change.path))?;
                    debug!(path = %written.display(), "code change applied");
                }
                Step::HumanIntervention {
                    human_intervention_description,
                } => {
                    let answer = self.session.human.ask(
                        &format!(
                            "I need your help with this step:\n{human_intervention_description}\nType \"continue\" when done, or describe what went wrong."
                        ),
                        None,
                    )?;
                    if !is_affirmative(&answer) {
                        let request = DebugRequest {
                            user_input: Some(answer),
                            issue_description: Some(human_intervention_description.clone()),
                            task_steps: steps.to_vec(),
                            step_index: Some(index),
                            context_files: touched_paths(steps),
                            ..DebugRequest::default()
                        };
                        if !self.debugger.debug(self, convo, &request)? {
                            return Ok(TaskResult::Finished {
                                success: false,
                                cli_response: None,
                            });
                        }
                    }
                }
            }

            if options.is_root_task {
                self.save_cursor(index)?;
            }

            if let Some(test_command) = options
                .test_command
                .as_ref()
                .filter(|_| options.test_after_code_changes && step.check_if_fixed())
            {
                let outcome = self.run_test(convo, test_command)?;
                if outcome.success {
                    info!(index, "test passed, task finished early");
                    return Ok(TaskResult::Finished {
                        success: true,
                        cli_response: outcome.cli_response,
                    });
                }
                debug!(index, "test still failing, continuing with the next step");
            }
        }

        match &options.test_command {
            Some(test_command) => {
                let outcome = self.run_test(convo, test_command)?;
                Ok(TaskResult::Finished {
                    success: outcome.success,
                    cli_response: outcome.cli_response,
                })
            }
            None => Ok(TaskResult::Finished {
                success: true,
                cli_response: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AgentRole;
    use crate::error::is_interrupted;
    use crate::io::store::{AppRecord, ProjectStore};
    use crate::test_support::TestHarness;

    /// Verifies steps before the cursor are not executed again.
    #[test]
    fn resumes_from_continue_step() {
        let harness = TestHarness::new();
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::FullStackDeveloper).expect("convo");
        let steps = vec![
            Step::code_change("a.txt", "a"),
            Step::code_change("b.txt", "b"),
        ];
        let options = TaskOptions {
            continue_from_step: 1,
            is_root_task: false,
            ..TaskOptions::root(1)
        };
        let result = Developer::new(session)
            .execute_task(&mut convo, &steps, &options)
            .expect("task");
        assert_eq!(
            result,
            TaskResult::Finished {
                success: true,
                cli_response: None
            }
        );
        assert!(!harness.project_root().join("a.txt").exists());
        assert!(harness.project_root().join("b.txt").exists());
        let records = harness.store.steps_of(RecordKind::TaskStep);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["index"], 1);
    }

    #[test]
    fn interrupt_stops_before_next_step() {
        let harness = TestHarness::new();
        harness.interrupt.set();
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::FullStackDeveloper).expect("convo");
        let err = Developer::new(session)
            .execute_task(
                &mut convo,
                &[Step::code_change("a.txt", "a")],
                &TaskOptions::root(0),
            )
            .unwrap_err();
        assert!(is_interrupted(&err));
        assert!(!harness.project_root().join("a.txt").exists());
    }

    #[test]
    fn root_task_persists_cursor() {
        let harness = TestHarness::new();
        let mut app = AppRecord::new("demo", "demo app", harness.project_root());
        app.id = harness.app_id.clone();
        harness.store.save_app(&app).expect("save");
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::FullStackDeveloper).expect("convo");
        let steps = vec![
            Step::code_change("a.txt", "a"),
            Step::code_change("b.txt", "b"),
        ];
        Developer::new(session)
            .execute_task(&mut convo, &steps, &TaskOptions::root(0))
            .expect("task");
        let saved = harness.store.get_app(&harness.app_id).expect("get").expect("app");
        assert_eq!(saved.completed_through, Some(1));
        assert_eq!(saved.resume_index(), 2);
    }

    /// Verifies a reported problem on a manual step is handed to the debugger.
    #[test]
    fn human_bug_report_is_debugged() {
        let harness = TestHarness::new();
        harness.human.push_answer("the page is blank");
        harness.llm.push_json(&json!({
            "thoughts": "missing index",
            "reasoning": "create it",
            "steps": [{"type": "code_change", "code_change": {"path": "index.html", "content": "<h1>hi</h1>"}}]
        }));
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::FullStackDeveloper).expect("convo");
        let steps = vec![Step::HumanIntervention {
            human_intervention_description: "open the page".into(),
        }];
        let developer = Developer::new(session);
        let result = developer
            .execute_task(&mut convo, &steps, &TaskOptions::root(0))
            .expect("task");
        assert!(matches!(result, TaskResult::Finished { success: true, .. }));
        assert!(harness.project_root().join("index.html").exists());
        let debugging = harness.store.steps_of(RecordKind::Debugging);
        assert_eq!(debugging.len(), 1);
        assert_eq!(debugging[0]["user_input"], "the page is blank");
        assert_eq!(developer.debugger().recursion_layer(), 0);
    }

    #[test]
    fn describe_steps_numbers_from_one() {
        let steps = vec![
            Step::command(CommandSpec::new("npm i")),
            Step::code_change("src/app.js", ""),
        ];
        assert_eq!(describe_steps(&steps), "1. run `npm i`\n2. write src/app.js");
    }

    #[cfg(unix)]
    #[test]
    fn need_to_see_output_stops_with_index() {
        let harness = TestHarness::new();
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::FullStackDeveloper).expect("convo");
        let steps = vec![
            Step::code_change("a.txt", "a"),
            Step::Command {
                command: CommandSpec::new("cat a.txt"),
                need_to_see_output: true,
                check_if_fixed: false,
            },
            Step::code_change("c.txt", "c"),
        ];
        let options = TaskOptions {
            is_root_task: false,
            ..TaskOptions::root(0)
        };
        let result = Developer::new(session)
            .execute_task(&mut convo, &steps, &options)
            .expect("task");
        match result {
            TaskResult::NeedsReplan {
                step_index,
                cli_response,
            } => {
                assert_eq!(step_index, 1);
                assert!(cli_response.expect("output").contains("stdout:\n```\na"));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(!harness.project_root().join("c.txt").exists());
        assert_eq!(harness.llm.call_count(), 0);
    }

    /// Verifies files that cannot be shown as context do not stop debugging.
    #[cfg(unix)]
    #[test]
    fn unreadable_context_file_does_not_abort_debugging() {
        let harness = TestHarness::new();
        std::fs::write(harness.project_root().join("logo.bin"), [0xff, 0xfe, 0x00]).expect("write");
        harness.llm.push_text("BUG");
        harness.llm.push_json(&json!({
            "thoughts": "marker file missing",
            "reasoning": "create it",
            "steps": [{"type": "code_change", "code_change": {"path": "ready.txt", "content": "ok"}}]
        }));
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::FullStackDeveloper).expect("convo");
        let steps = vec![
            Step::command(CommandSpec::new("test -f ready.txt")),
            Step::code_change("logo.bin", "svg"),
        ];
        let options = TaskOptions {
            is_root_task: false,
            ..TaskOptions::root(0)
        };
        let result = Developer::new(session)
            .execute_task(&mut convo, &steps, &options)
            .expect("task");
        assert!(matches!(result, TaskResult::Finished { success: true, .. }));
        assert_eq!(harness.llm.call_count(), 2);
        let debug_prompt = &harness.llm.requests()[1].messages;
        assert!(!debug_prompt.iter().any(|m| m.content.contains("logo.bin\" lines=")));
        assert_eq!(
            std::fs::read_to_string(harness.project_root().join("logo.bin")).expect("read"),
            "svg"
        );
    }

    /// Verifies a failing command is repaired and re-tested through the debugger.
    #[cfg(unix)]
    #[test]
    fn failing_command_is_repaired_by_debugger() {
        let harness = TestHarness::new();
        harness.llm.push_text("BUG");
        harness.llm.push_json(&json!({
            "thoughts": "marker file missing",
            "reasoning": "create it",
            "steps": [{"type": "code_change", "code_change": {"path": "ready.txt", "content": "ok"}}]
        }));
        let session = harness.session();
        let mut convo = Conversation::new(session, AgentRole::FullStackDeveloper).expect("convo");
        let steps = vec![Step::command(CommandSpec::new("test -f ready.txt"))];
        let options = TaskOptions {
            is_root_task: false,
            ..TaskOptions::root(0)
        };
        let developer = Developer::new(session);
        let result = developer
            .execute_task(&mut convo, &steps, &options)
            .expect("task");
        assert!(matches!(result, TaskResult::Finished { success: true, .. }));
        assert_eq!(harness.llm.call_count(), 2);
        assert_eq!(harness.store.command_runs().len(), 2);
        assert_eq!(developer.debugger().recursion_layer(), 0);
    }
}
