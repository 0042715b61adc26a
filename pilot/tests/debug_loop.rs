//! Debug loop scenarios driven by a scripted LLM.
//!
//! Checks that the recursion layer always returns to its entry value, that
//! failures reach the debugger with a saved branch, and that nested token
//! limits and too-deep recursion unwind instead of retrying.

use anyhow::Result;
use serde_json::{Value, json};

use pilot::conversation::Conversation;
use pilot::core::steps::{CommandSpec, Step};
use pilot::core::types::AgentRole;
use pilot::debugger::{DebugRequest, Debugger};
use pilot::developer::{Developer, TaskOptions, TaskResult, TaskRunner};
use pilot::error::{TooDeepRecursionError, is_token_limit};
use pilot::io::store::RecordKind;
use pilot::test_support::TestHarness;

fn code_change_plan(path: &str) -> Value {
    json!({
        "thoughts": "try a change",
        "reasoning": "it may help",
        "steps": [{"type": "code_change", "code_change": {"path": path, "content": "x"}}]
    })
}

/// Runs every repair task by debugging again, one layer deeper.
struct Recursing<'d, 'a> {
    debugger: &'d Debugger<'a>,
}

impl TaskRunner for Recursing<'_, '_> {
    fn execute_task(
        &self,
        convo: &mut Conversation<'_>,
        _steps: &[Step],
        _options: &TaskOptions,
    ) -> Result<TaskResult> {
        let success = self.debugger.debug(self, convo, &DebugRequest::default())?;
        Ok(TaskResult::Finished {
            success,
            cli_response: None,
        })
    }
}

/// Always stops after the first step so the plan has to be revised.
struct AlwaysReplan;

impl TaskRunner for AlwaysReplan {
    fn execute_task(
        &self,
        _convo: &mut Conversation<'_>,
        _steps: &[Step],
        _options: &TaskOptions,
    ) -> Result<TaskResult> {
        Ok(TaskResult::NeedsReplan {
            step_index: 0,
            cli_response: Some("still failing".into()),
        })
    }
}

/// Verifies a judged failure enters the debugger at layer 1 with a saved branch.
#[cfg(unix)]
#[test]
fn failing_command_enters_debugger_at_layer_one() {
    let harness = TestHarness::with_config(|cfg| cfg.max_command_debug_tries = 1);
    harness.llm.push_text("BUG");
    harness.llm.push_json(&code_change_plan("fix.txt"));
    harness.llm.push_text("BUG");
    harness.llm.push_text("BUG");
    let session = harness.session();
    let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
    let developer = Developer::new(session);

    let outcome = developer
        .run_command_until_success(&mut convo, &CommandSpec::new("exit 1"), &[], None)
        .expect("run");

    assert!(!outcome.success);
    let debugging = harness.store.steps_of(RecordKind::Debugging);
    assert_eq!(debugging.len(), 1);
    assert_eq!(debugging[0]["recursion_layer"], 1);
    assert_eq!(debugging[0]["command"], "exit 1");
    assert_eq!(convo.branch_names().len(), 1);
    assert_eq!(developer.debugger().recursion_layer(), 0);
    assert!(harness.project_root().join("fix.txt").exists());
    assert_eq!(harness.llm.remaining(), 0);
}

/// Verifies a token limit inside nested debugging unwinds every layer.
#[test]
fn nested_token_limit_propagates_and_restores_layer() {
    let harness = TestHarness::new();
    harness.llm.push_json(&code_change_plan("a.txt"));
    harness.llm.push_token_limit();
    let session = harness.session();
    let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
    let before = convo.messages().to_vec();
    let debugger = Debugger::new(session);
    let tasks = Recursing {
        debugger: &debugger,
    };

    let err = debugger
        .debug(&tasks, &mut convo, &DebugRequest::default())
        .unwrap_err();

    assert!(is_token_limit(&err));
    assert_eq!(debugger.recursion_layer(), 0);
    assert_eq!(convo.messages(), before.as_slice());
    let layers: Vec<Value> = harness
        .store
        .steps_of(RecordKind::Debugging)
        .into_iter()
        .map(|record| record["recursion_layer"].clone())
        .collect();
    assert_eq!(layers, vec![json!(1), json!(2)]);
}

/// Verifies a token limit in a single debug call rewinds and surfaces to the caller.
#[test]
fn token_limit_rewinds_branch() {
    let harness = TestHarness::new();
    harness.llm.push_token_limit();
    let session = harness.session();
    let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
    let debugger = Debugger::new(session);

    let err = debugger
        .debug(&AlwaysReplan, &mut convo, &DebugRequest::default())
        .unwrap_err();
    assert!(is_token_limit(&err));
    assert_eq!(convo.messages().len(), 1);
    assert_eq!(debugger.recursion_layer(), 0);
    assert_eq!(harness.llm.call_count(), 1);
}

/// Verifies nesting past the maximum fails with the recursion error, unretried.
#[test]
fn too_deep_recursion_is_fatal() {
    let harness = TestHarness::with_config(|cfg| cfg.max_recursion_layer = 2);
    harness.llm.push_json(&code_change_plan("a.txt"));
    harness.llm.push_json(&code_change_plan("b.txt"));
    let session = harness.session();
    let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
    let debugger = Debugger::new(session);
    let tasks = Recursing {
        debugger: &debugger,
    };

    let err = debugger
        .debug(&tasks, &mut convo, &DebugRequest::default())
        .unwrap_err();

    let too_deep = err
        .downcast_ref::<TooDeepRecursionError>()
        .expect("too deep error");
    assert_eq!(too_deep.max, 2);
    assert_eq!(debugger.recursion_layer(), 0);
    assert_eq!(harness.llm.call_count(), 2);
    assert_eq!(harness.store.steps_of(RecordKind::Debugging).len(), 3);
}

/// Verifies running out of attempts returns false and restores the layer.
#[test]
fn exhausted_attempts_return_false() {
    let harness = TestHarness::with_config(|cfg| cfg.max_command_debug_tries = 2);
    for _ in 0..2 {
        harness.llm.push_json(&code_change_plan("a.txt"));
        harness
            .llm
            .push_json(&json!({"steps": [{"type": "code_change", "code_change": {"path": "b.txt", "content": "y"}}]}));
        harness
            .llm
            .push_json(&json!({"steps": [{"type": "code_change", "code_change": {"path": "c.txt", "content": "z"}}]}));
    }
    let session = harness.session();
    let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
    let debugger = Debugger::new(session);

    let fixed = debugger
        .debug(&AlwaysReplan, &mut convo, &DebugRequest::default())
        .expect("debug");

    assert!(!fixed);
    assert_eq!(debugger.recursion_layer(), 0);
    assert_eq!(harness.llm.call_count(), 6);
    assert_eq!(harness.llm.remaining(), 0);
}

/// Verifies the layer is restored across repeated calls on one debugger.
#[test]
fn layer_is_stable_across_calls() {
    let harness = TestHarness::with_config(|cfg| cfg.max_command_debug_tries = 1);
    harness.llm.push_text("garbage");
    harness.llm.push_text("garbage");
    harness.llm.push_api_error("500");
    let session = harness.session();
    let mut convo = Conversation::new(session, AgentRole::DevOps).expect("convo");
    let debugger = Debugger::new(session);

    assert!(
        !debugger
            .debug(&AlwaysReplan, &mut convo, &DebugRequest::default())
            .expect("malformed then exhausted")
    );
    assert_eq!(debugger.recursion_layer(), 0);
    assert!(
        debugger
            .debug(&AlwaysReplan, &mut convo, &DebugRequest::default())
            .is_err()
    );
    assert_eq!(debugger.recursion_layer(), 0);
}
