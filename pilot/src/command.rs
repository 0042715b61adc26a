//! Run a single command, collect its output and decide whether it worked.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::conversation::Conversation;
use crate::core::answers::is_affirmative;
use crate::core::steps::CommandSpec;
use crate::core::types::{ExecutionResult, PromptTemplate, Verdict};
use crate::core::verdict::{OutputClass, classify_output, format_cli_response, looks_destructive};
use crate::io::config::ConfirmPolicy;
use crate::io::process::Stream;
use crate::session::Session;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How a run ended, before any judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// The process exited on its own.
    Exited,
    /// The success marker appeared after the minimum run time.
    SuccessMarker,
    /// The maximum run time elapsed.
    TimedOut,
    /// The interrupt flag was raised while the command ran.
    Interrupted,
    /// The human declined to run the command.
    Skipped,
}

/// Captured output of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRun {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub end: RunEnd,
    /// Still running in the background (registered under its command id).
    pub detached: bool,
}

impl CommandRun {
    fn not_run(end: RunEnd) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            end,
            detached: false,
        }
    }
}

pub struct CommandExecutor<'a> {
    session: Session<'a>,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(session: Session<'a>) -> Self {
        Self { session }
    }

    /// Ask the human before running, per the configured policy.
    fn confirmed(&self, spec: &CommandSpec) -> Result<bool> {
        let ask = match self.session.config.confirm_commands {
            ConfirmPolicy::Always => true,
            ConfirmPolicy::Destructive => looks_destructive(&spec.command),
            ConfirmPolicy::Never => false,
        };
        if !ask {
            return Ok(true);
        }
        let answer = self.session.human.ask(
            &format!(
                "Can I run the command `{}`? (press ENTER to run, or type \"no\" to skip)",
                spec.command
            ),
            None,
        )?;
        Ok(is_affirmative(&answer))
    }

    /// Launch `spec` and collect output until it exits, finishes early, times out or is interrupted.
    ///
    /// Output is not considered finished before the minimum run time.
    /// Background commands (with a `command_id`) are left running when they
    /// hit their success marker or the timeout; others are terminated.
    #[instrument(skip_all, fields(command = %spec.command))]
    pub fn run(&self, spec: &CommandSpec) -> Result<CommandRun> {
        let limits = self.session.config.run_time_limits();
        let timeout = limits.normalize(spec.timeout);
        if !self.confirmed(spec)? {
            info!("command skipped by user");
            return Ok(CommandRun::not_run(RunEnd::Skipped));
        }

        println!(
            "\n--------- EXECUTE COMMAND ----------\nRunning `{}` (timeout {} ms)",
            spec.command,
            timeout.as_millis()
        );
        let mut handle = self.session.processes.run(
            &spec.command,
            self.session.project_root,
            spec.command_id.as_deref(),
        )?;
        let background = spec.command_id.is_some();
        let marker = spec.success_message.as_deref().filter(|m| !m.is_empty());

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut marker_seen = false;
        let mut exit_code = None;

        let end = loop {
            if self.session.interrupt.is_set() {
                warn!("interrupted, killing command");
                handle.kill();
                break RunEnd::Interrupted;
            }

            let mut progressed = false;
            for (stream, buf) in [(Stream::Stdout, &mut stdout), (Stream::Stderr, &mut stderr)] {
                while let Some(line) = handle.read_line(stream) {
                    println!("CLI OUTPUT: {line}");
                    marker_seen |= marker.is_some_and(|m| line.contains(m));
                    buf.push_str(&line);
                    buf.push('\n');
                    progressed = true;
                }
            }

            let elapsed = handle.elapsed();
            if marker_seen && elapsed >= limits.min {
                debug!(elapsed_ms = elapsed.as_millis() as u64, "success marker seen");
                break RunEnd::SuccessMarker;
            }

            match handle.try_wait() {
                Ok(Some(status)) => {
                    exit_code = status.code();
                    stdout.push_str(&handle.read_remaining(Stream::Stdout));
                    stderr.push_str(&handle.read_remaining(Stream::Stderr));
                    handle.unregister();
                    break RunEnd::Exited;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(err = %e, "lost track of child, treating as exited");
                    handle.unregister();
                    break RunEnd::Exited;
                }
            }

            if elapsed >= timeout {
                warn!(timeout_ms = timeout.as_millis() as u64, background, "command reached max run time");
                break RunEnd::TimedOut;
            }
            if !progressed {
                thread::sleep(POLL_INTERVAL);
            }
        };

        let still_running = matches!(end, RunEnd::SuccessMarker | RunEnd::TimedOut);
        let detached = background && still_running;
        if detached {
            info!(command_id = ?spec.command_id, pid = handle.pid(), "left running in background");
            handle.detach();
        } else if still_running {
            handle.terminate();
        }

        Ok(CommandRun {
            stdout,
            stderr,
            exit_code,
            end,
            detached,
        })
    }

    /// Run `spec`, then classify the outcome.
    ///
    /// A clean exit with no error text is accepted without the model.
    /// Anything else is judged by the model in `convo`; if the judgement is
    /// not a verdict token the human decides.
    #[instrument(skip_all, fields(command = %spec.command))]
    pub fn execute(
        &self,
        convo: &mut Conversation<'_>,
        spec: &CommandSpec,
        additional_message: Option<&str>,
    ) -> Result<ExecutionResult> {
        let run = self.run(spec)?;
        let max_len = self.session.config.max_command_output_length;

        let result = match run.end {
            RunEnd::Skipped => ExecutionResult {
                cli_response: None,
                verdict: Verdict::Skipped,
                exit_code: None,
            },
            RunEnd::Interrupted => ExecutionResult {
                cli_response: None,
                verdict: Verdict::Interrupted,
                exit_code: None,
            },
            RunEnd::SuccessMarker => ExecutionResult {
                cli_response: Some(format_cli_response(&run.stdout, &run.stderr, max_len)),
                verdict: Verdict::Done,
                exit_code: run.exit_code,
            },
            RunEnd::TimedOut if !run.detached => ExecutionResult {
                cli_response: Some(format_cli_response(&run.stdout, &run.stderr, max_len)),
                verdict: Verdict::Timeout,
                exit_code: None,
            },
            RunEnd::TimedOut | RunEnd::Exited => {
                let cli_response = format_cli_response(&run.stdout, &run.stderr, max_len);
                let verdict = match classify_output(run.exit_code, &run.stdout, &run.stderr) {
                    OutputClass::Success => Verdict::Done,
                    OutputClass::NeedsJudgment => self.judge(
                        convo,
                        spec,
                        &cli_response,
                        run.exit_code,
                        additional_message,
                    )?,
                };
                ExecutionResult {
                    cli_response: Some(cli_response),
                    verdict,
                    exit_code: run.exit_code,
                }
            }
        };

        if run.end != RunEnd::Skipped {
            self.session.store.record_command_run(
                self.session.app_id,
                &spec.command,
                result.cli_response.as_deref(),
                result.exit_code,
            )?;
        }
        info!(verdict = result.verdict.as_str(), exit_code = ?result.exit_code, "command classified");
        Ok(result)
    }

    fn judge(
        &self,
        convo: &mut Conversation<'_>,
        spec: &CommandSpec,
        cli_response: &str,
        exit_code: Option<i32>,
        additional_message: Option<&str>,
    ) -> Result<Verdict> {
        let reply = convo.send_text(
            PromptTemplate::RanCommand,
            &json!({
                "command": spec.command,
                "cli_response": cli_response,
                "exit_code": exit_code,
                "additional_message": additional_message,
            }),
        )?;
        if let Some(verdict) = Verdict::from_reply(&reply) {
            return Ok(verdict);
        }
        debug!(reply = %reply, "judgement was not a verdict token, asking human");
        let answer = self.session.human.ask(
            &format!(
                "I could not tell whether `{}` worked. Did it succeed?",
                spec.command
            ),
            Some(&["yes", "no"]),
        )?;
        Ok(if is_affirmative(&answer) {
            Verdict::Done
        } else {
            Verdict::NeedsDebugging
        })
    }
}
