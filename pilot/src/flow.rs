//! Top-level flows behind the CLI: develop an app, UX tests, app listing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::ValueEnum;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::conversation::Conversation;
use crate::core::functions::development_task;
use crate::core::steps::{CommandSpec, Step, TaskPlan};
use crate::core::types::{AgentRole, PromptTemplate};
use crate::developer::{Developer, TaskOptions, TaskResult, TaskRunner, TaskSource, describe_steps};
use crate::error::{LlmError, is_interrupted};
use crate::io::config::PilotConfig;
use crate::io::human::HumanInput;
use crate::io::interrupt::Interrupt;
use crate::io::llm::LlmClient;
use crate::io::process::ProcessRunner;
use crate::io::prompt::PromptEngine;
use crate::io::store::{AppRecord, AppStatus, ProjectStore};
use crate::session::Session;

/// Scripted scenarios for trying the interactive experience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UxTest {
    /// A one-step plan whose command fails, driven through the debugger.
    FailingCommand,
    /// Resume the most recently created app.
    ContinueDevelopment,
}

/// Everything a flow needs before an app (and so a [`Session`]) exists.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub config: &'a PilotConfig,
    pub llm: &'a dyn LlmClient,
    pub prompts: &'a PromptEngine,
    pub human: &'a dyn HumanInput,
    pub store: &'a dyn ProjectStore,
    pub processes: &'a ProcessRunner,
    pub interrupt: &'a Interrupt,
    /// Parent directory of generated app projects.
    pub workspace: &'a Path,
}

impl<'a> Services<'a> {
    pub fn session<'s>(&self, project_root: &'s Path, app_id: &'s str) -> Session<'s>
    where
        'a: 's,
    {
        Session {
            config: self.config,
            llm: self.llm,
            prompts: self.prompts,
            human: self.human,
            store: self.store,
            processes: self.processes,
            interrupt: self.interrupt,
            project_root,
            app_id,
        }
    }
}

/// Directory-safe form of an app name.
fn slug(name: &str) -> String {
    let mut out = String::new();
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "app".to_string()
    } else {
        trimmed.to_string()
    }
}

fn create_app(services: &Services<'_>, name: &str, description: &str) -> Result<AppRecord> {
    let root = services.workspace.join(slug(name));
    fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
    let app = AppRecord::new(name, description, &root);
    services.store.save_app(&app)?;
    info!(app_id = %app.id, root = %root.display(), "created app");
    Ok(app)
}

fn ask_for_app(services: &Services<'_>) -> Result<AppRecord> {
    let name = services.human.ask("What is the project name?", None)?;
    if name.trim().is_empty() {
        bail!("project name must not be empty");
    }
    let description = services
        .human
        .ask("Describe the app you want to build.", None)?;
    if description.trim().is_empty() {
        bail!("app description must not be empty");
    }
    create_app(services, name.trim(), description.trim())
}

/// Load, change and save the app record.
fn update_app(
    store: &dyn ProjectStore,
    app_id: &str,
    change: impl FnOnce(&mut AppRecord),
) -> Result<AppRecord> {
    let mut app = store
        .get_app(app_id)?
        .ok_or_else(|| anyhow!("no app with id {app_id}"))?;
    change(&mut app);
    store.save_app(&app)?;
    Ok(app)
}

/// Create or resume an app, plan it if needed and execute the plan.
///
/// Returns whether the plan finished successfully. Execution starts at the
/// persisted cursor, so a resumed app does not repeat completed steps.
#[instrument(skip_all, fields(app_id = ?app_id))]
pub fn run_development(services: &Services<'_>, app_id: Option<&str>) -> Result<bool> {
    let app = match app_id {
        Some(id) => services
            .store
            .get_app(id)?
            .ok_or_else(|| anyhow!("no app with id {id}"))?,
        None => ask_for_app(services)?,
    };
    let root: PathBuf = app.workspace.clone();
    fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
    let id = app.id.clone();
    let session = services.session(&root, &id);

    let result = develop(session, app);
    match &result {
        Ok(success) => {
            let status = if *success {
                AppStatus::Finished
            } else {
                AppStatus::Failed
            };
            update_app(services.store, &id, |app| app.status = status)?;
        }
        Err(err) if is_interrupted(err) => {
            info!("interrupted, app stays resumable");
        }
        Err(err) => {
            if let Err(save_err) = update_app(services.store, &id, |app| app.status = AppStatus::Failed) {
                warn!(err = %save_err, "could not mark app as failed");
            }
            warn!(err = %err, "development stopped");
        }
    }
    result
}

fn develop(session: Session<'_>, app: AppRecord) -> Result<bool> {
    let store = session.store;
    let mut convo = Conversation::new(session, AgentRole::FullStackDeveloper)?;

    let plan = match app.plan.clone() {
        Some(plan) => {
            info!(steps = plan.steps.len(), resume = app.resume_index(), "resuming plan");
            plan
        }
        None => {
            let plan: TaskPlan = convo.send_as(
                PromptTemplate::TaskBreakdown,
                &json!({
                    "app_name": app.name,
                    "description": app.description,
                    "file_blocks": null,
                }),
                &development_task(),
            )?;
            if plan.steps.is_empty() {
                return Err(LlmError::MalformedResponse("development plan has no steps".into()).into());
            }
            update_app(store, &app.id, |record| {
                record.plan = Some(plan.clone());
                record.status = AppStatus::Planned;
            })?;
            plan
        }
    };
    println!("\nPlan:\n{}", describe_steps(&plan.steps));
    update_app(store, &app.id, |record| record.status = AppStatus::InProgress)?;

    let developer = Developer::new(session);
    let mut steps = plan.steps;
    let mut from = app.resume_index();
    let mut revisions = 0;
    loop {
        let options = TaskOptions {
            test_command: plan.test_command.clone(),
            ..TaskOptions::root(from)
        };
        match developer.execute_task(&mut convo, &steps, &options)? {
            TaskResult::Finished { success, .. } => return Ok(success),
            TaskResult::NeedsReplan {
                step_index,
                cli_response,
            } => {
                revisions += 1;
                if revisions > session.config.max_command_debug_tries {
                    warn!(revisions, "plan revision limit reached");
                    return Ok(false);
                }
                let completed: Vec<Step> = steps[..=step_index.min(steps.len() - 1)].to_vec();
                let update: TaskPlan = convo.send_as(
                    PromptTemplate::UpdateTask,
                    &json!({
                        "completed_steps": describe_steps(&completed),
                        "last_step": completed.last().map(Step::describe),
                        "cli_response": cli_response,
                    }),
                    &development_task(),
                )?;
                from = completed.len();
                steps = completed.into_iter().chain(update.steps).collect();
                let saved_steps = steps.clone();
                update_app(store, &app.id, |record| {
                    if let Some(plan) = record.plan.as_mut() {
                        plan.steps = saved_steps;
                    }
                })?;
            }
        }
    }
}

/// Run a scripted UX scenario.
#[instrument(skip_all, fields(test = ?test))]
pub fn run_ux_test(services: &Services<'_>, test: UxTest) -> Result<bool> {
    match test {
        UxTest::FailingCommand => {
            let app = create_app(
                services,
                "ux-test-failing-command",
                "A single command that fails and has to be debugged.",
            )?;
            let session = services.session(&app.workspace, &app.id);
            let mut convo = Conversation::new(session, AgentRole::FullStackDeveloper)?;
            let steps = vec![Step::command(CommandSpec::new("exit 1"))];
            let options = TaskOptions {
                is_root_task: false,
                source: TaskSource::UxTest,
                ..TaskOptions::root(0)
            };
            match Developer::new(session).execute_task(&mut convo, &steps, &options)? {
                TaskResult::Finished { success, .. } => Ok(success),
                TaskResult::NeedsReplan { .. } => Ok(false),
            }
        }
        UxTest::ContinueDevelopment => {
            let latest = services
                .store
                .list_apps()?
                .pop()
                .ok_or_else(|| anyhow!("no apps to continue"))?;
            println!("Continuing app {} ({})", latest.name, latest.id);
            run_development(services, Some(&latest.id))
        }
    }
}

/// Apps with their status and number of recorded steps, as a text table.
pub fn list_apps_table(store: &dyn ProjectStore) -> Result<String> {
    let apps = store.list_apps()?;
    if apps.is_empty() {
        return Ok("No apps created yet.".to_string());
    }
    let id_width = apps.iter().map(|a| a.id.len()).max().unwrap_or(2).max(2);
    let mut out = format!("{:<id_width$}  {:<11}  {:>5}  NAME\n", "ID", "STATUS", "STEPS");
    for app in &apps {
        out.push_str(&format!(
            "{:<id_width$}  {:<11}  {:>5}  {}\n",
            app.id,
            app.status.as_str(),
            app.step_count,
            app.name
        ));
    }
    Ok(out.trim_end().to_string())
}
