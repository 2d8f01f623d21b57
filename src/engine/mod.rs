//! Step engine: runs a task execution to completion.
//!
//! An execution is one run of a step template against an entity. The
//! engine interpolates each step instruction from prior output, calls
//! the bridge through the validator (which retries and falls back
//! transparently), drives the tool sub-loop when the model asks for
//! tools, enforces template length thresholds, persists every step,
//! and merges the final artifact.

pub mod interpolate;
pub mod react;
pub mod template;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};

use crate::bridge::messages::ChatMessage;
use crate::bridge::{ChatProvider, ProviderFactory, SamplingParams};
use crate::context::ScopeContext;
use crate::error::{OrchestratorError, Result};
use crate::registry::Registry;
use crate::store::{
    Agent, ExecutionStatus, MergeStrategy, StepTemplate, Store, TaskExecutionStep,
};
use crate::tools::ToolRegistry;
use crate::validation::Validator;

use interpolate::{Interpolator, RoleSummarizer};
use react::MAX_TOOL_ITERATIONS;

/// Side-effect hook fired by evaluation steps.
#[async_trait]
pub trait EvaluationHook: Send + Sync {
    /// Evaluate the story row produced by the current execution.
    async fn evaluate(&self, story_row_id: i64, ctx: &ScopeContext) -> Result<()>;
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Per-step tool-loop iteration cap.
    pub max_tool_iterations: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_tool_iterations: MAX_TOOL_ITERATIONS,
        }
    }
}

/// Request to start a new execution.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub task_type: String,
    /// Story row the execution produces, if any.
    pub entity_id: Option<i64>,
    pub template: String,
    pub initial_context: Option<String>,
    /// Registered tool names offered to the model during steps.
    pub tool_names: Vec<String>,
}

impl StartRequest {
    /// Request for a template and task type, nothing else set.
    pub fn new(task_type: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            entity_id: None,
            template: template.into(),
            initial_context: None,
            tool_names: Vec::new(),
        }
    }

    /// Bind the execution to a story row.
    pub fn entity(mut self, entity_id: i64) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Provide the initial context paragraph.
    pub fn initial_context(mut self, context: impl Into<String>) -> Self {
        self.initial_context = Some(context.into());
        self
    }

    /// Offer these registered tools during steps.
    pub fn tools(mut self, names: Vec<String>) -> Self {
        self.tool_names = names;
        self
    }
}

/// Final state of a driven execution.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub execution_id: i64,
    pub status: ExecutionStatus,
    /// Merged artifact, present on completion.
    pub artifact: Option<String>,
}

/// The step engine.
pub struct StepEngine {
    store: Arc<Store>,
    registry: Arc<Registry>,
    validator: Arc<Validator>,
    factory: Arc<dyn ProviderFactory>,
    tools: Arc<ToolRegistry>,
    evaluation_hook: Option<Arc<dyn EvaluationHook>>,
    options: EngineOptions,
}

impl std::fmt::Debug for StepEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepEngine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl StepEngine {
    /// Engine over the shared store, registry, validator, and tools.
    pub fn new(
        store: Arc<Store>,
        registry: Arc<Registry>,
        validator: Arc<Validator>,
        factory: Arc<dyn ProviderFactory>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            store,
            registry,
            validator,
            factory,
            tools,
            evaluation_hook: None,
            options: EngineOptions::default(),
        }
    }

    /// Attach the evaluation side-effect hook.
    pub fn with_evaluation_hook(mut self, hook: Arc<dyn EvaluationHook>) -> Self {
        self.evaluation_hook = Some(hook);
        self
    }

    /// Override the engine options.
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Create a pending execution for a template.
    ///
    /// Rejects when another active execution exists for the same
    /// `(entity_id, task_type)`.
    pub fn start(&self, request: &StartRequest) -> Result<i64> {
        let task_type = self.store.task_type_by_code(&request.task_type)?;
        let step_template = self.store.step_template_by_name(&request.template)?;
        let steps = template::parse_step_prompt(&step_template.step_prompt)?;

        let executor = self
            .registry
            .active_agent_for_role(&task_type.default_executor_role)?;
        let checker = self
            .registry
            .active_agent_for_role(&task_type.default_checker_role)
            .ok();

        let config = json!({
            "template": step_template.name,
            "tools": request.tool_names,
        });

        self.store.create_execution(&crate::store::execution::NewExecution {
            task_type: task_type.code.clone(),
            entity_id: request.entity_id,
            step_prompt: step_template.step_prompt.clone(),
            initial_context: request.initial_context.clone(),
            max_step: steps.len() as i64,
            executor_agent_id: Some(executor.id),
            checker_agent_id: checker.map(|c| c.id),
            config: Some(config),
        })
    }

    /// Pause an active execution; `run` resumes from `current_step`.
    pub fn pause(&self, execution_id: i64) -> Result<()> {
        let execution = self.store.execution_by_id(execution_id)?;
        if execution.status.is_active() {
            self.store
                .set_execution_status(execution_id, ExecutionStatus::Paused)?;
        }
        Ok(())
    }

    /// Drive an execution to completion (or failure/pause).
    pub async fn run(&self, execution_id: i64, ctx: &ScopeContext) -> Result<TaskOutcome> {
        let execution = self.store.execution_by_id(execution_id)?;
        let task_type = self.store.task_type_by_code(&execution.task_type)?;
        let strategy = task_type.output_merge_strategy;

        match execution.status {
            ExecutionStatus::Completed => {
                let steps = self.store.execution_steps(execution_id)?;
                return Ok(TaskOutcome {
                    execution_id,
                    status: ExecutionStatus::Completed,
                    artifact: merge_outputs(strategy, &steps),
                });
            }
            ExecutionStatus::Failed => {
                return Ok(TaskOutcome {
                    execution_id,
                    status: ExecutionStatus::Failed,
                    artifact: None,
                });
            }
            _ => {}
        }

        let executor = match execution.executor_agent_id {
            Some(id) => self.store.agent_by_id(id)?,
            None => self
                .registry
                .active_agent_for_role(&task_type.default_executor_role)?,
        };
        let model_id = executor.model_id.ok_or(OrchestratorError::NotFound {
            kind: "executor model",
            name: executor.name.clone(),
        })?;
        let model = self.registry.model_by_id(model_id)?;
        let params = sampling_from_agent(&executor);
        // One provider for the whole run: a fallback adopted on step n
        // stays adopted for steps n+1..N.
        let provider = self.factory.make(&model, &params);

        let step_template = execution
            .config
            .as_ref()
            .and_then(|c| c.get("template"))
            .and_then(Value::as_str)
            .and_then(|name| self.store.step_template_by_name(name).ok());
        let tool_names: Vec<String> = execution
            .config
            .as_ref()
            .and_then(|c| c.get("tools"))
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let tool_schemas = self.tools.schemas_for(&tool_names);

        let instructions = template::parse_step_prompt(&execution.step_prompt)?;
        let summaries = DashMap::new();
        let summarizer = RoleSummarizer::new(
            self.registry.clone(),
            self.validator.clone(),
            self.factory.clone(),
        );

        self.store
            .set_execution_status(execution_id, ExecutionStatus::InProgress)?;

        for step_number in (execution.current_step + 1)..=execution.max_step {
            if ctx.cancel.is_cancelled() {
                self.store
                    .set_execution_status(execution_id, ExecutionStatus::Paused)?;
                log::info!("execution {execution_id} paused at step {step_number}");
                return Ok(TaskOutcome {
                    execution_id,
                    status: ExecutionStatus::Paused,
                    artifact: None,
                });
            }

            let result = self
                .run_step(
                    execution_id,
                    &execution,
                    &executor,
                    provider.as_ref(),
                    step_template.as_ref(),
                    &instructions,
                    step_number,
                    &tool_schemas,
                    &summaries,
                    &summarizer,
                    strategy,
                    ctx,
                )
                .await;

            match result {
                Ok(true) => {}
                Ok(false) => {
                    self.store
                        .set_execution_status(execution_id, ExecutionStatus::Failed)?;
                    return Ok(TaskOutcome {
                        execution_id,
                        status: ExecutionStatus::Failed,
                        artifact: None,
                    });
                }
                Err(OrchestratorError::Cancelled) => {
                    self.store
                        .set_execution_status(execution_id, ExecutionStatus::Paused)?;
                    return Ok(TaskOutcome {
                        execution_id,
                        status: ExecutionStatus::Paused,
                        artifact: None,
                    });
                }
                Err(e) => {
                    // Hard error: record it on the step and surface it.
                    let _ = self.store.record_execution_step(&TaskExecutionStep {
                        id: 0,
                        execution_id,
                        step_number,
                        step_instruction: instructions
                            .get(step_number as usize - 1)
                            .cloned()
                            .unwrap_or_default(),
                        step_output: String::new(),
                        validation_result: Some(json!({"error": e.to_string()})),
                        attempt_count: 0,
                        started_at: Some(Store::now()),
                        completed_at: None,
                    });
                    self.store
                        .set_execution_status(execution_id, ExecutionStatus::Failed)?;
                    return Err(e);
                }
            }
        }

        self.store
            .set_execution_status(execution_id, ExecutionStatus::Completed)?;
        let steps = self.store.execution_steps(execution_id)?;
        log::info!(
            "execution {execution_id} completed with {} step(s)",
            steps.len()
        );
        Ok(TaskOutcome {
            execution_id,
            status: ExecutionStatus::Completed,
            artifact: merge_outputs(strategy, &steps),
        })
    }

    /// Run one step. `Ok(true)` on success, `Ok(false)` when the step
    /// terminally failed validation.
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        execution_id: i64,
        execution: &crate::store::TaskExecution,
        executor: &Agent,
        provider: &dyn ChatProvider,
        step_template: Option<&StepTemplate>,
        instructions: &[String],
        step_number: i64,
        tool_schemas: &[Value],
        summaries: &DashMap<String, String>,
        summarizer: &RoleSummarizer,
        strategy: MergeStrategy,
        ctx: &ScopeContext,
    ) -> Result<bool> {
        let started_at = Store::now();

        let outputs: HashMap<i64, String> = self
            .store
            .execution_steps(execution_id)?
            .into_iter()
            .map(|step| (step.step_number, step.step_output))
            .collect();

        let interpolator = Interpolator::new(&outputs, summaries, summarizer);
        let raw_instruction = instructions
            .get(step_number as usize - 1)
            .ok_or_else(|| {
                OrchestratorError::Template(format!("no instruction for step {step_number}"))
            })?;
        let instruction = interpolator
            .interpolate(raw_instruction, step_number, ctx)
            .await?;

        let mut system = executor.system_text();
        if let Some(context) = &execution.initial_context {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str("Context:\n");
            system.push_str(context);
        }

        let mut step_ctx = ctx.clone().with_agent(executor.name.clone(), executor.role.clone());
        step_ctx.operation_id = Some(format!("step_{step_number}"));

        let min_chars = step_min_chars(step_template, step_number);
        let max_length_retries = self
            .validator
            .options()
            .policy_for_scope(&step_ctx.scope)
            .max_retries;

        let mut conversation = vec![
            ChatMessage::system(system),
            ChatMessage::user(instruction.clone()),
        ];
        let mut offer_tools = !tool_schemas.is_empty();
        let mut attempts_total: i64 = 0;
        let mut length_retries: u32 = 0;

        let (final_call, output) = loop {
            let schemas: &[Value] = if offer_tools { tool_schemas } else { &[] };
            let call = match self
                .validator
                .call_with_validation(provider, &conversation, schemas, &step_ctx)
                .await
            {
                Ok(call) => call,
                Err(OrchestratorError::ModelRejectsTools { model }) if offer_tools => {
                    // Re-run the step without tools.
                    log::warn!("model '{model}' rejects tools, re-running step without them");
                    offer_tools = false;
                    continue;
                }
                Err(e) => return Err(e),
            };
            attempts_total += call.attempts as i64;

            let call = if call.envelope.has_tool_calls() && offer_tools {
                let loop_result = react::run_tool_loop(
                    &self.validator,
                    provider,
                    &self.tools,
                    &mut conversation,
                    call,
                    tool_schemas,
                    self.options.max_tool_iterations,
                    &step_ctx,
                )
                .await?;
                attempts_total += loop_result.iterations as i64;
                loop_result.final_call
            } else {
                call
            };

            if !call.valid {
                let step = TaskExecutionStep {
                    id: 0,
                    execution_id,
                    step_number,
                    step_instruction: instruction.clone(),
                    step_output: call.envelope.text().to_string(),
                    validation_result: Some(call.to_validation_json()),
                    attempt_count: attempts_total,
                    started_at: Some(started_at.clone()),
                    completed_at: Some(Store::now()),
                };
                self.store.record_execution_step(&step)?;
                self.store
                    .advance_execution(execution_id, step_number - 1, attempts_total - 1)?;
                log::warn!(
                    "execution {execution_id} failed validation at step {step_number}"
                );
                return Ok(false);
            }

            let output = call.envelope.text().to_string();
            if (output.chars().count() as i64) < min_chars {
                if length_retries < max_length_retries {
                    length_retries += 1;
                    log::debug!(
                        "step {step_number} output below {min_chars} chars, re-running \
                         ({length_retries}/{max_length_retries})"
                    );
                    conversation.push(ChatMessage::system(format!(
                        "The previous answer was too short ({} characters; at least \
                         {min_chars} required). Rewrite it in full at the required length.",
                        output.chars().count()
                    )));
                    continue;
                }
                // Budget exhausted on length: the step fails like any
                // validator rejection.
                let step = TaskExecutionStep {
                    id: 0,
                    execution_id,
                    step_number,
                    step_instruction: instruction.clone(),
                    step_output: output,
                    validation_result: Some(json!({
                        "valid": false,
                        "attempts": attempts_total,
                        "verdict": {"reason": format!("below_min_chars_{min_chars}")},
                    })),
                    attempt_count: attempts_total,
                    started_at: Some(started_at.clone()),
                    completed_at: Some(Store::now()),
                };
                self.store.record_execution_step(&step)?;
                self.store
                    .advance_execution(execution_id, step_number - 1, attempts_total - 1)?;
                return Ok(false);
            }

            break (call, output);
        };

        let step = TaskExecutionStep {
            id: 0,
            execution_id,
            step_number,
            step_instruction: instruction,
            step_output: output.clone(),
            validation_result: Some(final_call.to_validation_json()),
            attempt_count: attempts_total,
            started_at: Some(started_at),
            completed_at: Some(Store::now()),
        };
        self.store.record_execution_step(&step)?;
        self.store
            .advance_execution(execution_id, step_number, attempts_total - 1 + length_retries as i64)?;

        if let Some(entity_id) = execution.entity_id {
            self.apply_side_effects(
                entity_id,
                executor,
                provider,
                step_template,
                step_number,
                &output,
                strategy,
                execution_id,
                ctx,
            )
            .await?;
        }

        Ok(true)
    }

    /// Step side effects: characters, full-story materialization,
    /// evaluation passes, and creator provenance.
    #[allow(clippy::too_many_arguments)]
    async fn apply_side_effects(
        &self,
        entity_id: i64,
        executor: &Agent,
        provider: &dyn ChatProvider,
        step_template: Option<&StepTemplate>,
        step_number: i64,
        output: &str,
        strategy: MergeStrategy,
        execution_id: i64,
        ctx: &ScopeContext,
    ) -> Result<()> {
        // Creator provenance is first-writer-wins; repeated calls are
        // no-ops without the admin override.
        let creator_model = provider
            .identity()
            .model_id
            .or(executor.model_id);
        self.store
            .set_story_creator(entity_id, creator_model, Some(executor.id), false)?;

        let Some(template) = step_template else {
            return Ok(());
        };

        if template.characters_step == Some(step_number) {
            let characters = crate::validation::checks::extract_json_object(output)
                .unwrap_or_else(|| Value::String(output.to_string()));
            self.store.set_story_characters(entity_id, &characters)?;
        }

        if template.full_story_step == Some(step_number) {
            let steps = self.store.execution_steps(execution_id)?;
            let assembled = merge_outputs(strategy, &steps)
                .unwrap_or_else(|| output.to_string());
            self.store.set_story_raw(entity_id, &assembled)?;
        }

        if template.evaluation_step_numbers().contains(&step_number) {
            if let Some(hook) = &self.evaluation_hook {
                if let Err(e) = hook.evaluate(entity_id, ctx).await {
                    log::warn!("evaluation pass failed for story {entity_id}: {e}");
                }
            }
        }

        Ok(())
    }
}

/// Build sampling parameters from an agent row.
pub fn sampling_from_agent(agent: &Agent) -> SamplingParams {
    let mut params = SamplingParams::default();
    if let Some(temperature) = agent.temperature {
        params.temperature = temperature;
    }
    if let Some(top_p) = agent.top_p {
        params.top_p = top_p;
    }
    params.ollama_knobs(
        agent.repeat_penalty,
        agent.top_k,
        agent.repeat_last_n,
        agent.num_predict,
    )
}

/// Which length threshold applies to a step, if any.
///
/// `min_chars_trama` binds the steps listed in `trama_steps`;
/// `min_chars_story` binds prose steps (everything that is not a
/// trama, characters, or evaluation step). Zero disables the check.
fn step_min_chars(template: Option<&StepTemplate>, step_number: i64) -> i64 {
    let Some(template) = template else { return 0 };
    if template.trama_step_numbers().contains(&step_number) {
        return template.min_chars_trama;
    }
    if template.characters_step == Some(step_number)
        || template.evaluation_step_numbers().contains(&step_number)
    {
        return 0;
    }
    template.min_chars_story
}

/// Merge step outputs into the final artifact.
pub fn merge_outputs(strategy: MergeStrategy, steps: &[TaskExecutionStep]) -> Option<String> {
    if steps.is_empty() {
        return None;
    }
    match strategy {
        MergeStrategy::AccumulateChapters => Some(
            steps
                .iter()
                .map(|step| step.step_output.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        ),
        MergeStrategy::LastOnly => steps.last().map(|step| step.step_output.clone()),
    }
}
