//! The bounded tool-use turn loop.
//!
//! One turn runs up to `max_iterations` model calls. Each iteration streams a
//! model response, appends the assistant message, then executes the returned
//! tool calls in order, feeding each result back as a tool message. The turn
//! ends on a plain text answer, a detected plan-file write, cancellation, or
//! iteration exhaustion.
//!
//! Everything is cooperative and single-threaded: the elapsed-time label on
//! the thinking step is refreshed from inside stream-event delivery, so no
//! second thread ever touches the progress log. Cancellation is polled at two
//! points per iteration (top of iteration, before each tool dispatch) and
//! never interrupts a tool already running.

use anyhow::Result;
use cohere_core::{
    CancelFlag, ChatMessage, ChatRequest, LlmResponse, LlmToolCall, ProgressLog, ProgressStep,
    StreamEvent, ThinkingConfig, ToolHost, ToolName, ToolResult, TurnMode, TurnOutcome, TurnUpdate,
    builtin_tool_definitions, is_reasoning_model,
};
use cohere_llm::LlmClient;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::repair;
use crate::session::{self, SessionState};

const CONTINUING_LABEL: &str = "Continuing...";
const STOPPED_LABEL: &str = "⏹ Stopped by user";
const LIMIT_LABEL: &str = "⚠ Reached maximum iterations";
const LIMIT_MESSAGE: &str =
    "Reached maximum tool iterations. You can send another message to continue.";
const PLAN_STEP_LABEL: &str = "✓ Plan creation complete";

/// How often the thinking step's elapsed label refreshes during streaming.
const THINKING_REFRESH: Duration = Duration::from_millis(500);

/// Receives turn progress. `on_update` fires after every observable state
/// change; the last update of a turn has `is_final = true`. `on_plan_ready`
/// fires at most once per turn.
pub trait TurnObserver: Send + Sync {
    fn on_update(&self, update: TurnUpdate);
    fn on_plan_ready(&self, plan: &str);
}

#[derive(Debug, Clone)]
pub struct TurnLoopConfig {
    pub model: String,
    pub max_iterations: usize,
    pub plan_filename: String,
    pub result_preview_limit: usize,
    pub thinking_budget_tokens: u32,
}

impl Default for TurnLoopConfig {
    fn default() -> Self {
        Self {
            model: cohere_core::COHERE_DEFAULT_MODEL.to_string(),
            max_iterations: 15,
            plan_filename: "planning.md".to_string(),
            result_preview_limit: 2000,
            thinking_budget_tokens: 2048,
        }
    }
}

/// Mutable per-turn view shared between the loop and the stream callback.
struct TurnState {
    text: String,
    thought: String,
    progress: ProgressLog,
}

impl TurnState {
    fn new() -> Self {
        Self {
            text: String::new(),
            thought: String::new(),
            progress: ProgressLog::new(),
        }
    }

    fn update(&self, is_final: bool) -> TurnUpdate {
        TurnUpdate {
            text: self.text.clone(),
            thought: self.thought.clone(),
            progress: self.progress.snapshot(),
            is_final,
        }
    }
}

pub struct TurnLoop<'a> {
    llm: &'a (dyn LlmClient + Send + Sync),
    tools: Arc<dyn ToolHost + Send + Sync>,
    observer: Arc<dyn TurnObserver>,
    config: TurnLoopConfig,
    cancel: CancelFlag,
    session: SessionState,
    state: Arc<Mutex<TurnState>>,
}

impl<'a> TurnLoop<'a> {
    pub fn new(
        llm: &'a (dyn LlmClient + Send + Sync),
        tools: Arc<dyn ToolHost + Send + Sync>,
        observer: Arc<dyn TurnObserver>,
        config: TurnLoopConfig,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            llm,
            tools,
            observer,
            config,
            cancel,
            session: SessionState::new(),
            state: Arc::new(Mutex::new(TurnState::new())),
        }
    }

    /// The flag an external caller sets to request cooperative cancellation.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionState {
        &mut self.session
    }

    /// Run one turn. The prompt is rewritten for the mode before entering the
    /// iteration loop.
    pub fn execute(&mut self, prompt: &str, mode: TurnMode) -> Result<TurnOutcome> {
        let effective = session::effective_prompt(mode, prompt);
        self.run_turn(&effective)
    }

    /// Re-enter the loop in Execution mode with the approved plan, reusing
    /// the session history accumulated so far.
    pub fn execute_plan(&mut self, plan: &str) -> Result<TurnOutcome> {
        let prompt = session::plan_approval_prompt(plan);
        self.run_turn(&prompt)
    }

    fn run_turn(&mut self, prompt: &str) -> Result<TurnOutcome> {
        self.cancel.reset();
        {
            let mut state = self.lock_state();
            *state = TurnState::new();
        }
        self.session.push(ChatMessage::User {
            content: prompt.to_string(),
        });

        for _ in 0..self.config.max_iterations {
            {
                let mut state = self.lock_state();
                state.progress.pop_trailing(CONTINUING_LABEL);
            }

            // Poll point 1: top of iteration.
            if self.cancel.is_cancelled() {
                return Ok(self.finish_cancelled());
            }

            let response = match self.call_model() {
                Ok(response) => response,
                Err(err) => return Ok(self.finish_model_error(&err)),
            };

            let text = if response.text.is_empty() && response.tool_calls.is_empty() {
                // Downstream wire format rejects empty assistant content.
                " ".to_string()
            } else {
                response.text.clone()
            };
            self.session.push(ChatMessage::Assistant {
                content: Some(text.clone()),
                tool_plan: if response.thought.is_empty() {
                    None
                } else {
                    Some(response.thought.clone())
                },
                tool_calls: response.tool_calls.clone(),
            });

            if response.tool_calls.is_empty() {
                {
                    let mut state = self.lock_state();
                    state.text = text.clone();
                }
                self.emit(true);
                return Ok(TurnOutcome::FinalText(text));
            }

            let mut plan: Option<(String, String)> = None;
            for call in &response.tool_calls {
                // Poll point 2: before each dispatch. A tool already running
                // is never interrupted; only the next one is skipped.
                if self.cancel.is_cancelled() {
                    return Ok(self.finish_cancelled());
                }
                plan = self.run_tool_call(call);
                if plan.is_some() {
                    // Remaining calls in the batch are skipped; the turn
                    // closes into the plan outcome.
                    break;
                }
            }

            if let Some((path, content)) = plan {
                return Ok(self.finish_plan(path, content));
            }

            {
                let mut state = self.lock_state();
                state
                    .progress
                    .push(ProgressStep::thinking(CONTINUING_LABEL));
            }
            self.emit(false);
        }

        Ok(self.finish_limit_reached())
    }

    /// One streaming model call with the cooperative thinking tick.
    fn call_model(&mut self) -> Result<LlmResponse> {
        let started = Instant::now();
        let thinking_index = {
            let mut state = self.lock_state();
            // Each model call streams into fresh accumulators; text from the
            // previous iteration must not run into this call's updates.
            state.text.clear();
            state.thought.clear();
            state.progress.push(ProgressStep::thinking("Thinking... (0.0s)"))
        };
        self.emit(false);

        let state = Arc::clone(&self.state);
        let observer = Arc::clone(&self.observer);
        let last_refresh = Mutex::new(Instant::now());
        let callback = Arc::new(move |event: StreamEvent| {
            let mut state = match state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            match event {
                StreamEvent::ContentDelta(delta) => state.text.push_str(&delta),
                StreamEvent::ReasoningDelta(delta) => state.thought.push_str(&delta),
                StreamEvent::ToolCallStart { .. }
                | StreamEvent::ToolCallDelta { .. }
                | StreamEvent::Done => {}
            }

            // Elapsed-label tick, interleaved with stream consumption on the
            // same thread.
            let due = {
                let mut last = match last_refresh.lock() {
                    Ok(last) => last,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if last.elapsed() >= THINKING_REFRESH {
                    *last = Instant::now();
                    true
                } else {
                    false
                }
            };
            if due {
                state.progress.replace(
                    thinking_index,
                    ProgressStep::thinking(format!(
                        "Thinking... ({:.1}s)",
                        started.elapsed().as_secs_f64()
                    )),
                );
            }
            observer.on_update(state.update(false));
        });

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: self.session.messages().to_vec(),
            tools: builtin_tool_definitions(),
            thinking: is_reasoning_model(&self.config.model)
                .then(|| ThinkingConfig::enabled(self.config.thinking_budget_tokens)),
        };
        let result = self.llm.chat_streaming(&request, callback);

        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok(response) => {
                let mut state = self.lock_state();
                let mut step =
                    ProgressStep::thinking(format!("✓ Reasoning complete — {elapsed:.1}s"));
                if !response.thought.is_empty() {
                    step.thought = Some(response.thought.clone());
                }
                state.progress.replace(thinking_index, step);
                drop(state);
                self.emit(false);
                Ok(response)
            }
            Err(err) => {
                let mut state = self.lock_state();
                state.progress.replace(
                    thinking_index,
                    ProgressStep::thinking(format!("✗ Failed: {err}")),
                );
                drop(state);
                self.emit(false);
                Err(err)
            }
        }
    }

    /// Execute one tool call end to end: argument parse (with one repair
    /// attempt), progress step transitions, dispatch, and the tool-role
    /// history message. Returns the detected plan, if any.
    fn run_tool_call(&mut self, call: &LlmToolCall) -> Option<(String, String)> {
        let started = Instant::now();
        let parsed = if call.arguments.trim().is_empty() {
            Ok(serde_json::json!({}))
        } else {
            repair::parse_tool_arguments(&call.arguments)
        };

        let (label, tool, args) = match (&parsed, ToolName::from_api_name(&call.name)) {
            (Ok(args), Some(tool)) => (step_label(tool, args), Some(tool), args.clone()),
            _ => (
                format!("Calling `{}`", call.name),
                None,
                serde_json::json!({}),
            ),
        };

        let step_index = {
            let mut state = self.lock_state();
            let mut step = ProgressStep::tool(format!("{label}..."));
            step.tool_name = Some(call.name.clone());
            step.file_path = args
                .get("filePath")
                .or_else(|| args.get("dirPath"))
                .and_then(|v| v.as_str())
                .map(ToString::to_string);
            state.progress.push(step)
        };
        self.emit(false);

        let result = match (parsed, tool) {
            (Err(err), _) => ToolResult::failed(format!(
                "Error: Invalid arguments for tool '{}': {err}",
                call.name
            )),
            (Ok(_), None) => ToolResult::failed(format!("Error: Unknown tool '{}'", call.name)),
            (Ok(_), Some(tool)) => self.tools.dispatch(tool, &args),
        };

        {
            let mut state = self.lock_state();
            // The tool layer's verdict decides the step, not the result text;
            // a file that happens to start with "Error" is still a success.
            let mut step = if result.failed {
                ProgressStep::tool(format!("✗ Failed: {}", first_line(&result.text)))
            } else {
                ProgressStep::tool(format!(
                    "✓ {label} — {:.1}s",
                    started.elapsed().as_secs_f64()
                ))
            };
            step.tool_name = Some(call.name.clone());
            step.result = Some(preview(&result.text, self.config.result_preview_limit));
            state.progress.replace(step_index, step);
        }

        // Exactly one tool message per call, carrying the full result text.
        self.session.push(ChatMessage::Tool {
            tool_call_id: call.id.clone(),
            content: result.text.clone(),
        });
        self.emit(false);

        if tool == Some(ToolName::WriteFile) && result.text.starts_with("Successfully wrote") {
            let path = args.get("filePath").and_then(|v| v.as_str()).unwrap_or("");
            if path
                .to_ascii_lowercase()
                .ends_with(&self.config.plan_filename.to_ascii_lowercase())
            {
                let content = args
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                return Some((path.to_string(), content));
            }
        }
        None
    }

    fn finish_cancelled(&mut self) -> TurnOutcome {
        {
            let mut state = self.lock_state();
            state.progress.push(ProgressStep::thinking(STOPPED_LABEL));
        }
        self.emit(true);
        TurnOutcome::Cancelled
    }

    fn finish_model_error(&mut self, err: &anyhow::Error) -> TurnOutcome {
        let text = format!("Error: {err}");
        self.session.push(ChatMessage::Assistant {
            content: Some(text.clone()),
            tool_plan: None,
            tool_calls: Vec::new(),
        });
        {
            let mut state = self.lock_state();
            state.text = text.clone();
        }
        self.emit(true);
        TurnOutcome::FinalText(text)
    }

    fn finish_plan(&mut self, path: String, content: String) -> TurnOutcome {
        self.observer.on_plan_ready(&content);
        let message = format!(
            "Technical plan created in `{}`. Please review the plan before proceeding with execution.",
            self.config.plan_filename
        );
        self.session.push(ChatMessage::Assistant {
            content: Some(message.clone()),
            tool_plan: None,
            tool_calls: Vec::new(),
        });
        {
            let mut state = self.lock_state();
            state.text = message;
            state.progress.push(ProgressStep::thinking(PLAN_STEP_LABEL));
        }
        self.emit(true);
        TurnOutcome::PlanCreated { path, content }
    }

    fn finish_limit_reached(&mut self) -> TurnOutcome {
        self.session.push(ChatMessage::Assistant {
            content: Some(LIMIT_MESSAGE.to_string()),
            tool_plan: None,
            tool_calls: Vec::new(),
        });
        {
            let mut state = self.lock_state();
            state.progress.pop_trailing(CONTINUING_LABEL);
            state.progress.push(ProgressStep::thinking(LIMIT_LABEL));
            state.text = LIMIT_MESSAGE.to_string();
        }
        self.emit(true);
        TurnOutcome::IterationLimitReached
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TurnState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, is_final: bool) {
        let update = self.lock_state().update(is_final);
        self.observer.on_update(update);
    }
}

/// Human-readable in-progress label for a tool call.
fn step_label(tool: ToolName, args: &Value) -> String {
    let str_arg = |key: &str| args.get(key).and_then(|v| v.as_str()).unwrap_or("");
    match tool {
        ToolName::ReadFile => format!("Reading `{}`", str_arg("filePath")),
        ToolName::WriteFile => format!("Writing `{}`", str_arg("filePath")),
        ToolName::EditFile => format!("Editing `{}`", str_arg("filePath")),
        ToolName::DeleteFile => format!("Deleting `{}`", str_arg("filePath")),
        ToolName::ListDirectory => {
            let dir = args.get("dirPath").and_then(|v| v.as_str()).unwrap_or(".");
            format!("Listing `{dir}`")
        }
        ToolName::CreateDirectory => format!("Creating directory `{}`", str_arg("dirPath")),
        ToolName::RunCommand => format!("Running `{}`", str_arg("command")),
        ToolName::SearchFiles => format!("Searching for `{}`", str_arg("query")),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

fn preview(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let cut: String = text.chars().take(limit).collect();
    format!("{cut}\n... (truncated)")
}
