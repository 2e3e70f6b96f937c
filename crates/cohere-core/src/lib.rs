use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub type Result<T> = anyhow::Result<T>;

/// Default chat model when neither the CLI nor the config names one.
pub const COHERE_DEFAULT_MODEL: &str = "command-r7b-12-2024";

/// Cohere v2 chat endpoint.
pub const COHERE_CHAT_ENDPOINT: &str = "https://api.cohere.com/v2/chat";

/// Whether a model alias supports the `thinking` request block.
#[must_use]
pub fn is_reasoning_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("reasoning")
}

/// Per-workspace runtime directory for settings, history, trash and logs.
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".cohere")
}

// ── Chat types ──────────────────────────────────────────────────────────

/// A tool call requested by the model. `arguments` is the raw JSON-object
/// text, accumulated incrementally across stream deltas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// The model's streamed reasoning ("tool plan") for this turn.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tool_plan: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<LlmToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
    },
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

/// Fully assembled response from one model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    /// Accumulated reasoning text, empty when the model emitted none.
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub tool_calls: Vec<LlmToolCall>,
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,
}

/// One incremental event from a streaming model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A response-text delta.
    ContentDelta(String),
    /// A reasoning/tool-plan delta.
    ReasoningDelta(String),
    /// A tool-call slot opened at `index`.
    ToolCallStart {
        index: u64,
        id: String,
        name: String,
    },
    /// An argument fragment for the slot at `index`.
    ToolCallDelta { index: u64, arguments: String },
    /// End of stream.
    Done,
}

/// Callback for receiving stream events. `Arc<dyn Fn>` so one callback can be
/// cloned across the iterations of a turn.
pub type StreamCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

// ── Tool catalog ────────────────────────────────────────────────────────

/// The closed set of workspace tools. Dispatch over this enum is an
/// exhaustive match; an unknown API name is rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    ReadFile,
    WriteFile,
    EditFile,
    DeleteFile,
    ListDirectory,
    CreateDirectory,
    RunCommand,
    SearchFiles,
}

impl ToolName {
    /// Parse an API name (e.g. `"readFile"`). Returns `None` for unknown names.
    #[must_use]
    pub fn from_api_name(s: &str) -> Option<Self> {
        Some(match s {
            "readFile" => Self::ReadFile,
            "writeFile" => Self::WriteFile,
            "editFile" => Self::EditFile,
            "deleteFile" => Self::DeleteFile,
            "listDirectory" => Self::ListDirectory,
            "createDirectory" => Self::CreateDirectory,
            "runCommand" => Self::RunCommand,
            "searchFiles" => Self::SearchFiles,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_api_name(&self) -> &'static str {
        match self {
            Self::ReadFile => "readFile",
            Self::WriteFile => "writeFile",
            Self::EditFile => "editFile",
            Self::DeleteFile => "deleteFile",
            Self::ListDirectory => "listDirectory",
            Self::CreateDirectory => "createDirectory",
            Self::RunCommand => "runCommand",
            Self::SearchFiles => "searchFiles",
        }
    }

    /// Whether this tool has filesystem or process side effects.
    #[must_use]
    pub fn mutates(&self) -> bool {
        matches!(
            self,
            Self::WriteFile
                | Self::EditFile
                | Self::DeleteFile
                | Self::CreateDirectory
                | Self::RunCommand
        )
    }

    /// Whether this tool goes through the interactive approval gate.
    #[must_use]
    pub fn requires_approval(&self) -> bool {
        matches!(self, Self::WriteFile | Self::EditFile)
    }

    pub const ALL: &'static [ToolName] = &[
        Self::ReadFile,
        Self::WriteFile,
        Self::EditFile,
        Self::DeleteFile,
        Self::ListDirectory,
        Self::CreateDirectory,
        Self::RunCommand,
        Self::SearchFiles,
    ];
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_api_name())
    }
}

/// A tool (function) definition sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

fn function_tool(name: ToolName, description: &str, parameters: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        tool_type: "function".to_string(),
        function: FunctionDefinition {
            name: name.as_api_name().to_string(),
            description: description.to_string(),
            parameters,
        },
    }
}

/// The static tool catalog. Immutable for the process lifetime.
#[must_use]
pub fn builtin_tool_definitions() -> Vec<ToolDefinition> {
    use serde_json::json;
    vec![
        function_tool(
            ToolName::ReadFile,
            "Reads the content of a file in the workspace.",
            json!({
                "type": "object",
                "properties": {
                    "filePath": {"type": "string", "description": "The relative path to the file."}
                },
                "required": ["filePath"]
            }),
        ),
        function_tool(
            ToolName::WriteFile,
            "Writes or overwrites a file in the workspace.",
            json!({
                "type": "object",
                "properties": {
                    "filePath": {"type": "string", "description": "The relative path to the file."},
                    "content": {"type": "string", "description": "The content to write."}
                },
                "required": ["filePath", "content"]
            }),
        ),
        function_tool(
            ToolName::EditFile,
            "Makes a targeted edit to a file by finding and replacing specific text. \
             Use instead of writeFile when you only need to change a small part of a file. \
             The target text must exactly match text in the file.",
            json!({
                "type": "object",
                "properties": {
                    "filePath": {"type": "string", "description": "The relative path to the file to edit."},
                    "target": {"type": "string", "description": "The exact text to find and replace. Must match the file content exactly."},
                    "replacement": {"type": "string", "description": "The new text to replace the target with."}
                },
                "required": ["filePath", "target", "replacement"]
            }),
        ),
        function_tool(
            ToolName::DeleteFile,
            "Deletes a file or directory from the workspace (moves to trash for safety).",
            json!({
                "type": "object",
                "properties": {
                    "filePath": {"type": "string", "description": "The relative path to the file or directory to delete."}
                },
                "required": ["filePath"]
            }),
        ),
        function_tool(
            ToolName::ListDirectory,
            "Lists files and directories in a workspace path.",
            json!({
                "type": "object",
                "properties": {
                    "dirPath": {"type": "string", "description": "The relative path to the directory (default is \".\")."}
                }
            }),
        ),
        function_tool(
            ToolName::CreateDirectory,
            "Creates a new directory in the workspace.",
            json!({
                "type": "object",
                "properties": {
                    "dirPath": {"type": "string", "description": "The relative path to the new directory."}
                },
                "required": ["dirPath"]
            }),
        ),
        function_tool(
            ToolName::RunCommand,
            "Executes a shell command in the workspace root directory. Use for: package installs, \
             git commands, build scripts, running tests, etc. Returns stdout and stderr. \
             Has a bounded timeout.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The shell command to execute (e.g. \"npm install\", \"git status\", \"cargo check\")."}
                },
                "required": ["command"]
            }),
        ),
        function_tool(
            ToolName::SearchFiles,
            "Searches for a text pattern across workspace files. Returns matching lines with \
             file paths and line numbers. Use to find usages, definitions, imports, and \
             patterns across the codebase.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "The text or regex pattern to search for."},
                    "filePattern": {"type": "string", "description": "Optional glob pattern to filter files (default: \"**/*\"). Example: \"**/*.rs\" for Rust files only."}
                },
                "required": ["query"]
            }),
        ),
    ]
}

/// Outcome of one tool dispatch. `failed` is the tool layer's own verdict;
/// callers must not infer failure from the result text, which may legitimately
/// begin with words like "Error". A user-rejected change is not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub text: String,
    pub failed: bool,
}

impl ToolResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            failed: false,
        }
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            failed: true,
        }
    }
}

/// Executes one named tool call against the workspace. Implementations must
/// never fail the caller: every error becomes explanatory result text the
/// model can read and react to.
pub trait ToolHost {
    fn dispatch(&self, name: ToolName, args: &serde_json::Value) -> ToolResult;
}

// ── Requests ────────────────────────────────────────────────────────────

/// `thinking` block for reasoning-capable models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub thinking_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u32>,
}

impl ThinkingConfig {
    #[must_use]
    pub fn enabled(budget: u32) -> Self {
        Self {
            thinking_type: "enabled".to_string(),
            token_budget: Some(budget),
        }
    }
}

/// Request for one chat call with the tool catalog attached.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub thinking: Option<ThinkingConfig>,
}

// ── Progress log ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Thinking,
    Tool,
}

/// One UI-visible log entry for the current turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressStep {
    pub label: String,
    pub kind: StepKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thought: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
}

impl ProgressStep {
    #[must_use]
    pub fn thinking(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind: StepKind::Thinking,
            thought: None,
            tool_name: None,
            file_path: None,
            result: None,
        }
    }

    #[must_use]
    pub fn tool(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kind: StepKind::Tool,
            thought: None,
            tool_name: None,
            file_path: None,
            result: None,
        }
    }
}

/// Immutable snapshot of the progress log, passed by value to observers.
/// `version` increases with every mutation so consumers can detect staleness.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub version: u64,
    pub steps: Arc<[ProgressStep]>,
}

/// Append-only progress log for one turn. Steps are appended or the last step
/// is replaced; completed tool steps are never mutated again. Every mutation
/// bumps the version.
#[derive(Debug, Default)]
pub struct ProgressLog {
    steps: Vec<ProgressStep>,
    version: u64,
}

impl ProgressLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step and return its index.
    pub fn push(&mut self, step: ProgressStep) -> usize {
        self.steps.push(step);
        self.version += 1;
        self.steps.len() - 1
    }

    /// Replace the step at `index` (in-progress → completed/failed transition,
    /// or the thinking label's elapsed-time refresh).
    pub fn replace(&mut self, index: usize, step: ProgressStep) {
        if let Some(slot) = self.steps.get_mut(index) {
            *slot = step;
            self.version += 1;
        }
    }

    /// Remove the trailing step when its label matches (the transient
    /// "Continuing..." marker between iterations).
    pub fn pop_trailing(&mut self, label: &str) {
        if self.steps.last().is_some_and(|s| s.label == label) {
            self.steps.pop();
            self.version += 1;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            version: self.version,
            steps: self.steps.clone().into(),
        }
    }
}

/// One observable state change within a turn. The last update of a turn
/// always carries `is_final = true`.
#[derive(Debug, Clone)]
pub struct TurnUpdate {
    pub text: String,
    pub thought: String,
    pub progress: ProgressSnapshot,
    pub is_final: bool,
}

// ── Turn vocabulary ─────────────────────────────────────────────────────

/// Terminal state of one turn. Exactly one per turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    FinalText(String),
    PlanCreated { path: String, content: String },
    Cancelled,
    IterationLimitReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnMode {
    Planning,
    Execution,
    Research,
}

impl TurnMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "Planning",
            Self::Execution => "Execution",
            Self::Research => "Research",
        }
    }
}

impl std::str::FromStr for TurnMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planning" | "plan" => Ok(Self::Planning),
            "execution" | "execute" => Ok(Self::Execution),
            "research" => Ok(Self::Research),
            other => Err(anyhow::anyhow!(
                "unknown mode '{other}' (expected planning, execution, or research)"
            )),
        }
    }
}

/// Shared cancellation flag. Setting it is advisory: the turn loop observes
/// it at its enumerated poll points, never mid-tool.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying atomic, for wiring into OS signal handlers.
    #[must_use]
    pub fn atomic(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// The shape messages are persisted in. `bot` is the historical assistant
/// role name and is preserved for compatibility with existing history files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
}

// ── Configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub tools: ToolPolicyConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub thinking_budget_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: COHERE_DEFAULT_MODEL.to_string(),
            endpoint: COHERE_CHAT_ENDPOINT.to_string(),
            api_key: None,
            api_key_env: "COHERE_API_KEY".to_string(),
            timeout_seconds: 60,
            max_retries: 3,
            retry_base_ms: 400,
            thinking_budget_tokens: 2048,
        }
    }
}

/// Resource-bound knobs for the tool layer. The defaults mirror long-standing
/// behavior; all of them are overridable through the settings files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicyConfig {
    pub command_timeout_seconds: u64,
    pub command_output_limit_bytes: u64,
    pub command_output_display_limit: usize,
    pub search_match_cap: usize,
    pub result_preview_limit: usize,
    pub listing_cache_ttl_seconds: u64,
}

impl Default for ToolPolicyConfig {
    fn default() -> Self {
        Self {
            command_timeout_seconds: 30,
            command_output_limit_bytes: 1_048_576,
            command_output_display_limit: 5000,
            search_match_cap: 50,
            result_preview_limit: 2000,
            listing_cache_ttl_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub plan_filename: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            plan_filename: "planning.md".to_string(),
        }
    }
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".cohere/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Layered load: defaults ← legacy toml ← user ← project ← project-local.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let legacy = Self::legacy_toml_path(workspace);
        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

pub fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

/// The one precondition failure that disables every tool uniformly.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("no workspace root: '{0}' does not exist or is not a directory")]
    NotADirectory(String),
}
