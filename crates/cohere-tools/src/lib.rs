mod approval;
mod shell;

use anyhow::{Result, anyhow};
use cohere_core::{ToolHost, ToolName, ToolPolicyConfig, ToolResult, WorkspaceError, runtime_dir};
use ignore::WalkBuilder;
use serde_json::Value;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub use approval::{
    ApprovalDecision, AutoApprover, ChangeApprover, ChangeProposal, PreviewFiles,
};
pub use shell::{PlatformShellRunner, ShellRunResult, ShellRunner};

/// Directories never traversed by search or listing, regardless of gitignore.
const SKIP_DIRS: &[&str] = &["node_modules", ".git", "dist", "out", ".cohere"];

/// Cached recursive file listing with a TTL, refreshed lazily and invalidated
/// explicitly by every mutating tool.
pub struct ListingCache {
    entries: Vec<String>,
    refreshed_at: Option<Instant>,
    ttl: Duration,
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Vec::new(),
            refreshed_at: None,
            ttl,
        }
    }

    pub fn get_or_refresh(&mut self, compute: impl FnOnce() -> Vec<String>) -> Vec<String> {
        let stale = self
            .refreshed_at
            .is_none_or(|at| at.elapsed() >= self.ttl);
        if stale {
            self.entries = compute();
            self.refreshed_at = Some(Instant::now());
        }
        self.entries.clone()
    }

    pub fn invalidate(&mut self) {
        self.refreshed_at = None;
    }
}

/// Executes the tool catalog against one workspace root.
///
/// Every tool failure is rendered as result text the model can react to; the
/// only hard failure is constructing the host without a workspace directory.
pub struct WorkspaceTools {
    workspace: PathBuf,
    policy: ToolPolicyConfig,
    runner: Arc<dyn ShellRunner + Send + Sync>,
    approver: Arc<dyn ChangeApprover + Send + Sync>,
    listing_cache: Mutex<ListingCache>,
}

impl WorkspaceTools {
    pub fn new(
        workspace: &Path,
        policy: ToolPolicyConfig,
        approver: Arc<dyn ChangeApprover + Send + Sync>,
    ) -> Result<Self> {
        Self::with_runner(workspace, policy, approver, Arc::new(PlatformShellRunner))
    }

    pub fn with_runner(
        workspace: &Path,
        policy: ToolPolicyConfig,
        approver: Arc<dyn ChangeApprover + Send + Sync>,
        runner: Arc<dyn ShellRunner + Send + Sync>,
    ) -> Result<Self> {
        if !workspace.is_dir() {
            return Err(
                WorkspaceError::NotADirectory(workspace.display().to_string()).into(),
            );
        }
        let ttl = Duration::from_secs(policy.listing_cache_ttl_seconds);
        Ok(Self {
            workspace: workspace.to_path_buf(),
            policy,
            runner,
            approver,
            listing_cache: Mutex::new(ListingCache::new(ttl)),
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Relative paths of all workspace files, for `@` mention completion and
    /// resolution. Served through the listing cache.
    pub fn workspace_files(&self) -> Vec<String> {
        let mut cache = match self.listing_cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.get_or_refresh(|| {
            let mut files: Vec<String> = walk_workspace(&self.workspace)
                .into_iter()
                .filter(|p| p.is_file())
                .filter_map(|p| {
                    p.strip_prefix(&self.workspace)
                        .ok()
                        .map(normalize_rel_path)
                })
                .collect();
            files.sort();
            files
        })
    }

    fn invalidate_listing(&self) {
        let mut cache = match self.listing_cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.invalidate();
    }

    /// Resolve a model-supplied relative path under the workspace root.
    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let candidate = Path::new(rel);
        if candidate.is_absolute() {
            return Err(anyhow!("absolute paths are not allowed: {rel}"));
        }
        let mut depth = 0_i32;
        for component in candidate.components() {
            match component {
                Component::ParentDir => depth -= 1,
                Component::Normal(_) => depth += 1,
                _ => {}
            }
            if depth < 0 {
                return Err(anyhow!("path escapes the workspace: {rel}"));
            }
        }
        Ok(self.workspace.join(candidate))
    }

    fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
        args.get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing '{key}' argument"))
    }

    fn read_file(&self, args: &Value) -> ToolResult {
        match self.read_file_inner(args) {
            Ok(content) => ToolResult::ok(content),
            Err(err) => ToolResult::failed(format!("Error reading file: {err}")),
        }
    }

    fn read_file_inner(&self, args: &Value) -> Result<String> {
        let rel = Self::str_arg(args, "filePath")?;
        let path = self.resolve(rel)?;
        Ok(fs::read_to_string(path)?)
    }

    fn write_file(&self, args: &Value) -> ToolResult {
        let rel = match Self::str_arg(args, "filePath") {
            Ok(rel) => rel,
            Err(err) => return ToolResult::failed(format!("Error writing file: {err}")),
        };
        match self.write_file_inner(rel, args) {
            // A user rejection reads back as a normal outcome, not a failure.
            Ok(text) => ToolResult::ok(text),
            Err(err) => ToolResult::failed(format!("Error writing file: {err}")),
        }
    }

    fn write_file_inner(&self, rel: &str, args: &Value) -> Result<String> {
        let content = Self::str_arg(args, "content")?;
        let path = self.resolve(rel)?;
        let old = fs::read_to_string(&path).ok();
        let proposal = ChangeProposal::new(rel, old.as_deref(), content);
        if self.approver.review(&proposal)? == ApprovalDecision::Rejected {
            return Ok(format!(
                "Action cancelled: User rejected the changes to {rel}."
            ));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        self.invalidate_listing();
        Ok(format!("Successfully wrote to {rel}"))
    }

    fn edit_file(&self, args: &Value) -> ToolResult {
        let rel = match Self::str_arg(args, "filePath") {
            Ok(rel) => rel,
            Err(err) => return ToolResult::failed(format!("Error editing file: {err}")),
        };
        match self.edit_file_inner(rel, args) {
            Ok(result) => result,
            Err(err) => ToolResult::failed(format!("Error editing file: {err}")),
        }
    }

    fn edit_file_inner(&self, rel: &str, args: &Value) -> Result<ToolResult> {
        let target = Self::str_arg(args, "target")?;
        let replacement = Self::str_arg(args, "replacement")?;
        let path = self.resolve(rel)?;
        let current = fs::read_to_string(&path)?;

        let Some(start) = current.find(target) else {
            return Ok(ToolResult::failed(format!(
                "Error: Target text not found in {rel}. The exact text to replace was not found."
            )));
        };
        let proposal =
            ChangeProposal::splice(rel, &current, start..start + target.len(), replacement);
        if self.approver.review(&proposal)? == ApprovalDecision::Rejected {
            return Ok(ToolResult::ok(format!(
                "Action cancelled: User rejected the edits to {rel}."
            )));
        }
        fs::write(&path, &proposal.new)?;
        self.invalidate_listing();
        Ok(ToolResult::ok(format!(
            "Successfully edited {rel}: replaced {} chars with {} chars.",
            target.chars().count(),
            replacement.chars().count()
        )))
    }

    fn delete_file(&self, args: &Value) -> ToolResult {
        let rel = match Self::str_arg(args, "filePath") {
            Ok(rel) => rel,
            Err(err) => return ToolResult::failed(format!("Error deleting file: {err}")),
        };
        match self.delete_file_inner(rel) {
            Ok(text) => ToolResult::ok(text),
            Err(err) => ToolResult::failed(format!("Error deleting {rel}: {err}")),
        }
    }

    fn delete_file_inner(&self, rel: &str) -> Result<String> {
        let path = self.resolve(rel)?;
        if !path.exists() {
            return Err(anyhow!("no such file or directory"));
        }
        // Recoverable delete: the entry moves into the runtime trash dir.
        let trash = runtime_dir(&self.workspace).join("trash");
        fs::create_dir_all(&trash)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "entry".to_string());
        let target = trash.join(format!("{}-{file_name}", Uuid::now_v7()));
        fs::rename(&path, &target)?;
        self.invalidate_listing();
        Ok(format!("Successfully deleted: {rel}"))
    }

    fn list_directory(&self, args: &Value) -> ToolResult {
        let rel = args
            .get("dirPath")
            .and_then(|v| v.as_str())
            .unwrap_or(".");
        match self.list_directory_inner(rel) {
            Ok(text) => ToolResult::ok(text),
            Err(err) => ToolResult::failed(format!("Error listing directory: {err}")),
        }
    }

    fn list_directory_inner(&self, rel: &str) -> Result<String> {
        let path = self.resolve(rel)?;
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() {
                dirs.push(format!("[DIR] {name}"));
            } else {
                files.push(format!("[FILE] {name}"));
            }
        }
        dirs.sort();
        files.sort();
        dirs.extend(files);
        Ok(dirs.join("\n"))
    }

    fn create_directory(&self, args: &Value) -> ToolResult {
        let rel = match Self::str_arg(args, "dirPath") {
            Ok(rel) => rel,
            Err(err) => return ToolResult::failed(format!("Error creating directory: {err}")),
        };
        match self.create_directory_inner(rel) {
            Ok(text) => ToolResult::ok(text),
            Err(err) => ToolResult::failed(format!("Error creating directory: {err}")),
        }
    }

    fn create_directory_inner(&self, rel: &str) -> Result<String> {
        let path = self.resolve(rel)?;
        fs::create_dir_all(path)?;
        self.invalidate_listing();
        Ok(format!("Successfully created directory: {rel}"))
    }

    fn run_command(&self, args: &Value) -> ToolResult {
        let cmd = match Self::str_arg(args, "command") {
            Ok(cmd) => cmd,
            Err(err) => return ToolResult::failed(format!("Error executing command: {err}")),
        };
        let timeout = Duration::from_secs(self.policy.command_timeout_seconds);
        let result = match self.runner.run(cmd, &self.workspace, timeout) {
            Ok(result) => result,
            Err(err) => return ToolResult::failed(format!("Error executing command: {err}")),
        };
        self.invalidate_listing();

        // The byte cap bounds stdout and stderr together, not each alone.
        let cap = self.policy.command_output_limit_bytes as usize;
        let stdout = truncate_bytes(&result.stdout, cap);
        let stderr = truncate_bytes(&result.stderr, cap.saturating_sub(stdout.len()));

        if result.timed_out {
            return ToolResult::failed(
                format!(
                    "Command failed (exit code unknown):\n{stdout}\nCommand timed out after {} seconds",
                    self.policy.command_timeout_seconds
                )
                .trim()
                .to_string(),
            );
        }
        if result.status != Some(0) {
            let code = result
                .status
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return ToolResult::failed(
                format!("Command failed (exit code {code}):\n{stdout}\n{stderr}")
                    .trim()
                    .to_string(),
            );
        }

        let mut output = stdout;
        if !stderr.trim().is_empty() {
            if !output.is_empty() {
                output.push_str("\n--- stderr ---\n");
            }
            output.push_str(&stderr);
        }
        if output.trim().is_empty() {
            return ToolResult::ok("(Command completed with no output)");
        }
        if output.chars().count() > self.policy.command_output_display_limit {
            let cut: String = output
                .chars()
                .take(self.policy.command_output_display_limit)
                .collect();
            return ToolResult::ok(format!("{cut}\n... (output truncated)"));
        }
        ToolResult::ok(output)
    }

    fn search_files(&self, args: &Value) -> ToolResult {
        let query = match Self::str_arg(args, "query") {
            Ok(query) => query,
            Err(err) => return ToolResult::failed(format!("Error searching files: {err}")),
        };
        let file_pattern = args
            .get("filePattern")
            .and_then(|v| v.as_str())
            .unwrap_or("**/*");
        match self.search_files_inner(query, file_pattern) {
            Ok(text) => ToolResult::ok(text),
            Err(err) => ToolResult::failed(format!("Error searching files: {err}")),
        }
    }

    fn search_files_inner(&self, query: &str, file_pattern: &str) -> Result<String> {
        let regex = regex::RegexBuilder::new(query)
            .case_insensitive(true)
            .build()
            .or_else(|_| {
                // Invalid regex falls back to a literal search.
                regex::RegexBuilder::new(&regex::escape(query))
                    .case_insensitive(true)
                    .build()
            })?;
        let compiled_glob = glob::Pattern::new(file_pattern)
            .map_err(|err| anyhow!("invalid glob pattern '{file_pattern}': {err}"))?;

        let mut matches = Vec::new();
        'files: for path in walk_workspace(&self.workspace) {
            if !path.is_file() {
                continue;
            }
            let Ok(rel_path) = path.strip_prefix(&self.workspace) else {
                continue;
            };
            let rel = normalize_rel_path(rel_path);
            if !compiled_glob.matches(&rel) {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{rel}:{}: {}", idx + 1, line.trim()));
                    if matches.len() >= self.policy.search_match_cap {
                        break 'files;
                    }
                }
            }
        }

        if matches.is_empty() {
            return Ok(format!("No matches found for \"{query}\""));
        }
        Ok(matches.join("\n"))
    }
}

impl ToolHost for WorkspaceTools {
    fn dispatch(&self, name: ToolName, args: &Value) -> ToolResult {
        match name {
            ToolName::ReadFile => self.read_file(args),
            ToolName::WriteFile => self.write_file(args),
            ToolName::EditFile => self.edit_file(args),
            ToolName::DeleteFile => self.delete_file(args),
            ToolName::ListDirectory => self.list_directory(args),
            ToolName::CreateDirectory => self.create_directory(args),
            ToolName::RunCommand => self.run_command(args),
            ToolName::SearchFiles => self.search_files(args),
        }
    }
}

fn should_skip_rel_path(path: &Path) -> bool {
    path.components()
        .any(|c| SKIP_DIRS.iter().any(|skip| c.as_os_str() == *skip))
}

fn walk_workspace(workspace: &Path) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(workspace);
    builder.hidden(false);
    builder.follow_links(false);
    builder.parents(true);
    builder.git_ignore(true);
    builder.git_global(true);
    builder.git_exclude(true);
    builder.require_git(false);

    let mut paths = Vec::new();
    for entry in builder.build() {
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(workspace) else {
            continue;
        };
        if should_skip_rel_path(rel) {
            continue;
        }
        paths.push(path.to_path_buf());
    }
    paths
}

fn normalize_rel_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn truncate_bytes(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_workspace() -> PathBuf {
        let workspace =
            std::env::temp_dir().join(format!("cohere-tools-test-{}", Uuid::now_v7()));
        fs::create_dir_all(&workspace).expect("workspace");
        workspace
    }

    fn auto_host(workspace: &Path) -> WorkspaceTools {
        WorkspaceTools::new(workspace, ToolPolicyConfig::default(), Arc::new(AutoApprover))
            .expect("tool host")
    }

    struct RejectingApprover;

    impl ChangeApprover for RejectingApprover {
        fn review(&self, _proposal: &ChangeProposal) -> Result<ApprovalDecision> {
            Ok(ApprovalDecision::Rejected)
        }
    }

    #[derive(Clone, Default)]
    struct ScriptedRunner {
        result: Arc<Mutex<Option<ShellRunResult>>>,
        commands: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn with(result: ShellRunResult) -> Self {
            Self {
                result: Arc::new(Mutex::new(Some(result))),
                commands: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn captured(&self) -> Vec<String> {
            self.commands.lock().expect("commands").clone()
        }
    }

    impl ShellRunner for ScriptedRunner {
        fn run(&self, cmd: &str, _cwd: &Path, _timeout: Duration) -> Result<ShellRunResult> {
            self.commands
                .lock()
                .expect("commands")
                .push(cmd.to_string());
            Ok(self
                .result
                .lock()
                .expect("result")
                .clone()
                .unwrap_or(ShellRunResult {
                    status: Some(0),
                    stdout: "ok".to_string(),
                    stderr: String::new(),
                    timed_out: false,
                }))
        }
    }

    fn scripted_host(workspace: &Path, runner: ScriptedRunner) -> WorkspaceTools {
        WorkspaceTools::with_runner(
            workspace,
            ToolPolicyConfig::default(),
            Arc::new(AutoApprover),
            Arc::new(runner),
        )
        .expect("tool host")
    }

    #[test]
    fn missing_workspace_root_is_fatal() {
        let missing = std::env::temp_dir().join(format!("cohere-missing-{}", Uuid::now_v7()));
        let err = WorkspaceTools::new(
            &missing,
            ToolPolicyConfig::default(),
            Arc::new(AutoApprover),
        )
        .err()
        .expect("missing workspace should fail");
        assert!(err.to_string().contains("no workspace root"));
    }

    #[test]
    fn read_and_write_round_trip() {
        let workspace = temp_workspace();
        let host = auto_host(&workspace);

        let wrote = host.dispatch(
            ToolName::WriteFile,
            &json!({"filePath": "notes/a.txt", "content": "hello"}),
        );
        assert_eq!(wrote.text, "Successfully wrote to notes/a.txt");
        assert!(!wrote.failed);

        let read = host.dispatch(ToolName::ReadFile, &json!({"filePath": "notes/a.txt"}));
        assert_eq!(read.text, "hello");

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn read_failure_becomes_result_text() {
        let workspace = temp_workspace();
        let host = auto_host(&workspace);
        let out = host.dispatch(ToolName::ReadFile, &json!({"filePath": "nope.txt"}));
        assert!(out.failed);
        assert!(out.text.starts_with("Error reading file: "));
        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn path_escapes_are_refused() {
        let workspace = temp_workspace();
        let host = auto_host(&workspace);
        let out = host.dispatch(ToolName::ReadFile, &json!({"filePath": "../outside.txt"}));
        assert!(out.text.contains("escapes the workspace"));
        let out = host.dispatch(ToolName::ReadFile, &json!({"filePath": "/etc/hosts"}));
        assert!(out.text.contains("absolute paths are not allowed"));
        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn rejected_write_is_cancelled_not_applied() {
        let workspace = temp_workspace();
        let host = WorkspaceTools::new(
            &workspace,
            ToolPolicyConfig::default(),
            Arc::new(RejectingApprover),
        )
        .expect("host");

        let out = host.dispatch(
            ToolName::WriteFile,
            &json!({"filePath": "a.txt", "content": "data"}),
        );
        assert_eq!(out.text, "Action cancelled: User rejected the changes to a.txt.");
        assert!(!out.failed, "a rejection is not a tool failure");
        assert!(!workspace.join("a.txt").exists());

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn edit_replaces_first_occurrence_only() {
        let workspace = temp_workspace();
        fs::write(workspace.join("main.rs"), "foo bar foo").expect("seed");
        let host = auto_host(&workspace);

        let out = host.dispatch(
            ToolName::EditFile,
            &json!({"filePath": "main.rs", "target": "foo", "replacement": "baz"}),
        );
        assert_eq!(out.text, "Successfully edited main.rs: replaced 3 chars with 3 chars.");
        assert_eq!(
            fs::read_to_string(workspace.join("main.rs")).expect("read"),
            "baz bar foo"
        );

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn edit_with_missing_target_reports_exact_message() {
        let workspace = temp_workspace();
        fs::write(workspace.join("main.rs"), "fn main() {}").expect("seed");
        let host = auto_host(&workspace);

        let out = host.dispatch(
            ToolName::EditFile,
            &json!({"filePath": "main.rs", "target": "does_not_exist", "replacement": "x"}),
        );
        assert!(out.failed);
        assert_eq!(
            out.text,
            "Error: Target text not found in main.rs. The exact text to replace was not found."
        );
        // File untouched.
        assert_eq!(
            fs::read_to_string(workspace.join("main.rs")).expect("read"),
            "fn main() {}"
        );

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn rejected_edit_is_cancelled() {
        let workspace = temp_workspace();
        fs::write(workspace.join("main.rs"), "fn main() {}").expect("seed");
        let host = WorkspaceTools::new(
            &workspace,
            ToolPolicyConfig::default(),
            Arc::new(RejectingApprover),
        )
        .expect("host");

        let out = host.dispatch(
            ToolName::EditFile,
            &json!({"filePath": "main.rs", "target": "main", "replacement": "start"}),
        );
        assert_eq!(out.text, "Action cancelled: User rejected the edits to main.rs.");
        assert!(!out.failed);
        assert_eq!(
            fs::read_to_string(workspace.join("main.rs")).expect("read"),
            "fn main() {}"
        );

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn list_directory_marks_dirs_and_files() {
        let workspace = temp_workspace();
        fs::create_dir_all(workspace.join("src")).expect("src");
        fs::write(workspace.join("Cargo.toml"), "[package]").expect("seed");
        fs::write(workspace.join("README.md"), "# hi").expect("seed");
        let host = auto_host(&workspace);

        let out = host.dispatch(ToolName::ListDirectory, &json!({}));
        assert_eq!(out.text, "[DIR] src\n[FILE] Cargo.toml\n[FILE] README.md");

        let out = host.dispatch(ToolName::ListDirectory, &json!({"dirPath": "missing"}));
        assert!(out.failed);
        assert!(out.text.starts_with("Error listing directory: "));

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn create_directory_reports_path() {
        let workspace = temp_workspace();
        let host = auto_host(&workspace);
        let out = host.dispatch(ToolName::CreateDirectory, &json!({"dirPath": "a/b/c"}));
        assert_eq!(out.text, "Successfully created directory: a/b/c");
        assert!(workspace.join("a/b/c").is_dir());
        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn delete_moves_entry_into_trash() {
        let workspace = temp_workspace();
        fs::write(workspace.join("old.txt"), "bye").expect("seed");
        let host = auto_host(&workspace);

        let out = host.dispatch(ToolName::DeleteFile, &json!({"filePath": "old.txt"}));
        assert_eq!(out.text, "Successfully deleted: old.txt");
        assert!(!workspace.join("old.txt").exists());
        let trash_entries: Vec<_> = fs::read_dir(runtime_dir(&workspace).join("trash"))
            .expect("trash")
            .collect();
        assert_eq!(trash_entries.len(), 1);

        let out = host.dispatch(ToolName::DeleteFile, &json!({"filePath": "old.txt"}));
        assert!(out.failed);
        assert!(out.text.starts_with("Error deleting old.txt: "));

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn run_command_uses_workspace_root_and_formats_success() {
        let workspace = temp_workspace();
        let runner = ScriptedRunner::with(ShellRunResult {
            status: Some(0),
            stdout: "hello\n".to_string(),
            stderr: "warning: x\n".to_string(),
            timed_out: false,
        });
        let host = scripted_host(&workspace, runner.clone());

        let out = host.dispatch(ToolName::RunCommand, &json!({"command": "make build"}));
        assert_eq!(out.text, "hello\n\n--- stderr ---\nwarning: x\n");
        assert!(!out.failed);
        assert_eq!(runner.captured(), vec!["make build".to_string()]);

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn run_command_failure_carries_exit_code_prefix() {
        let workspace = temp_workspace();
        let runner = ScriptedRunner::with(ShellRunResult {
            status: Some(1),
            stdout: "partial".to_string(),
            stderr: "boom".to_string(),
            timed_out: false,
        });
        let host = scripted_host(&workspace, runner);

        let out = host.dispatch(ToolName::RunCommand, &json!({"command": "false"}));
        assert!(out.failed);
        assert_eq!(out.text, "Command failed (exit code 1):\npartial\nboom");

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn file_content_starting_with_error_reads_back_as_success() {
        let workspace = temp_workspace();
        fs::write(
            workspace.join("notes.md"),
            "Error codes are documented below.\n",
        )
        .expect("seed");
        let host = auto_host(&workspace);

        let out = host.dispatch(ToolName::ReadFile, &json!({"filePath": "notes.md"}));
        assert!(!out.failed, "result text must not be sniffed for failure");
        assert!(out.text.starts_with("Error codes"));

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn command_output_cap_bounds_stdout_and_stderr_together() {
        let workspace = temp_workspace();
        let policy = ToolPolicyConfig {
            command_output_limit_bytes: 100,
            command_output_display_limit: 10_000,
            ..ToolPolicyConfig::default()
        };
        let runner = ScriptedRunner::with(ShellRunResult {
            status: Some(0),
            stdout: "o".repeat(80),
            stderr: "e".repeat(80),
            timed_out: false,
        });
        let host = WorkspaceTools::with_runner(
            &workspace,
            policy,
            Arc::new(AutoApprover),
            Arc::new(runner),
        )
        .expect("tool host");

        let out = host.dispatch(ToolName::RunCommand, &json!({"command": "noisy"}));
        let payload = out.text.replace("\n--- stderr ---\n", "");
        assert_eq!(payload.len(), 100, "stdout and stderr share one byte cap");
        assert_eq!(payload.matches('o').count(), 80);
        assert_eq!(payload.matches('e').count(), 20);

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn run_command_empty_output_has_placeholder() {
        let workspace = temp_workspace();
        let runner = ScriptedRunner::with(ShellRunResult {
            status: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
        });
        let host = scripted_host(&workspace, runner);
        let out = host.dispatch(ToolName::RunCommand, &json!({"command": "true"}));
        assert_eq!(out.text, "(Command completed with no output)");
        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn run_command_timeout_is_reported_as_failure() {
        let workspace = temp_workspace();
        let runner = ScriptedRunner::with(ShellRunResult {
            status: None,
            stdout: "partial".to_string(),
            stderr: String::new(),
            timed_out: true,
        });
        let host = scripted_host(&workspace, runner);
        let out = host.dispatch(ToolName::RunCommand, &json!({"command": "sleep 600"}));
        assert!(out.failed);
        assert!(out.text.starts_with("Command failed (exit code unknown):"));
        assert!(out.text.contains("timed out after 30 seconds"));
        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn run_command_long_output_is_display_truncated() {
        let workspace = temp_workspace();
        let runner = ScriptedRunner::with(ShellRunResult {
            status: Some(0),
            stdout: "x".repeat(6000),
            stderr: String::new(),
            timed_out: false,
        });
        let host = scripted_host(&workspace, runner);
        let out = host.dispatch(ToolName::RunCommand, &json!({"command": "yes"}));
        assert!(out.text.ends_with("\n... (output truncated)"));
        assert_eq!(out.text.chars().filter(|c| *c == 'x').count(), 5000);
        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn search_finds_matches_case_insensitively() {
        let workspace = temp_workspace();
        fs::create_dir_all(workspace.join("src")).expect("src");
        fs::write(workspace.join("src/lib.rs"), "pub fn Helper() {}\n").expect("seed");
        fs::write(workspace.join("notes.md"), "no match here\n").expect("seed");
        let host = auto_host(&workspace);

        let out = host.dispatch(ToolName::SearchFiles, &json!({"query": "helper"}));
        assert_eq!(out.text, "src/lib.rs:1: pub fn Helper() {}");

        let out = host.dispatch(
            ToolName::SearchFiles,
            &json!({"query": "helper", "filePattern": "**/*.md"}),
        );
        assert_eq!(out.text, "No matches found for \"helper\"");
        assert!(!out.failed, "an empty result set is not a failure");

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn search_skips_excluded_directories_and_caps_matches() {
        let workspace = temp_workspace();
        fs::create_dir_all(workspace.join("node_modules/pkg")).expect("dir");
        fs::write(workspace.join("node_modules/pkg/index.js"), "needle\n").expect("seed");
        let many: String = "needle\n".repeat(60);
        fs::write(workspace.join("hay.txt"), many).expect("seed");
        let host = auto_host(&workspace);

        let out = host.dispatch(ToolName::SearchFiles, &json!({"query": "needle"}));
        let lines: Vec<&str> = out.text.lines().collect();
        assert_eq!(lines.len(), 50);
        assert!(lines.iter().all(|l| l.starts_with("hay.txt:")));

        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn invalid_regex_falls_back_to_literal_search() {
        let workspace = temp_workspace();
        fs::write(workspace.join("code.c"), "if (a[ {\n").expect("seed");
        let host = auto_host(&workspace);
        let out = host.dispatch(ToolName::SearchFiles, &json!({"query": "a[ {"}));
        assert_eq!(out.text, "code.c:1: if (a[ {");
        fs::remove_dir_all(&workspace).ok();
    }

    #[test]
    fn listing_cache_refreshes_on_invalidate_and_ttl() {
        let mut cache = ListingCache::new(Duration::from_secs(3600));
        let first = cache.get_or_refresh(|| vec!["a".to_string()]);
        assert_eq!(first, vec!["a".to_string()]);

        // Within TTL the compute closure is not consulted.
        let second = cache.get_or_refresh(|| vec!["b".to_string()]);
        assert_eq!(second, vec!["a".to_string()]);

        cache.invalidate();
        let third = cache.get_or_refresh(|| vec!["c".to_string()]);
        assert_eq!(third, vec!["c".to_string()]);

        let mut expiring = ListingCache::new(Duration::ZERO);
        expiring.get_or_refresh(|| vec!["x".to_string()]);
        let refreshed = expiring.get_or_refresh(|| vec!["y".to_string()]);
        assert_eq!(refreshed, vec!["y".to_string()]);
    }

    #[test]
    fn workspace_files_reflect_mutations() {
        let workspace = temp_workspace();
        let host = auto_host(&workspace);
        assert!(host.workspace_files().is_empty());

        host.dispatch(
            ToolName::WriteFile,
            &json!({"filePath": "src/new.rs", "content": "pub fn f() {}"}),
        );
        assert_eq!(host.workspace_files(), vec!["src/new.rs".to_string()]);

        fs::remove_dir_all(&workspace).ok();
    }
}
