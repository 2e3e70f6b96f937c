//! `cohere` binary: a terminal front end for the agent core.
//!
//! Runs one turn per prompt (or an interactive loop), prints progress step
//! transitions as they happen, and gates file mutations behind a stdin
//! diff-review prompt unless `--yes` is passed.

use anyhow::{Context, Result};
use clap::Parser;
use cohere_agent::{TurnLoop, TurnLoopConfig, TurnObserver, resolve_mentions};
use cohere_core::{AppConfig, CancelFlag, TurnMode, TurnOutcome, TurnUpdate};
use cohere_llm::CohereClient;
use cohere_observe::Observer;
use cohere_store::{HistoryScope, HistoryStore};
use cohere_tools::{
    ApprovalDecision, AutoApprover, ChangeApprover, ChangeProposal, WorkspaceTools,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Parser)]
#[command(name = "cohere")]
#[command(about = "Cohere-powered workspace coding agent", version)]
struct Cli {
    /// Prompt to run. Starts an interactive session when omitted.
    prompt: Option<String>,

    /// Turn mode: planning, execution, or research.
    #[arg(long, default_value = "execution")]
    mode: String,

    /// Override the configured model for this invocation.
    #[arg(long)]
    model: Option<String>,

    /// Workspace root (defaults to the current directory).
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Auto-approve all file changes without prompting.
    #[arg(long, short = 'y')]
    yes: bool,

    /// Print diagnostic output.
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Use the global history file instead of the workspace one.
    #[arg(long)]
    global_history: bool,

    /// Clear saved history for the selected scope and exit.
    #[arg(long)]
    clear_history: bool,
}

/// Prints progress step transitions and the final answer to the terminal,
/// mirroring completed steps into the runtime log.
struct ConsoleObserver {
    seen: Mutex<Vec<String>>,
    log: Arc<Observer>,
}

impl ConsoleObserver {
    fn new(log: Arc<Observer>) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            log,
        }
    }

    fn print_step(&self, label: &str) {
        // In-flight thinking refreshes only update the elapsed time; showing
        // each one would flood the terminal.
        if label.starts_with("Thinking... (") {
            return;
        }
        if label == "Continuing..." {
            return;
        }
        println!("  {label}");
        if label.starts_with(['✓', '✗', '⏹', '⚠']) {
            let _ = self.log.record("STEP", label);
        }
    }
}

impl TurnObserver for ConsoleObserver {
    fn on_update(&self, update: TurnUpdate) {
        {
            let mut seen = match self.seen.lock() {
                Ok(seen) => seen,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (index, step) in update.progress.steps.iter().enumerate() {
                if seen.get(index).is_some_and(|label| label == &step.label) {
                    continue;
                }
                if index < seen.len() {
                    seen[index] = step.label.clone();
                } else {
                    seen.push(step.label.clone());
                }
                self.print_step(&step.label);
            }
            if update.is_final {
                seen.clear();
            }
        }
        if update.is_final && !update.text.trim().is_empty() {
            println!("\n{}", update.text);
        }
    }

    fn on_plan_ready(&self, _plan: &str) {
        // The plan is surfaced via the turn outcome; nothing to print here.
    }
}

/// Shows the rendered diff on stdout and asks for confirmation on stdin.
struct StdinApprover;

impl ChangeApprover for StdinApprover {
    fn review(&self, proposal: &ChangeProposal) -> Result<ApprovalDecision> {
        println!("\nProposed change to {}:", proposal.path);
        println!("{}", proposal.render_diff());
        if ask_yes_no("Apply these changes? [y/N] ")? {
            Ok(ApprovalDecision::Approved)
        } else {
            Ok(ApprovalDecision::Rejected)
        }
    }
}

fn ask_yes_no(question: &str) -> Result<bool> {
    print!("{question}");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn install_sigint_handler(cancel: &CancelFlag) -> Result<()> {
    #[cfg(unix)]
    {
        let flag = cancel.atomic();
        // A second Ctrl-C while the first is still pending aborts outright.
        signal_hook::flag::register_conditional_shutdown(
            signal_hook::consts::SIGINT,
            130,
            Arc::clone(&flag),
        )?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, flag)?;
    }
    #[cfg(not(unix))]
    {
        let _ = cancel;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let workspace = match &cli.workspace {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    let workspace = std::fs::canonicalize(&workspace).unwrap_or(workspace);

    let config = AppConfig::load(&workspace)?;
    let mut observer_log = Observer::new(&workspace)?;
    observer_log.set_verbose(cli.verbose);
    let observer_log = Arc::new(observer_log);

    let scope = if cli.global_history {
        HistoryScope::Global
    } else {
        HistoryScope::Workspace
    };
    let store = HistoryStore::open_default(&workspace)?;

    if cli.clear_history {
        store.clear(scope)?;
        println!("History cleared.");
        return Ok(());
    }

    let mode: TurnMode = cli.mode.parse()?;
    let model = cli.model.clone().unwrap_or_else(|| config.llm.model.clone());
    observer_log.verbose_log(&format!(
        "workspace {} model {model} mode {}",
        workspace.display(),
        mode.as_str()
    ));

    let llm = CohereClient::new(config.llm.clone())?;
    let approver: Arc<dyn ChangeApprover + Send + Sync> = if cli.yes {
        Arc::new(AutoApprover)
    } else {
        Arc::new(StdinApprover)
    };
    let tools = Arc::new(
        WorkspaceTools::new(&workspace, config.tools.clone(), approver)
            .context("setting up workspace tools")?,
    );

    let loop_config = TurnLoopConfig {
        model,
        max_iterations: config.agent.max_iterations,
        plan_filename: config.agent.plan_filename.clone(),
        result_preview_limit: config.tools.result_preview_limit,
        thinking_budget_tokens: config.llm.thinking_budget_tokens,
    };
    let console: Arc<ConsoleObserver> = Arc::new(ConsoleObserver::new(Arc::clone(&observer_log)));
    let cancel = CancelFlag::new();
    install_sigint_handler(&cancel)?;

    let mut turn = TurnLoop::new(&llm, tools, console, loop_config, cancel);
    turn.session_mut().set_history(&store.load(scope));

    match cli.prompt {
        Some(prompt) => run_one_turn(
            &mut turn,
            &prompt,
            mode,
            &workspace,
            &store,
            scope,
            observer_log.as_ref(),
            cli.yes,
        ),
        None => interactive_loop(
            &mut turn,
            mode,
            &workspace,
            &store,
            scope,
            observer_log.as_ref(),
            cli.yes,
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_one_turn(
    turn: &mut TurnLoop<'_>,
    prompt: &str,
    mode: TurnMode,
    workspace: &std::path::Path,
    store: &HistoryStore,
    scope: HistoryScope,
    observer_log: &Observer,
    auto_approve: bool,
) -> Result<()> {
    let resolved = resolve_mentions(prompt, workspace);
    let _ = observer_log.record("PROMPT", prompt);

    let outcome = turn.execute(&resolved, mode)?;
    store.save(scope, &turn.session().to_stored())?;

    match outcome {
        TurnOutcome::FinalText(_) => {
            let _ = observer_log.record("OUTCOME", "final");
        }
        TurnOutcome::Cancelled => {
            let _ = observer_log.record("OUTCOME", "cancelled");
        }
        TurnOutcome::IterationLimitReached => {
            let _ = observer_log.record("OUTCOME", "limit");
        }
        TurnOutcome::PlanCreated { path, content } => {
            let _ = observer_log.record("OUTCOME", &format!("plan {path}"));
            println!("\n--- Plan ({path}) ---\n{content}\n---");
            let approved = auto_approve || ask_yes_no("Execute this plan now? [y/N] ")?;
            if approved {
                turn.execute_plan(&content)?;
                store.save(scope, &turn.session().to_stored())?;
            } else {
                println!("Plan left in place for review.");
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn interactive_loop(
    turn: &mut TurnLoop<'_>,
    mode: TurnMode,
    workspace: &std::path::Path,
    store: &HistoryStore,
    scope: HistoryScope,
    observer_log: &Observer,
    auto_approve: bool,
) -> Result<()> {
    println!("cohere agent. /clear resets history, /exit quits.");
    let stdin = io::stdin();
    loop {
        print!("\n> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        match input {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                turn.session_mut().clear();
                store.clear(scope)?;
                println!("History cleared.");
            }
            prompt => {
                run_one_turn(
                    turn,
                    prompt,
                    mode,
                    workspace,
                    store,
                    scope,
                    observer_log,
                    auto_approve,
                )?;
            }
        }
    }
    Ok(())
}
