//! Conversation state for one session: the system prompt plus the running
//! message list the turn loop appends to.

use cohere_core::{ChatMessage, StoredMessage, TurnMode};

/// Base system message for every turn.
const SYSTEM_PROMPT: &str = "\
You are a coding agent working inside the user's workspace. You have tools \
for reading, writing, editing and deleting files, listing and creating \
directories, running shell commands, and searching file contents. Ground \
every answer in tool output: read files before describing them and verify \
changes after making them. All paths are relative to the workspace root. \
Keep responses concise and concrete. Never invent file contents.";

/// Prepended to the prompt in Planning mode.
const PLANNING_DIRECTIVE: &str = "\
You are in PLANNING mode. Investigate the workspace with read-only tools, \
then write a complete technical implementation plan to a file named \
`planning.md` using the writeFile tool. Do not create, modify, or delete any \
other file. Stop after the plan file is written.";

/// Prepended to the prompt in Research mode.
const RESEARCH_DIRECTIVE: &str = "\
You are in RESEARCH mode. Investigate the workspace using read-only tools \
(readFile, listDirectory, searchFiles). Do not create, modify, or delete any \
file and do not run commands that change state. Answer with your findings.";

/// Rewrite the user's prompt for the active mode. Execution passes through.
pub fn effective_prompt(mode: TurnMode, prompt: &str) -> String {
    match mode {
        TurnMode::Planning => format!("{PLANNING_DIRECTIVE}\n\n{prompt}"),
        TurnMode::Research => format!("{RESEARCH_DIRECTIVE}\n\n{prompt}"),
        TurnMode::Execution => prompt.to_string(),
    }
}

/// Prompt synthesized when the user approves a plan for execution.
pub fn plan_approval_prompt(plan: &str) -> String {
    format!(
        "I approve this plan. Switch to EXECUTION mode and follow the plan \
         step-by-step using the provided tools. Proceed with execution:\n\n\
         # Implementation Plan\n{plan}"
    )
}

#[derive(Debug)]
pub struct SessionState {
    messages: Vec<ChatMessage>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            messages: vec![ChatMessage::System {
                content: SYSTEM_PROMPT.to_string(),
            }],
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.messages.push(ChatMessage::System {
            content: SYSTEM_PROMPT.to_string(),
        });
    }

    /// Rebuild the message list from persisted history. The system message is
    /// always (re)prepended; `bot` maps to the assistant role; empty user
    /// messages are dropped; empty assistant content becomes a single space.
    pub fn set_history(&mut self, stored: &[StoredMessage]) {
        self.clear();
        for message in stored {
            match message.role.as_str() {
                "user" => {
                    if message.content.trim().is_empty() {
                        continue;
                    }
                    self.messages.push(ChatMessage::User {
                        content: message.content.clone(),
                    });
                }
                "bot" | "assistant" => {
                    let content = if message.content.is_empty() {
                        " ".to_string()
                    } else {
                        message.content.clone()
                    };
                    self.messages.push(ChatMessage::Assistant {
                        content: Some(content),
                        tool_plan: None,
                        tool_calls: Vec::new(),
                    });
                }
                _ => {}
            }
        }
    }

    /// Plain transcript for persistence. Tool traffic and the system message
    /// are session-internal and not stored.
    pub fn to_stored(&self) -> Vec<StoredMessage> {
        self.messages
            .iter()
            .filter_map(|message| match message {
                ChatMessage::User { content } => Some(StoredMessage {
                    role: "user".to_string(),
                    content: content.clone(),
                }),
                ChatMessage::Assistant { content, .. } => Some(StoredMessage {
                    role: "bot".to_string(),
                    content: content.clone().unwrap_or_default(),
                }),
                _ => None,
            })
            .collect()
    }
}
