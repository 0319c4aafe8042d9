//! Predefined sub-agent specializations.
//!
//! Each kind runs with its own system prompt and a restricted subset of
//! the registered tool schemas, and never shares the main running history.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAgentKind {
    Coder,
    Researcher,
    Shell,
}

impl SubAgentKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "coder" => Some(Self::Coder),
            "researcher" => Some(Self::Researcher),
            "shell" => Some(Self::Shell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Researcher => "researcher",
            Self::Shell => "shell",
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::Coder => {
                "You are a focused coding sub-agent. Complete the assigned \
                 implementation task using file tools, then summarize the \
                 changes you made. Do not ask questions; state assumptions."
            }
            Self::Researcher => {
                "You are a read-only research sub-agent. Gather the requested \
                 information from the workspace and report findings with file \
                 references. Never modify anything."
            }
            Self::Shell => {
                "You are a command-execution sub-agent. Run the commands \
                 needed for the assigned task and report their output \
                 concisely."
            }
        }
    }

    /// Tool-name filter applied to the full schema list.
    pub fn allows_tool(&self, name: &str) -> bool {
        match self {
            Self::Coder => matches!(
                name,
                "read_file"
                    | "write_file"
                    | "edit_file"
                    | "list_directory"
                    | "find_files"
                    | "search_code"
            ),
            Self::Researcher => matches!(
                name,
                "read_file" | "list_directory" | "find_files" | "search_code" | "web_fetch"
            ),
            Self::Shell => matches!(name, "run_command" | "list_directory"),
        }
    }
}
