//! Dangerous-command deny-list for shell tool collaborators.
//!
//! The registration contract for shell tools: the command line arrives in a
//! `command` string argument under one of [`SHELL_TOOL_NAMES`]. The guard
//! applies before the approval gate and cannot be bypassed by any approval
//! mode.

use regex::Regex;
use std::sync::OnceLock;

/// Tool names the executor treats as shell runners.
pub const SHELL_TOOL_NAMES: &[&str] = &["run_command", "shell", "bash", "execute_command"];

const PATTERNS: &[(&str, &str)] = &[
    (r"\brm\s+-[a-zA-Z]*r[a-zA-Z]*\s+/(\s|$)", "recursive delete of the filesystem root"),
    (r"(^|[;&|]\s*)sudo\b", "privilege escalation via sudo"),
    (r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem creation"),
    (r"\bdd\s+if=", "raw device write via dd"),
    (r"\bshutdown\b", "system shutdown"),
];

fn compiled() -> &'static Vec<(Regex, &'static str)> {
    static COMPILED: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        PATTERNS
            .iter()
            .map(|(pattern, reason)| (Regex::new(pattern).expect("valid guard regex"), *reason))
            .collect()
    })
}

/// Returns the rejection reason when a command matches the deny-list.
pub fn check_command_guard(command: &str) -> Option<&'static str> {
    let trimmed = command.trim();
    compiled()
        .iter()
        .find(|(regex, _)| regex.is_match(trimmed))
        .map(|(_, reason)| *reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_the_known_destructive_shapes() {
        assert!(check_command_guard("rm -rf /").is_some());
        assert!(check_command_guard("rm -fr / --no-preserve-root").is_some());
        assert!(check_command_guard("sudo rm file").is_some());
        assert!(check_command_guard("echo hi; sudo su").is_some());
        assert!(check_command_guard("mkfs.ext4 /dev/sda1").is_some());
        assert!(check_command_guard("dd if=/dev/zero of=/dev/sda").is_some());
        assert!(check_command_guard("shutdown -h now").is_some());
    }

    #[test]
    fn allows_ordinary_development_commands() {
        for command in [
            "cargo test",
            "git status",
            "rm -rf target",
            "rm build/output.txt",
            "grep -r shutdown_hook src/",
            "echo dd-report.txt",
        ] {
            assert!(
                check_command_guard(command).is_none(),
                "guard must allow: {command}"
            );
        }
    }
}
