//! Command safety checks applied before a task is stored.
//!
//! This is a denylist, not a sandbox. It rejects the obvious destructive
//! commands and any shell syntax that could chain, substitute or redirect,
//! but it cannot prove a command harmless. Isolation comes from the pod
//! backend, never from this module.

use std::sync::LazyLock;

use regex::RegexSet;

/// Commands rejected when they appear as the whole command, its first word,
/// or a word with other words on both sides.
const DANGEROUS_COMMANDS: &[&str] = &[
    "rm",
    "rmdir",
    "del",
    "format",
    "mkfs",
    "dd",
    "fdisk",
    "parted",
    "kill",
    "killall",
    "pkill",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "chmod",
    "chown",
    "chgrp",
    "wget",
    "curl",
    "nc",
    "netcat",
    "iptables",
    "ufw",
    "firewall-cmd",
    "useradd",
    "userdel",
    "passwd",
    "su",
    "sudo",
    "crontab",
    "systemctl",
    "service",
];

/// Shell syntax rejected anywhere in the raw command text.
const DANGEROUS_PATTERNS: &[&str] = &[
    // chaining and injection
    r"[;&|`$]",
    // command substitution
    r"\$\(.*\)",
    // process substitution
    r"<\(.*\)",
    // redirection
    r">",
    r"\|",
    // escapes
    r"\\",
    // directory traversal
    r"\.\./",
];

static PATTERN_SET: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new(DANGEROUS_PATTERNS).expect("static command patterns are valid regexes")
});

pub const EMPTY_COMMAND_ERROR: &str = "Command cannot be empty";

pub const UNSAFE_COMMAND_ERROR: &str = "Command contains unsafe or malicious code. \
     Prohibited: dangerous commands (rm, sudo, etc.), \
     command chaining (;, |, &), redirections (>, <), \
     command substitution ($(), ``), and directory traversal (..)";

/// Outcome of checking a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Safe,
    Unsafe(String),
}

impl Validation {
    pub fn is_safe(&self) -> bool {
        matches!(self, Validation::Safe)
    }
}

/// Check a command against the denylist and the shell syntax patterns.
pub fn check(command: &str) -> Validation {
    if command.trim().is_empty() {
        return Validation::Unsafe(EMPTY_COMMAND_ERROR.to_string());
    }
    if uses_dangerous_command(command) || PATTERN_SET.is_match(command) {
        return Validation::Unsafe(UNSAFE_COMMAND_ERROR.to_string());
    }
    Validation::Safe
}

pub fn is_command_safe(command: &str) -> bool {
    check(command).is_safe()
}

/// Returns the message to show the caller, or `None` if the command is safe.
pub fn validation_error(command: &str) -> Option<String> {
    match check(command) {
        Validation::Safe => None,
        Validation::Unsafe(reason) => Some(reason),
    }
}

/// The first word, or any word with words on both sides, is denylisted.
///
/// Words are split on any whitespace, so tabs and newlines separate them
/// the same way spaces do.
fn uses_dangerous_command(command: &str) -> bool {
    let lower = command.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let is_denied = |word: &&str| DANGEROUS_COMMANDS.contains(word);
    match words.as_slice() {
        [] => false,
        [first, rest @ ..] => {
            is_denied(first)
                || rest
                    .split_last()
                    .is_some_and(|(_, middle)| middle.iter().any(is_denied))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_commands() {
        assert!(is_command_safe("echo hello"));
        assert!(is_command_safe("ls -la /tmp"));
        assert!(is_command_safe("date"));
        assert!(is_command_safe("uname -a"));
    }

    #[test]
    fn rejects_empty_and_blank_commands() {
        assert_eq!(
            check(""),
            Validation::Unsafe(EMPTY_COMMAND_ERROR.to_string())
        );
        assert_eq!(
            validation_error("   \t "),
            Some(EMPTY_COMMAND_ERROR.to_string())
        );
    }

    #[test]
    fn rejects_denylisted_first_word_case_insensitively() {
        for cmd in ["rm -rf /", "RM -rf /", "Sudo ls", "curl example.com", "kill 1"] {
            assert!(!is_command_safe(cmd), "{} should be rejected", cmd);
        }
    }

    #[test]
    fn tabs_and_newlines_separate_words() {
        for cmd in [
            "rm\t-rf /",
            "sudo\tls",
            "shutdown\t-h now",
            "kill\n1",
            "echo\tsudo\tls",
            "echo a\nrm b",
        ] {
            assert!(!is_command_safe(cmd), "{:?} should be rejected", cmd);
        }
    }

    #[test]
    fn rejects_bare_denylisted_command() {
        assert!(!is_command_safe("reboot"));
        assert!(!is_command_safe("  SHUTDOWN  "));
    }

    #[test]
    fn rejects_denylisted_word_in_the_middle() {
        assert!(!is_command_safe("echo rm me"));
        assert!(!is_command_safe("nice sudo whoami"));
    }

    #[test]
    fn denylist_matches_whole_words_only() {
        // "rmdir_list" and "format-check" are not denylisted words.
        assert!(is_command_safe("echo rmdir_list"));
        assert!(is_command_safe("format-check file.txt"));
        // Trailing word without a following space is not a middle match.
        assert!(is_command_safe("echo rm"));
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for cmd in [
            "echo a; echo b",
            "echo a & echo b",
            "echo a && echo b",
            "ls | grep x",
            "echo `whoami`",
            "echo $HOME",
            "echo $(whoami)",
            "diff <(ls) <(ls)",
            "echo hi > out.txt",
            "echo a\\nb",
            "cat ../secret",
        ] {
            assert!(!is_command_safe(cmd), "{} should be rejected", cmd);
        }
    }

    #[test]
    fn metacharacters_on_later_lines_are_rejected() {
        assert!(!is_command_safe("echo a\necho $HOME"));
    }

    #[test]
    fn unsafe_message_names_categories_not_rules() {
        let msg = validation_error("ls | wc").expect("unsafe");
        assert_eq!(msg, UNSAFE_COMMAND_ERROR);
        assert_eq!(validation_error("sudo ls"), Some(msg));
    }

    #[test]
    fn safe_command_has_no_error() {
        assert_eq!(validation_error("echo hello"), None);
    }
}
