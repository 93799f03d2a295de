//! Shared utility functions used across the codebase.

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Return the value of `$HOME`, falling back to `/root`.
pub fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/root".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "TRUE", " yes ", "y", "On"] {
            assert!(parse_bool(value), "{value}");
        }
    }

    #[test]
    fn everything_else_is_false() {
        for value in ["0", "false", "no", "", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }

    #[test]
    fn unset_variable_uses_default() {
        assert!(env_var_bool("TASK_RUNNER_TEST_UNSET_FLAG_91827", true));
        assert!(!env_var_bool("TASK_RUNNER_TEST_UNSET_FLAG_91827", false));
    }
}
