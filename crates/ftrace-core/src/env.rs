//! Environment variable parsing helpers

use std::str::FromStr;

/// Parse an environment variable as `T`, falling back to `default` when
/// unset or unparseable.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse an environment variable as `T`; `None` when unset or unparseable.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// An environment variable used as a flag: set at all means enabled.
#[inline]
pub fn env_flag(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

/// The raw string value, if set.
#[inline]
pub fn env_get_str(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: usize = env_get("__FTRACE_TEST_UNSET__", 17);
        assert_eq!(v, 17);
    }

    #[test]
    fn test_env_get_parsed() {
        std::env::set_var("__FTRACE_TEST_NUM__", "4096");
        let v: usize = env_get("__FTRACE_TEST_NUM__", 0);
        assert_eq!(v, 4096);
        std::env::remove_var("__FTRACE_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bad_parse() {
        std::env::set_var("__FTRACE_TEST_BAD__", "not-a-number");
        let v: u64 = env_get("__FTRACE_TEST_BAD__", 9);
        assert_eq!(v, 9);
        std::env::remove_var("__FTRACE_TEST_BAD__");
    }

    #[test]
    fn test_env_flag() {
        assert!(!env_flag("__FTRACE_TEST_FLAG__"));
        std::env::set_var("__FTRACE_TEST_FLAG__", "");
        assert!(env_flag("__FTRACE_TEST_FLAG__"));
        std::env::remove_var("__FTRACE_TEST_FLAG__");
    }

    #[test]
    fn test_env_get_opt() {
        let v: Option<u32> = env_get_opt("__FTRACE_TEST_UNSET__");
        assert!(v.is_none());
    }
}
