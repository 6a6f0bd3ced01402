//! Runtime environment detection.
//!
//! `OPSDECK_ENV` selects where configuration and credentials live:
//!
//! - `test` - unit/integration tests (file credentials, repo-local config dir)
//! - `system_test` - end-to-end runs against a test server (file credentials)
//! - `development` or `dev` - development server defaults
//! - anything else or unset - production

/// Runtime environment for opsdeck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Production environment (default).
    Production,
    /// Development environment.
    Development,
    /// Test environment.
    Test,
    /// End-to-end test environment driven by an external harness.
    SystemTest,
}

impl Environment {
    /// Detect current environment from `OPSDECK_ENV`.
    #[must_use]
    pub fn current() -> Self {
        Self::parse(std::env::var("OPSDECK_ENV").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some("test") => Self::Test,
            Some("system_test") => Self::SystemTest,
            Some("development" | "dev") => Self::Development,
            _ => Self::Production,
        }
    }

    /// Returns `true` for either test environment.
    #[must_use]
    pub fn is_any_test(self) -> bool {
        matches!(self, Self::Test | Self::SystemTest)
    }

    /// Default server URL for this environment.
    #[must_use]
    pub fn default_server_url(self) -> &'static str {
        match self {
            Self::Production => "https://app.opsdeck.dev",
            Self::Development | Self::Test | Self::SystemTest => "http://localhost:4000",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "production"),
            Self::Development => write!(f, "development"),
            Self::Test => write!(f, "test"),
            Self::SystemTest => write!(f, "system_test"),
        }
    }
}

/// Returns `true` if credentials must bypass the OS keyring.
///
/// Any test environment stores the token pair in a plain file under the
/// config directory instead.
#[must_use]
pub fn uses_file_credentials() -> bool {
    Environment::current().is_any_test()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_values() {
        assert_eq!(Environment::parse(Some("test")), Environment::Test);
        assert_eq!(Environment::parse(Some("system_test")), Environment::SystemTest);
        assert_eq!(Environment::parse(Some("dev")), Environment::Development);
        assert_eq!(Environment::parse(Some("development")), Environment::Development);
        assert_eq!(Environment::parse(Some("staging")), Environment::Production);
        assert_eq!(Environment::parse(None), Environment::Production);
    }

    #[test]
    fn test_is_any_test() {
        assert!(Environment::Test.is_any_test());
        assert!(Environment::SystemTest.is_any_test());
        assert!(!Environment::Production.is_any_test());
        assert!(!Environment::Development.is_any_test());
    }

    #[test]
    fn test_display_matches_env_values() {
        for env in [
            Environment::Production,
            Environment::Development,
            Environment::Test,
            Environment::SystemTest,
        ] {
            let shown = env.to_string();
            if env != Environment::Production {
                assert_eq!(Environment::parse(Some(&shown)), env);
            }
        }
    }
}
