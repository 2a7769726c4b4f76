//! Environment variable loading with type conversion and validation.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use super::{ConfigError, ConfigResult};

/// Environment variable loader with type conversion and validation
pub struct EnvLoader;

impl EnvLoader {
    /// Load a required environment variable
    pub fn load_required<T>(key: &str) -> ConfigResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = env::var(key).map_err(|_| ConfigError::MissingEnvVar {
            var_name: key.to_string(),
        })?;

        value.parse().map_err(|_| ConfigError::InvalidEnvVar {
            var_name: key.to_string(),
            value,
        })
    }

    /// Load an optional environment variable with a default value
    pub fn load_with_default<T>(key: &str, default: T) -> ConfigResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(key) {
            Ok(value) => value.parse().map_err(|_| ConfigError::InvalidEnvVar {
                var_name: key.to_string(),
                value,
            }),
            Err(_) => Ok(default),
        }
    }

    /// Load an optional environment variable
    pub fn load_optional<T>(key: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(key) {
            Ok(value) if value.trim().is_empty() => Ok(None),
            Ok(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidEnvVar {
                    var_name: key.to_string(),
                    value,
                }),
            Err(_) => Ok(None),
        }
    }

    /// Load a duration expressed in seconds
    pub fn load_duration_seconds(key: &str, default_seconds: u64) -> ConfigResult<Duration> {
        let seconds: u64 = Self::load_with_default(key, default_seconds)?;
        Ok(Duration::from_secs(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn required_missing_reports_var_name() {
        env::remove_var("EC_TEST_REQUIRED");
        let result: ConfigResult<String> = EnvLoader::load_required("EC_TEST_REQUIRED");
        match result {
            Err(ConfigError::MissingEnvVar { var_name }) => {
                assert_eq!(var_name, "EC_TEST_REQUIRED")
            }
            other => panic!("expected MissingEnvVar, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn default_applies_when_unset() {
        env::remove_var("EC_TEST_DEFAULT");
        let value: u32 = EnvLoader::load_with_default("EC_TEST_DEFAULT", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    #[serial]
    fn invalid_value_reports_both_name_and_value() {
        env::set_var("EC_TEST_INVALID", "not-a-number");
        let result: ConfigResult<u32> = EnvLoader::load_with_default("EC_TEST_INVALID", 1);
        match result {
            Err(ConfigError::InvalidEnvVar { var_name, value }) => {
                assert_eq!(var_name, "EC_TEST_INVALID");
                assert_eq!(value, "not-a-number");
            }
            other => panic!("expected InvalidEnvVar, got {:?}", other),
        }
        env::remove_var("EC_TEST_INVALID");
    }

    #[test]
    #[serial]
    fn optional_blank_is_none() {
        env::set_var("EC_TEST_BLANK", "  ");
        let value: Option<String> = EnvLoader::load_optional("EC_TEST_BLANK").unwrap();
        assert!(value.is_none());
        env::remove_var("EC_TEST_BLANK");
    }

    #[test]
    #[serial]
    fn duration_seconds_parses() {
        env::set_var("EC_TEST_DURATION", "30");
        let duration = EnvLoader::load_duration_seconds("EC_TEST_DURATION", 5).unwrap();
        assert_eq!(duration, Duration::from_secs(30));
        env::remove_var("EC_TEST_DURATION");
    }
}
