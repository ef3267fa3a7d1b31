use std::str::FromStr;

use thiserror::Error;

/// An environment variable required by the application is not set.
#[derive(Debug, Error)]
#[error("Missing environment variable: {0}")]
pub struct MissingEnvVarError(pub String);

/// An environment variable is set but cannot be parsed into the expected type.
#[derive(Debug, Error)]
#[error("Invalid value for environment variable {name}: {value:?}")]
pub struct InvalidEnvVarError {
    /// Name of the variable.
    pub name: String,
    /// Raw value found in the environment.
    pub value: String,
}

/// Reads an environment variable, returning a structured error if it's missing.
///
/// This is a thin wrapper around `std::env::var` that provides a more
/// ergonomic and specific error type for missing variables.
///
/// # Arguments
/// * `name` - The name of the environment variable to read.
pub fn get_env_var(name: &str) -> Result<String, MissingEnvVarError> {
    std::env::var(name).map_err(|_| MissingEnvVarError(name.to_string()))
}

/// Reads an optional environment variable and parses it.
///
/// Unset (or empty) variables yield `Ok(None)`; a set variable that does not
/// parse yields an [`InvalidEnvVarError`].
pub fn parse_env_var<T: FromStr>(name: &str) -> Result<Option<T>, InvalidEnvVarError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| InvalidEnvVarError {
                    name: name.to_string(),
                    value: raw,
                })
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_is_reported_by_name() {
        let err = get_env_var("SHARED_UTILS_SURELY_UNSET_VAR").unwrap_err();
        assert_eq!(err.0, "SHARED_UTILS_SURELY_UNSET_VAR");
        assert!(err.to_string().contains("SHARED_UTILS_SURELY_UNSET_VAR"));
    }

    #[test]
    fn unset_optional_variable_parses_to_none() {
        let v: Option<u32> = parse_env_var("SHARED_UTILS_SURELY_UNSET_VAR").unwrap();
        assert!(v.is_none());
    }
}
