//! Typed error taxonomy for failures that callers match on.
//!
//! Most fallible paths use `anyhow` with context strings; the variants here
//! exist for the cases where behavior depends on *which* error occurred
//! (configuration vs. setup vs. a phase of a particular project).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KbError {
    /// An option name was unknown, or its value had the wrong shape.
    ///
    /// The detail string is written so the config reader can prepend
    /// file and key context.
    #[error("invalid option {name}: {detail}")]
    BadOption { name: String, detail: String },

    /// A selector matched no declared project, no group, and no catalog entry.
    #[error("unknown project: {0}")]
    UnknownProject(String),

    /// Configuration file was syntactically or semantically invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Pre-build environment problems (lock held, missing programs, bad dirs).
    #[error("setup error: {0}")]
    Setup(String),

    /// The dependency graph could not be resolved.
    #[error("unable to resolve dependency graph: {0}")]
    DependencyResolution(String),

    /// A state that should be unreachable. Distinct from runtime errors so
    /// the top level can ask for a bug report instead of blaming the user.
    #[error("internal error: {0}")]
    Internal(String),
}

impl KbError {
    pub fn bad_option(name: impl Into<String>, detail: impl Into<String>) -> Self {
        KbError::BadOption {
            name: name.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_option_formats_name_and_detail() {
        let err = KbError::bad_option("num-cores", "expected an integer");
        assert_eq!(
            err.to_string(),
            "invalid option num-cores: expected an integer"
        );
    }

    #[test]
    fn unknown_project_names_the_selector() {
        let err = KbError::UnknownProject("kcalcc".to_string());
        assert!(err.to_string().contains("kcalcc"));
    }
}
