use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;
use thiserror::Error;

const PROCESS_NAME_MAX_LENGTH: usize = 64;

/// ProcessName identifies a declared process. It must contain 64 characters
/// at most and only ASCII alphanumerics, dashes and underscores.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Hash, PartialOrd, Ord)]
#[serde(try_from = "String")]
pub struct ProcessName(String);

#[derive(Error, Debug, PartialEq)]
pub enum ProcessNameError {
    #[error(
        "process name must contain {PROCESS_NAME_MAX_LENGTH} characters at most and only alphanumeric characters, dashes and underscores"
    )]
    InvalidFormat,
}

impl ProcessName {
    pub fn new(s: &str) -> Result<Self, ProcessNameError> {
        Self::try_from(s.to_string())
    }

    pub fn get(&self) -> String {
        String::from(&self.0)
    }

    fn is_valid_format(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= PROCESS_NAME_MAX_LENGTH
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl TryFrom<String> for ProcessName {
    type Error = ProcessNameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if ProcessName::is_valid_format(&s) {
            Ok(ProcessName(s))
        } else {
            Err(ProcessNameError::InvalidFormat)
        }
    }
}

impl Deref for ProcessName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for ProcessName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for ProcessName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_str())
    }
}
