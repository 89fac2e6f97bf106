use regex::{Captures, Regex};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum EnvExpandError {
    #[error("environment variable `{0}` is not set and has no default")]
    UnsetVariable(String),
}

/// Expands `${NAME}` and `${NAME:-default}` references in the raw document
/// before it is deserialized. A reference to an unset variable without a
/// default is an error.
pub fn expand_env_vars(raw: &str) -> Result<String, EnvExpandError> {
    expand_with(raw, |name| std::env::var(name).ok())
}

fn expand_with<F>(raw: &str, lookup: F) -> Result<String, EnvExpandError>
where
    F: Fn(&str) -> Option<String>,
{
    let reference = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .expect("the reference pattern is valid");

    let mut unset: Option<String> = None;
    let expanded = reference.replace_all(raw, |caps: &Captures| {
        let name = &caps[1];
        match lookup(name) {
            Some(value) => value,
            None => match caps.get(3) {
                Some(default) => default.as_str().to_string(),
                None => {
                    unset.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            },
        }
    });

    match unset {
        Some(name) => Err(EnvExpandError::UnsetVariable(name)),
        None => Ok(expanded.into_owned()),
    }
}
