use indexmap::IndexMap;
use std::path::PathBuf;

/// Everything needed to spawn one child: argv, environment and working
/// directory. Assembled by the supervisor from the process declaration plus
/// the per-instance variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutableData {
    pub bin: String,
    pub args: Vec<String>,
    pub env: IndexMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ExecutableData {
    /// Builds from an argv vector. The vector must be non-empty; the config
    /// loader rejects empty commands before this point.
    pub fn from_argv(command: &[String]) -> Self {
        let (bin, args) = command
            .split_first()
            .map(|(bin, args)| (bin.clone(), args.to_vec()))
            .unwrap_or_default();
        Self {
            bin,
            args,
            env: IndexMap::new(),
            working_dir: None,
        }
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_working_dir(mut self, working_dir: Option<PathBuf>) -> Self {
        self.working_dir = working_dir;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_argv() {
        let data = ExecutableData::from_argv(&[
            "/bin/sh".to_string(),
            "-c".to_string(),
            "exit 0".to_string(),
        ]);
        assert_eq!(data.bin, "/bin/sh");
        assert_eq!(data.args, vec!["-c", "exit 0"]);
    }

    #[test]
    fn later_env_entries_override() {
        let data = ExecutableData::from_argv(&["/bin/true".to_string()])
            .with_env([("A".to_string(), "1".to_string())])
            .with_env([("A".to_string(), "2".to_string())]);
        assert_eq!(data.env["A"], "2");
    }
}
