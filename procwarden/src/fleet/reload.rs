//! Diffing of configuration documents for hot reload.
//!
//! Reload compares the old and new documents by declaration fingerprint and
//! produces the three sets the fleet manager applies: added, removed and
//! materially changed. Dependents of a changed process are only dragged into
//! the restart when the dependency's externally visible contract (the
//! endpoint its health check gates on) changed.

use crate::config::fingerprint::Fingerprint;
use crate::config::process::ProcessConfig;
use crate::config::process_name::ProcessName;
use crate::config::FleetConfig;
use crate::plan::Plan;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReloadDiff {
    pub added: Vec<ProcessName>,
    pub removed: Vec<ProcessName>,
    pub changed: Vec<ProcessName>,
}

impl ReloadDiff {
    pub fn compute(old: &FleetConfig, new: &FleetConfig) -> Self {
        let mut diff = ReloadDiff::default();

        for (name, new_process) in new.enabled_processes() {
            match old
                .enabled_processes()
                .find(|(old_name, _)| *old_name == name)
            {
                None => diff.added.push(name.clone()),
                Some((_, old_process)) => {
                    if Fingerprint::of(old_process) != Fingerprint::of(new_process) {
                        diff.changed.push(name.clone());
                    }
                }
            }
        }

        for (name, _) in old.enabled_processes() {
            if !new.enabled_processes().any(|(new_name, _)| new_name == name) {
                diff.removed.push(name.clone());
            }
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Whether the endpoint dependents gate their readiness on changed.
pub fn contract_changed(old: &ProcessConfig, new: &ProcessConfig) -> bool {
    let old_probe = old.health_check.as_ref().map(|check| &check.probe);
    let new_probe = new.health_check.as_ref().map(|check| &check.probe);
    old_probe != new_probe
}

/// Dependents that must restart alongside the changed set: those whose
/// dependency's contract changed, transitively. Dependents already in the
/// changed set are not repeated.
pub fn dependents_to_restart(
    old: &FleetConfig,
    new: &FleetConfig,
    new_plan: &Plan,
    diff: &ReloadDiff,
) -> Vec<ProcessName> {
    let changed: HashSet<&ProcessName> = diff.changed.iter().collect();

    let mut pending: Vec<ProcessName> = diff
        .changed
        .iter()
        .filter(|name| {
            let Some(old_process) = old.processes.get(*name) else {
                return false;
            };
            let Some(new_process) = new.processes.get(*name) else {
                return false;
            };
            contract_changed(old_process, new_process)
        })
        .cloned()
        .collect();

    let mut to_restart: Vec<ProcessName> = Vec::new();
    let mut visited: HashSet<ProcessName> = HashSet::new();
    while let Some(name) = pending.pop() {
        for dependent in new_plan.dependents_of(&name) {
            if visited.insert(dependent.clone()) {
                if !changed.contains(dependent) {
                    to_restart.push(dependent.clone());
                }
                // a restart interrupts the dependent's own contract as well
                pending.push(dependent.clone());
            }
        }
    }

    to_restart
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;

    fn load(yaml: &str) -> FleetConfig {
        ConfigLoader::new(true).load_from_str(yaml).unwrap()
    }

    const BASE: &str = r#"
version: "1"
processes:
  a:
    command: ["/bin/a"]
    health_check:
      tcp: { port: 4100 }
  b:
    command: ["/bin/b"]
    depends_on: [a]
"#;

    #[test]
    fn identical_documents_diff_empty() {
        let old = load(BASE);
        let new = load(BASE);
        assert!(ReloadDiff::compute(&old, &new).is_empty());
    }

    #[test]
    fn added_removed_changed_are_separated() {
        let old = load(BASE);
        let new = load(
            r#"
version: "1"
processes:
  a:
    command: ["/bin/a", "--verbose"]
    health_check:
      tcp: { port: 4100 }
  c:
    command: ["/bin/c"]
"#,
        );

        let diff = ReloadDiff::compute(&old, &new);
        assert_eq!(diff.changed, vec![ProcessName::must("a")]);
        assert_eq!(diff.added, vec![ProcessName::must("c")]);
        assert_eq!(diff.removed, vec![ProcessName::must("b")]);
    }

    #[test]
    fn disabling_a_process_counts_as_removal() {
        let old = load(
            r#"
version: "1"
processes:
  a: { command: ["/bin/a"] }
"#,
        );
        let new = load(
            r#"
version: "1"
processes:
  a: { enabled: false, command: ["/bin/a"] }
"#,
        );

        let diff = ReloadDiff::compute(&old, &new);
        assert_eq!(diff.removed, vec![ProcessName::must("a")]);
        assert!(diff.added.is_empty());
    }

    #[test]
    fn command_change_does_not_drag_dependents() {
        let old = load(BASE);
        // only a's argv changes; the probe endpoint stays
        let new = load(
            r#"
version: "1"
processes:
  a:
    command: ["/bin/a", "--tuned"]
    health_check:
      tcp: { port: 4100 }
  b:
    command: ["/bin/b"]
    depends_on: [a]
"#,
        );

        let diff = ReloadDiff::compute(&old, &new);
        assert_eq!(diff.changed, vec![ProcessName::must("a")]);

        let plan = Plan::try_new(&new).unwrap();
        assert!(dependents_to_restart(&old, &new, &plan, &diff).is_empty());
    }

    #[test]
    fn endpoint_change_drags_dependents() {
        let old = load(BASE);
        // the listening port moves; b gates on it
        let new = load(
            r#"
version: "1"
processes:
  a:
    command: ["/bin/a"]
    health_check:
      tcp: { port: 4200 }
  b:
    command: ["/bin/b"]
    depends_on: [a]
"#,
        );

        let diff = ReloadDiff::compute(&old, &new);
        assert_eq!(diff.changed, vec![ProcessName::must("a")]);

        let plan = Plan::try_new(&new).unwrap();
        assert_eq!(
            dependents_to_restart(&old, &new, &plan, &diff),
            vec![ProcessName::must("b")]
        );
    }

    #[test]
    fn contract_comparison_ignores_schedule_tweaks() {
        let with_schedule = |interval: &str| -> ProcessConfig {
            serde_yaml::from_str(&format!(
                r#"
command: ["/bin/a"]
health_check:
  interval: {interval}
  tcp: {{ port: 4100 }}
"#
            ))
            .unwrap()
        };

        let old = with_schedule("5s");
        let new = with_schedule("10s");
        assert!(!contract_changed(&old, &new));
    }
}
