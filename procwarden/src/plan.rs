//! Topological planning of the start order.
//!
//! Kahn-style reduction producing wave numbers: wave n contains every process
//! whose dependencies all live in earlier waves. Ties within a wave keep the
//! declaration order, which keeps logs and start sequences deterministic.

use crate::config::process_name::ProcessName;
use crate::config::FleetConfig;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum PlanError {
    #[error("dependency cycle involving: {0}")]
    Cycle(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    waves: Vec<Vec<ProcessName>>,
    wave_of: HashMap<ProcessName, usize>,
    dependents: HashMap<ProcessName, Vec<ProcessName>>,
}

impl Plan {
    /// Plans the enabled processes of `config`. Rejects cycles before
    /// anything starts.
    pub fn try_new(config: &FleetConfig) -> Result<Self, PlanError> {
        let declared: Vec<ProcessName> = config
            .enabled_processes()
            .map(|(name, _)| name.clone())
            .collect();

        let mut dependencies: HashMap<ProcessName, Vec<ProcessName>> = HashMap::new();
        let mut dependents: HashMap<ProcessName, Vec<ProcessName>> = HashMap::new();
        for (name, process) in config.enabled_processes() {
            let mut deps = process.depends_on.clone();
            deps.dedup();
            for dep in &deps {
                dependents.entry(dep.clone()).or_default().push(name.clone());
            }
            dependencies.insert(name.clone(), deps);
        }

        let mut waves: Vec<Vec<ProcessName>> = Vec::new();
        let mut wave_of: HashMap<ProcessName, usize> = HashMap::new();

        while wave_of.len() < declared.len() {
            let wave: Vec<ProcessName> = declared
                .iter()
                .filter(|name| !wave_of.contains_key(*name))
                .filter(|name| {
                    dependencies[*name]
                        .iter()
                        .all(|dep| wave_of.contains_key(dep))
                })
                .cloned()
                .collect();

            if wave.is_empty() {
                let stuck: Vec<String> = declared
                    .iter()
                    .filter(|name| !wave_of.contains_key(*name))
                    .map(|name| name.get())
                    .collect();
                return Err(PlanError::Cycle(stuck.join(", ")));
            }

            let wave_number = waves.len();
            for name in &wave {
                wave_of.insert(name.clone(), wave_number);
            }
            waves.push(wave);
        }

        Ok(Self {
            waves,
            wave_of,
            dependents,
        })
    }

    pub fn waves(&self) -> &[Vec<ProcessName>] {
        &self.waves
    }

    /// Stop order: the waves reversed.
    pub fn reverse_waves(&self) -> Vec<Vec<ProcessName>> {
        self.waves.iter().rev().cloned().collect()
    }

    pub fn wave_of(&self, name: &ProcessName) -> Option<usize> {
        self.wave_of.get(name).copied()
    }

    /// Direct dependents of `name` (processes declaring an edge to it).
    pub fn dependents_of(&self, name: &ProcessName) -> &[ProcessName] {
        self.dependents
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;
    use assert_matches::assert_matches;

    fn plan(yaml: &str) -> Result<Plan, PlanError> {
        let config = ConfigLoader::new(true).load_from_str(yaml).unwrap();
        Plan::try_new(&config)
    }

    #[test]
    fn independent_processes_share_the_first_wave() {
        let plan = plan(
            r#"
version: "1"
processes:
  a: { command: ["/bin/true"] }
  b: { command: ["/bin/true"] }
"#,
        )
        .unwrap();

        assert_eq!(plan.waves().len(), 1);
        let names: Vec<_> = plan.waves()[0].iter().map(|n| n.get()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn chain_produces_one_wave_per_link() {
        let plan = plan(
            r#"
version: "1"
processes:
  c: { command: ["/bin/true"], depends_on: [b] }
  b: { command: ["/bin/true"], depends_on: [a] }
  a: { command: ["/bin/true"] }
"#,
        )
        .unwrap();

        assert_eq!(plan.waves().len(), 3);
        assert_eq!(plan.wave_of(&ProcessName::must("a")), Some(0));
        assert_eq!(plan.wave_of(&ProcessName::must("b")), Some(1));
        assert_eq!(plan.wave_of(&ProcessName::must("c")), Some(2));
    }

    #[test]
    fn diamond_respects_every_edge() {
        let plan = plan(
            r#"
version: "1"
processes:
  db: { command: ["/bin/true"] }
  cache: { command: ["/bin/true"] }
  api: { command: ["/bin/true"], depends_on: [db, cache] }
  web: { command: ["/bin/true"], depends_on: [api] }
"#,
        )
        .unwrap();

        // every edge points to an earlier wave
        let config = ConfigLoader::new(true)
            .load_from_str(
                r#"
version: "1"
processes:
  db: { command: ["/bin/true"] }
  cache: { command: ["/bin/true"] }
  api: { command: ["/bin/true"], depends_on: [db, cache] }
  web: { command: ["/bin/true"], depends_on: [api] }
"#,
            )
            .unwrap();
        for (name, process) in config.enabled_processes() {
            for dep in &process.depends_on {
                assert!(plan.wave_of(dep).unwrap() < plan.wave_of(name).unwrap());
            }
        }

        assert_eq!(plan.waves().len(), 3);
    }

    #[test]
    fn two_node_cycle_is_rejected() {
        let err = plan(
            r#"
version: "1"
processes:
  x: { command: ["/bin/true"], depends_on: [y] }
  y: { command: ["/bin/true"], depends_on: [x] }
"#,
        )
        .unwrap_err();

        assert_matches!(err, PlanError::Cycle(members) => {
            assert!(members.contains('x'));
            assert!(members.contains('y'));
        });
    }

    #[test]
    fn larger_cycle_behind_valid_nodes_is_rejected() {
        let err = plan(
            r#"
version: "1"
processes:
  ok: { command: ["/bin/true"] }
  a: { command: ["/bin/true"], depends_on: [c] }
  b: { command: ["/bin/true"], depends_on: [a] }
  c: { command: ["/bin/true"], depends_on: [b] }
"#,
        )
        .unwrap_err();

        assert_matches!(err, PlanError::Cycle(members) => {
            assert!(!members.contains("ok"));
        });
    }

    #[test]
    fn disabled_processes_are_not_planned() {
        let plan = plan(
            r#"
version: "1"
processes:
  a: { command: ["/bin/true"] }
  ghost: { enabled: false, command: ["/bin/true"] }
"#,
        )
        .unwrap();

        assert_eq!(plan.waves().len(), 1);
        assert_eq!(plan.wave_of(&ProcessName::must("ghost")), None);
    }

    #[test]
    fn reverse_waves_invert_the_order() {
        let plan = plan(
            r#"
version: "1"
processes:
  b: { command: ["/bin/true"], depends_on: [a] }
  a: { command: ["/bin/true"] }
"#,
        )
        .unwrap();

        let reverse = plan.reverse_waves();
        assert_eq!(reverse[0][0].get(), "b");
        assert_eq!(reverse[1][0].get(), "a");
    }

    #[test]
    fn dependents_are_tracked() {
        let plan = plan(
            r#"
version: "1"
processes:
  a: { command: ["/bin/true"] }
  b: { command: ["/bin/true"], depends_on: [a] }
  c: { command: ["/bin/true"], depends_on: [a] }
"#,
        )
        .unwrap();

        let dependents: Vec<_> = plan
            .dependents_of(&ProcessName::must("a"))
            .iter()
            .map(|n| n.get())
            .collect();
        assert_eq!(dependents, vec!["b", "c"]);
        assert!(plan.dependents_of(&ProcessName::must("b")).is_empty());
    }
}
