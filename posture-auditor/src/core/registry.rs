/*!
Check registry: the catalog every check module adds itself to at startup
*/

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use futures::Stream;
use tracing::debug;

use crate::core::context::RunContext;
use crate::core::error::{CheckError, RegistryError};
use crate::core::finding::Finding;

/// Lazy, finite stream of findings produced by one check invocation
pub type FindingStream = Pin<Box<dyn Stream<Item = Result<Finding, CheckError>> + Send>>;

type CheckFn = dyn Fn(RunContext) -> FindingStream + Send + Sync;

/// A registered check: a group tag, a stable name and the routine itself
#[derive(Clone)]
pub struct CheckUnit {
    group: &'static str,
    name: &'static str,
    run: Arc<CheckFn>,
}

impl CheckUnit {
    pub fn new<F, S>(group: &'static str, name: &'static str, check: F) -> Self
    where
        F: Fn(RunContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Finding, CheckError>> + Send + 'static,
    {
        Self {
            group,
            name,
            run: Arc::new(move |ctx| -> FindingStream { Box::pin(check(ctx)) }),
        }
    }

    pub fn group(&self) -> &'static str {
        self.group
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Start the check; findings are produced as the stream is polled
    pub fn invoke(&self, ctx: RunContext) -> FindingStream {
        (self.run)(ctx)
    }
}

impl fmt::Debug for CheckUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckUnit")
            .field("group", &self.group)
            .field("name", &self.name)
            .finish()
    }
}

/// Which groups a run should execute
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GroupSelection {
    #[default]
    All,
    Named(Vec<String>),
}

impl GroupSelection {
    /// Empty list means every group
    pub fn from_names(names: Vec<String>) -> Self {
        if names.is_empty() {
            GroupSelection::All
        } else {
            GroupSelection::Named(names)
        }
    }
}

/// Group tag → checks, both in registration order
#[derive(Debug, Default)]
pub struct CheckRegistry {
    groups: Vec<(&'static str, Vec<CheckUnit>)>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a check to its group; a repeated name within a group is rejected
    pub fn register(&mut self, unit: CheckUnit) -> Result<(), RegistryError> {
        let index = match self.groups.iter().position(|(group, _)| *group == unit.group) {
            Some(index) => index,
            None => {
                self.groups.push((unit.group, Vec::new()));
                self.groups.len() - 1
            }
        };

        let checks = &mut self.groups[index].1;
        if checks.iter().any(|existing| existing.name == unit.name) {
            return Err(RegistryError::DuplicateCheck {
                group: unit.group.to_string(),
                name: unit.name.to_string(),
            });
        }

        debug!(group = unit.group, check = unit.name, "registered check");
        checks.push(unit);
        Ok(())
    }

    /// Every check, group by group in registration order
    pub fn all_checks(&self) -> impl Iterator<Item = &CheckUnit> {
        self.groups.iter().flat_map(|(_, checks)| checks.iter())
    }

    /// Checks for the selected groups, in registry order
    pub fn select(&self, selection: &GroupSelection) -> Result<Vec<&CheckUnit>, RegistryError> {
        match selection {
            GroupSelection::All => Ok(self.all_checks().collect()),
            GroupSelection::Named(names) => {
                if let Some(unknown) = names.iter().find(|name| !self.has_group(name)) {
                    return Err(RegistryError::UnknownGroup(unknown.clone()));
                }
                Ok(self
                    .all_checks()
                    .filter(|unit| names.iter().any(|name| name == unit.group))
                    .collect())
            }
        }
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.iter().any(|(name, _)| *name == group)
    }

    pub fn groups(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.groups.iter().map(|(group, _)| *group)
    }

    /// `(group, check)` pairs for listing the catalog
    pub fn describe(&self) -> Vec<(&'static str, &'static str)> {
        self.all_checks().map(|unit| (unit.group, unit.name)).collect()
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, checks)| checks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Register a check function under a group, naming it after the function
#[macro_export]
macro_rules! register_check {
    ($registry:expr, $group:expr, $check:ident) => {
        $registry.register($crate::core::registry::CheckUnit::new(
            $group,
            stringify!($check),
            $check,
        ))
    };
}

static GLOBAL: OnceLock<CheckRegistry> = OnceLock::new();

/// The process-wide catalog of built-in checks, assembled on first use.
///
/// Read-only once initialised.
pub fn global() -> Result<&'static CheckRegistry, RegistryError> {
    if let Some(registry) = GLOBAL.get() {
        return Ok(registry);
    }
    let registry = crate::checks::builtin_registry()?;
    Ok(GLOBAL.get_or_init(|| registry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn noop(_ctx: RunContext) -> impl Stream<Item = Result<Finding, CheckError>> {
        stream::empty()
    }

    fn other(_ctx: RunContext) -> impl Stream<Item = Result<Finding, CheckError>> {
        stream::empty()
    }

    #[test]
    fn names_come_from_the_function() {
        let mut registry = CheckRegistry::new();
        register_check!(registry, "ec2", noop).unwrap();

        assert_eq!(registry.describe(), vec![("ec2", "noop")]);
    }

    #[test]
    fn duplicate_names_in_a_group_are_rejected() {
        let mut registry = CheckRegistry::new();
        register_check!(registry, "ec2", noop).unwrap();

        let err = register_check!(registry, "ec2", noop).unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateCheck {
                group: "ec2".into(),
                name: "noop".into()
            }
        );
        assert_eq!(registry.len(), 1);

        // same name in another group is fine
        register_check!(registry, "shield", noop).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn flattening_follows_registration_order() {
        let mut registry = CheckRegistry::new();
        register_check!(registry, "shield", noop).unwrap();
        register_check!(registry, "ec2", noop).unwrap();
        register_check!(registry, "shield", other).unwrap();

        let expected = vec![("shield", "noop"), ("shield", "other"), ("ec2", "noop")];
        assert_eq!(registry.describe(), expected);
        assert_eq!(registry.describe(), expected);
    }

    #[test]
    fn selection_filters_groups_and_rejects_unknown_ones() {
        let mut registry = CheckRegistry::new();
        register_check!(registry, "ec2", noop).unwrap();
        register_check!(registry, "shield", noop).unwrap();
        register_check!(registry, "ssm", noop).unwrap();

        let selected = registry
            .select(&GroupSelection::Named(vec!["ssm".into(), "ec2".into()]))
            .unwrap();
        let groups: Vec<_> = selected.iter().map(|unit| unit.group()).collect();
        assert_eq!(groups, vec!["ec2", "ssm"]);

        assert_eq!(registry.select(&GroupSelection::All).unwrap().len(), 3);
        assert_eq!(
            registry
                .select(&GroupSelection::Named(vec!["rds".into()]))
                .unwrap_err(),
            RegistryError::UnknownGroup("rds".into())
        );
    }

    #[test]
    fn empty_name_list_selects_everything() {
        assert_eq!(GroupSelection::from_names(vec![]), GroupSelection::All);
    }

    #[test]
    fn global_catalog_is_stable() {
        let first = global().unwrap().describe();
        let second = global().unwrap().describe();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }
}
