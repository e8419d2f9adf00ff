//! Asset definitions: which assets the daemon manages and under which
//! automation condition.
//!
//! Definitions are usually loaded from a YAML document:
//!
//! ```yaml
//! assets:
//!   - key: raw/events
//!     condition: { type: eager }
//!   - key: reports/daily
//!     condition:
//!       type: all_of
//!       children:
//!         - { type: missing }
//!         - type: not
//!           child: { type: in_progress }
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use automat_conditions::{AutomationCondition, Rule};
use automat_core::AssetKey;
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;

/// One managed asset and its condition.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetDefinition {
    pub key: AssetKey,
    pub condition: AutomationCondition,
}

impl AssetDefinition {
    pub fn new(key: impl Into<AssetKey>, condition: AutomationCondition) -> Self {
        Self {
            key: key.into(),
            condition,
        }
    }
}

// ── Serialized form ─────────────────────────────────────────────────

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Condition tree as written in a definitions file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionSpec {
    Missing,
    InProgress,
    NewlyRequested,
    NewlyUpdated,
    AnyParentsUpdated,
    AnyParentsMissing,
    CronTickPassed {
        cron_schedule: String,
        #[serde(default = "default_timezone")]
        cron_timezone: String,
    },
    Eager,
    OnCron {
        cron_schedule: String,
        #[serde(default = "default_timezone")]
        cron_timezone: String,
    },
    AllOf {
        children: Vec<ConditionSpec>,
    },
    AnyOf {
        children: Vec<ConditionSpec>,
    },
    Not {
        child: Box<ConditionSpec>,
    },
    Since {
        trigger: Box<ConditionSpec>,
        reset: Box<ConditionSpec>,
    },
    Label {
        label: String,
        child: Box<ConditionSpec>,
    },
}

impl ConditionSpec {
    pub fn build(&self) -> AutomationCondition {
        match self {
            ConditionSpec::Missing => AutomationCondition::rule(Rule::Missing),
            ConditionSpec::InProgress => AutomationCondition::rule(Rule::InProgress),
            ConditionSpec::NewlyRequested => AutomationCondition::rule(Rule::NewlyRequested),
            ConditionSpec::NewlyUpdated => AutomationCondition::rule(Rule::NewlyUpdated),
            ConditionSpec::AnyParentsUpdated => AutomationCondition::rule(Rule::AnyParentsUpdated),
            ConditionSpec::AnyParentsMissing => AutomationCondition::rule(Rule::AnyParentsMissing),
            ConditionSpec::CronTickPassed {
                cron_schedule,
                cron_timezone,
            } => AutomationCondition::cron_tick_passed(cron_schedule.as_str(), cron_timezone.as_str()),
            ConditionSpec::Eager => AutomationCondition::eager(),
            ConditionSpec::OnCron {
                cron_schedule,
                cron_timezone,
            } => AutomationCondition::on_cron(cron_schedule.as_str(), cron_timezone.as_str()),
            ConditionSpec::AllOf { children } => {
                AutomationCondition::all_of(children.iter().map(ConditionSpec::build))
            }
            ConditionSpec::AnyOf { children } => {
                AutomationCondition::any_of(children.iter().map(ConditionSpec::build))
            }
            ConditionSpec::Not { child } => !child.build(),
            ConditionSpec::Since { trigger, reset } => trigger.build().since(&reset.build()),
            ConditionSpec::Label { label, child } => child.build().with_label(label.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetDefinitionSpec {
    pub key: String,
    pub condition: ConditionSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefinitionsFile {
    #[serde(default)]
    pub assets: Vec<AssetDefinitionSpec>,
}

impl DefinitionsFile {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, DaemonError> {
        serde_yaml::from_str(yaml).map_err(|e| DaemonError::Definitions(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Definitions(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&yaml)
    }

    /// Build definitions, rejecting malformed keys and duplicate assets.
    pub fn into_definitions(self) -> Result<Vec<AssetDefinition>, DaemonError> {
        let mut seen = BTreeSet::new();
        let mut definitions = Vec::with_capacity(self.assets.len());
        for spec in self.assets {
            let key = AssetKey::from_user_string(&spec.key)
                .map_err(|e| DaemonError::Definitions(format!("asset key {:?}: {e}", spec.key)))?;
            if !seen.insert(key.clone()) {
                return Err(DaemonError::DuplicateAsset(key.to_user_string()));
            }
            definitions.push(AssetDefinition {
                key,
                condition: spec.condition.build(),
            });
        }
        Ok(definitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITIONS_YAML: &str = r#"
assets:
  - key: raw/events
    condition: { type: eager }
  - key: reports/daily
    condition:
      type: label
      label: nightly
      child:
        type: on_cron
        cron_schedule: "0 0 * * *"
        cron_timezone: Europe/Berlin
  - key: scratch
    condition:
      type: all_of
      children:
        - type: since
          trigger: { type: missing }
          reset: { type: newly_requested }
        - type: not
          child: { type: in_progress }
"#;

    #[test]
    fn parse_and_build_definitions() {
        let defs = DefinitionsFile::from_yaml_str(DEFINITIONS_YAML)
            .unwrap()
            .into_definitions()
            .unwrap();
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[0].key, AssetKey::new(["raw", "events"]));
        assert_eq!(defs[0].condition, AutomationCondition::eager());
        assert_eq!(defs[1].condition.label(), Some("nightly"));
        assert_eq!(
            defs[1].condition.unique_id(),
            AutomationCondition::on_cron("0 0 * * *", "Europe/Berlin").unique_id()
        );

        let expected = AutomationCondition::all_of([
            AutomationCondition::missing().since(&AutomationCondition::newly_requested()),
            !AutomationCondition::in_progress(),
        ]);
        assert_eq!(defs[2].condition.unique_id(), expected.unique_id());
    }

    #[test]
    fn cron_timezone_defaults_to_utc() {
        let spec: ConditionSpec = serde_yaml::from_str("{ type: cron_tick_passed, cron_schedule: '@daily' }").unwrap();
        assert_eq!(
            spec,
            ConditionSpec::CronTickPassed {
                cron_schedule: "@daily".into(),
                cron_timezone: "UTC".into(),
            }
        );
    }

    #[test]
    fn duplicate_assets_are_rejected() {
        let yaml = "assets:\n  - { key: a, condition: { type: missing } }\n  - { key: a, condition: { type: eager } }\n";
        let err = DefinitionsFile::from_yaml_str(yaml)
            .unwrap()
            .into_definitions()
            .unwrap_err();
        assert!(matches!(err, DaemonError::DuplicateAsset(k) if k == "a"));
    }

    #[test]
    fn unknown_condition_type_is_rejected() {
        let err = DefinitionsFile::from_yaml_str("assets:\n  - { key: a, condition: { type: sometimes } }\n")
            .unwrap_err();
        assert!(matches!(err, DaemonError::Definitions(_)));
    }
}
