//! Immutable, content-addressed automation condition trees.
//!
//! Every node carries a `unique_id`: the SHA-256 of its kind, its parameters
//! and its children's ids, computed once when the node is built. Labels are
//! cosmetic, so a labelled node has exactly the id of the node it wraps. The
//! id is the join key between a tree and the cursor state it left behind.

use std::fmt;
use std::ops;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::rule::Rule;

/// Shape of one condition node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionKind {
    Rule(Rule),
    And(Vec<AutomationCondition>),
    Or(Vec<AutomationCondition>),
    Not(AutomationCondition),
    /// True from when `trigger` fires until `reset` fires.
    Since {
        trigger: AutomationCondition,
        reset: AutomationCondition,
    },
    Label {
        child: AutomationCondition,
        text: String,
    },
}

#[derive(Debug, PartialEq, Eq)]
struct ConditionNode {
    kind: ConditionKind,
    unique_id: String,
}

/// Handle to an immutable condition node. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationCondition(Arc<ConditionNode>);

/// Presentation view of one node, see [`AutomationCondition::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSnapshot {
    pub unique_id: String,
    pub description: String,
    pub label: Option<String>,
    pub child_unique_ids: Vec<String>,
}

fn hash_parts(tag: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    for part in parts {
        hasher.update([0x1e]);
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    format!("{digest:x}")
}

fn structural_id(kind: &ConditionKind) -> String {
    match kind {
        ConditionKind::Rule(rule) => hash_parts("rule", &[&rule.identity()]),
        ConditionKind::And(children) => {
            let ids: Vec<&str> = children.iter().map(|c| c.unique_id()).collect();
            hash_parts("and", &ids)
        }
        ConditionKind::Or(children) => {
            let ids: Vec<&str> = children.iter().map(|c| c.unique_id()).collect();
            hash_parts("or", &ids)
        }
        ConditionKind::Not(child) => hash_parts("not", &[child.unique_id()]),
        ConditionKind::Since { trigger, reset } => {
            hash_parts("since", &[trigger.unique_id(), reset.unique_id()])
        }
        ConditionKind::Label { child, .. } => child.unique_id().to_string(),
    }
}

impl AutomationCondition {
    fn build(kind: ConditionKind) -> Self {
        let unique_id = structural_id(&kind);
        Self(Arc::new(ConditionNode { kind, unique_id }))
    }

    // ── Leaves ──────────────────────────────────────────────────────

    pub fn rule(rule: Rule) -> Self {
        Self::build(ConditionKind::Rule(rule))
    }

    pub fn missing() -> Self {
        Self::rule(Rule::Missing)
    }

    pub fn in_progress() -> Self {
        Self::rule(Rule::InProgress)
    }

    pub fn newly_requested() -> Self {
        Self::rule(Rule::NewlyRequested)
    }

    pub fn newly_updated() -> Self {
        Self::rule(Rule::NewlyUpdated)
    }

    pub fn any_parents_updated() -> Self {
        Self::rule(Rule::AnyParentsUpdated)
    }

    pub fn any_parents_missing() -> Self {
        Self::rule(Rule::AnyParentsMissing)
    }

    pub fn cron_tick_passed(cron_schedule: impl Into<String>, cron_timezone: impl Into<String>) -> Self {
        Self::rule(Rule::CronTickPassed {
            cron_schedule: cron_schedule.into(),
            cron_timezone: cron_timezone.into(),
        })
    }

    // ── Combinators ─────────────────────────────────────────────────

    pub fn all_of<I: IntoIterator<Item = AutomationCondition>>(children: I) -> Self {
        Self::build(ConditionKind::And(children.into_iter().collect()))
    }

    pub fn any_of<I: IntoIterator<Item = AutomationCondition>>(children: I) -> Self {
        Self::build(ConditionKind::Or(children.into_iter().collect()))
    }

    /// `self AND other`. Chains flatten: `a.and(b).and(c)` is one `And` of three.
    pub fn and(&self, other: &AutomationCondition) -> Self {
        let mut children = match self.kind() {
            ConditionKind::And(children) => children.clone(),
            _ => vec![self.clone()],
        };
        children.push(other.clone());
        Self::all_of(children)
    }

    /// `self OR other`. Chains flatten like [`AutomationCondition::and`].
    pub fn or(&self, other: &AutomationCondition) -> Self {
        let mut children = match self.kind() {
            ConditionKind::Or(children) => children.clone(),
            _ => vec![self.clone()],
        };
        children.push(other.clone());
        Self::any_of(children)
    }

    pub fn since(&self, reset: &AutomationCondition) -> Self {
        Self::build(ConditionKind::Since {
            trigger: self.clone(),
            reset: reset.clone(),
        })
    }

    pub fn with_label(&self, text: impl Into<String>) -> Self {
        Self::build(ConditionKind::Label {
            child: self.clone(),
            text: text.into(),
        })
    }

    // ── Canned policies ─────────────────────────────────────────────

    /// Materialize missing partitions and partitions whose parents updated,
    /// once per trigger, while no parent is missing and no run is in flight.
    pub fn eager() -> Self {
        let became_stale = Self::missing()
            .or(&Self::any_parents_updated())
            .since(&Self::newly_requested().or(&Self::newly_updated()));
        became_stale
            .and(&!Self::any_parents_missing())
            .and(&!Self::in_progress())
            .with_label("eager")
    }

    /// Materialize once after every tick of `cron_schedule`.
    pub fn on_cron(cron_schedule: impl Into<String>, cron_timezone: impl Into<String>) -> Self {
        Self::cron_tick_passed(cron_schedule, cron_timezone)
            .since(&Self::newly_requested())
            .and(&!Self::in_progress())
            .with_label("on_cron")
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn kind(&self) -> &ConditionKind {
        &self.0.kind
    }

    pub fn unique_id(&self) -> &str {
        &self.0.unique_id
    }

    /// User label, if this node is a label wrapper.
    pub fn label(&self) -> Option<&str> {
        match self.kind() {
            ConditionKind::Label { text, .. } => Some(text),
            _ => None,
        }
    }

    /// The node with any label wrappers peeled off.
    pub fn unlabeled(&self) -> &AutomationCondition {
        match self.kind() {
            ConditionKind::Label { child, .. } => child.unlabeled(),
            _ => self,
        }
    }

    /// Short description of the node kind, e.g. `All of` or `missing`.
    pub fn description(&self) -> String {
        match self.kind() {
            ConditionKind::Rule(rule) => rule.description(),
            ConditionKind::And(_) => "All of".to_string(),
            ConditionKind::Or(_) => "Any of".to_string(),
            ConditionKind::Not(_) => "Not".to_string(),
            ConditionKind::Since { .. } => "Since".to_string(),
            ConditionKind::Label { child, .. } => child.description(),
        }
    }

    /// Children in evaluation order, looking through labels.
    pub fn children(&self) -> Vec<AutomationCondition> {
        match self.unlabeled().kind() {
            ConditionKind::Rule(_) => Vec::new(),
            ConditionKind::And(children) | ConditionKind::Or(children) => children.clone(),
            ConditionKind::Not(child) => vec![child.clone()],
            ConditionKind::Since { trigger, reset } => vec![trigger.clone(), reset.clone()],
            ConditionKind::Label { child, .. } => vec![child.clone()],
        }
    }

    /// Fully expanded boolean rendering, ignoring this node's own label.
    /// Labelled descendants render as their label.
    pub fn expanded_label(&self) -> String {
        match self.unlabeled().kind() {
            ConditionKind::Rule(rule) => rule.description(),
            ConditionKind::And(children) => join_operands(children, " AND "),
            ConditionKind::Or(children) => join_operands(children, " OR "),
            ConditionKind::Not(child) => format!("NOT ({})", child.display_label()),
            ConditionKind::Since { trigger, reset } => {
                format!("({}) SINCE ({})", trigger.display_label(), reset.display_label())
            }
            ConditionKind::Label { child, .. } => child.expanded_label(),
        }
    }

    fn display_label(&self) -> String {
        match self.label() {
            Some(text) => text.to_string(),
            None => self.expanded_label(),
        }
    }

    /// Pre-order presentation snapshot of the tree. Labels fold into the
    /// node they wrap.
    pub fn snapshot(&self) -> Vec<ConditionSnapshot> {
        let mut out = Vec::new();
        self.collect_snapshot(None, &mut out);
        out
    }

    fn collect_snapshot(&self, label: Option<String>, out: &mut Vec<ConditionSnapshot>) {
        if let ConditionKind::Label { child, text } = self.kind() {
            return child.collect_snapshot(label.or_else(|| Some(text.clone())), out);
        }
        let children = self.children();
        out.push(ConditionSnapshot {
            unique_id: self.unique_id().to_string(),
            description: self.description(),
            label,
            child_unique_ids: children.iter().map(|c| c.unique_id().to_string()).collect(),
        });
        for child in &children {
            child.collect_snapshot(None, out);
        }
    }
}

fn join_operands(children: &[AutomationCondition], sep: &str) -> String {
    children
        .iter()
        .map(|c| format!("({})", c.display_label()))
        .collect::<Vec<_>>()
        .join(sep)
}

impl fmt::Display for AutomationCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_label())
    }
}

impl ops::Not for AutomationCondition {
    type Output = AutomationCondition;

    fn not(self) -> Self::Output {
        AutomationCondition::build(ConditionKind::Not(self))
    }
}

impl ops::BitAnd for AutomationCondition {
    type Output = AutomationCondition;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.and(&rhs)
    }
}

impl ops::BitOr for AutomationCondition {
    type Output = AutomationCondition;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.or(&rhs)
    }
}
