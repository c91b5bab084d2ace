//! Version-grouped migration engine.
//!
//! Moves every action, feedback, and the config/secrets blob forward through
//! an ordered list of migration scripts exactly once per item, resuming from
//! each item's own last-applied index. Scripts are synchronous by contract
//! and receive deep copies of whatever is pending, so the only way they can
//! change tracked state is through their declared return values.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use crate::types::{ActionInstance, FeedbackInstance};

/// Read-only reference material handed to each script alongside its input.
pub struct UpgradeContext<'a> {
    /// The working config as of this step. For context only — config updates
    /// go through [`UpgradeResult::updated_config`].
    pub config: &'a Value,
}

/// The config/secrets blob as one unit of migration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigBlob {
    pub config: Value,
    pub secrets: Value,
}

/// Deep copies of everything pending at one step.
#[derive(Debug, Clone)]
pub struct UpgradeInput {
    /// Present iff config/secrets migration is pending at this step.
    pub config: Option<ConfigBlob>,
    pub actions: Vec<ActionInstance>,
    pub feedbacks: Vec<FeedbackInstance>,
}

/// Updates a script chooses to return; anything omitted stays as it was.
#[derive(Debug, Clone, Default)]
pub struct UpgradeResult {
    pub updated_config: Option<Value>,
    pub updated_secrets: Option<Value>,
    pub updated_actions: Vec<ActionInstance>,
    pub updated_feedbacks: Vec<FeedbackInstance>,
}

pub type UpgradeScript = Box<dyn Fn(&UpgradeContext<'_>, UpgradeInput) -> UpgradeResult + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct UpgradePassOptions {
    /// Starting index for items with no recorded index of their own, and for
    /// the config blob. Items with neither are never migrated.
    pub default_index: Option<i64>,
    pub skip_config: bool,
}

/// One item after the pass: migrated or merely acknowledged as current.
#[derive(Debug, Clone, PartialEq)]
pub struct Migrated<T> {
    pub item: T,
    pub updated: bool,
}

#[derive(Debug)]
pub struct UpgradePassOutcome {
    pub config: Value,
    pub secrets: Value,
    pub config_updated: bool,
    pub actions: Vec<Migrated<ActionInstance>>,
    pub feedbacks: Vec<Migrated<FeedbackInstance>>,
}

struct Tracked<T> {
    record: T,
    /// Last applied script index; `None` = not eligible for migration.
    index: Option<i64>,
    updated: bool,
}

/// Run every script an item still needs, in strictly ascending index order,
/// each at most once per item. Items already at the latest index pass
/// through untouched but are still part of the outcome, acknowledging them
/// as current.
pub fn run_upgrade_pass(
    scripts: &[UpgradeScript],
    mut config: Value,
    mut secrets: Value,
    actions: Vec<ActionInstance>,
    feedbacks: Vec<FeedbackInstance>,
    opts: &UpgradePassOptions,
) -> UpgradePassOutcome {
    let script_count = scripts.len() as i64;
    let mut config_updated = false;

    let mut action_order: Vec<String> = Vec::with_capacity(actions.len());
    let mut tracked_actions: HashMap<String, Tracked<ActionInstance>> = HashMap::new();
    for record in actions {
        let index = record.upgrade_index.or(opts.default_index);
        action_order.push(record.id.clone());
        tracked_actions.insert(record.id.clone(), Tracked { record, index, updated: false });
    }

    let mut feedback_order: Vec<String> = Vec::with_capacity(feedbacks.len());
    let mut tracked_feedbacks: HashMap<String, Tracked<FeedbackInstance>> = HashMap::new();
    for record in feedbacks {
        let index = record.upgrade_index.or(opts.default_index);
        feedback_order.push(record.id.clone());
        tracked_feedbacks.insert(record.id.clone(), Tracked { record, index, updated: false });
    }

    let config_active = !opts.skip_config && script_count > 0;
    let config_start = opts.default_index.unwrap_or(-1);

    // resume just after the furthest-behind participant's last applied index
    let mut starts: Vec<i64> = tracked_actions
        .values()
        .filter_map(|t| t.index)
        .chain(tracked_feedbacks.values().filter_map(|t| t.index))
        .collect();
    if let Some(default_index) = opts.default_index {
        starts.push(default_index);
    }
    if config_active {
        starts.push(config_start);
    }

    if let Some(&lowest) = starts.iter().min() {
        let first = (lowest + 1).max(0);
        for i in first..script_count {
            let pending_actions: HashSet<String> = tracked_actions
                .iter()
                .filter(|(_, t)| t.index.is_some_and(|idx| idx < i))
                .map(|(id, _)| id.clone())
                .collect();
            let pending_feedbacks: HashSet<String> = tracked_feedbacks
                .iter()
                .filter(|(_, t)| t.index.is_some_and(|idx| idx < i))
                .map(|(id, _)| id.clone())
                .collect();
            let config_pending = config_active && config_start < i;

            if pending_actions.is_empty() && pending_feedbacks.is_empty() && !config_pending {
                continue;
            }

            let input = UpgradeInput {
                config: config_pending
                    .then(|| ConfigBlob { config: config.clone(), secrets: secrets.clone() }),
                actions: action_order
                    .iter()
                    .filter(|id| pending_actions.contains(*id))
                    .map(|id| tracked_actions[id].record.clone())
                    .collect(),
                feedbacks: feedback_order
                    .iter()
                    .filter(|id| pending_feedbacks.contains(*id))
                    .map(|id| tracked_feedbacks[id].record.clone())
                    .collect(),
            };

            debug!(
                index = i,
                actions = input.actions.len(),
                feedbacks = input.feedbacks.len(),
                config = config_pending,
                "running upgrade script"
            );
            let result = {
                let ctx = UpgradeContext { config: &config };
                scripts[i as usize](&ctx, input)
            };

            if let Some(new_config) = result.updated_config {
                config = new_config;
                config_updated = true;
            }
            if let Some(new_secrets) = result.updated_secrets {
                secrets = new_secrets;
                config_updated = true;
            }
            for returned in result.updated_actions {
                // a script may only touch what it was given at this step
                if !pending_actions.contains(&returned.id) {
                    continue;
                }
                let tracked = tracked_actions.get_mut(&returned.id).unwrap();
                tracked.record.action_id = returned.action_id;
                tracked.record.options = returned.options;
                tracked.updated = true;
            }
            for returned in result.updated_feedbacks {
                if !pending_feedbacks.contains(&returned.id) {
                    continue;
                }
                let tracked = tracked_feedbacks.get_mut(&returned.id).unwrap();
                tracked.record.feedback_id = returned.feedback_id;
                tracked.record.options = returned.options;
                tracked.record.style = returned.style;
                tracked.record.is_inverted = returned.is_inverted;
                tracked.updated = true;
            }

            // every participant advances, returned or not
            for id in &pending_actions {
                let tracked = tracked_actions.get_mut(id).unwrap();
                tracked.index = Some(i);
                tracked.record.upgrade_index = Some(i);
            }
            for id in &pending_feedbacks {
                let tracked = tracked_feedbacks.get_mut(id).unwrap();
                tracked.index = Some(i);
                tracked.record.upgrade_index = Some(i);
            }
        }
    }

    UpgradePassOutcome {
        config,
        secrets,
        config_updated,
        actions: action_order
            .into_iter()
            .map(|id| {
                let tracked = tracked_actions.remove(&id).unwrap();
                Migrated { item: tracked.record, updated: tracked.updated }
            })
            .collect(),
        feedbacks: feedback_order
            .into_iter()
            .map(|id| {
                let tracked = tracked_feedbacks.remove(&id).unwrap();
                Migrated { item: tracked.record, updated: tracked.updated }
            })
            .collect(),
    }
}
