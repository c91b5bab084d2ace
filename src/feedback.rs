use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::batch::{DEFAULT_CEILING, DEFAULT_QUIET, FlushFn, ValueBatcher};
use crate::channel::Outbound;
use crate::error::ModuleError;
use crate::rpc::ModuleMethod;
use crate::types::{
    FeedbackDefinitionSummary, FeedbackInstance, FeedbackKind, FeedbackValue, FeedbackValuesBatch,
    InstanceDeltas, OptionValues,
};

/// What a feedback callback gets to look at: the instance as currently
/// stored, plus the option values it had before the most recent update.
#[derive(Debug, Clone)]
pub struct FeedbackCheck {
    pub instance: FeedbackInstance,
    pub previous_options: Option<OptionValues>,
}

pub type FeedbackCallback =
    Arc<dyn Fn(FeedbackCheck) -> BoxFuture<'static, Result<Value, ModuleError>> + Send + Sync>;
pub type FeedbackLifecycleCallback =
    Arc<dyn Fn(FeedbackInstance) -> BoxFuture<'static, Result<(), ModuleError>> + Send + Sync>;
pub type FeedbackLearnCallback = Arc<
    dyn Fn(FeedbackInstance) -> BoxFuture<'static, Result<Option<OptionValues>, ModuleError>>
        + Send
        + Sync,
>;

/// A named feedback capability: its option schema plus the callbacks shared
/// by all of its instances.
pub struct FeedbackDefinition {
    pub name: String,
    pub kind: FeedbackKind,
    /// Opaque serialized option field schema, forwarded to the host verbatim.
    pub option_schema: Value,
    pub default_style: Option<Value>,
    pub callback: FeedbackCallback,
    pub subscribe: Option<FeedbackLifecycleCallback>,
    pub unsubscribe: Option<FeedbackLifecycleCallback>,
    pub learn: Option<FeedbackLearnCallback>,
}

impl FeedbackDefinition {
    pub fn new(name: impl Into<String>, kind: FeedbackKind, callback: FeedbackCallback) -> Self {
        Self {
            name: name.into(),
            kind,
            option_schema: Value::Null,
            default_style: None,
            callback,
            subscribe: None,
            unsubscribe: None,
            learn: None,
        }
    }
}

struct StoredFeedback {
    instance: FeedbackInstance,
    previous_options: Option<OptionValues>,
    /// Whether `subscribe` has run for this instance — gates `unsubscribe`.
    subscribed: bool,
}

/// Present while a recomputation is in flight for an instance; the flag
/// coalesces every further trigger into a single follow-up run.
#[derive(Default)]
struct CheckStatus {
    recheck: bool,
}

/// Keeps a computed value for every known feedback instance up to date with
/// non-overlapping recomputation, and ships only the latest values to the
/// host in debounced batches.
pub struct FeedbackManager {
    outbound: Outbound,
    definitions: DashMap<String, Arc<FeedbackDefinition>>,
    instances: DashMap<String, StoredFeedback>,
    checks: DashMap<String, CheckStatus>,
    batcher: ValueBatcher,
    learn_timeout: Duration,
}

pub const DEFAULT_LEARN_TIMEOUT: Duration = Duration::from_secs(5);

impl FeedbackManager {
    pub fn new(outbound: Outbound) -> Arc<Self> {
        Self::with_debounce(outbound, DEFAULT_QUIET, DEFAULT_CEILING)
    }

    pub fn with_debounce(outbound: Outbound, quiet: Duration, ceiling: Duration) -> Arc<Self> {
        let flush_outbound = outbound.clone();
        let flush: FlushFn = Box::new(move |values| {
            match serde_json::to_value(FeedbackValuesBatch { values }) {
                Ok(payload) => {
                    if let Err(err) = flush_outbound.send_fire_and_forget(
                        ModuleMethod::UpdateFeedbackValues.to_string(),
                        Some(payload),
                    ) {
                        warn!(error = %err, "could not deliver feedback values");
                    }
                }
                Err(err) => warn!(error = %err, "could not serialize feedback values"),
            }
        });
        Arc::new(Self {
            outbound,
            definitions: DashMap::new(),
            instances: DashMap::new(),
            checks: DashMap::new(),
            batcher: ValueBatcher::spawn(quiet, ceiling, flush),
            learn_timeout: DEFAULT_LEARN_TIMEOUT,
        })
    }

    /// Replace the definition map wholesale and publish the host-facing
    /// summary. Existing instances and their cached values are untouched.
    pub fn set_definitions(&self, definitions: HashMap<String, FeedbackDefinition>) {
        self.definitions.clear();
        let mut summaries = Vec::with_capacity(definitions.len());
        for (id, definition) in definitions {
            summaries.push(FeedbackDefinitionSummary {
                id: id.clone(),
                name: definition.name.clone(),
                kind: definition.kind,
                option_schema: definition.option_schema.clone(),
                has_learn: definition.learn.is_some(),
                default_style: definition.default_style.clone(),
            });
            self.definitions.insert(id, Arc::new(definition));
        }
        match serde_json::to_value(summaries) {
            Ok(payload) => {
                if let Err(err) = self.outbound.send_fire_and_forget(
                    ModuleMethod::SetFeedbackDefinitions.to_string(),
                    Some(payload),
                ) {
                    warn!(error = %err, "could not publish feedback definitions");
                }
            }
            Err(err) => warn!(error = %err, "could not serialize feedback definitions"),
        }
    }

    /// Apply host-pushed instance deltas. Removed or disabled instances are
    /// forgotten (with `unsubscribe` fired iff `subscribe` previously ran);
    /// everything else is stored and scheduled for a check.
    pub fn apply_instance_deltas(self: &Arc<Self>, deltas: InstanceDeltas<FeedbackInstance>) {
        for (id, delta) in deltas {
            match delta {
                None => self.forget_instance(&id),
                Some(instance) if instance.disabled => self.forget_instance(&id),
                Some(instance) => {
                    let mut run_subscribe = false;
                    match self.instances.entry(id.clone()) {
                        Entry::Occupied(mut entry) => {
                            let stored = entry.get_mut();
                            stored.previous_options = Some(stored.instance.options.clone());
                            stored.instance = instance.clone();
                        }
                        Entry::Vacant(entry) => {
                            run_subscribe = true;
                            entry.insert(StoredFeedback {
                                instance: instance.clone(),
                                previous_options: None,
                                subscribed: false,
                            });
                        }
                    }
                    if run_subscribe {
                        self.run_subscribe(&id, &instance);
                    }
                    self.trigger_check(&id);
                }
            }
        }
    }

    fn run_subscribe(&self, id: &str, instance: &FeedbackInstance) {
        let Some(definition) = self.definitions.get(&instance.feedback_id) else {
            return;
        };
        let Some(subscribe) = definition.subscribe.clone() else {
            return;
        };
        drop(definition);
        if let Some(mut stored) = self.instances.get_mut(id) {
            stored.subscribed = true;
        }
        let id = id.to_string();
        let instance = instance.clone();
        tokio::spawn(async move {
            if let Err(err) = subscribe(instance).await {
                warn!(id = %id, error = %err, "feedback subscribe failed");
            }
        });
    }

    fn forget_instance(&self, id: &str) {
        let Some((_, stored)) = self.instances.remove(id) else {
            return;
        };
        if !stored.subscribed {
            return;
        }
        let Some(definition) = self.definitions.get(&stored.instance.feedback_id) else {
            return;
        };
        if let Some(unsubscribe) = definition.unsubscribe.clone() {
            let id = id.to_string();
            let instance = stored.instance;
            tokio::spawn(async move {
                if let Err(err) = unsubscribe(instance).await {
                    warn!(id = %id, error = %err, "feedback unsubscribe failed");
                }
            });
        }
    }

    /// Schedule a recomputation. At most one check per instance is in
    /// flight; a trigger arriving while one runs sets the recheck flag and
    /// results in exactly one follow-up run after the current one completes.
    pub fn trigger_check(self: &Arc<Self>, id: &str) {
        match self.checks.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().recheck = true;
                return;
            }
            Entry::Vacant(entry) => {
                entry.insert(CheckStatus::default());
            }
        }
        let manager = self.clone();
        let id = id.to_string();
        tokio::spawn(async move { manager.run_check(id).await });
    }

    async fn run_check(self: Arc<Self>, id: String) {
        // snapshot before the await; the value is recorded only after the
        // callback settles
        let job = self.instances.get(&id).and_then(|stored| {
            self.definitions.get(&stored.instance.feedback_id).map(|definition| {
                (
                    FeedbackCheck {
                        instance: stored.instance.clone(),
                        previous_options: stored.previous_options.clone(),
                    },
                    stored.instance.control_id.clone(),
                    definition.callback.clone(),
                )
            })
        });

        if let Some((check, control_id, callback)) = job {
            match callback(check).await {
                Ok(value) => self.batcher.push(FeedbackValue { id: id.clone(), control_id, value }),
                Err(err) => warn!(id = %id, error = %err, "feedback check failed; keeping last value"),
            }
        } else {
            debug!(id = %id, "skipping check for unknown instance or definition");
        }

        let recheck = self.checks.remove(&id).map(|(_, status)| status.recheck).unwrap_or(false);
        if recheck && self.instances.contains_key(&id) {
            let manager = self.clone();
            tokio::spawn(async move { manager.trigger_check(&id) });
        }
    }

    /// Recompute every instance of the given definition ids, or every
    /// instance when `feedback_ids` is empty.
    pub fn check_by_definition_ids(self: &Arc<Self>, feedback_ids: &[String]) {
        let ids: Vec<String> = self
            .instances
            .iter()
            .filter(|entry| {
                feedback_ids.is_empty() || feedback_ids.contains(&entry.value().instance.feedback_id)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.trigger_check(&id);
        }
    }

    pub fn check_by_instance_ids(self: &Arc<Self>, ids: &[String]) {
        for id in ids {
            if self.instances.contains_key(id) {
                self.trigger_check(id);
            }
        }
    }

    pub fn check_all(self: &Arc<Self>) {
        self.check_by_definition_ids(&[]);
    }

    /// Run the definition's learn callback under a bounded timeout and
    /// return the produced partial option values.
    pub async fn learn(
        &self,
        instance: FeedbackInstance,
        timeout: Option<Duration>,
    ) -> Result<Option<OptionValues>, ModuleError> {
        let definition = self
            .definitions
            .get(&instance.feedback_id)
            .ok_or_else(|| ModuleError::UnknownDefinition(instance.feedback_id.clone()))?;
        let learn = definition
            .learn
            .clone()
            .ok_or_else(|| ModuleError::LearnNotSupported(instance.feedback_id.clone()))?;
        drop(definition);

        let timeout = timeout.unwrap_or(self.learn_timeout);
        match tokio::time::timeout(timeout, learn(instance)).await {
            Ok(result) => result,
            Err(_) => Err(ModuleError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Best-effort `subscribe` for every instance of the given definition
    /// ids (empty = all), without touching instance bookkeeping.
    pub fn subscribe_all(&self, feedback_ids: &[String]) {
        self.for_each_matching(feedback_ids, true);
    }

    /// Best-effort `unsubscribe` for the matching subset, without removing
    /// the instances.
    pub fn unsubscribe_all(&self, feedback_ids: &[String]) {
        self.for_each_matching(feedback_ids, false);
    }

    fn for_each_matching(&self, feedback_ids: &[String], subscribe: bool) {
        for mut entry in self.instances.iter_mut() {
            let stored = entry.value_mut();
            if !feedback_ids.is_empty() && !feedback_ids.contains(&stored.instance.feedback_id) {
                continue;
            }
            let Some(definition) = self.definitions.get(&stored.instance.feedback_id) else {
                continue;
            };
            let callback = if subscribe {
                definition.subscribe.clone()
            } else {
                definition.unsubscribe.clone()
            };
            drop(definition);
            let Some(callback) = callback else { continue };
            stored.subscribed = subscribe;
            let id = entry.key().clone();
            let instance = entry.value().instance.clone();
            tokio::spawn(async move {
                if let Err(err) = callback(instance).await {
                    warn!(id = %id, error = %err, "feedback lifecycle callback failed");
                }
            });
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Envelope;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::{Duration, sleep, timeout};

    fn instance(id: &str, feedback_id: &str) -> FeedbackInstance {
        FeedbackInstance {
            id: id.to_string(),
            control_id: "bank:1".to_string(),
            feedback_id: feedback_id.to_string(),
            ..Default::default()
        }
    }

    fn deltas_of(items: Vec<(&str, Option<FeedbackInstance>)>) -> InstanceDeltas<FeedbackInstance> {
        items.into_iter().map(|(id, inst)| (id.to_string(), inst)).collect()
    }

    fn manager() -> (Arc<FeedbackManager>, mpsc::UnboundedReceiver<Envelope>) {
        let (outbound, rx) = Outbound::channel();
        (FeedbackManager::new(outbound), rx)
    }

    async fn next_value_batch(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<FeedbackValue> {
        loop {
            let envelope = timeout(Duration::from_millis(500), rx.recv())
                .await
                .expect("no batch arrived")
                .expect("transport closed");
            if let Envelope::Call(call) = envelope {
                if call.name == "updateFeedbackValues" {
                    let batch: FeedbackValuesBatch =
                        serde_json::from_value(call.payload.unwrap()).unwrap();
                    return batch.values;
                }
            }
        }
    }

    #[tokio::test]
    async fn concurrent_triggers_coalesce_into_one_recheck() {
        let (manager, _rx) = manager();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (running_c, peak_c, calls_c) = (running.clone(), peak.clone(), calls.clone());

        let mut defs = HashMap::new();
        defs.insert(
            "state".to_string(),
            FeedbackDefinition::new(
                "State",
                FeedbackKind::Boolean,
                Arc::new(move |_| {
                    let (running, peak, calls) = (running_c.clone(), peak_c.clone(), calls_c.clone());
                    Box::pin(async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        calls.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(30)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(json!(true))
                    })
                }),
            ),
        );
        manager.set_definitions(defs);
        manager.apply_instance_deltas(deltas_of(vec![("fb1", Some(instance("fb1", "state")))]));

        // let the first check get going, then pile on three more triggers
        sleep(Duration::from_millis(5)).await;
        manager.trigger_check("fb1");
        manager.trigger_check("fb1");
        manager.trigger_check("fb1");

        sleep(Duration::from_millis(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2, "triggers must coalesce into one follow-up");
        assert_eq!(peak.load(Ordering::SeqCst), 1, "checks must never overlap");
    }

    #[tokio::test]
    async fn unsubscribe_fires_exactly_once_iff_subscribed() {
        let (manager, _rx) = manager();

        let subscribes = Arc::new(AtomicUsize::new(0));
        let unsubscribes = Arc::new(AtomicUsize::new(0));
        let (sub_c, unsub_c) = (subscribes.clone(), unsubscribes.clone());

        let mut def = FeedbackDefinition::new(
            "State",
            FeedbackKind::Boolean,
            Arc::new(|_| Box::pin(async { Ok(json!(false)) })),
        );
        def.subscribe = Some(Arc::new(move |_| {
            let sub = sub_c.clone();
            Box::pin(async move {
                sub.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
        def.unsubscribe = Some(Arc::new(move |_| {
            let unsub = unsub_c.clone();
            Box::pin(async move {
                unsub.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
        let mut defs = HashMap::new();
        defs.insert("state".to_string(), def);
        manager.set_definitions(defs);

        manager.apply_instance_deltas(deltas_of(vec![("fb1", Some(instance("fb1", "state")))]));
        // update in place: no second subscribe
        manager.apply_instance_deltas(deltas_of(vec![("fb1", Some(instance("fb1", "state")))]));
        sleep(Duration::from_millis(20)).await;
        assert_eq!(subscribes.load(Ordering::SeqCst), 1);

        manager.apply_instance_deltas(deltas_of(vec![("fb1", None)]));
        // removing again is a no-op
        manager.apply_instance_deltas(deltas_of(vec![("fb1", None)]));
        sleep(Duration::from_millis(20)).await;
        assert_eq!(unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_check_keeps_the_last_good_value() {
        let (manager, mut rx) = manager();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_c = calls.clone();
        let mut defs = HashMap::new();
        defs.insert(
            "state".to_string(),
            FeedbackDefinition::new(
                "State",
                FeedbackKind::Boolean,
                Arc::new(move |_| {
                    let n = calls_c.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async move {
                        if n == 0 {
                            Ok(json!(true))
                        } else {
                            Err(ModuleError::Callback("device offline".into()))
                        }
                    })
                }),
            ),
        );
        manager.set_definitions(defs);
        // definitions publish comes first; skip it via next_value_batch's filter

        manager.apply_instance_deltas(deltas_of(vec![("fb1", Some(instance("fb1", "state")))]));
        let batch = next_value_batch(&mut rx).await;
        assert_eq!(batch, vec![FeedbackValue {
            id: "fb1".into(),
            control_id: "bank:1".into(),
            value: json!(true),
        }]);

        manager.trigger_check("fb1");
        sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // the failing check must not have shipped anything
        assert!(
            timeout(Duration::from_millis(50), next_value_batch(&mut rx)).await.is_err(),
            "failed check must not replace the last value"
        );
    }

    #[tokio::test]
    async fn disabled_instances_are_forgotten_without_checks() {
        let (manager, _rx) = manager();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_c = calls.clone();
        let mut defs = HashMap::new();
        defs.insert(
            "state".to_string(),
            FeedbackDefinition::new(
                "State",
                FeedbackKind::Boolean,
                Arc::new(move |_| {
                    calls_c.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Ok(json!(true)) })
                }),
            ),
        );
        manager.set_definitions(defs);

        let mut disabled = instance("fb1", "state");
        disabled.disabled = true;
        manager.apply_instance_deltas(deltas_of(vec![("fb1", Some(disabled))]));
        sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.instance_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_sees_previous_options() {
        let (manager, mut rx) = manager();

        let mut defs = HashMap::new();
        defs.insert(
            "state".to_string(),
            FeedbackDefinition::new(
                "State",
                FeedbackKind::Boolean,
                Arc::new(|check: FeedbackCheck| {
                    Box::pin(async move {
                        let prev = check
                            .previous_options
                            .and_then(|o| o.get("channel").cloned())
                            .unwrap_or(Value::Null);
                        Ok(json!({ "prev": prev, "now": check.instance.options["channel"] }))
                    })
                }),
            ),
        );
        manager.set_definitions(defs);

        let mut first = instance("fb1", "state");
        first.options.insert("channel".into(), json!(1));
        manager.apply_instance_deltas(deltas_of(vec![("fb1", Some(first))]));
        let batch = next_value_batch(&mut rx).await;
        assert_eq!(batch[0].value, json!({ "prev": null, "now": 1 }));

        let mut second = instance("fb1", "state");
        second.options.insert("channel".into(), json!(2));
        manager.apply_instance_deltas(deltas_of(vec![("fb1", Some(second))]));
        let batch = next_value_batch(&mut rx).await;
        assert_eq!(batch[0].value, json!({ "prev": 1, "now": 2 }));
    }

    #[tokio::test]
    async fn learn_without_callback_reports_not_supported() {
        let (manager, _rx) = manager();
        let mut defs = HashMap::new();
        defs.insert(
            "state".to_string(),
            FeedbackDefinition::new(
                "State",
                FeedbackKind::Boolean,
                Arc::new(|_| Box::pin(async { Ok(json!(false)) })),
            ),
        );
        manager.set_definitions(defs);

        let err = manager.learn(instance("fb1", "state"), None).await.unwrap_err();
        assert!(matches!(err, ModuleError::LearnNotSupported(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn learn_times_out() {
        let (manager, _rx) = manager();
        let mut def = FeedbackDefinition::new(
            "State",
            FeedbackKind::Boolean,
            Arc::new(|_| Box::pin(async { Ok(json!(false)) })),
        );
        def.learn = Some(Arc::new(|_| {
            Box::pin(async {
                sleep(Duration::from_secs(60)).await;
                Ok(None)
            })
        }));
        let mut defs = HashMap::new();
        defs.insert("state".to_string(), def);
        manager.set_definitions(defs);

        let err = manager
            .learn(instance("fb1", "state"), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::Timeout(20)), "got {err:?}");
    }
}
