use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing::warn;

use crate::channel::Outbound;
use crate::error::ModuleError;
use crate::feedback::DEFAULT_LEARN_TIMEOUT;
use crate::rpc::ModuleMethod;
use crate::types::{
    ActionDefinitionSummary, ActionInstance, ExecuteActionResult, InstanceDeltas, OptionValues,
};

/// Capabilities handed to an action callback for the duration of one
/// invocation, scoped to the instance's owning control.
#[derive(Clone)]
pub struct ActionContext {
    pub surface_id: Option<String>,
    control_id: String,
    outbound: Outbound,
}

impl ActionContext {
    /// Publish a custom variable value tied to the owning control.
    pub fn set_custom_variable(&self, name: impl Into<String>, value: Value) {
        let payload = json!({
            "controlId": self.control_id,
            "name": name.into(),
            "value": value,
        });
        if let Err(err) = self
            .outbound
            .send_fire_and_forget(ModuleMethod::SetCustomVariable.to_string(), Some(payload))
        {
            warn!(error = %err, "could not publish custom variable");
        }
    }

    pub fn control_id(&self) -> &str {
        &self.control_id
    }
}

pub type ActionCallback = Arc<
    dyn Fn(ActionInstance, ActionContext) -> BoxFuture<'static, Result<(), ModuleError>> + Send + Sync,
>;
pub type ActionLifecycleCallback =
    Arc<dyn Fn(ActionInstance) -> BoxFuture<'static, Result<(), ModuleError>> + Send + Sync>;
pub type ActionLearnCallback = Arc<
    dyn Fn(ActionInstance) -> BoxFuture<'static, Result<Option<OptionValues>, ModuleError>>
        + Send
        + Sync,
>;

/// A named action capability: its option schema plus the callbacks shared by
/// all of its instances.
pub struct ActionDefinition {
    pub name: String,
    /// Opaque serialized option field schema, forwarded to the host verbatim.
    pub option_schema: Value,
    pub callback: ActionCallback,
    pub subscribe: Option<ActionLifecycleCallback>,
    pub unsubscribe: Option<ActionLifecycleCallback>,
    pub learn: Option<ActionLearnCallback>,
    /// Option ids whose changes require a re-subscribe. Omitting this while
    /// declaring subscribe/unsubscribe causes excess churn and is flagged at
    /// registration time.
    pub subscribe_relevant_options: Option<Vec<String>>,
}

impl ActionDefinition {
    pub fn new(name: impl Into<String>, callback: ActionCallback) -> Self {
        Self {
            name: name.into(),
            option_schema: Value::Null,
            callback,
            subscribe: None,
            unsubscribe: None,
            learn: None,
            subscribe_relevant_options: None,
        }
    }
}

struct StoredAction {
    instance: ActionInstance,
    subscribed: bool,
}

/// Executes action callbacks exactly once per invocation request and reports
/// success or failure without ever throwing across the process boundary.
pub struct ActionManager {
    outbound: Outbound,
    definitions: DashMap<String, Arc<ActionDefinition>>,
    instances: DashMap<String, StoredAction>,
    learn_timeout: Duration,
}

impl ActionManager {
    pub fn new(outbound: Outbound) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            definitions: DashMap::new(),
            instances: DashMap::new(),
            learn_timeout: DEFAULT_LEARN_TIMEOUT,
        })
    }

    /// Replace the definition map wholesale and publish the host-facing
    /// summary. Definitions declaring subscribe/unsubscribe without a
    /// re-subscribe options hint are flagged, non-fatally.
    pub fn set_definitions(&self, definitions: HashMap<String, ActionDefinition>) {
        for id in missing_resubscribe_hints(&definitions) {
            warn!(id = %id, "action declares subscribe/unsubscribe without subscribeRelevantOptions");
        }

        self.definitions.clear();
        let mut summaries = Vec::with_capacity(definitions.len());
        for (id, definition) in definitions {
            summaries.push(ActionDefinitionSummary {
                id: id.clone(),
                name: definition.name.clone(),
                option_schema: definition.option_schema.clone(),
                has_learn: definition.learn.is_some(),
            });
            self.definitions.insert(id, Arc::new(definition));
        }
        match serde_json::to_value(summaries) {
            Ok(payload) => {
                if let Err(err) = self
                    .outbound
                    .send_fire_and_forget(ModuleMethod::SetActionDefinitions.to_string(), Some(payload))
                {
                    warn!(error = %err, "could not publish action definitions");
                }
            }
            Err(err) => warn!(error = %err, "could not serialize action definitions"),
        }
    }

    /// Run the action's callback once. Any failure is converted into a
    /// structured result; the host never receives a raw throw.
    pub async fn execute(&self, instance: ActionInstance, surface_id: Option<String>) -> ExecuteActionResult {
        let Some(definition) = self.definitions.get(&instance.action_id) else {
            return ExecuteActionResult::failed(format!(
                "definition '{}' is not registered",
                instance.action_id
            ));
        };
        let callback = definition.callback.clone();
        drop(definition);

        let context = ActionContext {
            surface_id,
            control_id: instance.control_id.clone(),
            outbound: self.outbound.clone(),
        };
        match callback(instance, context).await {
            Ok(()) => ExecuteActionResult::ok(),
            Err(err) => ExecuteActionResult::failed(err.to_string()),
        }
    }

    /// Apply host-pushed instance deltas; same bookkeeping as feedbacks but
    /// with no value to recompute.
    pub fn apply_instance_deltas(&self, deltas: InstanceDeltas<ActionInstance>) {
        for (id, delta) in deltas {
            match delta {
                None => self.forget_instance(&id),
                Some(instance) if instance.disabled => self.forget_instance(&id),
                Some(instance) => {
                    let mut run_subscribe = false;
                    match self.instances.entry(id.clone()) {
                        Entry::Occupied(mut entry) => {
                            entry.get_mut().instance = instance.clone();
                        }
                        Entry::Vacant(entry) => {
                            run_subscribe = true;
                            entry.insert(StoredAction { instance: instance.clone(), subscribed: false });
                        }
                    }
                    if run_subscribe {
                        self.run_subscribe(&id, &instance);
                    }
                }
            }
        }
    }

    fn run_subscribe(&self, id: &str, instance: &ActionInstance) {
        let Some(definition) = self.definitions.get(&instance.action_id) else {
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
                warn!(id = %id, error = %err, "action subscribe failed");
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
        let Some(definition) = self.definitions.get(&stored.instance.action_id) else {
            return;
        };
        if let Some(unsubscribe) = definition.unsubscribe.clone() {
            let id = id.to_string();
            let instance = stored.instance;
            tokio::spawn(async move {
                if let Err(err) = unsubscribe(instance).await {
                    warn!(id = %id, error = %err, "action unsubscribe failed");
                }
            });
        }
    }

    /// Run the definition's learn callback under a bounded timeout.
    pub async fn learn(
        &self,
        instance: ActionInstance,
        timeout: Option<Duration>,
    ) -> Result<Option<OptionValues>, ModuleError> {
        let definition = self
            .definitions
            .get(&instance.action_id)
            .ok_or_else(|| ModuleError::UnknownDefinition(instance.action_id.clone()))?;
        let learn = definition
            .learn
            .clone()
            .ok_or_else(|| ModuleError::LearnNotSupported(instance.action_id.clone()))?;
        drop(definition);

        let timeout = timeout.unwrap_or(self.learn_timeout);
        match tokio::time::timeout(timeout, learn(instance)).await {
            Ok(result) => result,
            Err(_) => Err(ModuleError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Best-effort `subscribe` for every instance of the given definition ids
    /// (empty = all), without touching instance bookkeeping.
    pub fn subscribe_all(&self, action_ids: &[String]) {
        self.for_each_matching(action_ids, true);
    }

    /// Best-effort `unsubscribe` for the matching subset, without removing
    /// the instances.
    pub fn unsubscribe_all(&self, action_ids: &[String]) {
        self.for_each_matching(action_ids, false);
    }

    fn for_each_matching(&self, action_ids: &[String], subscribe: bool) {
        for mut entry in self.instances.iter_mut() {
            let stored = entry.value_mut();
            if !action_ids.is_empty() && !action_ids.contains(&stored.instance.action_id) {
                continue;
            }
            let Some(definition) = self.definitions.get(&stored.instance.action_id) else {
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
                    warn!(id = %id, error = %err, "action lifecycle callback failed");
                }
            });
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

/// Ids of definitions that declare subscribe/unsubscribe but no hint about
/// which options affect re-subscription.
fn missing_resubscribe_hints(definitions: &HashMap<String, ActionDefinition>) -> Vec<String> {
    let mut flagged: Vec<String> = definitions
        .iter()
        .filter(|(_, def)| {
            (def.subscribe.is_some() || def.unsubscribe.is_some())
                && def.subscribe_relevant_options.is_none()
        })
        .map(|(id, _)| id.clone())
        .collect();
    flagged.sort();
    flagged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Envelope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::{Duration, sleep};

    fn instance(id: &str, action_id: &str) -> ActionInstance {
        ActionInstance {
            id: id.to_string(),
            control_id: "bank:2".to_string(),
            action_id: action_id.to_string(),
            ..Default::default()
        }
    }

    fn manager() -> (Arc<ActionManager>, mpsc::UnboundedReceiver<Envelope>) {
        let (outbound, rx) = Outbound::channel();
        (ActionManager::new(outbound), rx)
    }

    fn noop_definition(name: &str) -> ActionDefinition {
        ActionDefinition::new(name, Arc::new(|_, _| Box::pin(async { Ok(()) })))
    }

    #[tokio::test]
    async fn execute_converts_callback_failure_into_structured_result() {
        let (manager, _rx) = manager();
        let mut defs = HashMap::new();
        defs.insert(
            "press".to_string(),
            ActionDefinition::new(
                "Press",
                Arc::new(|_, _| Box::pin(async { Err(ModuleError::Callback("boom".into())) })),
            ),
        );
        manager.set_definitions(defs);

        let result = manager.execute(instance("a1", "press"), None).await;
        assert_eq!(result, ExecuteActionResult::failed("boom"));
    }

    #[tokio::test]
    async fn execute_unknown_definition_is_a_structured_failure() {
        let (manager, _rx) = manager();
        let result = manager.execute(instance("a1", "missing"), None).await;
        assert!(!result.success);
        assert_eq!(result.error_message.unwrap(), "definition 'missing' is not registered");
    }

    #[tokio::test]
    async fn execute_context_publishes_scoped_custom_variables() {
        let (manager, mut rx) = manager();
        let mut defs = HashMap::new();
        defs.insert(
            "press".to_string(),
            ActionDefinition::new(
                "Press",
                Arc::new(|_, ctx: ActionContext| {
                    Box::pin(async move {
                        ctx.set_custom_variable("lastPressed", json!("a1"));
                        Ok(())
                    })
                }),
            ),
        );
        manager.set_definitions(defs);
        // skip the definitions publish
        let _ = rx.recv().await;

        let result = manager.execute(instance("a1", "press"), Some("surface-7".into())).await;
        assert!(result.success);

        let Some(Envelope::Call(call)) = rx.recv().await else {
            panic!("expected a call")
        };
        assert_eq!(call.name, "setCustomVariable");
        let payload = call.payload.unwrap();
        assert_eq!(payload["controlId"], json!("bank:2"));
        assert_eq!(payload["name"], json!("lastPressed"));
    }

    #[tokio::test]
    async fn unsubscribe_fires_only_after_subscribe_ran() {
        let (manager, _rx) = manager();

        let unsubscribes = Arc::new(AtomicUsize::new(0));
        let unsub_c = unsubscribes.clone();

        let mut with_lifecycle = noop_definition("Press");
        with_lifecycle.subscribe = Some(Arc::new(|_| Box::pin(async { Ok(()) })));
        with_lifecycle.unsubscribe = Some(Arc::new(move |_| {
            let unsub = unsub_c.clone();
            Box::pin(async move {
                unsub.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
        with_lifecycle.subscribe_relevant_options = Some(vec!["channel".into()]);

        let mut defs = HashMap::new();
        defs.insert("press".to_string(), with_lifecycle);
        manager.set_definitions(defs);

        let mut deltas: InstanceDeltas<ActionInstance> = HashMap::new();
        deltas.insert("a1".to_string(), Some(instance("a1", "press")));
        manager.apply_instance_deltas(deltas);

        let mut removal: InstanceDeltas<ActionInstance> = HashMap::new();
        removal.insert("a1".to_string(), None);
        manager.apply_instance_deltas(removal.clone());
        manager.apply_instance_deltas(removal);
        sleep(Duration::from_millis(20)).await;

        assert_eq!(unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.instance_count(), 0);
    }

    #[test]
    fn lifecycle_without_hint_is_flagged() {
        let mut defs = HashMap::new();
        defs.insert("plain".to_string(), noop_definition("Plain"));

        let mut unhinted = noop_definition("Unhinted");
        unhinted.subscribe = Some(Arc::new(|_| Box::pin(async { Ok(()) })));
        defs.insert("unhinted".to_string(), unhinted);

        let mut hinted = noop_definition("Hinted");
        hinted.subscribe = Some(Arc::new(|_| Box::pin(async { Ok(()) })));
        hinted.subscribe_relevant_options = Some(vec!["host".into()]);
        defs.insert("hinted".to_string(), hinted);

        assert_eq!(missing_resubscribe_hints(&defs), vec!["unhinted".to_string()]);
    }
}
