//! Module-side bootstrap: wires the host call catalogue to a user-supplied
//! [`Module`] implementation and pumps newline-delimited JSON envelopes over
//! stdin/stdout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tracing::{error, level_filters::LevelFilter, warn};

use crate::action::ActionManager;
use crate::channel::{InboundHandler, Outbound, RpcChannel};
use crate::error::{ModuleError, RpcError};
use crate::events::EventTopic;
use crate::feedback::FeedbackManager;
use crate::registry;
use crate::rpc::{Envelope, HostMethod, ModuleMethod};
use crate::types::{
    ActionInstance, ActionInstanceDeltas, ConfigAndLabel, ExecuteActionParams,
    FeedbackInstanceDeltas, InitParams, LearnActionParams, LearnFeedbackParams, LearnedOptions,
    LogLevel, UpgradePassParams, UpgradePassReply,
};
use crate::upgrade::{UpgradePassOptions, UpgradeScript, run_upgrade_pass};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a freshly started runtime waits before complaining that nobody
/// listens to its transport-error topic.
pub const ERROR_LISTENER_GRACE: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------
// Module trait – implement this in your module code
// -----------------------------------------------------------------------------

#[async_trait]
pub trait Module: Send + 'static {
    /// Called once when the host initializes the module. Register action and
    /// feedback definitions through the context here.
    async fn init(&mut self, ctx: ModuleContext, params: InitParams) -> Result<(), ModuleError>;

    /// The host changed the config or the connection label.
    async fn config_updated(&mut self, update: ConfigAndLabel) -> Result<(), ModuleError>;

    /// Final teardown before the process exits.
    async fn destroy(&mut self);

    /// Ordered migration scripts for stored config, actions and feedbacks.
    fn upgrade_scripts(&self) -> Vec<UpgradeScript> {
        Vec::new()
    }
}

#[async_trait]
impl Module for Box<dyn Module> {
    async fn init(&mut self, ctx: ModuleContext, params: InitParams) -> Result<(), ModuleError> {
        (**self).init(ctx, params).await
    }
    async fn config_updated(&mut self, update: ConfigAndLabel) -> Result<(), ModuleError> {
        (**self).config_updated(update).await
    }
    async fn destroy(&mut self) {
        (**self).destroy().await
    }
    fn upgrade_scripts(&self) -> Vec<UpgradeScript> {
        (**self).upgrade_scripts()
    }
}

/// Handles a module gets to hold on to: the managers plus the host-facing
/// publish calls.
#[derive(Clone)]
pub struct ModuleContext {
    outbound: Outbound,
    pub actions: Arc<ActionManager>,
    pub feedbacks: Arc<FeedbackManager>,
}

impl ModuleContext {
    /// Persist a config the module rewrote on its own initiative.
    pub fn save_config(&self, config: Value) -> Result<(), RpcError> {
        self.outbound
            .send_fire_and_forget(ModuleMethod::SaveConfig.to_string(), Some(config))
    }

    /// Report a user-triggered action so the host can record it.
    pub fn record_action(&self, instance: ActionInstance) -> Result<(), RpcError> {
        let payload = serde_json::to_value(instance)?;
        self.outbound
            .send_fire_and_forget(ModuleMethod::RecordAction.to_string(), Some(payload))
    }
}

/// The assembled module side: managers, handler map and correlation layer.
/// Feed inbound envelopes through [`ModuleRuntime::receive`]; outbound
/// envelopes appear on the transport receiver paired with the `Outbound`
/// this was built with.
pub struct ModuleRuntime {
    channel: Arc<RpcChannel>,
    context: ModuleContext,
    transport_errors: Arc<EventTopic<String>>,
}

impl ModuleRuntime {
    pub fn new<M: Module>(module: M, outbound: Outbound) -> Self {
        let module = Arc::new(Mutex::new(module));
        let actions = ActionManager::new(outbound.clone());
        let feedbacks = FeedbackManager::new(outbound.clone());
        let context = ModuleContext { outbound: outbound.clone(), actions, feedbacks };

        let handlers = host_handlers(module, context.clone());
        let channel = Arc::new(RpcChannel::new(outbound, handlers, DEFAULT_CALL_TIMEOUT));

        let transport_errors = EventTopic::new("transport-error", 16);
        let _ = transport_errors.warn_if_unhandled(ERROR_LISTENER_GRACE);

        Self { channel, context, transport_errors }
    }

    pub fn channel(&self) -> Arc<RpcChannel> {
        self.channel.clone()
    }

    pub fn context(&self) -> ModuleContext {
        self.context.clone()
    }

    pub fn transport_errors(&self) -> Arc<EventTopic<String>> {
        self.transport_errors.clone()
    }

    pub fn receive(&self, envelope: Envelope) {
        self.channel.receive(envelope);
    }

    pub fn report_transport_error(&self, message: impl Into<String>) {
        self.transport_errors.publish(message.into());
    }
}

// -----------------------------------------------------------------------------
// Host call catalogue → handler map
// -----------------------------------------------------------------------------

fn parse<T: DeserializeOwned>(payload: Option<Value>) -> Result<T, ModuleError> {
    serde_json::from_value(payload.unwrap_or(Value::Null))
        .map_err(|err| ModuleError::InvalidParams(err.to_string()))
}

fn host_handlers<M: Module>(
    module: Arc<Mutex<M>>,
    context: ModuleContext,
) -> HashMap<String, InboundHandler> {
    let mut handlers: HashMap<String, InboundHandler> = HashMap::new();

    let (m, c) = (module.clone(), context.clone());
    handlers.insert(
        HostMethod::Init.to_string(),
        Arc::new(move |payload| {
            let (m, c) = (m.clone(), c.clone());
            Box::pin(async move {
                let params: InitParams = parse(payload)?;
                init_logging(params.log_level, params.log_dir.as_deref());
                m.lock().await.init(c, params).await?;
                Ok(None)
            })
        }),
    );

    let m = module.clone();
    handlers.insert(
        HostMethod::Destroy.to_string(),
        Arc::new(move |_| {
            let m = m.clone();
            Box::pin(async move {
                m.lock().await.destroy().await;
                Ok(None)
            })
        }),
    );

    let m = module.clone();
    handlers.insert(
        HostMethod::UpdateConfigAndLabel.to_string(),
        Arc::new(move |payload| {
            let m = m.clone();
            Box::pin(async move {
                let update: ConfigAndLabel = parse(payload)?;
                m.lock().await.config_updated(update).await?;
                Ok(None)
            })
        }),
    );

    let c = context.clone();
    handlers.insert(
        HostMethod::UpdateActionInstances.to_string(),
        Arc::new(move |payload| {
            let c = c.clone();
            Box::pin(async move {
                let deltas: ActionInstanceDeltas = parse(payload)?;
                c.actions.apply_instance_deltas(deltas.actions);
                Ok(None)
            })
        }),
    );

    let c = context.clone();
    handlers.insert(
        HostMethod::UpdateFeedbackInstances.to_string(),
        Arc::new(move |payload| {
            let c = c.clone();
            Box::pin(async move {
                let deltas: FeedbackInstanceDeltas = parse(payload)?;
                c.feedbacks.apply_instance_deltas(deltas.feedbacks);
                Ok(None)
            })
        }),
    );

    let c = context.clone();
    handlers.insert(
        HostMethod::ExecuteAction.to_string(),
        Arc::new(move |payload| {
            let c = c.clone();
            Box::pin(async move {
                let params: ExecuteActionParams = parse(payload)?;
                let result = c.actions.execute(params.action, params.surface_id).await;
                Ok(Some(serde_json::to_value(result)?))
            })
        }),
    );

    let c = context.clone();
    handlers.insert(
        HostMethod::LearnAction.to_string(),
        Arc::new(move |payload| {
            let c = c.clone();
            Box::pin(async move {
                let params: LearnActionParams = parse(payload)?;
                let timeout = params.timeout_ms.map(Duration::from_millis);
                match c.actions.learn(params.action, timeout).await? {
                    Some(options) => Ok(Some(serde_json::to_value(LearnedOptions { options })?)),
                    None => Ok(None),
                }
            })
        }),
    );

    let c = context.clone();
    handlers.insert(
        HostMethod::LearnFeedback.to_string(),
        Arc::new(move |payload| {
            let c = c.clone();
            Box::pin(async move {
                let params: LearnFeedbackParams = parse(payload)?;
                let timeout = params.timeout_ms.map(Duration::from_millis);
                match c.feedbacks.learn(params.feedback, timeout).await? {
                    Some(options) => Ok(Some(serde_json::to_value(LearnedOptions { options })?)),
                    None => Ok(None),
                }
            })
        }),
    );

    let m = module.clone();
    handlers.insert(
        HostMethod::RunUpgradePass.to_string(),
        Arc::new(move |payload| {
            let m = m.clone();
            Box::pin(async move {
                let params: UpgradePassParams = parse(payload)?;
                let scripts = m.lock().await.upgrade_scripts();
                let outcome = run_upgrade_pass(
                    &scripts,
                    params.config,
                    params.secrets,
                    params.actions,
                    params.feedbacks,
                    &UpgradePassOptions {
                        default_index: params.default_index,
                        skip_config: params.skip_config,
                    },
                );
                let reply = UpgradePassReply {
                    updated_config: outcome.config_updated.then_some(outcome.config),
                    updated_secrets: outcome.config_updated.then_some(outcome.secrets),
                    updated_action_ids: outcome
                        .actions
                        .iter()
                        .filter(|m| m.updated)
                        .map(|m| m.item.id.clone())
                        .collect(),
                    updated_feedback_ids: outcome
                        .feedbacks
                        .iter()
                        .filter(|m| m.updated)
                        .map(|m| m.item.id.clone())
                        .collect(),
                    actions: outcome.actions.into_iter().map(|m| m.item).collect(),
                    feedbacks: outcome.feedbacks.into_iter().map(|m| m.item).collect(),
                };
                Ok(Some(serde_json::to_value(reply)?))
            })
        }),
    );

    handlers
}

// -----------------------------------------------------------------------------
// Logging – initialized once, from the host's init params
// -----------------------------------------------------------------------------

/// Stdout carries the protocol, so logs go to a daily file when a directory
/// was supplied and to stderr otherwise.
fn init_logging(level: LogLevel, log_dir: Option<&str>) {
    static LOG_INIT: std::sync::Once = std::sync::Once::new();
    LOG_INIT.call_once(|| {
        let level = match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        };

        let installed = if let Some(dir) = log_dir {
            std::fs::create_dir_all(dir).ok(); // best-effort
            let file_appender = tracing_appender::rolling::daily(dir, "module.log");
            tracing::subscriber::set_global_default(
                tracing_subscriber::fmt()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(file_appender)
                    .with_max_level(level)
                    .finish(),
            )
        } else {
            tracing::subscriber::set_global_default(
                tracing_subscriber::fmt()
                    .with_ansi(false)
                    .with_writer(std::io::stderr)
                    .with_max_level(level)
                    .finish(),
            )
        };
        if installed.is_err() {
            eprintln!("logging setup failed: a subscriber is already installed");
        }
    });
}

// -----------------------------------------------------------------------------
// Runtime function – spawn read / write loops
// -----------------------------------------------------------------------------

/// Runs the module against stdin/stdout until EOF or a fatal read error.
pub async fn run_module<M: Module>(module: M) -> Result<()> {
    let (outbound, mut outbound_rx) = Outbound::channel();
    let runtime = ModuleRuntime::new(module, outbound);

    // writer task: envelopes → one JSON line each
    tokio::spawn(async move {
        let mut w = BufWriter::new(io::stdout());
        while let Some(envelope) = outbound_rx.recv().await {
            let line = match serde_json::to_string(&envelope) {
                Ok(line) => line,
                Err(err) => {
                    error!(error = %err, "dropping unserializable envelope");
                    continue;
                }
            };
            if w.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if w.write_all(b"\n").await.is_err() {
                break;
            }
            if w.flush().await.is_err() {
                eprintln!("stdout flush error");
                break;
            }
        }
    });

    // reader loop: one envelope per line, dispatched through the channel
    let mut reader = BufReader::new(io::stdin());
    let mut line = String::new();
    while reader.read_line(&mut line).await? != 0 {
        trim_newlines(&mut line);
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => runtime.receive(envelope),
            Err(err) => {
                // malformed input must not take the pump down
                runtime.report_transport_error(err.to_string());
                warn!(error = %err, "dropping malformed envelope");
            }
        }
        line.clear();
    }

    Ok(())
}

/// Like [`run_module`], with the module taken from the process-wide
/// [registry](crate::registry).
pub async fn run_registered_module() -> Result<()> {
    let factory = registry::registered_factory()
        .ok_or_else(|| anyhow::anyhow!("no module factory registered"))?;
    run_module(factory()).await
}

fn trim_newlines(s: &mut String) {
    while matches!(s.chars().last(), Some('\n' | '\r')) {
        s.pop();
    }
}
