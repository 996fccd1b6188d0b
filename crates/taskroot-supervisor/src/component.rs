//! Child-side runtime for supervised components.
//!
//! A child learns everything from three environment variables set by the
//! supervisor: its component name, the serialized [`ControlPlaneConfig`] and
//! the [`StoreAccess`] descriptor. It runs until its stdin reaches EOF, which
//! is how the supervisor asks it to stop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use taskroot_beat::{DatabaseScheduler, TaskDispatcher, TracingDispatcher};
use taskroot_core::defaults::BEAT_TICK_SECS;
use taskroot_core::{ControlPlaneConfig, Error, EventStore, Result};

use crate::factory::StoreAccess;

/// Component name of the child.
pub const ENV_COMPONENT: &str = "TASKROOT_COMPONENT";
/// JSON-encoded [`ControlPlaneConfig`].
pub const ENV_CONFIG: &str = "TASKROOT_CONFIG";
/// JSON-encoded [`StoreAccess`].
pub const ENV_STORE: &str = "TASKROOT_STORE";

/// What a running component gets handed.
pub struct ComponentContext {
    pub name: String,
    pub config: ControlPlaneConfig,
    pub store: Arc<dyn EventStore>,
}

/// A long-running unit of work hosted in its own process.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    /// Run until `shutdown` flips to true.
    async fn run(&self, ctx: ComponentContext, shutdown: watch::Receiver<bool>) -> Result<()>;
}

/// Periodic task scheduler for the configured app.
pub struct BeatComponent {
    dispatcher: Arc<dyn TaskDispatcher>,
    tick: Duration,
}

impl BeatComponent {
    pub fn new(dispatcher: Arc<dyn TaskDispatcher>, tick: Duration) -> Self {
        Self { dispatcher, tick }
    }
}

impl Default for BeatComponent {
    fn default() -> Self {
        Self::new(
            Arc::new(TracingDispatcher),
            Duration::from_secs_f64(BEAT_TICK_SECS),
        )
    }
}

#[async_trait]
impl Component for BeatComponent {
    fn name(&self) -> &str {
        "beat"
    }

    async fn run(&self, ctx: ComponentContext, shutdown: watch::Receiver<bool>) -> Result<()> {
        let beat = ctx
            .config
            .beat
            .clone()
            .ok_or_else(|| Error::Config("beat component started without beat settings".into()))?;
        beat.validate()?;
        DatabaseScheduler::new(ctx.store, beat)
            .run(self.dispatcher.clone(), self.tick, shutdown)
            .await
    }
}

/// Components a child binary can run, by name.
#[derive(Default)]
pub struct ComponentRegistry {
    components: BTreeMap<String, Arc<dyn Component>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `beat` component.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BeatComponent::default()));
        registry
    }

    /// Register a component, replacing any previous one with the same name.
    pub fn register(&mut self, component: Arc<dyn Component>) {
        let name = component.name().to_string();
        debug!(subsystem = "supervisor", component = %name, "Registered component");
        self.components.insert(name, component);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Component>> {
        self.components.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.components.keys().map(String::as_str).collect()
    }
}

/// Launch parameters passed from supervisor to child.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEnv {
    pub component: String,
    pub config: ControlPlaneConfig,
    pub store: StoreAccess,
}

impl ChildEnv {
    /// Environment variables carrying this value.
    pub fn vars(&self) -> Result<Vec<(&'static str, String)>> {
        Ok(vec![
            (ENV_COMPONENT, self.component.clone()),
            (ENV_CONFIG, self.config.to_json()?),
            (ENV_STORE, self.store.to_json()?),
        ])
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::Config(format!("{} is not set", key)))
        };
        Ok(Self {
            component: require(ENV_COMPONENT)?,
            config: ControlPlaneConfig::from_json(&require(ENV_CONFIG)?)?,
            store: StoreAccess::from_json(&require(ENV_STORE)?)?,
        })
    }
}

/// Flips to true once stdin reaches EOF or fails.
pub fn stdin_eof_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        let _ = tx.send(true);
    });
    rx
}

/// Resolve the store and run the component named in `env`.
pub async fn run_with(
    registry: &ComponentRegistry,
    env: ChildEnv,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let component = registry.get(&env.component).ok_or_else(|| {
        Error::NotFound(format!(
            "component {} (known: {})",
            env.component,
            registry.names().join(", ")
        ))
    })?;
    let store = env.store.open().await?;

    info!(
        subsystem = "supervisor",
        component = %env.component,
        pid = std::process::id(),
        "Component started"
    );
    let ctx = ComponentContext {
        name: env.component.clone(),
        config: env.config,
        store: store.clone(),
    };
    let result = component.run(ctx, shutdown).await;

    if let Err(e) = store.close().await {
        warn!(subsystem = "supervisor", component = %env.component, error = %e, "Store close failed");
    }
    match &result {
        Ok(()) => info!(subsystem = "supervisor", component = %env.component, "Component stopped"),
        Err(e) => warn!(
            subsystem = "supervisor",
            component = %env.component,
            error = %e,
            "Component failed"
        ),
    }
    result
}

/// Entry point of a child process: JSON logging to stdout, launch
/// parameters from the environment, stop on stdin EOF.
pub async fn run_component(registry: &ComponentRegistry) -> Result<()> {
    crate::logging::init_child_logging()?;
    let env = ChildEnv::from_env()?;
    run_with(registry, env, stdin_eof_signal()).await
}
