//! # Fixtures Module / 夹具模块
//!
//! Shared resources injected into test-class constructors, scoped to the
//! assembly, a collection or a class. A [`FixtureManager`] per scope owns a
//! map from fixture type to exactly one instance; lookups walk up the parent
//! chain, but a manager only ever disposes what it constructed itself.
//!
//! Rust has no runtime reflection, so a fixture type is described by a
//! [`FixtureDefinition`]: its constructors (typed parameters plus a factory)
//! and the lifecycle capabilities it implements, recorded once when the
//! definition is built.
//!
//! 注入测试类构造函数的共享资源，作用域为程序集、集合或类。
//! 每个作用域的 [`FixtureManager`] 为每种夹具类型最多持有一个实例。

use futures::future::{self, join_all, BoxFuture, FutureExt};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

use crate::core::aggregator::ExceptionAggregator;
use crate::core::failure::Failure;
use crate::core::parallelism::ContinuationGate;

/// A constructed fixture or test-class instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

type AsyncHook = for<'a> fn(&'a (dyn Any + Send + Sync)) -> BoxFuture<'a, anyhow::Result<()>>;
type SyncHook = fn(&(dyn Any + Send + Sync)) -> anyhow::Result<()>;
type Factory = Arc<dyn Fn(&FixtureArgs) -> anyhow::Result<Instance> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FixtureError {
    #[error("Fixture type '{0}' is not available in this scope or any parent scope")]
    Unresolved(&'static str),
    #[error("Fixture type '{type_name}' must have exactly one constructor, found {count}")]
    ConstructorCount { type_name: &'static str, count: usize },
    #[error("Fixture type '{type_name}' had one or more unresolved constructor arguments: {}", .parameters.join(", "))]
    UnresolvedArguments {
        type_name: &'static str,
        parameters: Vec<String>,
    },
    #[error("The following constructor parameters did not have matching fixture data: {}", .0.join(", "))]
    UnresolvedParameters(Vec<String>),
    #[error("Fixture instance is not a '{0}'")]
    TypeMismatch(&'static str),
    #[error("Constructor argument {index} is missing")]
    MissingArgument { index: usize },
}

/// Identity of a fixture type.
#[derive(Clone, Copy)]
pub struct FixtureKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl FixtureKey {
    pub fn of<T: Any>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn short_name(&self) -> &'static str {
        self.type_name.rsplit("::").next().unwrap_or(self.type_name)
    }
}

impl PartialEq for FixtureKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for FixtureKey {}

impl Hash for FixtureKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for FixtureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

/// A named, typed constructor parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub key: FixtureKey,
}

impl Parameter {
    pub fn of<T: Any>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: FixtureKey::of::<T>(),
        }
    }

    fn describe(&self) -> String {
        format!("{} {}", self.key.short_name(), self.name)
    }
}

/// Resolved constructor arguments, in parameter order.
#[derive(Clone, Debug, Default)]
pub struct FixtureArgs {
    values: Vec<Instance>,
}

impl FixtureArgs {
    pub fn new(values: Vec<Instance>) -> Self {
        Self { values }
    }

    pub fn get<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>, FixtureError> {
        let value = self
            .values
            .get(index)
            .cloned()
            .ok_or(FixtureError::MissingArgument { index })?;
        value
            .downcast::<T>()
            .map_err(|_| FixtureError::TypeMismatch(std::any::type_name::<T>()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One way of building a fixture.
#[derive(Clone)]
pub struct Constructor {
    pub parameters: Vec<Parameter>,
    factory: Factory,
}

impl Constructor {
    pub fn create(&self, args: &FixtureArgs) -> anyhow::Result<Instance> {
        (self.factory)(args)
    }
}

/// Shared setup and teardown performed asynchronously.
pub trait AsyncLifetime: Send + Sync + 'static {
    fn initialize(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    fn dispose_async(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        future::ready(Ok(())).boxed()
    }
}

pub trait AsyncDisposable: Send + Sync + 'static {
    fn dispose_async(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

pub trait Disposable: Send + Sync + 'static {
    fn dispose(&self) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Default)]
struct Capabilities {
    initialize: Option<AsyncHook>,
    dispose_async: Option<AsyncHook>,
    dispose: Option<SyncHook>,
}

/// Describes a fixture (or test-class) type.
pub struct FixtureDefinition {
    key: FixtureKey,
    constructors: Vec<Constructor>,
    capabilities: Capabilities,
}

impl FixtureDefinition {
    pub fn builder<T: Any + Send + Sync>() -> FixtureBuilder<T> {
        FixtureBuilder {
            constructors: Vec::new(),
            capabilities: Capabilities::default(),
            _marker: PhantomData,
        }
    }

    /// A type with a single parameterless constructor.
    pub fn simple<T: Any + Send + Sync>(
        factory: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::builder::<T>()
            .constructor(Vec::new(), move |_| factory())
            .build()
    }

    pub fn key(&self) -> FixtureKey {
        self.key
    }

    /// The single constructor; any other count is a configuration error.
    pub fn constructor(&self) -> Result<&Constructor, FixtureError> {
        match self.constructors.as_slice() {
            [only] => Ok(only),
            others => Err(FixtureError::ConstructorCount {
                type_name: self.key.short_name(),
                count: others.len(),
            }),
        }
    }

    pub fn has_async_lifetime(&self) -> bool {
        self.capabilities.initialize.is_some()
    }

    pub fn is_async_disposable(&self) -> bool {
        self.capabilities.dispose_async.is_some()
    }

    pub fn is_disposable(&self) -> bool {
        self.capabilities.dispose.is_some()
    }

    /// Builds an instance with the single constructor.
    pub fn create(&self, args: &FixtureArgs) -> anyhow::Result<Instance> {
        let instance = self.constructor()?.create(args)?;
        if (*instance).type_id() != self.key.type_id {
            return Err(FixtureError::TypeMismatch(self.key.type_name).into());
        }
        Ok(instance)
    }

    /// Runs the async initialization hook, if the type has one.
    pub fn initialize<'a>(&self, instance: &'a Instance) -> BoxFuture<'a, anyhow::Result<()>> {
        match self.capabilities.initialize {
            Some(hook) => hook(instance.as_ref()),
            None => future::ready(Ok(())).boxed(),
        }
    }

    /// Disposes an instance: the async hook when present, otherwise the sync
    /// one.
    pub async fn dispose(&self, instance: &Instance) -> anyhow::Result<()> {
        if let Some(hook) = self.capabilities.dispose_async {
            hook(instance.as_ref()).await
        } else if let Some(hook) = self.capabilities.dispose {
            hook(instance.as_ref())
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for FixtureDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureDefinition")
            .field("key", &self.key)
            .field("constructors", &self.constructors.len())
            .field("async_lifetime", &self.has_async_lifetime())
            .field("async_disposable", &self.is_async_disposable())
            .field("disposable", &self.is_disposable())
            .finish()
    }
}

/// Typed builder for [`FixtureDefinition`]. Capabilities are only available
/// when `T` implements the matching trait.
pub struct FixtureBuilder<T> {
    constructors: Vec<Constructor>,
    capabilities: Capabilities,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> FixtureBuilder<T> {
    pub fn constructor(
        mut self,
        parameters: Vec<Parameter>,
        factory: impl Fn(&FixtureArgs) -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Self {
        self.constructors.push(Constructor {
            parameters,
            factory: Arc::new(move |args| Ok(Arc::new(factory(args)?) as Instance)),
        });
        self
    }

    pub fn build(self) -> Arc<FixtureDefinition> {
        Arc::new(FixtureDefinition {
            key: FixtureKey::of::<T>(),
            constructors: self.constructors,
            capabilities: self.capabilities,
        })
    }
}

impl<T: AsyncLifetime> FixtureBuilder<T> {
    pub fn async_lifetime(mut self) -> Self {
        self.capabilities.initialize = Some(initialize_hook::<T>);
        self.capabilities.dispose_async = Some(lifetime_dispose_hook::<T>);
        self
    }
}

impl<T: AsyncDisposable> FixtureBuilder<T> {
    pub fn async_disposable(mut self) -> Self {
        self.capabilities.dispose_async = Some(async_dispose_hook::<T>);
        self
    }
}

impl<T: Disposable> FixtureBuilder<T> {
    pub fn disposable(mut self) -> Self {
        self.capabilities.dispose = Some(dispose_hook::<T>);
        self
    }
}

fn mismatch<T>() -> anyhow::Error {
    FixtureError::TypeMismatch(std::any::type_name::<T>()).into()
}

fn initialize_hook<T: AsyncLifetime>(
    instance: &(dyn Any + Send + Sync),
) -> BoxFuture<'_, anyhow::Result<()>> {
    match instance.downcast_ref::<T>() {
        Some(fixture) => fixture.initialize(),
        None => future::ready(Err(mismatch::<T>())).boxed(),
    }
}

fn lifetime_dispose_hook<T: AsyncLifetime>(
    instance: &(dyn Any + Send + Sync),
) -> BoxFuture<'_, anyhow::Result<()>> {
    match instance.downcast_ref::<T>() {
        Some(fixture) => AsyncLifetime::dispose_async(fixture),
        None => future::ready(Err(mismatch::<T>())).boxed(),
    }
}

fn async_dispose_hook<T: AsyncDisposable>(
    instance: &(dyn Any + Send + Sync),
) -> BoxFuture<'_, anyhow::Result<()>> {
    match instance.downcast_ref::<T>() {
        Some(fixture) => AsyncDisposable::dispose_async(fixture),
        None => future::ready(Err(mismatch::<T>())).boxed(),
    }
}

fn dispose_hook<T: Disposable>(instance: &(dyn Any + Send + Sync)) -> anyhow::Result<()> {
    match instance.downcast_ref::<T>() {
        Some(fixture) => fixture.dispose(),
        None => Err(mismatch::<T>()),
    }
}

/// The lifetime a manager's fixtures are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureScope {
    Assembly,
    Collection,
    Class,
}

#[derive(Default)]
struct ScopeState {
    instances: HashMap<FixtureKey, Instance>,
    /// Fixtures this manager constructed, in construction order.
    owned: Vec<(Arc<FixtureDefinition>, Instance)>,
}

/// Registry of fixtures for one scope.
pub struct FixtureManager {
    scope: FixtureScope,
    parent: Option<Arc<FixtureManager>>,
    state: Mutex<ScopeState>,
    /// Serializes construction so a type is built at most once.
    init_lock: tokio::sync::Mutex<()>,
    gate: ContinuationGate,
}

impl FixtureManager {
    pub fn new(scope: FixtureScope, parent: Option<Arc<FixtureManager>>) -> Self {
        Self::with_gate(scope, parent, ContinuationGate::unbounded())
    }

    pub fn with_gate(
        scope: FixtureScope,
        parent: Option<Arc<FixtureManager>>,
        gate: ContinuationGate,
    ) -> Self {
        Self {
            scope,
            parent,
            state: Mutex::new(ScopeState::default()),
            init_lock: tokio::sync::Mutex::new(()),
            gate,
        }
    }

    pub fn scope(&self) -> FixtureScope {
        self.scope
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local(&self, key: &FixtureKey) -> Option<Instance> {
        self.state().instances.get(key).cloned()
    }

    /// The instance of `key` held by this scope or the nearest ancestor.
    pub fn get_fixture(&self, key: FixtureKey) -> Result<Instance, FixtureError> {
        let mut manager = Some(self);
        while let Some(current) = manager {
            if let Some(instance) = current.local(&key) {
                return Ok(instance);
            }
            manager = current.parent.as_deref();
        }
        Err(FixtureError::Unresolved(key.type_name))
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>, FixtureError> {
        self.get_fixture(FixtureKey::of::<T>())?
            .downcast::<T>()
            .map_err(|_| FixtureError::TypeMismatch(std::any::type_name::<T>()))
    }

    /// Constructs every requested fixture this scope does not hold yet, then
    /// runs the async initialization hooks of the new ones concurrently.
    ///
    /// Configuration errors, constructor failures and hook failures are
    /// captured in `aggregator` per definition. With `create_instances` set
    /// to `false` the definitions are only validated.
    pub async fn initialize(
        &self,
        definitions: &[Arc<FixtureDefinition>],
        create_instances: bool,
        aggregator: &mut ExceptionAggregator,
    ) {
        let _guard = self.init_lock.lock().await;

        let mut pending: HashMap<FixtureKey, Instance> = HashMap::new();
        let mut constructed: Vec<(Arc<FixtureDefinition>, Instance)> = Vec::new();

        for definition in definitions {
            let key = definition.key();
            if pending.contains_key(&key) || self.local(&key).is_some() {
                continue;
            }
            let constructor = match definition.constructor() {
                Ok(constructor) => constructor,
                Err(e) => {
                    aggregator.add(Failure::from_error(&e));
                    continue;
                }
            };
            if !create_instances {
                continue;
            }

            let mut values = Vec::with_capacity(constructor.parameters.len());
            let mut missing = Vec::new();
            for parameter in &constructor.parameters {
                match pending
                    .get(&parameter.key)
                    .cloned()
                    .map(Ok)
                    .unwrap_or_else(|| self.get_fixture(parameter.key))
                {
                    Ok(instance) => values.push(instance),
                    Err(_) => missing.push(parameter.describe()),
                }
            }
            if !missing.is_empty() {
                aggregator.add(Failure::from_error(&FixtureError::UnresolvedArguments {
                    type_name: key.short_name(),
                    parameters: missing,
                }));
                continue;
            }

            let args = FixtureArgs::new(values);
            if let Some(instance) = aggregator.run(|| definition.create(&args)) {
                trace!(scope = ?self.scope, fixture = key.type_name(), "constructed fixture");
                pending.insert(key, instance.clone());
                constructed.push((definition.clone(), instance));
            }
        }

        let initializations = constructed
            .iter()
            .filter(|(definition, _)| definition.has_async_lifetime())
            .map(|(definition, instance)| {
                self.gate
                    .run(AssertUnwindSafe(definition.initialize(instance)).catch_unwind())
            });
        for result in join_all(initializations).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(error)) => aggregator.add(error),
                Err(payload) => aggregator.add(Failure::from_panic(payload)),
            }
        }

        if !constructed.is_empty() {
            debug!(scope = ?self.scope, count = constructed.len(), "fixtures ready");
        }
        let mut state = self.state();
        for (definition, instance) in constructed {
            state.instances.insert(definition.key(), instance.clone());
            state.owned.push((definition, instance));
        }
    }

    /// Resolves every parameter against this scope chain, reporting all
    /// unresolved parameters at once.
    pub fn resolve_arguments(&self, parameters: &[Parameter]) -> Result<FixtureArgs, FixtureError> {
        let mut values = Vec::with_capacity(parameters.len());
        let mut missing = Vec::new();
        for parameter in parameters {
            match self.get_fixture(parameter.key) {
                Ok(instance) => values.push(instance),
                Err(_) => missing.push(parameter.describe()),
            }
        }
        if missing.is_empty() {
            Ok(FixtureArgs::new(values))
        } else {
            Err(FixtureError::UnresolvedParameters(missing))
        }
    }

    /// Disposes the fixtures this scope constructed, newest first. Async
    /// disposals run before sync ones; each failure is captured on its own.
    pub async fn dispose(&self, aggregator: &mut ExceptionAggregator) {
        let owned = {
            let mut state = self.state();
            state.instances.clear();
            std::mem::take(&mut state.owned)
        };
        if owned.is_empty() {
            return;
        }
        debug!(scope = ?self.scope, count = owned.len(), "disposing fixtures");

        for (definition, instance) in owned.iter().rev() {
            if let Some(hook) = definition.capabilities.dispose_async {
                let disposal = self
                    .gate
                    .run(AssertUnwindSafe(hook(instance.as_ref())).catch_unwind())
                    .await;
                match disposal {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => aggregator.add(error),
                    Err(payload) => aggregator.add(Failure::from_panic(payload)),
                }
            }
        }
        for (definition, instance) in owned.iter().rev() {
            if definition.capabilities.dispose_async.is_some() {
                continue;
            }
            if let Some(hook) = definition.capabilities.dispose {
                match panic::catch_unwind(AssertUnwindSafe(|| hook(instance.as_ref()))) {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => aggregator.add(error),
                    Err(payload) => aggregator.add(Failure::from_panic(payload)),
                }
            }
        }
    }
}

impl fmt::Debug for FixtureManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureManager")
            .field("scope", &self.scope)
            .field("fixtures", &self.state().instances.len())
            .finish_non_exhaustive()
    }
}
