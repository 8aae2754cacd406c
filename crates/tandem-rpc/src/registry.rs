//! Controller registry and action bindings.
//!
//! Built once at startup.  Each binding is immutable: the wire action name
//! (an `Async` suffix in the source name is trimmed), the parameter arity,
//! the per-action markers, and a type-erased async invoke closure that
//! deserializes arguments positionally and serializes the result.
//!
//! Controller instances are produced per request through the
//! [`ScopeFactory`] seam; the scope is dropped as soon as the invocation
//! returns.

use crate::auth::Principal;
use crate::connection::Connection;
use crate::error::RpcError;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tandem_protocol::{ActionName, Status};

/// A resolved controller instance, shared for the duration of one call.
pub type ControllerInstance = Arc<dyn Any + Send + Sync>;

/// One controller scope, alive for a single request.
pub trait ControllerScope: Send {
    fn resolve(&mut self, controller: &str) -> Option<ControllerInstance>;
}

/// Produces a fresh scope per inbound request.
pub trait ScopeFactory: Send + Sync {
    fn new_scope(&self) -> Box<dyn ControllerScope>;
}

/// Per-request context handed to every action handler.
pub struct CallContext {
    /// The connection the request arrived on; handlers use it to call the
    /// peer back.
    pub connection: Connection,
    /// Identity bound to the connection at dispatch time.
    pub principal: Principal,
    pub action: ActionName,
}

/// Errors an action handler may produce.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// Maps to the `BadRequest` wire status with the given message.
    #[error("{0}")]
    BadRequest(String),
    /// Logged on the listener and masked as
    /// `InternalError("Internal Server Error")` on the wire.
    #[error("{0}")]
    Internal(String),
}

impl From<RpcError> for ActionError {
    fn from(e: RpcError) -> Self {
        ActionError::Internal(e.to_string())
    }
}

/// A pre-built response: status, payload bytes, payload codec.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub status: Status,
    pub payload: Vec<u8>,
    pub encoding: Option<String>,
}

impl ActionResult {
    /// Serialize `value` with the default JSON codec under `Ok`.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, ActionError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| ActionError::Internal(format!("result serialization: {e}")))?;
        Ok(ActionResult {
            status: Status::Ok,
            payload,
            encoding: None,
        })
    }

    /// Pre-encoded binary payload under `Ok` with the `protobuf` codec name.
    pub fn protobuf(payload: Vec<u8>) -> Self {
        ActionResult {
            status: Status::Ok,
            payload,
            encoding: Some(tandem_protocol::encoding::PROTOBUF.to_owned()),
        }
    }

    /// An error response; the message travels as a JSON string.
    pub(crate) fn error(status: Status, message: impl AsRef<str>) -> Self {
        ActionResult {
            status,
            payload: serde_json::to_vec(message.as_ref()).unwrap_or_default(),
            encoding: None,
        }
    }
}

/// Per-action markers honored by the dispatch pipeline and the transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct ActionMarkers {
    /// Bypass the authentication check for this action.
    pub allow_anonymous: bool,
    /// Fire-and-forget: remote callers are expected to send no uid.
    pub notification: bool,
    /// Hint to disable Nagle for connections serving this action.
    pub tcp_no_delay: bool,
    /// Responses default to the `protobuf` codec name.
    pub produces_protobuf: bool,
}

pub(crate) type InvokeFuture = BoxFuture<'static, Result<ActionResult, ActionError>>;
type InvokeFn =
    dyn Fn(ControllerInstance, CallContext, Vec<Box<RawValue>>) -> InvokeFuture + Send + Sync;

/// An immutable action binding.
#[derive(Clone)]
pub struct ActionBinding {
    /// Wire name (source `Async` suffix trimmed, original casing kept).
    pub action: String,
    pub arity: usize,
    pub markers: ActionMarkers,
    invoke: Arc<InvokeFn>,
}

impl ActionBinding {
    pub(crate) fn invoke(
        &self,
        instance: ControllerInstance,
        ctx: CallContext,
        args: Vec<Box<RawValue>>,
    ) -> InvokeFuture {
        (self.invoke)(instance, ctx, args)
    }
}

/// A named controller with its action table.
pub struct ControllerEntry {
    pub name: String,
    /// Type-level anonymous-access marker.
    pub allow_anonymous: bool,
    /// Keyed by lowercased wire name for case-insensitive matching.
    actions: HashMap<String, ActionBinding>,
}

impl ControllerEntry {
    pub fn find_action(&self, action: &str) -> Option<&ActionBinding> {
        self.actions.get(&action.to_ascii_lowercase())
    }
}

/// The registry of everything the local peer exposes.
#[derive(Default)]
pub struct ControllerRegistry {
    controllers: HashMap<String, ControllerEntry>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or reopen) the controller `name` backed by instances of `C`.
    pub fn controller<C: Send + Sync + 'static>(&mut self, name: &str) -> ControllerBuilder<'_, C> {
        let entry = self
            .controllers
            .entry(name.to_owned())
            .or_insert_with(|| ControllerEntry {
                name: name.to_owned(),
                allow_anonymous: false,
                actions: HashMap::new(),
            });
        ControllerBuilder {
            entry,
            _controller: std::marker::PhantomData,
        }
    }

    pub fn controller_entry(&self, name: &str) -> Option<&ControllerEntry> {
        self.controllers.get(name)
    }

    /// True when any registered action carries the no-delay hint.
    pub fn wants_tcp_no_delay(&self) -> bool {
        self.controllers
            .values()
            .flat_map(|c| c.actions.values())
            .any(|b| b.markers.tcp_no_delay)
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

/// Strip a trailing `Async` from a source method name for wire matching.
fn wire_name(source: &str) -> &str {
    match source.strip_suffix("Async") {
        Some(base) if !base.is_empty() => base,
        _ => source,
    }
}

fn parse_arg<T: DeserializeOwned>(args: &[Box<RawValue>], index: usize) -> Result<T, ActionError> {
    let raw = args
        .get(index)
        .ok_or_else(|| ActionError::BadRequest("Argument count mismatch.".to_owned()))?;
    serde_json::from_str(raw.get()).map_err(|e| {
        ActionError::BadRequest(format!("Failed to deserialize argument {}: {e}", index + 1))
    })
}

fn downcast<C: Send + Sync + 'static>(instance: ControllerInstance) -> Result<Arc<C>, ActionError> {
    instance
        .downcast::<C>()
        .map_err(|_| ActionError::Internal("controller instance has the wrong type".to_owned()))
}

/// Adds actions to one controller.  Typed variants deserialize each
/// argument positionally and serialize the return value as JSON; the raw
/// variant hands over the argument slices and must build its own
/// [`ActionResult`].
pub struct ControllerBuilder<'r, C> {
    entry: &'r mut ControllerEntry,
    _controller: std::marker::PhantomData<C>,
}

impl<C: Send + Sync + 'static> ControllerBuilder<'_, C> {
    /// Mark the whole controller anonymous-accessible.
    pub fn allow_anonymous(self) -> Self {
        self.entry.allow_anonymous = true;
        self
    }

    fn insert(self, source_name: &str, arity: usize, markers: ActionMarkers, invoke: Arc<InvokeFn>) -> Self {
        let action = wire_name(source_name).to_owned();
        let binding = ActionBinding {
            action: action.clone(),
            arity,
            markers,
            invoke,
        };
        self.entry.actions.insert(action.to_ascii_lowercase(), binding);
        self
    }

    pub fn action0<F, Fut, R>(self, name: &str, f: F) -> Self
    where
        F: Fn(Arc<C>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ActionError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.action0_with(name, ActionMarkers::default(), f)
    }

    pub fn action0_with<F, Fut, R>(self, name: &str, markers: ActionMarkers, f: F) -> Self
    where
        F: Fn(Arc<C>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ActionError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            name,
            0,
            markers,
            Arc::new(move |instance, ctx, _args| {
                let f = f.clone();
                Box::pin(async move {
                    let controller = downcast::<C>(instance)?;
                    let value = f(controller, ctx).await?;
                    ActionResult::json(&value)
                })
            }),
        )
    }

    pub fn action1<A0, F, Fut, R>(self, name: &str, f: F) -> Self
    where
        A0: DeserializeOwned + Send + 'static,
        F: Fn(Arc<C>, CallContext, A0) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ActionError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.action1_with(name, ActionMarkers::default(), f)
    }

    pub fn action1_with<A0, F, Fut, R>(self, name: &str, markers: ActionMarkers, f: F) -> Self
    where
        A0: DeserializeOwned + Send + 'static,
        F: Fn(Arc<C>, CallContext, A0) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ActionError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            name,
            1,
            markers,
            Arc::new(move |instance, ctx, args| {
                let f = f.clone();
                Box::pin(async move {
                    let controller = downcast::<C>(instance)?;
                    let a0: A0 = parse_arg(&args, 0)?;
                    let value = f(controller, ctx, a0).await?;
                    ActionResult::json(&value)
                })
            }),
        )
    }

    pub fn action2<A0, A1, F, Fut, R>(self, name: &str, f: F) -> Self
    where
        A0: DeserializeOwned + Send + 'static,
        A1: DeserializeOwned + Send + 'static,
        F: Fn(Arc<C>, CallContext, A0, A1) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ActionError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.action2_with(name, ActionMarkers::default(), f)
    }

    pub fn action2_with<A0, A1, F, Fut, R>(self, name: &str, markers: ActionMarkers, f: F) -> Self
    where
        A0: DeserializeOwned + Send + 'static,
        A1: DeserializeOwned + Send + 'static,
        F: Fn(Arc<C>, CallContext, A0, A1) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ActionError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            name,
            2,
            markers,
            Arc::new(move |instance, ctx, args| {
                let f = f.clone();
                Box::pin(async move {
                    let controller = downcast::<C>(instance)?;
                    let a0: A0 = parse_arg(&args, 0)?;
                    let a1: A1 = parse_arg(&args, 1)?;
                    let value = f(controller, ctx, a0, a1).await?;
                    ActionResult::json(&value)
                })
            }),
        )
    }

    pub fn action3<A0, A1, A2, F, Fut, R>(self, name: &str, f: F) -> Self
    where
        A0: DeserializeOwned + Send + 'static,
        A1: DeserializeOwned + Send + 'static,
        A2: DeserializeOwned + Send + 'static,
        F: Fn(Arc<C>, CallContext, A0, A1, A2) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ActionError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            name,
            3,
            ActionMarkers::default(),
            Arc::new(move |instance, ctx, args| {
                let f = f.clone();
                Box::pin(async move {
                    let controller = downcast::<C>(instance)?;
                    let a0: A0 = parse_arg(&args, 0)?;
                    let a1: A1 = parse_arg(&args, 1)?;
                    let a2: A2 = parse_arg(&args, 2)?;
                    let value = f(controller, ctx, a0, a1, a2).await?;
                    ActionResult::json(&value)
                })
            }),
        )
    }

    /// Register an action that builds its own [`ActionResult`] (used for
    /// `protobuf`-encoded responses and other pre-built payloads).
    pub fn action_raw<F, Fut>(self, name: &str, arity: usize, markers: ActionMarkers, f: F) -> Self
    where
        F: Fn(Arc<C>, CallContext, Vec<Box<RawValue>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionResult, ActionError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.insert(
            name,
            arity,
            markers,
            Arc::new(move |instance, ctx, args| {
                let f = f.clone();
                Box::pin(async move {
                    let controller = downcast::<C>(instance)?;
                    f(controller, ctx, args).await
                })
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Stock scope factory: shared singletons per controller name
// ---------------------------------------------------------------------------

/// A scope factory that resolves every controller to a pre-built shared
/// instance.  Sufficient for stateless controllers; applications with real
/// per-request state plug in their own [`ScopeFactory`].
#[derive(Default, Clone)]
pub struct SingletonScopes {
    instances: HashMap<String, ControllerInstance>,
}

impl SingletonScopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<C: Send + Sync + 'static>(mut self, name: &str, instance: C) -> Self {
        self.instances
            .insert(name.to_owned(), Arc::new(instance) as ControllerInstance);
        self
    }
}

struct SingletonScope {
    instances: HashMap<String, ControllerInstance>,
}

impl ControllerScope for SingletonScope {
    fn resolve(&mut self, controller: &str) -> Option<ControllerInstance> {
        self.instances.get(controller).cloned()
    }
}

impl ScopeFactory for SingletonScopes {
    fn new_scope(&self) -> Box<dyn ControllerScope> {
        Box::new(SingletonScope {
            instances: self.instances.clone(),
        })
    }
}
