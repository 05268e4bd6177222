//! Method registry
//!
//! Every method is registered together with the shape of its parameters.
//! Raw arguments are bound against that shape before the typed handler sees
//! them, so a bad call turns into an invalid-parameters error instead of a
//! failed deserialization deep inside a handler.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::engine::Engine;
use super::error::RpcError;

/// Future returned by a type-erased handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

type Handler = Arc<dyn Fn(Value, Call) -> HandlerFuture + Send + Sync>;

/// A declared parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub required: bool,
}

impl Field {
    pub const fn required(name: &'static str) -> Self {
        Self { name, required: true }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self { name, required: false }
    }
}

/// How raw arguments map onto a handler's parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    /// No declaration: a mapping is passed through as keyword arguments and
    /// anything else positionally
    Free,
    /// Declared fields; `catch_all` keeps keys that match no field
    Fields {
        fields: &'static [Field],
        catch_all: bool,
    },
}

impl ParamShape {
    pub const NONE: ParamShape = ParamShape::Fields {
        fields: &[],
        catch_all: false,
    };

    pub const fn fields(fields: &'static [Field]) -> Self {
        ParamShape::Fields {
            fields,
            catch_all: false,
        }
    }

    /// Produce the call arguments for this shape
    pub fn bind(&self, raw: Option<Value>) -> Result<Value, RpcError> {
        let (fields, catch_all) = match self {
            ParamShape::Free => return Ok(raw.unwrap_or(Value::Null)),
            ParamShape::Fields { fields, catch_all } => (*fields, *catch_all),
        };

        let mut bound = Map::new();
        match raw {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (key, value) in map {
                    if catch_all || fields.iter().any(|f| f.name == key) {
                        bound.insert(key, value);
                    }
                }
            }
            Some(single) => {
                let first = fields.first().ok_or_else(|| {
                    RpcError::invalid_params("Method takes no positional argument")
                })?;
                bound.insert(first.name.to_string(), single);
            }
        }

        if let Some(missing) = fields
            .iter()
            .find(|f| f.required && !bound.contains_key(f.name))
        {
            return Err(RpcError::invalid_params(format!(
                "Missing required argument '{}'",
                missing.name
            )));
        }

        Ok(Value::Object(bound))
    }
}

/// Argument type with a parameter shape declared once for all its methods
pub trait Params: DeserializeOwned + Send + 'static {
    const SHAPE: ParamShape;
}

impl Params for Value {
    const SHAPE: ParamShape = ParamShape::Free;
}

/// Per-call context handed to a handler
#[derive(Clone)]
pub struct Call {
    /// Sequence number of the request (0 for notifications)
    pub seq: i64,
    pub command: String,
    /// Cancelled when the client cancels this request or the engine shuts down
    pub cancel: CancellationToken,
    pub engine: Arc<Engine>,
    close_after_reply: Arc<AtomicBool>,
}

impl Call {
    pub(crate) fn new(seq: i64, command: &str, cancel: CancellationToken, engine: Arc<Engine>) -> Self {
        Self {
            seq,
            command: command.to_string(),
            cancel,
            engine,
            close_after_reply: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop the engine once this call's reply has been queued
    pub fn close_after_reply(&self) {
        self.close_after_reply.store(true, Ordering::SeqCst);
    }

    pub(crate) fn wants_close(&self) -> bool {
        self.close_after_reply.load(Ordering::SeqCst)
    }
}

/// A registered method
pub struct Method {
    pub name: String,
    pub shape: ParamShape,
    handler: Handler,
}

impl Method {
    /// Bind the raw arguments and start the handler
    pub fn invoke(&self, raw: Option<Value>, call: Call) -> HandlerFuture {
        match self.shape.bind(raw) {
            Ok(args) => (self.handler)(args, call),
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }
}

/// Name to handler table
#[derive(Default)]
pub struct Registry {
    methods: RwLock<HashMap<String, Arc<Method>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler using the shape declared by its argument type
    pub fn register<A, R, F, Fut>(&self, name: &str, handler: F)
    where
        A: Params,
        R: Serialize + 'static,
        F: Fn(A, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        self.register_with_shape(name, A::SHAPE, handler);
    }

    /// Register a handler with an explicit parameter shape
    ///
    /// Registering an existing name replaces the previous handler.
    pub fn register_with_shape<A, R, F, Fut>(&self, name: &str, shape: ParamShape, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(A, Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let erased: Handler = Arc::new(move |args: Value, call: Call| -> HandlerFuture {
            match serde_json::from_value::<A>(args) {
                Ok(args) => {
                    let fut = handler(args, call);
                    Box::pin(async move {
                        let result = fut.await?;
                        serde_json::to_value(result)
                            .map_err(|e| RpcError::internal(format!("Failed to serialize result: {}", e)))
                    })
                }
                Err(e) => Box::pin(async move { Err(RpcError::invalid_params(e.to_string())) }),
            }
        });

        let method = Arc::new(Method {
            name: name.to_string(),
            shape,
            handler: erased,
        });

        let previous = self
            .methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), method);
        if previous.is_some() {
            tracing::debug!(method = name, "Replaced registered handler");
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Method>> {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Target {
        thread_id: i64,
        #[serde(default)]
        granularity: Option<String>,
    }

    const TARGET: ParamShape = ParamShape::fields(&[
        Field::required("threadId"),
        Field::optional("granularity"),
    ]);

    #[test]
    fn test_bind_mapping_drops_unknown_keys() {
        let bound = TARGET
            .bind(Some(json!({"threadId": 1, "extra": true})))
            .unwrap();
        assert_eq!(bound, json!({"threadId": 1}));
    }

    #[test]
    fn test_bind_catch_all_keeps_unknown_keys() {
        const OPEN: ParamShape = ParamShape::Fields {
            fields: &[Field::required("threadId")],
            catch_all: true,
        };
        let bound = OPEN.bind(Some(json!({"threadId": 1, "extra": true}))).unwrap();
        assert_eq!(bound["extra"], true);
    }

    #[test]
    fn test_bind_scalar_goes_to_first_field() {
        assert_eq!(TARGET.bind(Some(json!(7))).unwrap(), json!({"threadId": 7}));
    }

    #[test]
    fn test_bind_missing_required_is_invalid_params() {
        let err = TARGET.bind(Some(json!({"granularity": "line"}))).unwrap_err();
        assert_eq!(err.code, super::super::error::INVALID_PARAMS);
        assert!(err.message.contains("threadId"));
    }

    #[test]
    fn test_bind_free_shape_passes_through() {
        assert_eq!(ParamShape::Free.bind(Some(json!([1, 2]))).unwrap(), json!([1, 2]));
        assert_eq!(ParamShape::Free.bind(None).unwrap(), Value::Null);
        assert_eq!(ParamShape::NONE.bind(None).unwrap(), json!({}));
    }

    #[test]
    fn test_register_replaces_and_resolves() {
        let registry = Registry::new();
        registry.register_with_shape("next", TARGET, |args: Target, _call| async move {
            Ok::<_, RpcError>(args.thread_id)
        });
        let first = registry.resolve("next").unwrap();

        registry.register_with_shape("next", ParamShape::NONE, |_: Value, _call| async move {
            Ok::<_, RpcError>(())
        });
        let second = registry.resolve("next").unwrap();

        assert_eq!(first.shape, TARGET);
        assert_eq!(second.shape, ParamShape::NONE);
        assert!(registry.resolve("stepBack").is_none());
        assert!(registry.contains("next"));
    }

    #[tokio::test]
    async fn test_invoke_binds_and_deserializes() {
        let registry = Registry::new();
        registry.register_with_shape("next", TARGET, |args: Target, _call| async move {
            Ok::<_, RpcError>(json!({"thread": args.thread_id, "g": args.granularity}))
        });
        let method = registry.resolve("next").unwrap();
        let engine = Engine::new(Arc::new(Registry::new()));
        let call = Call::new(1, "next", CancellationToken::new(), engine.clone());

        let value = method
            .invoke(Some(json!({"threadId": 3, "granularity": "line"})), call.clone())
            .await
            .unwrap();
        assert_eq!(value, json!({"thread": 3, "g": "line"}));

        let err = method
            .invoke(Some(json!({"threadId": "three"})), call)
            .await
            .unwrap_err();
        assert_eq!(err.code, super::super::error::INVALID_PARAMS);
    }
}
