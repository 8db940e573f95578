//! Typed-message convenience layer.
//!
//! The original `ProtobufProcess` wraps `Process` so handlers receive a
//! decoded protobuf message instead of a raw byte string, defaulting the
//! wire method name to the message's descriptor name. Protobuf itself is
//! out of scope here; this module generalizes the same convenience to any
//! `serde`-compatible type over a JSON codec, so callers get typed mailbox
//! handlers without this crate depending on a code-gen toolchain.

use std::future::Future;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::actor::{MailboxHandler, ProcessBuilder};
use crate::context::Context;
use crate::error::Error;
use crate::pid::Pid;

/// Decode errors are logged and the message dropped, matching the
/// best-effort delivery contract the rest of the mailbox system has: a
/// malformed payload is a peer bug, not a reason to crash the process.
fn decode<T: DeserializeOwned>(body: &Bytes) -> Option<T> {
    match serde_json::from_slice(body) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("failed to decode typed message: {e}");
            None
        }
    }
}

/// Encode `value` for transmission, defaulting the method name to the
/// type's name, mirroring the descriptor-name default for protobuf
/// messages.
pub fn type_name<T>() -> &'static str {
    std::any::type_name::<T>()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Encode and send a typed payload, defaulting the wire method name to the
/// payload type's name, mirroring `ProtobufProcess.send`'s descriptor-name
/// default — the generic, non-protobuf counterpart of the out-of-scope
/// protobuf convenience layer's outbound side.
pub async fn send_typed<T: Serialize>(
    ctx: &Context,
    from: Pid,
    to: Pid,
    value: &T,
) -> Result<(), Error> {
    let body = encode(value)
        .map_err(|e| Error::ConfigError(format!("failed to encode typed payload: {e}")))?;
    ctx.send(
        from,
        to,
        type_name::<T>(),
        body,
        Some("application/json".to_string()),
    )
    .await
}

struct TypedMailbox<T, F> {
    handler: F,
    _marker: PhantomData<fn(T)>,
}

#[async_trait::async_trait]
impl<T, F, Fut> MailboxHandler for TypedMailbox<T, F>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(Option<Pid>, T) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, from: Option<Pid>, body: Bytes) {
        if let Some(value) = decode::<T>(&body) {
            (self.handler)(from, value).await;
        }
    }
}

/// Extension trait adding a typed `install` to `ProcessBuilder`.
pub trait TypedProcessBuilderExt {
    fn install_typed<T, F, Fut>(self, name: &str, handler: F) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(Option<Pid>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static;
}

impl TypedProcessBuilderExt for ProcessBuilder {
    fn install_typed<T, F, Fut>(self, name: &str, handler: F) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(Option<Pid>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.install(
            name,
            TypedMailbox {
                handler,
                _marker: PhantomData,
            },
        )
    }
}
