//! The opaque application callable (spec §1, §9 design notes).
//!
//! The source's dotted-name import (`module:attribute`) has no equivalent
//! in a compiled, statically-typed target: there is no runtime symbol table
//! to walk by string. [`Application`] is the pluggable-loader interface spec
//! §9 calls for — a trait object the rest of the crate drives uniformly,
//! regardless of whether the concrete implementation was linked in at
//! compile time ([`StaticLoader`]) or resolved some other way a front-end
//! chooses to provide.

use std::future::Future;
use std::sync::Arc;

use crate::bridge::{Receiver, Sender};
use crate::error::Error;
use crate::scope::Scope;

/// The ASGI application contract: given an immutable scope and the two
/// bridge endpoints, run the cycle to completion.
///
/// Mirrors axum's `Listener`/`Service` traits in using an `impl Future`
/// return rather than `async-trait`, since the crate otherwise has no use
/// for boxed futures on this hot path.
pub trait Application: Send + Sync + 'static {
    fn call(
        &self,
        scope: Scope,
        receive: Receiver,
        send: Sender,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Object-safe wrapper, so the server core can hold a single
/// `Arc<dyn DynApplication>` regardless of the concrete `Application` type.
pub trait DynApplication: Send + Sync + 'static {
    fn call<'a>(
        &'a self,
        scope: Scope,
        receive: Receiver,
        send: Sender,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>;
}

impl<A: Application> DynApplication for A {
    fn call<'a>(
        &'a self,
        scope: Scope,
        receive: Receiver,
        send: Sender,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
        Box::pin(Application::call(self, scope, receive, send))
    }
}

/// Loads the application to serve. A front-end resolves whatever
/// source-language concept of "the app" it has (a dotted import, a
/// dynamically loaded plugin, ...) down to this one trait before handing
/// control to [`crate::Server`].
pub trait Loader: Send + Sync + 'static {
    fn load(&self) -> Result<Arc<dyn DynApplication>, Error>;
}

/// The builtin loader: the application is already linked into the binary
/// and handed to the server as a value. This is the "application may be
/// linked statically" branch of spec §9's design note.
pub struct StaticLoader {
    app: Arc<dyn DynApplication>,
}

impl StaticLoader {
    pub fn new<A: Application>(app: A) -> Self {
        Self { app: Arc::new(app) }
    }
}

impl Loader for StaticLoader {
    fn load(&self) -> Result<Arc<dyn DynApplication>, Error> {
        Ok(Arc::clone(&self.app))
    }
}
