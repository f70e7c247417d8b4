//! Interface Proxy
//!
//! Virtual-dispatch objects interposed between a real object and its callers
//! on the other side of the boundary. See [`proxy`] for the object model and
//! [`unknown`] for calling into objects created elsewhere.

pub mod proxy;
pub mod unknown;

pub use proxy::{resolve_proxy, Proxy, ProxyClass, ProxyRef};
pub use unknown::{ForeignRef, IUnknownVtbl, VTable};

/// `Proxy::create` under the name the other side of the bridge uses.
pub fn create_proxy<C: ProxyClass>(inner: C) -> ProxyRef<C> {
    Proxy::create(inner)
}
