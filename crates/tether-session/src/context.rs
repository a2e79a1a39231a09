//! Local, per-session context.
//!
//! A typed map the owning process associates with a peer: authentication
//! results, profile records, whatever handlers need to look up later. Never
//! transmitted. Values are keyed by type, so each type has at most one entry.
//!
//! The map is populated before [`Session::init`](crate::Session::init) and
//! read-only afterwards; handlers reach it through
//! [`Session::context`](crate::Session::context).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

/// Typed per-peer value store.
///
/// # Example
///
/// ```
/// use tether_session::Context;
///
/// struct DisplayName(String);
///
/// let mut ctx = Context::new();
/// ctx.insert(DisplayName("alice".into()));
/// assert_eq!(ctx.get::<DisplayName>().unwrap().0, "alice");
/// ```
#[derive(Default)]
pub struct Context {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type if one
    /// existed.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|boxed| boxed.downcast().ok().map(|b| *b))
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast().ok().map(|b| *b))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        struct PeerName(&'static str);

        let mut ctx = Context::new();
        assert!(ctx.is_empty());
        assert!(ctx.insert(PeerName("alice")).is_none());
        assert_eq!(ctx.get::<PeerName>().unwrap().0, "alice");
        assert_eq!(ctx.insert(PeerName("bob")).unwrap().0, "alice");
        assert_eq!(ctx.remove::<PeerName>().unwrap().0, "bob");
        assert!(ctx.get::<PeerName>().is_none());
    }

    #[test]
    fn distinct_types_coexist() {
        let mut ctx = Context::new();
        ctx.insert(7u32);
        ctx.insert("label");
        assert_eq!(ctx.get::<u32>(), Some(&7));
        assert_eq!(ctx.get::<&str>(), Some(&"label"));
        assert_eq!(ctx.len(), 2);
    }
}
