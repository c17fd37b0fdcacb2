//! Radix-trie route dispatch and the handler contract invoked per message (C6).
//!
//! The trie is a direct port of the original `Router`/`Prefix` shape: nodes
//! carry a prefix string, children sorted by first character, and an optional
//! handler. Recursive `&mut`/`&` traversal replaces the original's raw
//! `Prefix*` walk and splice, which Rust ownership makes unnecessary.

use std::any::{Any, TypeId};
use std::sync::{Arc, Weak};

use brypt_await::TrackingService;
use brypt_identifier::NodeId;
use brypt_message::ApplicationParcel;
use brypt_peer::{EndpointId, Next, PeerProxy, RouteDispatcher};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("route failed the path grammar")]
    InvalidPath,
}

/// Resolves a handler's dependencies once, at router initialization. Concrete
/// storage (a `TypeId`-keyed map of `Weak` handles) lives in the binary that
/// owns the component lifetimes; this crate only needs the lookup seam.
pub trait ServiceProvider: Send + Sync {
    fn fetch(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Invoked once per matched dispatch, with a fresh [`Next`] for replying,
/// dispatching further, or deferring an aggregated fetch.
pub trait Handler: Send + Sync {
    /// Resolves dependencies from `provider`. Returning `false` aborts router
    /// initialization.
    fn on_fetch_services(&self, provider: &dyn ServiceProvider) -> bool;

    /// Handles one dispatch; returns whether it was handled successfully.
    fn on_message(&self, next: &Next<'_>) -> bool;
}

/// Validates the path grammar: slash-delimited, leading slash, no empty
/// segments, no whitespace/wildcards/punctuation outside `[A-Za-z0-9_-]`, and
/// every segment must contain at least one alphanumeric character (a segment
/// of bare `_`/`-` is rejected even though those characters are individually
/// permitted).
fn is_valid_route(route: &str) -> bool {
    if !route.starts_with('/') {
        return false;
    }
    let trimmed = route.strip_suffix('/').unwrap_or(route);
    if trimmed.is_empty() {
        return false;
    }
    trimmed[1..].split('/').all(|segment| {
        !segment.is_empty()
            && segment.bytes().any(|b| b.is_ascii_alphanumeric())
            && segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    })
}

/// Strips the trailing separator registration and lookup both implicitly
/// apply (`/route/` and `/route` name the same node).
fn normalize(route: &str) -> &str {
    if route.len() > 1 {
        route.strip_suffix('/').unwrap_or(route)
    } else {
        route
    }
}

struct Prefix {
    prefix: String,
    children: Vec<Prefix>,
    handler: Option<Arc<dyn Handler>>,
}

impl Prefix {
    fn leaf(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), children: Vec::new(), handler: None }
    }

    fn find_common_prefix_len(left: &str, right: &str) -> usize {
        left.bytes().zip(right.bytes()).take_while(|(a, b)| a == b).count()
    }

    /// Splits this node at `boundary`: the first `boundary` bytes stay as this
    /// node's prefix, and a new child absorbs the remainder along with the
    /// existing children and handler.
    fn split(&mut self, boundary: usize) {
        let suffix = self.prefix.split_off(boundary);
        let moved_children = std::mem::take(&mut self.children);
        let moved_handler = self.handler.take();
        let mut child = Prefix::leaf(suffix);
        child.children = moved_children;
        child.handler = moved_handler;
        self.children = vec![child];
    }

    fn binary_find(&self, first_byte: u8) -> Result<usize, usize> {
        self.children.binary_search_by(|child| child.prefix.as_bytes()[0].cmp(&first_byte))
    }

    fn insert(&mut self, route: &str, handler: Arc<dyn Handler>) {
        let common = Self::find_common_prefix_len(route, &self.prefix);
        if common < self.prefix.len() {
            self.split(common);
        }
        if common == route.len() {
            self.handler = Some(handler);
            return;
        }
        let route = &route[common..];
        match self.binary_find(route.as_bytes()[0]) {
            Ok(index) => self.children[index].insert(route, handler),
            Err(index) => {
                let mut child = Prefix::leaf(route);
                child.handler = Some(handler);
                self.children.insert(index, child);
            }
        }
    }

    fn find(&self, route: &str) -> Option<&Prefix> {
        if route.len() == self.prefix.len() {
            return (self.handler.is_some() && route == self.prefix).then_some(self);
        }
        if route.len() < self.prefix.len() || route.as_bytes()[..self.prefix.len()] != *self.prefix.as_bytes() {
            return None;
        }
        let remaining = &route[self.prefix.len()..];
        let index = self.binary_find(*remaining.as_bytes().first()?).ok()?;
        self.children[index].find(remaining)
    }

    fn walk_handlers<'a>(&'a self, out: &mut Vec<&'a dyn Handler>) {
        if let Some(handler) = &self.handler {
            out.push(handler.as_ref());
        }
        for child in &self.children {
            child.walk_handlers(out);
        }
    }
}

/// Static route registration and longest-prefix dispatch.
pub struct Router {
    root: Prefix,
    local_identifier: NodeId,
    tracking_service: Arc<TrackingService>,
}

impl Router {
    pub fn new(local_identifier: NodeId, tracking_service: Arc<TrackingService>) -> Self {
        Self { root: Prefix::leaf("/"), local_identifier, tracking_service }
    }

    /// Registers `route` to `handler`. Re-registering an existing route
    /// replaces its handler silently (with a warning), matching the
    /// original's "replace the node's handler" insertion step.
    pub fn register(&mut self, route: &str, handler: Arc<dyn Handler>) -> Result<(), RouteError> {
        if !is_valid_route(route) {
            return Err(RouteError::InvalidPath);
        }
        let route = normalize(route);
        if self.contains(route) {
            warn!(route, "replacing handler for an already-registered route");
        }
        self.root.insert(route, handler);
        Ok(())
    }

    pub fn contains(&self, route: &str) -> bool {
        self.match_route(route).is_some()
    }

    fn match_route(&self, route: &str) -> Option<&Prefix> {
        if route.is_empty() {
            return None;
        }
        self.root.find(normalize(route))
    }

    /// Calls `on_fetch_services` on every registered handler. Returns `false`
    /// (aborting initialization) on the first handler that rejects.
    pub fn initialize(&self, provider: &dyn ServiceProvider) -> bool {
        let mut handlers = Vec::new();
        self.root.walk_handlers(&mut handlers);
        handlers.iter().all(|handler| handler.on_fetch_services(provider))
    }
}

impl RouteDispatcher for Router {
    fn dispatch(&self, peer: Weak<PeerProxy>, endpoint_id: EndpointId, parcel: ApplicationParcel) -> bool {
        let Some(matched) = self.match_route(&parcel.route) else {
            warn!(route = %parcel.route, source = %parcel.header.source, "no handler matched route");
            return false;
        };
        let Some(handler) = &matched.handler else {
            return false;
        };

        let next = Next::new(
            peer,
            endpoint_id,
            self.local_identifier.clone(),
            &parcel,
            self.tracking_service.clone(),
        );
        let success = handler.on_message(&next);
        if !success {
            warn!(route = %parcel.route, source = %parcel.header.source, "handler reported failure");
        }
        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(NodeId::new(vec![1u8; 20]).unwrap(), Arc::new(TrackingService::new()))
    }

    struct NullHandler;
    impl Handler for NullHandler {
        fn on_fetch_services(&self, _provider: &dyn ServiceProvider) -> bool {
            true
        }
        fn on_message(&self, _next: &Next<'_>) -> bool {
            true
        }
    }

    #[test]
    fn path_grammar_rejects_invalid_routes() {
        for route in [
            "",
            "/",
            "///",
            "/.",
            "\\query\\data",
            "/query/*",
            "/query/:",
            "/query//",
            "/query?",
            "/query/data//",
            "/query/_/data",
            "/query//data",
            "\"/query\"",
        ] {
            assert!(!is_valid_route(route), "expected {route:?} to be invalid");
        }
    }

    #[test]
    fn path_grammar_accepts_valid_routes() {
        for route in ["/info/node", "/1", "/1/2/3/", "/1/2/3/4"] {
            assert!(is_valid_route(route), "expected {route:?} to be valid");
        }
    }

    #[test]
    fn register_and_contains_roundtrip() {
        let mut router = router();
        router.register("/info/node", Arc::new(NullHandler)).unwrap();
        assert!(router.contains("/info/node"));
        assert!(router.contains("/info/node/"));
        assert!(!router.contains("/info"));
    }

    #[test]
    fn register_rejects_invalid_path() {
        let mut router = router();
        assert_eq!(router.register("/query/*", Arc::new(NullHandler)), Err(RouteError::InvalidPath));
    }

    #[test]
    fn sibling_registration_splits_common_prefix_without_losing_either_route() {
        let mut router = router();
        router.register("/info/node", Arc::new(NullHandler)).unwrap();
        router.register("/info/network", Arc::new(NullHandler)).unwrap();
        assert!(router.contains("/info/node"));
        assert!(router.contains("/info/network"));
        assert!(!router.contains("/info"));
    }

    #[test]
    fn registration_order_does_not_change_final_reachability() {
        let mut forward = router();
        forward.register("/a", Arc::new(NullHandler)).unwrap();
        forward.register("/ab", Arc::new(NullHandler)).unwrap();
        forward.register("/abc", Arc::new(NullHandler)).unwrap();

        let mut backward = router();
        backward.register("/abc", Arc::new(NullHandler)).unwrap();
        backward.register("/ab", Arc::new(NullHandler)).unwrap();
        backward.register("/a", Arc::new(NullHandler)).unwrap();

        for route in ["/a", "/ab", "/abc"] {
            assert_eq!(forward.contains(route), backward.contains(route));
            assert!(forward.contains(route));
        }
    }

    #[test]
    fn reregistering_a_route_replaces_its_handler() {
        let mut router = router();
        router.register("/info/node", Arc::new(NullHandler)).unwrap();
        router.register("/info/node", Arc::new(NullHandler)).unwrap();
        assert!(router.contains("/info/node"));
    }

    #[test]
    fn unregistered_prefix_is_not_itself_reachable() {
        let mut router = router();
        router.register("/info/node", Arc::new(NullHandler)).unwrap();
        assert!(!router.contains("/in"));
        assert!(!router.contains("/infoo"));
    }

    struct RejectingHandler;
    impl Handler for RejectingHandler {
        fn on_fetch_services(&self, _provider: &dyn ServiceProvider) -> bool {
            false
        }
        fn on_message(&self, _next: &Next<'_>) -> bool {
            true
        }
    }

    struct NullProvider;
    impl ServiceProvider for NullProvider {
        fn fetch(&self, _type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
            None
        }
    }

    #[test]
    fn initialize_aborts_on_first_rejecting_handler() {
        let mut router = router();
        router.register("/info/node", Arc::new(NullHandler)).unwrap();
        router.register("/info/network", Arc::new(RejectingHandler)).unwrap();
        assert!(!router.initialize(&NullProvider));
    }

    #[test]
    fn initialize_succeeds_when_every_handler_accepts() {
        let mut router = router();
        router.register("/info/node", Arc::new(NullHandler)).unwrap();
        router.register("/info/network", Arc::new(NullHandler)).unwrap();
        assert!(router.initialize(&NullProvider));
    }
}
