//! Type-indexed map of weak singleton handles, consulted by route handlers
//! during router initialization (spec'd in `brypt-route::ServiceProvider`).
//! Owns no strong references: every registered singleton is kept alive by
//! the process root ([`crate::node::Node`]), not by this map.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

#[derive(Default)]
pub struct NodeServiceProvider {
    services: Mutex<HashMap<TypeId, Weak<dyn Any + Send + Sync>>>,
}

impl NodeServiceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Any + Send + Sync>(&self, value: Arc<T>) {
        let erased: Arc<dyn Any + Send + Sync> = value;
        self.services.lock().insert(TypeId::of::<T>(), Arc::downgrade(&erased));
    }

    pub fn fetch<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        brypt_route::ServiceProvider::fetch(self, TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }
}

impl brypt_route::ServiceProvider for NodeServiceProvider {
    fn fetch(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.lock().get(&type_id)?.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget(u32);

    #[test]
    fn register_then_fetch_roundtrips_through_the_type_tag() {
        let provider = NodeServiceProvider::new();
        let widget = Arc::new(Widget(42));
        provider.register(widget.clone());

        let fetched = provider.fetch::<Widget>().expect("widget registered");
        assert_eq!(fetched.0, 42);
    }

    #[test]
    fn fetch_returns_none_once_every_strong_reference_is_dropped() {
        let provider = NodeServiceProvider::new();
        {
            let widget = Arc::new(Widget(1));
            provider.register(widget);
        }
        assert!(provider.fetch::<Widget>().is_none());
    }

    #[test]
    fn fetch_returns_none_for_an_unregistered_type() {
        let provider = NodeServiceProvider::new();
        assert!(provider.fetch::<Widget>().is_none());
    }
}
