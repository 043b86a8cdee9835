//! In-process service registry
//!
//! Holds the property maps of locally-registered services behind opaque
//! handles and fans service lifecycle changes out to subscribed
//! listeners. A subscription may carry an LDAP filter; the registry
//! then translates property changes that flip the filter verdict into
//! registered/unregistered events, so a filtered listener only ever
//! sees services it matched.

use crate::error::{Result, TopologyError};
use crate::exporter::ServiceHandle;
use async_trait::async_trait;
use mesh_core::{Filter, PropertyValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Observer of service lifecycle events.
#[async_trait]
pub trait ServiceEventListener: Send + Sync {
    async fn on_registered(
        &self,
        service: ServiceHandle,
        properties: &BTreeMap<String, PropertyValue>,
    );

    async fn on_modified(
        &self,
        service: ServiceHandle,
        properties: &BTreeMap<String, PropertyValue>,
    );

    async fn on_unregistered(&self, service: ServiceHandle);
}

#[derive(Clone)]
struct Subscription {
    listener: Arc<dyn ServiceEventListener>,
    filter: Option<Filter>,
}

#[derive(Default)]
struct RegistryState {
    services: HashMap<ServiceHandle, BTreeMap<String, PropertyValue>>,
    subscriptions: Vec<Subscription>,
}

/// Registry of local services with filtered event subscriptions.
pub struct ServiceRegistry {
    state: Mutex<RegistryState>,
    next_handle: AtomicU64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Subscribe to service events, optionally gated by a filter.
    ///
    /// Already-registered services that match are replayed to the new
    /// listener as `on_registered`, so late subscribers converge on the
    /// same view as early ones.
    pub async fn add_listener(
        &self,
        listener: Arc<dyn ServiceEventListener>,
        filter: Option<Filter>,
    ) {
        let current: Vec<(ServiceHandle, BTreeMap<String, PropertyValue>)> = {
            let mut state = self.state.lock().await;
            let current = state
                .services
                .iter()
                .filter(|(_, props)| Self::matches(&filter, props))
                .map(|(handle, props)| (*handle, props.clone()))
                .collect();
            state.subscriptions.push(Subscription {
                listener: Arc::clone(&listener),
                filter,
            });
            current
        };
        for (handle, properties) in current {
            listener.on_registered(handle, &properties).await;
        }
    }

    /// Register a service and notify matching subscribers.
    pub async fn register(
        &self,
        properties: BTreeMap<String, PropertyValue>,
    ) -> ServiceHandle {
        let handle = ServiceHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let subscriptions = {
            let mut state = self.state.lock().await;
            debug!("Service registered: {}", handle);
            state.services.insert(handle, properties.clone());
            state.subscriptions.clone()
        };
        for sub in &subscriptions {
            if Self::matches(&sub.filter, &properties) {
                sub.listener.on_registered(handle, &properties).await;
            }
        }
        handle
    }

    /// Replace a service's properties and notify subscribers.
    ///
    /// A subscriber whose filter verdict flips sees the change as a
    /// registration or unregistration instead of a modification.
    pub async fn set_properties(
        &self,
        handle: ServiceHandle,
        properties: BTreeMap<String, PropertyValue>,
    ) -> Result<()> {
        let (old, subscriptions) = {
            let mut state = self.state.lock().await;
            let entry = state
                .services
                .get_mut(&handle)
                .ok_or(TopologyError::UnknownService(handle))?;
            let old = std::mem::replace(entry, properties.clone());
            debug!("Service modified: {}", handle);
            (old, state.subscriptions.clone())
        };
        for sub in &subscriptions {
            let was = Self::matches(&sub.filter, &old);
            let is = Self::matches(&sub.filter, &properties);
            match (was, is) {
                (true, true) => sub.listener.on_modified(handle, &properties).await,
                (false, true) => sub.listener.on_registered(handle, &properties).await,
                (true, false) => sub.listener.on_unregistered(handle).await,
                (false, false) => {}
            }
        }
        Ok(())
    }

    /// Unregister a service and notify subscribers that matched it.
    /// No-op for an unknown handle.
    pub async fn unregister(&self, handle: ServiceHandle) {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.services.remove(&handle);
            if removed.is_some() {
                debug!("Service unregistered: {}", handle);
            }
            removed.map(|props| (props, state.subscriptions.clone()))
        };
        if let Some((old, subscriptions)) = removed {
            for sub in &subscriptions {
                if Self::matches(&sub.filter, &old) {
                    sub.listener.on_unregistered(handle).await;
                }
            }
        }
    }

    fn matches(filter: &Option<Filter>, properties: &BTreeMap<String, PropertyValue>) -> bool {
        match filter {
            Some(filter) => filter.matches(properties),
            None => true,
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::TopologyManager;
    use mesh_core::endpoint::SERVICE_EXPORTED_INTERFACES;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingServiceListener {
        events: StdMutex<Vec<(&'static str, u64)>>,
    }

    impl RecordingServiceListener {
        fn take(&self) -> Vec<(&'static str, u64)> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
    }

    #[async_trait]
    impl ServiceEventListener for RecordingServiceListener {
        async fn on_registered(
            &self,
            service: ServiceHandle,
            _properties: &BTreeMap<String, PropertyValue>,
        ) {
            self.events.lock().unwrap().push(("registered", service.0));
        }

        async fn on_modified(
            &self,
            service: ServiceHandle,
            _properties: &BTreeMap<String, PropertyValue>,
        ) {
            self.events.lock().unwrap().push(("modified", service.0));
        }

        async fn on_unregistered(&self, service: ServiceHandle) {
            self.events.lock().unwrap().push(("unregistered", service.0));
        }
    }

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, PropertyValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), PropertyValue::from(*v)))
            .collect()
    }

    #[tokio::test]
    async fn test_register_and_unregister_notify_listener() {
        let registry = ServiceRegistry::new();
        let listener = Arc::new(RecordingServiceListener::default());
        registry.add_listener(listener.clone(), None).await;

        let handle = registry.register(props(&[("name", "echo")])).await;
        registry.unregister(handle).await;

        assert_eq!(
            listener.take(),
            vec![("registered", handle.0), ("unregistered", handle.0)]
        );

        // Unknown handle: silent no-op.
        registry.unregister(handle).await;
        assert_eq!(listener.take(), Vec::new());
    }

    #[tokio::test]
    async fn test_late_listener_replays_existing_services() {
        let registry = ServiceRegistry::new();
        let a = registry.register(props(&[("name", "a")])).await;
        let b = registry.register(props(&[("name", "b")])).await;

        let listener = Arc::new(RecordingServiceListener::default());
        registry.add_listener(listener.clone(), None).await;

        let mut events = listener.take();
        events.sort();
        assert_eq!(events, vec![("registered", a.0), ("registered", b.0)]);
    }

    #[tokio::test]
    async fn test_filtered_subscription_sees_only_matching_services() {
        let registry = ServiceRegistry::new();
        let listener = Arc::new(RecordingServiceListener::default());
        registry
            .add_listener(
                listener.clone(),
                Some(Filter::parse("(tier=gold)").unwrap()),
            )
            .await;

        registry.register(props(&[("tier", "silver")])).await;
        let gold = registry.register(props(&[("tier", "gold")])).await;

        assert_eq!(listener.take(), vec![("registered", gold.0)]);
    }

    #[tokio::test]
    async fn test_property_change_flips_subscription_verdict() {
        let registry = ServiceRegistry::new();
        let listener = Arc::new(RecordingServiceListener::default());
        registry
            .add_listener(
                listener.clone(),
                Some(Filter::parse("(tier=gold)").unwrap()),
            )
            .await;

        let handle = registry.register(props(&[("tier", "silver")])).await;
        assert_eq!(listener.take(), Vec::new());

        // Starts matching: surfaces as a registration.
        registry
            .set_properties(handle, props(&[("tier", "gold")]))
            .await
            .unwrap();
        assert_eq!(listener.take(), vec![("registered", handle.0)]);

        // Still matching: a plain modification.
        registry
            .set_properties(handle, props(&[("tier", "gold"), ("v", "2")]))
            .await
            .unwrap();
        assert_eq!(listener.take(), vec![("modified", handle.0)]);

        // Stops matching: surfaces as an unregistration.
        registry
            .set_properties(handle, props(&[("tier", "silver")]))
            .await
            .unwrap();
        assert_eq!(listener.take(), vec![("unregistered", handle.0)]);
    }

    #[tokio::test]
    async fn test_set_properties_on_unknown_handle_is_rejected() {
        let registry = ServiceRegistry::new();
        let result = registry
            .set_properties(ServiceHandle(42), props(&[]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_registry_drives_topology_manager() {
        use crate::exporter::{ExportRegistration, Exporter};
        use mesh_core::endpoint::{ENDPOINT_ID, ENDPOINT_NODE_ID, OBJECT_CLASS};
        use mesh_core::EndpointDescription;
        use std::sync::atomic::AtomicU32;

        struct Registration(ServiceHandle);

        impl ExportRegistration for Registration {
            fn close(&self) {}

            fn endpoint(&self) -> Result<EndpointDescription> {
                let mut props = BTreeMap::new();
                props.insert(
                    ENDPOINT_ID.to_string(),
                    PropertyValue::from(format!("{}", self.0)),
                );
                props.insert(ENDPOINT_NODE_ID.to_string(), PropertyValue::from("local"));
                props.insert(
                    OBJECT_CLASS.to_string(),
                    PropertyValue::from(vec!["org.example.Echo".to_string()]),
                );
                Ok(EndpointDescription::new(props).unwrap())
            }
        }

        #[derive(Default)]
        struct CountingExporter {
            exports: AtomicU32,
        }

        #[async_trait]
        impl Exporter for CountingExporter {
            async fn export_service(
                &self,
                service: ServiceHandle,
                _properties: &BTreeMap<String, PropertyValue>,
            ) -> Result<Box<dyn ExportRegistration>> {
                self.exports.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Registration(service)))
            }
        }

        let registry = ServiceRegistry::new();
        let manager = Arc::new(TopologyManager::new());
        let exporter = Arc::new(CountingExporter::default());
        manager.exporter_added("http", exporter.clone()).await;
        registry
            .add_listener(Arc::clone(&manager) as Arc<dyn ServiceEventListener>, None)
            .await;

        let mut properties = props(&[("name", "echo")]);
        properties.insert(
            SERVICE_EXPORTED_INTERFACES.to_string(),
            PropertyValue::from("org.example.Echo"),
        );
        let handle = registry.register(properties).await;
        assert_eq!(exporter.exports.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.exported_pairs().await,
            vec![(handle, "http".to_string())]
        );

        registry.unregister(handle).await;
        assert_eq!(manager.exported_pairs().await, Vec::new());
    }
}
