//! Topology manager
//!
//! Reconciles locally-registered services against the available
//! exporters and the configured export filter: for every (service,
//! exporter) pair there is at most one live export registration, and
//! the set of live registrations always converges to "filter-matching
//! services times available exporters" as services, properties,
//! exporters and the filter itself change.
//!
//! All state lives under a single mutex. The mutex is *not* held across
//! the exporter call itself; instead a pair is marked in-flight, the
//! export runs unlocked, and the result is validated against the then-
//! current state before it is kept. A registration whose service was
//! withdrawn mid-flight, or that cannot resolve its own endpoint, is
//! closed on the spot and never surfaces.

use crate::error::Result;
use crate::exporter::{ExportRegistration, Exporter, ServiceHandle};
use crate::registry::ServiceEventListener;
use async_trait::async_trait;
use mesh_core::endpoint::SERVICE_EXPORTED_INTERFACES;
use mesh_core::{Filter, PropertyValue};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type PairKey = (ServiceHandle, String);

#[derive(Default)]
struct TopologyState {
    services: HashMap<ServiceHandle, BTreeMap<String, PropertyValue>>,
    exporters: HashMap<String, Arc<dyn Exporter>>,
    filter: Option<Filter>,
    registrations: HashMap<PairKey, Box<dyn ExportRegistration>>,
    in_flight: HashSet<PairKey>,
    closed: bool,
}

struct ExportJob {
    service: ServiceHandle,
    exporter_id: String,
    exporter: Arc<dyn Exporter>,
    properties: BTreeMap<String, PropertyValue>,
}

/// Keeps export registrations consistent with services, exporters and
/// the configured filter.
pub struct TopologyManager {
    state: Mutex<TopologyState>,
}

impl TopologyManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TopologyState::default()),
        }
    }

    /// An exporter capability became available: export every matching
    /// service through it.
    pub async fn exporter_added(&self, id: &str, exporter: Arc<dyn Exporter>) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            info!("Exporter available: {}", id);
            state.exporters.insert(id.to_string(), exporter);
        }
        self.reconcile().await;
    }

    /// An exporter capability went away: its registrations are closed.
    pub async fn exporter_removed(&self, id: &str) {
        {
            let mut state = self.state.lock().await;
            info!("Exporter gone: {}", id);
            state.exporters.remove(id);
        }
        self.reconcile().await;
    }

    /// A local service appeared.
    pub async fn service_registered(
        &self,
        service: ServiceHandle,
        properties: BTreeMap<String, PropertyValue>,
    ) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            debug!("Service registered: {}", service);
            state.services.insert(service, properties);
        }
        self.reconcile().await;
    }

    /// A local service's properties changed; its filter verdict may
    /// have flipped either way.
    pub async fn service_modified(
        &self,
        service: ServiceHandle,
        properties: BTreeMap<String, PropertyValue>,
    ) {
        {
            let mut state = self.state.lock().await;
            if state.closed || !state.services.contains_key(&service) {
                return;
            }
            debug!("Service modified: {}", service);
            state.services.insert(service, properties);
        }
        self.reconcile().await;
    }

    /// A local service was withdrawn.
    pub async fn service_unregistered(&self, service: ServiceHandle) {
        {
            let mut state = self.state.lock().await;
            debug!("Service unregistered: {}", service);
            state.services.remove(&service);
        }
        self.reconcile().await;
    }

    /// Replace the export filter from its string form. An unparsable
    /// filter is rejected and the previous filter stays active.
    pub async fn set_filter_str(&self, filter: Option<&str>) -> Result<()> {
        let parsed = match filter {
            Some(s) => Some(Filter::parse(s)?),
            None => None,
        };
        self.set_filter(parsed).await;
        Ok(())
    }

    /// Replace the export filter and re-evaluate every tracked service.
    /// Re-applying an equivalent filter never bounces a registration
    /// that already satisfies it.
    pub async fn set_filter(&self, filter: Option<Filter>) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            match &filter {
                Some(f) => info!("Export filter set: {}", f),
                None => info!("Export filter cleared"),
            }
            state.filter = filter;
        }
        self.reconcile().await;
    }

    /// Tear down one registration, typically because its call health
    /// crossed the fault threshold. The service and exporter stay
    /// tracked; a later event may legitimately re-export the pair.
    pub async fn close_registration(&self, service: ServiceHandle, exporter_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(registration) = state
            .registrations
            .remove(&(service, exporter_id.to_string()))
        {
            warn!("Closing unhealthy export of {} via {}", service, exporter_id);
            registration.close();
        }
    }

    /// The (service, exporter) pairs currently exported.
    pub async fn exported_pairs(&self) -> Vec<PairKey> {
        let state = self.state.lock().await;
        let mut pairs: Vec<PairKey> = state.registrations.keys().cloned().collect();
        pairs.sort();
        pairs
    }

    /// Close every registration and stop reacting to events.
    /// Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        for (key, registration) in state.registrations.drain() {
            debug!("Closing export of {} via {}", key.0, key.1);
            registration.close();
        }
        state.services.clear();
        state.exporters.clear();
    }

    /// Whether `(service, exporter)` should currently be exported.
    fn desired(state: &TopologyState, service: ServiceHandle, exporter_id: &str) -> bool {
        if state.closed || !state.exporters.contains_key(exporter_id) {
            return false;
        }
        state
            .services
            .get(&service)
            .map(|props| Self::exportable(&state.filter, props))
            .unwrap_or(false)
    }

    /// A service is exportable when it declares at least one exported
    /// interface and the filter (if any) matches its properties.
    fn exportable(filter: &Option<Filter>, properties: &BTreeMap<String, PropertyValue>) -> bool {
        let declares_interfaces = match properties.get(SERVICE_EXPORTED_INTERFACES) {
            Some(PropertyValue::Str(s)) => !s.is_empty(),
            Some(PropertyValue::List(values)) => !values.is_empty(),
            _ => false,
        };
        if !declares_interfaces {
            return false;
        }
        match filter {
            Some(filter) => filter.matches(properties),
            None => true,
        }
    }

    /// Drive the registration set towards the desired set: close what
    /// is no longer desired, then export what is missing.
    async fn reconcile(&self) {
        let jobs = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let stale: Vec<PairKey> = state
                .registrations
                .keys()
                .filter(|(service, exporter_id)| !Self::desired(state, *service, exporter_id))
                .cloned()
                .collect();
            for key in stale {
                if let Some(registration) = state.registrations.remove(&key) {
                    debug!("Closing export of {} via {}", key.0, key.1);
                    registration.close();
                }
            }

            let mut jobs = Vec::new();
            let services: Vec<(ServiceHandle, BTreeMap<String, PropertyValue>)> = state
                .services
                .iter()
                .map(|(handle, props)| (*handle, props.clone()))
                .collect();
            for (service, properties) in services {
                if !Self::exportable(&state.filter, &properties) {
                    continue;
                }
                for (exporter_id, exporter) in &state.exporters {
                    let key = (service, exporter_id.clone());
                    if state.registrations.contains_key(&key) || state.in_flight.contains(&key) {
                        continue;
                    }
                    state.in_flight.insert(key);
                    jobs.push(ExportJob {
                        service,
                        exporter_id: exporter_id.clone(),
                        exporter: Arc::clone(exporter),
                        properties: properties.clone(),
                    });
                }
            }
            jobs
        };

        for job in jobs {
            self.run_export(job).await;
        }
    }

    async fn run_export(&self, job: ExportJob) {
        debug!("Exporting {} via {}", job.service, job.exporter_id);
        let result = job
            .exporter
            .export_service(job.service, &job.properties)
            .await;

        let key = (job.service, job.exporter_id.clone());
        let mut state = self.state.lock().await;
        state.in_flight.remove(&key);
        match result {
            Ok(registration) => {
                // Validity must be established before the registration
                // is surfaced anywhere: the service may have been
                // withdrawn while the export call was in flight, or the
                // export may have produced an unresolvable endpoint.
                let endpoint = registration.endpoint();
                let still_desired = Self::desired(&state, job.service, &job.exporter_id);
                match (endpoint, still_desired) {
                    (Ok(endpoint), true) if !state.registrations.contains_key(&key) => {
                        info!(
                            "Exported {} via {} as {}",
                            job.service, job.exporter_id, endpoint
                        );
                        state.registrations.insert(key, registration);
                    }
                    (Err(e), _) => {
                        warn!(
                            "Export of {} via {} produced an invalid registration ({}), closing",
                            job.service, job.exporter_id, e
                        );
                        registration.close();
                    }
                    _ => {
                        debug!(
                            "Export of {} via {} is no longer wanted, closing",
                            job.service, job.exporter_id
                        );
                        registration.close();
                    }
                }
            }
            Err(e) => {
                warn!("Export of {} via {} failed: {}", job.service, job.exporter_id, e);
            }
        }
    }
}

impl Default for TopologyManager {
    fn default() -> Self {
        Self::new()
    }
}

// Lets the manager subscribe directly to a `ServiceRegistry`.
#[async_trait]
impl ServiceEventListener for TopologyManager {
    async fn on_registered(
        &self,
        service: ServiceHandle,
        properties: &BTreeMap<String, PropertyValue>,
    ) {
        self.service_registered(service, properties.clone()).await;
    }

    async fn on_modified(
        &self,
        service: ServiceHandle,
        properties: &BTreeMap<String, PropertyValue>,
    ) {
        self.service_modified(service, properties.clone()).await;
    }

    async fn on_unregistered(&self, service: ServiceHandle) {
        self.service_unregistered(service).await;
    }
}
