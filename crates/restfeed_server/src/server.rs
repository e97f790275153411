//! The REST server: service registry and top-level routing.

use crate::callbacks::CallbackRegistry;
use crate::config::{ServerConfig, REST_PATH};
use crate::error::{ServerError, ServerResult};
use crate::handler::{handle_service, write_error, write_json};
use crate::service::PublishedService;
use crate::source::SourceCollection;
use http::{Method, Request, Response, StatusCode};
use parking_lot::RwLock;
use restfeed_protocol::{BufferedResponse, ResponseSink, ServiceDefinition, VERSION};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Publishes collections under `<base_url>rest/<service>/`.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use restfeed_server::{CallbackRegistry, MemoryCollection, RestServer, ServerConfig};
/// use restfeed_protocol::ServiceDefinition;
///
/// let server = RestServer::new(ServerConfig::default()).unwrap();
/// let tasks = ServiceDefinition::new("tasks", "Task", "code");
/// server
///     .register(tasks, Arc::new(MemoryCollection::new()), &CallbackRegistry::new())
///     .unwrap();
///
/// let request = http::Request::get("http://localhost:8080/rest/tasks/")
///     .body(Vec::new())
///     .unwrap();
/// let response = server.handle(request);
/// assert_eq!(response.status(), 200);
/// assert_eq!(response.body(), b"[]");
/// ```
pub struct RestServer {
    config: ServerConfig,
    rest_path: String,
    services: RwLock<BTreeMap<String, Arc<PublishedService>>>,
}

impl RestServer {
    /// Creates a server without services.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the base URL cannot be parsed.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            ServerError::Configuration(format!("invalid base url '{}': {e}", config.base_url))
        })?;
        let rest_path = format!("{}{REST_PATH}/", base.path());

        Ok(Self {
            config,
            rest_path,
            services: RwLock::new(BTreeMap::new()),
        })
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Publishes a collection.
    ///
    /// Tracked services whose index is still empty are indexed from the
    /// source right away.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a duplicate name or an invalid
    /// definition, or the first failure while building the index.
    pub fn register(
        &self,
        definition: ServiceDefinition,
        source: Arc<dyn SourceCollection>,
        callbacks: &CallbackRegistry,
    ) -> ServerResult<Arc<PublishedService>> {
        if self.services.read().contains_key(&definition.name) {
            return Err(ServerError::Configuration(format!(
                "service '{}' is already registered",
                definition.name
            )));
        }

        let service = Arc::new(PublishedService::new(
            definition,
            source,
            callbacks,
            &self.config,
        )?);

        if let Some(changes) = service.change_manager() {
            if changes.latest_revision() == 0 {
                service.rebuild_index()?;
            }
        }

        let mut services = self.services.write();
        if services.contains_key(service.name()) {
            return Err(ServerError::Configuration(format!(
                "service '{}' is already registered",
                service.name()
            )));
        }
        services.insert(service.name().to_string(), Arc::clone(&service));

        info!(
            service = %service.name(),
            url = %service.url(),
            tracking = service.is_tracking(),
            "registered service"
        );
        Ok(service)
    }

    /// Returns a registered service.
    pub fn service(&self, name: &str) -> Option<Arc<PublishedService>> {
        self.services.read().get(name).cloned()
    }

    /// Returns the names of all registered services, sorted.
    pub fn service_names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    /// Returns the overview served at `<base_url>rest/`.
    pub fn overview(&self) -> Value {
        let services: Vec<String> = self
            .services
            .read()
            .values()
            .map(|service| format!("{}?about", service.url()))
            .collect();
        json!({ "RestServices": VERSION, "services": services })
    }

    /// Handles a request and buffers the whole response.
    ///
    /// Feed requests block until the feed closes, so they must carry a
    /// non-zero `timeout` here; use [`RestServer::handle_into`] to stream.
    pub fn handle(&self, request: Request<Vec<u8>>) -> Response<Vec<u8>> {
        let mut sink = BufferedResponse::new();
        self.handle_into(&request, &mut sink);
        sink.into_response()
    }

    /// Handles a request, writing the response into `sink`.
    ///
    /// Errors are reported as JSON error bodies; errors that occur after
    /// the response has started are only logged.
    pub fn handle_into(&self, request: &Request<Vec<u8>>, sink: &mut dyn ResponseSink) {
        debug!(method = %request.method(), uri = %request.uri(), "routing request");
        if let Err(err) = self.route(request, sink) {
            write_error(sink, &err);
        }
    }

    fn route(&self, request: &Request<Vec<u8>>, sink: &mut dyn ResponseSink) -> ServerResult<()> {
        let path = request.uri().path();
        let overview_path = self.rest_path.trim_end_matches('/');

        if path == self.rest_path || path == overview_path {
            if *request.method() != Method::GET {
                return Err(ServerError::MethodNotAllowed(format!(
                    "{} is not supported on the overview",
                    request.method()
                )));
            }
            return write_json(sink, StatusCode::OK, &self.overview());
        }

        let rest = path
            .strip_prefix(self.rest_path.as_str())
            .ok_or_else(|| ServerError::NotFound(format!("no resource at '{path}'")))?;
        let (name, route) = rest.split_once('/').unwrap_or((rest, ""));

        let service = self
            .service(name)
            .ok_or_else(|| ServerError::NotFound(format!("no service named '{name}'")))?;
        handle_service(&service, request, route, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryCollection;
    use restfeed_protocol::ServiceFlags;

    fn server() -> RestServer {
        RestServer::new(ServerConfig::new("http://example.com/app")).unwrap()
    }

    fn get(server: &RestServer, uri: &str) -> Response<Vec<u8>> {
        server.handle(Request::get(uri).body(Vec::new()).unwrap())
    }

    #[test]
    fn duplicate_service_is_rejected() {
        let server = server();
        let def = ServiceDefinition::new("tasks", "Task", "code");
        let source = Arc::new(MemoryCollection::new());
        server
            .register(def.clone(), source.clone(), &CallbackRegistry::new())
            .unwrap();
        let err = server
            .register(def, source, &CallbackRegistry::new())
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Configuration(_)));
    }

    #[test]
    fn overview_lists_services() {
        let server = server();
        for name in ["notes", "tasks"] {
            server
                .register(
                    ServiceDefinition::new(name, "X", "id"),
                    Arc::new(MemoryCollection::new()),
                    &CallbackRegistry::new(),
                )
                .unwrap();
        }

        let response = get(&server, "http://example.com/app/rest/");
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["RestServices"], VERSION);
        assert_eq!(
            body["services"],
            json!([
                "http://example.com/app/rest/notes/?about",
                "http://example.com/app/rest/tasks/?about"
            ])
        );
        assert_eq!(server.service_names(), vec!["notes", "tasks"]);
    }

    #[test]
    fn unknown_paths_are_not_found() {
        let server = server();
        assert_eq!(
            get(&server, "http://example.com/app/rest/nothing/").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get(&server, "http://example.com/elsewhere").status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn register_indexes_existing_records() {
        let server = server();
        let source = Arc::new(MemoryCollection::new());
        source.insert(json!({"id": "a"}).as_object().unwrap().clone());

        let mut callbacks = CallbackRegistry::new();
        callbacks.register_update("noop", |_, _| Ok(()));
        let def = ServiceDefinition::new("tasks", "X", "id")
            .with_flags(ServiceFlags::all())
            .with_update("noop");
        let service = server.register(def, source, &callbacks).unwrap();

        assert_eq!(service.change_manager().unwrap().latest_revision(), 1);
    }
}
