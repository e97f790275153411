//! Service descriptions served at `?about`.

use crate::service::PublishedService;
use restfeed_protocol::{PARAM_DATA, PARAM_SINCE, PARAM_TIMEOUT};
use serde::Serialize;

/// One endpoint of a published service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    /// HTTP method.
    pub method: &'static str,
    /// Absolute URL template.
    pub path: String,
    /// What the endpoint does.
    pub summary: String,
}

/// The `?about` document of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescription {
    /// Service name.
    pub name: String,
    /// Free-text description from the definition.
    pub description: String,
    /// Service root URL.
    pub url: String,
    /// Attribute used as object key.
    pub key_attribute: String,
    /// Role required, or `"*"`.
    pub access_role: String,
    /// Whether the change endpoints are available.
    pub change_tracking: bool,
    /// Whether writes must carry the current version tag.
    pub strict_versioning: bool,
    /// Enabled endpoints only.
    pub endpoints: Vec<Endpoint>,
}

/// Builds the description of `service`, listing only enabled endpoints.
pub fn describe(service: &PublishedService) -> ServiceDescription {
    let def = service.definition();
    let flags = def.flags;
    let url = service.url();
    let object_url = format!("{url}<{}>", def.key_attribute);

    let mut endpoints = Vec::new();
    let mut add = |method, path: String, summary: String| {
        endpoints.push(Endpoint {
            method,
            path,
            summary,
        })
    };

    add("GET", format!("{url}?about"), "This description".into());
    if flags.listing {
        add(
            "GET",
            format!("{url}?{PARAM_DATA}=true"),
            format!("Lists all objects; with {PARAM_DATA}=false lists their URLs"),
        );
    }
    if flags.get {
        add(
            "GET",
            object_url.clone(),
            "Returns one object; honours If-None-Match".into(),
        );
    }
    if flags.create {
        add(
            "POST",
            url.to_string(),
            "Creates an object and returns its key".into(),
        );
    }
    if flags.create || flags.update {
        let summary = match (flags.create, flags.update) {
            (true, true) => "Creates or updates an object",
            (true, false) => "Creates an object with the given key",
            _ => "Updates an existing object",
        };
        add("PUT", object_url.clone(), versioned(summary, flags.strict_versioning));
    }
    if flags.delete {
        add(
            "DELETE",
            object_url,
            versioned("Deletes an object", flags.strict_versioning),
        );
    }
    if flags.change_tracking {
        add(
            "GET",
            format!("{url}changes/list?{PARAM_SINCE}=<revision>"),
            "Returns all changes after the given revision as a JSON array".into(),
        );
        add(
            "GET",
            format!("{url}changes/feed?{PARAM_SINCE}=<revision>&{PARAM_TIMEOUT}=<ms>"),
            "Streams changes after the given revision, one JSON object per line".into(),
        );
    }

    ServiceDescription {
        name: def.name.clone(),
        description: def.description.clone(),
        url: url.to_string(),
        key_attribute: def.key_attribute.clone(),
        access_role: def.access_role.clone(),
        change_tracking: flags.change_tracking,
        strict_versioning: flags.strict_versioning,
        endpoints,
    }
}

fn versioned(summary: &str, strict: bool) -> String {
    if strict {
        format!("{summary}; requires If-Match with the current version tag")
    } else {
        summary.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::CallbackRegistry;
    use crate::config::ServerConfig;
    use crate::source::MemoryCollection;
    use restfeed_protocol::{ServiceDefinition, ServiceFlags};
    use std::sync::Arc;

    fn describe_with(flags: ServiceFlags) -> ServiceDescription {
        let mut callbacks = CallbackRegistry::new();
        callbacks.register_update("noop", |_, _| Ok(()));
        let def = ServiceDefinition::new("tasks", "Task", "code")
            .with_description("Open tasks")
            .with_flags(flags)
            .with_update("noop");
        let svc = PublishedService::new(
            def,
            Arc::new(MemoryCollection::new()),
            &callbacks,
            &ServerConfig::default(),
        )
        .unwrap();
        describe(&svc)
    }

    #[test]
    fn read_only_service_lists_reads() {
        let about = describe_with(ServiceFlags::read_only());
        let methods: Vec<_> = about.endpoints.iter().map(|e| e.method).collect();
        assert_eq!(methods, ["GET", "GET", "GET"]);
        assert_eq!(about.description, "Open tasks");
        assert!(!about.change_tracking);
    }

    #[test]
    fn full_service_lists_everything() {
        let about = describe_with(ServiceFlags::all());
        let methods: Vec<_> = about.endpoints.iter().map(|e| e.method).collect();
        assert_eq!(methods, ["GET", "GET", "GET", "POST", "PUT", "DELETE", "GET", "GET"]);
        assert!(about
            .endpoints
            .iter()
            .any(|e| e.path == "http://localhost:8080/rest/tasks/changes/feed?since=<revision>&timeout=<ms>"));
        assert!(about.endpoints[4].summary.contains("If-Match"));
    }
}
