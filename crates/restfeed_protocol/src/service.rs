//! Published service definitions.

use serde::{Deserialize, Serialize};

/// Access role that makes a service readable without any role.
pub const WORLD_READABLE: &str = "*";

/// Feature switches of a published service.
///
/// Each flag gates the corresponding HTTP operation. Calling a disabled
/// operation is a client error, not a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceFlags {
    /// `GET /` lists the collection.
    pub listing: bool,
    /// `GET /<key>` returns one object.
    pub get: bool,
    /// `POST /` and `PUT /<key>` may create objects.
    pub create: bool,
    /// `PUT /<key>` may update objects.
    pub update: bool,
    /// `DELETE /<key>` removes objects.
    pub delete: bool,
    /// Maintain an object state index and serve the change endpoints.
    pub change_tracking: bool,
    /// Writes must carry the current version tag.
    pub strict_versioning: bool,
}

impl ServiceFlags {
    /// Read-only defaults: listing and get enabled, nothing else.
    pub fn read_only() -> Self {
        Self {
            listing: true,
            get: true,
            create: false,
            update: false,
            delete: false,
            change_tracking: false,
            strict_versioning: false,
        }
    }

    /// Every operation enabled, including change tracking and strict versioning.
    pub fn all() -> Self {
        Self {
            listing: true,
            get: true,
            create: true,
            update: true,
            delete: true,
            change_tracking: true,
            strict_versioning: true,
        }
    }
}

impl Default for ServiceFlags {
    fn default() -> Self {
        Self::read_only()
    }
}

/// Configuration of one published collection.
///
/// Definitions are supplied by the application and are immutable once a
/// service has been registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Service name; also the last path segment of the service URL.
    pub name: String,
    /// Human readable description shown by `?about`.
    #[serde(default)]
    pub description: String,
    /// Identifier of the source collection.
    pub source_collection: String,
    /// Attribute holding the published key.
    pub key_attribute: String,
    /// Optional row filter, interpreted by the source collection.
    #[serde(default)]
    pub constraint: Option<String>,
    /// Enabled operations.
    #[serde(default)]
    pub flags: ServiceFlags,
    /// Publish transform identifier (record to representation).
    #[serde(default)]
    pub on_publish: Option<String>,
    /// Update callback identifier (payload into record).
    #[serde(default)]
    pub on_update: Option<String>,
    /// Delete callback identifier; records are deleted directly when absent.
    #[serde(default)]
    pub on_delete: Option<String>,
    /// Role required to use the service, or `"*"`.
    #[serde(default = "default_access_role")]
    pub access_role: String,
}

fn default_access_role() -> String {
    WORLD_READABLE.to_string()
}

impl ServiceDefinition {
    /// Creates a world-readable, read-only definition.
    pub fn new(
        name: impl Into<String>,
        source_collection: impl Into<String>,
        key_attribute: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            source_collection: source_collection.into(),
            key_attribute: key_attribute.into(),
            constraint: None,
            flags: ServiceFlags::default(),
            on_publish: None,
            on_update: None,
            on_delete: None,
            access_role: default_access_role(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the row filter.
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    /// Sets the enabled operations.
    pub fn with_flags(mut self, flags: ServiceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the publish transform.
    pub fn with_publish(mut self, callback: impl Into<String>) -> Self {
        self.on_publish = Some(callback.into());
        self
    }

    /// Sets the update callback.
    pub fn with_update(mut self, callback: impl Into<String>) -> Self {
        self.on_update = Some(callback.into());
        self
    }

    /// Sets the delete callback.
    pub fn with_delete(mut self, callback: impl Into<String>) -> Self {
        self.on_delete = Some(callback.into());
        self
    }

    /// Sets the required role.
    pub fn with_access_role(mut self, role: impl Into<String>) -> Self {
        self.access_role = role.into();
        self
    }

    /// Returns true if no role is required.
    pub fn is_world_readable(&self) -> bool {
        self.access_role.trim() == WORLD_READABLE
    }

    /// Returns the role required by this service.
    pub fn required_role(&self) -> &str {
        self.access_role.trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_read_only_and_public() {
        let def = ServiceDefinition::new("tasks", "Task", "code");
        assert!(def.flags.listing);
        assert!(def.flags.get);
        assert!(!def.flags.create);
        assert!(!def.flags.change_tracking);
        assert!(def.is_world_readable());
    }

    #[test]
    fn role_is_trimmed() {
        let def = ServiceDefinition::new("tasks", "Task", "code").with_access_role(" Admin ");
        assert!(!def.is_world_readable());
        assert_eq!(def.required_role(), "Admin");
    }

    #[test]
    fn definition_from_json() {
        let def: ServiceDefinition = serde_json::from_str(
            r#"{
                "name": "tasks",
                "source_collection": "Task",
                "key_attribute": "code",
                "flags": {"create": true, "change_tracking": true}
            }"#,
        )
        .unwrap();

        assert!(def.flags.create);
        assert!(def.flags.change_tracking);
        // Missing flags fall back to the read-only defaults.
        assert!(def.flags.listing);
        assert!(!def.flags.delete);
        assert_eq!(def.access_role, "*");
    }
}
