//! Unified error type for the Nexus workspace.
//!
//! The variants follow the failure taxonomy of node provisioning:
//! validation problems are rejected before any resource is touched,
//! kernel failures carry the operation and the object they targeted, and
//! initialization failures wrap whatever prevented the service from
//! becoming usable.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum NexusError {
    /// The request was rejected before any resource was touched.
    #[error("invalid request: {message}")]
    Validation {
        /// Why the request was rejected.
        message: String,
    },

    /// No free address remains in the pool.
    #[error("no available address in subnet {subnet}")]
    AddressExhausted {
        /// Subnet that ran out of host addresses.
        subnet: String,
    },

    /// A kernel-facing operation (link, namespace, cgroup, mount, route) failed.
    #[error("{operation} failed for {target}: {source}")]
    Kernel {
        /// Operation that was attempted, e.g. `create veth pair`.
        operation: &'static str,
        /// Object the operation targeted (link name, pid, cgroup path).
        target: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The isolated process could not be started.
    #[error("failed to start node {id}: {source}{}", cleanup_suffix(.cleanup.as_deref()))]
    StartFailed {
        /// Identifier of the node that failed to start.
        id: String,
        /// The original start failure.
        source: Box<NexusError>,
        /// Error raised while tearing down the partial instance, if any.
        cleanup: Option<Box<NexusError>>,
    },

    /// The node's network could not be wired.
    #[error("failed to wire node {id}: {source}{}", cleanup_suffix(.cleanup.as_deref()))]
    WiringFailed {
        /// Identifier of the node being wired.
        id: String,
        /// The failing wiring step.
        source: Box<NexusError>,
        /// Error raised while removing the partial wiring, if any.
        cleanup: Option<Box<NexusError>>,
    },

    /// Another operation on the same node is in progress.
    #[error("node {id} is busy with another operation")]
    Busy {
        /// Identifier of the contended node.
        id: String,
    },

    /// A component could not be initialized; the service is unusable.
    #[error("unable to initialize {component}: {source}")]
    Initialization {
        /// Component that failed (`runtime`, `bridge`, ...).
        component: &'static str,
        /// Underlying cause.
        source: Box<NexusError>,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource with the same identifier already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the conflicting resource.
        kind: &'static str,
        /// Conflicting identifier.
        id: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

fn cleanup_suffix(cleanup: Option<&NexusError>) -> String {
    cleanup.map_or_else(String::new, |e| format!("; cleanup also failed: {e}"))
}

impl NexusError {
    /// Wraps an OS error from a kernel-facing operation.
    pub fn kernel(
        operation: &'static str,
        target: impl Into<String>,
        source: impl Into<std::io::Error>,
    ) -> Self {
        Self::Kernel {
            operation,
            target: target.into(),
            source: source.into(),
        }
    }

    /// Wraps an I/O error that happened at `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, NexusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_error_names_operation_and_target() {
        let err = NexusError::kernel(
            "attach to bridge",
            "nex-web-1",
            std::io::Error::other("no such device"),
        );
        assert_eq!(
            err.to_string(),
            "attach to bridge failed for nex-web-1: no such device"
        );
    }

    #[test]
    fn start_failure_reports_both_errors() {
        let err = NexusError::StartFailed {
            id: "web-1".into(),
            source: Box::new(NexusError::validation("exec failed")),
            cleanup: Some(Box::new(NexusError::NotFound {
                kind: "cgroup",
                id: "nexus/web-1".into(),
            })),
        };
        let msg = err.to_string();
        assert!(msg.contains("failed to start node web-1"));
        assert!(msg.contains("exec failed"));
        assert!(msg.contains("cleanup also failed: cgroup not found: nexus/web-1"));
    }

    #[test]
    fn wiring_failure_names_the_leftover_link() {
        let err = NexusError::WiringFailed {
            id: "web-1".into(),
            source: Box::new(NexusError::kernel(
                "add default route",
                "eth0",
                std::io::Error::other("unreachable"),
            )),
            cleanup: Some(Box::new(NexusError::kernel(
                "delete link",
                "nex-web-1",
                std::io::Error::other("busy"),
            ))),
        };
        assert_eq!(
            err.to_string(),
            "failed to wire node web-1: add default route failed for eth0: unreachable; \
             cleanup also failed: delete link failed for nex-web-1: busy"
        );
    }

    #[test]
    fn start_failure_without_cleanup_error_has_no_suffix() {
        let err = NexusError::StartFailed {
            id: "web-1".into(),
            source: Box::new(NexusError::validation("exec failed")),
            cleanup: None,
        };
        assert!(!err.to_string().contains("cleanup"));
    }
}
