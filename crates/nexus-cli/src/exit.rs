//! Process exit codes and operator hints derived from errors.

use nexus_common::error::NexusError;

/// Any failure without a more specific code.
pub const FAILURE: u8 = 1;
/// The request was invalid.
pub const VALIDATION: u8 = 2;
/// The address pool is exhausted.
pub const EXHAUSTED: u8 = 3;
/// The service could not be initialized.
pub const INITIALIZATION: u8 = 4;
/// A kernel operation or node start failed.
pub const KERNEL: u8 = 5;
/// The node is unknown or already exists.
pub const CONFLICT: u8 = 6;

fn nexus_error(err: &anyhow::Error) -> Option<&NexusError> {
    err.chain().find_map(|cause| cause.downcast_ref::<NexusError>())
}

/// Exit code for `err`.
pub fn code(err: &anyhow::Error) -> u8 {
    match nexus_error(err) {
        Some(NexusError::Validation { .. }) => VALIDATION,
        Some(NexusError::AddressExhausted { .. }) => EXHAUSTED,
        Some(NexusError::Initialization { .. }) => INITIALIZATION,
        Some(
            NexusError::Kernel { .. }
            | NexusError::StartFailed { .. }
            | NexusError::WiringFailed { .. },
        ) => KERNEL,
        Some(
            NexusError::NotFound { .. } | NexusError::AlreadyExists { .. } | NexusError::Busy { .. },
        ) => CONFLICT,
        _ => FAILURE,
    }
}

/// Hint printed after errors that usually mean missing privileges.
pub fn hint(err: &anyhow::Error) -> Option<&'static str> {
    match nexus_error(err) {
        Some(
            NexusError::Validation { .. }
            | NexusError::AddressExhausted { .. }
            | NexusError::NotFound { .. }
            | NexusError::AlreadyExists { .. }
            | NexusError::Busy { .. }
            | NexusError::Config { .. }
            | NexusError::Serialization { .. },
        ) => None,
        _ => Some("node operations need root (CAP_SYS_ADMIN and CAP_NET_ADMIN) and a cgroup v2 host"),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    fn kernel() -> NexusError {
        NexusError::kernel("create bridge", "nexus0", std::io::Error::from_raw_os_error(1))
    }

    #[test]
    fn each_error_class_has_its_code() {
        let cases = [
            (NexusError::validation("empty"), VALIDATION),
            (
                NexusError::AddressExhausted {
                    subnet: "10.0.42.0/24".into(),
                },
                EXHAUSTED,
            ),
            (
                NexusError::Initialization {
                    component: "bridge",
                    source: Box::new(kernel()),
                },
                INITIALIZATION,
            ),
            (kernel(), KERNEL),
            (
                NexusError::StartFailed {
                    id: "web-1".into(),
                    source: Box::new(kernel()),
                    cleanup: None,
                },
                KERNEL,
            ),
            (
                NexusError::NotFound {
                    kind: "node",
                    id: "ghost".into(),
                },
                CONFLICT,
            ),
            (NexusError::Busy { id: "web-1".into() }, CONFLICT),
            (
                NexusError::Config {
                    message: "bad".into(),
                },
                FAILURE,
            ),
        ];
        for (err, expected) in cases {
            let shown = err.to_string();
            assert_eq!(code(&anyhow::Error::from(err)), expected, "{shown}");
        }
    }

    #[test]
    fn context_does_not_hide_the_code() {
        let err = Err::<(), _>(NexusError::validation("empty"))
            .context("creating node")
            .unwrap_err();
        assert_eq!(code(&err), VALIDATION);
    }

    #[test]
    fn foreign_errors_fail_generically() {
        assert_eq!(code(&anyhow::anyhow!("boom")), FAILURE);
    }

    #[test]
    fn only_host_failures_get_a_privilege_hint() {
        assert!(hint(&anyhow::Error::from(kernel())).is_some());
        assert!(hint(&anyhow::Error::from(NexusError::validation("empty"))).is_none());
    }
}
