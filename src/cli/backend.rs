//! Backend selection from the `--backend` flag.

use std::sync::Arc;

use crate::backend::host::HostBackend;
use crate::backend::GraphBackend;
use crate::error::DiffusionError;

/// Resolve a graph backend by name.
///
/// Accepted values: "auto" (default) and "host".
pub fn resolve_backend(name: Option<&str>) -> Result<Arc<dyn GraphBackend>, DiffusionError> {
    match name.unwrap_or("auto") {
        "auto" => Ok(crate::backend::select_backend()),
        "host" => Ok(Arc::new(HostBackend::new())),
        other => Err(DiffusionError::invalid_argument(
            "backend",
            format!("Unknown backend '{}'. Options: auto, host", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_resolve_backend_auto() {
        assert!(resolve_backend(Some("auto")).is_ok());
    }

    #[test]
    fn test_resolve_backend_none_defaults_to_auto() {
        let backend = resolve_backend(None).unwrap();
        assert_eq!(backend.name(), "host");
    }

    #[test]
    fn test_resolve_backend_host() {
        assert_eq!(resolve_backend(Some("host")).unwrap().name(), "host");
    }

    #[test]
    fn test_resolve_backend_unknown() {
        match resolve_backend(Some("npu")) {
            Err(e) => {
                assert_eq!(e.code(), ErrorCode::InvalidArgument);
                assert!(e.to_string().contains("Unknown backend 'npu'"), "Error: {}", e);
            }
            Ok(_) => panic!("Expected error for unknown backend"),
        }
    }

    #[test]
    fn test_resolve_backend_empty_string() {
        assert!(resolve_backend(Some("")).is_err());
    }
}
