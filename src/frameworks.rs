//! The framework registry: an in-process table mapping a registered
//! `(framework.type, framework.version)` to the runner image and default
//! resource/probe shape used to build its workload.

/// One registered runner kind. `version` is matched exactly; unknown
/// `(type, version)` pairs are rejected by the admission validator.
#[derive(Debug, Clone)]
pub struct FrameworkDescriptor {
    pub kind: String,
    pub version: String,
    pub image: String,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub default_timeout_seconds: i64,
}

/// Returns the built-in framework registry. In a production deployment this
/// would be backed by a ConfigMap or CRD watch; a static table is sufficient
/// here since registering new framework kinds is handled out of band.
pub fn all_frameworks() -> Vec<FrameworkDescriptor> {
    vec![
        FrameworkDescriptor {
            kind: "claude-code".into(),
            version: "1.0".into(),
            image: "registry.internal/runners/claude-code:1.0".into(),
            cpu_request: "250m".into(),
            cpu_limit: "1".into(),
            memory_request: "256Mi".into(),
            memory_limit: "1Gi".into(),
            default_timeout_seconds: 1800,
        },
        FrameworkDescriptor {
            kind: "claude-code".into(),
            version: "1.1".into(),
            image: "registry.internal/runners/claude-code:1.1".into(),
            cpu_request: "250m".into(),
            cpu_limit: "1".into(),
            memory_request: "256Mi".into(),
            memory_limit: "1Gi".into(),
            default_timeout_seconds: 1800,
        },
        FrameworkDescriptor {
            kind: "aider".into(),
            version: "0.9".into(),
            image: "registry.internal/runners/aider:0.9".into(),
            cpu_request: "100m".into(),
            cpu_limit: "500m".into(),
            memory_request: "128Mi".into(),
            memory_limit: "512Mi".into(),
            default_timeout_seconds: 900,
        },
    ]
}

/// Looks up a framework by exact `(type, version)` match.
pub fn get_framework(kind: &str, version: &str) -> Option<FrameworkDescriptor> {
    all_frameworks()
        .into_iter()
        .find(|f| f.kind == kind && f.version == version)
}

/// Whether `kind` is registered under any version. The admission validator
/// only needs the type; the reconciler additionally needs the exact version
/// to resolve an image.
pub fn is_registered_kind(kind: &str) -> bool {
    all_frameworks().iter().any(|f| f.kind == kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_frameworks_non_empty() {
        assert!(!all_frameworks().is_empty());
    }

    #[test]
    fn test_get_framework_known() {
        let fw = get_framework("claude-code", "1.0").expect("should be registered");
        assert_eq!(fw.image, "registry.internal/runners/claude-code:1.0");
    }

    #[test]
    fn test_get_framework_unknown_version_returns_none() {
        assert!(get_framework("claude-code", "99.0").is_none());
    }

    #[test]
    fn test_get_framework_unknown_kind_returns_none() {
        assert!(get_framework("nonexistent", "1.0").is_none());
    }

    #[test]
    fn test_is_registered_kind() {
        assert!(is_registered_kind("claude-code"));
        assert!(is_registered_kind("aider"));
        assert!(!is_registered_kind("nonexistent"));
    }

    #[test]
    fn test_framework_kind_version_pairs_unique() {
        let frameworks = all_frameworks();
        let mut seen = std::collections::HashSet::new();
        for fw in &frameworks {
            assert!(seen.insert((fw.kind.clone(), fw.version.clone())), "duplicate framework registration");
        }
    }
}
