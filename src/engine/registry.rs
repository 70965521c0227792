//! Image name normalization and registry inference

/// A repository split into its registry and normalized name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InferredImage {
    /// Repository usable with the daemon, registry host included when remote
    pub repository: String,
    /// Registry API endpoint, empty for the default registry
    pub registry: String,
}

/// Infer the registry endpoint from a repository reference.
///
/// `user/app` stays on the default registry; `quay.io/user/app` yields
/// `https://quay.io/v2/`. An explicitly configured registry URL wins over
/// inference.
pub fn normalize_repo(repository: &str, configured_registry: &str) -> InferredImage {
    if !configured_registry.is_empty() {
        return InferredImage {
            repository: repository.to_string(),
            registry: normalize_registry(configured_registry),
        };
    }

    let first = repository.split('/').next().unwrap_or("");
    let has_host = first.contains('.') || first.contains(':') || first == "localhost";

    if has_host {
        InferredImage {
            repository: repository.to_string(),
            registry: normalize_registry(first),
        }
    } else {
        InferredImage {
            repository: repository.to_string(),
            registry: String::new(),
        }
    }
}

/// Shape a registry host or URL into a v2 API endpoint
pub fn normalize_registry(registry: &str) -> String {
    if registry.is_empty() {
        return String::new();
    }

    let mut base = registry.to_string();
    if !base.starts_with("http://") && !base.starts_with("https://") {
        base = format!("https://{}", base);
    }

    let mut url = match url::Url::parse(&base) {
        Ok(u) => u,
        Err(_) => return registry.to_string(),
    };

    let path = url.path().trim_matches('/').to_string();
    let path = if path.is_empty() || path == "v1" { "v2".to_string() } else { path };
    url.set_path(&format!("{}/", path));

    url.to_string()
}

/// Split `repo[:tag]`, defaulting the tag
pub fn split_repo_tag(image: &str, default_tag: &str) -> (String, String) {
    // A colon after the last slash is a tag separator; earlier ones
    // belong to a registry host:port
    match image.rfind(':') {
        Some(idx) if idx > image.rfind('/').unwrap_or(0) => {
            (image[..idx].to_string(), image[idx + 1..].to_string())
        }
        _ => (image.to_string(), default_tag.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_repo_keeps_default_registry() {
        let inferred = normalize_repo("user/app", "");
        assert_eq!(inferred.repository, "user/app");
        assert_eq!(inferred.registry, "");
    }

    #[test]
    fn test_hosted_repo_infers_registry() {
        let inferred = normalize_repo("quay.io/user/app", "");
        assert_eq!(inferred.repository, "quay.io/user/app");
        assert_eq!(inferred.registry, "https://quay.io/v2/");
    }

    #[test]
    fn test_configured_registry_wins() {
        let inferred = normalize_repo("user/app", "registry.example.com");
        assert_eq!(inferred.registry, "https://registry.example.com/v2/");
    }

    #[test]
    fn test_normalize_registry_shapes() {
        assert_eq!(normalize_registry(""), "");
        assert_eq!(normalize_registry("quay.io"), "https://quay.io/v2/");
        assert_eq!(
            normalize_registry("http://registry.local/v1"),
            "http://registry.local/v2/"
        );
    }

    #[test]
    fn test_split_repo_tag() {
        assert_eq!(
            split_repo_tag("ubuntu", "latest"),
            ("ubuntu".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_repo_tag("ubuntu:22.04", "latest"),
            ("ubuntu".to_string(), "22.04".to_string())
        );
        assert_eq!(
            split_repo_tag("registry:5000/user/app", "latest"),
            ("registry:5000/user/app".to_string(), "latest".to_string())
        );
        assert_eq!(
            split_repo_tag("registry:5000/user/app:v2", "latest"),
            ("registry:5000/user/app".to_string(), "v2".to_string())
        );
    }
}
