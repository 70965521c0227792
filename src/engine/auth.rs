//! Registry credential resolution

use bollard::auth::DockerCredentials;

use crate::config::BoxDefinition;

/// Resolve credentials for a box, anonymous when none are configured
pub fn credentials_for(definition: &BoxDefinition, registry: &str) -> Option<DockerCredentials> {
    let auth = definition.auth.as_ref()?;

    let username = auth.username.clone()?;
    let password = auth.password.clone()?;

    let serveraddress = auth
        .registry
        .clone()
        .filter(|r| !r.is_empty())
        .or_else(|| {
            if registry.is_empty() {
                None
            } else {
                Some(registry.to_string())
            }
        });

    Some(DockerCredentials {
        username: Some(username),
        password: Some(password),
        serveraddress,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthDefinition;

    #[test]
    fn test_no_auth_is_anonymous() {
        let def = BoxDefinition::default();
        assert!(credentials_for(&def, "").is_none());
    }

    #[test]
    fn test_credentials_pick_up_registry() {
        let def = BoxDefinition {
            auth: Some(AuthDefinition {
                username: Some("u".to_string()),
                password: Some("p".to_string()),
                registry: None,
            }),
            ..Default::default()
        };
        let creds = credentials_for(&def, "https://quay.io/v2/").unwrap();
        assert_eq!(creds.username.as_deref(), Some("u"));
        assert_eq!(creds.serveraddress.as_deref(), Some("https://quay.io/v2/"));
    }
}
