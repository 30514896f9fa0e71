//! OAuth provider catalogue: endpoint URLs, scopes, and profile mapping for
//! each supported identity provider.

use serde_json::Value;

/// Normalized profile returned by a provider's user-info endpoint.
#[derive(Debug, Clone)]
pub struct OAuthUserInfo {
    pub id: String,
    pub email: String,
    pub name: String,
    pub avatar_url: Option<String>,
}

/// Static description of one OAuth provider.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub name: &'static str,
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: &'static str,
    pub token_url: &'static str,
    pub user_info_url: &'static str,
    /// Fallback endpoint for providers that omit the email from the profile.
    pub emails_url: Option<&'static str>,
    pub scopes: &'static [&'static str],
    /// Extra query parameters for the consent URL.
    pub extra_auth_params: &'static [(&'static str, &'static str)],
    pub map_user_info: fn(&Value) -> Option<OAuthUserInfo>,
}

impl ProviderSpec {
    pub fn google(client_id: String, client_secret: String) -> Self {
        Self {
            name: "google",
            client_id,
            client_secret,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
            token_url: "https://oauth2.googleapis.com/token",
            user_info_url: "https://www.googleapis.com/oauth2/v2/userinfo",
            emails_url: None,
            scopes: &["openid", "email", "profile"],
            extra_auth_params: &[("access_type", "offline"), ("prompt", "consent")],
            map_user_info: |v| {
                Some(OAuthUserInfo {
                    id: v["id"].as_str()?.to_string(),
                    email: v["email"].as_str().unwrap_or_default().to_string(),
                    name: v["name"].as_str().unwrap_or_default().to_string(),
                    avatar_url: v["picture"].as_str().map(String::from),
                })
            },
        }
    }

    pub fn github(client_id: String, client_secret: String) -> Self {
        Self {
            name: "github",
            client_id,
            client_secret,
            auth_url: "https://github.com/login/oauth/authorize",
            token_url: "https://github.com/login/oauth/access_token",
            user_info_url: "https://api.github.com/user",
            emails_url: Some("https://api.github.com/user/emails"),
            scopes: &["user:email", "read:user"],
            extra_auth_params: &[],
            map_user_info: |v| {
                let id = v["id"]
                    .as_i64()
                    .map(|i| i.to_string())
                    .or_else(|| v["id"].as_str().map(String::from))?;
                Some(OAuthUserInfo {
                    id,
                    email: v["email"].as_str().unwrap_or_default().to_string(),
                    name: v["name"]
                        .as_str()
                        .or_else(|| v["login"].as_str())
                        .unwrap_or_default()
                        .to_string(),
                    avatar_url: v["avatar_url"].as_str().map(String::from),
                })
            },
        }
    }
}

/// Pick an address from a GitHub-style `/user/emails` listing: the first
/// primary + verified entry, else the first verified one.
pub fn pick_email(entries: &Value) -> Option<String> {
    let entries = entries.as_array()?;
    let verified: Vec<&Value> = entries
        .iter()
        .filter(|e| e["verified"].as_bool().unwrap_or(false))
        .collect();
    verified
        .iter()
        .find(|e| e["primary"].as_bool().unwrap_or(false))
        .or_else(|| verified.first())
        .and_then(|e| e["email"].as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_google_profile_mapping() {
        let spec = ProviderSpec::google("cid".into(), "secret".into());
        let info = (spec.map_user_info)(&serde_json::json!({
            "id": "g-123",
            "email": "ada@x.io",
            "name": "Ada",
            "picture": "https://lh3.example/pic.png",
        }))
        .unwrap();
        assert_eq!(info.id, "g-123");
        assert_eq!(info.email, "ada@x.io");
        assert_eq!(info.avatar_url.as_deref(), Some("https://lh3.example/pic.png"));
    }

    #[test]
    fn test_github_numeric_id_and_login_fallback() {
        let spec = ProviderSpec::github("cid".into(), "secret".into());
        let info = (spec.map_user_info)(&serde_json::json!({
            "id": 4242,
            "login": "ada",
            "email": null,
            "avatar_url": "https://avatars.example/ada",
        }))
        .unwrap();
        assert_eq!(info.id, "4242");
        assert_eq!(info.name, "ada");
        assert!(info.email.is_empty());
    }

    #[test]
    fn test_pick_email_prefers_primary_verified() {
        let entries = serde_json::json!([
            { "email": "old@x.io", "verified": true, "primary": false },
            { "email": "ada@x.io", "verified": true, "primary": true },
            { "email": "spam@x.io", "verified": false, "primary": false },
        ]);
        assert_eq!(pick_email(&entries).as_deref(), Some("ada@x.io"));
    }

    #[test]
    fn test_pick_email_falls_back_to_first_verified() {
        let entries = serde_json::json!([
            { "email": "unverified@x.io", "verified": false, "primary": true },
            { "email": "ok@x.io", "verified": true, "primary": false },
        ]);
        assert_eq!(pick_email(&entries).as_deref(), Some("ok@x.io"));
    }

    #[test]
    fn test_pick_email_none_when_all_unverified() {
        let entries = serde_json::json!([
            { "email": "a@x.io", "verified": false, "primary": true },
        ]);
        assert_eq!(pick_email(&entries), None);
    }
}
