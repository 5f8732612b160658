use serde::{Deserialize, Serialize};

// Subscription tier of an account. Doubles as the selection weight: over many
// requests a Max20 account receives ~20x the traffic of a Pro account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    Pro,
    Max5,
    Max20,
}

impl Tier {
    pub fn weight(self) -> u64 {
        match self {
            Tier::Pro => 1,
            Tier::Max5 => 5,
            Tier::Max20 => 20,
        }
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Tier::Pro),
            5 => Ok(Tier::Max5),
            20 => Ok(Tier::Max20),
            other => Err(format!("invalid tier {}, expected 1, 5 or 20", other)),
        }
    }
}

impl From<Tier> for u8 {
    fn from(value: Tier) -> Self {
        value.weight() as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Oauth,
    ApiKey,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Oauth => "oauth",
            AuthType::ApiKey => "api_key",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "oauth" => Ok(AuthType::Oauth),
            "api_key" => Ok(AuthType::ApiKey),
            other => Err(format!("unknown auth_type: {}", other)),
        }
    }
}

// Operator-supplied override of the upstream's advertised limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitOverride {
    pub limit: u32,
    pub window_minutes: u32,
}

// One authenticated principal against the upstream. Exactly one of
// access_token/api_key is populated depending on auth_type; expires_at is
// set iff the account is oauth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub tier: Tier,
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_remaining: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_override: Option<RateLimitOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_start: Option<i64>,
    #[serde(default)]
    pub session_request_count: i64,
    #[serde(default)]
    pub request_count: i64,
    #[serde(default)]
    pub total_requests: i64,
    pub created_at: i64,
}

impl Account {
    pub fn new_oauth(name: String, tier: Tier, refresh_token: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            provider: "anthropic".to_string(),
            tier,
            auth_type: AuthType::Oauth,
            refresh_token: Some(refresh_token),
            access_token: None,
            expires_at: Some(0),
            api_key: None,
            base_url: None,
            paused: false,
            rate_limit_status: None,
            rate_limit_reset_at: None,
            rate_limit_remaining: None,
            rate_limit_override: None,
            session_start: None,
            session_request_count: 0,
            request_count: 0,
            total_requests: 0,
            created_at: now,
        }
    }

    pub fn new_api_key(name: String, tier: Tier, api_key: String, base_url: Option<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            provider: "anthropic".to_string(),
            tier,
            auth_type: AuthType::ApiKey,
            refresh_token: None,
            access_token: None,
            expires_at: None,
            api_key: Some(api_key),
            base_url,
            paused: false,
            rate_limit_status: None,
            rate_limit_reset_at: None,
            rate_limit_remaining: None,
            rate_limit_override: None,
            session_start: None,
            session_request_count: 0,
            request_count: 0,
            total_requests: 0,
            created_at: now,
        }
    }

    // An oauth account without any credential material cannot serve traffic.
    pub fn has_usable_credentials(&self) -> bool {
        match self.auth_type {
            AuthType::ApiKey => self.api_key.as_deref().is_some_and(|k| !k.is_empty()),
            AuthType::Oauth => {
                self.access_token.as_deref().is_some_and(|t| !t.is_empty())
                    || self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
            }
        }
    }

    pub fn is_rate_limited(&self, now: i64) -> bool {
        self.rate_limit_reset_at.is_some_and(|reset| reset > now)
    }
}

// What the admin API exposes. Credentials never leave the process.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub tier: u8,
    pub auth_type: AuthType,
    pub has_base_url: bool,
    pub paused: bool,
    pub rate_limit_status: Option<String>,
    pub rate_limit_reset_at: Option<i64>,
    pub rate_limit_remaining: Option<i64>,
    pub rate_limit_override: Option<RateLimitOverride>,
    pub session_request_count: i64,
    pub request_count: i64,
    pub total_requests: i64,
    pub created_at: i64,
}

impl From<&Account> for AccountSummary {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            name: account.name.clone(),
            provider: account.provider.clone(),
            tier: account.tier.weight() as u8,
            auth_type: account.auth_type,
            has_base_url: account.base_url.is_some(),
            paused: account.paused,
            rate_limit_status: account.rate_limit_status.clone(),
            rate_limit_reset_at: account.rate_limit_reset_at,
            rate_limit_remaining: account.rate_limit_remaining,
            rate_limit_override: account.rate_limit_override.clone(),
            session_request_count: account.session_request_count,
            request_count: account.request_count,
            total_requests: account.total_requests,
            created_at: account.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_round_trip() {
        for raw in [1u8, 5, 20] {
            let tier = Tier::try_from(raw).unwrap();
            assert_eq!(u8::from(tier), raw);
        }
        assert!(Tier::try_from(3).is_err());
    }

    #[test]
    fn test_oauth_account_without_tokens_is_unusable() {
        let mut account = Account::new_oauth("a".into(), Tier::Pro, "rt".into());
        assert!(account.has_usable_credentials());
        account.refresh_token = None;
        assert!(!account.has_usable_credentials());
        account.access_token = Some("at".into());
        assert!(account.has_usable_credentials());
    }

    #[test]
    fn test_summary_redacts_credentials() {
        let account = Account::new_api_key(
            "b".into(),
            Tier::Max20,
            "sk-secret".into(),
            Some("https://gateway.internal".into()),
        );
        let summary = AccountSummary::from(&account);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(!json.contains("gateway.internal"));
        assert!(json.contains("\"has_base_url\":true"));
    }
}
