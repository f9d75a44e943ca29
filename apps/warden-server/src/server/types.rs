use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) error: &'static str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IssueAccessRequest {
    pub(crate) user_id: String,
    pub(crate) scopes: Vec<String>,
    #[serde(default)]
    pub(crate) email: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AccessTokenResponse {
    pub(crate) access_token: String,
    pub(crate) expires_in: i64,
    pub(crate) token_type: &'static str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IssueRefreshRequest {
    pub(crate) user_id: String,
    pub(crate) scopes: Vec<String>,
    #[serde(default)]
    pub(crate) email: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RefreshTokenResponse {
    pub(crate) refresh_token: String,
    pub(crate) expires_in: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenRequest {
    pub(crate) token: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct VerifyResponse {
    pub(crate) sub: String,
    pub(crate) scopes: Vec<String>,
    pub(crate) iat: i64,
    pub(crate) exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) email: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RevokeResponse {
    pub(crate) success: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueryRequest {
    pub(crate) query_name: String,
    #[serde(default)]
    pub(crate) params: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub(crate) struct QueryResponse {
    pub(crate) rows: Vec<Value>,
    pub(crate) row_count: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct QueryInfo {
    pub(crate) name: &'static str,
    pub(crate) read_only: bool,
    pub(crate) required_scopes: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub(crate) struct QueryCatalogResponse {
    pub(crate) available_queries: Vec<QueryInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SendMessageRequest {
    pub(crate) room_id: String,
    pub(crate) message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct SendMessageResponse {
    pub(crate) success: bool,
    pub(crate) recipients: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BroadcastRequest {
    pub(crate) message: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct BroadcastResponse {
    pub(crate) success: bool,
    pub(crate) recipients: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoomJoinRequest {
    pub(crate) room_id: String,
    pub(crate) user_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RoomMembershipResponse {
    pub(crate) success: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
    pub(crate) store: &'static str,
    pub(crate) database: &'static str,
    pub(crate) live_connections: usize,
    pub(crate) uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct AuditResponse {
    pub(crate) records: Vec<Value>,
}
