#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: String,
    /// SurrealDB endpoint, e.g. `surrealkv://.dispatch/db` (or `mem://` in tests).
    pub db_url: String,
    pub ns: String,
    pub db: String,
    /// Shared secret identifying the cloud fleet.
    pub service_role_secret: String,
    /// HMAC secret for JWT role-claim verification. When unset, the JWT path
    /// is skipped and bearer tokens fall through to the access-token table.
    pub jwt_secret: Option<String>,
}
