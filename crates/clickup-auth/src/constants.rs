//! ClickUp OAuth and MCP endpoints
//!
//! Defaults for the provider-fixed URLs. Deployments can override each one
//! in the gateway config (useful for staging tenants and for tests).

/// Authorization page the operator's browser is redirected to.
pub const AUTHORIZE_ENDPOINT: &str = "https://app.clickup.com/api";

/// Token endpoint for both code exchange and refresh. Takes a JSON body.
pub const TOKEN_ENDPOINT: &str = "https://api.clickup.com/api/v2/oauth/token";

/// Hosted MCP endpoint that every proxied request is forwarded to.
pub const MCP_ENDPOINT: &str = "https://mcp.clickup.com/mcp";

/// Only S256 is accepted for PKCE challenges.
pub const CODE_CHALLENGE_METHOD: &str = "S256";

/// Random bytes behind each PKCE verifier (43 base64url chars once encoded).
pub const PKCE_VERIFIER_BYTES: usize = 32;
