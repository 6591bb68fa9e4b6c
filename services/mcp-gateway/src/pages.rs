//! Operator-facing HTML

use clickup_auth::TokenSet;

/// Status page served on `GET /`.
pub fn home(token_configured: bool, credentials_configured: bool, epoch: Option<u64>) -> String {
    let status = if token_configured {
        let epoch = epoch.map(|e| format!(" (token epoch {e})")).unwrap_or_default();
        format!("<p class=\"ok\">OAuth tokens configured{epoch}. The gateway is ready.</p>")
    } else {
        "<p class=\"warn\">No OAuth tokens stored yet. Requests will be answered with 503.</p>"
            .to_string()
    };

    let action = if credentials_configured {
        "<p><a href=\"/oauth/start\">Authorize with ClickUp</a></p>"
    } else {
        "<p>Set <code>CLICKUP_CLIENT_ID</code> and <code>CLICKUP_CLIENT_SECRET</code> to enable authorization.</p>"
    };

    layout(
        "ClickUp MCP Gateway",
        &format!(
            "{status}{action}\
             <h2>Usage</h2>\
             <p>Send MCP requests to any path on this host with an <code>X-API-Key</code> header.</p>"
        ),
    )
}

/// Shown after a successful code exchange.
pub fn callback_success(tokens: &TokenSet) -> String {
    let refresh = tokens
        .refresh_token
        .as_deref()
        .map(|t| format!("<h3>Refresh token</h3><pre>{}</pre>", escape(t)))
        .unwrap_or_else(|| "<p>The provider did not issue a refresh token.</p>".to_string());

    layout(
        "Authorization complete",
        &format!(
            "<p class=\"ok\">Tokens stored. The gateway will use them from now on.</p>\
             <h3>Access token</h3><pre>{}</pre>{refresh}\
             <p><a href=\"/\">Back</a></p>",
            escape(&tokens.access_token)
        ),
    )
}

fn layout(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title>\
         <style>body{{font-family:sans-serif;max-width:48rem;margin:2rem auto}}\
         pre{{background:#f4f4f4;padding:.5rem;overflow-x:auto}}\
         .ok{{color:#1a7f37}}.warn{{color:#9a6700}}</style></head>\
         <body><h1>{title}</h1>{body}</body></html>"
    )
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
