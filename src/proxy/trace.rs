//! Opt-in diagnostic dump of captured traffic. Gated on `trace && debug`;
//! never influences forwarding.

use bytes::Bytes;
use http::HeaderMap;

const MAX_CHARS: usize = 4096;
const HALF_MAX: usize = MAX_CHARS / 2;

/// Whether the trace dump should run at all for this configuration.
pub fn enabled(debug: bool, trace: bool) -> bool {
    debug && trace
}

/// Dump a request: headers, query parameters, cookies, a Basic-Auth token
/// if present, and a best-effort rendering of the body (pretty-printed
/// JSON, url-decoded form, or raw text under 1KiB).
pub fn dump_request(method: &str, path: &str, headers: &HeaderMap, body: &Bytes) {
    tracing::trace!(target: "proxy::trace", "==== REQUEST ====\n{method} {path}\n{}", format_headers(headers));

    if let Some((_, query)) = path.split_once('?') {
        tracing::trace!(target: "proxy::trace", "==== QUERY PARAMETERS ====\n{}", format_query(query));
    }

    if let Some(cookie) = headers.get("cookie").and_then(|v| v.to_str().ok()) {
        tracing::trace!(target: "proxy::trace", "==== COOKIES ====\n{}", format_query(&cookie.replace("; ", "&")));
    }

    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Basic ").or_else(|| auth.strip_prefix("basic ")) {
            tracing::trace!(target: "proxy::trace", "==== BASIC AUTH ====\n{token}");
        }
    }

    if let Some(rendered) = render_body(headers, body) {
        tracing::trace!(target: "proxy::trace", "==== REQUEST BODY ====\n{rendered}");
    }
}

/// Dump a response: headers (excluding reserved metadata headers, already
/// stripped by the caller), Set-Cookie, HTML `<title>` extraction, and a
/// truncated/hex-dumped body rendering.
pub fn dump_response(status: u16, headers: &HeaderMap, body: &Bytes) {
    tracing::trace!(target: "proxy::trace", "==== RESPONSE ====\n{status}\n{}", format_headers(headers));

    if let Some(cookies) = headers.get("set-cookie").and_then(|v| v.to_str().ok()) {
        tracing::trace!(target: "proxy::trace", "==== SET-COOKIE ====\n{cookies}");
    }

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("text/html") {
        if let Some(title) = extract_html_title(body) {
            tracing::trace!(target: "proxy::trace", "==== HTML TITLE ====\n{title}");
        }
    }

    if let Some(rendered) = render_body(headers, body) {
        tracing::trace!(target: "proxy::trace", "==== RESPONSE BODY ====\n{}", truncate_for_display(&rendered));
    } else if !body.is_empty() {
        tracing::trace!(target: "proxy::trace", "==== RESPONSE BODY (binary) ====\n{}", hex_dump_truncated(body));
    }
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or("<binary>"));
        out.push('\n');
    }
    out
}

fn format_query(query: &str) -> String {
    let mut out = String::new();
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        out.push_str(&format!("{:<20} {}\n", k, v));
    }
    out
}

fn render_body(headers: &HeaderMap, body: &Bytes) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("application/json") {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            if let Ok(pretty) = serde_json::to_string_pretty(&value) {
                return Some(clip_lines(&pretty, 50));
            }
        }
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        if let Ok(text) = std::str::from_utf8(body) {
            return Some(format_query(text));
        }
    } else if content_type.starts_with("text/") && body.len() < 1024 {
        if let Ok(text) = std::str::from_utf8(body) {
            return Some(text.to_string());
        }
    }
    None
}

fn clip_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < max_lines {
        text.to_string()
    } else {
        format!("{}\n({} lines)", lines[..max_lines].join("\n"), lines.len())
    }
}

fn truncate_for_display(text: &str) -> String {
    if text.len() > MAX_CHARS {
        let head: String = text.chars().take(HALF_MAX).collect();
        let tail: String = text
            .chars()
            .rev()
            .take(HALF_MAX)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("{head} <<< ... >>> {tail}")
    } else {
        text.to_string()
    }
}

fn hex_dump_truncated(body: &Bytes) -> String {
    let slice: &[u8] = if body.len() > MAX_CHARS {
        let head = &body[..HALF_MAX];
        let tail = &body[body.len() - HALF_MAX..];
        return format!(
            "{}\n\t................\n{}",
            hex_dump(head),
            hex_dump(tail)
        );
    } else {
        body
    };
    hex_dump(slice)
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for chunk in bytes.chunks(16) {
        for byte in chunk {
            out.push_str(&format!("{byte:02x} "));
        }
        out.push('\n');
    }
    out
}

fn extract_html_title(body: &Bytes) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let lower = text.to_ascii_lowercase();
    let start_tag = lower.find("<title")?;
    let after_open = lower[start_tag..].find('>')? + start_tag + 1;
    let end = lower[after_open..].find("</title>")? + after_open;
    Some(text[after_open..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_html_title() {
        let body = Bytes::from_static(b"<html><head><title> Example Page </title></head></html>");
        assert_eq!(extract_html_title(&body), Some("Example Page".to_string()));
    }

    #[test]
    fn missing_title_returns_none() {
        let body = Bytes::from_static(b"<html><head></head></html>");
        assert_eq!(extract_html_title(&body), None);
    }

    #[test]
    fn truncates_long_text_with_ellipsis_marker() {
        let long = "a".repeat(5000);
        let truncated = truncate_for_display(&long);
        assert!(truncated.contains("<<< ... >>>"));
    }

    #[test]
    fn enabled_requires_both_flags() {
        assert!(enabled(true, true));
        assert!(!enabled(true, false));
        assert!(!enabled(false, true));
    }
}
