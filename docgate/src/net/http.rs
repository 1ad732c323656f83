use crate::error::{GateError, GateResult};

use base64::Engine;
use std::collections::HashMap;

/// Longest request head we are willing to buffer before giving up.
const MAX_REQUEST_HEAD: usize = 64 * 1024;

/// One fully-buffered HTTP request.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("Host")
    }

    /// URI path without the query string.
    pub fn path(&self) -> &str {
        match self.uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.uri,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }

    /// Non-empty, percent-encoded path segments.
    pub fn path_segments(&self) -> Vec<&str> {
        self.path().split('/').filter(|s| !s.is_empty()).collect()
    }

    pub fn query_params(&self) -> Vec<(String, String)> {
        match self.query() {
            Some(query) => url::form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn cookies(&self) -> HashMap<String, String> {
        let mut cookies = HashMap::new();
        if let Some(raw) = self.header("Cookie") {
            for pair in raw.split(';') {
                if let Some((k, v)) = pair.trim().split_once('=') {
                    cookies.insert(k.to_string(), v.to_string());
                }
            }
        }
        cookies
    }

    /// Decode `Authorization: Basic` credentials, if present and sane.
    pub fn basic_credentials(&self) -> Option<(String, String)> {
        let auth = self.header("Authorization")?;
        let encoded = auth.strip_prefix("Basic ").or_else(|| auth.strip_prefix("basic "))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (user, pass) = text.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }
}

/// Parse one request from the front of `buf`.
///
/// Returns None until the head (and, given a Content-Length, the body) is
/// complete; the same byte stream re-entered in any chunking yields the
/// same result.  On success also returns the total bytes consumed.
pub fn parse_request(buf: &[u8]) -> GateResult<Option<(HttpRequest, usize)>> {
    let head_end = match find_subslice(buf, b"\r\n\r\n") {
        Some(pos) => pos + 4,
        None => {
            if buf.len() > MAX_REQUEST_HEAD {
                return Err(GateError::BadRequest("Request head too large".into()));
            }
            return Ok(None);
        }
    };

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers);

    match parsed.parse(&buf[..head_end]) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(GateError::BadRequest(format!("Malformed request: {e}"))),
    }

    let method = parsed.method.unwrap_or("").to_string();
    let uri = parsed.path.unwrap_or("").to_string();
    let header_vec: Vec<(String, String)> = parsed
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();

    let request = HttpRequest {
        method,
        uri,
        headers: header_vec,
        body: Vec::new(),
    };

    let content_length = request.content_length().unwrap_or(0);
    let total = head_end + content_length;
    if buf.len() < total {
        return Ok(None);
    }

    let request = HttpRequest {
        body: buf[head_end..total].to_vec(),
        ..request
    };

    Ok(Some((request, total)))
}

pub fn http_date() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn http_date_plus_days(days: i64) -> String {
    (chrono::Utc::now() + chrono::Duration::days(days))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

const AGENT: &str = "docgate WOPI Agent";

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

/// Body-carrying 200 with the standard header block.
pub fn ok_response(mime: &str, body: &[u8], extra_headers: &[(&str, String)]) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 200 OK\r\n\
         Date: {}\r\n\
         Last-Modified: {}\r\n\
         User-Agent: {AGENT}\r\n\
         Content-Length: {}\r\n\
         Content-Type: {}\r\n",
        http_date(),
        http_date(),
        body.len(),
        mime
    );

    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

/// Body-less status response.
pub fn error_response(status: u16, extra_headers: &[(&str, String)]) -> Vec<u8> {
    empty_response(status, extra_headers)
}

pub fn empty_response(status: u16, extra_headers: &[(&str, String)]) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 {status} {}\r\n\
         Date: {}\r\n\
         User-Agent: {AGENT}\r\n\
         Content-Length: 0\r\n",
        reason_phrase(status),
        http_date()
    );

    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    head.into_bytes()
}

pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// One part of a `multipart/form-data` body.
#[derive(Debug)]
pub struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    for param in content_type.split(';') {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

/// Minimal multipart/form-data parser: split on the dashed boundary, pull
/// the Content-Disposition name/filename out of each part's headers.
pub fn parse_multipart(body: &[u8], boundary: &str) -> GateResult<Vec<FormPart>> {
    let delimiter = format!("--{boundary}");
    let delim = delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut rest = body;

    // Skip the preamble up to the first delimiter.
    match find_subslice(rest, delim) {
        Some(pos) => rest = &rest[pos + delim.len()..],
        None => return Err(GateError::BadRequest("Multipart boundary not found".into())),
    }

    loop {
        if rest.starts_with(b"--") {
            break; // closing delimiter
        }
        rest = rest.strip_prefix(b"\r\n").unwrap_or(rest);

        let head_end = find_subslice(rest, b"\r\n\r\n")
            .ok_or_else(|| GateError::BadRequest("Multipart part without headers".into()))?;
        let head = String::from_utf8_lossy(&rest[..head_end]).to_string();
        rest = &rest[head_end + 4..];

        let data_end = find_subslice(rest, delim)
            .ok_or_else(|| GateError::BadRequest("Unterminated multipart part".into()))?;

        // The part data ends right before "\r\n--boundary".
        let mut data = &rest[..data_end];
        data = data.strip_suffix(b"\r\n").unwrap_or(data);

        let mut name = String::new();
        let mut filename = None;
        for line in head.lines() {
            if let Some(value) = strip_header(line, "Content-Disposition") {
                let (n, f) = parse_disposition(value);
                name = n;
                filename = f;
            }
        }

        parts.push(FormPart {
            name,
            filename,
            data: data.to_vec(),
        });

        rest = &rest[data_end + delim.len()..];
    }

    Ok(parts)
}

fn strip_header<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    if key.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}

/// `form-data; name="data"; filename="hello.txt"` -> (name, filename).
fn parse_disposition(value: &str) -> (String, Option<String>) {
    let mut name = String::new();
    let mut filename = None;

    for param in value.split(';') {
        let param = param.trim();
        if let Some(v) = param.strip_prefix("name=") {
            name = v.trim_matches('"').to_string();
        } else if let Some(v) = param.strip_prefix("filename=") {
            filename = Some(v.trim_matches('"').to_string());
        }
    }

    (name, filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPGRADE: &[u8] = b"GET /lool/http%3A%2F%2Fx%2Fa.odt/ws HTTP/1.1\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn parse_waits_for_complete_head() {
        for split in 1..UPGRADE.len() - 1 {
            assert!(
                parse_request(&UPGRADE[..split]).unwrap().is_none(),
                "split at {split}"
            );
        }

        let (request, used) = parse_request(UPGRADE).unwrap().unwrap();
        assert_eq!(used, UPGRADE.len());
        assert_eq!(request.method, "GET");
        assert_eq!(request.path(), "/lool/http%3A%2F%2Fx%2Fa.odt/ws");
        assert!(request.is_websocket_upgrade());
        assert_eq!(
            request.header("sec-websocket-key"),
            Some("dGhlIHNhbXBsZSBub25jZQ==")
        );
    }

    #[test]
    fn parse_is_idempotent_over_chunking() {
        // Same stream, any chunking, identical outcome.
        let full = parse_request(UPGRADE).unwrap().unwrap().0;

        let mut buf = Vec::new();
        let mut result = None;
        for chunk in UPGRADE.chunks(7) {
            buf.extend_from_slice(chunk);
            if let Some(parsed) = parse_request(&buf).unwrap() {
                result = Some(parsed);
                break;
            }
        }

        let (chunked, _) = result.expect("request parsed");
        assert_eq!(chunked.method, full.method);
        assert_eq!(chunked.uri, full.uri);
        assert_eq!(chunked.headers().len(), full.headers().len());
    }

    #[test]
    fn body_waits_for_content_length() {
        let head = b"POST /lool/convert-to HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        let mut buf = head.to_vec();
        assert!(parse_request(&buf).unwrap().is_none());

        buf.extend_from_slice(b"ab");
        assert!(parse_request(&buf).unwrap().is_none());

        buf.extend_from_slice(b"cde");
        let (request, used) = parse_request(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(request.body, b"abcde");
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        assert!(parse_request(b"NOT AN HTTP LINE\x01\r\n\r\n").is_err());
    }

    #[test]
    fn query_and_cookies() {
        let raw = b"GET /?pid=1234&version=5.3 HTTP/1.1\r\nCookie: jwt=abc.def.ghi; other=1\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap().unwrap();

        let params = request.query_params();
        assert!(params.contains(&("pid".to_string(), "1234".to_string())));
        assert_eq!(request.cookies().get("jwt").unwrap(), "abc.def.ghi");
    }

    #[test]
    fn basic_credentials_decode() {
        // admin:secret
        let raw = b"GET /x HTTP/1.1\r\nAuthorization: Basic YWRtaW46c2VjcmV0\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap().unwrap();
        assert_eq!(
            request.basic_credentials(),
            Some(("admin".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn multipart_extracts_file_and_fields() {
        let body = b"--XbOuNdArY\r\n\
            Content-Disposition: form-data; name=\"data\"; filename=\"hello.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            Hi\r\n\
            --XbOuNdArY\r\n\
            Content-Disposition: form-data; name=\"format\"\r\n\r\n\
            pdf\r\n\
            --XbOuNdArY--\r\n";

        let parts = parse_multipart(body, "XbOuNdArY").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "data");
        assert_eq!(parts[0].filename.as_deref(), Some("hello.txt"));
        assert_eq!(parts[0].data, b"Hi");
        assert_eq!(parts[1].name, "format");
        assert_eq!(parts[1].data, b"pdf");
    }

    #[test]
    fn boundary_parsing() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=XYZ"),
            Some("XYZ".to_string())
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=\"quoted\""),
            Some("quoted".to_string())
        );
        assert_eq!(boundary_from_content_type("text/plain"), None);
    }
}
