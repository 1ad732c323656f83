//! Static file service for the browser assets, including the
//! version-hash path rewrite, ETag handling and html preprocessing.

use crate::auth;
use crate::config::Config;
use crate::error::{GateError, GateResult};
use crate::limits::VERSION_HASH;
use crate::net::http::{self, HttpRequest};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::path::{Component, Path, PathBuf};

const ADMIN_PAGES: [&str; 3] = ["admin.html", "adminSettings.html", "adminAnalytics.html"];

/// Serve one `/loleaflet/...` request, returning the full response bytes.
pub fn handle_request(request: &HttpRequest, config: &Config) -> Vec<u8> {
    match serve(request, config) {
        Ok(response) => response,
        Err(e) => {
            log::error!("FileServer: {e}");
            match e {
                GateError::Unauthorized(_) => http::error_response(
                    401,
                    &[("WWW-Authenticate", "Basic realm=\"online\"".to_string())],
                ),
                GateError::Forbidden(_) => http::error_response(403, &[]),
                GateError::NotFound(_) => http::error_response(404, &[]),
                _ => http::error_response(400, &[]),
            }
        }
    }
}

fn serve(request: &HttpRequest, config: &Config) -> GateResult<Vec<u8>> {
    let segments = request.path_segments();
    let endpoint = percent_decode_str(segments.last().copied().unwrap_or(""))
        .decode_utf8_lossy()
        .to_string();

    if request.method != "GET" {
        return Err(GateError::BadRequest(format!(
            "Unsupported method [{}]",
            request.method
        )));
    }

    let mut no_cache = false;
    let mut set_cookie = None;
    if ADMIN_PAGES.contains(&endpoint.as_str()) {
        no_cache = true;
        set_cookie = auth::check_admin_login(request, config)?;
    }

    if endpoint == config.loleaflet_html {
        return preprocess_file(request, config);
    }

    let filepath = resolve_asset_path(request.path(), config)?;

    if endpoint.rfind('.').is_none() {
        return Err(GateError::NotFound("Invalid file".into()));
    }

    // An ETag match avoids re-sending the asset.
    if !no_cache {
        if let Some(tag) = request.header("If-None-Match") {
            if tag == format!("\"{VERSION_HASH}\"") {
                return Ok(not_modified_response());
            }
        }
    }

    let body = std::fs::read(&filepath)
        .map_err(|_| GateError::NotFound(format!("File [{}] not found", filepath.display())))?;

    let mut extra: Vec<(&str, String)> = Vec::new();
    if no_cache {
        if let Some(cookie) = set_cookie {
            extra.push(("Set-Cookie", cookie));
        }
    } else {
        extra.push(("Cache-Control", "max-age=11059200".to_string()));
        extra.push(("ETag", format!("\"{VERSION_HASH}\"")));
    }

    Ok(http::ok_response(mime_for(&endpoint), &body, &extra))
}

fn not_modified_response() -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 304 Not Modified\r\n\
         Date: {}\r\n\
         Expires: {}\r\n\
         User-Agent: docgate WOPI Agent\r\n\
         Cache-Control: max-age=11059200\r\n\
         \r\n",
        http::http_date(),
        http::http_date_plus_days(128),
    );
    head.into_bytes()
}

/// Map the request path onto the serving root, rewriting the version
/// hash back to the dist directory and refusing escapes from the root.
fn resolve_asset_path(request_path: &str, config: &Config) -> GateResult<PathBuf> {
    let decoded = percent_decode_str(request_path).decode_utf8_lossy().to_string();

    // /loleaflet/<hash>/x -> loleaflet/dist/x
    let rewritten = decoded.replace(
        &format!("/loleaflet/{VERSION_HASH}/"),
        "/loleaflet/dist/",
    );

    let normalized = normalize_lexically(&rewritten);
    if normalized
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(GateError::Forbidden(format!(
            "Invalid or forbidden file path: [{decoded}]"
        )));
    }

    let mut filepath = PathBuf::from(&config.file_server_root_path);
    for component in normalized.components() {
        if let Component::Normal(part) = component {
            filepath.push(part);
        }
    }

    Ok(filepath)
}

/// Resolve "." and ".." lexically; any ".." that would climb above the
/// start survives, which the caller treats as traversal.
fn normalize_lexically(path: &str) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.last(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out.into_iter().collect()
}

fn mime_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next().unwrap_or("") {
        "js" => "application/javascript",
        "css" => "text/css",
        "html" => "text/html",
        "svg" => "image/svg+xml",
        _ => "text/plain",
    }
}

// Only the single quote needs escaping: the token lands inside a
// javascript string literal in the served page.
const TOKEN_ESCAPE: &AsciiSet = &CONTROLS.add(b'\'');

/// Serve the main html with its placeholders substituted.
fn preprocess_file(request: &HttpRequest, config: &Config) -> GateResult<Vec<u8>> {
    let filepath = resolve_asset_path(request.path(), config)?;

    let mut page = std::fs::read_to_string(&filepath)
        .map_err(|_| GateError::NotFound(format!("File [{}] does not exist", filepath.display())))?;

    let params = request.query_params();
    let find = |name: &str| -> String {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };

    let access_token = find("access_token");
    let access_token_ttl = find("access_token_ttl");

    let escaped_token = utf8_percent_encode(&access_token, TOKEN_ESCAPE).to_string();
    let token_ttl: u64 = if access_token.is_empty() {
        0
    } else {
        access_token_ttl.parse().unwrap_or_else(|_| {
            log::error!("access_token_ttl must be milliseconds since the epoch");
            0
        })
    };

    let scheme = if config.is_ssl_visible() { "wss://" } else { "ws://" };
    let host = if config.server_name.is_empty() {
        request.host().unwrap_or("localhost").to_string()
    } else {
        config.server_name.clone()
    };

    page = page.replace("%ACCESS_TOKEN%", &escaped_token);
    page = page.replace("%ACCESS_TOKEN_TTL%", &token_ttl.to_string());
    page = page.replace("%HOST%", &format!("{scheme}{host}"));
    page = page.replace("%VERSION%", VERSION_HASH);
    page = page.replace(
        "%LOLEAFLET_LOGGING%",
        if config.loleaflet_logging { "true" } else { "false" },
    );

    Ok(http::ok_response(
        "text/html",
        page.as_bytes(),
        &[
            ("Cache-Control", "max-age=11059200".to_string()),
            ("ETag", format!("\"{VERSION_HASH}\"")),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::http::parse_request;

    fn setup() -> (tempfile::TempDir, Config) {
        let root = tempfile::tempdir().unwrap();
        let dist = root.path().join("loleaflet/dist");
        std::fs::create_dir_all(&dist).unwrap();

        std::fs::write(
            dist.join("loleaflet.html"),
            "<html>%ACCESS_TOKEN% %HOST% %VERSION% %LOLEAFLET_LOGGING%</html>",
        )
        .unwrap();
        std::fs::write(dist.join("bundle.js"), "var x = 1;").unwrap();

        let admin = dist.join("admin");
        std::fs::create_dir_all(&admin).unwrap();
        std::fs::write(admin.join("admin.html"), "<html>console</html>").unwrap();

        let mut config = Config::default();
        config.file_server_root_path = root.path().to_string_lossy().to_string();
        config.admin_console_username = "admin".to_string();
        config.admin_console_password = "secret".to_string();
        config.ssl_enable = false;
        config.ssl_termination = false;

        (root, config)
    }

    fn get(uri: &str, headers: &str) -> HttpRequest {
        let raw = format!("GET {uri} HTTP/1.1\r\nHost: test:9980\r\n{headers}\r\n");
        parse_request(raw.as_bytes()).unwrap().unwrap().0
    }

    #[test]
    fn preprocessed_html_substitutes_placeholders() {
        let (_root, config) = setup();
        let request = get(&format!("/loleaflet/{VERSION_HASH}/loleaflet.html"), "");

        let response = String::from_utf8(handle_request(&request, &config)).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains(&format!("ETag: \"{VERSION_HASH}\"")));
        // Empty access token substitutes to the empty string.
        assert!(response.contains("<html> ws://test:9980"));
        assert!(response.contains(&format!("{VERSION_HASH} false</html>")));
    }

    #[test]
    fn etag_match_returns_304_without_body() {
        let (_root, config) = setup();
        let request = get(
            &format!("/loleaflet/{VERSION_HASH}/bundle.js"),
            &format!("If-None-Match: \"{VERSION_HASH}\"\r\n"),
        );

        let response = String::from_utf8(handle_request(&request, &config)).unwrap();
        assert!(response.starts_with("HTTP/1.1 304"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn assets_are_served_with_mime_and_etag() {
        let (_root, config) = setup();
        let request = get(&format!("/loleaflet/{VERSION_HASH}/bundle.js"), "");

        let response = String::from_utf8(handle_request(&request, &config)).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Content-Type: application/javascript"));
        assert!(response.ends_with("var x = 1;"));
    }

    #[test]
    fn traversal_is_forbidden() {
        let (_root, config) = setup();
        let request = get("/loleaflet/dist/../../../../etc/passwd", "");

        let response = String::from_utf8(handle_request(&request, &config)).unwrap();
        assert!(response.starts_with("HTTP/1.1 403"));
    }

    #[test]
    fn missing_file_is_404() {
        let (_root, config) = setup();
        let request = get("/loleaflet/dist/absent.css", "");

        let response = String::from_utf8(handle_request(&request, &config)).unwrap();
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn admin_page_unauthenticated_gets_401_with_basic_challenge() {
        let (_root, config) = setup();
        let request = get("/loleaflet/dist/admin/admin.html", "");

        let response = String::from_utf8(handle_request(&request, &config)).unwrap();
        assert!(response.starts_with("HTTP/1.1 401"));
        assert!(response.contains("WWW-Authenticate: Basic realm=\"online\"\r\n"));
    }

    #[test]
    fn admin_page_with_basic_auth_serves_and_sets_cookie() {
        let (_root, config) = setup();
        // admin:secret
        let request = get(
            "/loleaflet/dist/admin/admin.html",
            "Authorization: Basic YWRtaW46c2VjcmV0\r\n",
        );

        let response = String::from_utf8(handle_request(&request, &config)).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Set-Cookie: jwt="));
        assert!(response.ends_with("<html>console</html>"));
    }
}
