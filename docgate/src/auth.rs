//! Admin authentication: a JWT-shaped HMAC cookie with an HTTP Basic
//! fallback against the configured console credentials.

use crate::config::Config;
use crate::error::{GateError, GateResult};
use crate::net::http::HttpRequest;

use base64::Engine;
use sha1::{Digest, Sha1};

const TOKEN_TTL_SECS: i64 = 3600;
const COOKIE_NAME: &str = "jwt";

fn b64url(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn hmac_sha1(key: &[u8], message: &[u8]) -> [u8; 20] {
    const BLOCK: usize = 64;

    let mut key_block = [0u8; BLOCK];
    if key.len() > BLOCK {
        let digest = Sha1::digest(key);
        key_block[..20].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha1::new();
    let ipad: Vec<u8> = key_block.iter().map(|b| b ^ 0x36).collect();
    inner.update(&ipad);
    inner.update(message);
    let inner_hash = inner.finalize();

    let mut outer = Sha1::new();
    let opad: Vec<u8> = key_block.iter().map(|b| b ^ 0x5c).collect();
    outer.update(&opad);
    outer.update(inner_hash);

    outer.finalize().into()
}

/// Issues and verifies the signed admin bearer token.
pub struct JwtAuth {
    secret: Vec<u8>,
}

impl JwtAuth {
    pub fn new(secret: &[u8]) -> JwtAuth {
        JwtAuth {
            secret: secret.to_vec(),
        }
    }

    /// The signing secret mixes the console password with the TLS key
    /// path so tokens do not survive credential changes.
    pub fn from_config(config: &Config) -> JwtAuth {
        let mut secret = config.admin_console_password.as_bytes().to_vec();
        secret.extend_from_slice(config.ssl_key_file_path.as_bytes());
        JwtAuth::new(&secret)
    }

    pub fn create_token(&self, subject: &str) -> String {
        let header = b64url(br#"{"alg":"HS1","typ":"JWT"}"#);
        let expiry = chrono::Utc::now().timestamp() + TOKEN_TTL_SECS;
        let claims = b64url(format!(r#"{{"sub":"{subject}","exp":{expiry}}}"#).as_bytes());

        let signed_part = format!("{header}.{claims}");
        let signature = b64url(&hmac_sha1(&self.secret, signed_part.as_bytes()));

        format!("{signed_part}.{signature}")
    }

    pub fn verify(&self, token: &str) -> bool {
        let mut parts = token.split('.');
        let (header, claims, signature) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(c), Some(s)) if parts.next().is_none() => (h, c, s),
            _ => return false,
        };

        let signed_part = format!("{header}.{claims}");
        let expected = b64url(&hmac_sha1(&self.secret, signed_part.as_bytes()));
        if !constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            return false;
        }

        // Check expiry from the claims.
        let decoded = match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(claims) {
            Ok(decoded) => decoded,
            Err(_) => return false,
        };
        let text = String::from_utf8_lossy(&decoded).to_string();

        match extract_exp(&text) {
            Some(expiry) => chrono::Utc::now().timestamp() < expiry,
            None => false,
        }
    }
}

fn extract_exp(claims: &str) -> Option<i64> {
    let idx = claims.find("\"exp\":")?;
    let digits: String = claims[idx + 6..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse().ok()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// The `Set-Cookie` value issued after a successful Basic login.
fn cookie_for(token: &str, config: &Config) -> String {
    let mut cookie = format!("{COOKIE_NAME}={token}; Path=/loleaflet/dist/");
    if config.is_ssl_visible() {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Gate an admin request.  Returns a Set-Cookie value when Basic auth
/// just succeeded, None when an existing cookie is valid, and
/// Unauthorized otherwise.
pub fn check_admin_login(request: &HttpRequest, config: &Config) -> GateResult<Option<String>> {
    let auth = JwtAuth::from_config(config);

    if let Some(token) = request.cookies().get(COOKIE_NAME) {
        if auth.verify(token) {
            log::trace!("Admin token is valid");
            return Ok(None);
        }
        log::info!("Invalid admin token, fall back to basic auth");
    }

    let user = &config.admin_console_username;
    let pass = &config.admin_console_password;
    if user.is_empty() || pass.is_empty() {
        log::error!("Admin Console credentials missing. Denying access until set.");
        return Err(GateError::Unauthorized("No admin credentials configured".into()));
    }

    if let Some((given_user, given_pass)) = request.basic_credentials() {
        if &given_user == user && &given_pass == pass {
            let token = auth.create_token(user);
            return Ok(Some(cookie_for(&token, config)));
        }
        log::info!("Wrong admin credentials.");
    }

    Err(GateError::Unauthorized("Invalid admin login".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::http::parse_request;

    fn admin_config() -> Config {
        let mut config = Config::default();
        config.admin_console_username = "admin".to_string();
        config.admin_console_password = "secret".to_string();
        config
    }

    #[test]
    fn token_roundtrip() {
        let auth = JwtAuth::new(b"k");
        let token = auth.create_token("admin");
        assert!(auth.verify(&token));
    }

    #[test]
    fn tampered_token_fails() {
        let auth = JwtAuth::new(b"k");
        let mut token = auth.create_token("admin");
        token.push('x');
        assert!(!auth.verify(&token));

        let other = JwtAuth::new(b"different");
        assert!(!other.verify(&auth.create_token("admin")));
    }

    #[test]
    fn expired_token_fails() {
        let auth = JwtAuth::new(b"k");
        let header = b64url(br#"{"alg":"HS1","typ":"JWT"}"#);
        let claims = b64url(br#"{"sub":"admin","exp":1}"#);
        let signed = format!("{header}.{claims}");
        let sig = b64url(&hmac_sha1(b"k", signed.as_bytes()));
        assert!(!auth.verify(&format!("{signed}.{sig}")));
    }

    #[test]
    fn no_credentials_no_cookie_is_unauthorized() {
        let raw = b"GET /loleaflet/dist/admin/admin.html HTTP/1.1\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap().unwrap();
        assert!(check_admin_login(&request, &admin_config()).is_err());
    }

    #[test]
    fn basic_login_issues_cookie() {
        // admin:secret
        let raw = b"GET /x HTTP/1.1\r\nAuthorization: Basic YWRtaW46c2VjcmV0\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap().unwrap();

        let cookie = check_admin_login(&request, &admin_config()).unwrap().unwrap();
        assert!(cookie.starts_with("jwt="));
        assert!(cookie.contains("Path=/loleaflet/dist/"));

        // The issued token must verify on the next request.
        let token = cookie
            .strip_prefix("jwt=")
            .unwrap()
            .split(';')
            .next()
            .unwrap();
        assert!(JwtAuth::from_config(&admin_config()).verify(token));
    }

    #[test]
    fn wrong_password_is_unauthorized() {
        // admin:wrong
        let raw = b"GET /x HTTP/1.1\r\nAuthorization: Basic YWRtaW46d3Jvbmc=\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap().unwrap();
        assert!(check_admin_login(&request, &admin_config()).is_err());
    }
}
