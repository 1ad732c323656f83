//! The one-request-per-connection dispatcher: parses the first HTTP
//! request on an accepted socket and either answers it synchronously or
//! hands the socket off to the poll that owns its long-lived handler.

use crate::admin::AdminSocketHandler;
use crate::auth;
use crate::broker::{self, ConvertWaiter, DocumentBroker};
use crate::error::{GateError, GateResult};
use crate::filesrv;
use crate::gateway::{self, Gateway};
use crate::limits::{self, VERSION_HASH};
use crate::net::http::{self, HttpRequest};
use crate::net::poll::{HandlerOutcome, PollEntry, SocketHandler, SocketPoll};
use crate::net::server::SocketFactory;
use crate::net::socket::{SocketRef, StreamSocket};
use crate::net::ws::{self, WsProto};
use crate::session::ClientSession;

use percent_encoding::percent_decode_str;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct ClientRequestDispatcher {
    gateway: Arc<Gateway>,
    id: u32,
}

impl ClientRequestDispatcher {
    pub fn new(gateway: Arc<Gateway>) -> ClientRequestDispatcher {
        ClientRequestDispatcher { gateway, id: 0 }
    }

    fn send_and_close(&self, socket: &SocketRef, response: Vec<u8>) -> HandlerOutcome {
        let mut sock = socket.lock().unwrap();
        sock.send(&response);
        sock.shutdown();
        HandlerOutcome::Continue
    }

    fn route(
        &mut self,
        request: HttpRequest,
        socket: &SocketRef,
        _poll: &Arc<SocketPoll>,
    ) -> HandlerOutcome {
        log::info!(
            "#{}: Client HTTP request: {} {}",
            socket.lock().unwrap().fd(),
            request.method,
            request.uri
        );

        let segments: Vec<String> = request
            .path_segments()
            .iter()
            .map(|s| s.to_string())
            .collect();

        if segments.first().map(|s| s.as_str()) == Some("loleaflet") {
            let response = filesrv::handle_request(&request, &self.gateway.config);
            return self.send_and_close(socket, response);
        }

        if segments.len() >= 2 && segments[0] == "lool" && segments[1] == "adminws" {
            return self.handle_admin_upgrade(&request, socket);
        }

        if (request.method == "GET" || request.method == "HEAD") && request.path() == "/" {
            return self.handle_root(&request, socket);
        }

        if request.method == "GET" && request.path() == "/favicon.ico" {
            return self.handle_favicon(socket);
        }

        if request.method == "GET" && request.path() == "/hosting/discovery" {
            return self.handle_discovery(&request, socket);
        }

        if segments.first().map(|s| s.as_str()) == Some("lool") {
            if !request.is_websocket_upgrade() {
                return match self.handle_lool_request(&request, &segments, socket) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        log::error!("Request failed: {e}");
                        self.send_and_close(socket, http::error_response(e.http_status(), &[]))
                    }
                };
            }

            if segments.len() >= 3 && segments[2] == "ws" {
                return self.handle_client_ws_upgrade(&request, &segments[1], socket);
            }
        }

        log::error!("Unknown resource: {}", request.uri);
        self.send_and_close(socket, http::error_response(400, &[]))
    }

    fn handle_root(&self, request: &HttpRequest, socket: &SocketRef) -> HandlerOutcome {
        let body: &[u8] = if request.method == "GET" { b"OK" } else { b"" };
        self.send_and_close(socket, http::ok_response("text/plain", body, &[]))
    }

    fn handle_favicon(&self, socket: &SocketRef) -> HandlerOutcome {
        let path = Path::new(&self.gateway.config.file_server_root_path).join("favicon.ico");
        let response = match std::fs::read(&path) {
            Ok(body) => http::ok_response("image/vnd.microsoft.icon", &body, &[]),
            Err(_) => http::error_response(404, &[]),
        };
        self.send_and_close(socket, response)
    }

    /// Serve the WOPI discovery document with our own host injected into
    /// every action's urlsrc.
    fn handle_discovery(&self, request: &HttpRequest, socket: &SocketRef) -> HandlerOutcome {
        let config = &self.gateway.config;
        let path = Path::new(&config.file_server_root_path).join("discovery.xml");

        let xml = match std::fs::read_to_string(&path) {
            Ok(xml) => xml,
            Err(e) => {
                log::error!("Cannot read discovery document [{}]: {e}", path.display());
                return self.send_and_close(socket, http::error_response(404, &[]));
            }
        };

        let scheme = if config.is_ssl_visible() { "https://" } else { "http://" };
        let host = if config.server_name.is_empty() {
            request.host().unwrap_or("localhost").to_string()
        } else {
            config.server_name.clone()
        };
        let urlsrc = format!(
            "{scheme}{host}/loleaflet/{VERSION_HASH}/{}?",
            config.loleaflet_html
        );

        let pattern = regex::Regex::new(r#"urlsrc="[^"]*""#).unwrap();
        let injected = pattern
            .replace_all(&xml, format!("urlsrc=\"{urlsrc}\"").as_str())
            .to_string();

        log::info!("Sent discovery.xml successfully.");
        self.send_and_close(socket, http::ok_response("text/xml", injected.as_bytes(), &[]))
    }

    fn handle_admin_upgrade(&self, request: &HttpRequest, socket: &SocketRef) -> HandlerOutcome {
        log::info!("Admin request: {}", request.uri);

        if let Err(e) = auth::check_admin_login(request, &self.gateway.config) {
            log::error!("Admin upgrade refused: {e}");
            return self.send_and_close(
                socket,
                http::error_response(
                    401,
                    &[("WWW-Authenticate", "Basic realm=\"online\"".to_string())],
                ),
            );
        }

        let upgrade = match WsProto::upgrade_response(request) {
            Ok(upgrade) => upgrade,
            Err(e) => {
                log::error!("Bad admin upgrade: {e}");
                return self.send_and_close(socket, http::error_response(400, &[]));
            }
        };

        socket.lock().unwrap().send(&upgrade);

        HandlerOutcome::Migrate {
            target: self.gateway.admin.poll().clone(),
            handler: Box::new(AdminSocketHandler::new(self.gateway.admin.clone(), self.id)),
        }
    }

    /// Send the limit-reached error and a policy-violation close.
    fn shutdown_limit_reached(&self, socket: &SocketRef) -> HandlerOutcome {
        let payload = limits::limit_reached_payload(
            self.gateway.limits.max_documents,
            self.gateway.limits.max_connections,
        );
        log::info!("Sending client limit-reached message: {payload}");

        let mut sock = socket.lock().unwrap();
        WsProto::send_text(&mut sock, &payload);
        let mut proto = WsProto::new();
        proto.shutdown(&mut sock, ws::STATUS_POLICY_VIOLATION, &payload);
        HandlerOutcome::Continue
    }

    fn handle_client_ws_upgrade(
        &self,
        request: &HttpRequest,
        encoded_uri: &str,
        socket: &SocketRef,
    ) -> HandlerOutcome {
        let gateway = &self.gateway;
        log::info!("Client WS request: {}, url: {encoded_uri}", request.uri);

        let upgrade = match WsProto::upgrade_response(request) {
            Ok(upgrade) => upgrade,
            Err(e) => {
                log::error!("Bad websocket upgrade: {e}");
                return self.send_and_close(socket, http::error_response(400, &[]));
            }
        };
        socket.lock().unwrap().send(&upgrade);

        if gateway.connection_count() >= gateway.limits.max_connections {
            log::error!(
                "Limit on maximum number of connections of {} reached.",
                gateway.limits.max_connections
            );
            return self.shutdown_limit_reached(socket);
        }

        // The document broker search begins.
        send_indicator(socket, "statusindicator: find");

        let decoded = percent_decode_str(encoded_uri).decode_utf8_lossy().to_string();
        let read_only = decoded
            .split_once('?')
            .map(|(_, query)| {
                url::form_urlencoded::parse(query.as_bytes())
                    .any(|(k, v)| k == "permission" && v == "readonly")
            })
            .unwrap_or(false);

        let public_uri = broker::sanitize_uri(encoded_uri);
        let doc_key = broker::derive_doc_key(encoded_uri);
        log::info!(
            "Sanitized URI [{decoded}] to [{public_uri}] and mapped to docKey [{doc_key}] \
             for session [{}]",
            self.id
        );

        let doc_broker = {
            let mut brokers = gateway.doc_brokers.lock().unwrap();
            Gateway::cleanup_locked(&mut brokers);

            if gateway::is_termination_requested() {
                log::error!("Termination flag set. No loading new session [{}]", self.id);
                socket.lock().unwrap().shutdown();
                return HandlerOutcome::Continue;
            }

            send_indicator(socket, "statusindicator: connect");

            match brokers.get(&doc_key).cloned() {
                Some(existing) => {
                    log::debug!("Found DocumentBroker with docKey [{doc_key}]");
                    if existing.is_marked_to_destroy() {
                        log::warn!(
                            "Associating with DocumentBroker [{doc_key}] that is marked to be destroyed!"
                        );
                    }
                    existing
                }
                None => {
                    if brokers.len() + 1 > gateway.limits.max_documents {
                        log::error!("Maximum number of open documents reached.");
                        drop(brokers);
                        return self.shutdown_limit_reached(socket);
                    }

                    let created = DocumentBroker::new(
                        &doc_key,
                        &public_uri,
                        &gateway.config.child_root_path,
                        gateway.admin.clone(),
                        gateway.trace.clone(),
                    );
                    created.start_thread();
                    brokers.insert(doc_key.clone(), created.clone());
                    log::trace!("Have {} DocBrokers after inserting [{doc_key}]", brokers.len());
                    created
                }
            }
        };

        let session_id = gateway.next_session_id();
        gateway.num_connections.fetch_add(1, Ordering::SeqCst);

        doc_broker.queue_session(session_id, socket.clone(), read_only);

        if doc_broker.child_pid() <= 0 {
            let target = gateway.config.num_prespawn_children.max(1);
            match gateway.pool.acquire(target, &gateway.forkit) {
                Some(child) => {
                    let (pid, child_socket) = child.into_parts();
                    doc_broker.assign_child(pid, child_socket);
                }
                None => {
                    log::error!(
                        "Failed to get new child for docKey [{doc_key}]; closing session [{session_id}]"
                    );
                    gateway.num_connections.fetch_sub(1, Ordering::SeqCst);
                    doc_broker.remove_session(session_id);

                    {
                        let mut brokers = gateway.doc_brokers.lock().unwrap();
                        if doc_broker.session_count() == 0 {
                            doc_broker.terminate_child("");
                            brokers.remove(&doc_key);
                        }
                    }

                    let mut sock = socket.lock().unwrap();
                    let mut proto = WsProto::new();
                    proto.shutdown(&mut sock, ws::STATUS_GOING_AWAY, "");
                    return HandlerOutcome::Continue;
                }
            }
        }

        // The session has a document and a worker behind it now.
        send_indicator(socket, "statusindicator: ready");

        if let Some(ref trace) = gateway.trace {
            trace
                .lock()
                .unwrap()
                .new_session(&doc_key, &session_id.to_string(), &public_uri);
        }

        HandlerOutcome::Migrate {
            target: doc_broker.poll().clone(),
            handler: Box::new(ClientSession::new(
                session_id,
                doc_broker,
                gateway.clone(),
                read_only,
            )),
        }
    }

    /// Non-upgrade /lool/ requests: conversion, insertfile, download.
    fn handle_lool_request(
        &self,
        request: &HttpRequest,
        segments: &[String],
        socket: &SocketRef,
    ) -> GateResult<HandlerOutcome> {
        log::info!("Post request: [{}]", request.uri);

        if segments.len() >= 2 && segments[1] == "convert-to" && request.method == "POST" {
            return self.handle_convert_to(request, socket);
        }

        if segments.len() >= 3 && segments[2] == "insertfile" && request.method == "POST" {
            let response = self.handle_insertfile(request, segments)?;
            return Ok(self.send_and_close(socket, response));
        }

        if segments.len() >= 5 && request.method == "GET" {
            let response = self.handle_download(segments)?;
            return Ok(self.send_and_close(socket, response));
        }

        Err(GateError::BadRequest("Invalid or unknown request.".into()))
    }

    fn handle_convert_to(
        &self,
        request: &HttpRequest,
        socket: &SocketRef,
    ) -> GateResult<HandlerOutcome> {
        let gateway = &self.gateway;

        let content_type = request
            .header("Content-Type")
            .ok_or_else(|| GateError::BadRequest("Missing Content-Type".into()))?;
        let boundary = http::boundary_from_content_type(content_type)
            .ok_or_else(|| GateError::BadRequest("Not a multipart request".into()))?;
        let parts = http::parse_multipart(&request.body, &boundary)?;

        let format = parts
            .iter()
            .find(|p| p.name == "format")
            .map(|p| String::from_utf8_lossy(&p.data).trim().to_string())
            .filter(|f| !f.is_empty())
            .ok_or_else(|| GateError::BadRequest("Missing conversion format".into()))?;

        let file_part = parts
            .iter()
            .find(|p| p.filename.is_some())
            .ok_or_else(|| GateError::BadRequest("Missing file payload".into()))?;

        // A filename is a filename, never a path.
        let filename = Path::new(file_part.filename.as_deref().unwrap_or("document"))
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .ok_or_else(|| GateError::BadRequest("Bad upload filename".into()))?;

        let staging = tempfile::Builder::new()
            .prefix("docgate-convert-")
            .tempdir()
            .map_err(|e| GateError::Internal(format!("Cannot create staging dir: {e}")))?
            .into_path();
        let from_path = staging.join(&filename);
        std::fs::write(&from_path, &file_part.data)
            .map_err(|e| GateError::Internal(format!("Cannot stage upload: {e}")))?;

        let public_uri = from_path.to_string_lossy().to_string();
        let doc_key = broker::derive_doc_key(&public_uri);
        log::info!("Conversion request for URI [{public_uri}]");

        let doc_broker = {
            let mut brokers = gateway.doc_brokers.lock().unwrap();
            Gateway::cleanup_locked(&mut brokers);

            if brokers.len() + 1 > gateway.limits.max_documents {
                std::fs::remove_dir_all(&staging).ok();
                return Err(GateError::BadRequest("Too many open documents".into()));
            }

            let created = DocumentBroker::new(
                &doc_key,
                &public_uri,
                &gateway.config.child_root_path,
                gateway.admin.clone(),
                gateway.trace.clone(),
            );
            created.start_thread();
            brokers.insert(doc_key.clone(), created.clone());
            created
        };

        let target = gateway.config.num_prespawn_children.max(1);
        let child = match gateway.pool.acquire(target, &gateway.forkit) {
            Some(child) => child,
            None => {
                self.remove_conversion_broker(&doc_key, &doc_broker);
                std::fs::remove_dir_all(&staging).ok();
                return Err(GateError::BadRequest(
                    "Failed to convert and send file.".into(),
                ));
            }
        };

        let (pid, child_socket) = child.into_parts();
        doc_broker.assign_child(pid, child_socket);
        doc_broker.start_conversion(socket.clone(), &format, Some(staging));

        Ok(HandlerOutcome::Migrate {
            target: doc_broker.poll().clone(),
            handler: Box::new(ConvertWaiter),
        })
    }

    /// A conversion that failed before any traffic must not leave its
    /// broker behind in the map.
    fn remove_conversion_broker(&self, doc_key: &str, doc_broker: &Arc<DocumentBroker>) {
        let mut brokers = self.gateway.doc_brokers.lock().unwrap();
        doc_broker.terminate_child("");
        brokers.remove(doc_key);
    }

    fn handle_insertfile(
        &self,
        request: &HttpRequest,
        segments: &[String],
    ) -> GateResult<Vec<u8>> {
        log::info!("Insert file request.");

        let content_type = request
            .header("Content-Type")
            .ok_or_else(|| GateError::BadRequest("Missing Content-Type".into()))?;
        let boundary = http::boundary_from_content_type(content_type)
            .ok_or_else(|| GateError::BadRequest("Not a multipart request".into()))?;
        let parts = http::parse_multipart(&request.body, &boundary)?;

        let field = |name: &str| -> Option<String> {
            parts
                .iter()
                .find(|p| p.name == name && p.filename.is_none())
                .map(|p| String::from_utf8_lossy(&p.data).trim().to_string())
        };

        let child_id = field("childid")
            .ok_or_else(|| GateError::BadRequest("Missing childid".into()))?;
        let name =
            field("name").ok_or_else(|| GateError::BadRequest("Missing name".into()))?;
        let file_part = parts
            .iter()
            .find(|p| p.filename.is_some())
            .ok_or_else(|| GateError::BadRequest("Missing file payload".into()))?;

        // Validate the docKey and the claimed child id.
        let doc_key = broker::derive_doc_key(&broker::sanitize_uri(&segments[1]));
        {
            let brokers = self.gateway.doc_brokers.lock().unwrap();
            let doc_broker = brokers.get(&doc_key).ok_or_else(|| {
                GateError::BadRequest(format!("DocKey [{doc_key}] is invalid."))
            })?;
            if doc_broker.jail_id() != child_id {
                return Err(GateError::BadRequest(format!(
                    "DocKey [{doc_key}] or childid [{child_id}] is invalid."
                )));
            }
        }

        // Protect against attempts to inject paths here.
        if child_id.contains('/') || name.contains('/') {
            return Err(GateError::BadRequest("Invalid childid or name".into()));
        }

        log::info!("Perform insertfile: {child_id}, {name}");
        let dir = self.jail_doc_path(&child_id).join("insertfile");
        std::fs::create_dir_all(&dir)
            .map_err(|e| GateError::Internal(format!("Cannot create insertfile dir: {e}")))?;
        std::fs::write(dir.join(&name), &file_part.data)
            .map_err(|e| GateError::Internal(format!("Cannot store insertfile: {e}")))?;

        Ok(http::empty_response(200, &cors_headers()))
    }

    fn handle_download(&self, segments: &[String]) -> GateResult<Vec<u8>> {
        log::info!("File download request.");

        // /lool/<docKey>/<childId>/<randomDir>/<filename>
        let doc_key = broker::derive_doc_key(&broker::sanitize_uri(&segments[1]));
        let child_id = &segments[2];
        let random_dir = &segments[3];

        {
            let brokers = self.gateway.doc_brokers.lock().unwrap();
            let doc_broker = brokers.get(&doc_key).ok_or_else(|| {
                GateError::BadRequest(format!("DocKey [{doc_key}] is invalid."))
            })?;
            if &doc_broker.jail_id() != child_id {
                return Err(GateError::BadRequest(
                    "ChildId does not correspond to docKey".into(),
                ));
            }
            if random_dir == child_id {
                return Err(GateError::BadRequest(
                    "RandomDir cannot be equal to ChildId".into(),
                ));
            }
        }

        let filename = percent_decode_str(&segments[4]).decode_utf8_lossy().to_string();
        if filename.contains('/') || random_dir.contains('/') {
            return Err(GateError::BadRequest("Invalid download path".into()));
        }

        let dir = self.jail_doc_path(child_id).join(random_dir);
        let filepath = dir.join(&filename);
        log::info!("HTTP request for: {}", filepath.display());

        let body = std::fs::read(&filepath).map_err(|_| {
            GateError::NotFound(format!("Download file [{}] not found", filepath.display()))
        })?;

        let extension = filename.rsplit('.').next().unwrap_or("");
        let mut headers = cors_headers();
        let mime = broker::content_type_for_format(extension);
        if extension == "pdf" {
            headers.push((
                "Content-Disposition",
                format!("attachment; filename=\"{filename}\""),
            ));
        }

        let response = http::ok_response(mime, &body, &headers);

        // The staging directory is one-shot.
        std::fs::remove_dir_all(&dir).ok();

        Ok(response)
    }

    fn jail_doc_path(&self, child_id: &str) -> PathBuf {
        Path::new(&self.gateway.config.child_root_path)
            .join(child_id)
            .join(limits::JAILED_DOCUMENT_ROOT.trim_start_matches('/'))
    }
}

fn cors_headers() -> Vec<(&'static str, String)> {
    vec![
        ("Access-Control-Allow-Origin", "*".to_string()),
        ("Access-Control-Allow-Methods", "GET, POST, OPTIONS".to_string()),
        (
            "Access-Control-Allow-Headers",
            "Origin, X-Requested-With, Content-Type, Accept".to_string(),
        ),
    ]
}

fn send_indicator(socket: &SocketRef, message: &str) {
    log::trace!("Sending to Client [{message}]");
    let mut sock = socket.lock().unwrap();
    WsProto::send_text(&mut sock, message);
}

impl SocketHandler for ClientRequestDispatcher {
    fn on_connect(&mut self, _socket: &SocketRef, _poll: &Arc<SocketPoll>) {
        self.id = self.gateway.next_session_id();
    }

    fn handle_incoming(&mut self, socket: &SocketRef, poll: &Arc<SocketPoll>) -> HandlerOutcome {
        let parsed = {
            let sock = socket.lock().unwrap();
            http::parse_request(&sock.in_buffer)
        };

        match parsed {
            Ok(Some((request, used))) => {
                // One request per socket; the rest of the stream belongs
                // to whatever handler the socket ends up with.
                socket.lock().unwrap().consume_input(used);
                self.route(request, socket, poll)
            }
            Ok(None) => HandlerOutcome::Continue, // not enough data yet
            Err(e) => {
                log::error!("Malformed client request: {e}");
                self.send_and_close(socket, http::error_response(400, &[]))
            }
        }
    }
}

pub struct PlainSocketFactory {
    gateway: Arc<Gateway>,
}

impl PlainSocketFactory {
    pub fn new(gateway: Arc<Gateway>) -> PlainSocketFactory {
        PlainSocketFactory { gateway }
    }
}

impl SocketFactory for PlainSocketFactory {
    fn create(&self, fd: RawFd) -> Result<PollEntry, String> {
        Ok(PollEntry {
            socket: StreamSocket::plain(fd).wrap(),
            handler: Box::new(ClientRequestDispatcher::new(self.gateway.clone())),
        })
    }
}

pub struct SslSocketFactory {
    gateway: Arc<Gateway>,
    tls_config: Arc<rustls::ServerConfig>,
}

impl SslSocketFactory {
    pub fn new(gateway: Arc<Gateway>, tls_config: Arc<rustls::ServerConfig>) -> SslSocketFactory {
        SslSocketFactory { gateway, tls_config }
    }
}

impl SocketFactory for SslSocketFactory {
    fn create(&self, fd: RawFd) -> Result<PollEntry, String> {
        Ok(PollEntry {
            socket: StreamSocket::tls(fd, self.tls_config.clone())?.wrap(),
            handler: Box::new(ClientRequestDispatcher::new(self.gateway.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gateway::Limits;
    use crate::net::ws::{parse_frame, WsOpcode};

    fn socketpair_refs() -> (SocketRef, RawFd) {
        let mut fds = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (StreamSocket::plain(fds[0]).wrap(), fds[1])
    }

    fn dispatcher(limits: Limits) -> (ClientRequestDispatcher, Arc<Gateway>) {
        let gateway = Gateway::new(Config::default(), limits);
        (ClientRequestDispatcher::new(gateway.clone()), gateway)
    }

    fn feed(
        dispatcher: &mut ClientRequestDispatcher,
        socket: &SocketRef,
        bytes: &[u8],
    ) -> HandlerOutcome {
        socket.lock().unwrap().in_buffer.extend_from_slice(bytes);
        let poll = SocketPoll::new("dispatch_test_poll");
        dispatcher.handle_incoming(socket, &poll)
    }

    fn flush_output(socket: &SocketRef) {
        // Tests inspect queued output without a poll cycle, so flush
        // through the pair and read it back.
        socket.lock().unwrap().write_outgoing();
    }

    #[test]
    fn root_request_is_ok_and_closes() {
        let (mut dispatcher, _gateway) = dispatcher(Limits::default());
        let (socket, peer) = socketpair_refs();

        feed(&mut dispatcher, &socket, b"GET / HTTP/1.1\r\n\r\n");
        flush_output(&socket);

        let mut buf = [0u8; 1024];
        let count = unsafe { libc::read(peer, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        let text = String::from_utf8_lossy(&buf[..count as usize]).to_string();
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.ends_with("OK"));
        assert!(socket.lock().unwrap().is_shutdown_signalled() || socket.lock().unwrap().is_closed());
        unsafe { libc::close(peer) };
    }

    #[test]
    fn unknown_resource_is_400() {
        let (mut dispatcher, _gateway) = dispatcher(Limits::default());
        let (socket, peer) = socketpair_refs();

        feed(&mut dispatcher, &socket, b"GET /no/such/thing HTTP/1.1\r\n\r\n");
        flush_output(&socket);

        let mut buf = [0u8; 1024];
        let count = unsafe { libc::read(peer, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert!(String::from_utf8_lossy(&buf[..count as usize]).starts_with("HTTP/1.1 400"));
        unsafe { libc::close(peer) };
    }

    #[test]
    fn upgrade_over_connection_limit_gets_limitreached_close() {
        let (mut dispatcher, gateway) = dispatcher(Limits {
            max_documents: 10,
            max_connections: 0,
        });
        let (socket, peer) = socketpair_refs();

        let request = b"GET /lool/http%3A%2F%2Fx%2Fa.odt/ws HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";
        feed(&mut dispatcher, &socket, request);
        flush_output(&socket);

        let mut buf = vec![0u8; 4096];
        let count = unsafe { libc::read(peer, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        let raw = &buf[..count as usize];

        // 101 first.
        let header_end = http::find_subslice(raw, b"\r\n\r\n").unwrap() + 4;
        assert!(raw.starts_with(b"HTTP/1.1 101"));

        // Then the limit-reached text frame.
        let (frame, used) = parse_frame(&raw[header_end..]).unwrap().unwrap();
        assert_eq!(frame.opcode, WsOpcode::Text);
        let expected = limits::limit_reached_payload(10, 0);
        assert_eq!(frame.payload, expected.as_bytes());

        // Then a close frame carrying 1008 and the same payload.
        let (close, _) = parse_frame(&raw[header_end + used..]).unwrap().unwrap();
        assert_eq!(close.opcode, WsOpcode::Close);
        assert_eq!(
            u16::from_be_bytes([close.payload[0], close.payload[1]]),
            ws::STATUS_POLICY_VIOLATION
        );
        assert!(close.payload[2..].starts_with(b"error: cmd=internal kind=limitreached"));

        // No broker was created for the refused session.
        assert_eq!(gateway.broker_count(), 0);
        unsafe { libc::close(peer) };
    }

    #[test]
    fn document_limit_refuses_new_dockeys() {
        let (mut dispatcher, gateway) = dispatcher(Limits {
            max_documents: 0,
            max_connections: 10,
        });
        let (socket, peer) = socketpair_refs();

        let request = b"GET /lool/http%3A%2F%2Fx%2Fb.odt/ws HTTP/1.1\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";
        feed(&mut dispatcher, &socket, request);
        flush_output(&socket);

        let mut buf = vec![0u8; 4096];
        let count = unsafe { libc::read(peer, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        let raw = &buf[..count as usize];
        let text = String::from_utf8_lossy(raw).to_string();

        assert!(text.contains("kind=limitreached"));
        assert_eq!(gateway.broker_count(), 0);
        unsafe { libc::close(peer) };
    }

    #[test]
    fn convert_to_without_format_is_400_and_leaves_no_broker() {
        let (mut dispatcher, gateway) = dispatcher(Limits::default());
        let (socket, peer) = socketpair_refs();

        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"data\"; filename=\"hello.txt\"\r\n\r\n\
            Hi\r\n\
            --B--\r\n";
        let request = format!(
            "POST /lool/convert-to HTTP/1.1\r\n\
             Content-Type: multipart/form-data; boundary=B\r\n\
             Content-Length: {}\r\n\r\n",
            body.len()
        );
        let mut bytes = request.into_bytes();
        bytes.extend_from_slice(body);

        feed(&mut dispatcher, &socket, &bytes);
        flush_output(&socket);

        let mut buf = [0u8; 1024];
        let count = unsafe { libc::read(peer, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert!(String::from_utf8_lossy(&buf[..count as usize]).starts_with("HTTP/1.1 400"));
        assert_eq!(gateway.broker_count(), 0);
        unsafe { libc::close(peer) };
    }

    #[test]
    fn download_validates_child_and_random_dir() {
        let (dispatcher, gateway) = dispatcher(Limits::default());

        let doc_broker = DocumentBroker::new(
            "/a.odt",
            "http://x/a.odt",
            &gateway.config.child_root_path,
            gateway.admin.clone(),
            None,
        );
        let (worker_socket, _peer) = socketpair_refs();
        doc_broker.assign_child(std::process::id() as i32, worker_socket);
        gateway
            .doc_brokers
            .lock()
            .unwrap()
            .insert("/a.odt".to_string(), doc_broker.clone());

        let jail = doc_broker.jail_id();

        // Unknown docKey.
        let segments: Vec<String> = ["lool", "http%3A%2F%2Fx%2Fother.odt", &jail, "r", "f.pdf"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(dispatcher.handle_download(&segments).is_err());

        // Wrong child id.
        let segments: Vec<String> = ["lool", "http%3A%2F%2Fx%2Fa.odt", "999999", "r", "f.pdf"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(dispatcher.handle_download(&segments).is_err());

        // Random dir colliding with the jail id.
        let segments: Vec<String> = ["lool", "http%3A%2F%2Fx%2Fa.odt", &jail, &jail, "f.pdf"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(dispatcher.handle_download(&segments).is_err());
    }
}
