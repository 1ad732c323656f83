use crate::net::socket::SocketStatus;

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::OnceLock;

/// The next I/O direction the TLS library needs before it can make
/// progress.  While a want is pending the poll mask is forced to exactly
/// that direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TlsWants {
    Neither,
    Read,
    Write,
}

/// Server-side TLS session state layered over a non-blocking fd.
///
/// The handshake is driven at the start of the first read or write; once
/// complete it is never re-attempted on the same session.
pub struct TlsStream {
    conn: rustls::ServerConnection,
    wants: TlsWants,
    handshaking: bool,
    close_notify_queued: bool,
}

impl TlsStream {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Result<TlsStream, String> {
        let conn = rustls::ServerConnection::new(config)
            .map_err(|e| format!("Cannot create TLS session: {e}"))?;

        Ok(TlsStream {
            conn,
            wants: TlsWants::Neither,
            handshaking: true,
            close_notify_queued: false,
        })
    }

    pub fn wants(&self) -> TlsWants {
        self.wants
    }

    pub fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    pub fn signal_close_notify(&mut self) {
        if !self.close_notify_queued {
            self.close_notify_queued = true;
            self.conn.send_close_notify();
        }
    }

    /// Pull ciphertext off the wire, decrypt, and append plaintext to
    /// `in_buffer`.
    pub fn read_incoming(&mut self, fd: RawFd, in_buffer: &mut Vec<u8>) -> SocketStatus {
        let mut wire = FdIo(fd);

        loop {
            match self.conn.read_tls(&mut wire) {
                Ok(0) => {
                    // EOF under an open session is a dirty close.
                    log::debug!("Socket #{fd} TLS: unexpected EOF");
                    return SocketStatus::Disconnect;
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Nothing more on the wire.  A pending write want
                    // (half-flushed handshake record) keeps priority;
                    // otherwise only a mid-handshake session forces
                    // POLLIN.
                    if self.wants != TlsWants::Write {
                        self.wants = if self.handshaking {
                            TlsWants::Read
                        } else {
                            TlsWants::Neither
                        };
                    }
                    return SocketStatus::Ok;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Socket #{fd} TLS read failed: {e}");
                    return SocketStatus::Fatal;
                }
            }

            let state = match self.conn.process_new_packets() {
                Ok(state) => state,
                Err(e) => {
                    // Protocol error; best effort to flush our alert.
                    log::debug!("Socket #{fd} TLS error: {e}");
                    self.conn.write_tls(&mut wire).ok();
                    return SocketStatus::Fatal;
                }
            };

            if state.plaintext_bytes_to_read() > 0 {
                let mut chunk = vec![0u8; state.plaintext_bytes_to_read()];
                match self.conn.reader().read(&mut chunk) {
                    Ok(count) => in_buffer.extend_from_slice(&chunk[..count]),
                    Err(e) => {
                        log::debug!("Socket #{fd} TLS plaintext read failed: {e}");
                        return SocketStatus::Fatal;
                    }
                }
                self.wants = TlsWants::Neither;
            }

            if state.peer_has_closed() {
                // close_notify: clean shutdown.
                return SocketStatus::Disconnect;
            }

            // The handshake (or a re-key) may have queued records to send.
            match self.flush_tls(&mut wire) {
                SocketStatus::Ok => {}
                other => return other,
            }

            if self.handshaking && !self.conn.is_handshaking() {
                log::trace!("Socket #{fd} TLS handshake complete");
                self.handshaking = false;
                self.wants = TlsWants::Neither;
            }
        }
    }

    /// Encrypt pending plaintext from `out_buffer` and push ciphertext to
    /// the wire.
    pub fn write_outgoing(&mut self, fd: RawFd, out_buffer: &mut Vec<u8>) -> SocketStatus {
        let mut wire = FdIo(fd);

        if self.handshaking {
            // No application bytes before the handshake clears; just help
            // the handshake along.
            match self.flush_tls(&mut wire) {
                SocketStatus::Ok => {}
                other => return other,
            }
            if self.conn.is_handshaking() {
                if self.wants == TlsWants::Neither {
                    self.wants = TlsWants::Read;
                }
                return SocketStatus::Retry;
            }
            self.handshaking = false;
            self.wants = TlsWants::Neither;
        }

        while !out_buffer.is_empty() {
            let accepted = match self.conn.writer().write(out_buffer) {
                Ok(n) => n,
                Err(e) => {
                    log::debug!("Socket #{fd} TLS write failed: {e}");
                    return SocketStatus::Fatal;
                }
            };

            out_buffer.drain(..accepted);

            match self.flush_tls(&mut wire) {
                SocketStatus::Ok => {}
                other => return other,
            }

            if accepted == 0 {
                // Library buffer full and the wire will not take more.
                return SocketStatus::Retry;
            }
        }

        self.flush_tls(&mut wire)
    }

    fn flush_tls(&mut self, wire: &mut FdIo) -> SocketStatus {
        while self.conn.wants_write() {
            match self.conn.write_tls(wire) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wants = TlsWants::Write;
                    return SocketStatus::Ok;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("TLS flush failed: {e}");
                    return SocketStatus::Fatal;
                }
            }
        }

        if self.wants == TlsWants::Write {
            self.wants = TlsWants::Neither;
        }

        SocketStatus::Ok
    }
}

/// Raw-fd Read/Write adapter handing errno through as io::Error.
struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let rc = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

static TLS_CONFIG: OnceLock<Arc<rustls::ServerConfig>> = OnceLock::new();

/// Build the process-wide server TLS configuration from PEM files.
/// Called once at startup when ssl.enable is set.
pub fn initialize(cert_path: &str, key_path: &str) -> Result<(), String> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("Invalid TLS certificate/key: {e}"))?;

    TLS_CONFIG
        .set(Arc::new(config))
        .map_err(|_| "TLS already initialized".to_string())
}

pub fn server_config() -> Option<Arc<rustls::ServerConfig>> {
    TLS_CONFIG.get().cloned()
}

fn load_certs(path: &str) -> Result<Vec<rustls::Certificate>, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("Cannot open cert [{path}]: {e}"))?;
    let mut reader = io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| format!("Cannot parse certs [{path}]: {e}"))?;

    if certs.is_empty() {
        return Err(format!("No certificates found in [{path}]"));
    }

    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &str) -> Result<rustls::PrivateKey, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("Cannot open key [{path}]: {e}"))?;
    let mut reader = io::BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| format!("Cannot parse key [{path}]: {e}"))?
        {
            Some(rustls_pemfile::Item::RSAKey(key))
            | Some(rustls_pemfile::Item::PKCS8Key(key))
            | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(rustls::PrivateKey(key)),
            Some(_) => continue,
            None => return Err(format!("No private key found in [{path}]")),
        }
    }
}
