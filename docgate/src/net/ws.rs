use crate::error::{GateError, GateResult};
use crate::limits::WS_MAX_MESSAGE_SIZE;
use crate::net::http::HttpRequest;
use crate::net::socket::StreamSocket;

use base64::Engine;
use sha1::{Digest, Sha1};
use std::time::{Duration, Instant};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const STATUS_NORMAL: u16 = 1000;
pub const STATUS_GOING_AWAY: u16 = 1001;
pub const STATUS_PROTOCOL_ERROR: u16 = 1002;
pub const STATUS_POLICY_VIOLATION: u16 = 1008;
pub const STATUS_TOO_BIG: u16 = 1009;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WsOpcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl WsOpcode {
    fn from_u8(value: u8) -> Option<WsOpcode> {
        match value {
            0x0 => Some(WsOpcode::Continuation),
            0x1 => Some(WsOpcode::Text),
            0x2 => Some(WsOpcode::Binary),
            0x8 => Some(WsOpcode::Close),
            0x9 => Some(WsOpcode::Ping),
            0xA => Some(WsOpcode::Pong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WsState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One parsed frame.
#[derive(Debug)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: WsOpcode,
    pub payload: Vec<u8>,
}

/// Parse one frame from the front of `buf`.  Returns the frame and the
/// bytes consumed, or None when the buffer does not yet hold a complete
/// frame.  Masked payloads are unmasked in place of the copy.
pub fn parse_frame(buf: &[u8]) -> GateResult<Option<(WsFrame, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];
    let fin = b0 & 0x80 != 0;
    let opcode = WsOpcode::from_u8(b0 & 0x0F)
        .ok_or_else(|| GateError::WebSocket(format!("Reserved opcode {:#x}", b0 & 0x0F)))?;
    let masked = b1 & 0x80 != 0;

    let mut idx = 2usize;
    let mut len = (b1 & 0x7F) as usize;
    if len == 126 {
        if buf.len() < idx + 2 {
            return Ok(None);
        }
        len = ((buf[idx] as usize) << 8) | buf[idx + 1] as usize;
        idx += 2;
    } else if len == 127 {
        if buf.len() < idx + 8 {
            return Ok(None);
        }
        let mut wide: u64 = 0;
        for byte in &buf[idx..idx + 8] {
            wide = (wide << 8) | *byte as u64;
        }
        if wide > WS_MAX_MESSAGE_SIZE as u64 {
            return Err(GateError::WebSocket(format!("Frame of {wide} bytes refused")));
        }
        len = wide as usize;
        idx += 8;
    }

    let mask_len = if masked { 4 } else { 0 };
    if buf.len() < idx + mask_len + len {
        return Ok(None);
    }

    let payload = if masked {
        let key = [buf[idx], buf[idx + 1], buf[idx + 2], buf[idx + 3]];
        idx += 4;
        buf[idx..idx + len]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4])
            .collect()
    } else {
        buf[idx..idx + len].to_vec()
    };

    Ok(Some((WsFrame { fin, opcode, payload }, idx + len)))
}

/// Encode one server-to-client (unmasked) frame.
pub fn encode_frame(opcode: WsOpcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode as u8);

    if payload.len() < 126 {
        out.push(payload.len() as u8);
    } else if payload.len() <= 0xFFFF {
        out.push(126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    out.extend_from_slice(payload);
    out
}

pub fn compute_accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(sha.finalize())
}

/// Websocket protocol state layered over a stream socket by each
/// websocket-speaking handler.
pub struct WsProto {
    state: WsState,
    frag_opcode: Option<WsOpcode>,
    accum: Vec<u8>,
    close_sent: bool,
    pub last_activity: Instant,
}

impl Default for WsProto {
    fn default() -> Self {
        Self::new()
    }
}

impl WsProto {
    pub fn new() -> WsProto {
        WsProto {
            state: WsState::Connecting,
            frag_opcode: None,
            accum: Vec::new(),
            close_sent: false,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> WsState {
        self.state
    }

    /// Build the 101 response for an upgrade request.
    pub fn upgrade_response(request: &HttpRequest) -> GateResult<Vec<u8>> {
        let upgrade = request
            .header("Upgrade")
            .ok_or_else(|| GateError::BadRequest("Not a websocket upgrade".into()))?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(GateError::BadRequest(format!("Unknown upgrade [{upgrade}]")));
        }

        if let Some(version) = request.header("Sec-WebSocket-Version") {
            if version != "13" {
                return Err(GateError::BadRequest(format!(
                    "Unsupported websocket version [{version}]"
                )));
            }
        }

        let key = request
            .header("Sec-WebSocket-Key")
            .ok_or_else(|| GateError::BadRequest("Missing Sec-WebSocket-Key".into()))?;

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             \r\n",
            compute_accept_key(key)
        );

        Ok(response.into_bytes())
    }

    /// Append one frame to the socket's output buffer.  Runs on the
    /// owning poll thread; other threads queue through `poll.defer`.
    pub fn send_frame(socket: &mut StreamSocket, opcode: WsOpcode, payload: &[u8]) {
        socket.send(&encode_frame(opcode, payload));
    }

    pub fn send_text(socket: &mut StreamSocket, text: &str) {
        Self::send_frame(socket, WsOpcode::Text, text.as_bytes());
    }

    /// Send a close frame and arrange for the socket to close once the
    /// output buffer drains.
    pub fn shutdown(&mut self, socket: &mut StreamSocket, code: u16, reason: &str) {
        if !self.close_sent {
            self.close_sent = true;
            let mut payload = code.to_be_bytes().to_vec();
            payload.extend_from_slice(reason.as_bytes());
            Self::send_frame(socket, WsOpcode::Close, &payload);
        }

        self.state = WsState::Closing;
        socket.shutdown();
    }

    /// Enforce the idle timeout.  Returns true when the session was shut
    /// down for idleness.
    pub fn check_idle(&mut self, socket: &mut StreamSocket, now: Instant, limit: Duration) -> bool {
        if matches!(self.state, WsState::Connecting | WsState::Open)
            && now.duration_since(self.last_activity) >= limit
        {
            log::debug!("Socket #{} websocket idle, closing", socket.fd());
            self.shutdown(socket, STATUS_GOING_AWAY, "idle");
            return true;
        }
        false
    }

    /// Consume complete frames from the input buffer and deliver each
    /// assembled message exactly once.  Returns true when the connection
    /// is done (close handshake or protocol failure).
    pub fn read_messages(
        &mut self,
        socket: &mut StreamSocket,
        on_message: &mut dyn FnMut(WsOpcode, Vec<u8>),
    ) -> GateResult<bool> {
        if self.state == WsState::Connecting {
            // First bytes from the peer complete the open.
            self.state = WsState::Open;
        }

        loop {
            let parsed = match parse_frame(&socket.in_buffer) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => return Ok(false),
                Err(e) => {
                    self.shutdown(socket, STATUS_PROTOCOL_ERROR, "");
                    return Err(e);
                }
            };

            let (frame, consumed) = parsed;
            socket.consume_input(consumed);
            self.last_activity = Instant::now();

            match frame.opcode {
                WsOpcode::Ping => {
                    Self::send_frame(socket, WsOpcode::Pong, &frame.payload);
                }
                WsOpcode::Pong => {}
                WsOpcode::Close => {
                    let code = if frame.payload.len() >= 2 {
                        u16::from_be_bytes([frame.payload[0], frame.payload[1]])
                    } else {
                        STATUS_NORMAL
                    };
                    log::debug!("Socket #{} received close frame ({code})", socket.fd());

                    if !self.close_sent {
                        // Echo the close per the protocol.
                        self.close_sent = true;
                        Self::send_frame(socket, WsOpcode::Close, &frame.payload);
                    }

                    self.state = WsState::Closed;
                    socket.shutdown();
                    return Ok(true);
                }
                WsOpcode::Continuation => {
                    if self.frag_opcode.is_none() {
                        self.shutdown(socket, STATUS_PROTOCOL_ERROR, "");
                        return Err(GateError::WebSocket("Continuation without start".into()));
                    }

                    self.accum.extend_from_slice(&frame.payload);
                    if self.accum.len() > WS_MAX_MESSAGE_SIZE {
                        self.shutdown(socket, STATUS_TOO_BIG, "");
                        return Ok(true);
                    }

                    if frame.fin {
                        let opcode = self.frag_opcode.take().unwrap();
                        on_message(opcode, std::mem::take(&mut self.accum));
                    }
                }
                WsOpcode::Text | WsOpcode::Binary => {
                    if self.frag_opcode.is_some() {
                        self.shutdown(socket, STATUS_PROTOCOL_ERROR, "");
                        return Err(GateError::WebSocket("Interleaved data frames".into()));
                    }

                    if frame.payload.len() > WS_MAX_MESSAGE_SIZE {
                        self.shutdown(socket, STATUS_TOO_BIG, "");
                        return Ok(true);
                    }

                    if frame.fin {
                        on_message(frame.opcode, frame.payload);
                    } else {
                        self.frag_opcode = Some(frame.opcode);
                        self.accum = frame.payload;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::RawFd;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn test_socket() -> (StreamSocket, RawFd) {
        let (a, b) = socketpair();
        (StreamSocket::plain(a), b)
    }

    fn masked_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![if fin { 0x80 | opcode } else { opcode }];
        assert!(payload.len() < 126);
        out.push(0x80 | payload.len() as u8);
        let key = [0x11, 0x22, 0x33, 0x44];
        out.extend_from_slice(&key);
        out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        out
    }

    #[test]
    fn rfc_sample_accept_key() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn masked_text_roundtrip() {
        let (mut sock, _peer) = test_socket();
        let mut ws = WsProto::new();
        sock.in_buffer = masked_frame(true, 0x1, b"status: ready");

        let mut messages = Vec::new();
        let done = ws
            .read_messages(&mut sock, &mut |op, data| messages.push((op, data)))
            .unwrap();

        assert!(!done);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, WsOpcode::Text);
        assert_eq!(messages[0].1, b"status: ready");
        assert!(sock.in_buffer.is_empty());
    }

    #[test]
    fn chunked_delivery_is_equivalent() {
        // The same byte stream must yield the same messages no matter how
        // it is split across reads.
        let frame = masked_frame(true, 0x1, b"load url=doc");

        for split in 1..frame.len() {
            let (mut sock, _peer) = test_socket();
            let mut ws = WsProto::new();
            let mut messages = Vec::new();

            sock.in_buffer = frame[..split].to_vec();
            ws.read_messages(&mut sock, &mut |_, d| messages.push(d)).unwrap();
            assert!(messages.is_empty(), "split at {split}");

            sock.in_buffer.extend_from_slice(&frame[split..]);
            ws.read_messages(&mut sock, &mut |_, d| messages.push(d)).unwrap();
            assert_eq!(messages, vec![b"load url=doc".to_vec()], "split at {split}");
        }
    }

    #[test]
    fn fragments_reassemble_into_one_message() {
        let (mut sock, _peer) = test_socket();
        let mut ws = WsProto::new();

        sock.in_buffer = masked_frame(false, 0x1, b"hello ");
        sock.in_buffer.extend(masked_frame(false, 0x0, b"big "));
        sock.in_buffer.extend(masked_frame(true, 0x0, b"world"));

        let mut messages = Vec::new();
        ws.read_messages(&mut sock, &mut |op, d| messages.push((op, d))).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, WsOpcode::Text);
        assert_eq!(messages[0].1, b"hello big world");
    }

    #[test]
    fn ping_gets_an_automatic_pong() {
        let (mut sock, _peer) = test_socket();
        let mut ws = WsProto::new();
        sock.in_buffer = masked_frame(true, 0x9, b"probe");

        ws.read_messages(&mut sock, &mut |_, _| panic!("ping is not a message"))
            .unwrap();

        assert_eq!(sock.out_buffer_len(), encode_frame(WsOpcode::Pong, b"probe").len());
    }

    #[test]
    fn close_is_echoed_and_ends_the_session() {
        let (mut sock, _peer) = test_socket();
        let mut ws = WsProto::new();
        sock.in_buffer = masked_frame(true, 0x8, &1000u16.to_be_bytes());

        let done = ws.read_messages(&mut sock, &mut |_, _| {}).unwrap();

        assert!(done);
        assert_eq!(ws.state(), WsState::Closed);
        assert!(sock.out_buffer_len() > 0);
        assert!(sock.is_shutdown_signalled());
    }

    #[test]
    fn unmasked_server_frames_parse_too() {
        let encoded = encode_frame(WsOpcode::Text, b"statusindicator: connect");
        let (frame, used) = parse_frame(&encoded).unwrap().unwrap();
        assert_eq!(used, encoded.len());
        assert!(frame.fin);
        assert_eq!(frame.payload, b"statusindicator: connect");
    }

    #[test]
    fn upgrade_response_has_matching_accept() {
        let raw = b"GET /lool/x/ws HTTP/1.1\r\n\
                    Upgrade: websocket\r\n\
                    Connection: Upgrade\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                    Sec-WebSocket-Version: 13\r\n\r\n";
        let (request, _) = crate::net::http::parse_request(raw).unwrap().unwrap();
        let response = WsProto::upgrade_response(&request).unwrap();
        let text = String::from_utf8(response).unwrap();

        assert!(text.starts_with("HTTP/1.1 101"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }

    #[test]
    fn oversize_fragmented_message_closes_1009() {
        let (mut sock, peer) = test_socket();
        let mut ws = WsProto::new();

        // Start a fragmented message, then pretend the accumulator is
        // already at the ceiling so the next continuation overflows.
        sock.in_buffer = masked_frame(false, 0x1, b"x");
        ws.read_messages(&mut sock, &mut |_, _| {}).unwrap();
        ws.accum = vec![0u8; WS_MAX_MESSAGE_SIZE];

        sock.in_buffer = masked_frame(false, 0x0, b"y");
        let done = ws
            .read_messages(&mut sock, &mut |_, _| panic!("oversize delivered"))
            .unwrap();

        assert!(done);
        assert_eq!(ws.state(), WsState::Closing);

        // Flush and inspect the close frame on the wire.
        sock.write_outgoing();
        let mut buf = [0u8; 256];
        let count =
            unsafe { libc::read(peer, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert!(count > 0);

        let (frame, _) = parse_frame(&buf[..count as usize]).unwrap().unwrap();
        assert_eq!(frame.opcode, WsOpcode::Close);
        assert_eq!(
            u16::from_be_bytes([frame.payload[0], frame.payload[1]]),
            STATUS_TOO_BIG
        );
        unsafe { libc::close(peer) };
    }
}
