//! Client-side websocket session: one browser editing connection,
//! attached to its document broker's poll.

use crate::broker::DocumentBroker;
use crate::gateway::Gateway;
use crate::limits::WS_IDLE_TIMEOUT_SECS;
use crate::net::poll::{HandlerOutcome, SocketHandler, SocketPoll};
use crate::net::socket::SocketRef;
use crate::net::ws::{WsOpcode, WsProto, WsState};

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct ClientSession {
    id: u32,
    broker: Arc<DocumentBroker>,
    gateway: Arc<Gateway>,
    read_only: bool,
    ws: WsProto,
}

impl fmt::Display for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ClientSession-{}", self.id)
    }
}

impl ClientSession {
    pub fn new(
        id: u32,
        broker: Arc<DocumentBroker>,
        gateway: Arc<Gateway>,
        read_only: bool,
    ) -> ClientSession {
        ClientSession {
            id,
            broker,
            gateway,
            read_only,
            ws: WsProto::new(),
        }
    }

    fn handle_message(&mut self, text: &str) {
        log::trace!("{self} command: [{text}]");

        if let Some(ref trace) = self.gateway.trace {
            trace.lock().unwrap().incoming(
                self.broker.doc_key(),
                &self.id.to_string(),
                text,
            );
        }

        if self.read_only && is_mutating_command(text) {
            log::warn!("{self} is readonly; dropping [{text}]");
            return;
        }

        self.broker.forward_client_command(self.id, text);
    }
}

/// Commands that modify the document; refused on readonly sessions.
fn is_mutating_command(text: &str) -> bool {
    matches!(
        text.split_whitespace().next().unwrap_or(""),
        "paste" | "insertfile" | "key" | "mouse" | "uno" | "selecttext" | "textinput"
    )
}

impl SocketHandler for ClientSession {
    fn on_connect(&mut self, _socket: &SocketRef, _poll: &Arc<SocketPoll>) {
        log::debug!("{self} attached to broker [{}]", self.broker.doc_key());
    }

    fn handle_incoming(&mut self, socket: &SocketRef, _poll: &Arc<SocketPoll>) -> HandlerOutcome {
        let mut lines: Vec<String> = Vec::new();

        let result = {
            let mut sock = socket.lock().unwrap();
            self.ws.read_messages(&mut sock, &mut |opcode, payload| {
                if opcode == WsOpcode::Text {
                    lines.push(String::from_utf8_lossy(&payload).to_string());
                }
            })
        };

        for line in &lines {
            self.handle_message(line);
        }

        match result {
            Ok(false) => HandlerOutcome::Continue,
            Ok(true) => HandlerOutcome::Close,
            Err(e) => {
                log::error!("{self} websocket error: {e}");
                HandlerOutcome::Close
            }
        }
    }

    fn check_timeout(&mut self, socket: &SocketRef, now: Instant) -> HandlerOutcome {
        let mut sock = socket.lock().unwrap();
        if self
            .ws
            .check_idle(&mut sock, now, Duration::from_secs(WS_IDLE_TIMEOUT_SECS))
        {
            log::info!("{self} idle timeout");
        }

        if self.ws.state() == WsState::Closed {
            HandlerOutcome::Close
        } else {
            HandlerOutcome::Continue
        }
    }

    fn on_disconnect(&mut self, _socket: &SocketRef) {
        log::debug!("{self} disconnected");
        self.gateway.num_connections.fetch_sub(1, Ordering::SeqCst);

        if let Some(ref trace) = self.gateway.trace {
            trace.lock().unwrap().end_session(
                self.broker.doc_key(),
                &self.id.to_string(),
                self.broker.public_uri(),
            );
        }

        self.broker.remove_session(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readonly_filter() {
        assert!(is_mutating_command("key type=input char=97 key=0"));
        assert!(is_mutating_command("paste mimetype=text/plain"));
        assert!(!is_mutating_command("tile part=0 width=256"));
        assert!(!is_mutating_command("status"));
    }
}
