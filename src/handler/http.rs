//! Polling HTTP client: one GET (or POST, when a request body template is
//! configured) per `READ_REQ`/`WRITE_REQ`, answered by matching
//! `responsePattern` against the response body. Also carries the Fritz!Box
//! TR-064 SOAP dialect as an optional envelope template rather than a
//! separate handler kind, since it is the same poll-then-extract mechanics
//! over the same transport.
//!
//! Requests are serialised one at a time behind a single socket: the engine
//! hands each link exactly one readiness token, so unlike a real multi-
//! transfer engine this handler queues concurrent requests rather than
//! running them in parallel.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use regex::Regex;

use crate::config::HttpConfig;
use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};
use crate::error::{HandlerError, ValidationError};
use crate::event::{Event, EventType, Events};
use crate::item::Items;
use crate::value::{TimePoint, Value};

use super::{HandlerIf, HandlerState, WaitRequest};

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);
const BASE64_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity((input.len() + 2) / 3 * 4);
    for chunk in input.chunks(3) {
        let b0 = chunk[0];
        let b1 = chunk.get(1).copied();
        let b2 = chunk.get(2).copied();
        out.push(BASE64_ALPHABET[(b0 >> 2) as usize] as char);
        out.push(BASE64_ALPHABET[(((b0 & 0x03) << 4) | (b1.unwrap_or(0) >> 4)) as usize] as char);
        out.push(if let Some(b1) = b1 {
            BASE64_ALPHABET[(((b1 & 0x0F) << 2) | (b2.unwrap_or(0) >> 6)) as usize] as char
        } else {
            '='
        });
        out.push(if let Some(b2) = b2 { BASE64_ALPHABET[(b2 & 0x3F) as usize] as char } else { '=' });
    }
    out
}

fn parse_url(url: &str) -> Option<(String, u16, String)> {
    let rest = url.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().ok()?),
        None => (authority.to_string(), 80u16),
    };
    Some((host, port, path.to_string()))
}

fn substitute_tokens(template: &str, value: &Value) -> String {
    template
        .replace("%Time%", &TimePoint::now().epoch_secs().to_string())
        .replace("%EventValue%", &value.to_display_string())
}

struct Binding {
    item_id: String,
    host: String,
    port: u16,
    path: String,
    headers: Vec<String>,
    request_template: String,
    response_pattern: Regex,
}

struct Transfer {
    binding_index: usize,
    stream: TcpStream,
    buffer: Vec<u8>,
    started_at: TimePoint,
    request_sent: bool,
}

pub struct Http {
    id: String,
    user: String,
    password: String,
    log_transfers: bool,
    bindings: Vec<Binding>,

    queue: VecDeque<(usize, Option<Value>)>,
    active: Option<Transfer>,
    state: HandlerState,
}

impl Http {
    pub fn new(id: impl Into<String>, config: &HttpConfig) -> Result<Http, ValidationError> {
        let id = id.into();
        let mut bindings = Vec::with_capacity(config.bindings.len());
        for binding in &config.bindings {
            let (host, port, path) = parse_url(&binding.url)
                .ok_or_else(|| ValidationError::Link(format!("link {id}: invalid url for item {}: {}", binding.item_id, binding.url)))?;
            let response_pattern = Regex::new(&binding.response_pattern).map_err(|err| {
                ValidationError::Link(format!("link {id}: invalid responsePattern for {}: {err}", binding.item_id))
            })?;
            bindings.push(Binding {
                item_id: binding.item_id.clone(),
                host,
                port,
                path,
                headers: binding.headers.clone(),
                request_template: binding.request.clone(),
                response_pattern,
            });
        }

        Ok(Http {
            id,
            user: config.user.clone(),
            password: config.password.clone(),
            log_transfers: config.log_transfers,
            bindings,
            queue: VecDeque::new(),
            active: None,
            state: HandlerState::default(),
        })
    }

    fn build_request(&self, binding: &Binding, body: Option<&str>) -> Vec<u8> {
        let method = if body.is_some() || !binding.request_template.is_empty() { "POST" } else { "GET" };
        let body = body.map(str::to_string).unwrap_or_else(|| binding.request_template.clone());

        let mut request = format!("{method} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", binding.path, binding.host);
        for header in &binding.headers {
            request.push_str(header);
            request.push_str("\r\n");
        }
        if !self.user.is_empty() {
            let credentials = base64_encode(format!("{}:{}", self.user, self.password).as_bytes());
            request.push_str(&format!("Authorization: Basic {credentials}\r\n"));
        }
        if method == "POST" {
            request.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
        } else {
            request.push_str("\r\n");
        }
        request.into_bytes()
    }

    fn start_next_transfer(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some((binding_index, value)) = self.queue.pop_front() else { return };
        let binding = &self.bindings[binding_index];
        match TcpStream::connect((binding.host.as_str(), binding.port)) {
            Ok(stream) => {
                if stream.set_nonblocking(true).is_err() {
                    self.state.error_counter += 1;
                    return;
                }
                let body = value.as_ref().map(|v| substitute_tokens(&binding.request_template, v));
                let request = self.build_request(binding, body.as_deref());
                if self.log_transfers {
                    log::debug!(target: "link", "[{}] -> {}:{}{}", self.id, binding.host, binding.port, binding.path);
                }
                self.active = Some(Transfer {
                    binding_index,
                    stream,
                    buffer: request,
                    started_at: TimePoint::now(),
                    request_sent: false,
                });
            }
            Err(err) => {
                log::error!(target: "link", "[{}] connect to {}:{} failed: {err}", self.id, binding.host, binding.port);
                self.state.error_counter += 1;
            }
        }
    }

    fn finish_transfer(&mut self, transfer: Transfer, events: &mut Events) {
        let binding = &self.bindings[transfer.binding_index];
        let response = String::from_utf8_lossy(&transfer.buffer);
        let body = response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or(&response);
        if let Some(captures) = binding.response_pattern.captures(body) {
            if let Some(m) = captures.get(1) {
                events.push(Event::new(self.id.clone(), binding.item_id.clone(), EventType::StateInd, Value::new_string(m.as_str())));
                return;
            }
        }
        log::warn!(target: "link", "[{}] response for item {} did not match responsePattern", self.id, binding.item_id);
    }
}

impl HandlerIf for Http {
    fn validate(&mut self, items: &mut Items) -> Result<(), ValidationError> {
        for (item_id, item) in items.iter() {
            if item.owner_id() == self.id && !self.bindings.iter().any(|b| &b.item_id == item_id) {
                return Err(ValidationError::Link(format!("item {item_id} has no binding for link {}", self.id)));
            }
        }
        for binding in &self.bindings {
            let item = items
                .get_mut(&binding.item_id)
                .ok_or_else(|| ValidationError::Link(format!("item {} referenced but not defined", binding.item_id)))?;
            item.validate_owner_id(&self.id).map_err(ValidationError::Link)?;
            item.set_readable(true);
            item.set_writable(!binding.request_template.is_empty());
        }
        Ok(())
    }

    fn state(&self) -> HandlerState {
        self.state
    }

    fn collect_wait(&mut self, epoll: &Epoll, token: Token) -> Result<WaitRequest, HandlerError> {
        if let Some(transfer) = &self.active {
            if transfer.started_at.epoch_secs() + TRANSFER_TIMEOUT.as_secs() as i64 <= TimePoint::now().epoch_secs() {
                log::error!(target: "link", "[{}] transfer for item {} timed out", self.id, self.bindings[transfer.binding_index].item_id);
                self.state.error_counter += 1;
                self.active = None;
            }
        }
        self.start_next_transfer();

        if let Some(transfer) = &self.active {
            let fd: RawFd = transfer.stream.as_raw_fd();
            let ready = if transfer.request_sent { Ready::readable() } else { Ready::readable() | Ready::writable() };
            fd.add(epoll, token, ready, EpollOpt::edge())
                .or_else(|_| fd.modify(epoll, token, ready, EpollOpt::edge()))
                .map_err(|source| HandlerError::Io { link_id: self.id.clone(), source })?;
            Ok(WaitRequest::after(Duration::from_millis(100)))
        } else if self.queue.is_empty() {
            Ok(WaitRequest::no_bound())
        } else {
            Ok(WaitRequest::immediate())
        }
    }

    fn receive(&mut self, _items: &Items) -> Events {
        let mut events = Events::new();
        let Some(transfer) = &mut self.active else { return events };

        if !transfer.request_sent {
            match transfer.stream.write(&transfer.buffer) {
                Ok(n) if n == transfer.buffer.len() => {
                    transfer.buffer.clear();
                    transfer.request_sent = true;
                }
                Ok(n) => {
                    transfer.buffer.drain(..n);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => {
                    log::error!(target: "link", "[{}] request write failed: {err}", self.id);
                    self.state.error_counter += 1;
                    self.active = None;
                    return events;
                }
            }
            return events;
        }

        let mut buf = [0u8; 1024];
        loop {
            match transfer.stream.read(&mut buf) {
                Ok(0) => {
                    self.state.operational = true;
                    let transfer = self.active.take().unwrap();
                    self.finish_transfer(transfer, &mut events);
                    self.start_next_transfer();
                    return events;
                }
                Ok(n) => transfer.buffer.extend_from_slice(&buf[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::error!(target: "link", "[{}] response read failed: {err}", self.id);
                    self.state.error_counter += 1;
                    self.active = None;
                    return events;
                }
            }
        }
        events
    }

    fn send(&mut self, _items: &Items, events: &Events) -> Events {
        for event in events {
            if !matches!(event.event_type(), EventType::ReadReq | EventType::WriteReq) {
                continue;
            }
            let Some(binding_index) = self.bindings.iter().position(|b| b.item_id == event.item_id()) else { continue };
            let value = if event.event_type() == EventType::WriteReq { Some(event.value().clone()) } else { None };
            self.queue.push_back((binding_index, value));
        }
        self.start_next_transfer();
        Events::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_and_path() {
        assert_eq!(parse_url("http://example.com:8080/status"), Some(("example.com".into(), 8080, "/status".into())));
    }

    #[test]
    fn defaults_to_port_80_and_root_path() {
        assert_eq!(parse_url("http://example.com"), Some(("example.com".into(), 80, "/".into())));
    }

    #[test]
    fn base64_encodes_credentials() {
        assert_eq!(base64_encode(b"user:pass"), "dXNlcjpwYXNz");
    }

    #[test]
    fn substitutes_event_value_and_time_tokens() {
        let body = substitute_tokens("value=%EventValue%", &Value::new_number(21.5));
        assert_eq!(body, "value=21.5");
    }
}
