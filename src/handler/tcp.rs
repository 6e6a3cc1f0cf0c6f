//! Line/frame-oriented TCP client: reconnects on a timer, reassembles
//! whole messages with a configurable pattern, then matches each message
//! against per-item sub-patterns.

use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use regex::Regex;

use crate::config::TcpConfig;
use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};
use crate::error::{HandlerError, ValidationError};
use crate::event::{Event, EventType, Events};
use crate::item::Items;
use crate::value::{TimePoint, Value};

use super::{HandlerIf, HandlerState, WaitRequest};

struct Binding {
    item_id: String,
    pattern: Regex,
}

pub struct Tcp {
    id: String,
    hostname: String,
    port: u16,
    timeout_interval: Duration,
    reconnect_interval: Duration,
    msg_pattern: Regex,
    max_msg_size: usize,
    log_raw_data: bool,
    bindings: Vec<Binding>,

    stream: Option<TcpStream>,
    msg_data: String,
    last_connect_try: Option<TimePoint>,
    last_data_receipt: TimePoint,
    state: HandlerState,
}

impl Tcp {
    pub fn new(id: impl Into<String>, config: &TcpConfig) -> Result<Tcp, ValidationError> {
        let id = id.into();
        let msg_pattern = Regex::new(&config.msg_pattern)
            .map_err(|err| ValidationError::Link(format!("link {id}: invalid msgPattern: {err}")))?;
        let mut bindings = Vec::with_capacity(config.bindings.len());
        for binding in &config.bindings {
            let pattern = Regex::new(&binding.pattern)
                .map_err(|err| ValidationError::Link(format!("link {id}: invalid pattern for {}: {err}", binding.item_id)))?;
            bindings.push(Binding { item_id: binding.item_id.clone(), pattern });
        }
        Ok(Tcp {
            id,
            hostname: config.hostname.clone(),
            port: config.port,
            timeout_interval: Duration::from_secs(config.reconnect_interval.max(1)),
            reconnect_interval: Duration::from_secs(config.reconnect_interval),
            msg_pattern,
            max_msg_size: 1024,
            log_raw_data: config.log_raw_data,
            bindings,
            stream: None,
            msg_data: String::new(),
            last_connect_try: None,
            last_data_receipt: TimePoint(0),
            state: HandlerState::default(),
        })
    }

    fn open(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        let now = TimePoint::now();
        if let Some(last) = self.last_connect_try {
            if last.epoch_secs() + self.reconnect_interval.as_secs() as i64 > now.epoch_secs() {
                return false;
            }
        }
        self.last_connect_try = Some(now);
        self.last_data_receipt = now;

        match TcpStream::connect((self.hostname.as_str(), self.port)) {
            Ok(stream) => {
                if stream.set_nonblocking(true).is_ok() {
                    log::info!(target: "link", "[{}] connected to {}:{}", self.id, self.hostname, self.port);
                    self.stream = Some(stream);
                    self.state.operational = true;
                    true
                } else {
                    false
                }
            }
            Err(err) => {
                log::error!(target: "link", "[{}] connect to {}:{} failed: {err}", self.id, self.hostname, self.port);
                self.state.error_counter += 1;
                false
            }
        }
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            log::info!(target: "link", "[{}] disconnected from {}:{}", self.id, self.hostname, self.port);
            self.state.operational = false;
            self.last_connect_try = None;
        }
    }

    fn receive_data(&mut self) -> Result<(), String> {
        let Some(stream) = self.stream.as_mut() else { return Ok(()) };
        let mut buffer = [0u8; 256];
        match stream.read(&mut buffer) {
            Ok(0) => Err("disconnect by remote party".into()),
            Ok(n) => {
                let received = String::from_utf8_lossy(&buffer[..n]).into_owned();
                if self.log_raw_data {
                    log::debug!(target: "link", "[{}] R {received}", self.id);
                }
                self.msg_data.push_str(&received);
                self.last_data_receipt = TimePoint::now();
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err.to_string()),
        }
    }

    fn receive_inner(&mut self) -> Result<Events, String> {
        let now = TimePoint::now();
        let mut events = Events::new();

        if !self.open() {
            return Ok(events);
        }

        if !self.timeout_interval.is_zero() && self.last_data_receipt.epoch_secs() + self.timeout_interval.as_secs() as i64 <= now.epoch_secs() {
            return Err("data transmission timed out".into());
        }

        self.receive_data()?;

        events.extend(reassemble_messages(&self.id, &mut self.msg_data, &self.msg_pattern, &self.bindings));

        if self.msg_data.len() > 2 * self.max_msg_size {
            return Err(format!("data '{}' does not match message pattern", self.msg_data));
        }

        Ok(events)
    }
}

/// Pulls a whole message's capture group 1 out of `msg_data` against
/// `msg_pattern`, then matches it against every binding's sub-pattern.
/// Consumed prefixes are removed from `msg_data` as they're extracted.
fn reassemble_messages(link_id: &str, msg_data: &mut String, msg_pattern: &Regex, bindings: &[Binding]) -> Events {
    let mut events = Events::new();
    while let Some(m) = msg_pattern.captures(msg_data) {
        let Some(group) = m.get(1) else { break };
        let msg = group.as_str().to_string();
        let consumed_end = m.get(0).unwrap().end();
        *msg_data = msg_data[consumed_end..].to_string();

        for binding in bindings {
            if let Some(captures) = binding.pattern.captures(&msg) {
                if let Some(value) = captures.get(1) {
                    events.push(Event::new(link_id, binding.item_id.clone(), EventType::StateInd, Value::new_string(value.as_str())));
                }
            }
        }
    }
    events
}

impl HandlerIf for Tcp {
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
            item.set_readable(false);
            item.set_writable(false);
        }
        Ok(())
    }

    fn state(&self) -> HandlerState {
        self.state
    }

    fn collect_wait(&mut self, epoll: &Epoll, token: Token) -> Result<WaitRequest, HandlerError> {
        if let Some(stream) = &self.stream {
            let fd: RawFd = stream.as_raw_fd();
            fd.add(epoll, token, Ready::readable(), EpollOpt::edge())
                .or_else(|_| fd.modify(epoll, token, Ready::readable(), EpollOpt::edge()))
                .map_err(|source| HandlerError::Io { link_id: self.id.clone(), source })?;
            Ok(WaitRequest::no_bound())
        } else {
            Ok(WaitRequest::after(self.reconnect_interval))
        }
    }

    fn receive(&mut self, _items: &Items) -> Events {
        match self.receive_inner() {
            Ok(events) => events,
            Err(message) => {
                self.state.error_counter += 1;
                log::error!(target: "link", "[{}] {message}", self.id);
                self.close();
                Events::new()
            }
        }
    }

    fn send(&mut self, _items: &Items, _events: &Events) -> Events {
        Events::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_frame_body_from_capture_group() {
        let msg_pattern = Regex::new(r"\x02(.*?)\x03").unwrap();
        let bindings = vec![Binding { item_id: "mode".into(), pattern: Regex::new(r"^M=(\w+)$").unwrap() }];
        let mut msg_data = "\x02M=boost\x03trailing".to_string();

        let events = reassemble_messages("tcp", &mut msg_data, &msg_pattern, &bindings);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value(), &Value::new_string("boost"));
        assert_eq!(msg_data, "trailing");
    }

    #[test]
    fn unterminated_frame_leaves_buffer_for_next_read() {
        let msg_pattern = Regex::new(r"\x02(.*?)\x03").unwrap();
        let bindings: Vec<Binding> = Vec::new();
        let mut msg_data = "\x02M=boost".to_string();

        let events = reassemble_messages("tcp", &mut msg_data, &msg_pattern, &bindings);
        assert!(events.is_empty());
        assert_eq!(msg_data, "\x02M=boost");
    }
}
