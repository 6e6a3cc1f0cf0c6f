//! Serial line client: opens a tty with the configured baud rate/framing,
//! reassembles whole messages with a configurable pattern, then matches
//! each message against per-item sub-patterns. Mirrors the TCP handler's
//! shape with polling instead of a persistent stream.

use std::io::{ErrorKind, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use regex::Regex;
use serialport::{DataBits, Parity, StopBits, TTYPort};

use crate::config::PortConfig;
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

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(format!("invalid data bits: {other}")),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(format!("invalid stop bits: {other}")),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        other => Err(format!("invalid parity: {other}")),
    }
}

pub struct Port {
    id: String,
    name: String,
    baud_rate: u32,
    data_bits: DataBits,
    stop_bits: StopBits,
    parity: Parity,
    timeout_interval: Duration,
    reopen_interval: Duration,
    msg_pattern: Regex,
    max_msg_size: usize,
    log_raw_data: bool,
    log_raw_data_in_hex: bool,
    bindings: Vec<Binding>,

    port: Option<TTYPort>,
    msg_data: String,
    last_open_try: Option<TimePoint>,
    last_data_receipt: TimePoint,
    state: HandlerState,
}

impl Port {
    pub fn new(id: impl Into<String>, config: &PortConfig) -> Result<Port, ValidationError> {
        let id = id.into();
        let data_bits = parse_data_bits(config.data_bits).map_err(|e| ValidationError::Link(format!("link {id}: {e}")))?;
        let stop_bits = parse_stop_bits(config.stop_bits).map_err(|e| ValidationError::Link(format!("link {id}: {e}")))?;
        let parity = parse_parity(&config.parity).map_err(|e| ValidationError::Link(format!("link {id}: {e}")))?;
        let msg_pattern = Regex::new(&config.msg_pattern)
            .map_err(|err| ValidationError::Link(format!("link {id}: invalid msgPattern: {err}")))?;
        let mut bindings = Vec::with_capacity(config.bindings.len());
        for binding in &config.bindings {
            let pattern = Regex::new(&binding.pattern)
                .map_err(|err| ValidationError::Link(format!("link {id}: invalid pattern for {}: {err}", binding.item_id)))?;
            bindings.push(Binding { item_id: binding.item_id.clone(), pattern });
        }
        Ok(Port {
            id,
            name: config.name.clone(),
            baud_rate: config.baud_rate,
            data_bits,
            stop_bits,
            parity,
            timeout_interval: Duration::from_secs(config.timeout_interval),
            reopen_interval: Duration::from_secs(config.reopen_interval),
            msg_pattern,
            max_msg_size: config.max_msg_size,
            log_raw_data: config.log_raw_data,
            log_raw_data_in_hex: config.log_raw_data_in_hex,
            bindings,
            port: None,
            msg_data: String::new(),
            last_open_try: None,
            last_data_receipt: TimePoint(0),
            state: HandlerState::default(),
        })
    }

    fn open(&mut self) -> bool {
        if self.port.is_some() {
            return true;
        }
        let now = TimePoint::now();
        if let Some(last) = self.last_open_try {
            if last.epoch_secs() + self.reopen_interval.as_secs() as i64 > now.epoch_secs() {
                return false;
            }
        }
        self.last_open_try = Some(now);
        self.last_data_receipt = now;

        let opened = TTYPort::open(
            &serialport::new(&self.name, self.baud_rate)
                .data_bits(self.data_bits)
                .stop_bits(self.stop_bits)
                .parity(self.parity)
                .timeout(Duration::from_millis(10)),
        );

        match opened {
            Ok(port) => {
                log::info!(target: "link", "[{}] serial port {} open", self.id, self.name);
                self.port = Some(port);
                self.state.operational = true;
                true
            }
            Err(err) => {
                log::error!(target: "link", "[{}] open {} failed: {err}", self.id, self.name);
                self.state.error_counter += 1;
                false
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!(target: "link", "[{}] serial port {} closed", self.id, self.name);
            self.state.operational = false;
            self.last_open_try = None;
            self.msg_data.clear();
        }
    }

    fn receive_data(&mut self) -> Result<(), String> {
        let Some(port) = self.port.as_mut() else { return Ok(()) };
        let mut buffer = [0u8; 256];
        match port.read(&mut buffer) {
            Ok(0) => Err("data transmission stopped".into()),
            Ok(n) => {
                let received = String::from_utf8_lossy(&buffer[..n]).into_owned();
                if self.log_raw_data {
                    if self.log_raw_data_in_hex {
                        log::debug!(target: "link", "[{}] R {}", self.id, hex::encode(&buffer[..n]));
                    } else {
                        log::debug!(target: "link", "[{}] R {received}", self.id);
                    }
                }
                self.msg_data.push_str(&received);
                self.last_data_receipt = TimePoint::now();
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => Ok(()),
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

/// Pulls whole messages out of `msg_data` against `msg_pattern`, then
/// matches each against every binding's sub-pattern. Consumed prefixes are
/// removed from `msg_data` as they're extracted.
fn reassemble_messages(link_id: &str, msg_data: &mut String, msg_pattern: &Regex, bindings: &[Binding]) -> Events {
    let mut events = Events::new();
    while let Some(m) = msg_pattern.captures(msg_data) {
        let whole = m.get(0).unwrap();
        let msg = whole.as_str().to_string();
        let consumed_end = whole.end();
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

impl HandlerIf for Port {
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
        if let Some(port) = &self.port {
            let fd: RawFd = port.as_raw_fd();
            fd.add(epoll, token, Ready::readable(), EpollOpt::edge())
                .or_else(|_| fd.modify(epoll, token, Ready::readable(), EpollOpt::edge()))
                .map_err(|source| HandlerError::Io { link_id: self.id.clone(), source })?;
            Ok(WaitRequest::after(Duration::from_millis(200)))
        } else {
            Ok(WaitRequest::after(self.reopen_interval))
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
    fn parses_valid_framing_options() {
        assert!(matches!(parse_data_bits(8).unwrap(), DataBits::Eight));
        assert!(matches!(parse_stop_bits(1).unwrap(), StopBits::One));
        assert!(matches!(parse_parity("even").unwrap(), Parity::Even));
    }

    #[test]
    fn rejects_unknown_framing_options() {
        assert!(parse_data_bits(9).is_err());
        assert!(parse_stop_bits(3).is_err());
        assert!(parse_parity("mark").is_err());
    }

    #[test]
    fn reassembles_one_message_per_newline_and_consumes_it() {
        let msg_pattern = Regex::new(r"^.*\n").unwrap();
        let bindings = vec![Binding { item_id: "temp".into(), pattern: Regex::new(r"^T=(\d+)").unwrap() }];
        let mut msg_data = "T=21\nT=2".to_string();

        let events = reassemble_messages("serial", &mut msg_data, &msg_pattern, &bindings);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value(), &Value::new_string("21"));
        assert_eq!(msg_data, "T=2");
    }

    #[test]
    fn partial_message_without_binding_match_is_left_untouched() {
        let msg_pattern = Regex::new(r"^.*\n").unwrap();
        let bindings = vec![Binding { item_id: "temp".into(), pattern: Regex::new(r"^T=(\d+)").unwrap() }];
        let mut msg_data = "junk".to_string();

        let events = reassemble_messages("serial", &mut msg_data, &msg_pattern, &bindings);
        assert!(events.is_empty());
        assert_eq!(msg_data, "junk");
    }
}
