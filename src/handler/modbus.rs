//! Modbus/TCP client restricted to function 0x03 (read holding registers):
//! MBAP-framed requests are issued in response to `READ_REQ` and answered
//! with `STATE_IND` once the matching transaction's response arrives.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::config::ModbusConfig;
use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};
use crate::error::{HandlerError, ValidationError};
use crate::event::{Event, EventType, Events};
use crate::item::Items;
use crate::value::{TimePoint, Value};

use super::{HandlerIf, HandlerState, WaitRequest};

const FUNC_READ_HOLDING_REGISTERS: u8 = 0x03;

fn build_read_request(transaction_id: u16, unit_id: u8, first_register: u16, quantity: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12);
    frame.extend(transaction_id.to_be_bytes());
    frame.extend(0u16.to_be_bytes()); // protocol id
    frame.extend(6u16.to_be_bytes()); // length: unit id + pdu
    frame.push(unit_id);
    frame.push(FUNC_READ_HOLDING_REGISTERS);
    frame.extend(first_register.to_be_bytes());
    frame.extend(quantity.to_be_bytes());
    frame
}

/// Decodes one MBAP frame from the front of `buf` if it's complete.
fn try_decode_mbap(buf: &[u8]) -> Option<(u16, u8, Vec<u8>, usize)> {
    if buf.len() < 8 {
        return None;
    }
    let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let total = 6 + length;
    if buf.len() < total || length < 2 {
        return None;
    }
    let unit_id = buf[6];
    let pdu = buf[7..total].to_vec();
    Some((transaction_id, unit_id, pdu, total))
}

struct Binding {
    item_id: String,
    unit_id: u8,
    first_register: u16,
    quantity: u16,
    factor_register: Option<u16>,
}

struct PendingRequest {
    binding_index: usize,
    sent_at: TimePoint,
}

pub struct Modbus {
    id: String,
    hostname: String,
    port: u16,
    reconnect_interval: Duration,
    response_timeout: Duration,
    log_raw_data: bool,
    bindings: Vec<Binding>,

    stream: Option<TcpStream>,
    in_buffer: Vec<u8>,
    last_connect_try: Option<TimePoint>,
    next_transaction_id: u16,
    pending: HashMap<u16, PendingRequest>,
    state: HandlerState,
}

impl Modbus {
    pub fn new(id: impl Into<String>, config: &ModbusConfig) -> Result<Modbus, ValidationError> {
        let id = id.into();
        let mut bindings = Vec::with_capacity(config.bindings.len());
        for binding in &config.bindings {
            if binding.last_register < binding.first_register {
                return Err(ValidationError::Link(format!(
                    "link {id}: item {} has lastRegister before firstRegister",
                    binding.item_id
                )));
            }
            let quantity = binding.last_register - binding.first_register + 1;
            if quantity > 16 {
                return Err(ValidationError::Link(format!(
                    "link {id}: item {} spans {quantity} registers, more than supported",
                    binding.item_id
                )));
            }
            bindings.push(Binding {
                item_id: binding.item_id.clone(),
                unit_id: binding.unit_id,
                first_register: binding.first_register,
                quantity,
                factor_register: binding.factor_register,
            });
        }

        Ok(Modbus {
            id,
            hostname: config.hostname.clone(),
            port: config.port,
            reconnect_interval: Duration::from_secs(config.reconnect_interval),
            response_timeout: Duration::from_secs(config.response_timeout),
            log_raw_data: config.log_raw_data,
            bindings,
            stream: None,
            in_buffer: Vec::new(),
            last_connect_try: None,
            next_transaction_id: 1,
            pending: HashMap::new(),
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

        match TcpStream::connect((self.hostname.as_str(), self.port)) {
            Ok(stream) => {
                if stream.set_nonblocking(true).is_err() {
                    self.state.error_counter += 1;
                    return false;
                }
                log::info!(target: "link", "[{}] connected to {}:{}", self.id, self.hostname, self.port);
                self.stream = Some(stream);
                self.state.operational = true;
                true
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
        self.in_buffer.clear();
        self.pending.clear();
    }

    fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    fn decode_registers(binding: &Binding, registers: &[u16]) -> f64 {
        match binding.factor_register {
            Some(fr) if fr >= binding.first_register && fr < binding.first_register + binding.quantity => {
                let factor_idx = (fr - binding.first_register) as usize;
                let exponent = registers[factor_idx] as i16;
                let mut raw: u64 = 0;
                for (idx, reg) in registers.iter().enumerate() {
                    if idx == factor_idx {
                        continue;
                    }
                    raw = (raw << 16) | *reg as u64;
                }
                raw as f64 * 10f64.powi(exponent as i32)
            }
            _ => {
                let mut raw: u64 = 0;
                for reg in registers {
                    raw = (raw << 16) | *reg as u64;
                }
                raw as f64
            }
        }
    }

    fn process_response(&mut self, transaction_id: u16, pdu: &[u8], events: &mut Events) {
        let Some(pending) = self.pending.remove(&transaction_id) else { return };
        let binding = &self.bindings[pending.binding_index];

        if pdu.is_empty() {
            return;
        }
        if pdu[0] & 0x80 != 0 {
            log::error!(target: "link", "[{}] Modbus exception response for item {}: code {}", self.id, binding.item_id, pdu.get(1).copied().unwrap_or(0));
            self.state.error_counter += 1;
            return;
        }
        if pdu[0] != FUNC_READ_HOLDING_REGISTERS || pdu.len() < 2 {
            return;
        }
        let byte_count = pdu[1] as usize;
        if pdu.len() < 2 + byte_count || byte_count != binding.quantity as usize * 2 {
            log::error!(target: "link", "[{}] unexpected byte count in response for item {}", self.id, binding.item_id);
            return;
        }
        let registers: Vec<u16> = pdu[2..2 + byte_count].chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
        let value = Self::decode_registers(binding, &registers);
        events.push(Event::new(self.id.clone(), binding.item_id.clone(), EventType::StateInd, Value::new_number(value)));
    }
}

impl HandlerIf for Modbus {
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
            item.set_writable(false);
        }
        Ok(())
    }

    fn state(&self) -> HandlerState {
        self.state
    }

    fn collect_wait(&mut self, epoll: &Epoll, token: Token) -> Result<WaitRequest, HandlerError> {
        let now = TimePoint::now();
        let timed_out: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| p.sent_at.epoch_secs() + self.response_timeout.as_secs() as i64 <= now.epoch_secs())
            .map(|(txn, _)| *txn)
            .collect();
        for txn in timed_out {
            if let Some(pending) = self.pending.remove(&txn) {
                log::error!(target: "link", "[{}] no Modbus response for item {} within responseTimeout", self.id, self.bindings[pending.binding_index].item_id);
                self.state.error_counter += 1;
            }
        }

        if !self.open() {
            return Ok(WaitRequest::after(self.reconnect_interval));
        }

        if let Some(stream) = &self.stream {
            let fd: RawFd = stream.as_raw_fd();
            fd.add(epoll, token, Ready::readable(), EpollOpt::edge())
                .or_else(|_| fd.modify(epoll, token, Ready::readable(), EpollOpt::edge()))
                .map_err(|source| HandlerError::Io { link_id: self.id.clone(), source })?;
        }
        Ok(WaitRequest::after(Duration::from_millis(500)))
    }

    fn receive(&mut self, _items: &Items) -> Events {
        let mut events = Events::new();
        let Some(stream) = self.stream.as_mut() else { return events };

        let mut buf = [0u8; 512];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    log::error!(target: "link", "[{}] remote closed the connection", self.id);
                    self.state.error_counter += 1;
                    self.close();
                    return events;
                }
                Ok(n) => {
                    if self.log_raw_data {
                        log::debug!(target: "link", "[{}] R {}", self.id, hex::encode(&buf[..n]));
                    }
                    self.in_buffer.extend_from_slice(&buf[..n]);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::error!(target: "link", "[{}] read failed: {err}", self.id);
                    self.state.error_counter += 1;
                    self.close();
                    return events;
                }
            }
        }

        while let Some((transaction_id, _unit_id, pdu, consumed)) = try_decode_mbap(&self.in_buffer) {
            self.in_buffer.drain(..consumed);
            self.process_response(transaction_id, &pdu, &mut events);
        }
        events
    }

    fn send(&mut self, _items: &Items, events: &Events) -> Events {
        if self.stream.is_none() {
            return Events::new();
        }
        for event in events {
            if event.event_type() != EventType::ReadReq {
                continue;
            }
            let Some(binding_index) = self.bindings.iter().position(|b| b.item_id == event.item_id()) else { continue };
            if self.pending.values().any(|p| p.binding_index == binding_index) {
                continue;
            }
            let binding = &self.bindings[binding_index];
            let transaction_id = self.next_transaction_id();
            let frame = build_read_request(transaction_id, binding.unit_id, binding.first_register, binding.quantity);
            if self.log_raw_data {
                log::debug!(target: "link", "[{}] W {}", self.id, hex::encode(&frame));
            }
            if let Some(stream) = self.stream.as_mut() {
                if let Err(err) = stream.write_all(&frame) {
                    log::error!(target: "link", "[{}] write failed: {err}", self.id);
                    self.state.error_counter += 1;
                    self.close();
                    break;
                }
            }
            self.pending.insert(transaction_id, PendingRequest { binding_index, sent_at: TimePoint::now() });
        }
        Events::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mbap_frame_round_trips() {
        let frame = build_read_request(7, 1, 100, 2);
        let (transaction_id, unit_id, pdu, consumed) = try_decode_mbap(&frame).unwrap();
        assert_eq!(transaction_id, 7);
        assert_eq!(unit_id, 1);
        assert_eq!(consumed, frame.len());
        assert_eq!(pdu[0], FUNC_READ_HOLDING_REGISTERS);
        assert_eq!(u16::from_be_bytes([pdu[1], pdu[2]]), 100);
    }

    #[test]
    fn decodes_two_register_value_without_factor() {
        let binding = Binding { item_id: "x".into(), unit_id: 1, first_register: 0, quantity: 2, factor_register: None };
        let value = Modbus::decode_registers(&binding, &[0x0001, 0x0002]);
        assert_eq!(value, (1u64 << 16 | 2) as f64);
    }

    #[test]
    fn applies_factor_register_as_power_of_ten_scaler() {
        let binding = Binding { item_id: "x".into(), unit_id: 1, first_register: 10, quantity: 2, factor_register: Some(11) };
        // register 10 = value 123, register 11 (factor) = -1 -> 12.3
        let value = Modbus::decode_registers(&binding, &[123, 0xFFFF]);
        assert!((value - 12.3).abs() < 1e-9);
    }

    #[test]
    fn incomplete_frame_is_not_decoded() {
        let frame = build_read_request(1, 1, 0, 1);
        assert!(try_decode_mbap(&frame[..frame.len() - 1]).is_none());
    }
}
