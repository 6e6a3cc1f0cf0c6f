//! MQTT v3.1.1 client, QoS 0 only: CONNECT/CONNACK, SUBSCRIBE/SUBACK,
//! PUBLISH and keep-alive PINGREQ/PINGRESP, hand-rolled over a plain TCP
//! socket. Topic patterns carry the literal token `%ItemId%`, expanded to
//! `+` on subscribe and to the concrete item id on publish.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use regex::Regex;

use crate::config::MqttConfig;
use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};
use crate::error::{HandlerError, ValidationError};
use crate::event::{Event, EventType, Events};
use crate::item::Items;
use crate::value::{TimePoint, Value};

use super::{HandlerIf, HandlerState, WaitRequest};

const ITEM_ID_TOKEN: &str = "%ItemId%";

const PKT_CONNECT: u8 = 1;
const PKT_CONNACK: u8 = 2;
const PKT_PUBLISH: u8 = 3;
const PKT_SUBSCRIBE: u8 = 8;
const PKT_SUBACK: u8 = 9;
const PKT_PINGREQ: u8 = 12;
const PKT_PINGRESP: u8 = 13;
const PKT_DISCONNECT: u8 = 14;

fn encode_string(out: &mut Vec<u8>, s: &str) {
    out.extend((s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_remaining_length(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Decodes one packet from the front of `buf` if it's complete, returning
/// `(packet_type, flags, payload, bytes_consumed)`.
fn try_decode_packet(buf: &[u8]) -> Option<(u8, u8, Vec<u8>, usize)> {
    if buf.is_empty() {
        return None;
    }
    let first = buf[0];
    let packet_type = first >> 4;
    let flags = first & 0x0F;

    let mut multiplier = 1usize;
    let mut remaining_len = 0usize;
    let mut idx = 1;
    loop {
        let byte = *buf.get(idx)?;
        idx += 1;
        remaining_len += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
        if multiplier > 128 * 128 * 128 {
            return None;
        }
    }

    let total = idx + remaining_len;
    if buf.len() < total {
        return None;
    }
    Some((packet_type, flags, buf[idx..total].to_vec(), total))
}

fn build_connect(client_id: &str, username: &str, password: &str, keep_alive_secs: u16) -> Vec<u8> {
    let mut variable_and_payload = Vec::new();
    encode_string(&mut variable_and_payload, "MQTT");
    variable_and_payload.push(0x04); // protocol level 4 (3.1.1)

    let mut flags = 0x02u8; // clean session
    if !username.is_empty() {
        flags |= 0x80;
    }
    if !password.is_empty() {
        flags |= 0x40;
    }
    variable_and_payload.push(flags);
    variable_and_payload.extend(keep_alive_secs.to_be_bytes());

    encode_string(&mut variable_and_payload, client_id);
    if !username.is_empty() {
        encode_string(&mut variable_and_payload, username);
    }
    if !password.is_empty() {
        encode_string(&mut variable_and_payload, password);
    }

    let mut frame = vec![(PKT_CONNECT << 4)];
    encode_remaining_length(&mut frame, variable_and_payload.len());
    frame.extend(variable_and_payload);
    frame
}

fn build_subscribe(packet_id: u16, topics: &[String]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend(packet_id.to_be_bytes());
    for topic in topics {
        encode_string(&mut body, topic);
        body.push(0x00); // QoS 0
    }
    let mut frame = vec![(PKT_SUBSCRIBE << 4) | 0x02];
    encode_remaining_length(&mut frame, body.len());
    frame.extend(body);
    frame
}

fn build_publish(topic: &str, payload: &[u8], retain: bool) -> Vec<u8> {
    let mut body = Vec::new();
    encode_string(&mut body, topic);
    body.extend_from_slice(payload);
    let mut frame = vec![(PKT_PUBLISH << 4) | if retain { 0x01 } else { 0 }];
    encode_remaining_length(&mut frame, body.len());
    frame.extend(body);
    frame
}

fn build_pingreq() -> Vec<u8> {
    vec![PKT_PINGREQ << 4, 0x00]
}

fn build_disconnect() -> Vec<u8> {
    vec![PKT_DISCONNECT << 4, 0x00]
}

fn parse_publish_payload(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    if payload.len() < 2 {
        return None;
    }
    let topic_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if payload.len() < 2 + topic_len {
        return None;
    }
    let topic = String::from_utf8_lossy(&payload[2..2 + topic_len]).into_owned();
    let data = payload[2 + topic_len..].to_vec();
    Some((topic, data))
}

struct Binding {
    item_id: String,
    state_topics: Vec<String>,
    write_topic: Option<String>,
    read_topic: Option<String>,
    in_pattern: Regex,
    out_pattern: String,
}

impl Binding {
    fn expand(pattern: &str, item_id: &str) -> String {
        pattern.replace(ITEM_ID_TOKEN, item_id)
    }
}

pub struct Mqtt {
    id: String,
    hostname: String,
    port: u16,
    client_id: String,
    username: String,
    password: String,
    retain_flag: bool,
    reconnect_interval: Duration,
    idle_timeout: Duration,
    log_messages: bool,
    sub_topics: Vec<String>,
    bindings: Vec<Binding>,

    stream: Option<TcpStream>,
    connected: bool,
    in_buffer: Vec<u8>,
    last_connect_try: Option<TimePoint>,
    last_activity: TimePoint,
    next_packet_id: u16,
    state: HandlerState,
}

impl Mqtt {
    pub fn new(id: impl Into<String>, config: &MqttConfig) -> Result<Mqtt, ValidationError> {
        let id = id.into();
        if config.tls.is_some() {
            log::warn!(target: "link", "[{id}] TLS is not supported, connecting in plaintext");
        }

        let mut bindings = Vec::with_capacity(config.bindings.len());
        for binding in &config.bindings {
            let in_pattern = Regex::new(&binding.in_pattern)
                .map_err(|err| ValidationError::Link(format!("link {id}: invalid inPattern for {}: {err}", binding.item_id)))?;

            let mut state_topics: Vec<String> = binding.all_state_topics();
            if state_topics.is_empty() {
                if let Some(pattern) = &config.state_topic_pattern {
                    state_topics.push(Binding::expand(pattern, &binding.item_id));
                }
            }
            let write_topic = if !binding.write_topic.is_empty() {
                Some(binding.write_topic.clone())
            } else {
                config.write_topic_pattern.as_ref().map(|p| Binding::expand(p, &binding.item_id))
            };
            let read_topic = if !binding.read_topic.is_empty() {
                Some(binding.read_topic.clone())
            } else {
                config.read_topic_pattern.as_ref().map(|p| Binding::expand(p, &binding.item_id))
            };

            bindings.push(Binding {
                item_id: binding.item_id.clone(),
                state_topics,
                write_topic,
                read_topic,
                in_pattern,
                out_pattern: binding.out_pattern.clone(),
            });
        }

        Ok(Mqtt {
            id,
            hostname: config.hostname.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            retain_flag: config.retain_flag,
            reconnect_interval: Duration::from_secs(config.reconnect_interval),
            idle_timeout: Duration::from_secs(config.idle_timeout),
            log_messages: config.log_messages,
            sub_topics: config.sub_topics.clone(),
            bindings,
            stream: None,
            connected: false,
            in_buffer: Vec::new(),
            last_connect_try: None,
            last_activity: TimePoint(0),
            next_packet_id: 1,
            state: HandlerState::default(),
        })
    }

    fn subscribe_topics(&self) -> Vec<String> {
        let mut topics = self.sub_topics.clone();
        for binding in &self.bindings {
            for topic in &binding.state_topics {
                topics.push(topic.replace(binding.item_id.as_str(), "+"));
            }
            if let Some(topic) = &binding.read_topic {
                topics.push(topic.clone());
            }
        }
        topics
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
            Ok(mut stream) => {
                let keep_alive = self.idle_timeout.as_secs().clamp(1, u16::MAX as u64) as u16;
                let connect = build_connect(&self.client_id, &self.username, &self.password, keep_alive);
                if stream.write_all(&connect).is_err() || stream.set_nonblocking(true).is_err() {
                    self.state.error_counter += 1;
                    return false;
                }
                log::info!(target: "link", "[{}] TCP connected to {}:{}, waiting for CONNACK", self.id, self.hostname, self.port);
                self.stream = Some(stream);
                self.in_buffer.clear();
                self.connected = false;
                self.last_activity = now;
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
        if let Some(mut stream) = self.stream.take() {
            if self.connected {
                let _ = stream.write_all(&build_disconnect());
            }
            log::info!(target: "link", "[{}] disconnected from {}:{}", self.id, self.hostname, self.port);
        }
        self.connected = false;
        self.state.operational = false;
        self.last_connect_try = None;
    }

    fn write_frame(&mut self, frame: &[u8]) {
        if let Some(stream) = self.stream.as_mut() {
            if let Err(err) = stream.write_all(frame) {
                log::error!(target: "link", "[{}] write failed: {err}", self.id);
                self.state.error_counter += 1;
                self.close();
            }
        }
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }

    fn binding_for_topic<'a>(&'a self, topic: &str) -> Option<&'a Binding> {
        self.bindings.iter().find(|b| b.state_topics.iter().any(|t| t == topic))
    }

    fn binding_write_topic<'a>(&'a self, topic: &str) -> Option<&'a Binding> {
        self.bindings.iter().find(|b| b.write_topic.as_deref() == Some(topic))
    }

    fn binding_read_topic<'a>(&'a self, topic: &str) -> Option<&'a Binding> {
        self.bindings.iter().find(|b| b.read_topic.as_deref() == Some(topic))
    }

    fn process_packet(&mut self, packet_type: u8, payload: &[u8], events: &mut Events) {
        match packet_type {
            PKT_CONNACK => {
                if payload.len() >= 2 && payload[1] == 0 {
                    log::info!(target: "link", "[{}] MQTT session established", self.id);
                    self.connected = true;
                    self.state.operational = true;
                    let topics = self.subscribe_topics();
                    if !topics.is_empty() {
                        let packet_id = self.next_packet_id();
                        let frame = build_subscribe(packet_id, &topics);
                        self.write_frame(&frame);
                    }
                } else {
                    log::error!(target: "link", "[{}] CONNACK rejected the session (code {})", self.id, payload.get(1).copied().unwrap_or(0xFF));
                    self.state.error_counter += 1;
                    self.close();
                }
            }
            PKT_PUBLISH => {
                let Some((topic, data)) = parse_publish_payload(payload) else { return };
                let body = String::from_utf8_lossy(&data).into_owned();
                if self.log_messages {
                    log::debug!(target: "link", "[{}] R {topic}: {body}", self.id);
                }
                if let Some(binding) = self.binding_for_topic(&topic) {
                    let value = match binding.in_pattern.captures(&body) {
                        Some(captures) => captures.get(1).map(|m| m.as_str().to_string()).unwrap_or(body.clone()),
                        None => body.clone(),
                    };
                    events.push(Event::new(self.id.clone(), binding.item_id.clone(), EventType::StateInd, Value::new_string(value)));
                } else if let Some(binding) = self.binding_write_topic(&topic) {
                    events.push(Event::new(self.id.clone(), binding.item_id.clone(), EventType::WriteReq, Value::new_string(body)));
                } else if let Some(binding) = self.binding_read_topic(&topic) {
                    events.push(Event::read_req(self.id.clone(), binding.item_id.clone()));
                }
            }
            PKT_SUBACK => {
                log::debug!(target: "link", "[{}] subscriptions acknowledged", self.id);
            }
            PKT_PINGRESP => {}
            _ => {}
        }
    }
}

impl HandlerIf for Mqtt {
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
            item.set_readable(!binding.state_topics.is_empty());
            item.set_writable(binding.write_topic.is_some());
        }
        Ok(())
    }

    fn state(&self) -> HandlerState {
        self.state
    }

    fn collect_wait(&mut self, epoll: &Epoll, token: Token) -> Result<WaitRequest, HandlerError> {
        if !self.open() {
            return Ok(WaitRequest::after(self.reconnect_interval));
        }

        let now = TimePoint::now();
        if self.connected && !self.idle_timeout.is_zero() {
            let half_period = self.idle_timeout.as_secs() as i64 / 2;
            if self.last_activity.epoch_secs() + half_period.max(1) <= now.epoch_secs() {
                self.write_frame(&build_pingreq());
                self.last_activity = now;
            }
        }

        if let Some(stream) = &self.stream {
            let fd: RawFd = stream.as_raw_fd();
            fd.add(epoll, token, Ready::readable(), EpollOpt::edge())
                .or_else(|_| fd.modify(epoll, token, Ready::readable(), EpollOpt::edge()))
                .map_err(|source| HandlerError::Io { link_id: self.id.clone(), source })?;
        }
        Ok(WaitRequest::after(Duration::from_secs(1)))
    }

    fn receive(&mut self, _items: &Items) -> Events {
        let mut events = Events::new();
        let Some(stream) = self.stream.as_mut() else { return events };

        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    log::error!(target: "link", "[{}] broker closed the connection", self.id);
                    self.state.error_counter += 1;
                    self.close();
                    return events;
                }
                Ok(n) => {
                    self.in_buffer.extend_from_slice(&buf[..n]);
                    self.last_activity = TimePoint::now();
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

        while let Some((packet_type, _flags, payload, consumed)) = try_decode_packet(&self.in_buffer) {
            self.in_buffer.drain(..consumed);
            self.process_packet(packet_type, &payload, &mut events);
        }
        events
    }

    fn send(&mut self, _items: &Items, events: &Events) -> Events {
        if !self.connected {
            return Events::new();
        }
        for event in events {
            let Some(binding) = self.bindings.iter().find(|b| b.item_id == event.item_id()) else { continue };
            let topic = match event.event_type() {
                EventType::WriteReq => binding.write_topic.clone(),
                EventType::ReadReq => binding.read_topic.clone(),
                EventType::StateInd => binding.state_topics.first().cloned(),
            };
            let Some(topic) = topic else { continue };
            let payload = match event.event_type() {
                EventType::ReadReq => String::new(),
                _ => binding.out_pattern.replace("%s", &event.value().to_display_string()),
            };
            if self.log_messages {
                log::debug!(target: "link", "[{}] W {topic}: {payload}", self.id);
            }
            let frame = build_publish(&topic, payload.as_bytes(), self.retain_flag);
            self.write_frame(&frame);
        }
        Events::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_length_round_trips_multi_byte() {
        let mut out = Vec::new();
        encode_remaining_length(&mut out, 321);
        assert_eq!(out, vec![0xC1, 0x02]);
    }

    #[test]
    fn decodes_publish_packet() {
        let frame = build_publish("sensors/temp", b"21.5", false);
        let (packet_type, _flags, payload, consumed) = try_decode_packet(&frame).unwrap();
        assert_eq!(packet_type, PKT_PUBLISH);
        assert_eq!(consumed, frame.len());
        let (topic, data) = parse_publish_payload(&payload).unwrap();
        assert_eq!(topic, "sensors/temp");
        assert_eq!(data, b"21.5");
    }

    #[test]
    fn item_id_token_expands_for_publish_and_wildcard_for_subscribe() {
        let expanded = Binding::expand("devices/%ItemId%/state", "boiler");
        assert_eq!(expanded, "devices/boiler/state");
    }

    #[test]
    fn incomplete_packet_returns_none() {
        let frame = build_publish("a/b", b"hello", false);
        assert!(try_decode_packet(&frame[..frame.len() - 1]).is_none());
    }
}
