//! KNXnet/IP tunnelling over UDP: the DISCONNECTED -> WAIT_FOR_CONN_RESP ->
//! CONNECTED state machine, a periodic connection-state keep-alive, 8-bit
//! wrapping sender/receiver sequence numbers, one in-flight `L_Data.req`
//! gated on its `.con`, NAT mode, and DPT 1/5/7/9/12/13/14 encode/decode.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::config::{KnxBindingConfig, KnxConfig};
use crate::epoll::{Epoll, EpollOpt, Ready, Source, Token};
use crate::error::{HandlerError, ValidationError};
use crate::event::{Event, EventType, Events};
use crate::item::Items;
use crate::value::{TimePoint, Value};

use super::{HandlerIf, HandlerState, WaitRequest};

const HEADER_LEN: usize = 6;
const SVC_CONNECT_REQUEST: u16 = 0x0205;
const SVC_CONNECT_RESPONSE: u16 = 0x0206;
const SVC_CONNECTIONSTATE_REQUEST: u16 = 0x0207;
const SVC_CONNECTIONSTATE_RESPONSE: u16 = 0x0208;
const SVC_DISCONNECT_REQUEST: u16 = 0x0209;
const SVC_DISCONNECT_RESPONSE: u16 = 0x020A;
const SVC_TUNNELING_REQUEST: u16 = 0x0420;
const SVC_TUNNELING_ACK: u16 = 0x0421;

const MC_LDATA_REQ: u8 = 0x11;
const MC_LDATA_IND: u8 = 0x29;
const MC_LDATA_CON: u8 = 0x2E;

const APCI_GROUP_VALUE_READ: u16 = 0x000;
const APCI_GROUP_VALUE_RESPONSE: u16 = 0x040;
const APCI_GROUP_VALUE_WRITE: u16 = 0x080;

/// Maps a KNX DPT major number onto a wire encoding. The minor number
/// (scaling, unit) is not modelled: the core only needs a lossless
/// number/boolean <-> octet mapping, unit conversion happens in the link
/// layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DptKind {
    Bool,
    Unsigned8,
    Unsigned16,
    Float16,
    Unsigned32,
    Signed32,
    Float32,
}

fn dpt_kind(dpt: &str) -> Option<DptKind> {
    let major: u8 = dpt.split('.').next()?.parse().ok()?;
    Some(match major {
        1 => DptKind::Bool,
        5 => DptKind::Unsigned8,
        7 => DptKind::Unsigned16,
        9 => DptKind::Float16,
        12 => DptKind::Unsigned32,
        13 => DptKind::Signed32,
        14 => DptKind::Float32,
        _ => return None,
    })
}

fn encode_knx_float16(n: f64) -> u16 {
    let mut mantissa = n * 100.0;
    let mut exponent = 0u8;
    while mantissa < -2048.0 || mantissa > 2047.0 {
        mantissa /= 2.0;
        exponent += 1;
    }
    let mantissa = mantissa.round() as i32;
    let sign = if mantissa < 0 { 0x8000u16 } else { 0 };
    let mantissa = (mantissa & 0x07FF) as u16;
    sign | ((exponent as u16) << 11) | mantissa
}

fn decode_knx_float16(raw: u16) -> f64 {
    let sign = raw & 0x8000 != 0;
    let exponent = (raw >> 11) & 0x0F;
    let mantissa_bits = raw & 0x07FF;
    let mantissa = if sign { -((!mantissa_bits & 0x07FF) as i32 + 1) } else { mantissa_bits as i32 };
    (mantissa as f64) * 0.01 * 2f64.powi(exponent as i32)
}

/// Encodes a value into the 2 (short) or 2+N (long) byte TPCI/APCI sequence
/// a `GroupValue*` cEMI APDU carries.
fn encode_apdu(kind: DptKind, apci: u16, value: &Value) -> Option<Vec<u8>> {
    let byte0 = ((apci >> 8) as u8) & 0x03;
    Some(match kind {
        DptKind::Bool => {
            let b = value.as_boolean()?;
            let byte1 = ((apci & 0xC0) as u8) | if b { 1 } else { 0 };
            vec![byte0, byte1]
        }
        DptKind::Unsigned8 => {
            let n = value.as_number()?.clamp(0.0, 255.0) as u8;
            vec![byte0, (apci & 0xC0) as u8, n]
        }
        DptKind::Unsigned16 => {
            let n = value.as_number()?.clamp(0.0, 65535.0) as u16;
            let [hi, lo] = n.to_be_bytes();
            vec![byte0, (apci & 0xC0) as u8, hi, lo]
        }
        DptKind::Float16 => {
            let raw = encode_knx_float16(value.as_number()?);
            let [hi, lo] = raw.to_be_bytes();
            vec![byte0, (apci & 0xC0) as u8, hi, lo]
        }
        DptKind::Unsigned32 => {
            let n = value.as_number()?.clamp(0.0, u32::MAX as f64) as u32;
            let bytes = n.to_be_bytes();
            vec![byte0, (apci & 0xC0) as u8, bytes[0], bytes[1], bytes[2], bytes[3]]
        }
        DptKind::Signed32 => {
            let n = value.as_number()?.clamp(i32::MIN as f64, i32::MAX as f64) as i32;
            let bytes = n.to_be_bytes();
            vec![byte0, (apci & 0xC0) as u8, bytes[0], bytes[1], bytes[2], bytes[3]]
        }
        DptKind::Float32 => {
            let bytes = (value.as_number()? as f32).to_be_bytes();
            vec![byte0, (apci & 0xC0) as u8, bytes[0], bytes[1], bytes[2], bytes[3]]
        }
    })
}

fn decode_apdu(kind: DptKind, apdu: &[u8]) -> Option<Value> {
    if apdu.len() < 2 {
        return None;
    }
    Some(match kind {
        DptKind::Bool => Value::new_boolean(apdu[1] & 0x01 != 0),
        DptKind::Unsigned8 => Value::new_number(*apdu.get(2)? as f64),
        DptKind::Unsigned16 => Value::new_number(u16::from_be_bytes([*apdu.get(2)?, *apdu.get(3)?]) as f64),
        DptKind::Float16 => Value::new_number(decode_knx_float16(u16::from_be_bytes([*apdu.get(2)?, *apdu.get(3)?]))),
        DptKind::Unsigned32 => Value::new_number(
            u32::from_be_bytes([*apdu.get(2)?, *apdu.get(3)?, *apdu.get(4)?, *apdu.get(5)?]) as f64,
        ),
        DptKind::Signed32 => Value::new_number(
            i32::from_be_bytes([*apdu.get(2)?, *apdu.get(3)?, *apdu.get(4)?, *apdu.get(5)?]) as f64,
        ),
        DptKind::Float32 => Value::new_number(
            f32::from_be_bytes([*apdu.get(2)?, *apdu.get(3)?, *apdu.get(4)?, *apdu.get(5)?]) as f64,
        ),
    })
}

fn apci_of(apdu: &[u8]) -> u16 {
    (((apdu[0] & 0x03) as u16) << 8) | ((apdu[1] & 0xC0) as u16)
}

fn parse_ga(s: &str) -> Option<u16> {
    let mut parts = s.split('/');
    let main: u16 = parts.next()?.parse().ok()?;
    let middle: u16 = parts.next()?.parse().ok()?;
    let sub: u16 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || main > 31 || middle > 7 || sub > 255 {
        return None;
    }
    Some((main << 11) | (middle << 8) | sub)
}

fn parse_pa(s: &str) -> Option<u16> {
    let mut parts = s.split('.');
    let area: u16 = parts.next()?.parse().ok()?;
    let line: u16 = parts.next()?.parse().ok()?;
    let device: u16 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || area > 15 || line > 15 || device > 255 {
        return None;
    }
    Some((area << 12) | (line << 8) | device)
}

fn build_header(service: u16, body_len: usize) -> Vec<u8> {
    let total = HEADER_LEN + body_len;
    vec![0x06, 0x10, (service >> 8) as u8, service as u8, (total >> 8) as u8, total as u8]
}

fn build_hpai() -> Vec<u8> {
    // HPAI with 0.0.0.0:0 — the actual source is learned by the gateway from
    // the UDP datagram itself, the common pattern for NAT-friendly clients.
    vec![0x08, 0x01, 0, 0, 0, 0, 0, 0]
}

/// Parses a returned HPAI structure (`len, type, ip[4], port[2]`) into a
/// socket address. `None` if the structure is truncated.
fn parse_hpai(body: &[u8]) -> Option<SocketAddr> {
    if body.len() < 8 {
        return None;
    }
    let ip = Ipv4Addr::new(body[2], body[3], body[4], body[5]);
    let port = u16::from_be_bytes([body[6], body[7]]);
    Some(SocketAddr::from((ip, port)))
}

fn build_connect_request() -> Vec<u8> {
    let mut body = build_hpai();
    body.extend(build_hpai());
    body.extend([0x04, 0x04, 0x02, 0x00]); // CRI: len 4, TUNNEL_CONNECTION, TUNNEL_LINKLAYER, reserved
    let mut frame = build_header(SVC_CONNECT_REQUEST, body.len());
    frame.extend(body);
    frame
}

fn build_connectionstate_request(channel_id: u8) -> Vec<u8> {
    let mut body = vec![channel_id, 0x00];
    body.extend(build_hpai());
    let mut frame = build_header(SVC_CONNECTIONSTATE_REQUEST, body.len());
    frame.extend(body);
    frame
}

fn build_disconnect_request(channel_id: u8) -> Vec<u8> {
    let mut body = vec![channel_id, 0x00];
    body.extend(build_hpai());
    let mut frame = build_header(SVC_DISCONNECT_REQUEST, body.len());
    frame.extend(body);
    frame
}

fn build_ldata_req(src_pa: u16, dest_ga: u16, apdu: &[u8]) -> Vec<u8> {
    let mut cemi = vec![MC_LDATA_REQ, 0x00, 0xBC, 0xE0];
    cemi.extend(src_pa.to_be_bytes());
    cemi.extend(dest_ga.to_be_bytes());
    cemi.push((apdu.len() - 1) as u8);
    cemi.extend_from_slice(apdu);
    cemi
}

fn build_tunneling_request(channel_id: u8, seq: u8, cemi: &[u8]) -> Vec<u8> {
    let mut body = vec![0x04, channel_id, seq, 0x00];
    body.extend_from_slice(cemi);
    let mut frame = build_header(SVC_TUNNELING_REQUEST, body.len());
    frame.extend(body);
    frame
}

fn build_tunneling_ack(channel_id: u8, seq: u8) -> Vec<u8> {
    let body = vec![0x04, channel_id, seq, 0x00];
    let mut frame = build_header(SVC_TUNNELING_ACK, body.len());
    frame.extend(body);
    frame
}

struct CemiFrame {
    msg_code: u8,
    src_pa: u16,
    dest_ga: u16,
    apdu: Vec<u8>,
}

fn parse_cemi(bytes: &[u8]) -> Option<CemiFrame> {
    if bytes.len() < 2 {
        return None;
    }
    let msg_code = bytes[0];
    let addl_len = bytes[1] as usize;
    let idx = 2 + addl_len;
    if bytes.len() < idx + 7 {
        return None;
    }
    let src_pa = u16::from_be_bytes([bytes[idx + 2], bytes[idx + 3]]);
    let dest_ga = u16::from_be_bytes([bytes[idx + 4], bytes[idx + 5]]);
    let npdu_len = bytes[idx + 6] as usize;
    let apdu_start = idx + 7;
    let apdu_end = apdu_start + npdu_len + 1;
    if bytes.len() < apdu_end {
        return None;
    }
    Some(CemiFrame { msg_code, src_pa, dest_ga, apdu: bytes[apdu_start..apdu_end].to_vec() })
}

enum ParsedFrame {
    ConnectResponse { channel_id: u8, accepted: bool, data_endpoint: Option<SocketAddr> },
    ConnectionStateResponse { channel_id: u8, accepted: bool },
    TunnelingRequest { channel_id: u8, seq: u8, cemi: CemiFrame },
    TunnelingAck { channel_id: u8, seq: u8 },
    Other,
}

fn parse_frame(datagram: &[u8]) -> Option<ParsedFrame> {
    if datagram.len() < HEADER_LEN || datagram[0] != 0x06 {
        return None;
    }
    let service = u16::from_be_bytes([datagram[2], datagram[3]]);
    let body = &datagram[HEADER_LEN..];
    Some(match service {
        SVC_CONNECT_RESPONSE if body.len() >= 2 => {
            ParsedFrame::ConnectResponse {
                channel_id: body[0],
                accepted: body[1] == 0,
                data_endpoint: parse_hpai(&body[2..]),
            }
        }
        SVC_CONNECTIONSTATE_RESPONSE if body.len() >= 2 => {
            ParsedFrame::ConnectionStateResponse { channel_id: body[0], accepted: body[1] == 0 }
        }
        SVC_TUNNELING_REQUEST if body.len() >= 4 => {
            let cemi = parse_cemi(&body[4..])?;
            ParsedFrame::TunnelingRequest { channel_id: body[1], seq: body[2], cemi }
        }
        SVC_TUNNELING_ACK if body.len() >= 4 => ParsedFrame::TunnelingAck { channel_id: body[1], seq: body[2] },
        _ => ParsedFrame::Other,
    })
}

enum ConnState {
    Disconnected { last_attempt: Option<TimePoint> },
    WaitForConnResp { sent_at: TimePoint },
    Connected { channel_id: u8, last_keepalive: TimePoint, awaiting_keepalive: bool },
}

struct Binding {
    item_id: String,
    state_ga: Option<u16>,
    write_ga: Option<u16>,
    kind: DptKind,
}

struct PendingWrite {
    ga: u16,
    apdu: Vec<u8>,
    sent_at: Option<TimePoint>,
}

pub struct Knx {
    id: String,
    local_ip_addr: std::net::IpAddr,
    ip_addr: std::net::IpAddr,
    ip_port: u16,
    nat_mode: bool,
    /// Address subsequent unicast requests (tunnelling, keep-alive,
    /// disconnect) are sent to. Starts at the configured gateway address and
    /// is updated from the CONNECT_RESPONSE's data-endpoint HPAI once
    /// connected (see `process_datagram`).
    peer_addr: SocketAddr,
    reconnect_interval: Duration,
    conn_state_req_interval: Duration,
    control_resp_timeout: Duration,
    ldata_con_timeout: Duration,
    physical_addr: u16,
    bindings: Vec<Binding>,

    socket: Option<UdpSocket>,
    state: ConnState,
    send_seq: u8,
    recv_seq: u8,
    outgoing: VecDeque<PendingWrite>,
    inflight: Option<PendingWrite>,
    handler_state: HandlerState,
}

impl Knx {
    pub fn new(id: impl Into<String>, config: &KnxConfig) -> Result<Knx, ValidationError> {
        let id = id.into();
        let physical_addr = parse_pa(&config.physical_addr)
            .ok_or_else(|| ValidationError::Link(format!("link {id}: invalid physicalAddr '{}'", config.physical_addr)))?;

        let mut bindings = Vec::with_capacity(config.bindings.len());
        for binding in &config.bindings {
            bindings.push(Self::parse_binding(&id, binding, config.allow_equal_state_and_write_ga)?);
        }

        Ok(Knx {
            id,
            local_ip_addr: config.local_ip_addr,
            ip_addr: config.ip_addr,
            ip_port: config.ip_port,
            nat_mode: config.nat_mode,
            peer_addr: SocketAddr::new(config.ip_addr, config.ip_port),
            reconnect_interval: Duration::from_secs(config.reconnect_interval),
            conn_state_req_interval: Duration::from_secs(config.conn_state_req_interval),
            control_resp_timeout: Duration::from_secs(config.control_resp_timeout),
            ldata_con_timeout: Duration::from_secs(config.ldata_con_timeout),
            physical_addr,
            bindings,
            socket: None,
            state: ConnState::Disconnected { last_attempt: None },
            send_seq: 0,
            recv_seq: 0,
            outgoing: VecDeque::new(),
            inflight: None,
            handler_state: HandlerState::default(),
        })
    }

    fn parse_binding(id: &str, binding: &KnxBindingConfig, allow_equal: bool) -> Result<Binding, ValidationError> {
        let state_ga = binding
            .state_ga
            .as_ref()
            .map(|s| parse_ga(s).ok_or_else(|| ValidationError::Link(format!("link {id}: invalid stateGa '{s}'"))))
            .transpose()?;
        let write_ga = binding
            .write_ga
            .as_ref()
            .map(|s| parse_ga(s).ok_or_else(|| ValidationError::Link(format!("link {id}: invalid writeGa '{s}'"))))
            .transpose()?;
        if !allow_equal {
            if let (Some(s), Some(w)) = (state_ga, write_ga) {
                if s == w {
                    return Err(ValidationError::Link(format!(
                        "link {id}: item {} has equal stateGa and writeGa; set allowEqualStateAndWriteGa to permit this",
                        binding.item_id
                    )));
                }
            }
        }
        let kind = dpt_kind(&binding.dpt)
            .ok_or_else(|| ValidationError::Link(format!("link {id}: unsupported dpt '{}'", binding.dpt)))?;
        Ok(Binding { item_id: binding.item_id.clone(), state_ga, write_ga, kind })
    }

    fn open(&mut self) -> bool {
        if self.socket.is_some() {
            return true;
        }
        match UdpSocket::bind((self.local_ip_addr, 0)) {
            Ok(socket) => {
                if socket.set_nonblocking(true).is_err() {
                    self.handler_state.error_counter += 1;
                    return false;
                }
                self.peer_addr = SocketAddr::new(self.ip_addr, self.ip_port);
                let frame = build_connect_request();
                let _ = socket.send_to(&frame, self.peer_addr);
                self.socket = Some(socket);
                self.state = ConnState::WaitForConnResp { sent_at: TimePoint::now() };
                true
            }
            Err(err) => {
                log::error!(target: "link", "[{}] failed to open UDP socket: {err}", self.id);
                self.handler_state.error_counter += 1;
                false
            }
        }
    }

    fn reset(&mut self, now: TimePoint) {
        if let (Some(socket), ConnState::Connected { channel_id, .. }) = (&self.socket, &self.state) {
            let _ = socket.send_to(&build_disconnect_request(*channel_id), self.peer_addr);
        }
        self.socket = None;
        self.state = ConnState::Disconnected { last_attempt: Some(now) };
        self.handler_state.operational = false;
        self.outgoing.clear();
        self.inflight = None;
    }

    fn send_datagram(&self, frame: &[u8]) {
        if let Some(socket) = &self.socket {
            let _ = socket.send_to(frame, self.peer_addr);
        }
    }

    fn pump_outgoing(&mut self, channel_id: u8) {
        if self.inflight.is_some() {
            return;
        }
        let Some(mut pending) = self.outgoing.pop_front() else { return };
        let cemi = build_ldata_req(self.physical_addr, pending.ga, &pending.apdu);
        let frame = build_tunneling_request(channel_id, self.send_seq, &cemi);
        self.send_datagram(&frame);
        self.send_seq = self.send_seq.wrapping_add(1);
        pending.sent_at = Some(TimePoint::now());
        self.inflight = Some(pending);
    }

    fn binding_for_ga(&self, ga: u16) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.state_ga == Some(ga) || b.write_ga == Some(ga))
    }

    fn process_datagram(&mut self, datagram: &[u8], sender_addr: SocketAddr, events: &mut Events) {
        let Some(frame) = parse_frame(datagram) else { return };
        let now = TimePoint::now();
        match frame {
            ParsedFrame::ConnectResponse { channel_id, accepted, data_endpoint } => {
                if matches!(self.state, ConnState::WaitForConnResp { .. }) {
                    if accepted {
                        log::info!(target: "link", "[{}] KNX tunnel connected, channel {channel_id}", self.id);
                        self.state = ConnState::Connected { channel_id, last_keepalive: now, awaiting_keepalive: false };
                        self.handler_state.operational = true;
                        self.recv_seq = 0;
                        self.send_seq = 0;
                        // NAT mode: a returned endpoint of 0.0.0.0:0 means "use
                        // the address you just saw this reply come from"; with
                        // nat_mode off we trust the gateway's advertised data
                        // endpoint even when it differs from sender_addr.
                        self.peer_addr = match data_endpoint {
                            Some(addr) if !self.nat_mode && !addr.ip().is_unspecified() && addr.port() != 0 => addr,
                            _ => sender_addr,
                        };
                    } else {
                        log::error!(target: "link", "[{}] KNX CONNECT_REQUEST rejected", self.id);
                        self.handler_state.error_counter += 1;
                        self.reset(now);
                    }
                }
            }
            ParsedFrame::ConnectionStateResponse { channel_id, accepted } => {
                if let ConnState::Connected { channel_id: cid, awaiting_keepalive, .. } = &mut self.state {
                    if *cid == channel_id {
                        if accepted {
                            *awaiting_keepalive = false;
                        } else {
                            log::error!(target: "link", "[{}] KNX connection-state request rejected", self.id);
                            self.handler_state.error_counter += 1;
                            self.reset(now);
                        }
                    }
                }
            }
            ParsedFrame::TunnelingRequest { channel_id, seq, cemi } => {
                let Some(expected_channel) = (if let ConnState::Connected { channel_id, .. } = &self.state {
                    Some(*channel_id)
                } else {
                    None
                }) else {
                    return;
                };
                if channel_id != expected_channel {
                    return;
                }
                if seq == self.recv_seq {
                    self.send_datagram(&build_tunneling_ack(channel_id, seq));
                    self.recv_seq = self.recv_seq.wrapping_add(1);
                    self.handle_cemi(&cemi, events);
                } else if seq == self.recv_seq.wrapping_sub(1) {
                    // duplicate retransmit: re-ack, don't reprocess.
                    self.send_datagram(&build_tunneling_ack(channel_id, seq));
                } else {
                    log::warn!(target: "link", "[{}] out-of-sequence tunnelling request: got {seq}, expected {}", self.id, self.recv_seq);
                }
            }
            ParsedFrame::TunnelingAck { seq, .. } => {
                if self.inflight.as_ref().map(|p| p.sent_at.is_some()).unwrap_or(false) && self.send_seq.wrapping_sub(1) == seq {
                    // transport-layer ack; the L_Data.con (below) is what
                    // actually frees the in-flight slot.
                }
            }
            ParsedFrame::Other => {}
        }
    }

    fn handle_cemi(&mut self, cemi: &CemiFrame, events: &mut Events) {
        if cemi.msg_code == MC_LDATA_CON {
            if let Some(pending) = &self.inflight {
                if pending.ga == cemi.dest_ga {
                    self.inflight = None;
                }
            }
            return;
        }
        if cemi.msg_code != MC_LDATA_IND {
            return;
        }
        let apci = apci_of(&cemi.apdu);
        if apci != APCI_GROUP_VALUE_WRITE && apci != APCI_GROUP_VALUE_RESPONSE {
            return;
        }
        let Some(binding) = self.binding_for_ga(cemi.dest_ga) else { return };
        let Some(value) = decode_apdu(binding.kind, &cemi.apdu) else {
            log::error!(target: "link", "[{}] failed to decode DPT payload for item {}", self.id, binding.item_id);
            return;
        };
        events.push(Event::new(self.id.clone(), binding.item_id.clone(), EventType::StateInd, value));
    }
}

impl HandlerIf for Knx {
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
            item.set_readable(binding.state_ga.is_some());
            item.set_writable(binding.write_ga.is_some());
            if binding.state_ga.is_some() && binding.state_ga == binding.write_ga {
                item.set_responsive(true);
            }
        }
        Ok(())
    }

    fn state(&self) -> HandlerState {
        self.handler_state
    }

    fn collect_wait(&mut self, epoll: &Epoll, token: Token) -> Result<WaitRequest, HandlerError> {
        let now = TimePoint::now();

        if let Some(pending) = &self.inflight {
            if let Some(sent_at) = pending.sent_at {
                if sent_at.epoch_secs() + self.ldata_con_timeout.as_secs() as i64 <= now.epoch_secs() {
                    self.inflight = None;
                }
            }
        }
        if let ConnState::Connected { channel_id, .. } = self.state {
            self.pump_outgoing(channel_id);
        }

        match &self.state {
            ConnState::Disconnected { last_attempt } => {
                let due = last_attempt
                    .map(|t| t.epoch_secs() + self.reconnect_interval.as_secs() as i64 <= now.epoch_secs())
                    .unwrap_or(true);
                if due && self.open() {
                    let fd: RawFd = self.socket.as_ref().unwrap().as_raw_fd();
                    fd.add(epoll, token, Ready::readable(), EpollOpt::edge())
                        .map_err(|source| HandlerError::Io { link_id: self.id.clone(), source })?;
                }
                Ok(WaitRequest::after(self.reconnect_interval.min(Duration::from_secs(1))))
            }
            ConnState::WaitForConnResp { sent_at } => {
                if sent_at.epoch_secs() + self.control_resp_timeout.as_secs() as i64 <= now.epoch_secs() {
                    log::error!(target: "link", "[{}] no CONNECT_RESPONSE within controlRespTimeout", self.id);
                    self.handler_state.error_counter += 1;
                    self.reset(now);
                }
                Ok(WaitRequest::after(Duration::from_millis(200)))
            }
            ConnState::Connected { channel_id, last_keepalive, awaiting_keepalive } => {
                let (channel_id, last_keepalive, awaiting_keepalive) = (*channel_id, *last_keepalive, *awaiting_keepalive);
                if !awaiting_keepalive
                    && last_keepalive.epoch_secs() + self.conn_state_req_interval.as_secs() as i64 <= now.epoch_secs()
                {
                    self.send_datagram(&build_connectionstate_request(channel_id));
                    if let ConnState::Connected { last_keepalive, awaiting_keepalive, .. } = &mut self.state {
                        *last_keepalive = now;
                        *awaiting_keepalive = true;
                    }
                } else if awaiting_keepalive
                    && last_keepalive.epoch_secs() + self.control_resp_timeout.as_secs() as i64 <= now.epoch_secs()
                {
                    log::error!(target: "link", "[{}] connection-state keep-alive timed out", self.id);
                    self.handler_state.error_counter += 1;
                    self.reset(now);
                }
                Ok(WaitRequest::after(Duration::from_millis(200)))
            }
        }
    }

    fn receive(&mut self, _items: &Items) -> Events {
        let mut events = Events::new();
        if self.socket.is_none() {
            return events;
        }

        let mut buf = [0u8; 512];
        loop {
            let socket = self.socket.as_ref().unwrap();
            match socket.recv_from(&mut buf) {
                Ok((n, sender_addr)) => self.process_datagram(&buf[..n], sender_addr, &mut events),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::error!(target: "link", "[{}] UDP receive error: {err}", self.id);
                    self.handler_state.error_counter += 1;
                    self.reset(TimePoint::now());
                    break;
                }
            }
        }

        if let ConnState::Connected { channel_id, .. } = self.state {
            self.pump_outgoing(channel_id);
        }
        events
    }

    fn send(&mut self, _items: &Items, events: &Events) -> Events {
        for event in events {
            let Some(binding) = self.bindings.iter().find(|b| b.item_id == event.item_id()) else { continue };
            match event.event_type() {
                EventType::WriteReq => {
                    let Some(ga) = binding.write_ga else { continue };
                    let Some(apdu) = encode_apdu(binding.kind, APCI_GROUP_VALUE_WRITE, event.value()) else {
                        log::error!(target: "link", "[{}] cannot encode value for item {}", self.id, binding.item_id);
                        continue;
                    };
                    self.outgoing.push_back(PendingWrite { ga, apdu, sent_at: None });
                }
                EventType::ReadReq => {
                    let Some(ga) = binding.state_ga else { continue };
                    let apdu = vec![0, 0];
                    self.outgoing.push_back(PendingWrite { ga, apdu, sent_at: None });
                }
                EventType::StateInd => {}
            }
        }
        if let ConnState::Connected { channel_id, .. } = self.state {
            self.pump_outgoing(channel_id);
        }
        Events::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_address_round_trips() {
        assert_eq!(parse_ga("1/2/3"), Some((1u16 << 11) | (2 << 8) | 3));
    }

    #[test]
    fn physical_address_round_trips() {
        assert_eq!(parse_pa("1.1.0"), Some((1u16 << 12) | (1 << 8) | 0));
    }

    #[test]
    fn dpt1_boolean_round_trips() {
        let apdu = encode_apdu(DptKind::Bool, APCI_GROUP_VALUE_WRITE, &Value::new_boolean(true)).unwrap();
        assert_eq!(decode_apdu(DptKind::Bool, &apdu), Some(Value::new_boolean(true)));
    }

    #[test]
    fn encode_apdu_stamps_apci_bits_for_every_dpt_kind() {
        for kind in
            [DptKind::Bool, DptKind::Unsigned8, DptKind::Unsigned16, DptKind::Float16, DptKind::Unsigned32, DptKind::Signed32, DptKind::Float32]
        {
            let value = match kind {
                DptKind::Bool => Value::new_boolean(true),
                _ => Value::new_number(1.0),
            };
            let write = encode_apdu(kind, APCI_GROUP_VALUE_WRITE, &value).unwrap();
            assert_eq!(apci_of(&write), APCI_GROUP_VALUE_WRITE, "{kind:?} write");
            let response = encode_apdu(kind, APCI_GROUP_VALUE_RESPONSE, &value).unwrap();
            assert_eq!(apci_of(&response), APCI_GROUP_VALUE_RESPONSE, "{kind:?} response");
        }
    }

    #[test]
    fn dpt9_float_round_trips_within_resolution() {
        let apdu = encode_apdu(DptKind::Float16, APCI_GROUP_VALUE_WRITE, &Value::new_number(21.5)).unwrap();
        let decoded = decode_apdu(DptKind::Float16, &apdu).unwrap().as_number().unwrap();
        assert!((decoded - 21.5).abs() < 0.02);
    }

    #[test]
    fn dpt13_signed_round_trips() {
        let apdu = encode_apdu(DptKind::Signed32, APCI_GROUP_VALUE_WRITE, &Value::new_number(-42.0)).unwrap();
        assert_eq!(decode_apdu(DptKind::Signed32, &apdu), Some(Value::new_number(-42.0)));
    }

    #[test]
    fn sequence_numbers_wrap_at_255() {
        let mut seq: u8 = 255;
        seq = seq.wrapping_add(1);
        assert_eq!(seq, 0);
    }

    #[test]
    fn handshake_timeout_resets_to_disconnected_and_counts_error() {
        let config = KnxConfig {
            local_ip_addr: "127.0.0.1".parse().unwrap(),
            nat_mode: false,
            ip_addr: "127.0.0.1".parse().unwrap(),
            ip_port: 3671,
            reconnect_interval: 5,
            conn_state_req_interval: 60,
            control_resp_timeout: 0,
            tunnel_ack_timeout: 1,
            ldata_con_timeout: 3,
            physical_addr: "0.0.0".into(),
            log_raw_messages: false,
            log_data: false,
            allow_equal_state_and_write_ga: false,
            bindings: Vec::new(),
        };
        let mut knx = Knx::new("knx", &config).unwrap();
        knx.state = ConnState::WaitForConnResp { sent_at: TimePoint(0) };

        let epoll = Epoll::new().unwrap();
        knx.collect_wait(&epoll, Token(0)).unwrap();

        assert!(matches!(knx.state, ConnState::Disconnected { last_attempt: Some(_) }));
        assert_eq!(knx.handler_state.error_counter, 1);
    }

    fn base_config() -> KnxConfig {
        KnxConfig {
            local_ip_addr: "127.0.0.1".parse().unwrap(),
            nat_mode: false,
            ip_addr: "127.0.0.1".parse().unwrap(),
            ip_port: 3671,
            reconnect_interval: 5,
            conn_state_req_interval: 60,
            control_resp_timeout: 5,
            tunnel_ack_timeout: 1,
            ldata_con_timeout: 3,
            physical_addr: "0.0.0".into(),
            log_raw_messages: false,
            log_data: false,
            allow_equal_state_and_write_ga: false,
            bindings: Vec::new(),
        }
    }

    #[test]
    fn non_nat_mode_adopts_advertised_data_endpoint() {
        let config = base_config();
        let mut knx = Knx::new("knx", &config).unwrap();
        knx.state = ConnState::WaitForConnResp { sent_at: TimePoint::now() };
        let sender_addr: SocketAddr = "10.0.0.1:3671".parse().unwrap();
        let advertised: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let mut events = Events::new();
        knx.process_datagram(
            &{
                let mut body = vec![0x11, 0x00];
                body.extend(parse_hpai_bytes(advertised));
                let mut frame = build_header(SVC_CONNECT_RESPONSE, body.len());
                frame.extend(body);
                frame
            },
            sender_addr,
            &mut events,
        );
        assert_eq!(knx.peer_addr, advertised);
    }

    #[test]
    fn nat_mode_ignores_advertised_endpoint_and_uses_sender() {
        let mut config = base_config();
        config.nat_mode = true;
        let mut knx = Knx::new("knx", &config).unwrap();
        knx.state = ConnState::WaitForConnResp { sent_at: TimePoint::now() };
        let sender_addr: SocketAddr = "10.0.0.1:3671".parse().unwrap();
        let advertised: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let mut events = Events::new();
        knx.process_datagram(
            &{
                let mut body = vec![0x11, 0x00];
                body.extend(parse_hpai_bytes(advertised));
                let mut frame = build_header(SVC_CONNECT_RESPONSE, body.len());
                frame.extend(body);
                frame
            },
            sender_addr,
            &mut events,
        );
        assert_eq!(knx.peer_addr, sender_addr);
    }

    #[test]
    fn zero_advertised_endpoint_falls_back_to_sender_even_without_nat_mode() {
        let config = base_config();
        let mut knx = Knx::new("knx", &config).unwrap();
        knx.state = ConnState::WaitForConnResp { sent_at: TimePoint::now() };
        let sender_addr: SocketAddr = "10.0.0.1:3671".parse().unwrap();
        let mut events = Events::new();
        knx.process_datagram(
            &{
                let mut body = vec![0x11, 0x00];
                body.extend(build_hpai());
                let mut frame = build_header(SVC_CONNECT_RESPONSE, body.len());
                frame.extend(body);
                frame
            },
            sender_addr,
            &mut events,
        );
        assert_eq!(knx.peer_addr, sender_addr);
    }

    fn parse_hpai_bytes(addr: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = addr else { panic!("ipv4 only in tests") };
        let mut bytes = vec![0x08, 0x01];
        bytes.extend(v4.ip().octets());
        bytes.extend(v4.port().to_be_bytes());
        bytes
    }

    #[test]
    fn tunneling_request_round_trips_through_cemi() {
        let apdu = encode_apdu(DptKind::Bool, APCI_GROUP_VALUE_WRITE, &Value::new_boolean(true)).unwrap();
        let cemi = build_ldata_req(0x1100, 0x0203, &apdu);
        let frame = build_tunneling_request(1, 5, &cemi);
        let ParsedFrame::TunnelingRequest { channel_id, seq, cemi: parsed } = parse_frame(&frame).unwrap() else {
            panic!("expected tunneling request")
        };
        assert_eq!(channel_id, 1);
        assert_eq!(seq, 5);
        assert_eq!(parsed.src_pa, 0x1100);
        assert_eq!(parsed.dest_ga, 0x0203);
        assert_eq!(decode_apdu(DptKind::Bool, &parsed.apdu), Some(Value::new_boolean(true)));
    }
}
