//! Adapts events between the engine's canonical item model and whatever
//! shape a handler's external system speaks: ownership/writability
//! filtering, OBIS/JSON/regex extraction, type and unit coercion, and
//! per-item value mapping, in both directions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use regex::Regex;

use crate::config::{
    BooleanAsStringConfig, LinkConfig, ModifierConfig, VoidAsStringConfig,
};
use crate::epoll::{Epoll, Token};
use crate::error::{HandlerError, ValidationError};
use crate::event::{Event, EventType, Events, CONTROL_LINK_ID};
use crate::handler::{HandlerIf, HandlerState, WaitRequest};
use crate::item::Items;
use crate::sml::{SmlFile, SmlNode};
use crate::unit::Unit;
use crate::value::{TimePoint, Value, ValueType};

fn round_to(n: f64, precision: u32) -> f64 {
    let p = 10f64.powi(precision as i32);
    (n * p).round() / p
}

fn format_time_point(tp: TimePoint, format: &str) -> String {
    Utc.timestamp_opt(tp.epoch_secs(), 0)
        .single()
        .map(|dt| dt.format(format).to_string())
        .unwrap_or_default()
}

fn parse_time_point(s: &str, format: &str) -> Option<TimePoint> {
    let naive = chrono::NaiveDateTime::parse_from_str(s, format).ok()?;
    Some(TimePoint(naive.and_utc().timestamp()))
}

struct OutMapping {
    minimum: Option<f64>,
    maximum: Option<f64>,
    equals: Option<String>,
    replacement: String,
}

/// Alteration rules applied to events for a single item as they cross a
/// link, in both directions.
struct Modifier {
    unit: Unit,
    factor: f64,
    summand: f64,
    round_precision: Option<u32>,
    in_obis_code: Option<Vec<u8>>,
    in_json_pointer: Option<String>,
    in_pattern: Option<Regex>,
    in_mappings: HashMap<String, String>,
    out_mappings: Vec<OutMapping>,
}

impl Modifier {
    fn from_config(link_id: &str, config: &ModifierConfig) -> Result<Modifier, ValidationError> {
        let unit = match &config.unit {
            Some(name) => Unit::from_name(name).ok_or_else(|| {
                ValidationError::Link(format!(
                    "link {link_id}: unknown unit '{name}' for item {}",
                    config.item_id
                ))
            })?,
            None => Unit::Unknown,
        };
        let in_obis_code = config
            .in_obis_code
            .as_ref()
            .map(|code| hex::decode(code))
            .transpose()
            .map_err(|err| {
                ValidationError::Link(format!(
                    "link {link_id}: invalid inObisCode for item {}: {err}",
                    config.item_id
                ))
            })?;
        let in_pattern = config
            .in_pattern
            .as_ref()
            .map(|p| Regex::new(p))
            .transpose()
            .map_err(|err| {
                ValidationError::Link(format!(
                    "link {link_id}: invalid inPattern for item {}: {err}",
                    config.item_id
                ))
            })?;
        let out_mappings = config
            .out_mappings
            .iter()
            .map(|om| OutMapping {
                minimum: om.minimum,
                maximum: om.maximum,
                equals: om.equals.clone(),
                replacement: om.replacement.clone(),
            })
            .collect();
        Ok(Modifier {
            unit,
            factor: config.factor,
            summand: config.summand,
            round_precision: config.round_precision,
            in_obis_code,
            in_json_pointer: config.in_json_pointer.clone(),
            in_pattern,
            in_mappings: config.in_mappings.clone(),
            out_mappings,
        })
    }

    fn map_inbound(&self, value: &str) -> String {
        self.in_mappings.get(value).cloned().unwrap_or_else(|| value.to_string())
    }

    /// Returns `Value::Null` to signal the value could not be mapped; the
    /// caller drops the event in that case.
    fn map_outbound(&self, value: &Value) -> Value {
        for out_mapping in &self.out_mappings {
            let matched = match &out_mapping.equals {
                Some(equals) => &value.to_display_string() == equals,
                None => match value.as_number() {
                    Some(n) => {
                        out_mapping.minimum.map_or(true, |m| n >= m) && out_mapping.maximum.map_or(true, |m| n <= m)
                    }
                    None => false,
                },
            };
            if !matched {
                continue;
            }
            let mut replacement = out_mapping.replacement.clone();
            if replacement.contains("%Time%") {
                replacement = replacement.replace("%Time%", &TimePoint::now().epoch_secs().to_string());
            }
            if replacement.contains("%EventValue%") {
                let substitution = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n, _) => n.to_string(),
                    _ => return Value::Null,
                };
                replacement = replacement.replace("%EventValue%", &substitution);
            }
            return Value::new_string(replacement);
        }
        value.clone()
    }

    fn convert_outbound(&self, value: &Value) -> Value {
        match value {
            Value::Number(n, unit) => {
                let mut num = (n / self.factor) - self.summand;
                if let Some(precision) = self.round_precision {
                    num = round_to(num, precision);
                }
                Value::new_number_with_unit(num, *unit)
            }
            other => other.clone(),
        }
    }

    fn convert_inbound(&self, value: &Value) -> Value {
        match value {
            Value::Number(n, unit) => {
                let mut num = (n + self.summand) * self.factor;
                if let Some(precision) = self.round_precision {
                    num = round_to(num, precision);
                }
                Value::new_number_with_unit(num, *unit)
            }
            other => other.clone(),
        }
    }
}

struct BooleanAsString {
    false_value: String,
    true_value: String,
    unwritable_false_value: String,
    unwritable_true_value: String,
}

impl BooleanAsString {
    fn from_config(config: &BooleanAsStringConfig) -> BooleanAsString {
        BooleanAsString {
            false_value: config.false_value.clone(),
            true_value: config.true_value.clone(),
            unwritable_false_value: config
                .unwritable_false_value
                .clone()
                .unwrap_or_else(|| config.false_value.clone()),
            unwritable_true_value: config
                .unwritable_true_value
                .clone()
                .unwrap_or_else(|| config.true_value.clone()),
        }
    }
}

struct VoidAsString {
    value: String,
    unwritable_value: String,
}

impl VoidAsString {
    fn from_config(config: &VoidAsStringConfig) -> VoidAsString {
        VoidAsString { value: config.value.clone(), unwritable_value: config.unwritable_value.clone() }
    }
}

/// One configured connection to an external system: a handler plus the
/// ownership/type/unit rules enforced around it.
pub struct Link {
    id: String,
    enabled: bool,
    suppress_read_events: bool,
    suppress_undefined: bool,
    operational_item_id: Option<String>,
    error_counter_item_id: Option<String>,
    max_receive_duration: Duration,
    max_send_duration: Duration,
    number_as_string: bool,
    boolean_as_string: Option<BooleanAsString>,
    time_point_as_string: Option<String>,
    void_as_string: Option<VoidAsString>,
    void_as_boolean: bool,
    undefined_as_string: Option<String>,
    modifiers: HashMap<String, Modifier>,
    handler: Box<dyn HandlerIf>,
    old_handler_state: HandlerState,
    pending_events: Events,
}

impl Link {
    pub fn new(config: &LinkConfig, handler: Box<dyn HandlerIf>) -> Result<Link, ValidationError> {
        let mut modifiers = HashMap::with_capacity(config.modifiers.len());
        for modifier_config in &config.modifiers {
            let modifier = Modifier::from_config(&config.id, modifier_config)?;
            modifiers.insert(modifier_config.item_id.clone(), modifier);
        }

        let old_handler_state = HandlerState::default();
        let mut pending_events = Events::new();
        if let Some(item_id) = &config.operational_item {
            pending_events.push(Event::new(
                CONTROL_LINK_ID,
                item_id.clone(),
                EventType::StateInd,
                Value::new_boolean(old_handler_state.operational),
            ));
        }
        if let Some(item_id) = &config.error_counter_item {
            pending_events.push(Event::new(
                CONTROL_LINK_ID,
                item_id.clone(),
                EventType::StateInd,
                Value::new_number(old_handler_state.error_counter as f64),
            ));
        }

        Ok(Link {
            id: config.id.clone(),
            enabled: config.enabled,
            suppress_read_events: config.suppress_read_events,
            suppress_undefined: config.suppress_undefined,
            operational_item_id: config.operational_item.clone(),
            error_counter_item_id: config.error_counter_item.clone(),
            max_receive_duration: Duration::from_millis(config.max_receive_duration),
            max_send_duration: Duration::from_millis(config.max_send_duration),
            number_as_string: config.number_as_string,
            boolean_as_string: config.boolean_as_string.as_ref().map(BooleanAsString::from_config),
            time_point_as_string: config.time_point_as_string.as_ref().map(|c| c.format.clone()),
            void_as_string: config.void_as_string.as_ref().map(VoidAsString::from_config),
            void_as_boolean: config.void_as_boolean,
            undefined_as_string: config.undefined_as_string.as_ref().map(|c| c.value.clone()),
            modifiers,
            handler,
            old_handler_state,
            pending_events,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn validate(&mut self, items: &mut Items) -> Result<(), ValidationError> {
        if let Some(item_id) = &self.operational_item_id {
            let item = items
                .get_mut(item_id)
                .ok_or_else(|| ValidationError::Link(format!("item {item_id} referenced but not defined")))?;
            item.validate_owner_id(CONTROL_LINK_ID).map_err(ValidationError::Link)?;
            item.validate_value_type(ValueType::Boolean).map_err(ValidationError::Link)?;
            item.validate_polling_enabled(false).map_err(ValidationError::Link)?;
            item.set_readable(false);
            item.set_writable(false);
        }
        if let Some(item_id) = &self.error_counter_item_id {
            let item = items
                .get_mut(item_id)
                .ok_or_else(|| ValidationError::Link(format!("item {item_id} referenced but not defined")))?;
            item.validate_owner_id(CONTROL_LINK_ID).map_err(ValidationError::Link)?;
            item.validate_value_type(ValueType::Number).map_err(ValidationError::Link)?;
            item.validate_polling_enabled(false).map_err(ValidationError::Link)?;
            item.set_readable(false);
            item.set_writable(false);
        }
        for (item_id, modifier) in &self.modifiers {
            let item = items
                .get(item_id)
                .ok_or_else(|| ValidationError::Link(format!("item {item_id} referenced but not defined")))?;
            if modifier.unit != Unit::Unknown {
                item.validate_unit_type(modifier.unit.unit_type()).map_err(ValidationError::Link)?;
            }
        }
        self.handler.validate(items)
    }

    pub fn collect_wait(&mut self, epoll: &Epoll, token: Token) -> Result<WaitRequest, HandlerError> {
        if !self.pending_events.is_empty() {
            return Ok(WaitRequest::immediate());
        }
        self.handler.collect_wait(epoll, token)
    }

    pub fn receive(&mut self, items: &Items) -> Events {
        let events = if !self.pending_events.is_empty() {
            std::mem::take(&mut self.pending_events)
        } else {
            let start = Instant::now();
            let mut events = self.handler.receive(items);
            let runtime = start.elapsed();
            if runtime > self.max_receive_duration {
                log::warn!(target: "link", "[{}] event receiving took {} ms", self.id, runtime.as_millis());
            }

            let state = self.handler.state();
            if let Some(item_id) = &self.operational_item_id {
                if state.operational != self.old_handler_state.operational {
                    events.push(Event::new(
                        CONTROL_LINK_ID,
                        item_id.clone(),
                        EventType::StateInd,
                        Value::new_boolean(state.operational),
                    ));
                }
            }
            if let Some(item_id) = &self.error_counter_item_id {
                if state.error_counter != self.old_handler_state.error_counter {
                    events.push(Event::new(
                        CONTROL_LINK_ID,
                        item_id.clone(),
                        EventType::StateInd,
                        Value::new_number(state.error_counter as f64),
                    ));
                }
            }
            self.old_handler_state = state;
            events
        };

        events.into_iter().filter_map(|event| self.process_inbound(event, items)).collect()
    }

    pub fn send(&mut self, items: &Items, events: &Events) {
        let modified_events: Events =
            events.iter().filter_map(|event| self.process_outbound(event, items)).collect();

        let start = Instant::now();
        let mut pending = self.handler.send(items, &modified_events);
        let runtime = start.elapsed();
        if runtime > self.max_send_duration {
            log::warn!(target: "link", "[{}] event sending took {} ms", self.id, runtime.as_millis());
        }

        let state = self.handler.state();
        if let Some(item_id) = &self.operational_item_id {
            if state.operational != self.old_handler_state.operational {
                pending.push(Event::new(
                    CONTROL_LINK_ID,
                    item_id.clone(),
                    EventType::StateInd,
                    Value::new_boolean(state.operational),
                ));
            }
        }
        if let Some(item_id) = &self.error_counter_item_id {
            if state.error_counter != self.old_handler_state.error_counter {
                pending.push(Event::new(
                    CONTROL_LINK_ID,
                    item_id.clone(),
                    EventType::StateInd,
                    Value::new_number(state.error_counter as f64),
                ));
            }
        }
        self.old_handler_state = state;
        self.pending_events = pending;
    }

    fn process_inbound(&self, event: Event, items: &Items) -> Option<Event> {
        let Some(item) = items.get(event.item_id()) else {
            log::warn!(target: "link", "[{}] {} event received for unknown item {}", self.id, event.event_type(), event.item_id());
            return None;
        };
        let modifier = self.modifiers.get(event.item_id());

        if event.event_type() != EventType::StateInd && item.owner_id() == self.id {
            log::warn!(target: "link", "[{}] {} event received for item {} which is owned by the link", self.id, event.event_type(), event.item_id());
            return None;
        }
        if event.event_type() == EventType::StateInd && item.owner_id() != self.id && item.owner_id() != CONTROL_LINK_ID {
            log::warn!(target: "link", "[{}] {} event received for item {} which is not owned by the link", self.id, event.event_type(), event.item_id());
            return None;
        }
        if event.event_type() == EventType::WriteReq && !item.is_writable() {
            log::warn!(target: "link", "[{}] {} event received for item {} which is not writable", self.id, event.event_type(), event.item_id());
            return None;
        }
        if self.suppress_read_events && event.event_type() == EventType::ReadReq {
            return None;
        }

        if event.event_type() == EventType::ReadReq {
            return Some(event.with_value(Value::new_void()));
        }

        let mut value = event.value().clone();

        if self.suppress_undefined && value.is_undefined() {
            return None;
        }

        if let (Value::String(s), Some(modifier)) = (&value, modifier) {
            if let Some(obis_code) = &modifier.in_obis_code {
                match self.extract_obis(s, obis_code) {
                    Ok(extracted) => value = extracted,
                    Err(message) => {
                        log::error!(target: "link", "[{}] event value conversion for item {} - {message}", self.id, item.id());
                        return None;
                    }
                }
            }
        }

        if let (Value::String(s), Some(modifier)) = (&value, modifier) {
            if let Some(pointer) = &modifier.in_json_pointer {
                match self.extract_json_pointer(s, pointer) {
                    Ok(extracted) => value = extracted,
                    Err(message) => {
                        log::error!(target: "link", "[{}] {message} when converting event STRING value '{s}' of item {}", self.id, item.id());
                        return None;
                    }
                }
            }
        }

        if let (Value::String(s), Some(modifier)) = (&value, modifier) {
            if let Some(pattern) = &modifier.in_pattern {
                // Extracted eagerly into owned data so the match below doesn't
                // hold a borrow through `value`'s reassignment.
                let outcome = pattern.captures(s).map(|captures| {
                    if captures.len() > 1 {
                        (1..captures.len()).find_map(|i| captures.get(i)).map(|m| m.as_str().to_string())
                    } else {
                        None
                    }
                });
                match outcome {
                    Some(Some(extracted)) => value = Value::new_string(extracted),
                    Some(None) if item.has_value_type(ValueType::Boolean) => value = Value::new_boolean(true),
                    Some(None) => {}
                    None if item.has_value_type(ValueType::Boolean) => value = Value::new_boolean(false),
                    None => {}
                }
            }
        }

        if let (Value::String(s), Some(modifier)) = (&value, modifier) {
            value = Value::new_string(modifier.map_inbound(s));
        }

        if value.is_string() && !item.has_value_type(ValueType::String) {
            let s = value.as_string().unwrap().to_string();

            if self.number_as_string && item.has_value_type(ValueType::Number) {
                if let Ok(n) = s.parse::<f64>() {
                    value = Value::new_number(n);
                }
            }
            if value.is_string() {
                if let Some(bas) = &self.boolean_as_string {
                    if item.has_value_type(ValueType::Boolean) {
                        let (false_value, true_value) = if item.is_writable() {
                            (&bas.false_value, &bas.true_value)
                        } else {
                            (&bas.unwritable_false_value, &bas.unwritable_true_value)
                        };
                        if &s == false_value {
                            value = Value::new_boolean(false);
                        } else if &s == true_value {
                            value = Value::new_boolean(true);
                        }
                    }
                }
            }
            if value.is_string() {
                if let Some(format) = &self.time_point_as_string {
                    if item.has_value_type(ValueType::TimePoint) {
                        if let Some(tp) = parse_time_point(&s, format) {
                            value = Value::new_time_point(tp);
                        }
                    }
                }
            }
            if value.is_string() {
                if let Some(vas) = &self.void_as_string {
                    if item.has_value_type(ValueType::Void) && (s == vas.value || s == vas.unwritable_value) {
                        value = Value::new_void();
                    }
                }
            }
            if value.is_string() {
                if let Some(expected) = &self.undefined_as_string {
                    if item.has_value_type(ValueType::Undefined) && &s == expected {
                        value = Value::new_undefined();
                    }
                }
            }
            if value.is_string() {
                log::error!(target: "link", "[{}] event STRING value '{s}' not convertible for item {}", self.id, item.id());
                return None;
            }
        } else if value.is_boolean() && !item.has_value_type(ValueType::Boolean) && self.void_as_boolean {
            value = Value::new_void();
        }

        match value.value_type() {
            Some(vt) if item.has_value_type(vt) => {}
            _ => {
                log::error!(target: "link", "[{}] event value not compatible with item {}", self.id, item.id());
                return None;
            }
        }

        value = match value {
            Value::Number(n, mut source_unit) => {
                if source_unit == Unit::Unknown {
                    if let Some(modifier) = modifier {
                        if modifier.unit != Unit::Unknown {
                            source_unit = modifier.unit;
                        }
                    }
                }
                if source_unit == Unit::Unknown {
                    source_unit = item.unit();
                }
                let target_unit = item.unit();
                match source_unit.convert_to(n, target_unit) {
                    Some(converted) => Value::new_number_with_unit(converted, target_unit),
                    None => {
                        log::error!(target: "link", "[{}] event value unit {source_unit} can not be converted to unit {target_unit} for item {}", self.id, item.id());
                        return None;
                    }
                }
            }
            other => other,
        };

        if let Some(modifier) = modifier {
            value = modifier.convert_inbound(&value);
        }

        Some(event.with_value(value))
    }

    fn extract_obis(&self, hex_string: &str, obis_code: &[u8]) -> Result<Value, String> {
        let raw = hex::decode(hex_string).map_err(|_| format!("invalid hex string '{hex_string}'"))?;
        let file = SmlFile::parse(&raw).map_err(|err| format!("SML parse error - {err}"))?;
        let sequence = file
            .search_sequence(obis_code)
            .ok_or_else(|| format!("sequence for OBIS code {} not found", hex::encode(obis_code)))?;
        if sequence.len() < 6 {
            return Err(format!("sequence for OBIS code {} too short", hex::encode(obis_code)));
        }
        match (&sequence[3], &sequence[4], &sequence[5]) {
            (SmlNode::Integer(unit_code), SmlNode::Integer(scaler), SmlNode::Integer(number)) => {
                let unit = match unit_code {
                    30 => Unit::WattHour,
                    27 => Unit::Watt,
                    other => return Err(format!("unknown OBIS unit {other}")),
                };
                Ok(Value::new_number_with_unit(10f64.powi(*scaler as i32) * (*number as f64), unit))
            }
            _ => Err(format!("sequence for OBIS code {} invalid", hex::encode(obis_code))),
        }
    }

    fn extract_json_pointer(&self, json: &str, pointer: &str) -> Result<Value, String> {
        let document: serde_json::Value =
            serde_json::from_str(json).map_err(|err| format!("JSON parse error '{err}'"))?;
        match document.pointer(pointer) {
            Some(serde_json::Value::Bool(b)) => Ok(Value::new_boolean(*b)),
            Some(serde_json::Value::String(s)) => Ok(Value::new_string(s.clone())),
            Some(serde_json::Value::Number(n)) => Ok(Value::new_number(n.as_f64().unwrap_or(0.0))),
            Some(serde_json::Value::Null) => Ok(Value::new_undefined()),
            Some(_) => Ok(Value::new_string(json)),
            None => Err(format!("JSON pointer {pointer} can't be resolved")),
        }
    }

    fn process_outbound(&self, event: &Event, items: &Items) -> Option<Event> {
        let Some(item) = items.get(event.item_id()) else {
            return Some(event.clone());
        };
        let modifier = self.modifiers.get(event.item_id());

        if event.event_type() != EventType::StateInd && item.owner_id() != self.id {
            return None;
        }
        if event.event_type() == EventType::StateInd && item.owner_id() == self.id {
            return None;
        }
        if self.suppress_read_events && event.event_type() == EventType::ReadReq {
            return None;
        }

        if event.event_type() == EventType::ReadReq {
            return Some(event.clone());
        }

        let mut value = event.value().clone();

        if self.suppress_undefined && value.is_undefined() {
            return None;
        }

        if let Some(modifier) = modifier {
            value = modifier.convert_outbound(&value);
        }

        value = match value {
            Value::Number(n, source_unit) => {
                let mut target_unit = source_unit;
                if let Some(modifier) = modifier {
                    if modifier.unit != Unit::Unknown {
                        target_unit = modifier.unit;
                    }
                }
                match source_unit.convert_to(n, target_unit) {
                    Some(converted) => Value::new_number_with_unit(converted, target_unit),
                    None => {
                        log::error!(target: "link", "[{}] event value unit {source_unit} can not be converted to unit {target_unit} for item {}", self.id, item.id());
                        return None;
                    }
                }
            }
            other => other,
        };

        value = match value {
            Value::Number(n, _) if self.number_as_string => Value::new_string(n.to_string()),
            Value::Boolean(b) if self.boolean_as_string.is_some() => {
                let bas = self.boolean_as_string.as_ref().unwrap();
                let s = if item.is_writable() {
                    if b { &bas.true_value } else { &bas.false_value }
                } else if b {
                    &bas.unwritable_true_value
                } else {
                    &bas.unwritable_false_value
                };
                Value::new_string(s.clone())
            }
            Value::TimePoint(t) if self.time_point_as_string.is_some() => {
                Value::new_string(format_time_point(t, self.time_point_as_string.as_ref().unwrap()))
            }
            Value::Void if self.void_as_string.is_some() => {
                let vas = self.void_as_string.as_ref().unwrap();
                Value::new_string(if item.is_writable() { vas.value.clone() } else { vas.unwritable_value.clone() })
            }
            Value::Void if self.void_as_boolean => Value::new_boolean(true),
            Value::Undefined if self.undefined_as_string.is_some() => {
                Value::new_string(self.undefined_as_string.clone().unwrap())
            }
            other => other,
        };

        if let Some(modifier) = modifier {
            value = modifier.map_outbound(&value);
            if value.is_null() {
                log::error!(target: "link", "[{}] event value can not be mapped for item {}", self.id, item.id());
                return None;
            }
        }

        Some(event.clone().with_value(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::handler::storage::Storage;
    use crate::item::{Item, Items};
    use crate::value::ValueTypes;

    fn modifier_config(item_id: &str) -> ModifierConfig {
        ModifierConfig {
            item_id: item_id.into(),
            unit: None,
            in_obis_code: None,
            in_json_pointer: None,
            in_pattern: None,
            in_mappings: HashMap::new(),
            factor: 1.0,
            summand: 0.0,
            round_precision: None,
            out_mappings: Vec::new(),
        }
    }

    fn link_config(id: &str, modifiers: Vec<ModifierConfig>) -> LinkConfig {
        LinkConfig {
            id: id.into(),
            enabled: true,
            suppress_read_events: false,
            suppress_undefined: false,
            operational_item: None,
            error_counter_item: None,
            max_receive_duration: 20,
            max_send_duration: 20,
            number_as_string: false,
            boolean_as_string: None,
            time_point_as_string: None,
            void_as_string: None,
            void_as_boolean: false,
            undefined_as_string: None,
            modifiers,
            knx: None,
            mqtt: None,
            modbus: None,
            port: None,
            http: None,
            tcp: None,
            generator: None,
            storage: None,
        }
    }

    fn dummy_handler() -> Box<dyn HandlerIf> {
        Box::new(Storage::new("meter", &StorageConfig { file_name: String::new(), bindings: Vec::new() }))
    }

    fn items_with(item: Item) -> Items {
        let mut items = Items::new();
        items.insert(item.id().to_string(), item);
        items
    }

    /// Builds a synthetic SML datagram wrapping OBIS code `01 00 01 08 00 FF`
    /// with unit=30 (Wh), scaler=-1, raw=987 -- decodes to 98.7 Wh.
    fn sml_obis_datagram(obis: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0x76, 0x07];
        bytes.extend_from_slice(obis);
        bytes.extend_from_slice(&[0x01, 0x01, 0x62, 0x1E, 0x52, 0xFF, 0x63, 0x03, 0xDB, 0x00]);
        bytes
    }

    #[test]
    fn obis_extraction_applies_scale_and_unit() {
        let obis = [0x01u8, 0x00, 0x01, 0x08, 0x00, 0xFF];
        let hex_string = hex::encode(sml_obis_datagram(&obis));

        let mut modifier = modifier_config("energy");
        modifier.in_obis_code = Some(hex::encode(obis));
        let config = link_config("meter", vec![modifier]);
        let link = Link::new(&config, dummy_handler()).unwrap();

        let item = Item::new(
            "energy", "meter", ValueTypes::parse("NUMBER").unwrap(), Unit::WattHour,
            true, false, true, Duration::ZERO,
            crate::item::SendOnTimer::default(), crate::item::SendOnChange::default(), Duration::ZERO,
        );
        let items = items_with(item);

        let event = Event::new("meter", "energy", EventType::StateInd, Value::new_string(hex_string));
        let converted = link.process_inbound(event, &items).unwrap();
        assert_eq!(converted.value(), &Value::new_number_with_unit(98.7, Unit::WattHour));
    }

    #[test]
    fn linear_modifier_scales_inbound_value() {
        let mut modifier = modifier_config("temp");
        modifier.factor = 0.1;
        modifier.summand = -40.0;
        let config = link_config("sensor", vec![modifier]);
        let link = Link::new(&config, dummy_handler()).unwrap();

        let item = Item::new(
            "temp", "sensor", ValueTypes::parse("NUMBER").unwrap(), Unit::Celsius,
            true, false, true, Duration::ZERO,
            crate::item::SendOnTimer::default(), crate::item::SendOnChange::default(), Duration::ZERO,
        );
        let items = items_with(item);

        // raw 650 -> (650 - 40) * 0.1 == 61.0
        let event = Event::new("sensor", "temp", EventType::StateInd, Value::new_number(650.0));
        let converted = link.process_inbound(event, &items).unwrap();
        assert_eq!(converted.value(), &Value::new_number_with_unit(61.0, Unit::Celsius));
    }

    #[test]
    fn write_req_for_non_writable_item_is_rejected() {
        let config = link_config("sensor", Vec::new());
        let link = Link::new(&config, dummy_handler()).unwrap();

        let item = Item::new(
            "temp", CONTROL_LINK_ID, ValueTypes::parse("NUMBER").unwrap(), Unit::Celsius,
            true, false, true, Duration::ZERO,
            crate::item::SendOnTimer::default(), crate::item::SendOnChange::default(), Duration::ZERO,
        );
        let items = items_with(item);

        let event = Event::new(CONTROL_LINK_ID, "temp", EventType::WriteReq, Value::new_number(10.0));
        assert!(link.process_inbound(event, &items).is_none());
    }
}
