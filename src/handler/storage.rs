//! File-backed persistence: restores owned items from a JSON object on
//! startup and rewrites the file atomically whenever one of them changes.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use serde_json::Map as JsonMap;

use crate::config::StorageConfig;
use crate::epoll::{Epoll, Token};
use crate::error::{HandlerError, ValidationError};
use crate::event::{Event, EventType, Events};
use crate::item::Items;
use crate::value::{TimePoint, Value, ValueType};

use super::{HandlerIf, HandlerState, WaitRequest};

const REREAD_INTERVAL: Duration = Duration::from_secs(10);

struct Binding {
    initial_value: Value,
}

pub struct Storage {
    id: String,
    file_name: String,
    bindings: HashMap<String, Binding>,
    file_read: bool,
    last_read_attempt: Option<TimePoint>,
    error_counter: u64,
}

impl Storage {
    pub fn new(id: impl Into<String>, config: &StorageConfig) -> Storage {
        let mut bindings = HashMap::new();
        for binding in &config.bindings {
            let initial_value = if let Some(b) = binding.initial_boolean {
                Value::new_boolean(b)
            } else if let Some(n) = binding.initial_number {
                Value::new_number(n)
            } else if let Some(s) = &binding.initial_string {
                Value::new_string(s.clone())
            } else {
                Value::new_undefined()
            };
            bindings.insert(binding.item_id.clone(), Binding { initial_value });
        }
        Storage {
            id: id.into(),
            file_name: config.file_name.clone(),
            bindings,
            file_read: false,
            last_read_attempt: None,
            error_counter: 0,
        }
    }

    fn decode_value(json: &serde_json::Value, item_has: impl Fn(ValueType) -> bool) -> Option<Value> {
        match json {
            serde_json::Value::String(s) if item_has(ValueType::TimePoint) => {
                s.parse::<i64>().ok().map(|secs| Value::new_time_point(TimePoint(secs)))
            }
            serde_json::Value::String(s) if item_has(ValueType::String) => Some(Value::new_string(s.clone())),
            serde_json::Value::Bool(b) if item_has(ValueType::Boolean) => Some(Value::new_boolean(*b)),
            serde_json::Value::Number(n) if item_has(ValueType::Number) => n.as_f64().map(Value::new_number),
            serde_json::Value::Null if item_has(ValueType::Undefined) => Some(Value::new_undefined()),
            _ => None,
        }
    }

    fn encode_value(value: &Value) -> serde_json::Value {
        match value {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::TimePoint(t) => serde_json::Value::String(t.epoch_secs().to_string()),
            Value::Number(n, _) => serde_json::Number::from_f64(*n).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null),
            _ => serde_json::Value::Null,
        }
    }

    fn read_file(&mut self, items: &Items) -> Result<Events, String> {
        let now = TimePoint::now();
        if let Some(last) = self.last_read_attempt {
            if now.epoch_secs() < last.epoch_secs() + REREAD_INTERVAL.as_secs() as i64 {
                return Ok(Events::new());
            }
        }
        self.last_read_attempt = Some(now);

        let raw = match fs::read_to_string(&self.file_name) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(format!("can not open file {}: {err}", self.file_name)),
        };

        let mut events = Events::new();
        let mut seen = std::collections::HashSet::new();

        if !raw.trim().is_empty() {
            let document: JsonMap<String, serde_json::Value> =
                serde_json::from_str(&raw).map_err(|err| format!("JSON parse error in {}: {err}", self.file_name))?;

            for (item_id, json_value) in &document {
                seen.insert(item_id.clone());
                let item = items.get(item_id).ok_or_else(|| format!("item {item_id} is unknown"))?;
                if item.owner_id() != self.id {
                    return Err(format!("item {item_id} is not owned by the link"));
                }
                let value = Self::decode_value(json_value, |vt| item.has_value_type(vt))
                    .ok_or_else(|| format!("value for item {item_id} is not supported"))?;
                events.push(Event::new(self.id.clone(), item_id.clone(), EventType::StateInd, value));
            }
        }

        for (item_id, item) in items.iter() {
            if item.owner_id() == self.id && !seen.contains(item_id) {
                let initial = self
                    .bindings
                    .get(item_id)
                    .map(|b| b.initial_value.clone())
                    .unwrap_or(Value::new_undefined());
                events.push(Event::new(self.id.clone(), item_id.clone(), EventType::StateInd, initial));
            }
        }

        self.file_read = true;
        Ok(events)
    }
}

impl HandlerIf for Storage {
    fn validate(&mut self, items: &mut Items) -> Result<(), ValidationError> {
        let owned_ids: Vec<String> =
            items.iter().filter(|(_, item)| item.owner_id() == self.id).map(|(id, _)| id.clone()).collect();
        for item_id in &owned_ids {
            self.bindings.entry(item_id.clone()).or_insert_with(|| Binding { initial_value: Value::new_undefined() });
            let item = items.get_mut(item_id).unwrap();
            item.set_readable(false);
            item.set_writable(true);
            item.set_responsive(true);
        }
        for (item_id, binding) in &self.bindings {
            let item = items
                .get_mut(item_id)
                .ok_or_else(|| ValidationError::Link(format!("item {item_id} referenced but not defined")))?;
            item.validate_owner_id(&self.id).map_err(ValidationError::Link)?;
            item.validate_value_type(binding.initial_value.value_type().unwrap_or(ValueType::Undefined))
                .map_err(ValidationError::Link)?;
        }
        Ok(())
    }

    fn state(&self) -> HandlerState {
        HandlerState { operational: self.file_read, error_counter: self.error_counter }
    }

    fn collect_wait(&mut self, _epoll: &Epoll, _token: Token) -> Result<WaitRequest, HandlerError> {
        if self.file_read {
            Ok(WaitRequest::no_bound())
        } else {
            Ok(WaitRequest::immediate())
        }
    }

    fn receive(&mut self, items: &Items) -> Events {
        match self.read_file(items) {
            Ok(events) => events,
            Err(message) => {
                log::error!(target: "link", "[{}] {message}", self.id);
                self.error_counter += 1;
                Events::new()
            }
        }
    }

    fn send(&mut self, items: &Items, events: &Events) -> Events {
        if !self.file_read {
            return Events::new();
        }

        let mut new_values = HashMap::new();
        for event in events {
            if event.event_type() == EventType::WriteReq {
                if let Some(item) = items.get(event.item_id()) {
                    if item.last_value() != event.value() {
                        new_values.insert(event.item_id().to_string(), event.value().clone());
                    }
                }
            }
        }

        if !new_values.is_empty() {
            let mut document = JsonMap::new();
            for (item_id, item) in items.iter() {
                if item.owner_id() == self.id {
                    let value = new_values.get(item_id).cloned().unwrap_or_else(|| item.last_value().clone());
                    document.insert(item_id.clone(), Self::encode_value(&value));
                }
            }

            let tmp_path = format!("{}.tmp", self.file_name);
            let write_result = serde_json::to_string_pretty(&document)
                .map_err(|err| err.to_string())
                .and_then(|body| fs::write(&tmp_path, body).map_err(|err| err.to_string()))
                .and_then(|_| fs::rename(&tmp_path, &self.file_name).map_err(|err| err.to_string()));

            if let Err(message) = write_result {
                log::error!(target: "link", "[{}] can not write file {}: {message}", self.id, self.file_name);
                self.error_counter += 1;
                return Events::new();
            }
        }

        new_values
            .into_iter()
            .map(|(item_id, value)| Event::new(self.id.clone(), item_id, EventType::StateInd, value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Item, SendOnChange, SendOnTimer};
    use crate::unit::Unit;
    use crate::value::ValueTypes;

    fn mode_items(owner: &str) -> Items {
        let mut items = Items::new();
        items.insert(
            "mode".to_string(),
            Item::new(
                "mode", owner, ValueTypes::parse("STRING").unwrap(), Unit::Unknown,
                false, true, true, Duration::ZERO,
                SendOnTimer::default(), SendOnChange::default(), Duration::ZERO,
            ),
        );
        items
    }

    #[test]
    fn restart_restores_value_then_write_req_persists_and_echoes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        fs::write(&path, r#"{"mode":"eco"}"#).unwrap();

        let config = StorageConfig { file_name: path.to_str().unwrap().to_string(), bindings: Vec::new() };
        let mut storage = Storage::new("store", &config);
        let mut items = mode_items("store");

        let boot_events = storage.receive(&items);
        assert_eq!(boot_events.len(), 1);
        assert_eq!(boot_events[0].value(), &Value::new_string("eco"));
        items.get_mut("mode").unwrap().set_last_send_value(Value::new_string("eco"));

        let write_req = Event::new("mqtt", "mode", EventType::WriteReq, Value::new_string("boost"));
        let echoed = storage.send(&items, &vec![write_req]);
        assert_eq!(echoed.len(), 1);
        assert_eq!(echoed[0].value(), &Value::new_string("boost"));

        let on_disk = fs::read_to_string(&path).unwrap();
        let document: serde_json::Value = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(document["mode"], "boost");
    }
}
