//! Synthetic value source: periodically emits a fixed value as STATE_IND
//! (for items it owns) or as READ_REQ/WRITE_REQ (for items owned elsewhere).
//! Used in tests and demos in place of a real field device.

use std::collections::HashMap;

use crate::config::GeneratorConfig;
use crate::epoll::{Epoll, Token};
use crate::error::{HandlerError, ValidationError};
use crate::event::{Event, EventType, Events};
use crate::item::{Item, Items};
use crate::value::{TimePoint, Value, ValueType};

use super::{HandlerIf, HandlerState, WaitRequest};

struct Binding {
    item_id: String,
    event_type: EventType,
    raw_value: String,
    value: Value,
    interval: u64,
}

/// Parses a configured literal against the item's declared type, the same
/// priority order the link's inbound type coercion uses.
fn coerce_literal(raw: &str, item: &Item) -> Value {
    if item.has_value_type(ValueType::Number) {
        if let Ok(n) = raw.parse::<f64>() {
            return Value::new_number(n);
        }
    }
    if item.has_value_type(ValueType::Boolean) {
        match raw {
            "true" => return Value::new_boolean(true),
            "false" => return Value::new_boolean(false),
            _ => {}
        }
    }
    if item.has_value_type(ValueType::String) {
        return Value::new_string(raw);
    }
    if item.has_value_type(ValueType::Void) {
        return Value::new_void();
    }
    Value::new_undefined()
}

pub struct Generator {
    id: String,
    bindings: Vec<Binding>,
    last_generation: HashMap<String, TimePoint>,
}

impl Generator {
    pub fn new(id: impl Into<String>, config: &GeneratorConfig) -> Result<Generator, ValidationError> {
        let id = id.into();
        let mut bindings = Vec::with_capacity(config.bindings.len());
        for binding in &config.bindings {
            let event_type = match binding.event_type.as_str() {
                "STATE_IND" => EventType::StateInd,
                "WRITE_REQ" => EventType::WriteReq,
                "READ_REQ" => EventType::ReadReq,
                other => {
                    return Err(ValidationError::Link(format!(
                        "link {id}: unknown eventType '{other}' for item {}",
                        binding.item_id
                    )))
                }
            };
            bindings.push(Binding {
                item_id: binding.item_id.clone(),
                event_type,
                raw_value: binding.value.clone(),
                value: Value::Null,
                interval: binding.interval,
            });
        }
        Ok(Generator { id, bindings, last_generation: HashMap::new() })
    }
}

impl HandlerIf for Generator {
    fn validate(&mut self, items: &mut Items) -> Result<(), ValidationError> {
        for (item_id, item) in items.iter() {
            if item.owner_id() == self.id && !self.bindings.iter().any(|b| &b.item_id == item_id) {
                return Err(ValidationError::Link(format!(
                    "item {item_id} has no binding for link {}",
                    self.id
                )));
            }
        }
        for binding in &mut self.bindings {
            let item = items
                .get_mut(&binding.item_id)
                .ok_or_else(|| ValidationError::Link(format!("item {} referenced but not defined", binding.item_id)))?;
            binding.value = coerce_literal(&binding.raw_value, item);
            item.validate_value_type(binding.value.value_type().unwrap_or(ValueType::Undefined))
                .map_err(ValidationError::Link)?;
            if item.owner_id() == self.id {
                item.set_readable(false);
                item.set_writable(false);
            }
        }
        Ok(())
    }

    fn state(&self) -> HandlerState {
        HandlerState { operational: true, error_counter: 0 }
    }

    fn collect_wait(&mut self, _epoll: &Epoll, _token: Token) -> Result<WaitRequest, HandlerError> {
        Ok(WaitRequest::after(std::time::Duration::from_millis(500)))
    }

    fn receive(&mut self, items: &Items) -> Events {
        let now = TimePoint::now();
        let mut events = Events::new();

        for binding in &self.bindings {
            let owner = items.get(&binding.item_id).map(|i| i.owner_id() == self.id).unwrap_or(false);
            let due = self
                .last_generation
                .get(&binding.item_id)
                .map(|t| t.epoch_secs() + binding.interval as i64 <= now.epoch_secs())
                .unwrap_or(true);
            if !due {
                continue;
            }
            self.last_generation.insert(binding.item_id.clone(), now);

            match binding.event_type {
                EventType::ReadReq if !owner => {
                    events.push(Event::read_req(self.id.clone(), binding.item_id.clone()));
                }
                EventType::WriteReq if !owner => {
                    events.push(Event::new(self.id.clone(), binding.item_id.clone(), EventType::WriteReq, binding.value.clone()));
                }
                EventType::StateInd if owner => {
                    events.push(Event::new(self.id.clone(), binding.item_id.clone(), EventType::StateInd, binding.value.clone()));
                }
                _ => {}
            }
        }

        events
    }

    fn send(&mut self, _items: &Items, _events: &Events) -> Events {
        Events::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{SendOnChange, SendOnTimer};
    use crate::unit::Unit;
    use crate::value::ValueTypes;
    use std::time::Duration;

    fn number_item(id: &str, owner: &str) -> Item {
        Item::new(
            id, owner, ValueTypes::parse("NUMBER").unwrap(), Unit::Unknown,
            true, true, true, Duration::ZERO,
            SendOnTimer::default(), SendOnChange::default(), Duration::ZERO,
        )
    }

    #[test]
    fn coerce_literal_prefers_number_when_item_accepts_it() {
        let item = number_item("x", "gen");
        assert_eq!(coerce_literal("21.5", &item), Value::new_number(21.5));
    }

    #[test]
    fn coerce_literal_falls_back_to_string_for_non_numeric_item() {
        let item = Item::new(
            "x", "gen", ValueTypes::parse("STRING").unwrap(), Unit::Unknown,
            true, true, true, Duration::ZERO,
            SendOnTimer::default(), SendOnChange::default(), Duration::ZERO,
        );
        assert_eq!(coerce_literal("hello", &item), Value::new_string("hello"));
    }

    #[test]
    fn owned_item_generates_state_ind_on_first_tick() {
        let config = GeneratorConfig {
            bindings: vec![crate::config::GeneratorBindingConfig {
                item_id: "x".into(),
                event_type: "STATE_IND".into(),
                value: "42".into(),
                interval: 60,
            }],
        };
        let mut generator = Generator::new("gen", &config).unwrap();
        let mut items = Items::new();
        items.insert("x".to_string(), number_item("x", "gen"));
        generator.validate(&mut items).unwrap();

        let events = generator.receive(&items);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), EventType::StateInd);
        assert_eq!(events[0].value(), &Value::new_number(42.0));

        // not due again immediately
        assert!(generator.receive(&items).is_empty());
    }
}
