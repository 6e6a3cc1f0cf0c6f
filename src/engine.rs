//! The dispatch loop: waits for readiness across all enabled links, drains
//! each into the shared event queue, routes/suppresses events per item
//! policy, runs the timer pass, then hands the surviving and generated
//! events to every enabled link's `send`.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use slab::Slab;

use crate::awakener::{request_shutdown, shutdown_requested, Awakener};
use crate::config::{Config, HandlerConfig, ItemConfig};
use crate::epoll::{Epoll, Events as EpollEvents, Token};
use crate::error::{EngineError, ValidationError};
use crate::event::{Event, EventType, Events, CONTROL_LINK_ID};
use crate::handler::generator::Generator;
use crate::handler::http::Http;
use crate::handler::knx::Knx;
use crate::handler::modbus::Modbus;
use crate::handler::mqtt::Mqtt;
use crate::handler::port::Port;
use crate::handler::storage::Storage;
use crate::handler::tcp::Tcp;
use crate::handler::HandlerIf;
use crate::item::{is_control_owned, Item, Items, SendOnChange, SendOnTimer};
use crate::link::Link;
use crate::unit::Unit;
use crate::value::{TimePoint, ValueTypes};

/// Upper bound on how long a single `Epoll::wait` call may block, matching
/// `main.cpp`'s initial `timeoutMs = 100` before any link narrows it.
const INITIAL_TIMEOUT: Duration = Duration::from_millis(100);

/// Events received during this window after startup are accumulated but not
/// dispatched, giving slow-to-connect handlers (KNX, MQTT) a chance to
/// report their first state before policy decisions are made on stale data.
const STARTUP_GRACE: Duration = Duration::from_secs(3);

/// Links in declaration order, keyed by id. Unlike the original's
/// `std::map<string, Link>` (sorted by id), preserving declaration order is
/// the deliberate choice for the tie-break spec.md §4.3 leaves open
/// ("the iteration order of the link map") — see DESIGN.md.
pub type Links = IndexMap<String, Link>;

static AWAKENER_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_term_signal(_signo: libc::c_int) {
    request_shutdown();
    let fd = AWAKENER_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let one: u64 = 1;
        unsafe {
            libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }
}

fn install_signal_handlers(awakener: &Awakener) -> std::io::Result<()> {
    AWAKENER_FD.store(awakener.as_raw_fd(), Ordering::SeqCst);
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_term_signal as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        if libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn build_item(config: &ItemConfig) -> Result<Item, ValidationError> {
    let value_types = ValueTypes::parse(&config.value_type)
        .map_err(|err| ValidationError::Item(format!("item {}: {err}", config.id)))?;
    let unit = match &config.unit {
        Some(name) => Unit::from_name(name)
            .ok_or_else(|| ValidationError::Item(format!("item {}: unknown unit '{name}'", config.id)))?,
        None => Unit::Unknown,
    };
    let send_on_timer = match &config.send_on_timer {
        Some(c) => SendOnTimer { active: true, interval: Duration::from_secs(c.duration) },
        None => SendOnTimer::default(),
    };
    let send_on_change = match &config.send_on_change {
        Some(c) => crate::item::SendOnChange {
            active: true,
            abs_variation: c.abs_variation,
            rel_variation: c.rel_variation,
            minimum: c.minimum,
            maximum: c.maximum,
        },
        None => SendOnChange::default(),
    };
    Ok(Item::new(
        config.id.clone(),
        config.owner_id.clone(),
        value_types,
        unit,
        config.readable,
        config.writable,
        config.responsive,
        Duration::from_secs(config.polling_interval),
        send_on_timer,
        send_on_change,
        Duration::from_secs(config.history_period),
    ))
}

fn build_handler(id: &str, handler_config: HandlerConfig<'_>) -> Result<Box<dyn HandlerIf>, ValidationError> {
    Ok(match handler_config {
        HandlerConfig::Knx(c) => Box::new(Knx::new(id, c)?),
        HandlerConfig::Mqtt(c) => Box::new(Mqtt::new(id, c)?),
        HandlerConfig::Modbus(c) => Box::new(Modbus::new(id, c)?),
        HandlerConfig::Port(c) => Box::new(Port::new(id, c)?),
        HandlerConfig::Http(c) => Box::new(Http::new(id, c)?),
        HandlerConfig::Tcp(c) => Box::new(Tcp::new(id, c)?),
        HandlerConfig::Generator(c) => Box::new(Generator::new(id, c)?),
        HandlerConfig::Storage(c) => Box::new(Storage::new(id, c)),
    })
}

struct DispatchLogging {
    log_events: bool,
    log_suppressed_events: bool,
    log_generated_events: bool,
}

pub struct Engine {
    items: Items,
    links: Links,
    link_tokens: IndexMap<String, Token>,
    log_p_select_calls: bool,
    log_events: bool,
    log_suppressed_events: bool,
    log_generated_events: bool,
    epoll: Epoll,
    awakener: Awakener,
}

impl Engine {
    pub fn build(config: &Config) -> Result<Engine, EngineError> {
        let mut items: Items = IndexMap::new();
        for item_config in &config.items {
            let item = build_item(item_config)?;
            items.insert(item_config.id.clone(), item);
        }

        let mut links: Links = IndexMap::new();
        for link_config in &config.links {
            let handler_config = link_config.handler_config()?;
            let handler = build_handler(&link_config.id, handler_config)?;
            let link = Link::new(link_config, handler)?;
            links.insert(link_config.id.clone(), link);
        }

        for link in links.values_mut() {
            link.validate(&mut items)?;
        }

        for (item_id, item) in &items {
            if !is_control_owned(item.owner_id()) && !links.contains_key(item.owner_id()) {
                return Err(ValidationError::Item(format!(
                    "item {item_id} is associated with unknown link {}",
                    item.owner_id()
                ))
                .into());
            }
        }

        let epoll = Epoll::new()?;
        let awakener = Awakener::new()?;
        let mut slab: Slab<()> = Slab::with_capacity(links.len() + 1);
        let awakener_token = Token(slab.insert(()));
        awakener.register(&epoll, awakener_token)?;
        install_signal_handlers(&awakener)?;

        let mut link_tokens = IndexMap::with_capacity(links.len());
        for link_id in links.keys() {
            link_tokens.insert(link_id.clone(), Token(slab.insert(())));
        }

        Ok(Engine {
            items,
            links,
            link_tokens,
            log_p_select_calls: config.log_p_select_calls,
            log_events: config.log_events,
            log_suppressed_events: config.log_suppressed_events,
            log_generated_events: config.log_generated_events,
            epoll,
            awakener,
        })
    }

    fn log_event(event: &Event, postfix: &str) {
        log::debug!(target: "engine", "{event}{postfix}");
    }

    /// One pass of the analyze-then-generate step of the dispatch loop:
    /// suppression, the READ→STATE short-circuit, the WRITE_REQ→READ_REQ
    /// echo, send-on-timer and polling. Factored out of `run` so it can be
    /// exercised without a live epoll/link set — `owner_link_enabled` stands
    /// in for `self.links.get(...).is_enabled()`.
    fn dispatch_tick(
        items: &mut Items,
        events: Events,
        now: TimePoint,
        owner_link_enabled: impl Fn(&str) -> bool,
        logging: DispatchLogging,
    ) -> Events {
        let mut suppressed = Events::new();
        let mut generated = Events::new();
        let mut retained = Events::new();
        for event in events {
            let Some(item) = items.get_mut(event.item_id()) else {
                log::warn!(target: "engine", "event received for unknown item {}", event.item_id());
                continue;
            };

            if event.event_type() == EventType::StateInd && !item.is_send_on_change_required(event.value()) {
                suppressed.push(event);
                continue;
            }

            if event.event_type() == EventType::ReadReq
                && (!item.is_readable() || item.is_polling_enabled() || item.is_send_on_change_active())
            {
                suppressed.push(event.clone());
                let value = item.last_send_value();
                if !value.is_null() {
                    generated.push(Event::new(CONTROL_LINK_ID, event.item_id(), EventType::StateInd, value.clone()));
                } else {
                    log::warn!(target: "engine", "STATE_IND for READ_REQ on item {} can not be generated since its value is unknown", event.item_id());
                }
                continue;
            }

            if event.event_type() == EventType::WriteReq && item.is_readable() && !item.is_responsive() {
                generated.push(Event::read_req(CONTROL_LINK_ID, event.item_id()));
            }

            if event.event_type() == EventType::StateInd {
                item.set_last_send_value(event.value().clone());
                item.set_last_send_time(now);
                item.add_to_history(now, event.value());
            }

            retained.push(event);
        }

        // analyze items: send-on-timer and polling
        for (item_id, item) in items.iter_mut() {
            if !is_control_owned(item.owner_id()) && !owner_link_enabled(item.owner_id()) {
                continue;
            }

            if item.is_send_on_timer_required(now) {
                generated.push(Event::new(CONTROL_LINK_ID, item_id.clone(), EventType::StateInd, item.last_send_value().clone()));
                item.set_last_send_time(now);
            }

            if item.is_polling_enabled() && item.is_polling_required(now) {
                generated.push(Event::read_req(CONTROL_LINK_ID, item_id.clone()));
                item.polling_done(now);
            }
        }

        if logging.log_events {
            if logging.log_suppressed_events {
                for event in &suppressed {
                    Self::log_event(event, " (suppressed)");
                }
            }
            for event in &retained {
                Self::log_event(event, "");
            }
            if logging.log_generated_events {
                for event in &generated {
                    Self::log_event(event, " (generated)");
                }
            }
        }

        retained.extend(generated);
        retained
    }

    /// Runs until SIGTERM/SIGINT is observed. Returns once the signal has
    /// been drained and every link has had a chance to release its
    /// resources (handlers are simply dropped along with the engine).
    pub fn run(&mut self) -> Result<(), EngineError> {
        let start = TimePoint::now();
        for item in self.items.values_mut() {
            if item.is_polling_enabled() {
                item.init_polling(start);
            }
        }

        let mut events: Events = Events::new();
        let mut epoll_events = EpollEvents::with_capacity(64);

        loop {
            let mut timeout_ms = INITIAL_TIMEOUT.as_millis() as u64;
            for (link_id, link) in self.links.iter_mut() {
                if !link.is_enabled() {
                    continue;
                }
                let token = self.link_tokens[link_id];
                match link.collect_wait(&self.epoll, token) {
                    Ok(wait) => {
                        if let Some(ms) = wait.timeout_ms {
                            timeout_ms = timeout_ms.min(ms);
                            if self.log_p_select_calls {
                                log::debug!(target: "engine", "link {link_id} requires timeout {ms} ms");
                            }
                        }
                    }
                    Err(err) => log::error!(target: "engine", "link {link_id} failed to collect readiness: {err}"),
                }
            }

            if let Err(err) = self.epoll.wait(&mut epoll_events, Some(Duration::from_millis(timeout_ms))) {
                log::error!(target: "engine", "error when waiting for event: {err}");
                continue;
            }

            if self.log_p_select_calls {
                log::debug!(target: "engine", "epoll wait returned {} event(s)", epoll_events.len());
            }

            let _ = self.awakener.drain();
            if shutdown_requested() {
                break;
            }

            // receive events
            for link in self.links.values_mut() {
                if link.is_enabled() {
                    events.extend(link.receive(&self.items));
                }
            }

            // only collect received events during the start phase but do not process them
            let now = TimePoint::now();
            if now.epoch_secs() <= start.epoch_secs() + STARTUP_GRACE.as_secs() as i64 {
                continue;
            }

            // analyze received events, send-on-timer and polling
            let owned_link_enabled = |owner_id: &str| match self.links.get(owner_id) {
                Some(link) => link.is_enabled(),
                None => false,
            };
            let retained = Self::dispatch_tick(
                &mut self.items,
                events.drain(..).collect(),
                now,
                owned_link_enabled,
                DispatchLogging {
                    log_events: self.log_events,
                    log_suppressed_events: self.log_suppressed_events,
                    log_generated_events: self.log_generated_events,
                },
            );

            // send events
            for link in self.links.values_mut() {
                if link.is_enabled() {
                    link.send(&self.items, &retained);
                }
            }

            events = Events::new();
        }

        log::info!(target: "engine", "stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{SendOnChange, SendOnTimer};
    use crate::unit::Unit;
    use crate::value::{Number, Value, ValueTypes};

    fn item(id: &str, owner: &str, send_on_change: SendOnChange) -> Item {
        Item::new(
            id,
            owner,
            ValueTypes::parse("NUMBER").unwrap(),
            Unit::Lux,
            true,
            true,
            true,
            Duration::ZERO,
            SendOnTimer::default(),
            send_on_change,
            Duration::ZERO,
        )
    }

    fn no_links_enabled(_owner_id: &str) -> bool {
        true
    }

    fn no_logging() -> DispatchLogging {
        DispatchLogging { log_events: false, log_suppressed_events: false, log_generated_events: false }
    }

    /// Scenario 1 — suppression: a small variation is dropped, a large one
    /// is forwarded and becomes the new `last_send_value`.
    #[test]
    fn suppression_drops_small_variation_forwards_large_one() {
        let mut items: Items = IndexMap::new();
        items.insert(
            "T".into(),
            item(
                "T",
                "sensorLink",
                SendOnChange { active: true, abs_variation: 0.5, rel_variation: 0.0, minimum: Number::NEG_INFINITY, maximum: Number::INFINITY },
            ),
        );
        items.get_mut("T").unwrap().set_last_send_value(Value::new_number(20.0));

        let small = vec![Event::new("sensorLink", "T", EventType::StateInd, Value::new_number(20.3))];
        let retained = Engine::dispatch_tick(&mut items, small, TimePoint(1000), no_links_enabled, no_logging());
        assert!(retained.is_empty());
        assert_eq!(items["T"].last_send_value(), &Value::new_number(20.0));

        let large = vec![Event::new("sensorLink", "T", EventType::StateInd, Value::new_number(20.6))];
        let retained = Engine::dispatch_tick(&mut items, large, TimePoint(1001), no_links_enabled, no_logging());
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].value(), &Value::new_number(20.6));
        assert_eq!(items["T"].last_send_value(), &Value::new_number(20.6));
    }

    /// Scenario 2 — READ→STATE short-circuit: a READ_REQ on a polled item
    /// never reaches a link; the engine answers from `last_send_value`.
    #[test]
    fn read_req_on_polled_item_short_circuits_to_state_ind() {
        let mut items: Items = IndexMap::new();
        let mut polled = Item::new(
            "L",
            "luxLink",
            ValueTypes::parse("NUMBER").unwrap(),
            Unit::Lux,
            true,
            false,
            true,
            Duration::from_secs(60),
            SendOnTimer::default(),
            SendOnChange::default(),
            Duration::ZERO,
        );
        polled.set_last_send_value(Value::new_number(200.0));
        items.insert("L".into(), polled);

        let events = vec![Event::read_req("luxLink", "L")];
        let retained = Engine::dispatch_tick(&mut items, events, TimePoint(1000), no_links_enabled, no_logging());

        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].origin_id(), CONTROL_LINK_ID);
        assert_eq!(retained[0].event_type(), EventType::StateInd);
        assert_eq!(retained[0].value(), &Value::new_number(200.0));
    }

    /// Scenario 3 — WRITE echo: a WRITE_REQ on a readable-but-unresponsive
    /// item is forwarded to its owning link, and a follow-up READ_REQ from
    /// `controlLinkId` is generated alongside it.
    #[test]
    fn write_req_on_unresponsive_item_generates_follow_up_read_req() {
        let mut items: Items = IndexMap::new();
        let switch = Item::new(
            "S",
            "knxLink",
            ValueTypes::parse("BOOLEAN").unwrap(),
            Unit::Unknown,
            true,
            true,
            false,
            Duration::ZERO,
            SendOnTimer::default(),
            SendOnChange::default(),
            Duration::ZERO,
        );
        items.insert("S".into(), switch);

        let events = vec![Event::new("mqttLink", "S", EventType::WriteReq, Value::new_boolean(true))];
        let retained = Engine::dispatch_tick(&mut items, events, TimePoint(1000), no_links_enabled, no_logging());

        assert_eq!(retained.len(), 2);
        assert!(retained.iter().any(|e| e.event_type() == EventType::WriteReq && e.origin_id() == "mqttLink"));
        assert!(retained
            .iter()
            .any(|e| e.event_type() == EventType::ReadReq && e.origin_id() == CONTROL_LINK_ID && e.item_id() == "S"));
    }

    #[test]
    fn send_on_timer_reissues_last_send_value_once_due() {
        let mut items: Items = IndexMap::new();
        let mut timed = Item::new(
            "K",
            CONTROL_LINK_ID,
            ValueTypes::parse("NUMBER").unwrap(),
            Unit::Unknown,
            true,
            false,
            true,
            Duration::ZERO,
            SendOnTimer { active: true, interval: Duration::from_secs(60) },
            SendOnChange::default(),
            Duration::ZERO,
        );
        timed.set_last_send_value(Value::new_number(5.0));
        timed.set_last_send_time(TimePoint(0));
        items.insert("K".into(), timed);

        let retained = Engine::dispatch_tick(&mut items, Events::new(), TimePoint(60), no_links_enabled, no_logging());
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].event_type(), EventType::StateInd);
        assert_eq!(retained[0].value(), &Value::new_number(5.0));
    }
}
