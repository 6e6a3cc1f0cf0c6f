//! Startup configuration: a single JSON document (comments and trailing
//! commas tolerated) describing the global logging flags, the item table
//! and the link table. Read once; nothing here changes during the run.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

fn default_true() -> bool {
    true
}

fn default_max_receive_duration() -> u64 {
    20
}

fn default_max_send_duration() -> u64 {
    20
}

fn neg_infinity() -> f64 {
    f64::MIN
}

fn pos_infinity() -> f64 {
    f64::MAX
}

fn default_send_on_timer_duration() -> u64 {
    300
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "weaver".into()
}

fn default_knx_port() -> u16 {
    3671
}

fn default_reconnect_interval() -> u64 {
    60
}

fn default_physical_addr() -> String {
    "0.0.0".into()
}

fn default_control_resp_timeout() -> u64 {
    10
}

fn default_tunnel_ack_timeout() -> u64 {
    1
}

fn default_ldata_con_timeout() -> u64 {
    3
}

fn default_timeout_interval() -> u64 {
    60
}

fn default_max_msg_size() -> usize {
    1024
}

fn default_in_pattern() -> String {
    "^(.*)$".into()
}

fn default_out_pattern() -> String {
    "%s".into()
}

fn default_factor() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub log_p_select_calls: bool,
    #[serde(default)]
    pub log_events: bool,
    #[serde(default = "default_true")]
    pub log_suppressed_events: bool,
    #[serde(default = "default_true")]
    pub log_generated_events: bool,
    #[serde(default)]
    pub log_file_name: String,
    #[serde(default)]
    pub max_log_file_size: u64,
    #[serde(default)]
    pub max_log_file_count: u32,
    pub items: Vec<ItemConfig>,
    pub links: Vec<LinkConfig>,
}

impl Config {
    /// Reads and parses the document at `path`, tolerating `//` comments
    /// and trailing commas the way the original JSON reader does.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let stripped = strip_json5_lite(&raw);
        serde_json::from_str(&stripped).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Strips `//` line comments and trailing commas before the closing
/// bracket/brace of an array or object. Not a full JSON5 parser — just
/// enough to tolerate the two relaxations the original config reader's
/// `rapidjson` flags (`kParseCommentsFlag`, `kParseTrailingCommasFlag`)
/// allowed, while keeping them out of string literals.
fn strip_json5_lite(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some((_, c)) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if matches!(chars.peek(), Some((_, '/'))) => {
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ',' => {
                let mut lookahead = chars.clone();
                let mut next_significant = None;
                for (_, c) in lookahead.by_ref() {
                    if !c.is_whitespace() {
                        next_significant = Some(c);
                        break;
                    }
                }
                if !matches!(next_significant, Some(']') | Some('}')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub owner_id: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_true")]
    pub readable: bool,
    #[serde(default = "default_true")]
    pub writable: bool,
    #[serde(default = "default_true")]
    pub responsive: bool,
    #[serde(default)]
    pub polling_interval: u64,
    #[serde(default)]
    pub history_period: u64,
    pub send_on_timer: Option<SendOnTimerConfig>,
    pub send_on_change: Option<SendOnChangeConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOnTimerConfig {
    #[serde(default = "default_send_on_timer_duration")]
    pub duration: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOnChangeConfig {
    #[serde(default)]
    pub abs_variation: f64,
    #[serde(default)]
    pub rel_variation: f64,
    #[serde(default = "neg_infinity")]
    pub minimum: f64,
    #[serde(default = "pos_infinity")]
    pub maximum: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanAsStringConfig {
    #[serde(default = "false_value_default")]
    pub false_value: String,
    #[serde(default = "true_value_default")]
    pub true_value: String,
    pub unwritable_false_value: Option<String>,
    pub unwritable_true_value: Option<String>,
}

fn false_value_default() -> String {
    "false".into()
}

fn true_value_default() -> String {
    "true".into()
}

impl BooleanAsStringConfig {
    pub fn unwritable_false_value(&self) -> &str {
        self.unwritable_false_value.as_deref().unwrap_or(&self.false_value)
    }

    pub fn unwritable_true_value(&self) -> &str {
        self.unwritable_true_value.as_deref().unwrap_or(&self.true_value)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimePointAsStringConfig {
    pub format: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoidAsStringConfig {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub unwritable_value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndefinedAsStringConfig {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutMappingConfig {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub equals: Option<String>,
    pub replacement: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifierConfig {
    pub item_id: String,
    pub unit: Option<String>,
    pub in_obis_code: Option<String>,
    pub in_json_pointer: Option<String>,
    pub in_pattern: Option<String>,
    #[serde(default)]
    pub in_mappings: HashMap<String, String>,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub summand: f64,
    pub round_precision: Option<u32>,
    #[serde(default)]
    pub out_mappings: Vec<OutMappingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub suppress_read_events: bool,
    #[serde(default)]
    pub suppress_undefined: bool,
    pub operational_item: Option<String>,
    pub error_counter_item: Option<String>,
    #[serde(default = "default_max_receive_duration")]
    pub max_receive_duration: u64,
    #[serde(default = "default_max_send_duration")]
    pub max_send_duration: u64,
    #[serde(default)]
    pub number_as_string: bool,
    pub boolean_as_string: Option<BooleanAsStringConfig>,
    pub time_point_as_string: Option<TimePointAsStringConfig>,
    pub void_as_string: Option<VoidAsStringConfig>,
    #[serde(default)]
    pub void_as_boolean: bool,
    pub undefined_as_string: Option<UndefinedAsStringConfig>,
    #[serde(default)]
    pub modifiers: Vec<ModifierConfig>,

    pub knx: Option<KnxConfig>,
    pub mqtt: Option<MqttConfig>,
    pub modbus: Option<ModbusConfig>,
    pub port: Option<PortConfig>,
    pub http: Option<HttpConfig>,
    pub tcp: Option<TcpConfig>,
    pub generator: Option<GeneratorConfig>,
    pub storage: Option<StorageConfig>,
}

pub enum HandlerConfig<'a> {
    Knx(&'a KnxConfig),
    Mqtt(&'a MqttConfig),
    Modbus(&'a ModbusConfig),
    Port(&'a PortConfig),
    Http(&'a HttpConfig),
    Tcp(&'a TcpConfig),
    Generator(&'a GeneratorConfig),
    Storage(&'a StorageConfig),
}

impl LinkConfig {
    pub fn handler_config(&self) -> Result<HandlerConfig<'_>, ConfigError> {
        let mut found: Vec<HandlerConfig<'_>> = Vec::new();
        if let Some(c) = &self.knx {
            found.push(HandlerConfig::Knx(c));
        }
        if let Some(c) = &self.mqtt {
            found.push(HandlerConfig::Mqtt(c));
        }
        if let Some(c) = &self.modbus {
            found.push(HandlerConfig::Modbus(c));
        }
        if let Some(c) = &self.port {
            found.push(HandlerConfig::Port(c));
        }
        if let Some(c) = &self.http {
            found.push(HandlerConfig::Http(c));
        }
        if let Some(c) = &self.tcp {
            found.push(HandlerConfig::Tcp(c));
        }
        if let Some(c) = &self.generator {
            found.push(HandlerConfig::Generator(c));
        }
        if let Some(c) = &self.storage {
            found.push(HandlerConfig::Storage(c));
        }
        match found.len() {
            1 => Ok(found.into_iter().next().unwrap()),
            0 => Err(ConfigError::Invalid(format!(
                "link {} has no handler block (knx/mqtt/modbus/port/http/tcp/generator/storage)",
                self.id
            ))),
            _ => Err(ConfigError::Invalid(format!(
                "link {} defines more than one handler block",
                self.id
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnxConfig {
    pub local_ip_addr: IpAddr,
    #[serde(default)]
    pub nat_mode: bool,
    pub ip_addr: IpAddr,
    #[serde(default = "default_knx_port")]
    pub ip_port: u16,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    #[serde(default = "default_reconnect_interval")]
    pub conn_state_req_interval: u64,
    #[serde(default = "default_control_resp_timeout")]
    pub control_resp_timeout: u64,
    #[serde(default = "default_tunnel_ack_timeout")]
    pub tunnel_ack_timeout: u64,
    #[serde(default = "default_ldata_con_timeout")]
    pub ldata_con_timeout: u64,
    #[serde(default = "default_physical_addr")]
    pub physical_addr: String,
    #[serde(default)]
    pub log_raw_messages: bool,
    #[serde(default)]
    pub log_data: bool,
    /// Reject bindings whose `stateGa` and `writeGa` are equal non-null
    /// group addresses. The original source disabled this check; we default
    /// to enforcing it and expose this flag to weaken it back.
    #[serde(default)]
    pub allow_equal_state_and_write_ga: bool,
    pub bindings: Vec<KnxBindingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnxBindingConfig {
    pub item_id: String,
    #[serde(default)]
    pub state_ga: Option<String>,
    #[serde(default)]
    pub write_ga: Option<String>,
    pub dpt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttTlsConfig {
    #[serde(default)]
    pub ca_file: String,
    #[serde(default)]
    pub ca_path: String,
    #[serde(default)]
    pub ciphers: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    pub hostname: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub tls: Option<MqttTlsConfig>,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    #[serde(default)]
    pub idle_timeout: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub retain_flag: bool,
    pub state_topic_pattern: Option<String>,
    pub write_topic_pattern: Option<String>,
    pub read_topic_pattern: Option<String>,
    #[serde(default)]
    pub sub_topics: Vec<String>,
    #[serde(default)]
    pub log_messages: bool,
    #[serde(default)]
    pub log_lib_events: bool,
    #[serde(default)]
    pub bindings: Vec<MqttBindingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttMappingConfig {
    pub internal: String,
    pub external: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttBindingConfig {
    pub item_id: String,
    pub state_topic: Option<String>,
    #[serde(default)]
    pub state_topics: Vec<String>,
    #[serde(default)]
    pub write_topic: String,
    #[serde(default)]
    pub read_topic: String,
    #[serde(default = "default_in_pattern")]
    pub in_pattern: String,
    #[serde(default = "default_out_pattern")]
    pub out_pattern: String,
    #[serde(default)]
    pub mappings: Vec<MqttMappingConfig>,
}

impl MqttBindingConfig {
    /// `stateTopic` and `stateTopics` are both accepted and merged, matching
    /// the set the original reader builds.
    pub fn all_state_topics(&self) -> Vec<String> {
        let mut topics = self.state_topics.clone();
        if let Some(topic) = &self.state_topic {
            topics.push(topic.clone());
        }
        topics
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    pub name: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: String,
    #[serde(default = "default_timeout_interval")]
    pub timeout_interval: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reopen_interval: u64,
    pub msg_pattern: String,
    #[serde(default = "default_max_msg_size")]
    pub max_msg_size: usize,
    #[serde(default)]
    pub log_raw_data: bool,
    #[serde(default)]
    pub log_raw_data_in_hex: bool,
    pub bindings: Vec<PatternBindingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternBindingConfig {
    pub item_id: String,
    pub pattern: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorConfig {
    pub bindings: Vec<GeneratorBindingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorBindingConfig {
    pub item_id: String,
    pub value: String,
    pub interval: u64,
    pub event_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub log_transfers: bool,
    #[serde(default)]
    pub verbose_mode: bool,
    pub bindings: Vec<HttpBindingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpBindingConfig {
    pub item_id: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub request: String,
    pub response_pattern: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpConfig {
    pub hostname: String,
    pub port: u16,
    pub msg_pattern: String,
    #[serde(default)]
    pub log_raw_data: bool,
    #[serde(default)]
    pub log_raw_data_in_hex: bool,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    pub bindings: Vec<PatternBindingConfig>,
}

fn default_modbus_response_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusConfig {
    pub hostname: String,
    pub port: u16,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    #[serde(default = "default_modbus_response_timeout")]
    pub response_timeout: u64,
    #[serde(default)]
    pub log_raw_data: bool,
    #[serde(default)]
    pub log_msgs: bool,
    pub bindings: Vec<ModbusBindingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusBindingConfig {
    pub item_id: String,
    #[serde(default)]
    pub unit_id: u8,
    pub first_register: u16,
    pub last_register: u16,
    pub factor_register: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub file_name: String,
    pub bindings: Vec<StorageBindingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageBindingConfig {
    pub item_id: String,
    pub initial_boolean: Option<bool>,
    pub initial_number: Option<f64>,
    pub initial_string: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_line_comments_and_trailing_commas() {
        let input = "{\n  // a comment\n  \"a\": 1,\n  \"b\": [1, 2,],\n}";
        let stripped = strip_json5_lite(input);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["a"], 1);
        assert_eq!(value["b"][1], 2);
    }

    #[test]
    fn preserves_slashes_inside_strings() {
        let input = r#"{"pattern": "a//b", "n": 1,}"#;
        let stripped = strip_json5_lite(input);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["pattern"], "a//b");
    }

    #[test]
    fn parses_minimal_document() {
        let doc = r#"{
            "items": [
                {"id": "temp", "type": "NUMBER", "ownerId": "controlLinkId"}
            ],
            "links": []
        }"#;
        let config: Config = serde_json::from_str(doc).unwrap();
        assert_eq!(config.items.len(), 1);
        assert!(config.log_suppressed_events);
    }
}
