// ── Device description model ──
//
// Read-only parameter metadata supplied by a family's description loader.
// A description lists the functions (channels) of one device type and, per
// channel, the config ("MASTER"), values and link parameter groups.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::CoreError;
use crate::variable::Variable;

/// Kind of a parameter group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum ParameterSetType {
    None,
    #[strum(serialize = "MASTER")]
    Config,
    Values,
    Link,
}

impl ParameterSetType {
    /// Integer stored in the `type` column of parameter rows.
    pub fn as_db(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Config => 1,
            Self::Values => 2,
            Self::Link => 3,
        }
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Config),
            2 => Some(Self::Values),
            3 => Some(Self::Link),
            _ => None,
        }
    }
}

// ── Logical types ───────────────────────────────────────────────────

/// Logical (RPC-facing) type of a parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalType {
    Boolean,
    Integer {
        min: i32,
        max: i32,
        special_values: BTreeMap<String, i32>,
    },
    Enumeration {
        values: Vec<String>,
    },
    Float {
        min: f64,
        max: f64,
        special_values: BTreeMap<String, f64>,
    },
    String,
    Action,
}

impl LogicalType {
    pub fn integer(min: i32, max: i32) -> Self {
        Self::Integer {
            min,
            max,
            special_values: BTreeMap::new(),
        }
    }

    pub fn float(min: f64, max: f64) -> Self {
        Self::Float {
            min,
            max,
            special_values: BTreeMap::new(),
        }
    }

    pub fn enumeration<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enumeration {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Name used in paramset descriptions.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean => "BOOL",
            Self::Integer { .. } => "INTEGER",
            Self::Enumeration { .. } => "ENUM",
            Self::Float { .. } => "FLOAT",
            Self::String => "STRING",
            Self::Action => "ACTION",
        }
    }

    /// Zero value of the type, used when a parameter declares no default.
    pub fn zero(&self) -> Variable {
        match self {
            Self::Boolean | Self::Action => Variable::Bool(false),
            Self::Integer { min, max, .. } => Variable::Integer(0.clamp(*min, *max)),
            Self::Enumeration { .. } => Variable::Integer(0),
            Self::Float { min, max, .. } => Variable::Float(0.0_f64.clamp(*min, *max)),
            Self::String => Variable::String(String::new()),
        }
    }

    /// Bounds as RPC values, for numeric types.
    pub fn bounds(&self) -> Option<(Variable, Variable)> {
        match self {
            Self::Integer { min, max, .. } => Some((Variable::Integer(*min), Variable::Integer(*max))),
            Self::Enumeration { values } => Some((
                Variable::Integer(0),
                Variable::Integer(i32::try_from(values.len().saturating_sub(1)).unwrap_or(i32::MAX)),
            )),
            Self::Float { min, max, .. } => Some((Variable::Float(*min), Variable::Float(*max))),
            _ => None,
        }
    }
}

// ── Codec ───────────────────────────────────────────────────────────

/// Converter between the stored wire encoding and typed values.
pub trait ValueCodec: Send + Sync + fmt::Debug {
    fn encode(&self, logical: &LogicalType, value: &Variable) -> Result<Vec<u8>, String>;
    fn decode(&self, logical: &LogicalType, data: &[u8]) -> Variable;
}

/// Default codec: booleans as one byte, integers as 4-byte big-endian,
/// floats as 8-byte IEEE-754 big-endian, strings as UTF-8.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogicalCodec;

impl ValueCodec for LogicalCodec {
    fn encode(&self, logical: &LogicalType, value: &Variable) -> Result<Vec<u8>, String> {
        match logical {
            LogicalType::Boolean | LogicalType::Action => Ok(vec![u8::from(value.as_bool())]),
            LogicalType::Integer {
                min,
                max,
                special_values,
            } => {
                let number = value
                    .as_str()
                    .and_then(|name| special_values.get(name).copied())
                    .or_else(|| value.as_i32())
                    .ok_or_else(|| format!("{value} is not an integer"))?;
                let number = if special_values.values().any(|v| *v == number) {
                    number
                } else {
                    number.clamp(*min, *max)
                };
                Ok(number.to_be_bytes().to_vec())
            }
            LogicalType::Enumeration { values } => {
                let index = match value {
                    Variable::String(name) => values
                        .iter()
                        .position(|v| v == name)
                        .and_then(|i| i32::try_from(i).ok()),
                    other => other.as_i32(),
                }
                .ok_or_else(|| format!("{value} is not a valid enumeration value"))?;
                Ok(index.to_be_bytes().to_vec())
            }
            LogicalType::Float {
                min,
                max,
                special_values,
            } => {
                let number = value
                    .as_str()
                    .and_then(|name| special_values.get(name).copied())
                    .or_else(|| value.as_f64())
                    .ok_or_else(|| format!("{value} is not a number"))?;
                let number = if special_values.values().any(|v| v.to_bits() == number.to_bits()) {
                    number
                } else {
                    number.clamp(*min, *max)
                };
                Ok(number.to_be_bytes().to_vec())
            }
            LogicalType::String => Ok(match value {
                Variable::String(s) => s.as_bytes().to_vec(),
                Variable::Void => Vec::new(),
                other => other.to_string().into_bytes(),
            }),
        }
    }

    fn decode(&self, logical: &LogicalType, data: &[u8]) -> Variable {
        match logical {
            LogicalType::Boolean | LogicalType::Action => {
                Variable::Bool(data.iter().any(|byte| *byte != 0))
            }
            LogicalType::Integer { .. } | LogicalType::Enumeration { .. } => {
                Variable::Integer(decode_i32(data))
            }
            LogicalType::Float { .. } => match <[u8; 8]>::try_from(data) {
                Ok(bytes) => Variable::Float(f64::from_be_bytes(bytes)),
                Err(_) => Variable::Float(f64::from(decode_i32(data))),
            },
            LogicalType::String => Variable::String(String::from_utf8_lossy(data).into_owned()),
        }
    }
}

/// Big-endian integer from up to four bytes; longer input keeps the low bytes.
fn decode_i32(data: &[u8]) -> i32 {
    let tail = &data[data.len().saturating_sub(4)..];
    let mut bytes = [0u8; 4];
    bytes[4 - tail.len()..].copy_from_slice(tail);
    i32::from_be_bytes(bytes)
}

// ── Parameters ──────────────────────────────────────────────────────

/// Metadata of one parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub id: String,
    pub readable: bool,
    pub writeable: bool,
    pub visible: bool,
    pub service: bool,
    pub internal: bool,
    pub logical: LogicalType,
    pub unit: String,
    default: Variable,
    codec: Arc<dyn ValueCodec>,
}

impl Parameter {
    /// Readable, writeable, visible parameter using [`LogicalCodec`].
    pub fn new(id: impl Into<String>, logical: LogicalType) -> Self {
        let default = logical.zero();
        Self {
            id: id.into(),
            readable: true,
            writeable: true,
            visible: true,
            service: false,
            internal: false,
            logical,
            unit: String::new(),
            default,
            codec: Arc::new(LogicalCodec),
        }
    }

    pub fn read_only(mut self) -> Self {
        self.writeable = false;
        self
    }

    pub fn write_only(mut self) -> Self {
        self.readable = false;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn service(mut self) -> Self {
        self.service = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn with_default(mut self, default: impl Into<Variable>) -> Self {
        self.default = default.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn default_value(&self) -> &Variable {
        &self.default
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self.logical,
            LogicalType::Integer { .. } | LogicalType::Float { .. }
        )
    }

    /// Encode `value` into the stored wire representation.
    pub fn convert_to_packet(&self, value: &Variable) -> Result<Vec<u8>, CoreError> {
        self.codec
            .encode(&self.logical, value)
            .map_err(|reason| CoreError::Conversion {
                parameter: self.id.clone(),
                reason,
            })
    }

    pub fn convert_from_packet(&self, data: &[u8]) -> Variable {
        self.codec.decode(&self.logical, data)
    }

    /// Wire encoding of the default value.
    pub fn default_packet(&self) -> Result<Vec<u8>, CoreError> {
        self.convert_to_packet(&self.default)
    }

    /// RPC operations bitmask: 1 read, 2 write, 4 event.
    pub fn operations(&self) -> i32 {
        let mut ops = 0;
        if self.readable {
            ops |= 1 | 4;
        }
        if self.writeable {
            ops |= 2;
        }
        ops
    }

    /// RPC UI flags: 1 visible, 2 internal, 4 service.
    pub fn ui_flags(&self) -> i32 {
        let mut flags = 0;
        if self.visible {
            flags |= 1;
        }
        if self.internal {
            flags |= 2;
        }
        if self.service {
            flags |= 4;
        }
        flags
    }
}

/// A named parameter group of one channel.
#[derive(Debug, Clone)]
pub struct ParameterGroup {
    pub id: String,
    pub kind: ParameterSetType,
    parameters: BTreeMap<String, Arc<Parameter>>,
}

impl ParameterGroup {
    pub fn new(id: impl Into<String>, kind: ParameterSetType) -> Self {
        Self {
            id: id.into(),
            kind,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with(mut self, parameter: Parameter) -> Self {
        self.insert(parameter);
        self
    }

    pub fn insert(&mut self, parameter: Parameter) {
        self.parameters
            .insert(parameter.id.clone(), Arc::new(parameter));
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Parameter>> {
        self.parameters.get(id)
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Arc<Parameter>> {
        self.parameters.values()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

// ── Functions and devices ───────────────────────────────────────────

/// One channel of a device type.
#[derive(Debug, Clone)]
pub struct Function {
    pub channel: u32,
    pub type_name: String,
    pub config: ParameterGroup,
    pub variables: ParameterGroup,
    pub link: ParameterGroup,
    /// Config group used when the channel runs its alternative function.
    pub alternative_config: Option<ParameterGroup>,
    pub link_sender_types: Vec<String>,
    pub link_receiver_types: Vec<String>,
    /// Partner channel for grouped (e.g. up/down button pair) channels.
    pub grouped_with: Option<u32>,
    /// Channel-0 config parameter whose last byte is the number of
    /// channels of this type in use.
    pub count_from_variable: Option<String>,
    pub visible: bool,
    pub internal: bool,
}

impl Function {
    pub fn new(channel: u32, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            channel,
            config: ParameterGroup::new(format!("{type_name}_master"), ParameterSetType::Config),
            variables: ParameterGroup::new(format!("{type_name}_values"), ParameterSetType::Values),
            link: ParameterGroup::new(format!("{type_name}_link"), ParameterSetType::Link),
            type_name,
            alternative_config: None,
            link_sender_types: Vec::new(),
            link_receiver_types: Vec::new(),
            grouped_with: None,
            count_from_variable: None,
            visible: true,
            internal: false,
        }
    }

    pub fn with_config(mut self, parameter: Parameter) -> Self {
        self.config.insert(parameter);
        self
    }

    pub fn with_value(mut self, parameter: Parameter) -> Self {
        self.variables.insert(parameter);
        self
    }

    pub fn with_link(mut self, parameter: Parameter) -> Self {
        self.link.insert(parameter);
        self
    }

    pub fn with_alternative_config(mut self, group: ParameterGroup) -> Self {
        self.alternative_config = Some(group);
        self
    }

    pub fn link_sender(mut self, function_type: impl Into<String>) -> Self {
        self.link_sender_types.push(function_type.into());
        self
    }

    pub fn link_receiver(mut self, function_type: impl Into<String>) -> Self {
        self.link_receiver_types.push(function_type.into());
        self
    }

    pub fn grouped_with(mut self, channel: u32) -> Self {
        self.grouped_with = Some(channel);
        self
    }

    pub fn count_from(mut self, variable: impl Into<String>) -> Self {
        self.count_from_variable = Some(variable.into());
        self
    }

    pub fn is_link_sender(&self) -> bool {
        !self.link_sender_types.is_empty()
    }

    pub fn is_link_receiver(&self) -> bool {
        !self.link_receiver_types.is_empty()
    }

    pub fn group(&self, kind: ParameterSetType) -> Option<&ParameterGroup> {
        match kind {
            ParameterSetType::Config => Some(&self.config),
            ParameterSetType::Values => Some(&self.variables),
            ParameterSetType::Link => Some(&self.link),
            ParameterSetType::None => None,
        }
    }

    /// Look up a parameter, falling back to the alternative config group.
    pub fn parameter(&self, kind: ParameterSetType, id: &str) -> Option<&Arc<Parameter>> {
        let primary = self.group(kind).and_then(|group| group.get(id));
        match (primary, kind) {
            (Some(found), _) => Some(found),
            (None, ParameterSetType::Config) => {
                self.alternative_config.as_ref().and_then(|group| group.get(id))
            }
            _ => None,
        }
    }
}

/// Description of one device type.
#[derive(Debug, Clone, Default)]
pub struct DeviceDescription {
    pub type_id: u32,
    pub type_string: String,
    pub firmware_version: i32,
    /// Receive-mode bits: 1 always, 2 burst, 4 config, 8 wake-up, 16 lazy config.
    pub rx_modes: u32,
    functions: BTreeMap<u32, Arc<Function>>,
}

impl DeviceDescription {
    pub fn new(type_id: u32, type_string: impl Into<String>) -> Self {
        Self {
            type_id,
            type_string: type_string.into(),
            firmware_version: 0,
            rx_modes: 1,
            functions: BTreeMap::new(),
        }
    }

    pub fn with_function(mut self, function: Function) -> Self {
        self.functions.insert(function.channel, Arc::new(function));
        self
    }

    pub fn with_firmware_version(mut self, version: i32) -> Self {
        self.firmware_version = version;
        self
    }

    pub fn with_rx_modes(mut self, rx_modes: u32) -> Self {
        self.rx_modes = rx_modes;
        self
    }

    pub fn function(&self, channel: u32) -> Option<&Arc<Function>> {
        self.functions.get(&channel)
    }

    pub fn functions(&self) -> impl Iterator<Item = (u32, &Arc<Function>)> {
        self.functions.iter().map(|(channel, f)| (*channel, f))
    }

    pub fn channels(&self) -> impl Iterator<Item = u32> + '_ {
        self.functions.keys().copied()
    }

    pub fn parameter(
        &self,
        channel: u32,
        kind: ParameterSetType,
        id: &str,
    ) -> Option<&Arc<Parameter>> {
        self.function(channel)
            .and_then(|function| function.parameter(kind, id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn paramset_type_names_round_trip_through_strum() {
        assert_eq!(ParameterSetType::Config.to_string(), "MASTER");
        assert_eq!(ParameterSetType::Values.to_string(), "VALUES");
        assert_eq!(
            ParameterSetType::from_str("link").unwrap(),
            ParameterSetType::Link
        );
        assert_eq!(ParameterSetType::from_db(2), Some(ParameterSetType::Values));
        assert_eq!(ParameterSetType::from_db(9), None);
    }

    #[test]
    fn integer_codec_clamps_and_honours_special_values() {
        let mut logical = LogicalType::integer(0, 100);
        if let LogicalType::Integer { special_values, .. } = &mut logical {
            special_values.insert("NOT_USED".into(), 255);
        }
        let parameter = Parameter::new("DELAY", logical);

        let bytes = parameter.convert_to_packet(&Variable::Integer(250)).unwrap();
        assert_eq!(parameter.convert_from_packet(&bytes), Variable::Integer(100));

        let bytes = parameter
            .convert_to_packet(&Variable::String("NOT_USED".into()))
            .unwrap();
        assert_eq!(parameter.convert_from_packet(&bytes), Variable::Integer(255));
    }

    #[test]
    fn float_codec_keeps_precision() {
        let parameter = Parameter::new("LEVEL", LogicalType::float(0.0, 1.0));
        let bytes = parameter.convert_to_packet(&Variable::Float(0.5)).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(parameter.convert_from_packet(&bytes), Variable::Float(0.5));
    }

    #[test]
    fn short_integer_payloads_decode_big_endian() {
        assert_eq!(decode_i32(&[]), 0);
        assert_eq!(decode_i32(&[0x01, 0x02]), 0x0102);
        assert_eq!(decode_i32(&[0xAA, 0, 0, 0, 7]), 7);
    }

    #[test]
    fn enumeration_accepts_names_and_indices() {
        let parameter = Parameter::new("MODE", LogicalType::enumeration(["AUTO", "MANU"]));
        let by_name = parameter
            .convert_to_packet(&Variable::String("MANU".into()))
            .unwrap();
        let by_index = parameter.convert_to_packet(&Variable::Integer(1)).unwrap();
        assert_eq!(by_name, by_index);
        assert!(parameter
            .convert_to_packet(&Variable::String("BOOST".into()))
            .is_err());
    }

    #[test]
    fn alternative_config_is_consulted_for_config_lookups() {
        let function = Function::new(1, "SWITCH").with_alternative_config(
            ParameterGroup::new("alt", ParameterSetType::Config)
                .with(Parameter::new("ALT_ONLY", LogicalType::Boolean)),
        );
        assert!(function.parameter(ParameterSetType::Config, "ALT_ONLY").is_some());
        assert!(function.parameter(ParameterSetType::Values, "ALT_ONLY").is_none());
    }
}
