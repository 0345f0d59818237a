// ── RPC views ──
//
// Read-only projections of a peer for RPC clients: device and paramset
// descriptions, the flat value dump and the service-message list.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::Peer;
use crate::description::{Function, LogicalType, Parameter, ParameterSetType};
use crate::error::CoreError;
use crate::variable::Variable;

const DESCRIPTION_VERSION: i32 = 1;

fn describe_parameter(parameter: &Parameter, tab_order: usize) -> Variable {
    let mut entry = Variable::from_pairs([
        ("ID", Variable::from(parameter.id.as_str())),
        ("TYPE", Variable::from(parameter.logical.type_name())),
        ("OPERATIONS", Variable::Integer(parameter.operations())),
        ("FLAGS", Variable::Integer(parameter.ui_flags())),
        ("DEFAULT", parameter.default_value().clone()),
        ("UNIT", Variable::from(parameter.unit.as_str())),
        (
            "TAB_ORDER",
            Variable::Integer(i32::try_from(tab_order).unwrap_or(i32::MAX)),
        ),
    ]);
    if let Some((min, max)) = parameter.logical.bounds() {
        entry.insert("MIN", min);
        entry.insert("MAX", max);
    }
    match &parameter.logical {
        LogicalType::Enumeration { values } => {
            entry.insert(
                "VALUE_LIST",
                Variable::Array(values.iter().map(|v| Variable::from(v.as_str())).collect()),
            );
        }
        LogicalType::Integer { special_values, .. } if !special_values.is_empty() => {
            entry.insert("SPECIAL", special_list(special_values, |v| Variable::Integer(*v)));
        }
        LogicalType::Float { special_values, .. } if !special_values.is_empty() => {
            entry.insert("SPECIAL", special_list(special_values, |v| Variable::Float(*v)));
        }
        _ => {}
    }
    entry
}

fn special_list<T>(values: &BTreeMap<String, T>, convert: impl Fn(&T) -> Variable) -> Variable {
    Variable::Array(
        values
            .iter()
            .map(|(id, value)| {
                Variable::from_pairs([("ID", Variable::from(id.as_str())), ("VALUE", convert(value))])
            })
            .collect(),
    )
}

fn role_list(types: &[String]) -> Variable {
    Variable::String(types.join(" "))
}

impl Peer {
    /// Every value of every channel with its type and access flags.
    ///
    /// Write-only parameters are listed (without `VALUE`) only when
    /// `return_write_only` is set.
    pub fn get_all_values(&self, return_write_only: bool) -> Result<Variable, CoreError> {
        self.ensure_active()?;
        let info = self.info();
        let mut channels = Vec::new();
        {
            let sets = self.paramsets.lock();
            for (channel, function) in self.description.functions() {
                let mut paramset = Variable::new_struct();
                for (name, entry) in sets.values.get(&channel).into_iter().flatten() {
                    let parameter = &entry.parameter;
                    if !parameter.readable && !return_write_only {
                        continue;
                    }
                    let mut value = Variable::from_pairs([
                        ("TYPE", Variable::from(parameter.logical.type_name())),
                        ("READABLE", Variable::Bool(parameter.readable)),
                        ("WRITEABLE", Variable::Bool(parameter.writeable)),
                    ]);
                    if parameter.readable {
                        value.insert("VALUE", parameter.convert_from_packet(&entry.raw_data));
                    }
                    paramset.insert(name.clone(), value);
                }
                channels.push(Variable::from_pairs([
                    ("INDEX", Variable::from(i64::from(channel))),
                    ("TYPE", Variable::from(function.type_name.as_str())),
                    ("PARAMSET", paramset),
                ]));
            }
        }
        Ok(Variable::from_pairs([
            ("ID", Variable::from(self.id())),
            ("ADDRESS", Variable::from(self.serial.as_str())),
            ("TYPE", Variable::from(self.type_string(&info.type_string))),
            ("TYPE_ID", Variable::from(i64::from(self.description.type_id))),
            ("NAME", Variable::String(info.name)),
            ("CHANNELS", Variable::Array(channels)),
        ]))
    }

    /// Parameter metadata of one paramset, keyed by parameter id.
    pub fn get_paramset_description(
        &self,
        channel: u32,
        kind: ParameterSetType,
    ) -> Result<Variable, CoreError> {
        self.ensure_active()?;
        let function = self
            .description
            .function(channel)
            .ok_or(CoreError::UnknownChannel { channel })?;
        let group = function.group(kind).ok_or_else(|| CoreError::UnknownParamset {
            paramset: kind.to_string(),
        })?;
        let mut parameters: Vec<&Parameter> = group.parameters().map(Arc::as_ref).collect();
        if kind == ParameterSetType::Config {
            if let Some(alternative) = &function.alternative_config {
                parameters.extend(
                    alternative
                        .parameters()
                        .filter(|p| group.get(&p.id).is_none())
                        .map(Arc::as_ref),
                );
            }
        }
        Ok(Variable::Struct(
            parameters
                .into_iter()
                .filter(|parameter| parameter.visible || parameter.service)
                .enumerate()
                .map(|(index, parameter)| (parameter.id.clone(), describe_parameter(parameter, index)))
                .collect(),
        ))
    }

    /// Id of the description group behind a paramset.
    pub fn get_paramset_id(&self, channel: u32, kind: ParameterSetType) -> Result<String, CoreError> {
        self.ensure_active()?;
        let function = self
            .description
            .function(channel)
            .ok_or(CoreError::UnknownChannel { channel })?;
        function
            .group(kind)
            .map(|group| group.id.clone())
            .ok_or_else(|| CoreError::UnknownParamset {
                paramset: kind.to_string(),
            })
    }

    /// Device description (`None`) or the description of one channel.
    pub fn get_device_description(&self, channel: Option<u32>) -> Result<Variable, CoreError> {
        self.ensure_active()?;
        let info = self.info();
        let Some(channel) = channel else {
            let children = self
                .channels_in_use()
                .into_iter()
                .map(|channel| Variable::String(format!("{}:{channel}", self.serial)))
                .collect();
            let firmware = if info.firmware_version_string.is_empty() {
                format!("{:X}", info.firmware_version.max(self.description.firmware_version))
            } else {
                info.firmware_version_string
            };
            return Ok(Variable::from_pairs([
                ("ADDRESS", Variable::from(self.serial.as_str())),
                ("CHILDREN", Variable::Array(children)),
                ("FIRMWARE", Variable::String(firmware)),
                ("ID", Variable::from(self.id())),
                ("PARAMSETS", Variable::Array(vec![Variable::from("MASTER")])),
                ("PARENT", Variable::from("")),
                ("RX_MODE", Variable::from(i64::from(self.description.rx_modes))),
                ("TYPE", Variable::from(self.type_string(&info.type_string))),
                ("TYPE_ID", Variable::from(i64::from(self.description.type_id))),
                ("VERSION", Variable::Integer(DESCRIPTION_VERSION)),
            ]));
        };

        let function = self
            .description
            .function(channel)
            .ok_or(CoreError::UnknownChannel { channel })?;
        Ok(self.describe_channel(channel, function, &info.type_string))
    }

    /// Active service messages; see [`crate::service_messages::ServiceMessages::get`].
    pub fn get_service_messages(&self, return_id: bool) -> Result<Variable, CoreError> {
        self.ensure_active()?;
        Ok(self.service_messages.get(return_id))
    }

    /// Whether value updates from this peer may be used. `false` while a
    /// configuration change is pending.
    pub fn report_value_usage(&self) -> Result<bool, CoreError> {
        self.ensure_active()?;
        Ok(!self.service_messages.config_pending())
    }

    fn describe_channel(&self, channel: u32, function: &Function, type_string: &str) -> Variable {
        let direction = if function.is_link_sender() {
            1
        } else if function.is_link_receiver() {
            2
        } else {
            0
        };
        let mut flags = 0;
        if function.visible {
            flags |= 1;
        }
        if function.internal {
            flags |= 2;
        }
        let mut paramsets = vec![Variable::from("MASTER"), Variable::from("VALUES")];
        if !function.link.is_empty() {
            paramsets.push(Variable::from("LINK"));
        }
        let mut description = Variable::from_pairs([
            ("ADDRESS", Variable::String(format!("{}:{channel}", self.serial))),
            ("DIRECTION", Variable::Integer(direction)),
            ("FLAGS", Variable::Integer(flags)),
            ("ID", Variable::from(self.id())),
            ("INDEX", Variable::from(i64::from(channel))),
            ("LINK_SOURCE_ROLES", role_list(&function.link_sender_types)),
            ("LINK_TARGET_ROLES", role_list(&function.link_receiver_types)),
            ("PARAMSETS", Variable::Array(paramsets)),
            ("PARENT", Variable::from(self.serial.as_str())),
            ("PARENT_TYPE", Variable::from(self.type_string(type_string))),
            ("TYPE", Variable::from(function.type_name.as_str())),
            ("VERSION", Variable::Integer(DESCRIPTION_VERSION)),
        ]);
        if let Some(partner) = function.grouped_with {
            description.insert("GROUP", Variable::String(format!("{}:{partner}", self.serial)));
        }
        description
    }

    fn type_string<'a>(&'a self, stored: &'a str) -> &'a str {
        if stored.is_empty() {
            &self.description.type_string
        } else {
            stored
        }
    }

    /// Visible channels, limited per function type by `count_from_variable`.
    fn channels_in_use(&self) -> Vec<u32> {
        let mut seen: BTreeMap<&str, u32> = BTreeMap::new();
        let mut channels = Vec::new();
        for (channel, function) in self.description.functions() {
            if !function.visible {
                continue;
            }
            let ordinal = seen.entry(function.type_name.as_str()).or_default();
            let position = *ordinal;
            *ordinal += 1;
            if let Some(variable) = &function.count_from_variable {
                if let Some(count) = self.config_count(variable) {
                    if position >= count {
                        continue;
                    }
                }
            }
            channels.push(channel);
        }
        channels
    }

    fn config_count(&self, variable: &str) -> Option<u32> {
        let sets = self.paramsets.lock();
        let entry = sets.config.get(&0)?.get(variable)?;
        entry.raw_data.last().copied().map(u32::from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn enum_parameter_lists_values_and_bounds() {
        let parameter = Parameter::new(
            "MODE",
            LogicalType::enumeration(["AUTO", "MANUAL", "PARTY"]),
        )
        .with_unit("");
        let entry = describe_parameter(&parameter, 3);
        assert_eq!(entry.get("TYPE"), Some(&Variable::from("ENUM")));
        assert_eq!(entry.get("MAX"), Some(&Variable::Integer(2)));
        assert_eq!(entry.get("TAB_ORDER"), Some(&Variable::Integer(3)));
        assert_eq!(
            entry.get("VALUE_LIST").and_then(Variable::as_array).map(<[Variable]>::len),
            Some(3)
        );
    }

    #[test]
    fn special_values_are_described() {
        let mut special_values = BTreeMap::new();
        special_values.insert("NOT_USED".to_owned(), -1);
        let parameter = Parameter::new(
            "TIMEOUT",
            LogicalType::Integer {
                min: -1,
                max: 100,
                special_values,
            },
        )
        .read_only();
        let entry = describe_parameter(&parameter, 0);
        assert_eq!(entry.get("OPERATIONS"), Some(&Variable::Integer(5)));
        let special = entry.get("SPECIAL").and_then(Variable::as_array).unwrap();
        assert_eq!(special[0].get("ID"), Some(&Variable::from("NOT_USED")));
    }
}
