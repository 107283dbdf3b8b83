use crate::conditions::{
    EMPTY_ARRAY_ITEM_PARAMETER_VALUES, INCOMPLETE_CONFIG_MAP_VALUE_PARAMETER_VALUES,
    INCOMPLETE_SECRET_VALUE_PARAMETER_VALUES, INCONSISTENT_PARAMETER_VALUES,
    MISSING_PARAMETER_VALUES, RESTRICTED_PARAMETERS_IN_USE, UNDEFINED_PARAMETER,
    WRONG_PARAMETER_VALUE_TYPE,
};
use crate::crds::build::{ParamValue, SingleValue};
use crate::crds::strategy::{Parameter, ParameterType};
use crate::resolver::override_params;
use crate::validate::{ValidationError, ValidationResult};

const SYSTEM_RESERVED_PARAMS: [&str; 3] = ["BUILDER_IMAGE", "DOCKERFILE", "CONTEXT_DIR"];
const SYSTEM_PARAM_PREFIX: &str = "shp-";

pub fn is_system_reserved_parameter(name: &str) -> bool {
    SYSTEM_RESERVED_PARAMS.contains(&name) || name.starts_with(SYSTEM_PARAM_PREFIX)
}

/// Checks a Build's own values; missing values are tolerated because a
/// BuildRun may still supply them.
pub fn build_parameters(definitions: &[Parameter], values: &[ParamValue]) -> ValidationResult {
    validate_parameters(definitions, values, true)
}

pub fn buildrun_parameters(
    definitions: &[Parameter],
    build_values: &[ParamValue],
    buildrun_values: &[ParamValue],
) -> ValidationResult {
    let values = override_params(build_values, buildrun_values);
    validate_parameters(definitions, &values, false)
}

fn has_incomplete_config_map_value(value: &SingleValue) -> bool {
    value
        .config_map_value
        .as_ref()
        .is_some_and(|r| r.name.is_empty() || r.key.is_empty())
}

fn has_incomplete_secret_value(value: &SingleValue) -> bool {
    value
        .secret_value
        .as_ref()
        .is_some_and(|r| r.name.is_empty() || r.key.is_empty())
}

#[derive(Default)]
struct Findings {
    wrong_type: Vec<String>,
    missing: Vec<String>,
    empty_item: Vec<String>,
    multi_value: Vec<String>,
    incomplete_config_map: Vec<String>,
    incomplete_secret: Vec<String>,
}

fn validate_parameters(
    definitions: &[Parameter],
    values: &[ParamValue],
    ignore_missing: bool,
) -> ValidationResult {
    let mut restricted = Vec::new();
    let mut undefined = Vec::new();
    for value in values {
        if is_system_reserved_parameter(&value.name) {
            restricted.push(value.name.as_str());
        } else if !definitions.iter().any(|d| d.name == value.name) {
            undefined.push(value.name.as_str());
        }
    }

    if !restricted.is_empty() {
        return Err(ValidationError::new(
            RESTRICTED_PARAMETERS_IN_USE,
            format!(
                "The following parameters are restricted and cannot be set: {}",
                restricted.join(", ")
            ),
        ));
    }
    if !undefined.is_empty() {
        return Err(ValidationError::new(
            UNDEFINED_PARAMETER,
            format!(
                "The following parameters are not defined in the build strategy: {}",
                undefined.join(", ")
            ),
        ));
    }

    let mut findings = Findings::default();
    for definition in definitions {
        let name = definition.name.clone();
        let value = values.iter().find(|v| v.name == definition.name);

        match definition.type_ {
            ParameterType::String => {
                if let Some(value) = value {
                    if value.values.is_some() {
                        findings.wrong_type.push(name.clone());
                    }
                    if value.single.set_count() > 1 {
                        findings.multi_value.push(name.clone());
                    }
                    if has_incomplete_config_map_value(&value.single) {
                        findings.incomplete_config_map.push(name.clone());
                    }
                    if has_incomplete_secret_value(&value.single) {
                        findings.incomplete_secret.push(name.clone());
                    }
                }
                if definition.default.is_none() && !value.is_some_and(|v| v.single.is_set()) {
                    findings.missing.push(name);
                }
            }
            ParameterType::Array => {
                if let Some(value) = value {
                    if value.single.is_set() {
                        findings.wrong_type.push(name.clone());
                    }
                    let items = value.values.as_deref().unwrap_or_default();
                    if items.iter().any(|item| !item.is_set()) {
                        findings.empty_item.push(name.clone());
                    }
                    if items.iter().any(|item| item.set_count() > 1) {
                        findings.multi_value.push(name.clone());
                    }
                    for item in items {
                        if has_incomplete_config_map_value(item) {
                            findings.incomplete_config_map.push(name.clone());
                        }
                        if has_incomplete_secret_value(item) {
                            findings.incomplete_secret.push(name.clone());
                        }
                    }
                }
                if definition.defaults.is_none() && !value.is_some_and(|v| v.values.is_some()) {
                    findings.missing.push(name);
                }
            }
        }
    }

    let checks: [(bool, &'static str, &str, &[String]); 6] = [
        (
            true,
            WRONG_PARAMETER_VALUE_TYPE,
            "The values for the following parameters are using the wrong type",
            &findings.wrong_type,
        ),
        (
            !ignore_missing,
            MISSING_PARAMETER_VALUES,
            "The following parameters are required but no value has been provided",
            &findings.missing,
        ),
        (
            true,
            INCONSISTENT_PARAMETER_VALUES,
            "The following parameters have more than one of 'configMapValue', 'secretValue', and 'value' set",
            &findings.multi_value,
        ),
        (
            true,
            EMPTY_ARRAY_ITEM_PARAMETER_VALUES,
            "The values for the following array parameters are containing at least one item where none of 'configMapValue', 'secretValue', and 'value' are set",
            &findings.empty_item,
        ),
        (
            true,
            INCOMPLETE_CONFIG_MAP_VALUE_PARAMETER_VALUES,
            "The values for the following parameters are containing a 'configMapValue' with an empty 'name' or 'key'",
            &findings.incomplete_config_map,
        ),
        (
            true,
            INCOMPLETE_SECRET_VALUE_PARAMETER_VALUES,
            "The values for the following parameters are containing a 'secretValue' with an empty 'name' or 'key'",
            &findings.incomplete_secret,
        ),
    ];

    for (enabled, reason, prefix, names) in checks {
        if enabled && !names.is_empty() {
            return Err(ValidationError::new(
                reason,
                format!("{prefix}: {}", names.join(", ")),
            ));
        }
    }

    Ok(())
}
