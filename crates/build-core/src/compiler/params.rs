use k8s_openapi::api::core::v1::{ConfigMapKeySelector, EnvVar, EnvVarSource, SecretKeySelector};

use crate::compiler::task_spec::references_param;
use crate::compiler::{CompileInput, StageError, fnv32a};
use crate::crds::build::{ObjectKeyRef, ParamValue, SingleValue};
use crate::crds::strategy::{Parameter, ParameterType};
use crate::crds::tekton::{Param, TaskStep};
use crate::resolver::{ResolveError, override_params};

const CONFIGMAP_ENV_PREFIX: &str = "SHP_CONFIGMAP_PARAM_";
const SECRET_ENV_PREFIX: &str = "SHP_SECRET_PARAM_";
const CONFIGMAP_PLACEHOLDER: &str = "${CONFIGMAP_VALUE}";
const SECRET_PLACEHOLDER: &str = "${SECRET_VALUE}";

const SUFFIX_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SUFFIX_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    ConfigMap,
    Secret,
}

impl ObjectKind {
    fn prefix(self) -> &'static str {
        match self {
            ObjectKind::ConfigMap => CONFIGMAP_ENV_PREFIX,
            ObjectKind::Secret => SECRET_ENV_PREFIX,
        }
    }

    fn placeholder(self) -> &'static str {
        match self {
            ObjectKind::ConfigMap => CONFIGMAP_PLACEHOLDER,
            ObjectKind::Secret => SECRET_PLACEHOLDER,
        }
    }

    fn value_from(self, reference: &ObjectKeyRef) -> EnvVarSource {
        match self {
            ObjectKind::ConfigMap => EnvVarSource {
                config_map_key_ref: Some(ConfigMapKeySelector {
                    name: reference.name.clone(),
                    key: reference.key.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ObjectKind::Secret => EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: reference.name.clone(),
                    key: reference.key.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    /// Whether `env` already exposes `reference` under this kind's prefix.
    fn exposes(self, env: &EnvVar, reference: &ObjectKeyRef) -> bool {
        if !env.name.starts_with(self.prefix()) {
            return false;
        }
        let Some(source) = &env.value_from else {
            return false;
        };
        match self {
            ObjectKind::ConfigMap => source
                .config_map_key_ref
                .as_ref()
                .is_some_and(|r| r.name == reference.name && r.key == reference.key),
            ObjectKind::Secret => source
                .secret_key_ref
                .as_ref()
                .is_some_and(|r| r.name == reference.name && r.key == reference.key),
        }
    }
}

fn encode_suffix(mut hash: u32) -> String {
    let base = SUFFIX_CHARS.len() as u32;
    let mut suffix = String::with_capacity(SUFFIX_LEN);
    for _ in 0..SUFFIX_LEN {
        suffix.push(char::from(SUFFIX_CHARS[(hash % base) as usize]));
        hash /= base;
    }
    suffix
}

/// Name of the variable exposing `reference`. Reuses a variable that already
/// points at the same object and key; otherwise derives one from the object
/// and key, salting on the rare clash with an unrelated variable.
fn env_var_name(steps: &[TaskStep], kind: ObjectKind, reference: &ObjectKeyRef) -> String {
    let all_env = || steps.iter().flat_map(|step| step.env.iter());

    if let Some(existing) = all_env().find(|env| kind.exposes(env, reference)) {
        return existing.name.clone();
    }

    let mut salt = 0u32;
    loop {
        let seed = format!(
            "{}{}\0{}\0{salt}",
            kind.prefix(),
            reference.name,
            reference.key
        );
        let name = format!("{}{}", kind.prefix(), encode_suffix(fnv32a(seed.as_bytes())));
        if !all_env().any(|env| env.name == name) {
            return name;
        }
        salt += 1;
    }
}

/// Exposes `reference` as an env var on every step using `param` and returns
/// the expression the param value resolves to.
fn inject(
    steps: &mut [TaskStep],
    param: &str,
    kind: ObjectKind,
    reference: &ObjectKeyRef,
) -> String {
    let name = env_var_name(steps, kind, reference);

    for step in steps.iter_mut().filter(|step| references_param(step, param)) {
        if step.env.iter().any(|env| env.name == name) {
            continue;
        }
        step.env.insert(
            0,
            EnvVar {
                name: name.clone(),
                value: None,
                value_from: Some(kind.value_from(reference)),
            },
        );
    }

    let expression = format!("$({name})");
    match &reference.format {
        Some(format) => format.replace(kind.placeholder(), &expression),
        None => expression,
    }
}

fn single_value(steps: &mut [TaskStep], param: &str, value: &SingleValue) -> Option<String> {
    if let Some(reference) = &value.config_map_value {
        return Some(inject(steps, param, ObjectKind::ConfigMap, reference));
    }
    if let Some(reference) = &value.secret_value {
        return Some(inject(steps, param, ObjectKind::Secret, reference));
    }
    value.value.clone()
}

/// Turns a user-supplied value into the job param for `definition`, adding
/// env vars to `steps` for configMap and secret values. `None` means the
/// strategy default applies and no param is passed.
pub(crate) fn resolve_param(
    steps: &mut [TaskStep],
    definition: &Parameter,
    value: &ParamValue,
) -> Result<Option<Param>, StageError> {
    match definition.type_ {
        ParameterType::String => {
            if !value.single.is_set() {
                return match definition.default {
                    Some(_) => Ok(None),
                    None => Err(StageError::MissingValue(definition.name.clone())),
                };
            }
            let resolved = single_value(steps, &value.name, &value.single)
                .ok_or_else(|| StageError::MissingValue(definition.name.clone()))?;
            Ok(Some(Param::string(&value.name, resolved)))
        }
        ParameterType::Array => {
            let Some(items) = &value.values else {
                return match definition.defaults {
                    Some(_) => Ok(None),
                    None => Err(StageError::MissingValue(definition.name.clone())),
                };
            };

            let mut resolved = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let item = single_value(steps, &value.name, item).ok_or_else(|| {
                    StageError::MissingValue(format!("{}[{index}]", definition.name))
                })?;
                resolved.push(item);
            }
            Ok(Some(Param::array(&value.name, resolved)))
        }
    }
}

/// Job params for the Build values overridden by the BuildRun values, in
/// that order. Env vars for configMap and secret values land on `steps`.
pub(crate) fn strategy_params(
    input: &CompileInput<'_>,
    steps: &mut [TaskStep],
) -> Result<Vec<Param>, StageError> {
    let values = override_params(
        &input.build.spec.param_values,
        &input.buildrun.spec.param_values,
    );

    let mut params = Vec::with_capacity(values.len());
    for value in &values {
        let definition = input.strategy.find_parameter(&value.name).ok_or_else(|| {
            ResolveError::UndefinedParameter {
                param: value.name.clone(),
                strategy: input.strategy.name.clone(),
            }
        })?;
        if let Some(param) = resolve_param(steps, definition, value)? {
            params.push(param);
        }
    }
    Ok(params)
}
