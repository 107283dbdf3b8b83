use crate::crds::build::ParamValue;

/// Name-keyed union of two parameter lists where `overrides` wins.
///
/// Entries keep the position they had in `base`; names that only exist in
/// `overrides` are appended in their own order.
pub fn override_params(base: &[ParamValue], overrides: &[ParamValue]) -> Vec<ParamValue> {
    let mut merged: Vec<ParamValue> = base.to_vec();

    for param in overrides {
        match merged.iter_mut().find(|p| p.name == param.name) {
            Some(existing) => *existing = param.clone(),
            None => merged.push(param.clone()),
        }
    }

    merged
}
