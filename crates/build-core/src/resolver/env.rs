use std::collections::HashMap;

use k8s_openapi::api::core::v1::EnvVar;

use crate::resolver::ResolveError;

/// Extends `into` with the entries of `new`.
///
/// With `overwrite` a colliding entry replaces the existing one in place, so the
/// original ordering survives. Without it a collision yields no list at all:
/// the error names every colliding variable and callers abort the merge.
pub fn merge_env_vars(
    new: &[EnvVar],
    into: &[EnvVar],
    overwrite: bool,
) -> Result<Vec<EnvVar>, ResolveError> {
    let mut merged = into.to_vec();
    if new.is_empty() {
        return Ok(merged);
    }

    let index: HashMap<String, usize> = into
        .iter()
        .enumerate()
        .map(|(i, env)| (env.name.clone(), i))
        .collect();

    let mut collisions = Vec::new();
    for env in new {
        match index.get(&env.name) {
            Some(&i) if overwrite => merged[i] = env.clone(),
            Some(_) => collisions.push(env.name.clone()),
            None => merged.push(env.clone()),
        }
    }

    if collisions.is_empty() {
        Ok(merged)
    } else {
        Err(ResolveError::EnvCollision { names: collisions })
    }
}
