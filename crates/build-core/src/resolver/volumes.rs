use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::{Volume, VolumeMount};

use crate::crds::build::BuildVolume;
use crate::crds::strategy::StrategyVolume;
use crate::resolver::ResolveError;

/// Resolves the volumes attached to the job.
///
/// Strategy volumes form the base set. Build entries and then BuildRun entries
/// may replace a strategy volume only when it is overridable; entries without
/// a strategy counterpart are added. Every mount must land on a resolved volume.
pub fn resolve_volumes(
    mounts: &[VolumeMount],
    strategy_volumes: &[StrategyVolume],
    build_volumes: &[BuildVolume],
    buildrun_volumes: &[BuildVolume],
) -> Result<Vec<Volume>, ResolveError> {
    let mut seen = HashSet::new();
    for volume in strategy_volumes {
        if !seen.insert(volume.volume.name.as_str()) {
            return Err(ResolveError::DuplicateStrategyVolume(
                volume.volume.name.clone(),
            ));
        }
    }

    let mut resolved: Vec<StrategyVolume> = strategy_volumes.to_vec();
    merge_override_volumes(&mut resolved, strategy_volumes, build_volumes)?;
    merge_override_volumes(&mut resolved, strategy_volumes, buildrun_volumes)?;

    // mount name -> read only for every mount that claims it
    let mut claimed: BTreeMap<&str, bool> = BTreeMap::new();
    for mount in mounts {
        let read_only = mount.read_only.unwrap_or(false);
        claimed
            .entry(mount.name.as_str())
            .and_modify(|ro| *ro &= read_only)
            .or_insert(read_only);
    }

    for name in claimed.keys() {
        if !resolved.iter().any(|v| v.volume.name == *name) {
            return Err(ResolveError::VolumeNotFound(name.to_string()));
        }
    }

    let mut volumes = Vec::with_capacity(resolved.len());
    for volume in resolved {
        if let Some(read_only) = claimed.get(volume.volume.name.as_str()) {
            if !read_only && is_read_only_source(&volume.volume) {
                return Err(ResolveError::VolumeMountNotReadOnly(volume.volume.name));
            }
        }
        volumes.push(volume.volume);
    }

    Ok(volumes)
}

fn merge_override_volumes(
    resolved: &mut Vec<StrategyVolume>,
    strategy_volumes: &[StrategyVolume],
    overrides: &[BuildVolume],
) -> Result<(), ResolveError> {
    for entry in overrides {
        let name = &entry.volume.name;
        if let Some(declared) = strategy_volumes.iter().find(|v| &v.volume.name == name) {
            if !declared.is_overridable() {
                return Err(ResolveError::VolumeNotOverridable(name.clone()));
            }
        }

        match resolved.iter_mut().find(|v| &v.volume.name == name) {
            Some(existing) => existing.volume = entry.volume.clone(),
            None => resolved.push(StrategyVolume {
                overridable: Some(true),
                description: entry.description.clone(),
                volume: entry.volume.clone(),
            }),
        }
    }
    Ok(())
}

fn is_read_only_source(volume: &Volume) -> bool {
    volume.config_map.is_some()
        || volume.secret.is_some()
        || volume.downward_api.is_some()
        || volume.projected.is_some()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        ConfigMapVolumeSource, EmptyDirVolumeSource, PersistentVolumeClaimVolumeSource,
    };

    use super::*;

    fn mount(name: &str, read_only: bool) -> VolumeMount {
        VolumeMount {
            name: name.to_string(),
            mount_path: format!("/mnt/{name}"),
            read_only: Some(read_only),
            ..Default::default()
        }
    }

    fn empty_dir(name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    }

    fn strategy_volume(name: &str, overridable: bool) -> StrategyVolume {
        StrategyVolume {
            overridable: Some(overridable),
            description: None,
            volume: empty_dir(name),
        }
    }

    fn claim(name: &str) -> BuildVolume {
        BuildVolume {
            description: None,
            volume: Volume {
                name: name.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: "cache-claim".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    #[test]
    fn undeclared_mount_fails_naming_the_mount() {
        let err = resolve_volumes(&[mount("x", false)], &[], &[], &[]).unwrap_err();
        assert_eq!(err, ResolveError::VolumeNotFound("x".to_string()));
    }

    #[test]
    fn declared_mount_yields_exactly_one_volume() {
        let volumes =
            resolve_volumes(&[mount("x", false), mount("x", false)], &[strategy_volume("x", false)], &[], &[])
                .unwrap();

        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "x");
    }

    #[test]
    fn buildrun_override_beats_build_override() {
        let mut buildrun_volume = claim("cache");
        if let Some(pvc) = buildrun_volume.volume.persistent_volume_claim.as_mut() {
            pvc.claim_name = "buildrun-claim".to_string();
        }

        let volumes = resolve_volumes(
            &[mount("cache", false)],
            &[strategy_volume("cache", true)],
            &[claim("cache")],
            &[buildrun_volume],
        )
        .unwrap();

        assert_eq!(volumes.len(), 1);
        assert_eq!(
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .map(|p| p.claim_name.as_str()),
            Some("buildrun-claim")
        );
        assert!(volumes[0].empty_dir.is_none());
    }

    #[test]
    fn non_overridable_volume_is_rejected() {
        let err = resolve_volumes(
            &[mount("cache", false)],
            &[strategy_volume("cache", false)],
            &[claim("cache")],
            &[],
        )
        .unwrap_err();

        assert_eq!(err, ResolveError::VolumeNotOverridable("cache".to_string()));
    }

    #[test]
    fn build_declared_volume_satisfies_mount() {
        let volumes = resolve_volumes(&[mount("cache", false)], &[], &[claim("cache")], &[]).unwrap();
        assert_eq!(volumes.len(), 1);
    }

    #[test]
    fn writable_mount_of_config_map_is_rejected() {
        let config = StrategyVolume {
            overridable: None,
            description: None,
            volume: Volume {
                name: "settings".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: "settings".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        };

        let err = resolve_volumes(&[mount("settings", false)], &[config.clone()], &[], &[]).unwrap_err();
        assert_eq!(err, ResolveError::VolumeMountNotReadOnly("settings".to_string()));

        assert!(resolve_volumes(&[mount("settings", true)], &[config], &[], &[]).is_ok());
    }
}
