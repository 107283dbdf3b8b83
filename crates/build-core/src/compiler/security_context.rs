use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    DownwardAPIVolumeFile, DownwardAPIVolumeSource, ObjectFieldSelector, SecurityContext, Volume,
    VolumeMount,
};

use crate::compiler::sources::READ_ONLY_MODE;
use crate::crds::strategy::{StrategySecurityContext, StrategySpec};
use crate::crds::tekton::TaskSpec;
use crate::labels::{ANNOTATION_SECURITY_CONTEXT_GROUP, ANNOTATION_SECURITY_CONTEXT_PASSWD};

pub const SECURITY_CONTEXT_VOLUME: &str = "shp-security-context";

/// The user and group strategy steps run as: the declared one, or the one
/// every step agrees on explicitly.
pub(crate) fn strategy_identity(strategy: &StrategySpec) -> Option<StrategySecurityContext> {
    if strategy.security_context.is_some() {
        return strategy.security_context;
    }

    let mut identities = strategy.steps.iter().map(|step| {
        let context = step.security_context.as_ref()?;
        Some(StrategySecurityContext {
            run_as_user: context.run_as_user?,
            run_as_group: context.run_as_group?,
        })
    });

    let first = identities.next()??;
    identities
        .all(|identity| identity == Some(first))
        .then_some(first)
}

fn downward_api_file(path: &str, annotation: &str) -> DownwardAPIVolumeFile {
    DownwardAPIVolumeFile {
        path: path.to_string(),
        field_ref: Some(ObjectFieldSelector {
            field_path: format!("metadata.annotations['{annotation}']"),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn identity_volume() -> Volume {
    Volume {
        name: SECURITY_CONTEXT_VOLUME.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            default_mode: Some(READ_ONLY_MODE),
            items: Some(vec![
                downward_api_file("group", ANNOTATION_SECURITY_CONTEXT_GROUP),
                downward_api_file("passwd", ANNOTATION_SECURITY_CONTEXT_PASSWD),
            ]),
        }),
        ..Default::default()
    }
}

fn identity_mount(path: &str, sub_path: &str) -> VolumeMount {
    VolumeMount {
        name: SECURITY_CONTEXT_VOLUME.to_string(),
        mount_path: path.to_string(),
        sub_path: Some(sub_path.to_string()),
        ..Default::default()
    }
}

/// Runs the support steps in `spec` as the strategy identity.
///
/// Strategy steps only get the user and group filled in where they leave
/// them open. Every other step is forced to the identity and gets `/etc/group`
/// and `/etc/passwd` entries for it, rendered from job annotations through a
/// downward API volume.
pub(crate) fn apply_security_context(
    spec: &mut TaskSpec,
    annotations: &mut BTreeMap<String, String>,
    strategy: &StrategySpec,
) {
    let Some(identity) = strategy_identity(strategy) else {
        return;
    };

    let mut volume_added = false;
    for step in &mut spec.steps {
        let context = step.security_context.get_or_insert_with(SecurityContext::default);

        if strategy.steps.iter().any(|s| s.name == step.name) {
            context.run_as_user.get_or_insert(identity.run_as_user);
            context.run_as_group.get_or_insert(identity.run_as_group);
            continue;
        }

        context.run_as_user = Some(identity.run_as_user);
        context.run_as_group = Some(identity.run_as_group);

        if !volume_added {
            annotations.insert(
                ANNOTATION_SECURITY_CONTEXT_GROUP.to_string(),
                format!("shp:x:{}", identity.run_as_group),
            );
            annotations.insert(
                ANNOTATION_SECURITY_CONTEXT_PASSWD.to_string(),
                format!(
                    "shp:x:{}:{}:shp:/shared-home:/sbin/nologin",
                    identity.run_as_user, identity.run_as_group
                ),
            );
            volume_added = true;
        }

        step.volume_mounts.extend([
            identity_mount("/etc/group", "group"),
            identity_mount("/etc/passwd", "passwd"),
        ]);
    }

    if volume_added && !spec.has_volume(SECURITY_CONTEXT_VOLUME) {
        spec.volumes.push(identity_volume());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::strategy::Step;
    use crate::crds::tekton::TaskStep;

    fn step(name: &str, user: Option<i64>, group: Option<i64>) -> TaskStep {
        TaskStep {
            name: name.to_string(),
            security_context: Some(SecurityContext {
                run_as_user: user,
                run_as_group: group,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn strategy(context: Option<StrategySecurityContext>) -> StrategySpec {
        StrategySpec {
            steps: vec![Step {
                name: "build".to_string(),
                ..Default::default()
            }],
            security_context: context,
            ..Default::default()
        }
    }

    #[test]
    fn without_identity_nothing_changes() {
        let mut spec = TaskSpec {
            steps: vec![step("source-default", Some(1000), Some(1000))],
            ..Default::default()
        };
        let mut annotations = BTreeMap::new();

        apply_security_context(&mut spec, &mut annotations, &strategy(None));

        assert!(annotations.is_empty());
        assert!(spec.volumes.is_empty());
    }

    #[test]
    fn support_steps_are_forced_to_the_strategy_identity() {
        let identity = StrategySecurityContext {
            run_as_user: 123,
            run_as_group: 456,
        };
        let mut spec = TaskSpec {
            steps: vec![
                step("source-default", Some(1000), Some(1000)),
                step("build", Some(0), None),
                step("image-processing", Some(0), None),
            ],
            ..Default::default()
        };
        let mut annotations = BTreeMap::new();

        apply_security_context(&mut spec, &mut annotations, &strategy(Some(identity)));

        let users: Vec<_> = spec
            .steps
            .iter()
            .map(|s| {
                let context = s.security_context.as_ref().unwrap();
                (context.run_as_user, context.run_as_group)
            })
            .collect();
        assert_eq!(
            users,
            [
                (Some(123), Some(456)),
                (Some(0), Some(456)),
                (Some(123), Some(456))
            ]
        );

        assert_eq!(
            annotations.get(ANNOTATION_SECURITY_CONTEXT_PASSWD).map(String::as_str),
            Some("shp:x:123:456:shp:/shared-home:/sbin/nologin")
        );
        assert_eq!(
            annotations.get(ANNOTATION_SECURITY_CONTEXT_GROUP).map(String::as_str),
            Some("shp:x:456")
        );

        assert_eq!(spec.volumes.len(), 1);
        assert!(spec.steps[1].volume_mounts.is_empty());
        let mounts: Vec<_> = spec.steps[2]
            .volume_mounts
            .iter()
            .map(|m| (m.mount_path.as_str(), m.sub_path.as_deref()))
            .collect();
        assert_eq!(
            mounts,
            [("/etc/group", Some("group")), ("/etc/passwd", Some("passwd"))]
        );
    }

    #[test]
    fn identity_is_inferred_from_uniform_steps() {
        let mut spec = StrategySpec {
            steps: vec![
                Step {
                    name: "build".to_string(),
                    security_context: Some(SecurityContext {
                        run_as_user: Some(1001),
                        run_as_group: Some(1001),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Step {
                    name: "push".to_string(),
                    security_context: Some(SecurityContext {
                        run_as_user: Some(1001),
                        run_as_group: Some(1001),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            strategy_identity(&spec),
            Some(StrategySecurityContext {
                run_as_user: 1001,
                run_as_group: 1001
            })
        );

        spec.steps[1].security_context = None;
        assert_eq!(strategy_identity(&spec), None);
    }
}
