use std::collections::BTreeMap;

use build_core::{
    crds::{Build, BuildRun},
    labels,
    resolver::effective_push_secret,
};
use k8s_openapi::api::core::v1::{ObjectReference, ServiceAccount};
use kube::{ResourceExt, api::ObjectMeta};
use tracing::{debug, info};

use crate::{
    error::AppError,
    services::{backend::controller_reference, cluster::ClusterClient},
};

/// Default ServiceAccount of a vanilla Kubernetes namespace.
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";
/// Default ServiceAccount of an OpenShift namespace, tried first.
pub const PIPELINE_SERVICE_ACCOUNT: &str = "pipeline";

pub enum ServiceAccountLookup {
    Found(ServiceAccount),
    /// The named ServiceAccount does not exist.
    Missing(String),
}

pub fn generated_name(buildrun: &BuildRun) -> String {
    format!("{}-sa", buildrun.name_any())
}

/// Links every secret the job needs to pull sources and push the output image.
/// Existing links are never removed or duplicated. Returns whether `sa` changed.
pub fn apply_credentials(sa: &mut ServiceAccount, build: &Build, buildrun: &BuildRun) -> bool {
    let source_secret = build.spec.source.as_ref().and_then(|source| {
        source
            .git
            .as_ref()
            .and_then(|git| git.clone_secret.clone())
            .or_else(|| {
                source
                    .oci_artifact
                    .as_ref()
                    .and_then(|oci| oci.pull_secret.clone())
            })
    });
    let push_secret = effective_push_secret(&build.spec, &buildrun.spec);

    let mut modified = false;
    for secret in [source_secret, push_secret].into_iter().flatten() {
        modified |= link_secret(sa, &secret);
    }
    modified
}

fn link_secret(sa: &mut ServiceAccount, secret: &str) -> bool {
    let sa_name = sa.name_any();
    let secrets = sa.secrets.get_or_insert_with(Vec::new);
    if secrets.iter().any(|s| s.name.as_deref() == Some(secret)) {
        return false;
    }

    debug!(secret, service_account = %sa_name, "🔗 Linking secret");
    secrets.push(ObjectReference {
        name: Some(secret.to_string()),
        ..Default::default()
    });
    true
}

fn generated_service_account(buildrun: &BuildRun) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(generated_name(buildrun)),
            namespace: buildrun.namespace(),
            labels: Some(BTreeMap::from([(
                labels::BUILD_RUN_NAME.to_string(),
                buildrun.name_any(),
            )])),
            owner_references: controller_reference(buildrun).map(|owner| vec![owner]),
            ..Default::default()
        },
        automount_service_account_token: Some(false),
        ..Default::default()
    }
}

/// Gets or creates the ServiceAccount owned by `buildrun`. Safe to repeat after
/// an earlier reconcile created it but never recorded the job.
async fn generate<C: ClusterClient>(
    client: &C,
    build: &Build,
    buildrun: &BuildRun,
) -> Result<ServiceAccount, AppError> {
    let namespace = buildrun.namespace().unwrap_or_default();
    let name = generated_name(buildrun);

    match client.get_service_account(&namespace, &name).await? {
        Some(mut sa) => {
            debug!(service_account = %name, "♻️ Generated ServiceAccount already exists");
            if apply_credentials(&mut sa, build, buildrun) {
                sa = client.update_service_account(&sa).await?;
            }
            Ok(sa)
        }
        None => {
            let mut sa = generated_service_account(buildrun);
            apply_credentials(&mut sa, build, buildrun);
            let sa = client.create_service_account(&sa).await?;
            info!(service_account = %name, buildrun = %buildrun.name_any(), "👤 ServiceAccount generated");
            Ok(sa)
        }
    }
}

/// The ServiceAccount the job of `buildrun` runs as, with the Build's
/// credentials linked.
#[tracing::instrument(
    name = "credentials.retrieve_service_account",
    skip_all,
    fields(buildrun = %buildrun.name_any()),
    err
)]
pub async fn retrieve_service_account<C: ClusterClient>(
    client: &C,
    build: &Build,
    buildrun: &BuildRun,
) -> Result<ServiceAccountLookup, AppError> {
    if buildrun.spec.generates_service_account() {
        return generate(client, build, buildrun)
            .await
            .map(ServiceAccountLookup::Found);
    }

    let namespace = buildrun.namespace().unwrap_or_default();

    let sa = match buildrun.spec.service_account_name() {
        Some(name) => client.get_service_account(&namespace, name).await?,
        None => match client
            .get_service_account(&namespace, PIPELINE_SERVICE_ACCOUNT)
            .await?
        {
            Some(sa) => Some(sa),
            None => {
                debug!(namespace = %namespace, "Falling back to the default ServiceAccount");
                client
                    .get_service_account(&namespace, DEFAULT_SERVICE_ACCOUNT)
                    .await?
            }
        },
    };

    let Some(mut sa) = sa else {
        let name = buildrun
            .spec
            .service_account_name()
            .unwrap_or(DEFAULT_SERVICE_ACCOUNT);
        return Ok(ServiceAccountLookup::Missing(name.to_string()));
    };

    if apply_credentials(&mut sa, build, buildrun) {
        info!(service_account = %sa.name_any(), "🔑 Updating ServiceAccount with Build secrets");
        sa = client.update_service_account(&sa).await?;
    }
    Ok(ServiceAccountLookup::Found(sa))
}

/// Deletes the ServiceAccount generated for `buildrun`, if it uses one.
pub async fn delete_generated<C: ClusterClient>(
    client: &C,
    buildrun: &BuildRun,
) -> Result<(), AppError> {
    if !buildrun.spec.generates_service_account() {
        return Ok(());
    }

    let namespace = buildrun.namespace().unwrap_or_default();
    let name = generated_name(buildrun);
    info!(service_account = %name, buildrun = %buildrun.name_any(), "🧹 Deleting generated ServiceAccount");
    client.delete_service_account(&namespace, &name).await
}

/// Deletes a generated ServiceAccount that outlived its completed BuildRun,
/// left behind when the deletion after the final status write failed.
pub async fn delete_leftover<C: ClusterClient>(
    client: &C,
    buildrun: &BuildRun,
) -> Result<(), AppError> {
    if !buildrun.spec.generates_service_account() {
        return Ok(());
    }

    let namespace = buildrun.namespace().unwrap_or_default();
    let name = generated_name(buildrun);
    if client.get_service_account(&namespace, &name).await?.is_none() {
        return Ok(());
    }
    delete_generated(client, buildrun).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use build_core::crds::{
        BuildRunSpec, BuildSpec,
        build::{Git, Image, Source},
        buildrun::BuildRunServiceAccount,
    };

    use crate::services::fake::{Call, FakeClient};

    fn build() -> Build {
        Build::new(
            "build",
            BuildSpec {
                source: Some(Source {
                    git: Some(Git {
                        url: "https://github.com/shipwright-io/sample-go".to_string(),
                        clone_secret: Some("git-creds".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                output: Image {
                    image: "registry.example.com/app".to_string(),
                    push_secret: Some("build-push".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn buildrun(service_account: Option<BuildRunServiceAccount>) -> BuildRun {
        let mut buildrun = BuildRun::new(
            "run",
            BuildRunSpec {
                service_account,
                ..Default::default()
            },
        );
        buildrun.metadata.namespace = Some("builds".to_string());
        buildrun.metadata.uid = Some("4c2b3a".to_string());
        buildrun
    }

    fn service_account(name: &str, secrets: &[&str]) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("builds".to_string()),
                ..Default::default()
            },
            secrets: Some(
                secrets
                    .iter()
                    .map(|s| ObjectReference {
                        name: Some(s.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn linked(sa: &ServiceAccount) -> Vec<String> {
        sa.secrets
            .iter()
            .flatten()
            .filter_map(|s| s.name.clone())
            .collect()
    }

    #[test]
    fn credentials_are_appended_once() {
        let mut sa = service_account("pipeline", &["existing", "git-creds"]);

        assert!(apply_credentials(&mut sa, &build(), &buildrun(None)));
        assert_eq!(linked(&sa), ["existing", "git-creds", "build-push"]);

        assert!(!apply_credentials(&mut sa, &build(), &buildrun(None)));
    }

    #[test]
    fn buildrun_push_secret_replaces_the_build_one() {
        let mut run = buildrun(None);
        run.spec.output = Some(Image {
            image: "registry.example.com/other".to_string(),
            push_secret: Some("run-push".to_string()),
            ..Default::default()
        });
        let mut sa = service_account("pipeline", &[]);

        apply_credentials(&mut sa, &build(), &run);
        assert_eq!(linked(&sa), ["git-creds", "run-push"]);
    }

    #[tokio::test]
    async fn generated_account_is_owned_and_labelled() {
        let client = FakeClient::default();
        let run = buildrun(Some(BuildRunServiceAccount {
            generate: Some(true),
            ..Default::default()
        }));

        let ServiceAccountLookup::Found(sa) =
            retrieve_service_account(&client, &build(), &run).await.unwrap()
        else {
            panic!("expected a ServiceAccount");
        };

        assert_eq!(sa.name_any(), "run-sa");
        assert_eq!(sa.labels()[labels::BUILD_RUN_NAME], "run");
        assert_eq!(sa.automount_service_account_token, Some(false));
        assert_eq!(sa.owner_references()[0].kind, "BuildRun");
        assert_eq!(linked(&sa), ["git-creds", "build-push"]);

        // a second reconcile reuses it
        retrieve_service_account(&client, &build(), &run).await.unwrap();
        let creates = client
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::CreateServiceAccount(_)))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn defaults_fall_back_from_pipeline_to_default() {
        let client = FakeClient::default();
        client.insert_service_account(service_account("default", &[]));

        let ServiceAccountLookup::Found(sa) =
            retrieve_service_account(&client, &build(), &buildrun(None))
                .await
                .unwrap()
        else {
            panic!("expected a ServiceAccount");
        };
        assert_eq!(sa.name_any(), "default");
        assert_eq!(
            client.calls(),
            [Call::UpdateServiceAccount("default".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_named_account_is_reported() {
        let client = FakeClient::default();
        let run = buildrun(Some(BuildRunServiceAccount {
            name: Some("builder".to_string()),
            ..Default::default()
        }));

        let lookup = retrieve_service_account(&client, &build(), &run).await.unwrap();
        assert!(matches!(lookup, ServiceAccountLookup::Missing(name) if name == "builder"));
    }

    #[tokio::test]
    async fn only_generated_accounts_are_deleted() {
        let client = FakeClient::default();

        delete_generated(&client, &buildrun(None)).await.unwrap();
        assert!(client.calls().is_empty());

        let run = buildrun(Some(BuildRunServiceAccount {
            generate: Some(true),
            ..Default::default()
        }));
        delete_generated(&client, &run).await.unwrap();
        assert_eq!(
            client.calls(),
            [Call::DeleteServiceAccount("run-sa".to_string())]
        );
    }

    #[tokio::test]
    async fn leftover_account_is_deleted_only_while_present() {
        let client = FakeClient::default();
        let run = buildrun(Some(BuildRunServiceAccount {
            generate: Some(true),
            ..Default::default()
        }));

        delete_leftover(&client, &run).await.unwrap();
        assert!(client.calls().is_empty());

        client.insert_service_account(service_account("run-sa", &[]));
        delete_leftover(&client, &run).await.unwrap();
        delete_leftover(&client, &run).await.unwrap();
        assert_eq!(
            client.calls(),
            [Call::DeleteServiceAccount("run-sa".to_string())]
        );
    }
}
