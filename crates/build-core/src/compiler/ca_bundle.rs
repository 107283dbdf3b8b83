use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, KeyToPath, SecretVolumeSource, Volume, VolumeMount,
};

use crate::compiler::fnv32a;
use crate::compiler::sources::{READ_ONLY_MODE, ensure_volume, set_env};
use crate::crds::build::{CaBundle, KeyRef};
use crate::crds::tekton::TaskSpec;

const BUNDLE_KEY: &str = "ca.crt";
const BUNDLE_FILE: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Trust store locations of the common base images.
const BUNDLE_PATHS: [&str; 2] = [
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
];

const BUNDLE_ENV: [&str; 4] = [
    "SSL_CERT_FILE",
    "NODE_EXTRA_CA_CERTS",
    "REQUESTS_CA_BUNDLE",
    "CURL_CA_BUNDLE",
];

const SAFE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Maps every character onto an alphabet without vowels or look-alikes.
fn safe_encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| char::from(SAFE_ALPHABET[usize::from(b) % SAFE_ALPHABET.len()]))
        .collect()
}

fn volume_name(object: &str) -> String {
    format!("{object}-{}", safe_encode(&fnv32a(object.as_bytes()).to_string()))
}

fn bundle_items(reference: &KeyRef) -> Option<Vec<KeyToPath>> {
    Some(vec![KeyToPath {
        key: reference.key.clone(),
        path: BUNDLE_KEY.to_string(),
        mode: None,
    }])
}

/// Volume exposing the bundle under `ca.crt`. A secret wins over a configMap.
fn bundle_volume(bundle: &CaBundle) -> Option<Volume> {
    if let Some(secret) = &bundle.secret {
        return Some(Volume {
            name: volume_name(&secret.name),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.name.clone()),
                default_mode: Some(READ_ONLY_MODE),
                items: bundle_items(secret),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    bundle.config_map.as_ref().map(|config_map| Volume {
        name: volume_name(&config_map.name),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.name.clone(),
            default_mode: Some(READ_ONLY_MODE),
            items: bundle_items(config_map),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Mounts the bundle over the trust store of every step in `spec` and points
/// the usual TLS env vars at it.
pub(crate) fn apply_ca_bundle(spec: &mut TaskSpec, bundle: &CaBundle) {
    let Some(volume) = bundle_volume(bundle) else {
        return;
    };
    let name = volume.name.clone();
    ensure_volume(spec, volume);

    for step in &mut spec.steps {
        for var in BUNDLE_ENV {
            set_env(step, var, BUNDLE_FILE);
        }
        step.volume_mounts.extend(BUNDLE_PATHS.iter().map(|path| VolumeMount {
            name: name.clone(),
            mount_path: path.to_string(),
            sub_path: Some(BUNDLE_KEY.to_string()),
            read_only: Some(true),
            ..Default::default()
        }));
    }
}
