//! Tests for reading registry credentials out of image pull secrets

use std::collections::BTreeMap;

use image_clone_controller::adapters::credentials::{
    keychain_from_secret, normalize_registry, RegistryAuth,
};
use image_clone_controller::secret_string::SecretString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use tokio_test::{assert_err, assert_ok};

fn secret(key: &str, value: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some("regcred".to_string()),
            namespace: Some("image-clone-controller-system".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            key.to_string(),
            ByteString(value.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

fn basic(username: &str, password: &str) -> RegistryAuth {
    RegistryAuth::Basic {
        username: username.to_string(),
        password: SecretString::new(password),
    }
}

#[test]
fn dockerconfigjson_auth_field_is_decoded() {
    // base64("robot:s3cr3t:with-colon")
    let json = r#"{"auths":{"quay.io":{"auth":"cm9ib3Q6czNjcjN0OndpdGgtY29sb24="}}}"#;

    let keychain = assert_ok!(keychain_from_secret(&secret(".dockerconfigjson", json)));

    assert_eq!(keychain.auth_for("quay.io"), basic("robot", "s3cr3t:with-colon"));
}

#[test]
fn explicit_username_and_password_win_over_auth() {
    let json = r#"{"auths":{"ghcr.io":{"username":"octo","password":"token","auth":"bm90OnVzZWQ="}}}"#;

    let keychain = assert_ok!(keychain_from_secret(&secret(".dockerconfigjson", json)));

    assert_eq!(keychain.auth_for("ghcr.io"), basic("octo", "token"));
}

#[test]
fn docker_hub_keys_are_matched_by_any_alias() {
    // base64("user:pass")
    let json = r#"{"auths":{"https://index.docker.io/v1/":{"auth":"dXNlcjpwYXNz"}}}"#;

    let keychain = assert_ok!(keychain_from_secret(&secret(".dockerconfigjson", json)));

    assert_eq!(keychain.auth_for("docker.io"), basic("user", "pass"));
    assert_eq!(keychain.auth_for("registry-1.docker.io"), basic("user", "pass"));
}

#[test]
fn unknown_registry_is_anonymous() {
    let json = r#"{"auths":{"quay.io":{"auth":"dXNlcjpwYXNz"}}}"#;

    let keychain = assert_ok!(keychain_from_secret(&secret(".dockerconfigjson", json)));

    assert!(!keychain.contains("gcr.io"));
    assert_eq!(keychain.auth_for("gcr.io"), RegistryAuth::Anonymous);
}

#[test]
fn legacy_dockercfg_is_supported() {
    let cfg = r#"{"registry.example.com:5000":{"auth":"dXNlcjpwYXNz"}}"#;

    let keychain = assert_ok!(keychain_from_secret(&secret(".dockercfg", cfg)));

    assert_eq!(
        keychain.auth_for("registry.example.com:5000"),
        basic("user", "pass")
    );
}

#[test]
fn secret_without_docker_config_is_rejected() {
    assert_err!(keychain_from_secret(&secret("token", "abc")));
}

#[test]
fn malformed_auth_is_rejected() {
    // base64("no-separator")
    let json = r#"{"auths":{"quay.io":{"auth":"bm8tc2VwYXJhdG9y"}}}"#;
    assert_err!(keychain_from_secret(&secret(".dockerconfigjson", json)));

    assert_err!(keychain_from_secret(&secret(".dockerconfigjson", "{not json")));
}

#[test]
fn passwords_are_redacted_in_debug_output() {
    let rendered = format!("{:?}", basic("user", "hunter2"));

    assert!(!rendered.contains("hunter2"));
    assert!(rendered.contains("REDACTED"));
}

#[test]
fn registry_keys_normalize_to_bare_hosts() {
    assert_eq!(normalize_registry("https://index.docker.io/v1/"), "docker.io");
    assert_eq!(normalize_registry("registry.hub.docker.com"), "docker.io");
    assert_eq!(normalize_registry("http://Quay.IO/"), "quay.io");
    assert_eq!(normalize_registry("localhost:5000"), "localhost:5000");
    assert_eq!(normalize_registry("ghcr.io/org"), "ghcr.io");
}
