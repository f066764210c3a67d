use kube_pico_cd::{DeploymentMessage, MessageError};
use serde_json::json;

#[test]
fn parses_string_identifier_and_metadata() {
    let body = json!({
        "data": {
            "BUILD_TIMESTAMP": "1700000000",
            "BRANCH_NAME": "main",
            "CONFIG_MAP_NAME": "build-info",
        },
        "manifests": "kind: Namespace\n",
    })
    .to_string();

    let message = DeploymentMessage::parse(&body, "BUILD_TIMESTAMP").unwrap();

    assert_eq!(message.identifier, 1_700_000_000);
    assert_eq!(message.manifest_bundle, "kind: Namespace\n");
    assert_eq!(message.metadata["BRANCH_NAME"], "main");
    assert_eq!(message.config_map_name(), Some("build-info"));
}

#[test]
fn accepts_numeric_identifier() {
    let body = json!({ "data": { "BUILD_TIMESTAMP": 42 }, "manifests": "" }).to_string();
    let message = DeploymentMessage::parse(&body, "BUILD_TIMESTAMP").unwrap();
    assert_eq!(message.identifier, 42);
    assert_eq!(message.metadata["BUILD_TIMESTAMP"], "42");
}

#[test]
fn reads_legacy_key_when_configured() {
    let body = json!({ "data": { "buildTimestamp": "7" }, "manifests": "doc" }).to_string();
    let message = DeploymentMessage::parse(&body, "buildTimestamp").unwrap();
    assert_eq!(message.identifier, 7);
}

#[test]
fn blank_config_map_name_is_ignored() {
    let body = json!({
        "data": { "BUILD_TIMESTAMP": "1", "CONFIG_MAP_NAME": "  " },
        "manifests": "doc",
    })
    .to_string();
    let message = DeploymentMessage::parse(&body, "BUILD_TIMESTAMP").unwrap();
    assert_eq!(message.config_map_name(), None);
}

#[test]
fn rejects_malformed_bodies() {
    let key = "BUILD_TIMESTAMP";
    assert!(matches!(
        DeploymentMessage::parse("{", key),
        Err(MessageError::Body(_))
    ));
    assert!(matches!(
        DeploymentMessage::parse(r#"{"manifests":"doc"}"#, key),
        Err(MessageError::MissingData)
    ));
    assert!(matches!(
        DeploymentMessage::parse(r#"{"data":{},"manifests":"doc"}"#, key),
        Err(MessageError::MissingIdentifier { key }) if key == "BUILD_TIMESTAMP"
    ));
    assert!(matches!(
        DeploymentMessage::parse(r#"{"data":{"BUILD_TIMESTAMP":"-3"},"manifests":"doc"}"#, key),
        Err(MessageError::InvalidIdentifier { value, .. }) if value == "-3"
    ));
    assert!(matches!(
        DeploymentMessage::parse(r#"{"data":{"BUILD_TIMESTAMP":1.5},"manifests":"doc"}"#, key),
        Err(MessageError::InvalidIdentifier { .. })
    ));
    assert!(matches!(
        DeploymentMessage::parse(r#"{"data":{"BUILD_TIMESTAMP":"3"}}"#, key),
        Err(MessageError::MissingManifests)
    ));
}

#[test]
fn body_survives_the_queue() {
    let body = json!({
        "data": { "BUILD_TIMESTAMP": "99", "TAG_NAME": "v1.2.0" },
        "manifests": "a: 1\n---\nb: 2\n",
    })
    .to_string();
    let message = DeploymentMessage::parse(&body, "BUILD_TIMESTAMP").unwrap();

    let encoded = message.to_body().unwrap();
    let wire: serde_json::Value = serde_json::from_str(&encoded).unwrap();

    assert_eq!(wire["data"]["BUILD_TIMESTAMP"], "99");
    assert_eq!(wire["data"]["TAG_NAME"], "v1.2.0");
    assert_eq!(wire["manifests"], "a: 1\n---\nb: 2\n");
}
