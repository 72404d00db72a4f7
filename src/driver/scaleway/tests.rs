//! Unit tests for the Scaleway connector.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use rstest::{fixture, rstest};
use scaleway_rs::ScalewayImage;

use super::image::ImageQuery;
use super::servers::{AddressRecord, ServerRecord, node_state};
use super::*;
use crate::test_support::StubGateway;

const SERVER_JSON: &str = r#"{"server":{"id":"srv-1","name":"cloud-agent-1","state":"running","allowed_actions":["poweroff","terminate"],"public_ip":null,"public_ips":[{"address":"2001:db8::1","family":"inet6"},{"address":"51.15.0.10","family":"inet"}],"private_ip":"10.1.0.7"}}"#;

#[fixture]
fn config() -> ScalewayConfig {
    ScalewayConfig {
        access_key: None,
        secret_key: String::from("secret"),
        default_organization_id: None,
        default_project_id: String::from("project"),
        default_zone: String::from("fr-par-1"),
        default_architecture: String::from("x86_64"),
    }
}

fn image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
    ScalewayImage {
        id: id.to_owned(),
        name: String::new(),
        arch: arch.to_owned(),
        creation_date: creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

fn query() -> ImageQuery<'static> {
    ImageQuery {
        label: "ubuntu_noble",
        zone: "fr-par-1",
        arch: "x86_64",
    }
}

fn request(location: Option<&str>) -> NodeRequest {
    NodeRequest {
        name: String::from("cloud-agent-1"),
        image: String::from("ubuntu_noble"),
        hardware: String::from("DEV1-S"),
        location: location.map(str::to_owned),
        group: String::from("cloud-agent-"),
    }
}

#[rstest]
fn new_rejects_blank_secret(mut config: ScalewayConfig) {
    config.secret_key = String::from(" ");

    let Err(err) = ScalewayCompute::new(config) else {
        panic!("blank secret should be rejected");
    };

    assert!(
        matches!(err, DriverError::Config(ref message) if message.contains("SCW_SECRET_KEY")),
        "unexpected error: {err}"
    );
}

#[rstest]
#[case("running", NodeState::Running)]
#[case("starting", NodeState::Pending)]
#[case("stopped", NodeState::Stopped)]
#[case("stopped in place", NodeState::Stopped)]
#[case("stopping", NodeState::Stopped)]
#[case("locked", NodeState::Error)]
#[case("hibernating", NodeState::Unknown)]
fn server_states_map_to_node_states(#[case] state: &str, #[case] expected: NodeState) {
    assert_eq!(node_state(state), expected);
}

#[rstest]
fn summary_prefers_legacy_public_ip() {
    let server = ServerRecord {
        id: String::from("srv-1"),
        name: String::from("n"),
        state: String::from("starting"),
        allowed_actions: Vec::new(),
        public_ip: Some(AddressRecord {
            address: String::from("51.15.0.1"),
            family: None,
        }),
        public_ips: vec![AddressRecord {
            address: String::from("51.15.0.2"),
            family: Some(String::from("inet")),
        }],
        private_ip: None,
    };

    let summary = server.summary("nl-ams-1");

    assert_eq!(summary.public_ip.as_deref(), Some("51.15.0.1"));
    assert_eq!(summary.state, NodeState::Pending);
    assert_eq!(summary.location.as_deref(), Some("nl-ams-1"));
}

#[rstest]
fn select_image_id_returns_newest() {
    let images = vec![
        image("older", "x86_64", "available", "2025-01-01T00:00:00Z"),
        image("newest", "x86_64", "available", "2025-02-01T00:00:00Z"),
    ];

    let id = ScalewayCompute::select_image_id(images, &query()).expect("image selected");

    assert_eq!(id, "newest");
}

#[rstest]
fn select_image_id_reports_missing_label() {
    let err = ScalewayCompute::select_image_id(Vec::new(), &query()).expect_err("no candidates");

    assert_eq!(
        err,
        ScalewayBackendError::ImageNotFound {
            label: String::from("ubuntu_noble"),
            arch: String::from("x86_64"),
            zone: String::from("fr-par-1"),
        }
    );
}

#[rstest]
fn filter_images_keeps_available_matching_arch() {
    let images = vec![
        image("arm", "arm64", "available", "2025-01-01T00:00:00Z"),
        image("creating", "x86_64", "creating", "2025-01-01T00:00:00Z"),
        image("ok", "x86_64", "available", "2025-01-01T00:00:00Z"),
    ];

    let kept = ScalewayCompute::filter_images(images, "x86_64");

    let ids: Vec<&str> = kept.iter().map(|image| image.id.as_str()).collect();
    assert_eq!(ids, vec!["ok"]);
}

#[rstest]
#[tokio::test]
async fn project_images_win_over_public_ones() {
    let public_called = Rc::new(Cell::new(false));
    let flag = Rc::clone(&public_called);

    let id = ScalewayCompute::resolve_image_id_with(
        &query(),
        || async { Ok(vec![image("project", "x86_64", "available", "2025-01-01")]) },
        move || {
            flag.set(true);
            async { Ok(vec![image("public", "x86_64", "available", "2025-03-01")]) }
        },
    )
    .await
    .expect("image resolves");

    assert_eq!(id, "project");
    assert!(!public_called.get());
}

#[rstest]
#[tokio::test]
async fn empty_project_listing_falls_back_to_public() {
    let id = ScalewayCompute::resolve_image_id_with(
        &query(),
        || async { Ok(Vec::new()) },
        || async { Ok(vec![image("public", "x86_64", "available", "2025-03-01")]) },
    )
    .await
    .expect("image resolves");

    assert_eq!(id, "public");
}

#[rstest]
#[tokio::test]
async fn image_ids_are_used_verbatim(config: ScalewayConfig) {
    let compute = ScalewayCompute::new(config).expect("valid config");
    let label = "5f7c2c9e-8d5e-4c8a-9c43-2f0f5c1e9a11";

    let id = compute
        .resolve_image_id(&ImageQuery {
            label,
            zone: "fr-par-1",
            arch: "x86_64",
        })
        .await
        .expect("uuid accepted");

    assert_eq!(id, label);
}

#[rstest]
#[tokio::test]
async fn get_node_reads_server_and_addresses(config: ScalewayConfig) {
    let gateway = StubGateway::start(vec![(200, SERVER_JSON)])
        .await
        .expect("stub gateway starts");
    let compute = ScalewayCompute::new(config)
        .expect("valid config")
        .with_api_base(gateway.url());

    let node = compute
        .get_node("srv-1")
        .await
        .expect("lookup succeeds")
        .expect("server exists");

    assert_eq!(node.state, NodeState::Running);
    assert_eq!(node.public_ip.as_deref(), Some("51.15.0.10"));
    assert_eq!(node.private_ip.as_deref(), Some("10.1.0.7"));
    assert_eq!(
        gateway.request_line(0),
        "GET /zones/fr-par-1/servers/srv-1 HTTP/1.1"
    );
    let request = gateway.requests().first().cloned().unwrap_or_default();
    assert!(request.to_ascii_lowercase().contains("x-auth-token: secret"));
}

#[rstest]
#[tokio::test]
async fn get_node_maps_404_to_none(config: ScalewayConfig) {
    let gateway = StubGateway::start(vec![(404, r#"{"type":"unknown_resource"}"#)])
        .await
        .expect("stub gateway starts");
    let compute = ScalewayCompute::new(config)
        .expect("valid config")
        .with_api_base(gateway.url());

    assert_eq!(compute.get_node("gone").await, Ok(None));
}

#[rstest]
#[tokio::test]
async fn list_nodes_covers_every_registered_zone(config: ScalewayConfig) {
    let page = r#"{"servers":[{"id":"a","name":"cloud-agent-1","state":"running"}]}"#;
    let gateway = StubGateway::start(vec![(200, page), (200, page)])
        .await
        .expect("stub gateway starts");
    let compute = ScalewayCompute::new(config)
        .expect("valid config")
        .with_api_base(gateway.url());
    compute.register_location("nl-ams-1");

    let nodes = compute.list_nodes().await.expect("listing succeeds");

    assert_eq!(nodes.len(), 2);
    let locations: Vec<Option<String>> = nodes.into_iter().map(|node| node.location).collect();
    assert_eq!(
        locations,
        vec![Some(String::from("fr-par-1")), Some(String::from("nl-ams-1"))]
    );
    assert_eq!(
        gateway.request_line(0),
        "GET /zones/fr-par-1/servers?tags=stratus&per_page=100&page=1 HTTP/1.1"
    );
    assert!(gateway.request_line(1).starts_with("GET /zones/nl-ams-1/servers?"));
}

#[rstest]
#[tokio::test]
async fn create_server_tags_the_group(config: ScalewayConfig) {
    let created = r#"{"server":{"id":"srv-9","name":"cloud-agent-1","state":"stopped","allowed_actions":["poweron"]}}"#;
    let gateway = StubGateway::start(vec![(201, created)])
        .await
        .expect("stub gateway starts");
    let compute = ScalewayCompute::new(config)
        .expect("valid config")
        .with_api_base(gateway.url());

    let server = compute
        .create_server(&request(Some("nl-ams-1")), "nl-ams-1", "img-1")
        .await
        .expect("creation succeeds");

    assert_eq!(server.id, "srv-9");
    assert!(server.allows("poweron"));
    let text = gateway.requests().first().cloned().unwrap_or_default();
    assert!(text.starts_with("POST /zones/nl-ams-1/servers HTTP/1.1"));
    assert!(text.contains(r#""tags":["stratus","cloud-agent-"]"#), "body: {text}");
    assert!(text.contains(r#""commercial_type":"DEV1-S""#));
    assert!(text.contains(r#""project":"project""#));
    assert!(!text.contains("organization"));
}

#[rstest]
#[tokio::test]
async fn unknown_commercial_type_is_reported(config: ScalewayConfig) {
    let gateway = StubGateway::start(vec![(
        400,
        r#"{"type":"invalid_arguments","message":"Validation Error","resource":"commercial_type"}"#,
    )])
    .await
    .expect("stub gateway starts");
    let compute = ScalewayCompute::new(config)
        .expect("valid config")
        .with_api_base(gateway.url());

    let err = compute
        .create_server(&request(None), "fr-par-1", "img-1")
        .await
        .expect_err("type rejected");

    assert_eq!(
        err,
        ScalewayBackendError::InstanceTypeUnavailable {
            instance_type: String::from("DEV1-S"),
            zone: String::from("fr-par-1"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn security_group_wording_survives_conversion(config: ScalewayConfig) {
    let gateway = StubGateway::start(vec![(
        404,
        r#"{"type":"unknown_resource","message":"The security group sg-1 does not exist"}"#,
    )])
    .await
    .expect("stub gateway starts");
    let compute = ScalewayCompute::new(config)
        .expect("valid config")
        .with_api_base(gateway.url());

    let err = compute
        .create_server(&request(None), "fr-par-1", "img-1")
        .await
        .expect_err("group missing");

    let converted = ComputeError::from(err);
    assert!(converted.is_security_group_not_ready());
}

#[rstest]
fn config_errors_stay_config_errors() {
    let err = DriverError::from(ScalewayBackendError::Config(String::from("missing key")));
    assert_eq!(err, DriverError::Config(String::from("missing key")));

    let wrapped = DriverError::from(ScalewayBackendError::NotFound {
        instance_id: String::from("srv-1"),
    });
    assert_eq!(
        wrapped,
        DriverError::Compute(ComputeError::NotFound {
            id: String::from("srv-1")
        })
    );
}
