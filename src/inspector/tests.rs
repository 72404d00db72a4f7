//! Unit tests for the installation process inspectors.

use rstest::rstest;

use super::*;
use crate::control_plane::DeploymentEvent;
use crate::test_support::{FakeControlPlane, service_description};

fn not_found() -> ControlPlaneError {
    ControlPlaneError::NotFound {
        path: String::from("/deployments/shop/service/web/description"),
    }
}

fn install_kind(services: &[&str]) -> InspectionKind {
    InspectionKind::Install {
        application: String::from("shop"),
        services: services.iter().map(|name| (*name).to_owned()).collect(),
    }
}

fn inspector(
    plane: &FakeControlPlane,
    kind: InspectionKind,
) -> InstallationProcessInspector<FakeControlPlane> {
    InstallationProcessInspector::new(Arc::new(plane.clone()), kind)
}

#[tokio::test(start_paused = true)]
async fn install_ends_when_every_service_started() {
    let plane = FakeControlPlane::new();
    plane.script_service(
        "shop",
        "web",
        vec![
            Err(not_found()),
            Ok(service_description("shop", "web", 1, 2, DeploymentState::Installing)),
            Ok(service_description("shop", "web", 2, 2, DeploymentState::Started)),
        ],
    );
    plane.script_service(
        "shop",
        "db",
        vec![Ok(service_description("shop", "db", 1, 1, DeploymentState::Started))],
    );
    let started = Instant::now();

    inspector(&plane, install_kind(&["web", "db"]))
        .wait_for_completion(started + Duration::from_secs(30))
        .await
        .expect("install should finish");

    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn install_raises_immediately_on_failed_lifecycle() {
    let plane = FakeControlPlane::new();
    plane.script_service(
        "shop",
        "web",
        vec![Ok(service_description("shop", "web", 0, 2, DeploymentState::Failed))],
    );
    let started = Instant::now();

    let err = inspector(&plane, install_kind(&["web"]))
        .wait_for_completion(started + Duration::from_secs(60))
        .await
        .expect_err("failed lifecycle should abort");

    assert_eq!(
        err,
        InspectorError::DeploymentFailed {
            application: String::from("shop"),
            service: String::from("web"),
        }
    );
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn install_times_out_with_scenario_message() {
    let plane = FakeControlPlane::new();
    let started = Instant::now();

    let err = inspector(&plane, install_kind(&["web"]))
        .wait_for_completion(started + Duration::from_secs(3))
        .await
        .expect_err("unknown service never starts");

    assert_eq!(
        err,
        InspectorError::TimedOut {
            message: String::from(
                "Service installation timed out. Configure the timeout using the -timeout flag."
            ),
        }
    );
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[rstest]
#[case(1, DeploymentState::Started, false)]
#[case(3, DeploymentState::Installing, false)]
#[case(3, DeploymentState::Started, true)]
#[tokio::test(start_paused = true)]
async fn scale_up_needs_count_and_started_state(
    #[case] instances: u32,
    #[case] state: DeploymentState,
    #[case] ends: bool,
) {
    let plane = FakeControlPlane::new();
    plane.script_service(
        "shop",
        "web",
        vec![Ok(service_description("shop", "web", instances, 3, state))],
    );
    let kind = InspectionKind::ScaleUp {
        application: String::from("shop"),
        service: String::from("web"),
        planned: 3,
    };

    let result = inspector(&plane, kind)
        .wait_for_completion(Instant::now() + Duration::from_secs(2))
        .await;

    assert_eq!(result.is_ok(), ends, "unexpected result: {result:?}");
}

#[tokio::test(start_paused = true)]
async fn scale_down_ends_at_planned_count() {
    let plane = FakeControlPlane::new();
    plane.script_service(
        "shop",
        "web",
        vec![
            Ok(service_description("shop", "web", 3, 1, DeploymentState::Started)),
            Ok(service_description("shop", "web", 2, 1, DeploymentState::Started)),
            Ok(service_description("shop", "web", 1, 1, DeploymentState::Installing)),
        ],
    );
    let kind = InspectionKind::ScaleDown {
        application: String::from("shop"),
        service: String::from("web"),
        planned: 1,
    };

    inspector(&plane, kind)
        .wait_for_completion(Instant::now() + Duration::from_secs(10))
        .await
        .expect("scale down should finish");
}

#[tokio::test(start_paused = true)]
async fn uninstall_ends_when_deployment_is_empty() {
    let plane = FakeControlPlane::new();
    plane.script_deployment(
        "dep-1",
        vec![
            vec![service_description("shop", "web", 1, 1, DeploymentState::Started)],
            Vec::new(),
        ],
    );
    let kind = InspectionKind::Uninstall {
        deployment_id: String::from("dep-1"),
    };

    inspector(&plane, kind)
        .wait_for_completion(Instant::now() + Duration::from_secs(10))
        .await
        .expect("uninstall should finish");
}

#[tokio::test(start_paused = true)]
async fn uninstall_times_out_with_scenario_message() {
    let plane = FakeControlPlane::new();
    plane.script_deployment(
        "dep-1",
        vec![vec![service_description("shop", "web", 1, 1, DeploymentState::Started)]],
    );
    let kind = InspectionKind::Uninstall {
        deployment_id: String::from("dep-1"),
    };

    let err = inspector(&plane, kind)
        .wait_for_completion(Instant::now() + Duration::from_secs(2))
        .await
        .expect_err("deployment never empties");

    assert!(
        matches!(err, InspectorError::TimedOut { ref message } if message.starts_with("Application uninstall timed out"))
    );
}

#[tokio::test(start_paused = true)]
async fn events_are_fetched_from_after_the_last_index() {
    let plane = FakeControlPlane::new();
    plane.script_deployment(
        "dep-1",
        vec![
            vec![service_description("shop", "web", 1, 1, DeploymentState::Started)],
            vec![service_description("shop", "web", 1, 1, DeploymentState::Started)],
            Vec::new(),
        ],
    );
    plane.push_events(
        "dep-1",
        vec![
            DeploymentEvent {
                index: 0,
                description: String::from("undeploying web"),
            },
            DeploymentEvent {
                index: 1,
                description: String::from("web stopped"),
            },
        ],
    );
    let subject = inspector(
        &plane,
        InspectionKind::Uninstall {
            deployment_id: String::from("dep-1"),
        },
    );

    subject
        .wait_for_completion(Instant::now() + Duration::from_secs(10))
        .await
        .expect("uninstall should finish");

    assert_eq!(subject.last_event_index(), 1);
    let froms: Vec<i64> = plane
        .event_requests()
        .into_iter()
        .map(|(_, from)| from)
        .collect();
    assert_eq!(froms, vec![0, 2, 2]);
}

#[rstest]
#[case::install(install_kind(&["web"]))]
#[case::scale_up(InspectionKind::ScaleUp {
    application: String::from("shop"),
    service: String::from("web"),
    planned: 3,
})]
#[case::scale_down(InspectionKind::ScaleDown {
    application: String::from("shop"),
    service: String::from("web"),
    planned: 0,
})]
#[tokio::test(start_paused = true)]
async fn gateway_errors_abort_instead_of_timing_out(#[case] kind: InspectionKind) {
    let plane = FakeControlPlane::new();
    let failure = ControlPlaneError::Http {
        path: String::from("/deployments/shop/service/web/description"),
        status: 500,
        message: String::from("internal error"),
    };
    plane.script_service("shop", "web", vec![Err(failure.clone())]);
    let started = Instant::now();

    let err = inspector(&plane, kind)
        .wait_for_completion(started + Duration::from_secs(600))
        .await
        .expect_err("server error is fatal");

    assert_eq!(err, InspectorError::ControlPlane(failure));
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn running_instances_of_unknown_service_is_zero() {
    let plane = FakeControlPlane::new();
    let subject = inspector(&plane, install_kind(&["web"]));

    let count = subject
        .number_of_running_instances("shop", "web")
        .await
        .expect("not found maps to zero");

    assert_eq!(count, 0);
}

#[rstest]
#[case(install_kind(&["web"]), "Service installation")]
#[case(InspectionKind::Uninstall { deployment_id: String::from("d") }, "Application uninstall")]
#[case(
    InspectionKind::ScaleUp { application: String::from("a"), service: String::from("s"), planned: 2 },
    "Service scale up"
)]
#[case(
    InspectionKind::ScaleDown { application: String::from("a"), service: String::from("s"), planned: 1 },
    "Service scale down"
)]
fn timeout_messages_name_the_scenario(#[case] kind: InspectionKind, #[case] prefix: &str) {
    let message = kind.timeout_message();
    assert!(message.starts_with(prefix), "{message}");
    assert!(message.ends_with("Configure the timeout using the -timeout flag."));
}
