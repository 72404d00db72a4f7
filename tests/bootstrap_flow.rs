//! End-to-end bootstrap over the BYON driver with scripted collaborators.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use stratus::test_support::{FakeConnector, FakeControlPlane, FakeInstaller, FakeProbe};
use stratus::{
    BootstrapError, BootstrapOptions, BootstrapOrchestrator, ByonDriver, ClusterDescriptor,
    DriverRegistry, InstallerError, ProvisioningDriver,
};
use stratus::bootstrap::DEFAULT_REST_PORT;

struct Lab {
    _dir: TempDir,
    descriptor_path: Utf8PathBuf,
    probe: FakeProbe,
    installer: FakeInstaller,
    connector: FakeConnector,
}

impl Lab {
    fn orchestrator(&self) -> BootstrapOrchestrator {
        let mut registry = DriverRegistry::new();
        let probe = self.probe.clone();
        registry.register("byon", move || {
            Ok(Box::new(
                ByonDriver::new(Arc::new(probe.clone()))
                    .with_validation_timeout(Duration::from_secs(1)),
            ) as Box<dyn ProvisioningDriver>)
        });
        let descriptor =
            ClusterDescriptor::load(&self.descriptor_path).expect("descriptor loads");
        BootstrapOrchestrator::new(
            Arc::new(registry),
            descriptor,
            self.descriptor_path.clone(),
            Arc::new(self.installer.clone()),
            Arc::new(self.connector.clone()),
        )
        .with_options(BootstrapOptions {
            poll_interval: Duration::from_secs(1),
            ..BootstrapOptions::default()
        })
    }

    async fn bootstrap_and_serve(&self) -> Vec<String> {
        let report = self
            .orchestrator()
            .bootstrap(Duration::from_secs(600))
            .await
            .expect("bootstrap succeeds");
        for host in &report.installed {
            self.probe.open_port(host, DEFAULT_REST_PORT);
        }
        report.installed
    }
}

#[fixture]
fn lab() -> Lab {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp path");
    let upload = root.join("upload");
    fs::create_dir(&upload).expect("upload dir");
    fs::write(upload.join("bootstrap-management.sh"), "#!/bin/sh\n").expect("script");

    let descriptor_path = root.join("cluster.toml");
    let contents = format!(
        r#"
name = "lab"
management_template = "MANAGER"

[provider]
driver = "byon"
management_group = "lab-manager-"
management_machines = 2
install_source_url = "https://downloads.example.com/stratus.tar.gz"

[templates.MANAGER]
username = "ops"
key_file = "/keys/lab.pem"
local_directory = "{upload}"

[[templates.MANAGER.nodes]]
id = "mgr-{{0}}"
host-range = "10.0.0.1-10.0.0.3"
"#
    );
    fs::write(&descriptor_path, contents).expect("descriptor");
    let probe = FakeProbe::reachable();
    probe.close_port(DEFAULT_REST_PORT);

    Lab {
        _dir: dir,
        descriptor_path,
        probe,
        installer: FakeInstaller::new(),
        connector: FakeConnector::new(FakeControlPlane::new()),
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn byon_cluster_bootstraps_two_seeds(lab: Lab) {
    let report = lab
        .orchestrator()
        .bootstrap(Duration::from_secs(600))
        .await
        .expect("bootstrap succeeds");

    assert_eq!(report.machines.len(), 2);
    assert_eq!(report.installed.len(), 2);
    for host in &report.installed {
        assert!(host.starts_with("10.0.0."), "unexpected host {host}");
    }
    let installs = lab.installer.installs();
    assert_eq!(installs.len(), 2);
    assert!(installs.iter().all(|details| details.username == "ops"));
    assert_eq!(
        installs.iter().filter(|details| !details.no_web_services).count(),
        1
    );
    assert_eq!(lab.connector.urls().len(), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unreachable_nodes_are_skipped(lab: Lab) {
    lab.probe.block("10.0.0.1");

    let report = lab
        .orchestrator()
        .bootstrap(Duration::from_secs(600))
        .await
        .expect("bootstrap succeeds on the remaining nodes");

    let mut hosts = report.installed.clone();
    hosts.sort();
    assert_eq!(hosts, vec![String::from("10.0.0.2"), String::from("10.0.0.3")]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_seed_is_reported_by_host(lab: Lab) {
    lab.probe.block("10.0.0.3");
    lab.installer.fail_host(
        "10.0.0.2",
        InstallerError::ConnectTimeout {
            host: String::from("10.0.0.2"),
            port: 22,
        },
    );

    let err = lab
        .orchestrator()
        .bootstrap(Duration::from_secs(600))
        .await
        .expect_err("one seed fails");

    assert!(
        matches!(&err, BootstrapError::Install { host, .. } if host == "10.0.0.2"),
        "unexpected error: {err}"
    );
    assert_eq!(lab.installer.installs().len(), 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn later_run_tears_down_a_running_cluster(lab: Lab) {
    lab.bootstrap_and_serve().await;

    lab.orchestrator()
        .teardown(Duration::from_secs(600), true, None)
        .await
        .expect("teardown finds the running seeds");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn later_bootstrap_reuses_running_seeds(lab: Lab) {
    let mut first = lab.bootstrap_and_serve().await;

    let report = lab
        .orchestrator()
        .bootstrap(Duration::from_secs(600))
        .await
        .expect("second bootstrap succeeds");

    assert!(report.installed.is_empty());
    assert!(report.machines.iter().all(|machine| machine.agent_running));
    let mut reused: Vec<String> = report
        .machines
        .iter()
        .filter_map(|machine| machine.private_address.clone())
        .collect();
    reused.sort();
    first.sort();
    assert_eq!(reused, first);
    assert_eq!(lab.installer.installs().len(), 2);
}
