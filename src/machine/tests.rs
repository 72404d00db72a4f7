//! Unit tests for machine and installation records.

use super::*;
use rstest::{fixture, rstest};

#[fixture]
fn machine() -> MachineDetails {
    MachineDetails {
        machine_id: String::from("srv-1"),
        public_address: Some(String::from("203.0.113.10")),
        private_address: Some(String::from("10.0.0.10")),
        username: String::from("root"),
        credential: Some(Credential::KeyFile(Utf8PathBuf::from("/keys/id"))),
        remote_directory: String::new(),
        file_transfer: FileTransferMode::Sftp,
        remote_execution: RemoteExecutionMode::Ssh,
        agent_running: false,
        agent_installed: false,
        location_id: None,
        template_name: String::from("SMALL"),
    }
}

#[fixture]
fn template() -> InstallationTemplate {
    InstallationTemplate {
        template_name: String::from("SMALL"),
        locator: String::from("10.0.0.10,10.0.0.11"),
        zones: vec![String::from("management")],
        local_directory: Utf8PathBuf::from("/upload"),
        remote_directory: String::from("/opt/stratus"),
        management_only_files: BTreeSet::from([String::from("keys.pem")]),
        cluster_descriptor: Some(Utf8PathBuf::from("/upload/cluster-descriptor.toml")),
        install_source_url: String::from("https://example.com/stratus.tar.gz"),
        bootstrap_script: String::from("bootstrap-management.sh"),
        ..InstallationTemplate::default()
    }
}

#[rstest]
fn seed_details_keep_descriptor_and_full_bundle(
    machine: MachineDetails,
    template: InstallationTemplate,
) {
    let details = template.details_for(
        &machine,
        InstallRole::Seed {
            no_web_services: true,
        },
    );

    assert!(details.management);
    assert!(details.no_web_services);
    assert!(details.exclusions.is_empty());
    assert_eq!(
        details.cluster_descriptor.as_deref(),
        Some(camino::Utf8Path::new("/upload/cluster-descriptor.toml"))
    );
    assert_eq!(details.remote_directory, "/opt/stratus");
    assert_eq!(details.machine_id, "srv-1");
}

#[rstest]
fn agent_details_withhold_management_files(
    machine: MachineDetails,
    template: InstallationTemplate,
) {
    let details = template.details_for(&machine, InstallRole::Agent);

    assert!(!details.management);
    assert!(details.exclusions.contains("keys.pem"));
    assert!(details.cluster_descriptor.is_none());
}

#[rstest]
fn every_install_gets_a_fresh_reservation(
    machine: MachineDetails,
    template: InstallationTemplate,
) {
    let first = template.details_for(&machine, InstallRole::Agent);
    let second = template.details_for(&machine, InstallRole::Agent);

    assert_ne!(first.reservation_id, second.reservation_id);
}

#[rstest]
fn empty_locator_defaults_to_private_address(
    machine: MachineDetails,
    mut template: InstallationTemplate,
) {
    template.locator = String::new();
    let details = template.details_for(&machine, InstallRole::Agent);

    assert_eq!(details.locator, "10.0.0.10");
}

#[rstest]
fn machine_remote_directory_overrides_template(
    mut machine: MachineDetails,
    template: InstallationTemplate,
) {
    machine.remote_directory = String::from("/srv/agent");
    let details = template.details_for(&machine, InstallRole::Agent);

    assert_eq!(details.remote_directory, "/srv/agent");
}

#[rstest]
#[case(false, false, Some("203.0.113.10"), Some("203.0.113.10"))]
#[case(true, false, Some("10.0.0.10"), Some("203.0.113.10"))]
#[case(false, true, Some("203.0.113.10"), Some("10.0.0.10"))]
fn connect_and_bind_addresses_follow_flags(
    machine: MachineDetails,
    template: InstallationTemplate,
    #[case] connect_private: bool,
    #[case] bind_private: bool,
    #[case] connect: Option<&str>,
    #[case] bind: Option<&str>,
) {
    let mut details = template.details_for(&machine, InstallRole::Agent);
    details.connect_via_private_ip = connect_private;
    details.bind_to_private_ip = bind_private;

    assert_eq!(details.connect_host(), connect);
    assert_eq!(details.machine_ip(), bind);
}

#[rstest]
fn address_falls_back_to_the_other_network(mut machine: MachineDetails) {
    machine.private_address = None;

    assert_eq!(machine.address(true), Some("203.0.113.10"));
    assert_eq!(machine.host_label(), "203.0.113.10");
}

#[test]
fn password_is_redacted_in_debug_output() {
    let rendered = format!("{:?}", Credential::Password(String::from("hunter2")));

    assert!(!rendered.contains("hunter2"), "rendered: {rendered}");
}

#[test]
fn cifs_probes_the_smb_port() {
    assert_eq!(FileTransferMode::Cifs.port(), CIFS_PORT);
    assert_eq!(FileTransferMode::Sftp.port(), SSH_PORT);
}
