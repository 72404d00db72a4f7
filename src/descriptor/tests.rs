//! Unit tests for cluster descriptor parsing.

use super::*;
use rstest::rstest;

const BYON_DESCRIPTOR: &str = r#"
name = "lab"
management_template = "SMALL_LINUX"

[provider]
driver = "byon"
management_group = "lab-manager-"
management_machines = 2
management_only_files = ["cluster-keys.pem"]
install_source_url = "https://downloads.example.com/stratus.tar.gz"

[templates.SMALL_LINUX]
username = "ops"
key_file = "/keys/lab.pem"
local_directory = "upload"
connect_via_private_ip = true

[[templates.SMALL_LINUX.nodes]]
id = "lab-{0}"
host-range = "10.0.0.1-10.0.0.3"

[[templates.SMALL_LINUX.nodes]]
id = "spare"
host-list = "spare.lab.example.com"
keyFile = "/keys/spare.pem"
"#;

fn parse(contents: &str) -> Result<ClusterDescriptor, DescriptorError> {
    ClusterDescriptor::parse(Utf8Path::new("cluster.toml"), contents)
}

#[test]
fn parses_byon_descriptor_with_defaults() {
    let descriptor = parse(BYON_DESCRIPTOR).expect("descriptor should parse");
    let template = descriptor
        .template("SMALL_LINUX")
        .expect("template should exist");

    assert_eq!(descriptor.provider.management_machines, 2);
    assert_eq!(template.remote_directory, DEFAULT_REMOTE_DIRECTORY);
    assert_eq!(template.bootstrap_script, DEFAULT_BOOTSTRAP_SCRIPT);
    assert_eq!(template.file_transfer, FileTransferMode::Sftp);
    assert_eq!(template.nodes.len(), 2);
    assert_eq!(
        template.nodes.get(1).and_then(|node| node.key_file.as_deref()),
        Some("/keys/spare.pem")
    );
    assert_eq!(
        template.credential(),
        Some(Credential::KeyFile(Utf8PathBuf::from("/keys/lab.pem")))
    );
}

#[rstest]
#[case("driver = \"byon\"", "driver = \"  \"", "provider.driver")]
#[case("management_machines = 2", "management_machines = 0", "management_machines")]
#[case(
    "install_source_url = \"https://downloads.example.com/stratus.tar.gz\"",
    "install_source_url = \"\"",
    "install_source_url"
)]
fn rejects_invalid_provider_settings(
    #[case] original: &str,
    #[case] replacement: &str,
    #[case] expected: &str,
) {
    let contents = BYON_DESCRIPTOR.replace(original, replacement);
    let err = parse(&contents).expect_err("descriptor should be rejected");

    assert!(
        matches!(err, DescriptorError::Invalid(ref message) if message.contains(expected)),
        "unexpected error: {err}"
    );
}

fn with_env(key: &str) -> String {
    BYON_DESCRIPTOR.replace(
        "connect_via_private_ip = true",
        &format!("connect_via_private_ip = true\nenv = {{ \"{key}\" = \"1\" }}"),
    )
}

#[rstest]
#[case::leading_digit("1ST")]
#[case::dash("JAVA-OPTS")]
#[case::command("X;touch /tmp/owned")]
#[case::empty("")]
fn rejects_env_keys_that_are_not_variable_names(#[case] key: &str) {
    let err = parse(&with_env(key)).expect_err("descriptor should be rejected");

    assert!(
        matches!(err, DescriptorError::Invalid(ref message) if message.contains("templates.SMALL_LINUX.env")),
        "unexpected error: {err}"
    );
}

#[rstest]
#[case("_JAVA_OPTS")]
#[case("Xmx2")]
fn accepts_env_keys_that_are_variable_names(#[case] key: &str) {
    let descriptor = parse(&with_env(key)).expect("descriptor should parse");

    let template = descriptor.template("SMALL_LINUX").expect("template should exist");
    assert_eq!(template.env.get(key).map(String::as_str), Some("1"));
}

#[test]
fn rejects_unknown_management_template() {
    let contents = BYON_DESCRIPTOR.replace(
        "management_template = \"SMALL_LINUX\"",
        "management_template = \"MISSING\"",
    );
    let err = parse(&contents).expect_err("descriptor should be rejected");

    assert_eq!(
        err,
        DescriptorError::UnknownTemplate {
            name: String::from("MISSING")
        }
    );
}

#[test]
fn malformed_toml_reports_parse_error() {
    let err = parse("name = ").expect_err("descriptor should be rejected");

    assert!(matches!(err, DescriptorError::Parse { .. }), "unexpected error: {err}");
}

#[rstest]
#[case(true, Some("lab-manager-"), "lab-manager-")]
#[case(true, Some("  "), DEFAULT_MANAGEMENT_PREFIX)]
#[case(true, None, DEFAULT_MANAGEMENT_PREFIX)]
#[case(false, None, DEFAULT_AGENT_PREFIX)]
fn name_prefix_falls_back_to_defaults(
    #[case] management: bool,
    #[case] configured: Option<&str>,
    #[case] expected: &str,
) {
    let mut descriptor = parse(BYON_DESCRIPTOR).expect("descriptor should parse");
    descriptor.provider.management_group = configured.map(str::to_owned);

    assert_eq!(descriptor.provider.name_prefix(management), expected);
}

#[test]
fn management_installation_uses_management_zone() {
    let descriptor = parse(BYON_DESCRIPTOR).expect("descriptor should parse");
    let template = descriptor
        .management_installation(String::from("10.0.0.1"), None)
        .expect("template should build");

    assert_eq!(template.zones, vec![String::from(MANAGEMENT_ZONE)]);
    assert!(template.connect_via_private_ip);
    assert!(template.management_only_files.contains("cluster-keys.pem"));
    assert_eq!(template.locator, "10.0.0.1");
}

#[test]
fn load_reads_descriptor_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("cluster.toml")).expect("utf8 path");
    std::fs::write(&path, BYON_DESCRIPTOR).expect("write descriptor");

    let descriptor = ClusterDescriptor::load(&path).expect("descriptor should load");

    assert_eq!(descriptor.name, "lab");
}

#[test]
fn load_reports_missing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("absent.toml")).expect("utf8 path");

    let err = ClusterDescriptor::load(&path).expect_err("missing file should fail");

    assert!(matches!(err, DescriptorError::Io { .. }), "unexpected error: {err}");
}
