//! Unit tests for the agentless installer.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rstest::{fixture, rstest};
use tempfile::TempDir;
use tokio::time::Instant;

use super::transfer::{LocalFile, batch_script, parse_remote_listing, plan_transfer, walk_local};
use super::*;
use crate::machine::{Credential, FileTransferMode, RemoteExecutionMode};
use crate::test_support::{FakeProbe, ScriptedRunner};

fn details(local_directory: &Utf8Path) -> InstallationDetails {
    InstallationDetails {
        machine_id: String::from("srv-1"),
        template_name: String::from("SMALL"),
        private_ip: Some(String::from("10.0.0.5")),
        public_ip: Some(String::from("203.0.113.5")),
        username: String::from("root"),
        credential: Some(Credential::KeyFile(Utf8PathBuf::from("/keys/id"))),
        locator: String::from("10.0.0.5,10.0.0.6"),
        zones: vec![String::from("management")],
        local_directory: local_directory.to_path_buf(),
        remote_directory: String::from("/opt/stratus"),
        exclusions: BTreeSet::new(),
        cluster_descriptor: None,
        management: true,
        no_web_services: false,
        connect_via_private_ip: false,
        bind_to_private_ip: true,
        install_source_url: String::from("https://downloads.example.com/stratus.tar.gz"),
        install_overrides_url: None,
        reservation_id: String::from("res-1"),
        bootstrap_script: String::from("bootstrap-management.sh"),
        extra_env: BTreeMap::new(),
        file_transfer: FileTransferMode::Sftp,
        remote_execution: RemoteExecutionMode::Ssh,
    }
}

struct Bundle {
    _dir: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn bundle() -> Bundle {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp path");
    std::fs::create_dir_all(root.join("lib")).expect("create lib");
    std::fs::write(root.join("bootstrap-management.sh"), "#!/bin/sh\n").expect("write script");
    std::fs::write(root.join("lib/agent.jar"), "0123456789").expect("write jar");
    std::fs::write(root.join("keys.pem"), "secret").expect("write key");
    Bundle { _dir: dir, root }
}

fn installer(
    runner: &ScriptedRunner,
    probe: &FakeProbe,
) -> AgentlessInstaller<ScriptedRunner, FakeProbe> {
    AgentlessInstaller::new(InstallerOptions::default(), runner.clone(), probe.clone())
}

fn args_of(spec: &CommandSpec) -> Vec<String> {
    spec.args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unreachable_host_times_out_without_running_commands(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    let probe = FakeProbe::unreachable();
    let started = Instant::now();

    let err = installer(&runner, &probe)
        .install(&details(&bundle.root), started + Duration::from_secs(3))
        .await
        .expect_err("host never answers");

    let elapsed = started.elapsed();
    assert_eq!(
        err,
        InstallerError::ConnectTimeout {
            host: String::from("203.0.113.5"),
            port: 22,
        }
    );
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(4), "elapsed {elapsed:?}");
    assert!(runner.invocations().is_empty());
    assert!(!probe.calls().is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn hanging_probe_is_bounded_by_the_deadline(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    let probe = FakeProbe::unreachable();
    probe.set_delay(Duration::from_secs(60));
    let started = Instant::now();

    let err = installer(&runner, &probe)
        .install(&details(&bundle.root), started + Duration::from_secs(3))
        .await
        .expect_err("host never answers");

    assert!(matches!(err, InstallerError::ConnectTimeout { .. }));
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}

#[rstest]
#[tokio::test]
async fn installs_by_listing_uploading_and_executing(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    runner.push_stdout("lib/agent.jar\t10\n");
    runner.push_success();
    runner.push_success();
    let probe = FakeProbe::reachable();

    installer(&runner, &probe)
        .install(&details(&bundle.root), Instant::now() + Duration::from_secs(60))
        .await
        .expect("install succeeds");

    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 3);
    let programs: Vec<&str> = invocations.iter().map(|spec| spec.program.as_str()).collect();
    assert_eq!(programs, vec!["ssh", "sftp", "ssh"]);

    let listing = invocations.first().map(args_of).unwrap_or_default();
    assert!(listing.contains(&String::from("root@203.0.113.5")));
    assert!(listing.iter().any(|arg| arg.starts_with("find /opt/stratus -type f")));
    assert!(listing.windows(2).any(|pair| pair == ["-i", "/keys/id"]));
    assert!(listing.contains(&String::from("StrictHostKeyChecking=no")));
    assert!(listing.contains(&String::from("UserKnownHostsFile=/dev/null")));

    let batches = runner.batches();
    let batch = batches.first().expect("batch captured");
    assert!(batch.starts_with("-mkdir /opt/stratus\n"));
    assert!(batch.contains("/opt/stratus/bootstrap-management.sh"));
    assert!(batch.contains("/opt/stratus/keys.pem"));
    assert!(!batch.contains("agent.jar"), "unchanged file uploaded: {batch}");

    let execute = invocations.get(2).map(args_of).unwrap_or_default();
    let command = execute.last().cloned().unwrap_or_default();
    assert!(command.starts_with("cd /opt/stratus && "));
    assert!(command.contains("export STRATUS_MACHINE_IP_ADDRESS=10.0.0.5;"));
    assert!(command.ends_with("chmod +x bootstrap-management.sh && ./bootstrap-management.sh"));
}

#[rstest]
#[tokio::test]
async fn up_to_date_bundle_skips_sftp(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    runner.push_stdout("bootstrap-management.sh\t10\nlib/agent.jar\t10\nkeys.pem\t6\n");
    runner.push_success();
    let probe = FakeProbe::reachable();

    installer(&runner, &probe)
        .install(&details(&bundle.root), Instant::now() + Duration::from_secs(60))
        .await
        .expect("install succeeds");

    let programs: Vec<String> = runner
        .invocations()
        .into_iter()
        .map(|spec| spec.program)
        .collect();
    assert_eq!(programs, vec!["ssh", "ssh"]);
}

#[rstest]
#[tokio::test]
async fn descriptor_is_uploaded_into_remote_root(bundle: Bundle) {
    let descriptor = bundle.root.join("cluster-descriptor.toml");
    std::fs::write(&descriptor, "name = \"lab\"\n").expect("write descriptor");
    let mut target = details(&bundle.root);
    target.cluster_descriptor = Some(descriptor.clone());
    let runner = ScriptedRunner::new();
    runner.push_stdout("bootstrap-management.sh\t10\nlib/agent.jar\t10\nkeys.pem\t6\n");
    runner.push_success();
    runner.push_success();

    installer(&runner, &FakeProbe::reachable())
        .install(&target, Instant::now() + Duration::from_secs(60))
        .await
        .expect("install succeeds");

    let batches = runner.batches();
    let batch = batches.first().expect("batch captured");
    assert_eq!(batch.matches("cluster-descriptor.toml").count(), 2);
    assert!(batch.contains("/opt/stratus/cluster-descriptor.toml"));
    let command = runner
        .invocations()
        .last()
        .map(args_of)
        .and_then(|args| args.last().cloned())
        .unwrap_or_default();
    assert!(command.contains("export STRATUS_CLUSTER_DESCRIPTOR=/opt/stratus/cluster-descriptor.toml;"));
}

#[rstest]
#[case(Some(114), "114", "failed to remove nohup.out, another process may be using it")]
#[case(Some(7), "7", "script terminated unexpectedly")]
#[case(None, "signal", "script terminated unexpectedly")]
#[tokio::test]
async fn script_failures_carry_status_and_description(
    bundle: Bundle,
    #[case] code: Option<i32>,
    #[case] status: &str,
    #[case] description: &str,
) {
    let runner = ScriptedRunner::new();
    runner.push_stdout("bootstrap-management.sh\t10\nlib/agent.jar\t10\nkeys.pem\t6\n");
    runner.push_output(CommandOutput {
        code,
        ..CommandOutput::default()
    });

    let err = installer(&runner, &FakeProbe::reachable())
        .install(&details(&bundle.root), Instant::now() + Duration::from_secs(60))
        .await
        .expect_err("script fails");

    assert_eq!(
        err,
        InstallerError::NonZeroExit {
            host: String::from("203.0.113.5"),
            script: String::from("bootstrap-management.sh"),
            status: status.to_owned(),
            description: description.to_owned(),
        }
    );
}

#[rstest]
#[tokio::test]
async fn killed_script_reports_execution_timeout(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    runner.push_stdout("bootstrap-management.sh\t10\nlib/agent.jar\t10\nkeys.pem\t6\n");
    runner.push_timeout();

    let err = installer(&runner, &FakeProbe::reachable())
        .install(&details(&bundle.root), Instant::now() + Duration::from_secs(60))
        .await
        .expect_err("script killed");

    assert!(matches!(err, InstallerError::ExecutionTimeout { .. }));
    assert!(err.is_retryable());
}

#[rstest]
#[tokio::test]
async fn failed_upload_reports_transfer_error(bundle: Bundle) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    runner.push_failure(1);

    let err = installer(&runner, &FakeProbe::reachable())
        .install(&details(&bundle.root), Instant::now() + Duration::from_secs(60))
        .await
        .expect_err("sftp fails");

    assert_eq!(
        err,
        InstallerError::Transfer {
            host: String::from("203.0.113.5"),
            message: String::from("simulated failure"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn password_credentials_wrap_commands_in_sshpass(bundle: Bundle) {
    let mut target = details(&bundle.root);
    target.credential = Some(Credential::Password(String::from("hunter2")));
    let runner = ScriptedRunner::new();
    runner.push_stdout("bootstrap-management.sh\t10\nkeys.pem\t6\n");
    runner.push_success();
    runner.push_success();

    installer(&runner, &FakeProbe::reachable())
        .install(&target, Instant::now() + Duration::from_secs(60))
        .await
        .expect("install succeeds");

    let invocations = runner.invocations();
    assert_eq!(invocations.len(), 3);
    let first = invocations.first().expect("listing ran");
    assert_eq!(first.program, "sshpass");
    assert_eq!(
        args_of(first).get(..2),
        Some([String::from("-e"), String::from("ssh")].as_slice())
    );
    assert!(args_of(first).contains(&String::from("BatchMode=no")));
    assert_eq!(
        first.env,
        vec![(String::from("SSHPASS"), String::from("hunter2"))]
    );
    assert!(!first.command_string().contains("hunter2"));

    let upload = args_of(invocations.get(1).expect("sftp ran"));
    assert_eq!(
        upload.get(..2),
        Some([String::from("-e"), String::from("sftp")].as_slice())
    );
    let batch_mode = upload
        .iter()
        .position(|arg| arg == "BatchMode=no")
        .expect("password login enabled");
    let batch_flag = upload
        .iter()
        .position(|arg| arg == "-b")
        .expect("batch file passed");
    assert!(
        batch_mode < batch_flag,
        "BatchMode=no must precede -b: {upload:?}"
    );
    assert_eq!(upload.last().map(String::as_str), Some("root@203.0.113.5"));
}

#[rstest]
#[case(FileTransferMode::Cifs, RemoteExecutionMode::Ssh)]
#[case(FileTransferMode::Sftp, RemoteExecutionMode::Shell)]
#[tokio::test]
async fn unsupported_modes_fail_before_probing(
    bundle: Bundle,
    #[case] transfer: FileTransferMode,
    #[case] execution: RemoteExecutionMode,
) {
    let mut target = details(&bundle.root);
    target.file_transfer = transfer;
    target.remote_execution = execution;
    let probe = FakeProbe::reachable();

    let err = installer(&ScriptedRunner::new(), &probe)
        .install(&target, Instant::now() + Duration::from_secs(60))
        .await
        .expect_err("mode unsupported");

    assert!(matches!(err, InstallerError::UnsupportedMode { .. }));
    assert!(probe.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn machine_without_address_is_rejected(bundle: Bundle) {
    let mut target = details(&bundle.root);
    target.public_ip = None;

    let err = installer(&ScriptedRunner::new(), &FakeProbe::reachable())
        .install(&target, Instant::now() + Duration::from_secs(60))
        .await
        .expect_err("no address");

    assert_eq!(
        err,
        InstallerError::MissingAddress {
            machine_id: String::from("srv-1")
        }
    );
}

#[rstest]
#[tokio::test]
async fn private_connections_use_the_private_address(bundle: Bundle) {
    let mut target = details(&bundle.root);
    target.connect_via_private_ip = true;
    let probe = FakeProbe::reachable();
    let runner = ScriptedRunner::new();
    runner.push_stdout("bootstrap-management.sh\t10\nlib/agent.jar\t10\nkeys.pem\t6\n");
    runner.push_success();

    installer(&runner, &probe)
        .install(&target, Instant::now() + Duration::from_secs(60))
        .await
        .expect("install succeeds");

    assert_eq!(probe.calls(), vec![String::from("10.0.0.5")]);
    assert!(
        runner
            .invocations()
            .iter()
            .all(|spec| spec.log_tag == "10.0.0.5")
    );
}

#[rstest]
fn walk_lists_nested_files_and_skips_the_descriptor(bundle: Bundle) {
    std::fs::write(bundle.root.join("cluster-descriptor.toml"), "x").expect("write descriptor");

    let files = walk_local(&bundle.root, Some("cluster-descriptor.toml")).expect("walk succeeds");

    let names: Vec<&str> = files.iter().map(|file| file.relative.as_str()).collect();
    assert_eq!(names, vec!["bootstrap-management.sh", "keys.pem", "lib/agent.jar"]);
    assert_eq!(files.last().map(|file| file.size), Some(10));
}

fn local(relative: &str, size: u64) -> LocalFile {
    LocalFile {
        relative: relative.to_owned(),
        size,
    }
}

#[rstest]
fn plan_uploads_missing_and_resized_files() {
    let local_files = vec![
        local("a.sh", 5),
        local("lib/b.jar", 10),
        local("lib/deep/c.txt", 3),
        local("same.txt", 4),
    ];
    let remote = parse_remote_listing("lib/b.jar\t9\nsame.txt\t4\ngarbage\n");

    let plan = plan_transfer(&local_files, &remote, &BTreeSet::new());

    assert_eq!(plan.files, vec!["a.sh", "lib/b.jar", "lib/deep/c.txt"]);
    assert_eq!(plan.directories, vec!["lib", "lib/deep"]);
}

#[rstest]
#[case("keys.pem")]
#[case("conf/keys.pem")]
fn plan_honours_exclusions_by_name_or_path(#[case] exclusion: &str) {
    let local_files = vec![local("conf/keys.pem", 6), local("conf/app.toml", 2)];
    let exclusions = BTreeSet::from([exclusion.to_owned()]);

    let plan = plan_transfer(&local_files, &BTreeMap::new(), &exclusions);

    assert_eq!(plan.files, vec!["conf/app.toml"]);
}

#[rstest]
fn batch_script_quotes_paths_with_spaces() {
    let plan = plan_transfer(&[local("my file.txt", 1)], &BTreeMap::new(), &BTreeSet::new());

    let script = batch_script(Utf8Path::new("/local dir"), "/opt/stratus", &plan, None);

    assert_eq!(
        script,
        "-mkdir /opt/stratus\nput '/local dir/my file.txt' '/opt/stratus/my file.txt'\n"
    );
}

#[rstest]
fn contract_lists_variables_in_order(bundle: Bundle) {
    let mut target = details(&bundle.root);
    target
        .extra_env
        .insert(String::from("JAVA_OPTS"), String::from("-Xmx1g"));

    let vars = env::contract(&target);
    let keys: Vec<&str> = vars.iter().map(|(key, _)| key.as_str()).collect();

    assert_eq!(
        keys,
        vec![
            env::ENV_LOCATORS,
            env::ENV_AGENT_MODE,
            env::ENV_NO_WEB_SERVICES,
            env::ENV_MACHINE_IP_ADDRESS,
            env::ENV_PRIVATE_IP_ADDRESS,
            env::ENV_PUBLIC_IP_ADDRESS,
            env::ENV_MACHINE_ZONES,
            env::ENV_INSTALL_SOURCE_URL,
            env::ENV_INSTALL_OVERRIDES_URL,
            env::ENV_WORKING_HOME_DIRECTORY,
            env::ENV_TEMPLATE_NAME,
            env::ENV_MACHINE_ID,
            env::ENV_RESERVATION_ID,
            "JAVA_OPTS",
        ]
    );
    let lookup: BTreeMap<&str, &str> = vars
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    assert_eq!(lookup.get(env::ENV_AGENT_MODE), Some(&"seed"));
    assert_eq!(lookup.get(env::ENV_NO_WEB_SERVICES), Some(&"false"));
    assert_eq!(lookup.get(env::ENV_MACHINE_ZONES), Some(&"management"));
}

#[rstest]
fn script_command_escapes_values(bundle: Bundle) {
    let mut target = details(&bundle.root);
    target
        .extra_env
        .insert(String::from("GREETING"), String::from("hello world"));

    let command = env::script_command(&target);

    assert!(command.contains("export GREETING='hello world';"));
    assert!(command.contains("export STRATUS_AGENT_MODE=seed;"));
}

#[rstest]
fn script_command_drops_keys_that_are_not_variable_names(bundle: Bundle) {
    let mut target = details(&bundle.root);
    target
        .extra_env
        .insert(String::from("X;touch /tmp/owned"), String::from("1"));
    target
        .extra_env
        .insert(String::from("JAVA_OPTS"), String::from("-Xmx1g"));

    let command = env::script_command(&target);

    assert!(!command.contains("touch"), "command: {command}");
    assert!(command.contains("export JAVA_OPTS="));
}

#[rstest]
#[case("JAVA_OPTS", true)]
#[case("_private", true)]
#[case("a1", true)]
#[case("1a", false)]
#[case("A-B", false)]
#[case("", false)]
fn variable_names_follow_shell_rules(#[case] name: &str, #[case] valid: bool) {
    assert_eq!(env::is_variable_name(name), valid);
}

#[rstest]
#[case(Some(100), "environment file not found, bootstrapping cannot proceed")]
#[case(Some(131), "no running agent found after bootstrap completed")]
#[case(Some(255), "the SSH session failed or the script reported a custom error")]
#[case(Some(1), "script terminated unexpectedly")]
#[case(None, "script terminated unexpectedly")]
fn exit_codes_are_described(#[case] code: Option<i32>, #[case] expected: &str) {
    assert_eq!(exit_codes::describe(code), expected);
}

#[rstest]
#[case(InstallerError::ConnectTimeout { host: String::from("h"), port: 22 }, true)]
#[case(InstallerError::Transfer { host: String::from("h"), message: String::new() }, true)]
#[case(
    InstallerError::NonZeroExit {
        host: String::from("h"),
        script: String::from("s"),
        status: String::from("255"),
        description: String::new(),
    },
    true
)]
#[case(
    InstallerError::NonZeroExit {
        host: String::from("h"),
        script: String::from("s"),
        status: String::from("114"),
        description: String::new(),
    },
    false
)]
#[case(InstallerError::MissingAddress { machine_id: String::from("m") }, false)]
fn retryable_errors_are_classified(#[case] err: InstallerError, #[case] retryable: bool) {
    assert_eq!(err.is_retryable(), retryable);
}

#[rstest]
fn options_follow_the_configuration() {
    let config = crate::config::StratusConfig {
        cluster_descriptor: String::from("cluster.toml"),
        bootstrap_timeout_minutes: 30,
        teardown_timeout_minutes: 15,
        ssh_bin: String::from("/usr/local/bin/ssh"),
        sftp_bin: String::from("sftp"),
        sshpass_bin: String::from("sshpass"),
        ssh_known_hosts_file: String::from("/dev/null"),
        ssh_strict_host_key_checking: true,
        rest_port: 8100,
        rest_api_version: String::from("2.7.0"),
        rollback_on_failure: true,
        verbose: false,
    };

    let options = InstallerOptions::from(&config);

    assert_eq!(options.ssh_bin, "/usr/local/bin/ssh");
    assert!(options.strict_host_key_checking);
    assert_eq!(options.probe_timeout, Duration::from_secs(10));
}
