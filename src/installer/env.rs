//! Environment contract handed to the bootstrap script.

use std::borrow::Cow;

use shell_escape::unix::escape;
use tracing::warn;

use crate::machine::InstallationDetails;

/// Peer discovery addresses.
pub const ENV_LOCATORS: &str = "STRATUS_LOCATORS";
/// `seed` or `agent`.
pub const ENV_AGENT_MODE: &str = "STRATUS_AGENT_MODE";
/// `true` when the web UI and REST gateway stay off.
pub const ENV_NO_WEB_SERVICES: &str = "STRATUS_NO_WEB_SERVICES";
/// Address the agent advertises.
pub const ENV_MACHINE_IP_ADDRESS: &str = "STRATUS_MACHINE_IP_ADDRESS";
/// Private address of the machine.
pub const ENV_PRIVATE_IP_ADDRESS: &str = "STRATUS_PRIVATE_IP_ADDRESS";
/// Public address of the machine.
pub const ENV_PUBLIC_IP_ADDRESS: &str = "STRATUS_PUBLIC_IP_ADDRESS";
/// Comma separated zone tags.
pub const ENV_MACHINE_ZONES: &str = "STRATUS_MACHINE_ZONES";
/// Software download URL.
pub const ENV_INSTALL_SOURCE_URL: &str = "STRATUS_INSTALL_SOURCE_URL";
/// Overrides download URL.
pub const ENV_INSTALL_OVERRIDES_URL: &str = "STRATUS_INSTALL_OVERRIDES_URL";
/// Remote working directory.
pub const ENV_WORKING_HOME_DIRECTORY: &str = "STRATUS_WORKING_HOME_DIRECTORY";
/// Remote path of the staged cluster descriptor.
pub const ENV_CLUSTER_DESCRIPTOR: &str = "STRATUS_CLUSTER_DESCRIPTOR";
/// Compute template name.
pub const ENV_TEMPLATE_NAME: &str = "STRATUS_TEMPLATE_NAME";
/// Backend machine identifier.
pub const ENV_MACHINE_ID: &str = "STRATUS_MACHINE_ID";
/// Per-install reservation identifier.
pub const ENV_RESERVATION_ID: &str = "STRATUS_RESERVATION_ID";

/// Builds the ordered list of variables exported before the script runs.
#[must_use]
pub fn contract(details: &InstallationDetails) -> Vec<(String, String)> {
    let mode = if details.management { "seed" } else { "agent" };
    let locator = if details.locator.trim().is_empty() {
        details.private_ip.clone().unwrap_or_default()
    } else {
        details.locator.clone()
    };

    let mut vars = vec![
        (ENV_LOCATORS, locator),
        (ENV_AGENT_MODE, mode.to_owned()),
        (ENV_NO_WEB_SERVICES, details.no_web_services.to_string()),
        (
            ENV_MACHINE_IP_ADDRESS,
            details.machine_ip().unwrap_or_default().to_owned(),
        ),
        (
            ENV_PRIVATE_IP_ADDRESS,
            details.private_ip.clone().unwrap_or_default(),
        ),
        (
            ENV_PUBLIC_IP_ADDRESS,
            details.public_ip.clone().unwrap_or_default(),
        ),
        (ENV_MACHINE_ZONES, details.zones.join(",")),
        (ENV_INSTALL_SOURCE_URL, details.install_source_url.clone()),
        (
            ENV_INSTALL_OVERRIDES_URL,
            details.install_overrides_url.clone().unwrap_or_default(),
        ),
        (
            ENV_WORKING_HOME_DIRECTORY,
            details.remote_directory.clone(),
        ),
    ];
    if let Some(remote_descriptor) = remote_descriptor_path(details) {
        vars.push((ENV_CLUSTER_DESCRIPTOR, remote_descriptor));
    }
    vars.extend([
        (ENV_TEMPLATE_NAME, details.template_name.clone()),
        (ENV_MACHINE_ID, details.machine_id.clone()),
        (ENV_RESERVATION_ID, details.reservation_id.clone()),
    ]);

    let mut rendered: Vec<(String, String)> = vars
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect();
    for (key, value) in &details.extra_env {
        if is_variable_name(key) {
            rendered.push((key.clone(), value.clone()));
        } else {
            warn!(key = %key, "skipping environment entry with an invalid variable name");
        }
    }
    rendered
}

/// Returns `true` when `name` matches `[A-Za-z_][A-Za-z0-9_]*`.
#[must_use]
pub fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|rest| rest.is_ascii_alphanumeric() || rest == '_')
}

/// Remote path the cluster descriptor is copied to, when one is supplied.
#[must_use]
pub fn remote_descriptor_path(details: &InstallationDetails) -> Option<String> {
    details
        .cluster_descriptor
        .as_ref()
        .and_then(|path| path.file_name())
        .map(|name| remote_join(&details.remote_directory, name))
}

/// Renders the remote shell command that exports the contract and runs the
/// bootstrap script from the remote directory.
#[must_use]
pub fn script_command(details: &InstallationDetails) -> String {
    let directory = escape(Cow::from(details.remote_directory.as_str()));
    let script = escape(Cow::from(details.bootstrap_script.as_str()));
    let runnable = escape(Cow::from(format!("./{}", details.bootstrap_script)));

    let mut command = format!("cd {directory} && ");
    for (key, value) in contract(details) {
        let quoted = escape(Cow::from(value.as_str()));
        command.push_str("export ");
        command.push_str(&key);
        command.push('=');
        command.push_str(&quoted);
        command.push_str("; ");
    }
    command.push_str("chmod +x ");
    command.push_str(&script);
    command.push_str(" && ");
    command.push_str(&runnable);
    command
}

/// Joins a relative path onto a remote POSIX directory.
pub(crate) fn remote_join(directory: &str, relative: &str) -> String {
    let base = directory.trim_end_matches('/');
    if base.is_empty() {
        format!("/{relative}")
    } else {
        format!("{base}/{relative}")
    }
}
