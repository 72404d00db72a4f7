//! Descriptions of the exit codes raised by the bootstrap script.

/// Exit code the SSH client reports when the connection itself fails.
pub const SSH_CONNECTION_FAILURE: i32 = 255;

const UNEXPECTED_TERMINATION: &str = "script terminated unexpectedly";

const SCRIPT_ERRORS: &[(i32, &str)] = &[
    (100, "environment file not found, bootstrapping cannot proceed"),
    (101, "failed to download the Java runtime"),
    (102, "failed to remove the previous Java installation directory"),
    (103, "failed to move the JDK installation"),
    (104, "failed to download the cluster software"),
    (105, "failed to download the cluster software overrides"),
    (106, "failed to remove the previous installation directory"),
    (107, "failed to create the installation directory"),
    (108, "failed to extract the cluster software"),
    (109, "failed to change permissions in the installation"),
    (110, "failed to move the installation into place"),
    (111, "failed to extract the cluster software overrides"),
    (112, "failed to change into the bin directory"),
    (113, "failed to update the agent environment file"),
    (114, "failed to remove nohup.out, another process may be using it"),
    (115, "the login user is not a sudoer or sudo requires a password"),
    (116, "sudoers file not found at /etc/sudoers"),
    (117, "failed to disable requiretty in the sudoers file"),
    (118, "failed to change into the cli directory"),
    (119, "host validation aborted, the host name could not be resolved"),
    (120, "host validation aborted, permission denied"),
    (121, "network interface validation aborted, the host could not be resolved"),
    (122, "network interface validation aborted, socket I/O error"),
    (123, "network interface validation aborted, permission denied"),
    (124, "port validation aborted, the host could not be resolved"),
    (125, "port validation aborted, socket I/O error"),
    (126, "port validation aborted, permission denied"),
    (127, "lookup service validation aborted, the host could not be resolved"),
    (128, "lookup service validation aborted, socket I/O error"),
    (129, "lookup service validation aborted, permission denied"),
    (130, "agent validation failed"),
    (131, "no running agent found after bootstrap completed"),
    (132, "some management components are unavailable after bootstrap, check the logs"),
    (133, "a required management service is missing after bootstrap, check the logs"),
    (134, "failed to delete the cluster software archive from the home directory"),
    (135, "failed to delete the overrides archive from the home directory"),
    (136, "failed to delete the Java installer from the home directory"),
    (SSH_CONNECTION_FAILURE, "the SSH session failed or the script reported a custom error"),
];

/// Returns the description of `code`, or a generic message for unknown
/// codes and signal terminations.
#[must_use]
pub fn describe(code: Option<i32>) -> &'static str {
    code.and_then(|value| {
        SCRIPT_ERRORS
            .iter()
            .find(|(known, _)| *known == value)
            .map(|(_, description)| *description)
    })
    .unwrap_or(UNEXPECTED_TERMINATION)
}
