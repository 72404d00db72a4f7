//! Test support utilities shared across unit and integration tests.
//!
//! Every double keeps its state behind an `Arc`, so a clone handed to the
//! code under test and the clone kept by the test observe the same calls.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::time::{Instant, sleep};

use crate::control_plane::{
    ApplicationDescription, ControlPlane, ControlPlaneConnector, ControlPlaneError,
    ControlPlaneFuture, DeploymentEvent, DeploymentState, ServiceDescription,
};
use crate::driver::compute::{
    ComputeError, ComputeFuture, ComputeService, NodeRequest, NodeState, NodeSummary,
};
use crate::installer::{
    CommandOutput, CommandRunner, CommandSpec, InstallFuture, Installer, InstallerError,
    RunnerFuture,
};
use crate::machine::InstallationDetails;
use crate::reachability::{ProbeFuture, ReachabilityProbe};

#[derive(Debug, Default)]
struct RunnerState {
    responses: VecDeque<Result<CommandOutput, InstallerError>>,
    invocations: Vec<CommandSpec>,
    batches: Vec<String>,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// When an invocation passes `-b <file>`, the file is read at call time so
/// tests can inspect sftp batch scripts.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandSpec> {
        self.state.lock().invocations.clone()
    }

    /// Returns the contents of every batch file passed with `-b`.
    #[must_use]
    pub fn batches(&self) -> Vec<String> {
        self.state.lock().batches.clone()
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(CommandOutput {
            code: Some(0),
            stdout: stdout.into(),
            ..CommandOutput::default()
        });
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_stdout("");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(CommandOutput {
            code: Some(code),
            stderr: String::from("simulated failure"),
            ..CommandOutput::default()
        });
    }

    /// Pushes the output of a process killed at its deadline.
    pub fn push_timeout(&self) {
        self.push_output(CommandOutput::timed_out());
    }

    /// Pushes an explicit command output.
    pub fn push_output(&self, output: CommandOutput) {
        self.state.lock().responses.push_back(Ok(output));
    }

    /// Pushes an error returned instead of an output.
    pub fn push_error(&self, err: InstallerError) {
        self.state.lock().responses.push_back(Err(err));
    }
}

fn batch_contents(spec: &CommandSpec) -> Option<String> {
    let position = spec.args.iter().position(|arg| arg == "-b")?;
    let path = spec.args.get(position + 1)?;
    std::fs::read_to_string(path).ok()
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a> {
        Box::pin(async move {
            let batch = batch_contents(spec);
            let mut state = self.state.lock();
            state.invocations.push(spec.clone());
            if let Some(contents) = batch {
                state.batches.push(contents);
            }
            state
                .responses
                .pop_front()
                .unwrap_or_else(|| {
                    Err(InstallerError::Spawn {
                        program: spec.program.clone(),
                        message: String::from("no scripted response available"),
                    })
                })
        })
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    unreachable: BTreeSet<String>,
    all_unreachable: bool,
    closed_ports: BTreeSet<u16>,
    open: BTreeSet<(String, u16)>,
    delay: Duration,
    calls: Vec<String>,
}

/// Reachability probe with a fixed answer per host and port.
///
/// Every port answers unless it was closed with [`FakeProbe::close_port`];
/// [`FakeProbe::open_port`] reopens a closed port on one host. Blocked hosts
/// never answer.
#[derive(Clone, Debug, Default)]
pub struct FakeProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl FakeProbe {
    /// Probe that reports every host reachable.
    #[must_use]
    pub fn reachable() -> Self {
        Self::default()
    }

    /// Probe that reports every host unreachable.
    #[must_use]
    pub fn unreachable() -> Self {
        let probe = Self::default();
        probe.state.lock().all_unreachable = true;
        probe
    }

    /// Marks `host` unreachable.
    pub fn block(&self, host: &str) {
        self.state.lock().unreachable.insert(host.to_owned());
    }

    /// Closes `port` on every host.
    pub fn close_port(&self, port: u16) {
        self.state.lock().closed_ports.insert(port);
    }

    /// Opens `port` on `host` even when the port is closed elsewhere.
    pub fn open_port(&self, host: &str, port: u16) {
        self.state.lock().open.insert((host.to_owned(), port));
    }

    /// Makes every probe take up to `delay`, bounded by its limit.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    /// Hosts probed so far, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

impl ReachabilityProbe for FakeProbe {
    fn probe<'a>(&'a self, host: &'a str, port: u16, limit: Duration) -> ProbeFuture<'a> {
        Box::pin(async move {
            let (reachable, delay) = {
                let mut state = self.state.lock();
                state.calls.push(host.to_owned());
                let listening = !state.closed_ports.contains(&port)
                    || state.open.contains(&(host.to_owned(), port));
                (
                    listening && !state.all_unreachable && !state.unreachable.contains(host),
                    state.delay,
                )
            };
            if !delay.is_zero() {
                sleep(delay.min(limit)).await;
            }
            reachable
        })
    }
}

#[derive(Debug)]
struct FakeNode {
    summary: NodeSummary,
    pending_polls: u32,
    forced: Option<NodeState>,
}

#[derive(Debug, Default)]
struct ComputeState {
    nodes: BTreeMap<String, FakeNode>,
    sequence: u32,
    pending_polls: u32,
    create_failures: VecDeque<ComputeError>,
    failing_names: BTreeSet<String>,
    stuck_names: BTreeSet<String>,
    requests: Vec<NodeRequest>,
    destroyed: Vec<String>,
    closed: u32,
}

/// In-memory cloud used to exercise the generic driver.
///
/// Created nodes report `Pending` for a configurable number of polls and
/// then `Running`. Node `n` gets public address `198.51.100.n` and private
/// address `10.0.0.n`.
#[derive(Clone, Debug, Default)]
pub struct FakeCompute {
    state: Arc<Mutex<ComputeState>>,
}

impl FakeCompute {
    /// Creates an empty cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `Pending` polls every new node goes through.
    pub fn set_pending_polls(&self, polls: u32) {
        self.state.lock().pending_polls = polls;
    }

    /// Queues an error for the next create call.
    pub fn push_create_failure(&self, err: ComputeError) {
        self.state.lock().create_failures.push_back(err);
    }

    /// Makes every creation of `name` fail.
    pub fn fail_name(&self, name: &str) {
        self.state.lock().failing_names.insert(name.to_owned());
    }

    /// Keeps nodes named `name` pending forever.
    pub fn stick_name(&self, name: &str) {
        self.state.lock().stuck_names.insert(name.to_owned());
    }

    /// Adds an existing node.
    pub fn insert_node(&self, summary: NodeSummary) {
        self.state.lock().nodes.insert(
            summary.id.clone(),
            FakeNode {
                summary,
                pending_polls: 0,
                forced: None,
            },
        );
    }

    /// Creation requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<NodeRequest> {
        self.state.lock().requests.clone()
    }

    /// Ids destroyed so far.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }

    /// Names of the nodes that currently exist.
    #[must_use]
    pub fn live_names(&self) -> Vec<String> {
        self.state
            .lock()
            .nodes
            .values()
            .map(|node| node.summary.name.clone())
            .collect()
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn close_calls(&self) -> u32 {
        self.state.lock().closed
    }
}

/// Builds a running node summary for seeding [`FakeCompute`].
#[must_use]
pub fn running_node(id: &str, name: &str, public_ip: &str) -> NodeSummary {
    NodeSummary {
        id: id.to_owned(),
        name: name.to_owned(),
        state: NodeState::Running,
        public_ip: Some(public_ip.to_owned()),
        private_ip: None,
        location: None,
    }
}

impl ComputeService for FakeCompute {
    fn create_node<'a>(&'a self, request: &'a NodeRequest) -> ComputeFuture<'a, NodeSummary> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            if let Some(err) = state.create_failures.pop_front() {
                return Err(err);
            }
            if state.failing_names.contains(&request.name) {
                return Err(ComputeError::Provider {
                    message: format!("quota exceeded creating {}", request.name),
                });
            }

            state.sequence += 1;
            let sequence = state.sequence;
            let summary = NodeSummary {
                id: format!("node-{sequence}"),
                name: request.name.clone(),
                state: NodeState::Pending,
                public_ip: Some(format!("198.51.100.{sequence}")),
                private_ip: Some(format!("10.0.0.{sequence}")),
                location: request.location.clone(),
            };
            let forced = state
                .stuck_names
                .contains(&request.name)
                .then_some(NodeState::Pending);
            let pending_polls = state.pending_polls;
            state.nodes.insert(
                summary.id.clone(),
                FakeNode {
                    summary: summary.clone(),
                    pending_polls,
                    forced,
                },
            );
            Ok(summary)
        })
    }

    fn get_node<'a>(&'a self, id: &'a str) -> ComputeFuture<'a, Option<NodeSummary>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            let Some(node) = state.nodes.get_mut(id) else {
                return Ok(None);
            };
            if let Some(forced) = node.forced {
                node.summary.state = forced;
            } else if node.pending_polls > 0 {
                node.pending_polls -= 1;
                node.summary.state = NodeState::Pending;
            } else {
                node.summary.state = NodeState::Running;
            }
            Ok(Some(node.summary.clone()))
        })
    }

    fn list_nodes(&self) -> ComputeFuture<'_, Vec<NodeSummary>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .nodes
                .values()
                .map(|node| node.summary.clone())
                .collect())
        })
    }

    fn destroy_node<'a>(&'a self, id: &'a str) -> ComputeFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.nodes.remove(id);
            state.destroyed.push(id.to_owned());
            Ok(())
        })
    }

    fn close(&self) -> ComputeFuture<'_, ()> {
        Box::pin(async move {
            self.state.lock().closed += 1;
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct PlaneState {
    pings: VecDeque<Result<(), ControlPlaneError>>,
    services: BTreeMap<(String, String), VecDeque<Result<ServiceDescription, ControlPlaneError>>>,
    deployments: BTreeMap<String, VecDeque<Vec<ServiceDescription>>>,
    applications: VecDeque<Result<Vec<ApplicationDescription>, ControlPlaneError>>,
    events: BTreeMap<String, Vec<DeploymentEvent>>,
    event_requests: Vec<(String, i64)>,
    undeploy_failures: BTreeSet<String>,
    machine_hosts: Option<Result<BTreeSet<String>, ControlPlaneError>>,
    calls: Vec<String>,
}

/// Pops the front of a script, repeating the last entry once it is alone.
fn next_scripted<T: Clone>(script: &mut VecDeque<T>) -> Option<T> {
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

/// Control plane whose answers are scripted per call.
///
/// Each scripted sequence is consumed in order and its last entry repeats.
/// Unscripted services are not found, unscripted deployments have no
/// services, and pings succeed.
#[derive(Clone, Debug, Default)]
pub struct FakeControlPlane {
    state: Arc<Mutex<PlaneState>>,
}

impl FakeControlPlane {
    /// Creates a control plane with nothing deployed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts successive ping results.
    pub fn script_pings(&self, results: Vec<Result<(), ControlPlaneError>>) {
        self.state.lock().pings = results.into();
    }

    /// Scripts successive descriptions of one service.
    pub fn script_service(
        &self,
        application: &str,
        service: &str,
        results: Vec<Result<ServiceDescription, ControlPlaneError>>,
    ) {
        self.state
            .lock()
            .services
            .insert((application.to_owned(), service.to_owned()), results.into());
    }

    /// Scripts successive service lists of one deployment.
    pub fn script_deployment(&self, deployment_id: &str, snapshots: Vec<Vec<ServiceDescription>>) {
        self.state
            .lock()
            .deployments
            .insert(deployment_id.to_owned(), snapshots.into());
    }

    /// Scripts successive application lists.
    pub fn script_applications(&self, snapshots: Vec<Vec<ApplicationDescription>>) {
        self.script_application_results(snapshots.into_iter().map(Ok).collect());
    }

    /// Scripts successive application list results, failures included.
    pub fn script_application_results(
        &self,
        results: Vec<Result<Vec<ApplicationDescription>, ControlPlaneError>>,
    ) {
        self.state.lock().applications = results.into();
    }

    /// Records events for a deployment.
    pub fn push_events(&self, deployment_id: &str, events: Vec<DeploymentEvent>) {
        self.state
            .lock()
            .events
            .entry(deployment_id.to_owned())
            .or_default()
            .extend(events);
    }

    /// Makes undeploying `application` fail.
    pub fn fail_undeploy(&self, application: &str) {
        self.state
            .lock()
            .undeploy_failures
            .insert(application.to_owned());
    }

    /// Sets the machine addresses the cluster reports.
    pub fn set_machine_hosts(&self, hosts: &[&str]) {
        self.state.lock().machine_hosts =
            Some(Ok(hosts.iter().map(|host| (*host).to_owned()).collect()));
    }

    /// Makes the machine address listing fail with `err`.
    pub fn fail_machine_hosts(&self, err: ControlPlaneError) {
        self.state.lock().machine_hosts = Some(Err(err));
    }

    /// Mutating calls received so far, rendered as `verb target`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// `(deployment_id, from)` pairs of every event request.
    #[must_use]
    pub fn event_requests(&self) -> Vec<(String, i64)> {
        self.state.lock().event_requests.clone()
    }
}

/// Builds a service description for scripting [`FakeControlPlane`].
#[must_use]
pub fn service_description(
    application: &str,
    service: &str,
    instances: u32,
    planned: u32,
    state: DeploymentState,
) -> ServiceDescription {
    ServiceDescription {
        application_name: application.to_owned(),
        service_name: service.to_owned(),
        instance_count: instances,
        planned_instances: planned,
        deployment_id: format!("{application}-deployment"),
        service_state: state,
    }
}

/// Builds an application description with no services.
#[must_use]
pub fn application(name: &str) -> ApplicationDescription {
    ApplicationDescription {
        application_name: name.to_owned(),
        services_description: Vec::new(),
    }
}

impl ControlPlane for FakeControlPlane {
    fn ping(&self) -> ControlPlaneFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.calls.push(String::from("ping"));
            next_scripted(&mut state.pings).unwrap_or(Ok(()))
        })
    }

    fn service_description<'a>(
        &'a self,
        application: &'a str,
        service: &'a str,
    ) -> ControlPlaneFuture<'a, ServiceDescription> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state
                .services
                .get_mut(&(application.to_owned(), service.to_owned()))
                .and_then(next_scripted)
                .unwrap_or_else(|| {
                    Err(ControlPlaneError::NotFound {
                        path: format!("/deployments/{application}/service/{service}/description"),
                    })
                })
        })
    }

    fn service_descriptions<'a>(
        &'a self,
        deployment_id: &'a str,
    ) -> ControlPlaneFuture<'a, Vec<ServiceDescription>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            Ok(state
                .deployments
                .get_mut(deployment_id)
                .and_then(next_scripted)
                .unwrap_or_default())
        })
    }

    fn applications(&self) -> ControlPlaneFuture<'_, Vec<ApplicationDescription>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            next_scripted(&mut state.applications).unwrap_or_else(|| Ok(Vec::new()))
        })
    }

    fn undeploy_application<'a>(&'a self, application: &'a str) -> ControlPlaneFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.calls.push(format!("undeploy {application}"));
            if state.undeploy_failures.contains(application) {
                return Err(ControlPlaneError::Http {
                    path: format!("/deployments/{application}"),
                    status: 500,
                    message: format!("cannot undeploy {application}"),
                });
            }
            Ok(format!("{application}-deployment"))
        })
    }

    fn undeploy_service<'a>(
        &'a self,
        application: &'a str,
        service: &'a str,
    ) -> ControlPlaneFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .lock()
                .calls
                .push(format!("undeploy {application}/{service}"));
            Ok(())
        })
    }

    fn deployment_events<'a>(
        &'a self,
        deployment_id: &'a str,
        from: i64,
    ) -> ControlPlaneFuture<'a, Vec<DeploymentEvent>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.event_requests.push((deployment_id.to_owned(), from));
            Ok(state
                .events
                .get(deployment_id)
                .map(|events| {
                    events
                        .iter()
                        .filter(|event| event.index >= from)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn set_instances<'a>(
        &'a self,
        application: &'a str,
        service: &'a str,
        count: u32,
    ) -> ControlPlaneFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .lock()
                .calls
                .push(format!("scale {application}/{service} {count}"));
            Ok(())
        })
    }

    fn machine_hosts(&self) -> ControlPlaneFuture<'_, BTreeSet<String>> {
        Box::pin(async move {
            self.state
                .lock()
                .machine_hosts
                .clone()
                .unwrap_or_else(|| Ok(BTreeSet::new()))
        })
    }
}

/// Connector that hands out one shared [`FakeControlPlane`].
#[derive(Clone, Debug, Default)]
pub struct FakeConnector {
    plane: FakeControlPlane,
    urls: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    /// Creates a connector serving `plane` for every URL.
    #[must_use]
    pub fn new(plane: FakeControlPlane) -> Self {
        Self {
            plane,
            urls: Arc::default(),
        }
    }

    /// URLs connected to so far.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

impl ControlPlaneConnector for FakeConnector {
    fn connect(&self, url: &str) -> Result<Arc<dyn ControlPlane>, ControlPlaneError> {
        self.urls.lock().push(url.to_owned());
        Ok(Arc::new(self.plane.clone()))
    }
}

#[derive(Debug, Default)]
struct InstallerState {
    failures: BTreeMap<String, InstallerError>,
    installs: Vec<(InstallationDetails, Instant)>,
    delay: Duration,
}

/// Installer that records each request and fails for chosen hosts.
#[derive(Clone, Debug, Default)]
pub struct FakeInstaller {
    state: Arc<Mutex<InstallerState>>,
}

impl FakeInstaller {
    /// Creates an installer that succeeds for every host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes installs on `host` fail with `err`.
    pub fn fail_host(&self, host: &str, err: InstallerError) {
        self.state.lock().failures.insert(host.to_owned(), err);
    }

    /// Makes every install take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    /// Installation requests received so far.
    #[must_use]
    pub fn installs(&self) -> Vec<InstallationDetails> {
        self.state
            .lock()
            .installs
            .iter()
            .map(|(details, _)| details.clone())
            .collect()
    }

    /// Deadlines passed with each request.
    #[must_use]
    pub fn deadlines(&self) -> Vec<Instant> {
        self.state
            .lock()
            .installs
            .iter()
            .map(|(_, deadline)| *deadline)
            .collect()
    }
}

impl Installer for FakeInstaller {
    fn install<'a>(&'a self, details: &'a InstallationDetails, deadline: Instant) -> InstallFuture<'a> {
        Box::pin(async move {
            let (delay, failure) = {
                let mut state = self.state.lock();
                state.installs.push((details.clone(), deadline));
                let failure = state.failures.get(details.host_label()).cloned();
                (state.delay, failure)
            };
            if !delay.is_zero() {
                sleep(delay).await;
            }
            failure.map_or(Ok(()), Err)
        })
    }
}

/// Loopback HTTP server that replays canned responses in order and records
/// every request it receives.
#[derive(Clone, Debug)]
pub struct StubGateway {
    url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl StubGateway {
    /// Binds an ephemeral port and serves one connection per response.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised while binding the listener.
    pub async fn start(responses: Vec<(u16, &'static str)>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let Some(text) = read_request(&mut stream).await else {
                    return;
                };
                recorded.lock().push(text);

                let reply = format!(
                    "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                if stream.write_all(reply.as_bytes()).await.is_err()
                    || stream.shutdown().await.is_err()
                {
                    return;
                }
            }
        });

        Ok(Self {
            url: format!("http://{addr}"),
            requests,
        })
    }

    /// Base URL of the server.
    #[must_use]
    pub const fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Raw requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// Request line of the `index`th request, or an empty string.
    #[must_use]
    pub fn request_line(&self, index: usize) -> String {
        self.requests
            .lock()
            .get(index)
            .and_then(|text| text.lines().next().map(str::to_owned))
            .unwrap_or_default()
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buffer = vec![0_u8; 16 * 1024];
    let mut read = 0;
    loop {
        let count = stream.read(buffer.get_mut(read..)?).await.ok()?;
        read += count;
        let text = String::from_utf8_lossy(buffer.get(..read)?).into_owned();
        if count == 0 || request_complete(&text) {
            return Some(text);
        }
    }
}

fn request_complete(text: &str) -> bool {
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        return false;
    };
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    body.len() >= length
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        Self::apply(pairs, &[]).await
    }

    /// Sets `pairs` and removes `removed` while holding a global mutex.
    pub async fn apply(pairs: &[(&str, &str)], removed: &[&str]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs
                    .iter()
                    .map(|(key, _)| *key)
                    .chain(removed.iter().copied())
                    .all(|key| seen.insert(key))
            },
            "duplicate environment variable keys passed to EnvGuard"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len() + removed.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }
        for key in removed {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
