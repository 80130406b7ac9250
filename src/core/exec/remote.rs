use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Config, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ActiveSession, ExecContext, ExecError, PersistentHandle, RemoteShell, RemoteTarget,
    StepFailure, Transcript,
};

/// Client handler for the lab network: host keys are accepted without
/// verification.
#[derive(Clone, Debug, Default)]
struct TrustingHandler;

impl client::Handler for TrustingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// What one remote command produced.
#[derive(Debug, Default)]
struct CommandCapture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
    exit_signal: Option<String>,
    /// Set when the exec request itself failed or the driving task died.
    broken: Option<String>,
}

impl CommandCapture {
    /// Folds one channel message in; returns true once the channel is closed.
    fn absorb(&mut self, msg: &ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => {
                self.stdout.extend_from_slice(data);
                false
            }
            ChannelMsg::ExtendedData { data, ext: 1 } => {
                self.stderr.extend_from_slice(data);
                false
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.exit_status = Some(*exit_status);
                false
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                self.exit_signal = Some(format!("{signal_name:?}"));
                false
            }
            ChannelMsg::Close => true,
            _ => false,
        }
    }

    fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    fn status(&self) -> Result<(), ExecError> {
        if let Some(reason) = &self.broken {
            return Err(ExecError::CommandFailed(reason.clone()));
        }
        if let Some(signal) = &self.exit_signal {
            return Err(ExecError::CommandFailed(format!(
                "Process exited with signal {signal}"
            )));
        }
        match self.exit_status {
            Some(0) => Ok(()),
            Some(code) => Err(ExecError::CommandFailed(format!(
                "Process exited with status {code}"
            ))),
            None => Err(ExecError::CommandFailed(
                "remote command exited without exit status".to_string(),
            )),
        }
    }
}

/// Runs the command on `channel` until it finishes or `session` is
/// interrupted. On interrupt the remote process gets SIGINT and the channel is
/// closed in the background.
async fn drive_command(
    mut channel: Channel<Msg>,
    command: String,
    session: ActiveSession,
) -> CommandCapture {
    let mut capture = CommandCapture::default();

    if let Err(e) = channel.exec(true, command.as_str()).await {
        capture.broken = Some(format!("exec request failed: {e}"));
        let _ = channel.close().await;
        return capture;
    }

    let mut interrupted = false;
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(msg) => {
                    if capture.absorb(&msg) {
                        break;
                    }
                }
                None => break,
            },
            _ = session.interrupted() => {
                interrupted = true;
                break;
            }
        }
    }

    if interrupted {
        debug!("Interrupting remote command '{}'", command);
        if let Err(e) = channel.signal(Sig::INT).await {
            debug!("Failed to deliver SIGINT for '{}': {}", command, e);
        }
        tokio::spawn(async move {
            let _ = channel.close().await;
        });
    } else {
        let _ = channel.close().await;
    }

    capture
}

/// Drains the background command until the handle asks it to stop.
async fn follow(handle: Handle<TrustingHandler>, mut channel: Channel<Msg>, label: String, stop: CancellationToken) {
    let mut received = 0usize;
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => received += data.len(),
                Some(ChannelMsg::ExtendedData { data, .. }) => received += data.len(),
                Some(ChannelMsg::Close) | None => {
                    warn!("Background command on {} ended on its own", label);
                    break;
                }
                Some(_) => {}
            },
            _ = stop.cancelled() => break,
        }
    }

    debug!("Stopping background command on {} after {} bytes", label, received);
    let _ = channel.signal(Sig::INT).await;
    let _ = channel.eof().await;
    let _ = channel.close().await;
    disconnect(&handle).await;
    info!("Background session on {} closed", label);
}

async fn disconnect(handle: &Handle<TrustingHandler>) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        debug!("SSH disconnect failed: {}", e);
    }
}

/// Command sessions on one established connection.
#[async_trait]
trait CommandLauncher: Send + Sync {
    /// Opens a fresh session and starts `command` on its own task. The task
    /// must finish promptly once `session` is interrupted.
    async fn launch(
        &self,
        command: &str,
        session: ActiveSession,
    ) -> Result<JoinHandle<CommandCapture>, String>;

    async fn disconnect(&self);
}

struct SshConnection(Handle<TrustingHandler>);

#[async_trait]
impl CommandLauncher for SshConnection {
    async fn launch(
        &self,
        command: &str,
        session: ActiveSession,
    ) -> Result<JoinHandle<CommandCapture>, String> {
        let channel = self
            .0
            .channel_open_session()
            .await
            .map_err(|e| e.to_string())?;
        Ok(tokio::spawn(drive_command(
            channel,
            command.to_string(),
            session,
        )))
    }

    async fn disconnect(&self) {
        disconnect(&self.0).await;
    }
}

/// Runs the target's commands over `conn` and disconnects, whatever the
/// outcome.
async fn run_over<L: CommandLauncher>(
    conn: &L,
    target: &RemoteTarget,
    ctx: &ExecContext,
) -> Result<String, StepFailure> {
    let outcome = run_each(conn, target, ctx).await;
    conn.disconnect().await;
    outcome
}

async fn run_each<L: CommandLauncher>(
    conn: &L,
    target: &RemoteTarget,
    ctx: &ExecContext,
) -> Result<String, StepFailure> {
    let mut transcript = Transcript::default();
    let total = target.commands.len();

    for (i, command) in target.commands.iter().enumerate() {
        if ctx.is_canceled() {
            return Err(transcript.fail(ExecError::Canceled { scope: "remote" }));
        }

        ctx.activity(format!(
            "Running command {}/{} on {} ({}):\n{}",
            i + 1,
            total,
            target.label,
            target.host,
            command
        ));

        let session = ActiveSession::new(&target.label, command);
        let mut task = match conn.launch(command, session.clone()).await {
            Ok(task) => task,
            Err(reason) => {
                let error = ExecError::Session {
                    index: i + 1,
                    reason,
                };
                transcript.push_failure(&error);
                return Err(transcript.fail(error));
            }
        };
        ctx.observer.set_active_session(Some(session.clone()));

        // The command task is always joined, also when the run is cancelled.
        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = ctx.cancel.cancelled() => {
                session.interrupt();
                task.await
            }
        };
        ctx.observer.set_active_session(None);

        let capture = joined.unwrap_or_else(|e| CommandCapture {
            broken: Some(format!("command task failed: {e}")),
            ..Default::default()
        });

        if session.is_interrupted() || ctx.is_canceled() {
            transcript.push_canceled(command, &capture.stdout(), &capture.stderr());
            return Err(transcript.fail(ExecError::Canceled { scope: "remote" }));
        }

        transcript.push_command(command, &capture.stdout(), &capture.stderr());
        if let Err(error) = capture.status() {
            transcript.push_failure(&error);
            return Err(transcript.fail(error));
        }
    }

    Ok(transcript.into_string())
}

/// [`RemoteShell`] backed by password-authenticated SSH connections.
pub struct SshShell {
    config: Arc<Config>,
    connect_timeout: Duration,
}

impl SshShell {
    pub fn new(connect_timeout: Duration) -> Self {
        let config = Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(15)),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            connect_timeout,
        }
    }

    async fn connect(&self, target: &RemoteTarget) -> Result<Handle<TrustingHandler>, ExecError> {
        let addr = target.address();
        let secs = self.connect_timeout.as_secs();

        let connecting = client::connect(
            self.config.clone(),
            (target.host.as_str(), target.port),
            TrustingHandler,
        );
        let mut handle = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(ExecError::Connect {
                    addr,
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(ExecError::ConnectTimeout { addr, secs }),
        };

        let user = target.credentials.user.clone();
        let auth = handle.authenticate_password(user.clone(), target.credentials.password.clone());
        match tokio::time::timeout(self.connect_timeout, auth).await {
            Ok(Ok(AuthResult::Success)) => Ok(handle),
            Ok(Ok(AuthResult::Failure { .. })) => Err(ExecError::Auth { user }),
            Ok(Err(e)) => Err(ExecError::Connect {
                addr,
                reason: e.to_string(),
            }),
            Err(_) => Err(ExecError::ConnectTimeout { addr, secs }),
        }
    }

    /// Connects, giving up early when the run is cancelled.
    async fn connect_or_cancel(
        &self,
        target: &RemoteTarget,
        ctx: &ExecContext,
    ) -> Result<Handle<TrustingHandler>, ExecError> {
        tokio::select! {
            connected = self.connect(target) => connected,
            _ = ctx.cancel.cancelled() => Err(ExecError::Canceled { scope: "remote" }),
        }
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run_commands(
        &self,
        target: &RemoteTarget,
        ctx: &ExecContext,
    ) -> Result<String, StepFailure> {
        ctx.activity(format!(
            "Connecting to {} ({}) via SSH...",
            target.label, target.host
        ));
        let handle = self
            .connect_or_cancel(target, ctx)
            .await
            .map_err(|e| StepFailure::new(String::new(), e))?;

        run_over(&SshConnection(handle), target, ctx).await
    }

    async fn open_persistent(
        &self,
        target: &RemoteTarget,
        ctx: &ExecContext,
    ) -> Result<PersistentHandle, ExecError> {
        let command = target
            .background_cmd
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ExecError::Spawn {
                command: String::new(),
                reason: format!("no background command configured for {}", target.label),
            })?;

        ctx.activity(format!(
            "Connecting to {} ({}) via SSH...",
            target.label, target.host
        ));
        let handle = self.connect_or_cancel(target, ctx).await?;

        let channel = match handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                disconnect(&handle).await;
                return Err(ExecError::Session {
                    index: 1,
                    reason: e.to_string(),
                });
            }
        };
        if let Err(e) = channel.exec(true, command.as_str()).await {
            disconnect(&handle).await;
            return Err(ExecError::Spawn {
                command,
                reason: e.to_string(),
            });
        }

        ctx.activity(format!(
            "Following {} ({}) in the background:\n{}",
            target.label, target.host, command
        ));
        let label = target.label.clone();
        Ok(PersistentHandle::spawn(&target.label, move |stop| {
            follow(handle, channel, label, stop)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exec::Credentials;
    use crate::core::exec::testing::RecordingObserver;
    use russh::CryptoVec;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Scripted {
        Exit {
            stdout: &'static str,
            stderr: &'static str,
            status: u32,
        },
        /// Blocks until interrupted, then reports what it printed so far.
        Hang { partial: &'static str },
        Refuse,
    }

    #[derive(Default)]
    struct FakeConnection {
        script: HashMap<&'static str, Scripted>,
        sessions: Mutex<Vec<ActiveSession>>,
        disconnects: AtomicUsize,
    }

    impl FakeConnection {
        fn on(mut self, command: &'static str, behavior: Scripted) -> Self {
            self.script.insert(command, behavior);
            self
        }

        fn launched(&self) -> Vec<String> {
            self.sessions
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.command().to_string())
                .collect()
        }

        fn session(&self, command: &str) -> Option<ActiveSession> {
            self.sessions
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.command() == command)
                .cloned()
        }
    }

    #[async_trait]
    impl CommandLauncher for FakeConnection {
        async fn launch(
            &self,
            command: &str,
            session: ActiveSession,
        ) -> Result<JoinHandle<CommandCapture>, String> {
            self.sessions.lock().unwrap().push(session.clone());
            let task = match self.script.get(command) {
                Some(Scripted::Refuse) => return Err("administratively prohibited".into()),
                Some(Scripted::Hang { partial }) => {
                    let partial = *partial;
                    tokio::spawn(async move {
                        session.interrupted().await;
                        CommandCapture {
                            stdout: partial.as_bytes().to_vec(),
                            exit_signal: Some("INT".into()),
                            ..Default::default()
                        }
                    })
                }
                Some(Scripted::Exit {
                    stdout,
                    stderr,
                    status,
                }) => {
                    let capture = CommandCapture {
                        stdout: stdout.as_bytes().to_vec(),
                        stderr: stderr.as_bytes().to_vec(),
                        exit_status: Some(*status),
                        ..Default::default()
                    };
                    tokio::spawn(async move { capture })
                }
                None => tokio::spawn(async move {
                    CommandCapture {
                        exit_status: Some(0),
                        ..Default::default()
                    }
                }),
            };
            Ok(task)
        }

        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn lab_target(commands: &[&str]) -> RemoteTarget {
        RemoteTarget {
            label: "scheduler".into(),
            host: "10.0.0.4".into(),
            port: 22,
            credentials: Credentials {
                user: "ops".into(),
                password: "secret".into(),
            },
            commands: commands.iter().map(|c| c.to_string()).collect(),
            background_cmd: None,
        }
    }

    fn context() -> (ExecContext, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let ctx = ExecContext::new(CancellationToken::new(), observer.clone());
        (ctx, observer)
    }

    #[tokio::test]
    async fn commands_run_in_order_over_one_connection() {
        let conn = FakeConnection::default().on(
            "show routes",
            Scripted::Exit {
                stdout: "10.1.0.0/16 via 10.0.0.1\n",
                stderr: "",
                status: 0,
            },
        );
        let (ctx, observer) = context();

        let out = run_over(&conn, &lab_target(&["show routes", "uptime"]), &ctx)
            .await
            .unwrap();

        assert_eq!(
            out,
            "Command: show routes\nOutput:\n10.1.0.0/16 via 10.0.0.1\n\nCommand: uptime\nOutput:\n\n"
        );
        assert_eq!(conn.launched(), vec!["show routes", "uptime"]);
        assert_eq!(conn.disconnects.load(Ordering::SeqCst), 1);
        assert!(
            observer
                .activities()
                .iter()
                .any(|a| a == "Running command 2/2 on scheduler (10.0.0.4):\nuptime")
        );
    }

    #[tokio::test]
    async fn failing_command_stops_the_target_after_its_output() {
        let conn = FakeConnection::default()
            .on(
                "show routes",
                Scripted::Exit {
                    stdout: "routes ok\n",
                    stderr: "",
                    status: 0,
                },
            )
            .on(
                "check peers",
                Scripted::Exit {
                    stdout: "peer 10.0.0.9 down\n",
                    stderr: "timeout\n",
                    status: 2,
                },
            );
        let (ctx, _) = context();

        let failure = run_over(
            &conn,
            &lab_target(&["show routes", "check peers", "never"]),
            &ctx,
        )
        .await
        .unwrap_err();

        assert!(matches!(failure.error, ExecError::CommandFailed(_)));
        assert_eq!(
            failure.output,
            "Command: show routes\nOutput:\nroutes ok\n\n\
             Command: check peers\nOutput:\npeer 10.0.0.9 down\ntimeout\n\n\
             [ERROR] Command failed: Process exited with status 2\n"
        );
        assert_eq!(conn.launched(), vec!["show routes", "check peers"]);
        assert_eq!(conn.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn session_open_failure_aborts_the_target() {
        let conn = FakeConnection::default().on("uptime", Scripted::Refuse);
        let (ctx, _) = context();

        let failure = run_over(&conn, &lab_target(&["date", "uptime", "never"]), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, ExecError::Session { index: 2, .. }));
        assert_eq!(
            failure.output,
            "Command: date\nOutput:\n\n\
             [ERROR] Command failed: failed to create session for command 2: administratively prohibited\n"
        );
        assert_eq!(conn.launched(), vec!["date", "uptime"]);
        assert_eq!(conn.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_interrupts_and_joins_the_in_flight_command() {
        let conn = Arc::new(FakeConnection::default().on(
            "tail -f routes.log",
            Scripted::Hang {
                partial: "route flap 10.2.0.0/16\n",
            },
        ));
        let (ctx, _) = context();

        let cancel = ctx.cancel.clone();
        let watched = conn.clone();
        tokio::spawn(async move {
            while watched.session("tail -f routes.log").is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            cancel.cancel();
        });

        let failure = tokio::time::timeout(
            Duration::from_secs(5),
            run_over(
                &*conn,
                &lab_target(&["date", "tail -f routes.log", "never"]),
                &ctx,
            ),
        )
        .await
        .expect("cancelled command was not joined")
        .unwrap_err();

        assert!(failure.error.is_cancellation());
        assert_eq!(failure.error.to_string(), "remote job stopped by user");
        assert_eq!(
            failure.output,
            "Command: date\nOutput:\n\n\
             [CANCELED] Command: tail -f routes.log\nOutput:\nroute flap 10.2.0.0/16\n\n"
        );
        let session = conn.session("tail -f routes.log").unwrap();
        assert!(session.is_interrupted());
        assert_eq!(conn.launched(), vec!["date", "tail -f routes.log"]);
        assert_eq!(conn.disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn capture_collects_streams_and_exit_status() {
        let mut capture = CommandCapture::default();

        assert!(!capture.absorb(&ChannelMsg::Data {
            data: CryptoVec::from_slice(b"routes ok\n"),
        }));
        assert!(!capture.absorb(&ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"warning\n"),
            ext: 1,
        }));
        assert!(!capture.absorb(&ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"ignored"),
            ext: 2,
        }));
        assert!(!capture.absorb(&ChannelMsg::ExitStatus { exit_status: 0 }));
        assert!(capture.absorb(&ChannelMsg::Close));

        assert_eq!(capture.stdout(), "routes ok\n");
        assert_eq!(capture.stderr(), "warning\n");
        assert!(capture.status().is_ok());
    }

    #[test]
    fn non_zero_exit_is_a_command_failure() {
        let mut capture = CommandCapture::default();
        capture.absorb(&ChannelMsg::ExitStatus { exit_status: 3 });
        let err = capture.status().unwrap_err();
        assert_eq!(err.to_string(), "Process exited with status 3");
    }

    #[test]
    fn missing_exit_status_is_a_command_failure() {
        let capture = CommandCapture::default();
        assert!(matches!(capture.status(), Err(ExecError::CommandFailed(_))));
    }

    #[test]
    fn broken_exec_wins_over_status() {
        let capture = CommandCapture {
            exit_status: Some(0),
            broken: Some("exec request failed: channel closed".into()),
            ..Default::default()
        };
        assert_eq!(
            capture.status().unwrap_err().to_string(),
            "exec request failed: channel closed"
        );
    }

    #[tokio::test]
    async fn unreachable_host_fails_to_connect() {
        let shell = SshShell::new(Duration::from_secs(2));
        let target = RemoteTarget {
            label: "scheduler".into(),
            host: "127.0.0.1".into(),
            port: 1,
            credentials: Credentials {
                user: "ops".into(),
                password: "secret".into(),
            },
            commands: vec!["uptime".into()],
            background_cmd: None,
        };
        let observer = Arc::new(RecordingObserver::default());
        let ctx = ExecContext::new(CancellationToken::new(), observer.clone());

        let failure = shell.run_commands(&target, &ctx).await.unwrap_err();
        assert!(!failure.error.is_cancellation());
        assert!(failure.output.is_empty());
        assert_eq!(
            observer.activities().first().map(String::as_str),
            Some("Connecting to scheduler (127.0.0.1) via SSH...")
        );
    }

    #[tokio::test]
    async fn persistent_requires_a_background_command() {
        let shell = SshShell::new(Duration::from_secs(1));
        let target = RemoteTarget {
            label: "sdvn".into(),
            host: "127.0.0.1".into(),
            port: 1,
            credentials: Credentials {
                user: "ops".into(),
                password: "secret".into(),
            },
            commands: vec![],
            background_cmd: Some("   ".into()),
        };
        let observer = Arc::new(RecordingObserver::default());
        let ctx = ExecContext::new(CancellationToken::new(), observer);

        let err = shell.open_persistent(&target, &ctx).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
