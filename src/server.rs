//! Server supervisor: accepts connections, spawns the requested child
//! process per connection, and relays its stdio over the framed channel.
//!
//! Each accepted connection is handled by its own task. Within a task
//! all I/O funnels through one `select!` multiplex over the socket, the
//! child's stdout/stderr pipes, the child's termination, and the pending
//! stdin buffer, mirroring the client's relay on the other side of the
//! wire.

use std::collections::HashMap;
use std::io;
use std::net::TcpListener as StdTcpListener;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStdin, Command as ChildCommand};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::channel::{FrameReader, FrameWriter};
use crate::config::{Command, Configuration};
use crate::env;
use crate::protocol::FrameType;

const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Effective options for one server run, after merging host-section
/// options with the command line.
#[derive(Clone, Debug)]
pub struct ServerSettings {
    /// The name this server answers for; selects the host catalog.
    pub name: String,
    /// Exit after accepting this many connections; negative = unlimited.
    pub max_connections: i64,
    /// Leave the accept loop after this long; negative = forever.
    pub timeout_ms: i64,
    /// Do not wait for in-flight connections on shutdown.
    pub no_wait: bool,
    /// Treat SIGHUP as a shutdown request (foreground servers only).
    pub handle_hup: bool,
}

/// Runs the accept loop on an already-bound listener until a signal, the
/// connection limit, or the wall-clock timeout ends it.
pub async fn run(
    listener: StdTcpListener,
    configuration: Arc<Configuration>,
    settings: ServerSettings,
) -> Result<()> {
    let commands = configuration
        .host_commands(&settings.name)
        .cloned()
        .map(Arc::new)
        .ok_or_else(|| anyhow!("no commands found in configuration for host {:?}", settings.name))?;

    listener
        .set_nonblocking(true)
        .context("failed to configure listener")?;
    let listener = TcpListener::from_std(listener).context("failed to adopt listener")?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx, settings.handle_hup);

    let deadline = (settings.timeout_ms >= 0)
        .then(|| Instant::now() + Duration::from_millis(settings.timeout_ms as u64));
    let timeout = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));
    tokio::pin!(timeout);

    let mut workers = JoinSet::new();
    let mut accepted: i64 = 0;

    debug!("entering server connection listener loop");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("exit requested, leaving listener loop");
                break;
            }

            () = &mut timeout, if deadline.is_some() => {
                debug!("listener timeout reached, leaving listener loop");
                break;
            }

            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(connection) => connection,
                    Err(error) => {
                        warn!("failed to accept connection: {error}");
                        continue;
                    }
                };

                debug!("accepted connection from new client {peer}");

                if let Err(error) = stream.set_nodelay(true) {
                    warn!("failed to configure client socket: {error}");
                }

                let configuration = configuration.clone();
                let commands = commands.clone();

                workers.spawn(async move {
                    if let Err(error) = handle_connection(stream, configuration, commands).await {
                        error!("connection error: {error:#}");
                    }
                });

                accepted += 1;

                if settings.max_connections >= 0 && accepted >= settings.max_connections {
                    debug!("connection limit reached, leaving listener loop");
                    break;
                }
            }

            Some(result) = workers.join_next(), if !workers.is_empty() => {
                if let Err(error) = result {
                    error!("connection task failed: {error}");
                }
            }
        }
    }

    drop(listener);
    debug!("shutting down the server");

    if settings.no_wait {
        workers.detach_all();
    } else {
        while let Some(result) = workers.join_next().await {
            if let Err(error) = result {
                error!("connection task failed: {error}");
            }
        }
    }

    Ok(())
}

#[cfg(unix)]
fn spawn_signal_handlers(shutdown: watch::Sender<bool>, handle_hup: bool) {
    use tokio::signal::unix::{signal, SignalKind};

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received, requesting exit");
            let _ = interrupt.send(true);
        }
    });

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            let sender = shutdown.clone();
            tokio::spawn(async move {
                if terminate.recv().await.is_some() {
                    debug!("termination signal received, requesting exit");
                    let _ = sender.send(true);
                }
            });
        }
        Err(error) => warn!("failed to install termination handler: {error}"),
    }

    match signal(SignalKind::hangup()) {
        Ok(mut hangup) => {
            tokio::spawn(async move {
                loop {
                    if hangup.recv().await.is_none() {
                        break;
                    }

                    if handle_hup {
                        debug!("hangup received, requesting exit");
                        let _ = shutdown.send(true);
                    }
                    // Background servers drain SIGHUP without acting on it.
                }
            });
        }
        Err(error) => warn!("failed to install hangup handler: {error}"),
    }
}

#[cfg(not(unix))]
fn spawn_signal_handlers(shutdown: watch::Sender<bool>, _handle_hup: bool) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received, requesting exit");
            let _ = shutdown.send(true);
        }
    });
}

struct Prologue {
    working_directory: String,
    environment: HashMap<String, String>,
    arguments: Vec<String>,
    command_name: String,
}

async fn handle_connection(
    stream: TcpStream,
    configuration: Arc<Configuration>,
    commands: Arc<HashMap<String, Command>>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let prologue = read_prologue(&mut reader).await?;
    let command = commands
        .get(&prologue.command_name)
        .ok_or_else(|| anyhow!("failed to find command {:?} in configuration", prologue.command_name))?;

    let process_directory = if configuration.base_directory().as_os_str().is_empty() {
        PathBuf::from(&prologue.working_directory)
    } else {
        configuration.base_directory().join(&prologue.working_directory)
    };

    let environment = compose_child_environment(command, &prologue.environment);

    let mut arguments = command.executable.clone();
    arguments.extend(prologue.arguments);

    let program = resolve_program(&arguments[0], &process_directory);

    debug!(
        "starting {:?} in {:?} with environment {:?}",
        arguments, process_directory, environment
    );

    let mut child = ChildCommand::new(&program)
        .args(&arguments[1..])
        .env_clear()
        .envs(environment.iter().map(|(name, value)| (name, value)))
        .current_dir(&process_directory)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start {}", arguments[0]))?;

    let status = match relay(&mut reader, &mut writer, &mut child).await? {
        Some(status) => status,
        None => return Ok(()), // session terminated; no exit code is sent
    };

    // Only a normal exit carries an exit code; a signalled child just
    // closes the session and the client aborts.
    if let Some(code) = status.code() {
        debug!("sending exit code ({code}) to client");
        writer.write_control(FrameType::ExitCode, code as u32).await?;
    }

    writer.flush().await?;
    Ok(())
}

async fn read_prologue<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Result<Prologue> {
    let mut prologue = Prologue {
        working_directory: String::new(),
        environment: HashMap::new(),
        arguments: Vec::new(),
        command_name: String::new(),
    };

    loop {
        let frame = reader
            .next_frame()
            .await?
            .ok_or_else(|| anyhow!("failed to read data from socket"))?;
        let payload =
            String::from_utf8(frame.payload).context("received malformed prologue payload")?;

        match frame.frame_type {
            FrameType::WorkingDirectory => {
                debug!("received working directory ({payload:?}) from client");
                prologue.working_directory = payload;
            }
            FrameType::EnvironmentVariable => {
                debug!("received environment variable ({payload:?}) from client");

                match payload.split_once('=') {
                    Some((name, value)) => {
                        prologue.environment.insert(name.to_string(), value.to_string());
                    }
                    None => {
                        // A bare name resolves against this server's own
                        // environment.
                        let value = std::env::var(&payload).unwrap_or_default();
                        prologue.environment.insert(payload, value);
                    }
                }
            }
            FrameType::CommandArgument => {
                debug!("received command argument ({payload:?}) from client");
                prologue.arguments.push(payload);
            }
            FrameType::StartCommand => {
                debug!("received start command ({payload:?}) from client");
                prologue.command_name = payload;
                return Ok(prologue);
            }
            other => bail!("read invalid payload type ({}) from socket", other as u8),
        }
    }
}

/// Composes the child's environment by walking the command's declarations
/// in order. Each declaration resolves into a map that later declarations
/// may reference through `${NAME}`; the emitted order follows first
/// declaration, one entry per key.
fn compose_child_environment(
    command: &Command,
    received: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut resolved = env::Overrides::new();

    for decl in &command.environment {
        let name = decl.name().to_string();

        let value = if decl.is_inherited() {
            if decl.value.is_empty() {
                std::env::var(&name).ok()
            } else {
                Some(env::substitute(&decl.value, &resolved))
            }
        } else if let Some(value) = received.get(&name) {
            Some(value.clone())
        } else if decl.value.is_empty() && decl.is_optional() {
            env::lookup(&name, &resolved)
        } else {
            Some(env::substitute(&decl.value, &resolved))
        };

        resolved.insert(name, value);
    }

    let mut environment = Vec::new();

    for decl in &command.environment {
        if let Some(Some(value)) = resolved.remove(decl.name()) {
            environment.push((decl.name().to_string(), value));
        }
    }

    environment
}

/// Bare command names are probed in the process working directory first,
/// then left to normal `PATH` resolution. Names with a separator already
/// resolve against the working directory at exec time.
fn resolve_program(argv0: &str, process_directory: &std::path::Path) -> PathBuf {
    if !argv0.contains('/') && !argv0.contains(std::path::MAIN_SEPARATOR) {
        let candidate = process_directory.join(argv0);

        if candidate.is_file() {
            return candidate;
        }
    }

    PathBuf::from(argv0)
}

/// Relays child stdio and socket frames until all three pipes are done.
/// Returns the exit status, or `None` when the session was terminated by
/// the client (terminate frame, protocol violation, or socket close) and
/// no exit code must be sent.
async fn relay<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    child: &mut Child,
) -> Result<Option<ExitStatus>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stdin = child.stdin.take();
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout is unavailable"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("child stderr is unavailable"))?;

    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut pending_stdin: Vec<u8> = Vec::new();
    let mut close_stdin = false;
    let mut exit_status: Option<ExitStatus> = None;
    let mut stdout_buffer = vec![0u8; PIPE_BUFFER_SIZE];
    let mut stderr_buffer = vec![0u8; PIPE_BUFFER_SIZE];

    while stdin.is_some() || stdout_open || stderr_open {
        let stdin_writable = stdin.is_some() && !pending_stdin.is_empty();

        tokio::select! {
            biased;

            status = child.wait(), if exit_status.is_none() => {
                let status = status.context("failed to get exit code of process")?;
                debug!("process terminated, closing stdin, transferring remaining stdout and stderr data");
                pending_stdin.clear();
                close_stdin = false;
                stdin = None;
                exit_status = Some(status);
            }

            read = stdout.read(&mut stdout_buffer), if stdout_open => {
                let count = read.context("failed to read data from stdout")?;
                debug!("sending stdout data ({count} bytes) to client");
                writer.write_data(FrameType::StdoutData, &stdout_buffer[..count], true).await?;

                if count == 0 {
                    stdout_open = false;
                }
            }

            read = stderr.read(&mut stderr_buffer), if stderr_open => {
                let count = read.context("failed to read data from stderr")?;
                debug!("sending stderr data ({count} bytes) to client");
                writer.write_data(FrameType::StderrData, &stderr_buffer[..count], true).await?;

                if count == 0 {
                    stderr_open = false;
                }
            }

            frame = reader.next_frame() => {
                match frame {
                    Ok(Some(frame)) if frame.frame_type == FrameType::StdinData => {
                        debug!("received stdin data ({} bytes) from client", frame.value);

                        if stdin.is_none() {
                            debug!("ignoring {} received bytes due to closed stdin", frame.value);
                        } else if frame.payload.is_empty() {
                            close_stdin = true;
                        } else {
                            pending_stdin.extend_from_slice(&frame.payload);
                        }
                    }
                    Ok(Some(frame)) if frame.frame_type == FrameType::TerminateCommand => {
                        debug!("received terminate command from client, halting process");
                        terminate_child(child);
                        writer.flush().await?;
                        return Ok(None);
                    }
                    Ok(Some(frame)) => {
                        terminate_child(child);
                        writer.flush().await?;
                        bail!("read invalid payload type ({}) from socket", frame.frame_type as u8);
                    }
                    Ok(None) => {
                        terminate_child(child);
                        writer.flush().await?;
                        bail!("socket was closed unexpectedly");
                    }
                    Err(error) => {
                        terminate_child(child);
                        writer.flush().await?;
                        return Err(error).context("failed to read data from socket");
                    }
                }
            }

            written = write_pending_stdin(&mut stdin, &pending_stdin), if stdin_writable => {
                match written {
                    Ok(count) => {
                        pending_stdin.drain(..count);
                    }
                    Err(error) if error.kind() == io::ErrorKind::BrokenPipe => {
                        debug!("process has closed stdin, lost {} bytes", pending_stdin.len());
                        pending_stdin.clear();
                        close_stdin = false;
                        stdin = None;
                        writer.write_data(FrameType::StdinData, &[], true).await?;
                    }
                    Err(error) => {
                        return Err(error).context("failed to write data to child stdin");
                    }
                }
            }
        }

        if close_stdin && pending_stdin.is_empty() {
            debug!("closing stdin");
            close_stdin = false;
            stdin = None; // dropping the handle closes the pipe
        }
    }

    let status = match exit_status {
        Some(status) => status,
        None => child
            .wait()
            .await
            .context("failed to get exit code of process")?,
    };

    Ok(Some(status))
}

async fn write_pending_stdin(stdin: &mut Option<ChildStdin>, data: &[u8]) -> io::Result<usize> {
    match stdin {
        Some(pipe) => pipe.write(data).await,
        None => Ok(0),
    }
}

/// Asks the child to terminate. The final kill (and reaping) happens
/// when the `Child` is dropped.
fn terminate_child(child: &Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(error) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("failed to signal child process {pid}: {error}");
        }
    }

    #[cfg(not(unix))]
    let _ = child;
}
