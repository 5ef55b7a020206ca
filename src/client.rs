//! Client dispatcher: connects to the command's host, sends the
//! invocation prologue, and bridges local stdio to the remote child.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::{FrameReader, FrameWriter};
use crate::config::{Command, Configuration};
use crate::protocol::FrameType;

const INITIAL_BACKOFF: Duration = Duration::from_millis(16);
const MAX_BACKOFF: Duration = Duration::from_millis(1000);
const STDIN_BUFFER_SIZE: usize = 64 * 1024 - 1;

/// Runs `command` on its configured host, bridging this process's stdio,
/// and returns the remote exit code.
pub async fn run_remote_command(
    working_directory: &str,
    command: &Command,
    arguments: &[String],
    configuration: &Configuration,
) -> Result<i32> {
    let port = configuration.host(command.host).port;
    let stream = connect_with_backoff(port, configuration.connect_timeout_ms()).await?;
    stream.set_nodelay(true).context("failed to configure socket")?;

    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    send_prologue(&mut writer, working_directory, command, arguments).await?;

    relay_session(
        &mut reader,
        &mut writer,
        tokio::io::stdin(),
        tokio::io::stdout(),
        tokio::io::stderr(),
    )
    .await
}

/// Connects to the server on loopback, retrying transient failures with
/// exponential backoff until `timeout_ms` elapses (negative = forever).
async fn connect_with_backoff(port: u16, timeout_ms: i64) -> Result<TcpStream> {
    let deadline =
        (timeout_ms >= 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => {
                debug!("connected to port {port}");
                return Ok(stream);
            }
            Err(error) => {
                debug!("connection to port {port} failed ({error}), retrying");

                let wake = match deadline {
                    Some(deadline) => {
                        if Instant::now() >= deadline {
                            bail!("failed to connect to server on port {port} after {timeout_ms}ms: {error}");
                        }

                        (Instant::now() + backoff).min(deadline)
                    }
                    None => Instant::now() + backoff,
                };

                tokio::time::sleep_until(wake).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn send_prologue<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    working_directory: &str,
    command: &Command,
    arguments: &[String],
) -> Result<()> {
    debug!("sending working directory ({working_directory:?}) to server");
    writer
        .write_data(FrameType::WorkingDirectory, working_directory.as_bytes(), false)
        .await?;

    for argument in arguments {
        debug!("sending argument ({argument:?}) to server");
        writer
            .write_data(FrameType::CommandArgument, argument.as_bytes(), false)
            .await?;
    }

    for decl in &command.environment {
        if decl.is_inherited() {
            continue;
        }

        let name = decl.name();

        if let Ok(value) = std::env::var(name) {
            debug!("sending environment variable ({name}={value}) to server");
            writer
                .write_data(
                    FrameType::EnvironmentVariable,
                    format!("{name}={value}").as_bytes(),
                    false,
                )
                .await?;
        }
    }

    debug!("sending start command ({:?}) to server", command.name);
    writer
        .write_data(FrameType::StartCommand, command.name.as_bytes(), true)
        .await?;

    Ok(())
}

/// Multiplexes local stdin against the socket until the server delivers
/// the exit code. A socket close without an exit code aborts the
/// process: the command did not complete, and a normal exit would let
/// the caller mistake that for success.
async fn relay_session<R, W, In, Out, ErrOut>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    mut stdin: In,
    mut stdout: Out,
    mut stderr: ErrOut,
) -> Result<i32>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    In: AsyncRead + Unpin,
    Out: AsyncWrite + Unpin,
    ErrOut: AsyncWrite + Unpin,
{
    let mut stdin_open = true;
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut buffer = vec![0u8; STDIN_BUFFER_SIZE];

    loop {
        tokio::select! {
            biased;

            frame = reader.next_frame() => {
                let Some(frame) = frame? else {
                    warn!("socket has been closed without an exit code, aborting");
                    std::process::abort();
                };

                match frame.frame_type {
                    FrameType::StdinData => {
                        if stdin_open {
                            debug!("received stdin close notice from server");
                            stdin_open = false;
                        }
                    }
                    FrameType::StdoutData => {
                        deliver_stream_data(&mut stdout, &mut stdout_open, "stdout", &frame.payload)
                            .await?;
                    }
                    FrameType::StderrData => {
                        deliver_stream_data(&mut stderr, &mut stderr_open, "stderr", &frame.payload)
                            .await?;
                    }
                    FrameType::ExitCode => {
                        stdout.flush().await?;
                        stderr.flush().await?;
                        debug!("received exit code ({}) from server", frame.value as i32);
                        return Ok(frame.value as i32);
                    }
                    other => bail!("read invalid payload type ({}) from socket", other as u8),
                }
            }

            read = stdin.read(&mut buffer), if stdin_open => {
                let count = read.context("failed to read data from stdin")?;
                debug!("sending stdin data ({count} bytes) to server");
                writer.write_data(FrameType::StdinData, &buffer[..count], true).await?;

                if count == 0 {
                    stdin_open = false;
                }
            }
        }
    }
}

async fn deliver_stream_data<W: AsyncWrite + Unpin>(
    stream: &mut W,
    open: &mut bool,
    name: &str,
    payload: &[u8],
) -> Result<()> {
    if !payload.is_empty() {
        if !*open {
            bail!(
                "unexpected {name} data ({} bytes) from server, stream already closed",
                payload.len()
            );
        }

        stream
            .write_all(payload)
            .await
            .with_context(|| format!("failed to write {name} data"))?;
    } else if *open {
        debug!("received {name} close command from server");
        stream.flush().await?;
        *open = false;
    }

    Ok(())
}
