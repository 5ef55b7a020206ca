//! Front-end dispatch and option handling for the `k8psh` and `k8pshd`
//! binaries (and per-command shims).
//!
//! Both binaries share one entry point that dispatches on the basename
//! of `argv[0]`: `k8pshd` runs the server, `k8psh` runs the client with
//! flag parsing, and any other basename is a shim whose name selects the
//! command and whose arguments pass through untouched.

use std::env;
use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tracing::{debug, error, warn};

use crate::client;
use crate::config::Configuration;
use crate::logging;
use crate::paths;
use crate::pidfile::PidFile;
use crate::server::{self, ServerSettings};
use crate::shims::{self, ShimSettings};

const CLIENT_NAME: &str = "k8psh";
const SERVER_NAME: &str = "k8pshd";
pub const CONFIG_ENV: &str = "K8PSH_CONFIG";
pub const NAME_ENV: &str = "K8PSH_NAME";
const DEFAULT_CONFIG_FILE: &str = "k8psh.conf";
const DEFAULT_PID_FILE: &str = "/run/k8pshd.pid";

/// Entry point shared by both binaries.
pub fn main() -> ! {
    logging::init();

    let arguments: Vec<String> = env::args().collect();

    match dispatch(&arguments) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error!("{error:#}");
            std::process::exit(1);
        }
    }
}

fn dispatch(arguments: &[String]) -> Result<i32> {
    let program = arguments.first().map(String::as_str).unwrap_or(CLIENT_NAME);
    let basename = paths::command_basename(program);

    if basename == SERVER_NAME {
        run_server(arguments)
    } else {
        run_client(&basename, arguments)
    }
}

#[derive(Parser, Debug)]
#[command(name = "k8psh", version, disable_version_flag = true, about = "Executes a k8psh client command")]
struct ClientCli {
    /// The configuration file to load. Defaults to $K8PSH_CONFIG.
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Prints the version and exits.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// The command to execute, followed by its arguments.
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn run_client(basename: &str, arguments: &[String]) -> Result<i32> {
    let (command_name, command_arguments, config_override) = if basename == CLIENT_NAME {
        let cli = ClientCli::parse_from(arguments);
        let mut command = cli.command.into_iter();
        let name = command.next().unwrap_or_else(|| basename.to_string());

        (name, command.collect(), cli.config)
    } else {
        // A shim's basename is the command; its arguments pass through.
        let passthrough = arguments.get(1..).unwrap_or_default().to_vec();
        (basename.to_string(), passthrough, None)
    };

    let configuration = load_configuration(config_override.as_deref())?;
    let command = configuration
        .command(&command_name)
        .ok_or_else(|| anyhow!("failed to find command {command_name:?} in configuration"))?
        .clone();

    let working_directory =
        env::current_dir().context("failed to determine the working directory")?;
    let relative = paths::relativize(
        configuration.base_directory(),
        &paths::normalize(&working_directory),
    )?;
    let relative = relative.to_string_lossy().into_owned();

    debug!("starting command {command_name}");

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(client::run_remote_command(
        &relative,
        &command,
        &command_arguments,
        &configuration,
    ))
}

#[derive(Parser, Clone, Debug, Default)]
#[command(name = "k8pshd", version, disable_version_flag = true, about = "Starts the k8pshd server")]
struct ServerCli {
    /// Daemonize the server by sending it to the background.
    #[arg(short, long)]
    background: bool,

    /// Prints the version and exits.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// The configuration file to load. Defaults to $K8PSH_CONFIG.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Disable generating client executables so only local executables
    /// can be run.
    #[arg(short, long)]
    disable_client_executables: bool,

    /// The directory used to create the client executables.
    #[arg(short, long, value_name = "DIR")]
    executable_directory: Option<PathBuf>,

    /// Warn instead of failing on unrecognized options.
    #[arg(short, long)]
    ignore_invalid_arguments: bool,

    /// Keep generated client executables when shutting down.
    #[arg(short, long)]
    keep_client_executables: bool,

    /// Generate client executables for local executables as well.
    #[arg(short = 'l', long)]
    generate_local_executables: bool,

    /// Exit after accepting this many connections (-1 for unlimited).
    #[arg(short, long, value_name = "N", allow_negative_numbers = true)]
    max_connections: Option<i64>,

    /// The name used to identify the server. Defaults to $K8PSH_NAME or
    /// the hostname.
    #[arg(short, long, value_name = "NAME")]
    name: Option<String>,

    /// Overwrite client executables rather than fail with an error.
    #[arg(short, long)]
    overwrite_client_executables: bool,

    /// The file used to store the PID of the server.
    #[arg(short, long, value_name = "FILE")]
    pidfile: Option<PathBuf>,

    /// Exit after this many milliseconds (-1 for forever).
    #[arg(short, long, value_name = "MS", allow_negative_numbers = true)]
    timeout: Option<i64>,

    /// Do not wait for in-flight connections when shutting down.
    #[arg(short = 'w', long)]
    no_wait: bool,
}

impl ServerCli {
    /// Merges two parsed option sets; `self` (the command line) wins over
    /// `fallback` (host-section options from the configuration).
    fn merge(self, fallback: ServerCli) -> ServerCli {
        ServerCli {
            background: self.background || fallback.background,
            version: None,
            config: self.config.or(fallback.config),
            disable_client_executables: self.disable_client_executables
                || fallback.disable_client_executables,
            executable_directory: self.executable_directory.or(fallback.executable_directory),
            ignore_invalid_arguments: self.ignore_invalid_arguments
                || fallback.ignore_invalid_arguments,
            keep_client_executables: self.keep_client_executables
                || fallback.keep_client_executables,
            generate_local_executables: self.generate_local_executables
                || fallback.generate_local_executables,
            max_connections: self.max_connections.or(fallback.max_connections),
            name: self.name.or(fallback.name),
            overwrite_client_executables: self.overwrite_client_executables
                || fallback.overwrite_client_executables,
            pidfile: self.pidfile.or(fallback.pidfile),
            timeout: self.timeout.or(fallback.timeout),
            no_wait: self.no_wait || fallback.no_wait,
        }
    }
}

struct KnownFlag {
    short: Option<&'static str>,
    long: &'static str,
    takes_value: bool,
}

const SERVER_FLAGS: &[KnownFlag] = &[
    KnownFlag { short: Some("-b"), long: "--background", takes_value: false },
    KnownFlag { short: Some("-c"), long: "--config", takes_value: true },
    KnownFlag { short: Some("-d"), long: "--disable-client-executables", takes_value: false },
    KnownFlag { short: Some("-e"), long: "--executable-directory", takes_value: true },
    KnownFlag { short: Some("-h"), long: "--help", takes_value: false },
    KnownFlag { short: Some("-i"), long: "--ignore-invalid-arguments", takes_value: false },
    KnownFlag { short: Some("-k"), long: "--keep-client-executables", takes_value: false },
    KnownFlag { short: Some("-l"), long: "--generate-local-executables", takes_value: false },
    KnownFlag { short: Some("-m"), long: "--max-connections", takes_value: true },
    KnownFlag { short: Some("-n"), long: "--name", takes_value: true },
    KnownFlag { short: Some("-o"), long: "--overwrite-client-executables", takes_value: false },
    KnownFlag { short: Some("-p"), long: "--pidfile", takes_value: true },
    KnownFlag { short: Some("-t"), long: "--timeout", takes_value: true },
    KnownFlag { short: Some("-v"), long: "--version", takes_value: false },
    KnownFlag { short: Some("-w"), long: "--no-wait", takes_value: false },
];

fn contains_ignore_flag(tokens: &[String]) -> bool {
    tokens
        .iter()
        .any(|token| token == "-i" || token == "--ignore-invalid-arguments")
}

/// Filters a token stream down to recognized server options. Unknown
/// tokens are fatal unless `ignore_invalid` is set, in which case they
/// are dropped with a warning.
fn sanitize_options(tokens: &[String], ignore_invalid: bool) -> Result<Vec<String>> {
    let mut sanitized = Vec::new();
    let mut iter = tokens.iter();

    while let Some(token) = iter.next() {
        let known = SERVER_FLAGS.iter().find(|flag| {
            token == flag.long
                || flag.short.is_some_and(|short| token == short)
                || (flag.takes_value
                    && (token.starts_with(&format!("{}=", flag.long))
                        || flag
                            .short
                            .is_some_and(|short| token.starts_with(&format!("{short}=")))))
        });

        match known {
            Some(flag) => {
                sanitized.push(token.clone());

                if flag.takes_value && !token.contains('=') {
                    if let Some(value) = iter.next() {
                        sanitized.push(value.clone());
                    }
                }
            }
            None if ignore_invalid => warn!("ignoring unrecognized option {token}"),
            None => bail!("unrecognized option {token}"),
        }
    }

    Ok(sanitized)
}

fn parse_server_options(tokens: Vec<String>) -> ServerCli {
    ServerCli::parse_from(std::iter::once(SERVER_NAME.to_string()).chain(tokens))
}

fn run_server(arguments: &[String]) -> Result<i32> {
    let cli_tokens = arguments.get(1..).unwrap_or_default().to_vec();

    // With --ignore-invalid-arguments anywhere on the command line,
    // unknown options become warnings; otherwise clap reports them.
    let cli_tokens = if contains_ignore_flag(&cli_tokens) {
        sanitize_options(&cli_tokens, true)?
    } else {
        cli_tokens
    };
    let command_line = parse_server_options(cli_tokens);

    let configuration = load_configuration(command_line.config.as_deref())?;

    let name = match command_line.name.clone() {
        Some(name) => name,
        None => match env::var(NAME_ENV) {
            Ok(name) if !name.is_empty() => name,
            _ => hostname()
                .filter(|name| !name.is_empty())
                .ok_or_else(|| anyhow!("hostname could not be determined, --name must be specified"))?,
        },
    };

    // Host-section options are deferred arguments: they are parsed with
    // the same parser and the command line takes precedence.
    let host_options = configuration
        .host_by_name(&name)
        .map(|host| host.options.clone())
        .unwrap_or_default();
    let ignore_invalid = command_line.ignore_invalid_arguments || contains_ignore_flag(&host_options);
    let config_options = parse_server_options(sanitize_options(&host_options, ignore_invalid)?);
    let options = command_line.merge(config_options);

    let executable_directory = match options.executable_directory.clone() {
        Some(directory) => directory,
        None => default_executable_directory()?,
    };
    let shim_settings = ShimSettings {
        server_name: &name,
        directory: &executable_directory,
        disable: options.disable_client_executables,
        generate_local: options.generate_local_executables,
        overwrite: options.overwrite_client_executables,
    };

    let has_commands = configuration
        .host_commands(&name)
        .is_some_and(|commands| !commands.is_empty());

    if !has_commands {
        warn!("no server commands found in configuration for {name:?}");

        let shim_set = shims::create_client_shims(&configuration, &shim_settings)?;

        if !options.keep_client_executables {
            shim_set.remove();
        }

        return Ok(0);
    }

    let host = configuration
        .host_by_name(&name)
        .ok_or_else(|| anyhow!("no host section found for {name:?}"))?;
    let listener = bind_listener(host.port)?;

    let shim_set = shims::create_client_shims(&configuration, &shim_settings)?;

    if options.background {
        daemonize()?;
    }

    let pid_file = PidFile::create(
        &options
            .pidfile
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE)),
    )?;

    let settings = ServerSettings {
        name,
        max_connections: options.max_connections.unwrap_or(-1),
        timeout_ms: options.timeout.unwrap_or(-1),
        no_wait: options.no_wait,
        handle_hup: !options.background,
    };

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let result = runtime.block_on(server::run(listener, Arc::new(configuration), settings));

    if let Some(pid_file) = pid_file {
        pid_file.remove();
    }

    if !options.keep_client_executables {
        shim_set.remove();
    }

    result.map(|()| 0)
}

pub fn load_configuration(path_override: Option<&Path>) -> Result<Configuration> {
    let path = match path_override {
        Some(path) => path.to_path_buf(),
        None => env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE)),
    };

    debug!("loading configuration from file {}", path.display());
    Ok(Configuration::load(&path)?)
}

fn default_executable_directory() -> Result<PathBuf> {
    let executable =
        env::current_exe().context("failed to determine the current executable path")?;

    executable
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("failed to determine the executable directory"))
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    env::var("COMPUTERNAME").ok()
}

/// Binds the loopback listener with `SO_REUSEADDR` so a restarted server
/// does not trip over sockets in TIME_WAIT.
#[cfg(unix)]
fn bind_listener(port: u16) -> Result<StdTcpListener> {
    use nix::sys::socket::{
        bind, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag, SockType,
        SockaddrIn,
    };

    let context = || format!("failed to bind to port {port}");

    let fd = socket(AddressFamily::Inet, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .with_context(context)?;
    setsockopt(&fd, sockopt::ReuseAddr, &true).with_context(context)?;
    bind(
        std::os::unix::io::AsRawFd::as_raw_fd(&fd),
        &SockaddrIn::new(127, 0, 0, 1, port),
    )
    .with_context(context)?;
    listen(&fd, Backlog::MAXCONN).with_context(context)?;

    debug!("bound to port {port}, listening for new connections");
    Ok(StdTcpListener::from(fd))
}

#[cfg(not(unix))]
fn bind_listener(port: u16) -> Result<StdTcpListener> {
    StdTcpListener::bind(("127.0.0.1", port))
        .with_context(|| format!("failed to bind to port {port}"))
}

/// Forks into the background: new session, root working directory, zero
/// umask, stdio on /dev/null. The parent exits successfully.
#[cfg(unix)]
fn daemonize() -> Result<()> {
    use std::os::unix::io::AsRawFd;

    use nix::unistd::{dup2, fork, setsid, ForkResult};

    debug!("starting daemon");

    match unsafe { fork() }.context("failed to fork daemon")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("failed to create a new session")?;
    env::set_current_dir("/").context("failed to change directory to /")?;
    nix::sys::stat::umask(nix::sys::stat::Mode::empty());

    let dev_null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("failed to open /dev/null for daemon")?;

    for stream in 0..=2 {
        dup2(dev_null.as_raw_fd(), stream).context("failed to redirect standard stream")?;
    }

    Ok(())
}

#[cfg(not(unix))]
fn daemonize() -> Result<()> {
    bail!("daemon not supported on this platform")
}
