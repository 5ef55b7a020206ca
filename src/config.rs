//! Configuration DSL: client settings, host sections with deterministic
//! port allocation, and command entries with environment declarations.
//!
//! The grammar is line oriented. Key/value pairs before the first host
//! section are client settings. A host section header
//! `[name[:port] option*]` is followed by command entries of the form
//! `name env-decl* executable-token*`. Tokens support single quoting
//! (verbatim, `''` for a literal quote), double quoting (backslash
//! escapes, `""` for a literal quote), and `${NAME}` substitution in the
//! unquoted spans.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::env;
use crate::paths;

pub const DEFAULT_STARTING_PORT: u16 = 1120;
pub const DEFAULT_CONNECT_TIMEOUT_MS: i64 = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration from {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to resolve {path:?}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unrecognized configuration key {key:?}")]
    UnknownKey { key: String },
    #[error("invalid {key} value {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("unterminated quoted string in configuration: {context}")]
    UnterminatedQuote { context: String },
    #[error("unrecognized escape sequence (\\{escape}) in configuration: {context}")]
    BadEscape { escape: char, context: String },
    #[error("invalid hex character in configuration: {found}")]
    BadHexDigit { found: char },
    #[error("expecting hostname, but found {found:?}")]
    ExpectingHostname { found: String },
    #[error("expecting host section close tag (]), but found {found:?}")]
    ExpectingCloseTag { found: String },
    #[error("invalid port number {port:?}")]
    InvalidPort { port: String },
    #[error("port out of range: {port}")]
    PortOutOfRange { port: u64 },
    #[error("expecting end of line, but found {found:?}")]
    TrailingContent { found: String },
    #[error("command entry appears before any host section")]
    CommandOutsideHost,
}

/// Index of a [`Host`] in the configuration's host arena. Commands store
/// this instead of a reference so the configuration stays cloneable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostId(usize);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Host {
    pub hostname: String,
    pub port: u16,
    /// Command-line-style tokens that a server whose name matches this
    /// host applies to itself before its own command line.
    pub options: Vec<String>,
}

/// One environment declaration of a command. The `spec` keeps its
/// `?`/`=` prefix; `NAME=VALUE` tokens arrive already split.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvDecl {
    pub spec: String,
    pub value: String,
}

impl EnvDecl {
    /// The variable name without the `?`/`=` prefix.
    pub fn name(&self) -> &str {
        match self.spec.as_bytes().first() {
            Some(b'=') | Some(b'?') => &self.spec[1..],
            _ => &self.spec,
        }
    }

    /// `=NAME`: resolved on the server, never forwarded by the client.
    pub fn is_inherited(&self) -> bool {
        self.spec.starts_with('=')
    }

    /// `?NAME`: forwarded by the client when set, no error when missing.
    pub fn is_optional(&self) -> bool {
        self.spec.starts_with('?')
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub host: HostId,
    pub name: String,
    pub executable: Vec<String>,
    pub environment: Vec<EnvDecl>,
}

#[derive(Clone, Debug, Default)]
pub struct Configuration {
    base_directory: PathBuf,
    connect_timeout_ms: i64,
    hosts: Vec<Host>,
    hosts_by_name: HashMap<String, HostId>,
    host_commands: HashMap<String, HashMap<String, Command>>,
    commands: HashMap<String, Command>,
}

impl Configuration {
    /// Loads the configuration from a file. Relative `baseDirectory`
    /// values resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let directory = path.parent().filter(|p| !p.as_os_str().is_empty());

        Self::parse(&text, directory.unwrap_or_else(|| Path::new(".")))
    }

    /// Parses the configuration from a string. `config_directory` anchors
    /// relative `baseDirectory` values and is the default base directory.
    pub fn parse(text: &str, config_directory: &Path) -> Result<Self, ConfigError> {
        let absolute_directory =
            paths::absolutize(config_directory).map_err(|source| ConfigError::Resolve {
                path: config_directory.to_path_buf(),
                source,
            })?;

        let mut configuration = Configuration {
            base_directory: absolute_directory.clone(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            ..Configuration::default()
        };
        let mut parser = Parser::new(text);

        // Client settings run until the first host section.
        loop {
            parser.skip_whitespace();

            match parser.peek() {
                None | Some('[') => break,
                Some('#') => parser.skip_comment(),
                Some(_) => {
                    let (key, value) = parser.parse_key_value()?;
                    parser.ensure_rest_of_line_empty()?;

                    match key.as_str() {
                        "baseDirectory" => {
                            let path = PathBuf::from(&value);
                            configuration.base_directory = if path.is_absolute() {
                                paths::normalize(&path)
                            } else {
                                paths::normalize(&absolute_directory.join(path))
                            };
                        }
                        "connectTimeoutMs" => {
                            configuration.connect_timeout_ms =
                                value.parse().map_err(|_| ConfigError::InvalidNumber {
                                    key: "connectTimeoutMs",
                                    value: value.clone(),
                                })?;
                        }
                        _ => return Err(ConfigError::UnknownKey { key }),
                    }
                }
            }
        }

        // Host sections and command entries.
        let mut current_host: Option<HostId> = None;
        let mut next_port = u32::from(DEFAULT_STARTING_PORT);

        loop {
            parser.skip_whitespace();

            match parser.peek() {
                None => break,
                Some('#') => parser.skip_comment(),
                Some('[') => {
                    parser.advance(1);
                    let (host_string, options) = parser.parse_host_section()?;

                    let (hostname, port) = match host_string.find(':') {
                        Some(colon) => {
                            let port = parse_port(&host_string[colon + 1..])?;
                            (host_string[..colon].to_string(), port)
                        }
                        None => {
                            if next_port == 0 || next_port >= 65536 {
                                return Err(ConfigError::PortOutOfRange {
                                    port: u64::from(next_port),
                                });
                            }

                            (host_string, next_port as u16)
                        }
                    };

                    next_port = u32::from(port) + 1;

                    let id = HostId(configuration.hosts.len());
                    configuration.hosts_by_name.insert(hostname.clone(), id);
                    configuration.hosts.push(Host {
                        hostname,
                        port,
                        options,
                    });
                    current_host = Some(id);
                }
                Some(_) => {
                    let values = parser.parse_arguments()?;
                    parser.ensure_rest_of_line_empty()?;

                    let host = current_host.ok_or(ConfigError::CommandOutsideHost)?;
                    let mut values = values.into_iter();
                    let Some(name) = values.next() else { continue };

                    let mut command = Command {
                        host,
                        name: name.clone(),
                        executable: Vec::new(),
                        environment: Vec::new(),
                    };

                    for value in values {
                        if command.executable.is_empty() && value == "=" {
                            continue; // name/executable separator
                        }

                        let equals = command
                            .executable
                            .is_empty()
                            .then(|| value.match_indices('=').map(|(at, _)| at).find(|&at| at >= 1))
                            .flatten();

                        match equals {
                            Some(at) => command.environment.push(EnvDecl {
                                spec: value[..at].to_string(),
                                value: value[at + 1..].to_string(),
                            }),
                            None => command.executable.push(value),
                        }
                    }

                    if command.executable.is_empty() {
                        command.executable.push(command.name.clone());
                    }

                    debug!("parsed command {:?} for host {:?}", command.name, host);

                    let hostname = configuration.hosts[host.0].hostname.clone();
                    configuration
                        .host_commands
                        .entry(hostname)
                        .or_default()
                        .insert(name.clone(), command.clone());
                    configuration.commands.insert(name, command);
                }
            }
        }

        Ok(configuration)
    }

    /// The directory that all relative working directories are based on.
    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    /// How long the client keeps retrying a connection, in milliseconds.
    /// Negative means forever.
    pub fn connect_timeout_ms(&self) -> i64 {
        self.connect_timeout_ms
    }

    pub fn host(&self, id: HostId) -> &Host {
        &self.hosts[id.0]
    }

    /// The host with the given name; the last section wins when a name
    /// repeats.
    pub fn host_by_name(&self, hostname: &str) -> Option<&Host> {
        self.hosts_by_name.get(hostname).map(|id| &self.hosts[id.0])
    }

    /// All commands, keyed by name: the client-side lookup.
    pub fn commands(&self) -> &HashMap<String, Command> {
        &self.commands
    }

    pub fn command(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    /// The commands declared for one host: the server-side catalog.
    pub fn host_commands(&self, hostname: &str) -> Option<&HashMap<String, Command>> {
        self.host_commands.get(hostname)
    }
}

fn parse_port(port: &str) -> Result<u16, ConfigError> {
    if port.is_empty() || !port.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ConfigError::InvalidPort {
            port: port.to_string(),
        });
    }

    let value: u64 = port.parse().map_err(|_| ConfigError::InvalidPort {
        port: port.to_string(),
    })?;

    if value == 0 || value >= 65536 {
        return Err(ConfigError::PortOutOfRange { port: value });
    }

    Ok(value as u16)
}

fn is_whitespace(ch: char) -> bool {
    matches!(ch, '\t' | '\n' | '\x0b' | '\x0c' | '\r' | ' ')
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Parser { text, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.text[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self, bytes: usize) {
        self.pos += bytes;
    }

    /// The remainder of the current line, for error messages.
    fn rest_of_line(&self) -> String {
        let rest = &self.text[self.pos..];
        let end = rest.find(['\r', '\n']).unwrap_or(rest.len());
        rest[..end].to_string()
    }

    /// Context for unterminated-quote errors: the text from the start of
    /// the offending token.
    fn context_from(&self, start: usize) -> String {
        let rest = &self.text[start..];
        let end = rest.find('\n').map(|at| at.min(80)).unwrap_or_else(|| rest.len().min(80));
        let boundary = (0..=end).rev().find(|&at| rest.is_char_boundary(at)).unwrap_or(0);
        rest[..boundary].to_string()
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if !is_whitespace(ch) {
                break;
            }

            self.advance(ch.len_utf8());
        }
    }

    fn skip_inline_whitespace(&mut self) {
        while matches!(self.peek(), Some('\t') | Some(' ')) {
            self.advance(1);
        }
    }

    /// Skips a comment up to (not including) the terminating newline.
    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }

            self.advance(ch.len_utf8());
        }
    }

    /// Parses one token. Outside quotes the token ends at whitespace,
    /// `#`, or `terminator`. Environment substitution applies to each
    /// unquoted sub-span.
    fn parse_token(&mut self, terminator: Option<char>) -> Result<String, ConfigError> {
        let start = self.pos;
        let mut value = String::new();
        let mut substitute_from = 0;
        let no_overrides = env::Overrides::new();

        loop {
            let Some(ch) = self.peek() else { break };

            if is_whitespace(ch) || ch == '#' || Some(ch) == terminator {
                break;
            }

            match ch {
                '\'' => {
                    let expanded = env::substitute(&value[substitute_from..], &no_overrides);
                    value.truncate(substitute_from);
                    value.push_str(&expanded);

                    self.advance(1);

                    loop {
                        match self.peek() {
                            None => {
                                return Err(ConfigError::UnterminatedQuote {
                                    context: self.context_from(start),
                                })
                            }
                            Some('\'') => {
                                if self.peek_second() == Some('\'') {
                                    value.push('\'');
                                    self.advance(2);
                                } else {
                                    self.advance(1);
                                    break;
                                }
                            }
                            Some(other) => {
                                value.push(other);
                                self.advance(other.len_utf8());
                            }
                        }
                    }

                    substitute_from = value.len();
                }
                '"' => {
                    let expanded = env::substitute(&value[substitute_from..], &no_overrides);
                    value.truncate(substitute_from);
                    value.push_str(&expanded);

                    self.advance(1);
                    self.parse_double_quoted(start, &mut value)?;
                    substitute_from = value.len();
                }
                _ => {
                    value.push(ch);
                    self.advance(ch.len_utf8());
                }
            }
        }

        let expanded = env::substitute(&value[substitute_from..], &no_overrides);
        value.truncate(substitute_from);
        value.push_str(&expanded);

        Ok(value)
    }

    fn parse_double_quoted(&mut self, start: usize, value: &mut String) -> Result<(), ConfigError> {
        loop {
            let Some(ch) = self.peek() else {
                return Err(ConfigError::UnterminatedQuote {
                    context: self.context_from(start),
                });
            };

            match ch {
                '"' => {
                    if self.peek_second() == Some('"') {
                        value.push('"');
                        self.advance(2);
                    } else {
                        self.advance(1);
                        return Ok(());
                    }
                }
                '\\' => {
                    self.advance(1);

                    let Some(escape) = self.peek() else {
                        return Err(ConfigError::UnterminatedQuote {
                            context: self.context_from(start),
                        });
                    };
                    self.advance(escape.len_utf8());

                    match escape {
                        '"' => value.push('"'),
                        '\\' => value.push('\\'),
                        '\'' => value.push('\''),
                        'b' => value.push('\u{8}'),
                        't' => value.push('\t'),
                        'n' => value.push('\n'),
                        'f' => value.push('\u{c}'),
                        'r' => value.push('\r'),
                        '0' => value.push('\0'),
                        'x' => {
                            let high = self.parse_hex_digit()?;
                            let low = self.parse_hex_digit()?;
                            value.push(char::from((high << 4) | low));
                        }
                        _ => {
                            return Err(ConfigError::BadEscape {
                                escape,
                                context: self.context_from(start),
                            })
                        }
                    }
                }
                _ => {
                    value.push(ch);
                    self.advance(ch.len_utf8());
                }
            }
        }
    }

    fn parse_hex_digit(&mut self) -> Result<u8, ConfigError> {
        let found = self.peek().unwrap_or('\0');
        let digit = found
            .to_digit(16)
            .ok_or(ConfigError::BadHexDigit { found })?;

        self.advance(found.len_utf8());
        Ok(digit as u8)
    }

    /// Parses a `key = value` client setting. The value is empty when no
    /// `=` follows the key.
    fn parse_key_value(&mut self) -> Result<(String, String), ConfigError> {
        let key = self.parse_token(Some('='))?;
        let mut found_equals = false;

        while let Some(ch) = self.peek() {
            match ch {
                '\t' | ' ' => self.advance(1),
                '=' if !found_equals => {
                    found_equals = true;
                    self.advance(1);
                }
                _ => break,
            }
        }

        if !found_equals {
            return Ok((key, String::new()));
        }

        let value = self.parse_token(None)?;
        Ok((key, value))
    }

    /// Parses a host section after the opening `[`: the host string, the
    /// closing `]`, and the option tokens on the rest of the line.
    fn parse_host_section(&mut self) -> Result<(String, Vec<String>), ConfigError> {
        self.skip_inline_whitespace();
        let host = self.parse_token(Some(']'))?;
        self.skip_inline_whitespace();

        if host.is_empty() {
            return Err(ConfigError::ExpectingHostname {
                found: self.rest_of_line(),
            });
        }

        if self.peek() != Some(']') {
            return Err(ConfigError::ExpectingCloseTag {
                found: self.rest_of_line(),
            });
        }

        self.advance(1);
        self.skip_inline_whitespace();
        let options = self.parse_arguments()?;
        self.ensure_rest_of_line_empty()?;

        Ok((host, options))
    }

    /// Parses whitespace-delimited tokens up to a comment or end of line.
    fn parse_arguments(&mut self) -> Result<Vec<String>, ConfigError> {
        let mut values = Vec::new();

        while let Some(ch) = self.peek() {
            if is_whitespace(ch) || ch == '#' {
                break;
            }

            values.push(self.parse_token(None)?);
            self.skip_inline_whitespace();
        }

        Ok(values)
    }

    /// Ensures the rest of the line holds only whitespace or a comment.
    fn ensure_rest_of_line_empty(&mut self) -> Result<(), ConfigError> {
        self.skip_inline_whitespace();

        if self.peek() == Some('#') {
            self.skip_comment();
            return Ok(());
        }

        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }

            if !is_whitespace(ch) {
                return Err(ConfigError::TrailingContent {
                    found: self.rest_of_line(),
                });
            }

            self.advance(ch.len_utf8());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Configuration, ConfigError> {
        Configuration::parse(text, Path::new("/cfg"))
    }

    fn command_summary(command: &Command) -> (Vec<(String, String)>, Vec<String>) {
        let environment = command
            .environment
            .iter()
            .map(|decl| (decl.spec.clone(), decl.value.clone()))
            .collect();
        (environment, command.executable.clone())
    }

    #[test]
    fn rejects_bad_configurations() {
        let bad = [
            "badoption=value",
            "baseDirectory=bad value",
            "baseDirectory=\"good val\tue\" extra\n# This is the second line",
            "baseDirectory=\"bad value",
            "baseDirectory=\"bad value\\k\"",
            "baseDirectory='bad value",
            "baseDirectory=${PATH}\n[\nblah]",
            "baseDirectory=${PATH}\n[ blah:65536 ]",
            "baseDirectory=${PATH}\n[ blah:65_36 ]",
            "baseDirectory=${PATH}\n[blah\n]",
            "baseDirectory=${PATH}\n[blah:0]",
            "orphan-command /bin/true",
        ];

        for text in bad {
            assert!(parse(text).is_err(), "expected {text:?} to fail");
        }
    }

    #[test]
    fn rejects_specific_error_kinds() {
        assert!(matches!(parse("badoption=value"), Err(ConfigError::UnknownKey { .. })));
        assert!(matches!(
            parse("[ h:65536 ]"),
            Err(ConfigError::PortOutOfRange { port: 65536 })
        ));
        assert!(matches!(parse("[ h:65_36 ]"), Err(ConfigError::InvalidPort { .. })));
        assert!(matches!(parse("[\nh]"), Err(ConfigError::ExpectingHostname { .. })));
        assert!(matches!(parse("[h\n]"), Err(ConfigError::ExpectingCloseTag { .. })));
        assert!(matches!(
            parse("baseDirectory=\"a\\k\""),
            Err(ConfigError::BadEscape { escape: 'k', .. })
        ));
        assert!(matches!(
            parse("baseDirectory=\"a\\xg0\""),
            Err(ConfigError::BadHexDigit { found: 'g' })
        ));
    }

    #[test]
    fn parses_a_full_configuration() {
        std::env::set_var("K8PSH_CFG_TEST_1", "blah");
        std::env::set_var("K8PSH_CFG_TEST_2", "blah2");

        let config = parse(
            r#"baseDirectory = ${K8PSH_CFG_TEST_1}/${K8PSH_CFG_TEST_2} # The directory that all relative working directories will be based on

# Test comment
[empty]

[ blah:1895 ] # section tags are strings, so spaces can be inside []
blah A=${K8PSH_CFG_TEST_UNSET} ?B="$"'{A}'"" test blah-real 'First 'Arg "\"Escaped\"\tArg """
some_exe theExe
['blah 2'] arg1
blah ENV=some-value # Only name is required"#,
        )
        .unwrap();

        assert_eq!(config.base_directory(), Path::new("/cfg/blah/blah2"));
        assert!(config.host_commands("non-existant").is_none());

        assert_eq!(config.host_by_name("empty").unwrap().port, 1120);
        assert_eq!(config.host_by_name("blah").unwrap().port, 1895);
        assert_eq!(config.host_by_name("blah 2").unwrap().port, 1896);
        assert_eq!(config.host_by_name("blah 2").unwrap().options, vec!["arg1"]);

        // Client-side (global) commands: the last "blah" wins.
        let blah = config.command("blah").unwrap();
        assert_eq!(
            command_summary(blah),
            (
                vec![("ENV".to_string(), "some-value".to_string())],
                vec!["blah".to_string()]
            )
        );
        assert_eq!(
            command_summary(config.command("some_exe").unwrap()),
            (vec![], vec!["theExe".to_string()])
        );

        // Server-side commands for host "blah".
        let blah_map = config.host_commands("blah").unwrap();
        assert_eq!(
            command_summary(&blah_map["blah"]),
            (
                vec![
                    ("A".to_string(), String::new()),
                    ("?B".to_string(), "${A}".to_string()),
                ],
                vec![
                    "test".to_string(),
                    "blah-real".to_string(),
                    "First Arg".to_string(),
                    "\"Escaped\"\tArg \"".to_string(),
                ]
            )
        );
        assert_eq!(
            command_summary(&blah_map["some_exe"]),
            (vec![], vec!["theExe".to_string()])
        );

        let blah2_map = config.host_commands("blah 2").unwrap();
        assert_eq!(
            command_summary(&blah2_map["blah"]),
            (
                vec![("ENV".to_string(), "some-value".to_string())],
                vec!["blah".to_string()]
            )
        );
    }

    #[test]
    fn allocates_ports_deterministically() {
        let config = parse("[a]\n[b:1200]\n[c]\n[d:65535]").unwrap();

        assert_eq!(config.host_by_name("a").unwrap().port, 1120);
        assert_eq!(config.host_by_name("b").unwrap().port, 1200);
        assert_eq!(config.host_by_name("c").unwrap().port, 1201);
        assert_eq!(config.host_by_name("d").unwrap().port, 65535);

        // The counter may not run past the last valid port.
        assert!(matches!(
            parse("[d:65535]\n[e]"),
            Err(ConfigError::PortOutOfRange { port: 65536 })
        ));
    }

    #[test]
    fn substitutes_defaults_in_client_settings() {
        std::env::set_var("K8PSH_CFG_TEST_3", "a");

        let config = parse("baseDirectory=${K8PSH_CFG_TEST_3:-z}/y").unwrap();
        assert_eq!(config.base_directory(), Path::new("/cfg/a/y"));

        let config = parse("baseDirectory=${K8PSH_CFG_TEST_UNSET_2:-x}/y").unwrap();
        assert_eq!(config.base_directory(), Path::new("/cfg/x/y"));
    }

    #[test]
    fn parses_connect_timeout() {
        let config = parse("connectTimeoutMs = 250\n[h]\nblah").unwrap();
        assert_eq!(config.connect_timeout_ms(), 250);

        let config = parse("connectTimeoutMs=-1").unwrap();
        assert_eq!(config.connect_timeout_ms(), -1);

        assert!(matches!(
            parse("connectTimeoutMs=soon"),
            Err(ConfigError::InvalidNumber { .. })
        ));

        let config = parse("[h]\nblah").unwrap();
        assert_eq!(config.connect_timeout_ms(), DEFAULT_CONNECT_TIMEOUT_MS);
    }

    #[test]
    fn entry_tokens_split_into_environment_and_executable() {
        let config = parse("[h]\nshow X= ?Y=fallback = /usr/bin/env extra").unwrap();
        let show = config.command("show").unwrap();

        assert_eq!(
            command_summary(show),
            (
                vec![
                    ("X".to_string(), String::new()),
                    ("?Y".to_string(), "fallback".to_string()),
                ],
                vec!["/usr/bin/env".to_string(), "extra".to_string()]
            )
        );
    }

    #[test]
    fn inherited_specs_keep_their_prefix() {
        let config = parse("[h]\nrun K8PSH_X= =PATH= ?OPT= /bin/true").unwrap();
        let run = config.command("run").unwrap();

        assert_eq!(
            run.environment
                .iter()
                .map(|decl| decl.spec.clone())
                .collect::<Vec<_>>(),
            vec!["K8PSH_X", "=PATH", "?OPT"]
        );
        assert!(run.environment[1].is_inherited());
        assert_eq!(run.environment[1].name(), "PATH");
        assert!(run.environment[2].is_optional());
        assert_eq!(run.environment[2].name(), "OPT");
    }

    #[test]
    fn bare_name_defaults_executable() {
        let config = parse("[h]\njust-a-name").unwrap();

        assert_eq!(
            config.command("just-a-name").unwrap().executable,
            vec!["just-a-name"]
        );
    }

    #[test]
    fn tokens_starting_with_equals_join_the_executable() {
        // An env-decl needs '=' at index >= 1, so "=x" is an argument.
        let config = parse("[h]\nodd /bin/echo =x").unwrap();

        assert_eq!(
            config.command("odd").unwrap().executable,
            vec!["/bin/echo", "=x"]
        );
    }

    #[test]
    fn handles_crlf_line_endings() {
        let config = parse("baseDirectory = /base\r\n[h:1300]\r\ncmd /bin/true\r\n").unwrap();

        assert_eq!(config.base_directory(), Path::new("/base"));
        assert_eq!(config.host_by_name("h").unwrap().port, 1300);
        assert_eq!(config.command("cmd").unwrap().executable, vec!["/bin/true"]);
    }

    #[test]
    fn host_options_follow_the_close_tag() {
        let config = parse(
            "[h] --generate-local-executables --max-connections 4 --timeout 8000 # options\ncmd",
        )
        .unwrap();

        assert_eq!(
            config.host_by_name("h").unwrap().options,
            vec![
                "--generate-local-executables",
                "--max-connections",
                "4",
                "--timeout",
                "8000",
            ]
        );
    }

    #[test]
    fn repeated_host_sections_merge_commands() {
        let config = parse("[h:2000]\nfirst /bin/a\n[h:2010]\nsecond /bin/b").unwrap();

        let commands = config.host_commands("h").unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(config.host_by_name("h").unwrap().port, 2010);
    }
}
