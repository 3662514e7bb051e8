//! Command-line interface for procpipe.
//!
//! Uses lexopt for minimal binary size overhead.

use std::ffi::OsString;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Program to run.
    pub program: Option<String>,
    /// Arguments passed to the program.
    pub program_args: Vec<String>,
    /// Environment entries (`KEY`, `VALUE`) replacing the inherited ones.
    pub envs: Vec<(String, String)>,
    /// Input pieces, appended in order.
    pub inputs: Vec<String>,
    /// Append the caller's stdin to the payload.
    pub read_stdin: bool,
    /// Deadline in seconds.
    pub timeout_secs: Option<u64>,
    /// Use start + wait instead of run.
    pub detached: bool,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
///
/// Options are only recognised before the program name; everything after it
/// belongs to the child.
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('e') | Long("env") => {
                let value: String = parser.value()?.parse()?;
                result.envs.push(parse_env(&value)?);
            }
            Short('i') | Long("input") => {
                result.inputs.push(parser.value()?.parse()?);
            }
            Long("stdin") => {
                result.read_stdin = true;
            }
            Short('t') | Long("timeout") => {
                let value: String = parser.value()?.parse()?;
                result.timeout_secs = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("timeout", value))?,
                );
            }
            Short('a') | Long("async") => {
                result.detached = true;
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Value(val) => {
                result.program = Some(val.string()?);
                for raw in parser.raw_args()? {
                    let raw = raw
                        .into_string()
                        .map_err(|raw| ArgsError::NotUnicode(raw.to_string_lossy().into()))?;
                    result.program_args.push(raw);
                }
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    if result.program.is_none() && !result.help && !result.version {
        return Err(ArgsError::MissingProgram);
    }

    Ok(result)
}

fn parse_env(entry: &str) -> Result<(String, String), ArgsError> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(ArgsError::InvalidValue("env", entry.to_string())),
    }
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"procpipe {version}
Run a program with piped stdin/stdout/stderr and report its exit status

USAGE:
    procpipe [OPTIONS] <PROGRAM> [ARGS]...

OPTIONS:
    -e, --env <KEY=VALUE>   Set an environment variable (repeatable; replaces
                            the inherited environment)
    -i, --input <TEXT>      Append TEXT to the child's stdin (repeatable)
        --stdin             Append this process's stdin to the child's stdin
    -t, --timeout <SECS>    Kill the child after SECS seconds
    -a, --async             Start the child, then wait for it separately
    -c, --config <FILE>     Path to configuration file (JSON)
    -l, --log-level <LVL>   Log level (error, warn, info, debug, trace)
    -h, --help              Print help
    -V, --version           Print version

ENVIRONMENT VARIABLES:
    PROCPIPE_TIMEOUT_SECS   Default timeout (overrides config)
    PROCPIPE_READ_BUFFER    Output read chunk size (overrides config)
    PROCPIPE_LOG_LEVEL      Log level (overrides config)
    RUST_LOG                Alternative log level setting

EXIT STATUS:
    The child's exit status, 128+N if it was killed by signal N,
    127 if it could not be executed, 125 on an engine failure.

EXAMPLES:
    # Filter text through grep
    procpipe -i "hello, world" -i $'\nbye\n' grep hello

    # Run with a clean environment
    procpipe -e PATH=/usr/bin -e LANG=C env
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("procpipe {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// No program was given.
    MissingProgram,
    /// A child argument is not valid UTF-8.
    NotUnicode(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::MissingProgram => write!(f, "missing program to run"),
            Self::NotUnicode(arg) => write!(f, "argument is not valid unicode: '{}'", arg),
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<OsString> {
        std::iter::once("procpipe")
            .chain(args.iter().copied())
            .map(OsString::from)
            .collect()
    }

    #[test]
    fn test_program_and_args() {
        let result = parse_args_from(args(&["grep", "hello"])).unwrap();
        assert_eq!(result.program.as_deref(), Some("grep"));
        assert_eq!(result.program_args, vec!["hello"]);
        assert!(!result.detached);
    }

    #[test]
    fn test_options_after_program_belong_to_child() {
        let result = parse_args_from(args(&["-t", "3", "ls", "-l", "--help"])).unwrap();
        assert_eq!(result.timeout_secs, Some(3));
        assert_eq!(result.program.as_deref(), Some("ls"));
        assert_eq!(result.program_args, vec!["-l", "--help"]);
        assert!(!result.help);
    }

    #[test]
    fn test_env_and_inputs() {
        let result = parse_args_from(args(&[
            "-e", "FOO=bar", "--env", "EMPTY=", "-i", "one\n", "--input", "two", "cat",
        ]))
        .unwrap();
        assert_eq!(
            result.envs,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("EMPTY".to_string(), String::new())
            ]
        );
        assert_eq!(result.inputs, vec!["one\n", "two"]);
    }

    #[test]
    fn test_invalid_env() {
        assert!(parse_args_from(args(&["-e", "NOEQUALS", "env"])).is_err());
        assert!(parse_args_from(args(&["-e", "=value", "env"])).is_err());
    }

    #[test]
    fn test_async_and_stdin_flags() {
        let result = parse_args_from(args(&["--async", "--stdin", "cat"])).unwrap();
        assert!(result.detached);
        assert!(result.read_stdin);
    }

    #[test]
    fn test_missing_program() {
        let err = parse_args_from(args(&["-t", "1"])).unwrap_err();
        assert!(matches!(err, ArgsError::MissingProgram));
    }

    #[test]
    fn test_help_without_program() {
        let result = parse_args_from(args(&["-h"])).unwrap();
        assert!(result.help);

        let result = parse_args_from(args(&["--version"])).unwrap();
        assert!(result.version);
    }

    #[test]
    fn test_invalid_timeout() {
        let result = parse_args_from(args(&["-t", "soon", "sleep", "1"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_and_log_level() {
        let result =
            parse_args_from(args(&["-c", "/etc/procpipe.json", "-l", "debug", "true"])).unwrap();
        assert_eq!(result.config, Some(PathBuf::from("/etc/procpipe.json")));
        assert_eq!(result.log_level, Some("debug".to_string()));
    }
}
