//! procpipe binary entry point.

use std::io::{Read, Write};
use std::process::ExitCode;

use procpipe::cli::{self, Args};
use procpipe::config::Config;
use procpipe::{logging, ExecutionResult};
use tracing::{debug, error};

/// Exit code reported when the engine itself failed.
const ENGINE_FAILURE_EXIT: u8 = 125;

fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("procpipe: {}", e);
            eprintln!("Try 'procpipe --help' for more information.");
            return ExitCode::from(2);
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("procpipe: {}", e);
            return ExitCode::from(2);
        }
    };
    let _ = logging::try_init_with_level(config.log_filter());

    match execute(&args, &config) {
        Ok(result) => relay(&result),
        Err(e) => {
            error!("{}", e);
            eprintln!("procpipe: {}", e);
            ExitCode::from(ENGINE_FAILURE_EXIT)
        }
    }
}

fn execute(args: &Args, config: &Config) -> procpipe::Result<ExecutionResult> {
    let executor = config.executor();
    let program = args.program.as_deref().unwrap_or_default();
    let mut cmd = executor.command(program);
    cmd.args(args.program_args.iter().cloned())
        .envs(args.envs.iter().cloned())
        .inputs(&args.inputs);

    if args.read_stdin {
        let mut payload = Vec::new();
        std::io::stdin().read_to_end(&mut payload)?;
        cmd.input(payload);
    }

    debug!(?cmd, detached = args.detached, "executing");
    if args.detached {
        executor.execute_detached(cmd, |pid| debug!(?pid, "child started"))
    } else {
        executor.execute_sync(cmd)
    }
}

fn relay(result: &ExecutionResult) -> ExitCode {
    let _ = std::io::stdout().write_all(result.output());
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().write_all(result.error());

    if let Some(failure) = &result.failure {
        error!("{}", failure);
    }

    if result.has_engine_status() {
        return ExitCode::from(ENGINE_FAILURE_EXIT);
    }
    ExitCode::from(u8::try_from(result.exit_status).unwrap_or(ENGINE_FAILURE_EXIT))
}
