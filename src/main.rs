#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Error;
use console::style;

use austin::config::Config;
use austin::dump;
use austin::emitter::MojoEmitter;
use austin::process::Supervisor;
use austin::tree::ProcessTree;

/// Mirrors the teacher's own Unix permission-denied sniff in `main.rs`, over
/// the error kinds this crate's `error::AustinError` actually produces.
#[cfg(unix)]
fn permission_denied(err: &Error) -> bool {
    err.chain().any(|cause| {
        if let Some(ioerror) = cause.downcast_ref::<io::Error>() {
            ioerror.kind() == io::ErrorKind::PermissionDenied
        } else if let Some(remoteprocess::Error::IOError(ioerror)) =
            cause.downcast_ref::<remoteprocess::Error>()
        {
            ioerror.kind() == io::ErrorKind::PermissionDenied
        } else {
            false
        }
    })
}

#[cfg(not(unix))]
fn permission_denied(_err: &Error) -> bool {
    false
}

fn is_broken_pipe(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::BrokenPipe
}

/// Builds the supervisor for the single-target (non `-C`) case, either by
/// spawning the given command or attaching to `-p`'s pid.
fn start_supervisor(config: &Config) -> anyhow::Result<Supervisor> {
    let max_stack = austin::MAX_STACK_SIZE;
    let mut supervisor = if let Some(pid) = config.pid {
        Supervisor::attach(pid, max_stack)?
    } else {
        let command = config
            .command
            .as_ref()
            .expect("Config::from_args guarantees pid or command is set");
        Supervisor::spawn(command, max_stack)?
    };
    supervisor.init(Duration::from_millis(config.attach_timeout_ms))?;
    Ok(supervisor)
}

fn run(config: &Config, interrupted: Arc<AtomicBool>) -> anyhow::Result<i32> {
    if config.where_mode {
        let pid = config
            .pid
            .expect("Config::from_args rejects --where without -p");
        dump::print_where(pid, config)?;
        return Ok(0);
    }

    let sink: Box<dyn Write> = match &config.output_filename {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout()),
    };
    let mut emitter = MojoEmitter::new(sink, config.pipe);
    emitter.write_header()?;

    let mut supervisor = start_supervisor(config)?;
    let pid = supervisor.pid;
    eprintln!(
        "{} sampling pid {}{}",
        style("austin:").bold().green(),
        style(pid).bold(),
        supervisor
            .version()
            .map(|v| format!(" (Python {})", v))
            .unwrap_or_default()
    );

    let mut tree = if config.children {
        Some(ProcessTree::new(pid, austin::MAX_STACK_SIZE))
    } else {
        None
    };

    let rate_hz = 1_000_000.0 / config.sampling_interval_us as f64;
    let timer = austin::timer::Timer::new(rate_hz);
    let started = Instant::now();
    let exposure = if config.exposure_seconds > 0 {
        Some(Duration::from_secs(config.exposure_seconds))
    } else {
        None
    };

    for tick in timer {
        if let Err(late) = tick {
            debug!("sampling fell behind by {:?}", late);
        }

        if interrupted.load(Ordering::SeqCst) {
            break;
        }
        if let Some(budget) = exposure {
            if started.elapsed() >= budget {
                break;
            }
        }

        if !supervisor.is_running() {
            if let Some(tree) = &tree {
                if tree.size() == 0 {
                    break;
                }
            } else {
                break;
            }
        }

        if supervisor.is_python() {
            if let Err(err) = supervisor.sample(config, 0, &mut emitter) {
                if let Some(ioerr) = err.downcast_ref::<io::Error>() {
                    if is_broken_pipe(ioerr) {
                        return Ok(1);
                    }
                }
                // Per-tick failures are retried next tick unless the error
                // kind is one the core considers fatal (spec's error-kind
                // table), e.g. permission revoked mid-run: that ends the run
                // rather than looping forever on a target we can't read.
                if let Some(austin_err) = err.downcast_ref::<austin::error::AustinError>() {
                    if austin_err.kind.is_fatal() {
                        error!("fatal sampling error: {}", austin_err);
                        return Err(err);
                    }
                }
                debug!("sample failed: {}", err);
            }
        }

        if let Some(tree) = &mut tree {
            tree.update();
            tree.sample(config, &mut emitter);
        }

        if let Err(err) = emitter.flush() {
            if is_broken_pipe(&err) {
                return Ok(1);
            }
            return Err(err.into());
        }
    }

    if let Some(tree) = tree.take() {
        let _ = tree.wait();
    }
    supervisor.wait()?;

    Ok(0)
}

fn main() {
    if !austin::config::logging_disabled() {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let config = Config::from_commandline();

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    if ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)).is_err() {
        warn!("failed to install interrupt handler");
    }

    match run(&config, interrupted.clone()) {
        Ok(code) => {
            if interrupted.load(Ordering::SeqCst) && code == 0 {
                // SIGINT is the only signal ctrlc distinguishes reliably across
                // platforms; the exit code reports that one per the negative-
                // of-received-signal convention.
                std::process::exit(-(libc_sigint()));
            }
            std::process::exit(code);
        }
        Err(err) => {
            error!("{}", err);
            if permission_denied(&err) {
                eprintln!(
                    "{}: permission denied, try running as root or with an elevated privilege level",
                    style("error").bold().red()
                );
            } else {
                eprintln!("{}: {}", style("error").bold().red(), err);
            }
            std::process::exit(1);
        }
    }
}

#[cfg(unix)]
fn libc_sigint() -> i32 {
    libc::SIGINT
}

#[cfg(not(unix))]
fn libc_sigint() -> i32 {
    2
}
