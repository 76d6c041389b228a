//! Command-line configuration.
//!
//! Grounded on `benfred-py-spy/src/config.rs`'s `clap::Command` builder
//! style, its `Config::from_args`/`from_commandline` split, and its test
//! harness shape (splitting a whole command-line string, then asserting on
//! the parsed `Config`). Restructured from the teacher's four subcommands
//! (`record`/`top`/`dump`/`completions`) into a single flat command, since
//! there is exactly one output mode here — the binary MOJO stream, with
//! `--where` as a one-shot alternate rendering rather than a subcommand —
//! which is itself grounded on `original_source/src/argparse.h`'s
//! `parsed_args_t` (one flat struct of fields, no subcommand concept at all).

use clap::{crate_description, crate_name, crate_version, Arg, Command};
use remoteprocess::Pid;

/// The command-line-configurable surface, one-to-one with
/// `original_source/src/argparse.h`'s `parsed_args_t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Positional program + arguments to spawn; mutually exclusive with `pid`.
    pub command: Option<Vec<String>>,
    /// `-p`: attach to an already-running process instead of spawning.
    pub pid: Option<Pid>,
    /// `-i`: sampling interval in microseconds.
    pub sampling_interval_us: u64,
    /// `-t`: attach timeout in milliseconds.
    pub attach_timeout_ms: u64,
    /// `-x`: exposure window in seconds; `0` means unbounded.
    pub exposure_seconds: u64,
    /// `-o`: output file path; `None` means stdout.
    pub output_filename: Option<String>,
    /// `-C`: follow and sample child processes.
    pub children: bool,
    /// `-f`: full mode — emit both time and memory metrics per sample.
    pub full: bool,
    /// `-s`: CPU mode — emit only non-idle samples.
    pub cpu_only: bool,
    /// `-m`: memory mode — emit memory deltas instead of wall time.
    pub memory: bool,
    /// `-g`: account for time spent in the interpreter's GC.
    pub gc: bool,
    /// `-P`: pipe mode — flush the sink eagerly after metadata/stack events.
    pub pipe: bool,
    /// `-w`: where mode — one-shot human-readable rendering, exclusive with
    /// the binary event stream.
    pub where_mode: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            command: None,
            pid: None,
            sampling_interval_us: 100,
            attach_timeout_ms: 1000,
            exposure_seconds: 0,
            output_filename: None,
            children: false,
            full: false,
            cpu_only: false,
            memory: false,
            gc: false,
            pipe: false,
            where_mode: false,
        }
    }
}

impl Config {
    pub fn from_commandline() -> Config {
        let args: Vec<String> = std::env::args().collect();
        Config::from_args(&args).unwrap_or_else(|e| e.exit())
    }

    pub fn from_args(args: &[String]) -> clap::Result<Config> {
        let app = Command::new(crate_name!())
            .version(crate_version!())
            .about(crate_description!())
            .arg(
                Arg::new("pid")
                    .short('p')
                    .long("pid")
                    .value_name("pid")
                    .help("Attach to the process with this PID")
                    .takes_value(true),
            )
            .arg(
                Arg::new("interval")
                    .short('i')
                    .long("interval")
                    .value_name("microseconds")
                    .help("Sampling interval in microseconds")
                    .default_value("100")
                    .takes_value(true),
            )
            .arg(
                Arg::new("timeout")
                    .short('t')
                    .long("timeout")
                    .value_name("milliseconds")
                    .help("Attach timeout in milliseconds")
                    .default_value("1000")
                    .takes_value(true),
            )
            .arg(
                Arg::new("exposure")
                    .short('x')
                    .long("exposure")
                    .value_name("seconds")
                    .help("Total duration of the sampling session, in seconds (0 = unbounded)")
                    .default_value("0")
                    .takes_value(true),
            )
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .value_name("path")
                    .help("Output file (default: stdout)")
                    .takes_value(true),
            )
            .arg(
                Arg::new("children")
                    .short('C')
                    .long("children")
                    .help("Sample all child processes of the target"),
            )
            .arg(
                Arg::new("full")
                    .short('f')
                    .long("full")
                    .help("Emit both time and memory metrics per sample"),
            )
            .arg(
                Arg::new("cpu")
                    .short('s')
                    .long("sleepless")
                    .help("Only emit samples for threads that are not idle"),
            )
            .arg(
                Arg::new("memory")
                    .short('m')
                    .long("memory")
                    .help("Emit memory metrics instead of wall time"),
            )
            .arg(
                Arg::new("gc")
                    .short('g')
                    .long("gc")
                    .help("Account for time spent in the interpreter's garbage collector"),
            )
            .arg(
                Arg::new("pipe")
                    .short('P')
                    .long("pipe")
                    .help("Flush the output sink eagerly, for piping to a reader process"),
            )
            .arg(
                Arg::new("where")
                    .short('w')
                    .long("where")
                    .help("One-shot human-readable stack rendering instead of the binary stream")
                    .conflicts_with("pipe"),
            )
            .arg(
                Arg::new("command")
                    .help("Command to spawn and sample")
                    .multiple_values(true)
                    .conflicts_with("pid"),
            );

        let matches = app.try_get_matches_from(args)?;
        info!("Command line args: {:?}", matches);

        let mut config = Config::default();

        config.pid = matches
            .value_of("pid")
            .map(|p| p.parse().expect("invalid pid"));
        config.command = matches
            .values_of("command")
            .map(|vals| vals.map(|v| v.to_owned()).collect());

        config.sampling_interval_us = matches.value_of_t("interval")?;
        config.attach_timeout_ms = matches.value_of_t("timeout")?;
        config.exposure_seconds = matches.value_of_t("exposure")?;
        config.output_filename = matches.value_of("output").map(|f| f.to_owned());
        config.children = matches.occurrences_of("children") > 0;
        config.full = matches.occurrences_of("full") > 0;
        config.cpu_only = matches.occurrences_of("cpu") > 0;
        config.memory = matches.occurrences_of("memory") > 0;
        config.gc = matches.occurrences_of("gc") > 0;
        config.pipe = matches.occurrences_of("pipe") > 0;
        config.where_mode = matches.occurrences_of("where") > 0;

        // Mirrors the original's post-parse coercion
        // (`original_source/src/austin.c`'s `main()`): combining `--full`
        // with `--memory` or `--sleepless` is redundant, not a conflict, and
        // `--memory` alone (without `--full`) silently drops `--sleepless`
        // rather than rejecting the combination.
        if config.full {
            if config.memory {
                warn!("--memory is redundant in full mode");
            }
            if config.cpu_only {
                warn!("--sleepless is redundant in full mode");
            }
        } else if config.memory && config.cpu_only {
            warn!("--sleepless is incompatible with memory mode");
            config.cpu_only = false;
        }

        if config.pid.is_none() && config.command.is_none() {
            eprintln!("Either a PID (-p) or a command to spawn must be given");
            std::process::exit(64);
        }

        Ok(config)
    }
}

/// `AUSTIN_NO_LOGGING` disables logging outright; read once at startup by
/// `main`'s `env_logger` init.
pub fn logging_disabled() -> bool {
    std::env::var_os("AUSTIN_NO_LOGGING").is_some()
}

/// `AUSTIN_PAGE_SIZE_CAP` caps the page size used to size the
/// interpreter-state prefetch window; default 4096 per `SPEC_FULL.md` §6.
pub fn page_size_cap() -> usize {
    std::env::var("AUSTIN_PAGE_SIZE_CAP")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_config(cmd: &str) -> clap::Result<Config> {
        let args: Vec<String> = cmd.split_whitespace().map(|x| x.to_owned()).collect();
        Config::from_args(&args)
    }

    #[test]
    fn parses_attach_by_pid() {
        let config = get_config("austin -p 1234 -i 10000").unwrap();
        assert_eq!(config.pid, Some(1234));
        assert_eq!(config.sampling_interval_us, 10000);
        assert_eq!(config.command, None);
    }

    #[test]
    fn parses_spawn_command() {
        let config = get_config("austin -- python script.py").unwrap();
        assert_eq!(config.pid, None);
        assert_eq!(
            config.command,
            Some(vec!["python".to_owned(), "script.py".to_owned()])
        );
    }

    #[test]
    fn short_flags_set_booleans() {
        let config = get_config("austin -p 1 -C -f -g -P").unwrap();
        assert!(config.children);
        assert!(config.full);
        assert!(config.gc);
        assert!(config.pipe);
        assert!(!config.where_mode);
    }

    #[test]
    fn where_and_pipe_are_mutually_exclusive() {
        let result = get_config("austin -p 1 -P -w");
        assert!(result.is_err());
    }

    #[test]
    fn page_size_cap_defaults_to_4096() {
        std::env::remove_var("AUSTIN_PAGE_SIZE_CAP");
        assert_eq!(page_size_cap(), 4096);
    }

    #[test]
    fn memory_mode_clears_cpu_only() {
        let config = get_config("austin -p 1 -m -s").unwrap();
        assert!(config.memory);
        assert!(!config.cpu_only);
    }

    #[test]
    fn full_mode_keeps_cpu_only_and_memory_as_given() {
        let config = get_config("austin -p 1 -f -m -s").unwrap();
        assert!(config.full);
        assert!(config.memory);
        assert!(config.cpu_only);
    }
}
