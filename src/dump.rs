//! `--where` one-shot human-readable stack rendering.
//!
//! `SPEC_FULL.md` §1 explicitly carves the "where" renderer out as an
//! external collaborator whose exact layout is out of scope; this is a
//! thin renderer grounded on `benfred-py-spy/src/dump.rs`'s console-styled
//! walk (`print_traces`), trimmed of the teacher's `--json`/subprocess-tree
//! recursion since there is no dump subcommand here — `--where` forces a
//! single sample (`SPEC_FULL.md` §8 scenario 5) and prints once, bypassing
//! the MOJO stream entirely.

use console::style;
use remoteprocess::Pid;

use crate::config::Config;
use crate::process::Supervisor;

/// Renders one sample of `pid`'s stacks to stdout and returns.
pub fn print_where(pid: Pid, config: &Config) -> anyhow::Result<()> {
    let mut supervisor = Supervisor::attach(pid, crate::unwind::MAX_STACK_SIZE)?;
    supervisor.init(std::time::Duration::from_millis(config.attach_timeout_ms))?;

    println!(
        "Process {}{}",
        style(pid).bold().yellow(),
        supervisor
            .version()
            .map(|v| format!(" (Python {})", style(v).bold()))
            .unwrap_or_default()
    );

    for stack in supervisor.render_stacks()? {
        println!("Thread {:#x}", style(stack.thread_id).bold().yellow());
        for frame in &stack.frames {
            if frame.line != 0 {
                println!(
                    "    {} ({}:{})",
                    style(&frame.scope).green(),
                    style(&frame.filename).cyan(),
                    style(frame.line).dim()
                );
            } else {
                println!("    {} ({})", style(&frame.scope).green(), style(&frame.filename).cyan());
            }
        }
    }

    Ok(())
}
