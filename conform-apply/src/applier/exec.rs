use anyhow::{bail, Context, Result};
use log::debug;

use conform_catalog::{Command, ExecResource, RunCondition};
use conform_sys::{CommandOutput, CommandSpec};

use super::{ApplyContext, CommandFailed};

/// Apply an exec resource: consult the condition, then run the command.
///
/// A probe exiting nonzero is a decision signal, never a failure; only the
/// command itself failing (or a probe failing to start at all) is. A
/// resource whose condition decides against running is done without change.
pub(crate) fn apply_exec(
    exec: &ExecResource,
    deps_changed: bool,
    ctx: &ApplyContext,
) -> Result<bool> {
    match &exec.condition {
        Some(RunCondition::OnlyIf(probe)) => {
            let out = run_command(exec, probe, ctx).context("onlyIf probe failed")?;
            if !out.success() {
                debug!("onlyIf probe declined, not running");
                return Ok(false);
            }
        }
        Some(RunCondition::Unless(probe)) => {
            let out = run_command(exec, probe, ctx).context("unless probe failed")?;
            if out.success() {
                debug!("unless probe declined, not running");
                return Ok(false);
            }
        }
        Some(RunCondition::IfDepsChanged) => {
            if !deps_changed {
                debug!("no dependency changed, not running");
                return Ok(false);
            }
        }
        None => {}
    }

    let out = run_command(exec, &exec.command, ctx)?;
    if !out.success() {
        return Err(CommandFailed {
            status: out.status,
            output: out.output,
        }
        .into());
    }
    Ok(true)
}

fn run_command(
    exec: &ExecResource,
    command: &Command,
    ctx: &ApplyContext,
) -> Result<CommandOutput> {
    let spec = command_spec(exec, command, ctx)?;
    Ok(ctx.system.run(&spec)?)
}

/// Resolve a catalog command into a concrete spec: argv runs directly,
/// scripts go through the configured shell.
fn command_spec(exec: &ExecResource, command: &Command, ctx: &ApplyContext) -> Result<CommandSpec> {
    let (program, args) = match command {
        Command::Argv(argv) => {
            let (program, args) = argv.split_first().context("empty argv")?;
            (program.into(), args.to_vec())
        }
        Command::Script(script) => (
            ctx.shell.clone(),
            vec!["-c".to_owned(), script.clone()],
        ),
    };
    let env = exec
        .environment
        .as_ref()
        .map(|entries| {
            entries
                .iter()
                .map(|entry| match entry.split_once('=') {
                    Some((key, value)) => Ok((key.to_owned(), value.to_owned())),
                    None => bail!("malformed environment entry {:?}", entry),
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;
    Ok(CommandSpec {
        program,
        args,
        workdir: exec.workdir.clone(),
        env,
    })
}
