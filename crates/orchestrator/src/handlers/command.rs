use serde_json::{json, Value};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{output, HandlerContext, StepOutput};
use crate::error::{OrchestratorError, Result};

/// Run `command` with `args`, optional `cwd` and `env`. A non-zero exit fails
/// the step unless `allow_failure` is set.
///
/// `command` is never templated. Placeholders are rendered in `args` and
/// `env`, which reach the process as argv and environment entries.
pub async fn run_command(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let program = hc.require_literal_str("command")?;
    let args = hc.param_list("args")?.unwrap_or_default();

    let mut cmd = Command::new(&program);
    cmd.args(&args);
    execute(hc, cmd, &program).await
}

/// Run the inline `script` through `interpreter` (default `sh`) with `-c`.
///
/// The script text goes to the interpreter verbatim. Upstream results are
/// passed in through `env` and read as shell variables.
pub async fn run_script(hc: &HandlerContext<'_>) -> Result<StepOutput> {
    let script = hc.require_literal_str("script")?;
    let interpreter = hc
        .literal_str("interpreter")?
        .unwrap_or_else(|| "sh".to_string());

    let mut cmd = Command::new(&interpreter);
    cmd.arg("-c").arg(&script);
    execute(hc, cmd, &interpreter).await
}

async fn execute(hc: &HandlerContext<'_>, mut cmd: Command, program: &str) -> Result<StepOutput> {
    if let Some(cwd) = hc.param_str("cwd")? {
        cmd.current_dir(cwd);
    }
    if let Some(Value::Object(env)) = hc.param("env")? {
        for (key, value) in env {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            cmd.env(key, value);
        }
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(step_id = %hc.step.id, program = %program, "Spawning process");
    let out = cmd.output().await?;

    let exit_code = out.status.code();
    let stdout = String::from_utf8_lossy(&out.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&out.stderr).trim_end().to_string();
    let success = out.status.success();

    if !success {
        if hc.param_bool("allow_failure")?.unwrap_or(false) {
            warn!(step_id = %hc.step.id, exit_code = ?exit_code, "Process failed, failure allowed");
        } else {
            return Err(OrchestratorError::handler_failed(format!(
                "{} exited with {}: {}",
                program,
                exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr
            )));
        }
    }

    Ok(output([
        ("exit_code", json!(exit_code)),
        ("stdout", json!(stdout)),
        ("stderr", json!(stderr)),
        ("success", json!(success)),
    ]))
}
