// src/exec/command.rs

//! Stage functions that run a shell command per call.
//!
//! The child is killed when the call's future is dropped, so an abandoned
//! call does not leave its command running.

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info};

use crate::exec::template::{expand, TemplateContext};
use crate::pipeline::{PipelineConfig, StageFn, WorkItem};
use crate::remote::{CallFuture, TaskError};

/// Work item of the current call, as JSON. Unset for single stages.
pub const ITEM_ENV: &str = "CHUNKDAG_ITEM";
/// The pipeline's `[params]`, as JSON.
pub const PARAMS_ENV: &str = "CHUNKDAG_PARAMS";
pub const NODE_ENV: &str = "CHUNKDAG_NODE";
pub const STAGE_ENV: &str = "CHUNKDAG_STAGE";

/// Error kind for commands that exit unsuccessfully.
pub const COMMAND_FAILED: &str = "CommandFailed";

/// Build a stage function that expands `template` and runs it through the
/// platform shell. A non-zero exit is a failed call.
pub fn shell_stage_fn(node: &str, stage: &str, template: &str) -> StageFn {
    let node = node.to_string();
    let stage = stage.to_string();
    let template = template.to_string();

    Arc::new(move |item: Option<WorkItem>, params: PipelineConfig| -> CallFuture<()> {
        let node = node.clone();
        let stage = stage.clone();
        let template = template.clone();
        Box::pin(async move {
            let ctx = TemplateContext {
                node: &node,
                stage: &stage,
                item: item.as_ref(),
                params: &params,
            };
            let cmd =
                expand(&template, &ctx).map_err(|msg| TaskError::new("TemplateError", msg))?;
            run_shell(&cmd, &ctx).await
        })
    })
}

async fn run_shell(cmd: &str, ctx: &TemplateContext<'_>) -> Result<(), TaskError> {
    debug!(node = %ctx.node, stage = %ctx.stage, cmd = %cmd, "starting stage command");

    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    };

    command
        .env(PARAMS_ENV, ctx.params.to_string())
        .env(NODE_ENV, ctx.node)
        .env(STAGE_ENV, ctx.stage)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    match ctx.item {
        Some(item) => command.env(ITEM_ENV, item.to_string()),
        None => command.env_remove(ITEM_ENV),
    };

    let output = command.output().await.map_err(|e| TaskError::from_error(&e))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!(node = %ctx.node, stage = %ctx.stage, "stdout: {}", line);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines() {
        debug!(node = %ctx.node, stage = %ctx.stage, "stderr: {}", line);
    }

    if output.status.success() {
        return Ok(());
    }

    let code = output.status.code().unwrap_or(-1);
    info!(
        node = %ctx.node,
        stage = %ctx.stage,
        exit_code = code,
        "stage command failed"
    );
    let last_line = stderr.lines().last().unwrap_or("").trim();
    let message = if last_line.is_empty() {
        format!("`{cmd}` exited with code {code}")
    } else {
        format!("`{cmd}` exited with code {code}: {last_line}")
    };
    Err(TaskError::new(COMMAND_FAILED, message))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> PipelineConfig {
        Arc::new(value)
    }

    #[tokio::test]
    async fn successful_command_sees_item_and_params() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("seen");
        let template = format!(
            "printf '%s|%s|{{item.0}}' \"$CHUNKDAG_ITEM\" \"$CHUNKDAG_PARAMS\" > {}",
            out.display()
        );
        let f = shell_stage_fn("a", "write", &template);

        f(Some(json!([3, 4])), params(json!({"k": 1}))).await.unwrap();

        let seen = std::fs::read_to_string(&out).unwrap();
        assert_eq!(seen, "[3,4]|{\"k\":1}|3");
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code_and_stderr() {
        let f = shell_stage_fn("a", "boom", "echo broken >&2; exit 7");

        let err = f(None, params(json!({}))).await.unwrap_err();

        assert_eq!(err.kind, COMMAND_FAILED);
        assert!(err.message.contains("code 7"), "{}", err.message);
        assert!(err.message.contains("broken"), "{}", err.message);
    }

    #[tokio::test]
    async fn template_errors_fail_the_call() {
        let f = shell_stage_fn("a", "s", "echo {params.missing}");
        let err = f(None, params(json!({}))).await.unwrap_err();
        assert_eq!(err.kind, "TemplateError");
    }

    #[tokio::test]
    async fn dropping_the_call_kills_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let f = shell_stage_fn("a", "slow", &format!("sleep 1; touch {}", marker.display()));

        let call = f(None, params(json!({})));
        let stopped = tokio::time::timeout(std::time::Duration::from_millis(200), call).await;
        assert!(stopped.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
