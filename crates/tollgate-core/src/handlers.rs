//! Built-in handler adapters. They carry no domain logic of their own:
//! `command` hands the event to an external tool, `action_policy` is a
//! static allow/deny gate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tollgate_types::{HookEvent, ToolLocation};

use crate::error::TollgateError;
use crate::hooks::{HookContext, HookHandler, HookVerdict};
use crate::matching::wildcard_matches;
use crate::registry::HandlerDescriptor;

fn default_true() -> bool {
    true
}

fn parse_config<T: serde::de::DeserializeOwned>(descriptor: &HandlerDescriptor) -> anyhow::Result<T> {
    let value = if descriptor.config.is_null() {
        Value::Object(Default::default())
    } else {
        descriptor.config.clone()
    };
    serde_json::from_value(value)
        .map_err(|err| anyhow::anyhow!("invalid config for hook `{}`: {}", descriptor.name, err))
}

// ---------------------------------------------------------------------------
// command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandConfig {
    tool: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default = "default_true")]
    skip_when_unavailable: bool,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Runs an external validator. Local and global tools get the event JSON on
/// stdin; remote tools get it as a POST body.
pub struct CommandHook {
    name: String,
    config: CommandConfig,
    client: reqwest::Client,
}

impl CommandHook {
    pub fn from_descriptor(descriptor: &HandlerDescriptor) -> anyhow::Result<Self> {
        let config: CommandConfig = parse_config(descriptor)?;
        if config.tool.trim().is_empty() {
            anyhow::bail!("hook `{}` needs a non-empty `tool`", descriptor.name);
        }
        Ok(Self {
            name: descriptor.name.clone(),
            config,
            client: reqwest::Client::new(),
        })
    }

    async fn run_process(&self, program: &Path, event: &HookEvent) -> anyhow::Result<HookVerdict> {
        let mut command = Command::new(program);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(cwd);
        }
        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(&event.to_runtime_json())?;
            if let Err(err) = stdin.write_all(&body).await {
                tracing::debug!("`{}` closed stdin early: {}", self.config.tool, err);
            }
        }
        let output = child.wait_with_output().await?;
        interpret_exit(
            &self.config.tool,
            output.status.code(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )
    }

    async fn post(&self, url: &str, event: &HookEvent) -> anyhow::Result<HookVerdict> {
        let response = self
            .client
            .post(url)
            .json(&event.to_runtime_json())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("`{}` answered HTTP {}", self.config.tool, status);
        }
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(HookVerdict::allow());
        }
        let value: Value = serde_json::from_str(&body)?;
        Ok(verdict_from_json(&value).unwrap_or_else(HookVerdict::allow))
    }
}

#[async_trait]
impl HookHandler for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, event: &HookEvent, ctx: &HookContext) -> anyhow::Result<HookVerdict> {
        let location = match ctx.tools.resolve(&self.config.tool).await {
            Ok(location) => location,
            Err(TollgateError::ToolUnavailable(tool)) if self.config.skip_when_unavailable => {
                ctx.log.warn("handler.tool_unavailable", "TOOL_UNAVAILABLE", &tool);
                return Ok(HookVerdict::allow_with(format!(
                    "skipped: tool `{tool}` is unavailable"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        ctx.log
            .debug("handler.tool_resolved", location.source(), &location.display());
        match location {
            ToolLocation::Local(path) | ToolLocation::Global(path) => {
                self.run_process(&path, event).await
            }
            ToolLocation::Remote(url) => self.post(&url, event).await,
        }
    }
}

/// `{"continue": bool}` or `{"decision": "approve" | "block"}`, with the
/// message taken from `reasoning`, `reason` or `message`.
fn verdict_from_json(value: &Value) -> Option<HookVerdict> {
    let proceed = match value.get("continue").and_then(Value::as_bool) {
        Some(flag) => flag,
        None => {
            let decision = value.get("decision").and_then(Value::as_str)?;
            !decision.eq_ignore_ascii_case("block")
        }
    };
    let message = ["reasoning", "reason", "message"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToString::to_string);
    Some(HookVerdict { proceed, message })
}

fn interpret_exit(
    tool: &str,
    code: Option<i32>,
    stdout: &str,
    stderr: &str,
) -> anyhow::Result<HookVerdict> {
    let stdout = stdout.trim();
    if stdout.starts_with('{') {
        if let Some(verdict) = serde_json::from_str::<Value>(stdout)
            .ok()
            .as_ref()
            .and_then(verdict_from_json)
        {
            return Ok(verdict);
        }
    }
    let stderr = stderr.trim();
    match code {
        Some(0) if stdout.is_empty() => Ok(HookVerdict::allow()),
        Some(0) => Ok(HookVerdict::allow_with(stdout)),
        Some(2) if stderr.is_empty() => Ok(HookVerdict::block(format!("blocked by `{tool}`"))),
        Some(2) => Ok(HookVerdict::block(stderr)),
        Some(other) => anyhow::bail!("`{tool}` exited with status {other}: {stderr}"),
        None => anyhow::bail!("`{tool}` was terminated by a signal"),
    }
}

// ---------------------------------------------------------------------------
// action_policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyRule {
    action: String,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl PolicyRule {
    fn matches(&self, event: &HookEvent) -> bool {
        if !wildcard_matches(
            &self.action.trim().to_ascii_lowercase(),
            &event.action_name.trim().to_ascii_lowercase(),
        ) {
            return false;
        }
        let Some(field) = self.field.as_deref() else {
            return true;
        };
        let Some(value) = event.payload_str(field) else {
            return false;
        };
        match self.pattern.as_deref() {
            Some(pattern) => wildcard_matches(pattern, value),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PolicyConfig {
    #[serde(default)]
    allow: Vec<PolicyRule>,
    #[serde(default)]
    deny: Vec<PolicyRule>,
}

/// Blocks actions matching a `deny` rule unless an `allow` rule also matches.
pub struct ActionPolicyHook {
    name: String,
    policy: PolicyConfig,
}

impl ActionPolicyHook {
    pub fn from_descriptor(descriptor: &HandlerDescriptor) -> anyhow::Result<Self> {
        Ok(Self {
            name: descriptor.name.clone(),
            policy: parse_config(descriptor)?,
        })
    }
}

#[async_trait]
impl HookHandler for ActionPolicyHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, event: &HookEvent, _ctx: &HookContext) -> anyhow::Result<HookVerdict> {
        if self.policy.allow.iter().any(|rule| rule.matches(event)) {
            return Ok(HookVerdict::allow());
        }
        match self.policy.deny.iter().find(|rule| rule.matches(event)) {
            Some(rule) => Ok(HookVerdict::block(rule.message.clone().unwrap_or_else(|| {
                format!("`{}` is denied by policy", event.action_name)
            }))),
            None => Ok(HookVerdict::allow()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{ProbeCandidate, ResolverOptions, ToolProbe, ToolResolver, ToolSpec};
    use serde_json::json;
    use std::sync::Arc;
    use tollgate_observability::{LogContext, ProcessKind};
    use tollgate_types::{EventKind, FailPolicy};

    struct FixedProbe(Option<ToolLocation>);

    #[async_trait]
    impl ToolProbe for FixedProbe {
        async fn probe(&self, _candidate: &ProbeCandidate) -> Option<ToolLocation> {
            self.0.clone()
        }
    }

    fn descriptor(kind: &str, config: Value) -> HandlerDescriptor {
        HandlerDescriptor {
            name: "gate".to_string(),
            handler_kind: kind.to_string(),
            event_kinds: vec![EventKind::PreAction],
            enabled: true,
            resource_pool: None,
            timeout_ms: 1_000,
            fail_policy: FailPolicy::Closed,
            config,
            actions: Vec::new(),
            description: String::new(),
        }
    }

    fn context(location: Option<ToolLocation>) -> HookContext {
        let resolver = ToolResolver::new(
            Arc::new(FixedProbe(location)),
            [ToolSpec::bare("checker")],
            ResolverOptions::default(),
        );
        HookContext::new(LogContext::detached(ProcessKind::Cli), resolver, Value::Null)
    }

    fn bash_event(command: &str) -> HookEvent {
        HookEvent::new(EventKind::PreAction, "Bash", json!({"command": command}), "ses")
    }

    #[test]
    fn exit_codes_map_to_verdicts() {
        assert_eq!(interpret_exit("t", Some(0), "", "").expect("ok"), HookVerdict::allow());
        let blocked = interpret_exit("t", Some(2), "", "tests are red\n").expect("block");
        assert_eq!(blocked, HookVerdict::block("tests are red"));
        assert!(interpret_exit("t", Some(1), "", "boom").is_err());
        assert!(interpret_exit("t", None, "", "").is_err());
    }

    #[test]
    fn json_stdout_wins_over_exit_code() {
        let verdict = interpret_exit(
            "t",
            Some(0),
            r#"{"continue": false, "reasoning": "lint failed"}"#,
            "",
        )
        .expect("verdict");
        assert_eq!(verdict, HookVerdict::block("lint failed"));

        let decision = interpret_exit("t", Some(0), r#"{"decision": "block", "reason": "no test"}"#, "")
            .expect("decision");
        assert_eq!(decision, HookVerdict::block("no test"));
    }

    #[test]
    fn command_hook_requires_a_tool() {
        assert!(CommandHook::from_descriptor(&descriptor("command", Value::Null)).is_err());
        assert!(CommandHook::from_descriptor(&descriptor("command", json!({"tool": "  "}))).is_err());
    }

    #[tokio::test]
    async fn unavailable_tool_is_skipped_with_a_message() {
        let hook = CommandHook::from_descriptor(&descriptor("command", json!({"tool": "checker"})))
            .expect("hook");
        let verdict = hook
            .evaluate(&bash_event("ls"), &context(None))
            .await
            .expect("verdict");
        assert!(verdict.proceed);
        assert!(verdict.message.unwrap_or_default().contains("skipped"));
    }

    #[tokio::test]
    async fn unavailable_tool_fails_when_skipping_is_off() {
        let hook = CommandHook::from_descriptor(&descriptor(
            "command",
            json!({"tool": "checker", "skipWhenUnavailable": false}),
        ))
        .expect("hook");
        assert!(hook.evaluate(&bash_event("ls"), &context(None)).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_receives_event_on_stdin() {
        let hook = CommandHook::from_descriptor(&descriptor(
            "command",
            json!({
                "tool": "checker",
                "args": ["-c", "grep -q '\"tool_name\":\"Bash\"' && echo '{\"continue\": false, \"reasoning\": \"saw Bash\"}'"]
            }),
        ))
        .expect("hook");
        let ctx = context(Some(ToolLocation::Global(PathBuf::from("/bin/sh"))));
        let verdict = hook.evaluate(&bash_event("ls"), &ctx).await.expect("verdict");
        assert_eq!(verdict, HookVerdict::block("saw Bash"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exit_two_blocks_with_stderr() {
        let hook = CommandHook::from_descriptor(&descriptor(
            "command",
            json!({"tool": "checker", "args": ["-c", "cat >/dev/null; echo 'write a test first' >&2; exit 2"]}),
        ))
        .expect("hook");
        let ctx = context(Some(ToolLocation::Global(PathBuf::from("/bin/sh"))));
        let verdict = hook.evaluate(&bash_event("ls"), &ctx).await.expect("verdict");
        assert_eq!(verdict, HookVerdict::block("write a test first"));
    }

    #[tokio::test]
    async fn policy_denies_matching_payload_unless_allowed() {
        let hook = ActionPolicyHook::from_descriptor(&descriptor(
            "action_policy",
            json!({
                "deny": [{"action": "Bash", "field": "command", "pattern": "*rm -rf*", "message": "no recursive deletes"}],
                "allow": [{"action": "Bash", "field": "command", "pattern": "rm -rf target*"}]
            }),
        ))
        .expect("hook");
        let ctx = context(None);

        let denied = hook.evaluate(&bash_event("sudo rm -rf /"), &ctx).await.expect("denied");
        assert_eq!(denied, HookVerdict::block("no recursive deletes"));

        let allowed = hook
            .evaluate(&bash_event("rm -rf target/debug"), &ctx)
            .await
            .expect("allowed");
        assert!(allowed.proceed);

        let other = hook.evaluate(&bash_event("ls"), &ctx).await.expect("other");
        assert!(other.proceed);
    }

    #[tokio::test]
    async fn policy_rule_without_field_matches_action_only() {
        let hook = ActionPolicyHook::from_descriptor(&descriptor(
            "action_policy",
            json!({"deny": [{"action": "Web*"}]}),
        ))
        .expect("hook");
        let event = HookEvent::new(EventKind::PreAction, "WebFetch", json!({}), "ses");
        let verdict = hook.evaluate(&event, &context(None)).await.expect("verdict");
        assert!(!verdict.proceed);
        assert!(verdict.message.unwrap_or_default().contains("WebFetch"));
    }
}
