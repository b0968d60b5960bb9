//! Shell commands run when an experiment finishes, configured in the rcfile.
use std::borrow::Cow;

use anyhow::Context;
use bstr::ByteSlice;

use crate::Map;
use crate::common::config::Config;

pub const NAME_CODE_PLACEHOLDER: &str = "NAME_CODE";
pub const REPORT_URL_PLACEHOLDER: &str = "REPORT_URL";
pub const FAILED_STAGE_PLACEHOLDER: &str = "FAILED_STAGE";
pub const FAILED_JOB_PLACEHOLDER: &str = "FAILED_JOB";
pub const EXCEPTION_MESSAGE_PLACEHOLDER: &str = "EXCEPTION_MESSAGE";

type PlaceholderMap<'a> = Map<&'static str, Cow<'a, str>>;

/// What went wrong, for the error notification.
#[derive(Debug, Default, Clone)]
pub struct Failure {
    pub stage: Option<String>,
    pub job: Option<String>,
    pub message: Option<String>,
}

/// Replaces `{PLACEHOLDER}` occurrences, unknown placeholders are kept as they are.
fn fill_placeholders(template: &str, placeholders: &PlaceholderMap) -> String {
    let mut result = template.to_string();
    for (key, value) in placeholders {
        result = result.replace(&format!("{{{key}}}"), value);
    }
    result
}

pub struct FailureNotifier {
    on_error: Option<String>,
    on_success: Option<String>,
    name_code: String,
    report_url: String,
}

impl FailureNotifier {
    /// Without `enabled`, no command is ever run.
    pub fn new(config: &Config, name_code: &str, enabled: bool) -> Self {
        let (on_error, on_success) = if enabled {
            (
                config.notification_command_on_error.clone(),
                config.notification_command_on_success.clone(),
            )
        } else {
            (None, None)
        };
        Self {
            on_error,
            on_success,
            name_code: name_code.to_string(),
            report_url: config.report_url(name_code),
        }
    }

    fn placeholders(&self) -> PlaceholderMap<'_> {
        let mut placeholders = PlaceholderMap::new();
        placeholders.insert(NAME_CODE_PLACEHOLDER, self.name_code.as_str().into());
        placeholders.insert(REPORT_URL_PLACEHOLDER, self.report_url.as_str().into());
        placeholders
    }

    pub fn error_command(&self, failure: &Failure) -> Option<String> {
        let template = self.on_error.as_ref()?;
        let mut placeholders = self.placeholders();
        placeholders.insert(
            FAILED_STAGE_PLACEHOLDER,
            failure.stage.as_deref().unwrap_or_default().into(),
        );
        placeholders.insert(
            FAILED_JOB_PLACEHOLDER,
            failure.job.as_deref().unwrap_or_default().into(),
        );
        placeholders.insert(
            EXCEPTION_MESSAGE_PLACEHOLDER,
            failure.message.as_deref().unwrap_or_default().into(),
        );
        Some(fill_placeholders(template, &placeholders))
    }

    pub fn success_command(&self) -> Option<String> {
        let template = self.on_success.as_ref()?;
        Some(fill_placeholders(template, &self.placeholders()))
    }

    /// A failing notification command is only logged.
    pub async fn notify_error(&self, failure: &Failure) {
        if let Some(command) = self.error_command(failure) {
            run_notification(&command).await;
        }
    }

    pub async fn notify_success(&self) {
        if let Some(command) = self.success_command() {
            run_notification(&command).await;
        }
    }
}

async fn run_notification(command: &str) {
    if let Err(error) = run_shell(command).await {
        log::error!("Notification command failed: {error:?}");
    }
}

async fn run_shell(command: &str) -> anyhow::Result<()> {
    log::debug!("Running notification `{command}`");
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .context("Cannot start notification command")?;
    if !output.status.success() {
        anyhow::bail!(
            "Exit code: {}\nStderr: {}",
            output.status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim()
        );
    }
    Ok(())
}
