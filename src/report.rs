use std::path::PathBuf;
use std::process::Stdio;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use crate::config::ReportConfig;
use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct Failure {
    pub plugin: String,
    pub subscription: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

impl Failure {
    pub fn new(plugin: &str, subscription: &str, error: &AppError) -> Self {
        Self {
            plugin: plugin.to_string(),
            subscription: subscription.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        }
    }
}

/// Collects scheduler failures: stderr, optional per-subscription error
/// files, and an optional HTML mail at the end of a run.
pub struct Reporter {
    config: ReportConfig,
    failures: Vec<Failure>,
}

impl Reporter {
    pub fn new(config: ReportConfig) -> Self {
        Self {
            config,
            failures: Vec::new(),
        }
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub async fn record(&mut self, failure: Failure) {
        eprintln!(
            "[{}] {}:{} failed: {}",
            failure.at.format("%Y-%m-%d %H:%M:%S"),
            failure.plugin,
            failure.subscription,
            failure.error
        );

        if let Some(path) = self.error_file(&failure) {
            if let Err(e) = self.write_error_file(&path, &failure).await {
                error!(path = %path.display(), error = %e, "failed to write error file");
            }
        }
        self.failures.push(failure);
    }

    fn error_file(&self, failure: &Failure) -> Option<PathBuf> {
        let dir = self.config.error_directory.as_ref()?;
        let name = format!("{}-{}.txt", failure.plugin, failure.subscription)
            .replace(['/', '\\'], "_");
        Some(dir.join(name))
    }

    async fn write_error_file(&self, path: &PathBuf, failure: &Failure) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = format!("{}\n{}\n", failure.at.to_rfc3339(), failure.error);
        tokio::fs::write(path, body).await?;
        Ok(())
    }

    pub fn html_summary(&self) -> String {
        let mut html = String::from("<html><body><h2>Failed subscriptions</h2><ul>\n");
        for failure in &self.failures {
            html.push_str(&format!(
                "<li><b>{}:{}</b> at {}<pre>{}</pre></li>\n",
                escape(&failure.plugin),
                escape(&failure.subscription),
                failure.at.format("%Y-%m-%d %H:%M:%S UTC"),
                escape(&failure.error)
            ));
        }
        html.push_str("</ul></body></html>\n");
        html
    }

    /// Mails the summary through sendmail when a recipient is configured and
    /// something failed.
    pub async fn send(&self) -> Result<()> {
        let Some(to) = self.config.sendmail_to.as_deref() else {
            return Ok(());
        };
        if self.failures.is_empty() {
            return Ok(());
        }

        let message = format!(
            "To: {}\nSubject: feedhoard: {} subscription(s) failed\nMIME-Version: 1.0\nContent-Type: text/html; charset=utf-8\n\n{}",
            to,
            self.failures.len(),
            self.html_summary()
        );

        let mut child = tokio::process::Command::new(&self.config.sendmail_path)
            .arg(to)
            .stdin(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(anyhow::anyhow!("sendmail exited with {}", status).into());
        }
        info!(to, failures = self.failures.len(), "sent failure report");
        Ok(())
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
