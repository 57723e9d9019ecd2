use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::sync::workers::{ItemStatus, Progress, WorkItem, WorkerEvents};

/// Interactive prompts the session needs: yes/no style questions, secret
/// entry, and one-line milestones.
#[async_trait]
pub trait UserInterface: Send + Sync {
    /// Ask until one of `options` (case-insensitive) is entered; an empty
    /// answer picks `default` when there is one.
    async fn confirm(&self, prompt: &str, options: &[char], default: Option<char>) -> char;
    async fn input_secret(&self, prompt: &str) -> String;
    fn milestone(&self, message: &str);
}

pub struct Terminal;

#[async_trait]
impl UserInterface for Terminal {
    async fn confirm(&self, prompt: &str, options: &[char], default: Option<char>) -> char {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            eprint!("{prompt} ");
            let _ = std::io::stderr().flush();
            let answer = match lines.next_line().await {
                Ok(Some(line)) => line.trim().to_string(),
                // stdin closed, fall back to the safe answer
                _ => String::new(),
            };
            if answer.is_empty() {
                if let Some(default) = default {
                    return default;
                }
                continue;
            }
            let first = answer.chars().next().unwrap_or(' ').to_ascii_uppercase();
            if options
                .iter()
                .any(|option| option.to_ascii_uppercase() == first)
            {
                return first;
            }
        }
    }

    async fn input_secret(&self, prompt: &str) -> String {
        eprint!("{prompt} ");
        let _ = std::io::stderr().flush();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        match lines.next_line().await {
            Ok(Some(line)) => line.trim_end_matches(['\r', '\n']).to_string(),
            _ => String::new(),
        }
    }

    fn milestone(&self, message: &str) {
        eprintln!("[treesync] {message}");
    }
}

/// Renders a worker batch as a single rewritten status line and relays the
/// retry question to the interactive surface.
pub struct ConsoleReporter {
    pub title: String,
    pub ui: Arc<dyn UserInterface>,
}

#[async_trait]
impl WorkerEvents for ConsoleReporter {
    fn on_update(&self, items: &[WorkItem]) {
        let completed = items
            .iter()
            .filter(|item| {
                matches!(item.status, ItemStatus::Completed | ItemStatus::Ignored)
            })
            .count();
        let failed = items
            .iter()
            .filter(|item| item.status == ItemStatus::Failed)
            .count();
        let running: Vec<String> = items
            .iter()
            .filter(|item| item.status == ItemStatus::Running)
            .map(|item| match &item.progress {
                Some(Progress::Percent(pct)) => format!("{} {pct}%", item.name),
                Some(Progress::Tag(tag)) => format!("{} [{tag}]", item.name),
                None => item.name.clone(),
            })
            .collect();
        eprint!(
            "\r{}: {completed}/{} done, {failed} failed  {}          ",
            self.title,
            items.len(),
            running.join("  ")
        );
        let _ = std::io::stderr().flush();
    }

    async fn confirm_retry(&self, failed: &[String]) -> bool {
        eprintln!();
        for name in failed {
            eprintln!("  failed: {name}");
        }
        self.ui
            .confirm("Try again [Y/N]?", &['Y', 'N'], Some('Y'))
            .await
            == 'Y'
    }
}
