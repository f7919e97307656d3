//! External-process matcher.
//!
//! Each batch is written to a scratch file, the configured command is run
//! once with `{dictionary}` and `{input}` substituted into its arguments,
//! and stdout is parsed as `itemId<TAB>fieldId<TAB>termId[<TAB>...]`
//! lines. The child is killed when the timeout elapses.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use concept_index_core::error::MatcherError;
use concept_index_core::matcher::{MatchHit, MatchRequest, Matcher};

use crate::config::Config;

const STDERR_LIMIT: usize = 2000;

pub struct ProcessMatcher {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    work_dir: PathBuf,
}

impl ProcessMatcher {
    pub fn new(command: &str, args: &[String], timeout: Duration, work_dir: &Path) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            timeout,
            work_dir: work_dir.to_path_buf(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.matcher.command,
            &config.matcher.args,
            Duration::from_secs(config.matcher.timeout_secs),
            config.matcher.work_dir(&config.dictionary),
        )
    }

    fn render_args(&self, dictionary: &Path, input: &Path) -> Vec<String> {
        let dictionary = dictionary.to_string_lossy();
        let input = input.to_string_lossy();
        self.args
            .iter()
            .map(|a| {
                a.replace("{dictionary}", &dictionary)
                    .replace("{input}", &input)
            })
            .collect()
    }

    async fn write_batch(&self, path: &Path, batch: &[MatchRequest]) -> Result<(), MatcherError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let mut file = tokio::fs::File::create(path).await?;
        for request in batch {
            file.write_all(request.to_line().as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn run(&self, args: &[String]) -> Result<Vec<MatchHit>, MatcherError> {
        let child = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MatcherError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Err(MatcherError::Timeout(self.timeout.as_secs())),
        };

        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.len() > STDERR_LIMIT {
                let mut cut = STDERR_LIMIT;
                while !stderr.is_char_boundary(cut) {
                    cut -= 1;
                }
                stderr.truncate(cut);
            }
            return Err(MatcherError::Exit {
                code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut hits = Vec::new();
        let mut malformed = 0usize;
        for line in stdout.lines() {
            match MatchHit::parse_line(line) {
                Some(hit) => hits.push(hit),
                None if line.trim().is_empty() => {}
                None => malformed += 1,
            }
        }
        if malformed > 0 {
            warn!(
                command = %self.command,
                malformed,
                "skipped malformed matcher output lines"
            );
        }
        Ok(hits)
    }
}

#[async_trait]
impl Matcher for ProcessMatcher {
    async fn match_batch(
        &self,
        dictionary: &Path,
        batch: &[MatchRequest],
    ) -> Result<Vec<MatchHit>, MatcherError> {
        let input = self.work_dir.join(format!("batch-{}.tsv", Uuid::new_v4()));
        self.write_batch(&input, batch).await?;

        let args = self.render_args(dictionary, &input);
        let result = self.run(&args).await;

        if let Err(e) = tokio::fs::remove_file(&input).await {
            debug!(path = %input.display(), error = %e, "could not remove batch file");
        }
        if let Ok(hits) = &result {
            debug!(lines = batch.len(), hits = hits.len(), "matcher batch done");
        }
        result
    }
}
