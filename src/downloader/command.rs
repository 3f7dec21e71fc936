//! Backend that shells out to an external downloader program.
//!
//! Arguments are templates; `{dest}`, `{isrc}`, `{artist}`, `{title}`,
//! `{album}`, `{year}`, `{album_url}` and `{query}` are substituted per
//! request. Exit code 0 means success, `rate_limit_exit_code` means the
//! service throttled us, anything else is a failure. Whatever the program
//! leaves in the destination is checked with the matcher before it counts.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::{DownloadRequest, DownloadResult, DownloadStatus, Downloader};
use crate::config::{DownloaderConfig, MatchingConfig};
use crate::error::{Error, Result};
use crate::matching::{self, Candidate, MatchResult, Thresholds};
use crate::metadata;

const STDERR_TAIL_CHARS: usize = 300;

pub struct CommandDownloader {
    name: String,
    priority: i32,
    max_concurrent: usize,
    program: String,
    args: Vec<String>,
    match_args: Vec<String>,
    timeout: Duration,
    rate_limit_exit_code: Option<i32>,
    thresholds: Thresholds,
    min_confidence: f32,
}

impl CommandDownloader {
    pub fn from_config(config: &DownloaderConfig, matching: &MatchingConfig) -> Result<Self> {
        let program = config
            .program
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                Error::download(format!("downloader '{}' needs program", config.name))
            })?;
        Ok(Self {
            name: config.name.clone(),
            priority: config.priority,
            max_concurrent: config.max_concurrent.max(1),
            program,
            args: config.args.clone(),
            match_args: config.match_args.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            rate_limit_exit_code: config.rate_limit_exit_code,
            thresholds: matching.thresholds(),
            min_confidence: matching.min_download_confidence,
        })
    }

    fn render(&self, templates: &[String], destination: &Path, request: &DownloadRequest) -> Vec<String> {
        templates
            .iter()
            .map(|arg| render_arg(arg, destination, request))
            .collect()
    }

    /// Run the program; `Err` carries the status to report.
    async fn run(&self, args: &[String]) -> std::result::Result<std::process::Output, DownloadResult> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(backend = %self.name, program = %self.program, ?args, "Running downloader");

        match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => Err(DownloadResult::failure(
                DownloadStatus::Timeout,
                format!("{} did not finish within {:?}", self.program, self.timeout),
            )),
            Ok(Err(e)) => Err(DownloadResult::failure(
                DownloadStatus::Failed,
                format!("failed to run {}: {e}", self.program),
            )),
            Ok(Ok(output)) => {
                let code = output.status.code();
                if output.status.success() {
                    Ok(output)
                } else if code.is_some() && code == self.rate_limit_exit_code {
                    Err(DownloadResult::failure(
                        DownloadStatus::RateLimited,
                        format!("{} reported rate limiting", self.program),
                    ))
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    Err(DownloadResult::failure(
                        DownloadStatus::Failed,
                        format!(
                            "{} exited with {}: {}",
                            self.program,
                            code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                            tail(stderr.trim(), STDERR_TAIL_CHARS)
                        ),
                    ))
                }
            }
        }
    }

    /// Score what the program left behind.
    async fn verify(&self, destination: PathBuf, request: &DownloadRequest) -> DownloadResult {
        let request = request.clone();
        let thresholds = self.thresholds;
        let dir = destination.clone();
        let scored = tokio::task::spawn_blocking(move || {
            let target = request.as_track();
            let files: Vec<PathBuf> = walkdir::WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && metadata::is_audio_file(e.path()))
                .map(|e| e.into_path())
                .collect();
            let best = files
                .iter()
                .map(|f| {
                    let meta = metadata::read_or_guess(f);
                    let isrc_hit = target.has_isrc() && meta.isrc.as_deref() == Some(target.isrc.as_str());
                    if isrc_hit {
                        1.0
                    } else {
                        matching::score(&meta.to_candidate(), &target)
                    }
                })
                .fold(0.0f32, f32::max);
            (files, MatchResult::scored(best, &thresholds, None))
        })
        .await;

        let (files, result) = match scored {
            Ok(scored) => scored,
            Err(e) => {
                return DownloadResult::failure(DownloadStatus::Failed, format!("verification failed: {e}"));
            }
        };

        if files.is_empty() {
            return DownloadResult::failure(DownloadStatus::NotFound, "program produced no audio files");
        }
        if !result.is_acceptable(self.min_confidence) {
            let message = format!(
                "downloaded files scored {:.2}, below {:.2}",
                result.confidence, self.min_confidence
            );
            return DownloadResult::failure(DownloadStatus::NotFound, message).with_match(result);
        }
        DownloadResult::success(destination, files).with_match(result)
    }
}

fn render_arg(template: &str, destination: &Path, request: &DownloadRequest) -> String {
    let year = if request.year > 0 {
        request.year.to_string()
    } else {
        String::new()
    };
    template
        .replace("{dest}", &destination.to_string_lossy())
        .replace("{isrc}", &request.isrc)
        .replace("{artist}", &request.artist)
        .replace("{title}", &request.title)
        .replace("{album}", &request.album)
        .replace("{year}", &year)
        .replace("{album_url}", &request.album_url)
        .replace("{query}", &request.query())
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Parse `artist<TAB>title<TAB>album<TAB>year<TAB>locator` lines.
fn parse_candidates(stdout: &str) -> Vec<(Candidate, Option<String>)> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let mut fields = line.split('\t').map(str::trim);
            let mut next = || fields.next().unwrap_or_default().to_string();
            let candidate = Candidate {
                artist: next(),
                title: next(),
                album: next(),
                year: next().parse().unwrap_or(0),
            };
            let locator = Some(next()).filter(|l| !l.is_empty());
            (candidate, locator)
        })
        .collect()
}

/// Whether `program` resolves to a file, directly or via `PATH`.
fn program_exists(program: &str) -> bool {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return direct.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

#[async_trait]
impl Downloader for CommandDownloader {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    async fn validate_credentials(&self) -> bool {
        program_exists(&self.program)
    }

    async fn match_track(&self, request: &DownloadRequest) -> MatchResult {
        if self.match_args.is_empty() {
            // No search mode: content is checked after download instead
            return MatchResult::scored(1.0, &self.thresholds, None)
                .with_evidence("verification", "after_download");
        }

        let args = self.render(&self.match_args, Path::new(""), request);
        let output = match self.run(&args).await {
            Ok(output) => output,
            Err(failure) => {
                tracing::warn!(backend = %self.name, status = %failure.status, "Search failed: {}", failure.error_message);
                return MatchResult::not_found();
            }
        };

        let target = request.as_track();
        parse_candidates(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .map(|(candidate, locator)| matching::evaluate(&candidate, &target, &self.thresholds, locator))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .unwrap_or_else(MatchResult::not_found)
    }

    async fn enqueue(&self, destination: &Path, request: &DownloadRequest) -> DownloadResult {
        if let Err(e) = tokio::fs::create_dir_all(destination).await {
            return DownloadResult::failure(
                DownloadStatus::Failed,
                format!("cannot create {:?}: {e}", destination),
            );
        }

        let args = self.render(&self.args, destination, request);
        match self.run(&args).await {
            Ok(_) => self.verify(destination.to_path_buf(), request).await,
            Err(failure) => failure,
        }
    }
}
