//! `portal ingest`: feed files through document processing, chunk by chunk
//!
//! Each chunk goes to a separate `portal process-document` process so a
//! hung extraction call can be cut off by a timeout without taking the whole
//! run down with it.

use anyhow::{bail, Context};
use async_trait::async_trait;
use portal_core::{chunk_content, DocumentOutcome, DocumentRequest, SuggestedCoreUpdate, MAX_CHUNK_SIZE};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(120);
pub const CHUNK_PAUSE: Duration = Duration::from_millis(500);
const SUPPORTED_EXTENSIONS: &[&str] = &["md", "txt"];

/// Runs one chunk through document processing
#[async_trait]
pub trait ChunkProcessor: Send + Sync {
    async fn process(&self, request: &DocumentRequest) -> anyhow::Result<DocumentOutcome>;
}

/// Spawns this binary's `process-document` subcommand for every chunk
pub struct CommandProcessor {
    program: PathBuf,
    /// Global flags forwarded ahead of the subcommand
    global_args: Vec<String>,
    /// Secrets travel through the environment, never argv
    envs: Vec<(String, String)>,
    timeout: Duration,
}

impl CommandProcessor {
    pub fn current_exe(global_args: Vec<String>) -> anyhow::Result<Self> {
        Ok(Self {
            program: std::env::current_exe().context("Cannot locate the portal binary")?,
            global_args,
            envs: Vec::new(),
            timeout: CHUNK_TIMEOUT,
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl ChunkProcessor for CommandProcessor {
    async fn process(&self, request: &DocumentRequest) -> anyhow::Result<DocumentOutcome> {
        let payload = serde_json::to_string(request)?;

        let child = tokio::process::Command::new(&self.program)
            .args(&self.global_args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .arg("process-document")
            .arg(payload)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .with_context(|| format!("process-document timed out after {:?}", self.timeout))?
            .context("Failed to spawn process-document")?;

        if !output.status.success() {
            bail!(
                "process-document exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        serde_json::from_slice(&output.stdout).context("process-document printed invalid JSON")
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub document_type: String,
    pub dry_run: bool,
    pub pause: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            document_type: "dialogue".to_string(),
            dry_run: false,
            pause: CHUNK_PAUSE,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestSummary {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub memories: usize,
    pub links: usize,
    pub tokens: u64,
    /// Unique by `target_file:section`, first one wins
    pub suggested_updates: Vec<SuggestedCoreUpdate>,
}

enum FileResult {
    Processed {
        memories: usize,
        links: usize,
        tokens: u64,
        suggestions: Vec<SuggestedCoreUpdate>,
    },
    Skipped,
    Failed,
}

/// Every file under `root` (or `root` itself), in a stable order
pub fn collect_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    if !root.is_dir() {
        bail!("Path not found: {}", root.display());
    }

    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("Cannot read {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for path in entries {
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub async fn ingest(
    root: &Path,
    processor: &dyn ChunkProcessor,
    options: &IngestOptions,
) -> anyhow::Result<IngestSummary> {
    let files = collect_files(root)?;
    println!("Found {} file(s) under {}", files.len(), root.display());

    let mut summary = IngestSummary::default();
    let mut seen_suggestions = HashSet::new();

    for file in &files {
        match ingest_file(file, processor, options).await {
            FileResult::Processed {
                memories,
                links,
                tokens,
                suggestions,
            } => {
                summary.processed += 1;
                summary.memories += memories;
                summary.links += links;
                summary.tokens += tokens;
                for update in suggestions {
                    let key = format!("{}:{}", update.target_file, update.section);
                    if seen_suggestions.insert(key) {
                        summary.suggested_updates.push(update);
                    }
                }
            }
            FileResult::Skipped => summary.skipped += 1,
            FileResult::Failed => summary.failed += 1,
        }
    }

    Ok(summary)
}

async fn ingest_file(
    path: &Path,
    processor: &dyn ChunkProcessor,
    options: &IngestOptions,
) -> FileResult {
    if !is_supported(path) {
        tracing::warn!(path = %path.display(), "Skipping unsupported file type");
        return FileResult::Skipped;
    }

    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read file");
            return FileResult::Failed;
        }
    };
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    println!("Processing {} ({} chars)", path.display(), content.chars().count());

    let chunks = chunk_content(&content, MAX_CHUNK_SIZE);
    if options.dry_run {
        println!("  dry run: would send {} chunk(s) as type {}", chunks.len(), options.document_type);
        return FileResult::Skipped;
    }

    let total = chunks.len();
    let mut memories = 0;
    let mut links = 0;
    let mut tokens = 0u64;
    let mut suggestions = Vec::new();
    let mut succeeded = 0usize;

    for (i, chunk) in chunks.into_iter().enumerate() {
        let request = DocumentRequest {
            content: chunk,
            document_name: if total > 1 {
                format!("{name} (Part {}/{total})", i + 1)
            } else {
                name.clone()
            },
            document_type: Some(options.document_type.clone()),
            auto_store: true,
        };

        match processor.process(&request).await {
            Ok(DocumentOutcome::Processed(result)) => {
                succeeded += 1;
                memories += result.memories_extracted;
                links += result.links_extracted;
                tokens += u64::from(result.tokens_used);
                suggestions.extend(result.suggested_core_updates);
                if total > 1 {
                    println!(
                        "  part {}/{total}: +{} memories, +{} links",
                        i + 1,
                        result.memories_extracted,
                        result.links_extracted
                    );
                }
            }
            Ok(DocumentOutcome::Failed(failure)) => {
                let preview: String = failure.raw_output.chars().take(300).collect();
                tracing::warn!(chunk = %request.document_name, error = %failure.error, raw = %preview, "Chunk failed");
            }
            Err(e) => {
                tracing::warn!(chunk = %request.document_name, error = %e, "Chunk failed");
            }
        }

        if i + 1 < total {
            tokio::time::sleep(options.pause).await;
        }
    }

    // One good chunk is enough, even if it yielded no memories
    if succeeded == 0 {
        return FileResult::Failed;
    }

    println!("  total: {memories} memories, {links} links, {tokens} tokens");
    FileResult::Processed {
        memories,
        links,
        tokens,
        suggestions,
    }
}

pub fn print_summary(summary: &IngestSummary) {
    if !summary.suggested_updates.is_empty() {
        println!();
        println!("Suggested core updates:");
        for update in &summary.suggested_updates {
            println!("  - {}: {}", update.target_file, update.section);
        }
    }

    println!();
    println!("Files processed:  {}", summary.processed);
    println!("Files failed:     {}", summary.failed);
    println!("Files skipped:    {}", summary.skipped);
    println!("Memories created: {}", summary.memories);
    println!("Links created:    {}", summary.links);
    println!("Tokens used:      {}", summary.tokens);
}
