//! Static lore files and the chunking applied before they are embedded.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::schema::Chunk;

/// Paragraphs up to this many characters are indexed whole.
pub const PARAGRAPH_MAX_CHARS: usize = 250;

/// Split lore text into indexable pieces.
///
/// Paragraphs (blank-line separated) that fit within
/// [`PARAGRAPH_MAX_CHARS`] stay whole.  Longer paragraphs are cut at `". "`
/// into overlapping two-sentence windows; when the sentence count is odd the
/// final sentence is also emitted on its own.
pub fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    for para in text.trim().split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if para.chars().count() <= PARAGRAPH_MAX_CHARS {
            chunks.push(para.to_string());
            continue;
        }

        let sentences: Vec<&str> = para
            .split(". ")
            .map(|s| s.trim().trim_end_matches('.'))
            .filter(|s| !s.is_empty())
            .collect();

        match sentences.len() {
            0 => {}
            1 => chunks.push(format!("{}.", sentences[0])),
            n => {
                for pair in sentences.windows(2) {
                    chunks.push(format!("{}. {}.", pair[0], pair[1]));
                }
                if n % 2 == 1 {
                    chunks.push(format!("{}.", sentences[n - 1]));
                }
            }
        }
    }
    chunks
}

/// Read and chunk one lore file.  A missing file contributes nothing.
pub fn load_lore_file(source: &str, path: &Path) -> Result<Vec<Chunk>> {
    if !path.exists() {
        debug!(source, path = %path.display(), "lore file not found");
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading lore file {}", path.display()))?;
    Ok(chunk_text(&raw)
        .into_iter()
        .map(|text| Chunk::new(source, text))
        .collect())
}

/// Chunk every configured lore source in order.
pub fn collect_lore(sources: &[(String, PathBuf)]) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    for (source, path) in sources {
        let loaded = load_lore_file(source, path)?;
        debug!(source = %source, chunks = loaded.len(), "lore chunked");
        chunks.extend(loaded);
    }
    Ok(chunks)
}

/// Starter content written by `hearth init` for files that do not exist yet.
pub fn default_lore(source: &str, agent: &str, user: &str) -> Option<String> {
    let body = match source {
        "lore/self" => format!(
            "{agent} is a warm, curious companion who remembers what matters to {user}.\n\n\
             {agent} speaks plainly, asks follow-up questions, and admits when something is forgotten.\n"
        ),
        "lore/user" => format!(
            "{user} is the person {agent} talks with every day.\n\n\
             Details about {user} are learned gradually through conversation.\n"
        ),
        "lore/relationship" => format!(
            "{agent} and {user} have an ongoing friendship built on many conversations.\n\n\
             {agent} is sometimes physically present with {user} and sometimes talks over messages.\n"
        ),
        "semantic/memory" => "# Long-term notes\n".to_string(),
        _ => return None,
    };
    Some(body)
}

/// Write starter content for every known source whose file is missing.
/// Existing files are never overwritten.  Returns how many were created.
pub fn seed_lore_files(sources: &[(String, PathBuf)], agent: &str, user: &str) -> Result<usize> {
    let mut created = 0;
    for (source, path) in sources {
        if path.exists() {
            continue;
        }
        let Some(body) = default_lore(source, agent, user) else {
            continue;
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, body).with_context(|| format!("writing {}", path.display()))?;
        created += 1;
    }
    Ok(created)
}
