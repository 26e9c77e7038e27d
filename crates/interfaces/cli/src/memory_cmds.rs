use std::io;
use std::io::IsTerminal;
use std::io::Write;

use anyhow::{Result, bail};

use hearth_memory::{MemoryManager, truncate_for_display};

const LIST_PREVIEW_CHARS: usize = 100;

/// Ask for a typed confirmation.  Refuses outright when stdin is not a
/// terminal.
fn confirm(prompt: &str, expected: &[&str], action: &str) -> Result<bool> {
    if !io::stdin().is_terminal() {
        bail!("refusing {action} in non-interactive mode without --yes");
    }
    print!("{prompt}");
    io::stdout().flush()?;

    let mut confirmation = String::new();
    io::stdin().read_line(&mut confirmation)?;
    Ok(expected.contains(&confirmation.trim()))
}

pub(crate) fn run_memory_list(memory: &MemoryManager) -> Result<()> {
    let episodes = memory.list_episodes()?;
    if episodes.is_empty() {
        println!("(no episodes)");
        return Ok(());
    }
    println!("── episodes ─────────────────────────────────────────");
    for ep in &episodes {
        println!(
            "  [{:>4}] {}  {:<24} {}",
            ep.id,
            ep.created_at.format("%Y-%m-%d %H:%M"),
            ep.source,
            truncate_for_display(&ep.content, LIST_PREVIEW_CHARS)
        );
    }
    println!("total: {}", episodes.len());
    Ok(())
}

pub(crate) async fn run_memory_delete(memory: &MemoryManager, id: i64, yes: bool) -> Result<()> {
    let Some(episode) = memory.keyword().get(id)? else {
        println!("no episode with id {id}");
        return Ok(());
    };

    println!("episode {id} ({}):", episode.source);
    println!("  {}", episode.content);
    if !yes && !confirm("Delete this episode? [y/N]: ", &["y", "Y", "yes"], "delete")? {
        println!("delete cancelled");
        return Ok(());
    }

    memory.delete_episode(id).await?;
    println!("episode {id} deleted; vector index rebuilt ({} chunks)", memory.vector().len());
    Ok(())
}

pub(crate) fn run_memory_stats(memory: &MemoryManager) -> Result<()> {
    let stats = memory.stats()?;
    println!("── keyword index ────────────────────────────────────");
    println!("  episodes:   {}", stats.episodes);
    for (source, count) in &stats.episodes_by_source {
        println!("    {source}: {count}");
    }

    println!();
    println!("── vector index ─────────────────────────────────────");
    println!("  chunks:     {}", stats.chunks);
    println!("  lore:       {}", stats.lore_chunks);
    println!("  episodes:   {}", stats.chunks - stats.lore_chunks);
    println!("  file size:  {:.1} KiB", stats.vector_file_bytes as f64 / 1024.0);

    println!();
    println!("── response cache ───────────────────────────────────");
    println!("  entries:    {}", stats.cache.entries);
    println!("  hits:       {}", stats.cache.hits);
    println!("  misses:     {}", stats.cache.misses);
    println!("  hit rate:   {:.1}%", stats.cache.hit_rate_pct);
    Ok(())
}

pub(crate) async fn run_memory_rebuild(memory: &MemoryManager) -> Result<()> {
    println!("rebuilding vector index...");
    let chunks = memory.rebuild_vector_index().await?;
    if chunks == 0 {
        println!("vector index is empty (no sources, or embedding model unavailable)");
    } else {
        println!("vector index rebuilt: {chunks} chunks");
    }
    Ok(())
}

pub(crate) async fn run_memory_clear(memory: &MemoryManager, yes: bool) -> Result<()> {
    let total = memory.keyword().count()?;
    println!("⚠️  destructive operation: clear all episodes");
    println!("- episodes: {total}");
    if total == 0 {
        println!("no episodes to clear");
        return Ok(());
    }

    if !yes
        && !confirm(
            "This permanently deletes every episode. Type 'DELETE ALL' to continue: ",
            &["DELETE ALL"],
            "clear",
        )?
    {
        println!("memory clear cancelled");
        return Ok(());
    }

    let removed = memory.clear_all().await?;
    println!("memory cleared: removed {removed} episodes");
    println!("vector index now holds {} lore chunks", memory.vector().len());
    Ok(())
}

pub(crate) async fn run_memory_ingest(memory: &MemoryManager, dir: &str) -> Result<()> {
    let added = memory.ingest_dir(dir).await?;
    println!("ingested {added} episodes from {dir}");
    Ok(())
}
