use super::pool::WorkerPool;
use super::{
    BlockRender, Fragment, FragmentOrigin, RenderError, RenderOutput, RenderStats, cached_fragment,
    render_guarded, render_sequential, settle,
};
use crate::block::Block;
use crate::cache::BlockCache;
use crate::hash::ContentHash;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Instant;

pub const DEFAULT_PARALLEL_THRESHOLD: usize = 3;

/// Renders cache misses on the worker pool and merges them back in block order.
///
/// Cache hits are resolved here without touching the pool. When fewer than
/// `threshold` distinct blocks miss, the whole pass runs on `local` through
/// [`render_sequential`] instead.
pub fn render_parallel(
    blocks: &[Block],
    cache: &BlockCache,
    pool: &WorkerPool,
    local: &mut dyn BlockRender,
    threshold: usize,
) -> RenderOutput {
    let mut pending: Vec<ContentHash> = Vec::new();
    for block in blocks {
        if !cache.contains(&block.content_hash) && !pending.contains(&block.content_hash) {
            pending.push(block.content_hash);
        }
    }
    if pending.len() < threshold.max(1) {
        return render_sequential(blocks, cache, local);
    }

    let started = Instant::now();
    let mut stats = RenderStats {
        blocks: blocks.len(),
        ..RenderStats::default()
    };
    let mut slots: Vec<Option<Fragment>> = vec![None; blocks.len()];

    // Distinct misses in first-seen order; every block sharing a hash is
    // served from the one render.
    let mut jobs: Vec<(ContentHash, Vec<usize>)> = Vec::new();
    let mut job_of: HashMap<ContentHash, usize> = HashMap::new();
    for (i, block) in blocks.iter().enumerate() {
        if let Some(html) = cache.get(&block.content_hash) {
            stats.cache_hits += 1;
            slots[i] = Some(cached_fragment(block, html));
            continue;
        }
        match job_of.get(&block.content_hash) {
            Some(&job) => jobs[job].1.push(i),
            None => {
                job_of.insert(block.content_hash, jobs.len());
                jobs.push((block.content_hash, vec![i]));
            }
        }
    }

    let (reply, results) = mpsc::channel();
    let mut outcomes: Vec<Option<Result<String, RenderError>>> = Vec::with_capacity(jobs.len());
    for (slot, (_, members)) in jobs.iter().enumerate() {
        let block = &blocks[members[0]];
        if pool.submit(slot, Arc::from(block.raw_text.as_str()), reply.clone()) {
            outcomes.push(None);
        } else {
            outcomes.push(Some(render_guarded(local, &block.raw_text)));
        }
    }
    drop(reply);

    for (slot, result) in results {
        if let Some(outcome) = outcomes.get_mut(slot) {
            *outcome = Some(result);
        }
    }

    for ((_, members), outcome) in jobs.iter().zip(outcomes) {
        let result = outcome
            .unwrap_or_else(|| Err(RenderError::Backend("render worker exited".to_string())));
        let first = &blocks[members[0]];
        let fragment = settle(first, result, cache, &mut stats);
        for &dup in &members[1..] {
            let origin = match fragment.origin {
                FragmentOrigin::Fallback => {
                    stats.fallbacks += 1;
                    FragmentOrigin::Fallback
                }
                _ => {
                    stats.cache_hits += 1;
                    FragmentOrigin::Cached
                }
            };
            slots[dup] = Some(Fragment {
                index: dup,
                hash: fragment.hash,
                html: Arc::clone(&fragment.html),
                origin,
            });
        }
        slots[members[0]] = Some(fragment);
    }

    stats.workers = pool.size().min(jobs.len());
    stats.duration = started.elapsed();
    tracing::debug!(
        target: "adocview::render",
        misses = jobs.len(),
        workers = stats.workers,
        elapsed_ms = stats.duration.as_millis() as u64,
        "parallel pass done"
    );

    let fragments = slots
        .into_iter()
        .zip(blocks)
        .map(|(slot, block)| {
            slot.unwrap_or_else(|| {
                settle(
                    block,
                    Err(RenderError::Backend("block was not scheduled".to_string())),
                    cache,
                    &mut stats,
                )
            })
        })
        .collect();

    RenderOutput { fragments, stats }
}
