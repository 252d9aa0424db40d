use super::{BlockRender, RenderOutput, RenderStats, cached_fragment, render_guarded, settle};
use crate::block::Block;
use crate::cache::BlockCache;
use std::time::Instant;

/// Renders blocks in order on the calling thread, reusing cached fragments.
///
/// Blocks with identical content are rendered once: the first occurrence
/// fills the cache and later ones hit it.
pub fn render_sequential(
    blocks: &[Block],
    cache: &BlockCache,
    renderer: &mut dyn BlockRender,
) -> RenderOutput {
    let started = Instant::now();
    let mut stats = RenderStats {
        blocks: blocks.len(),
        ..RenderStats::default()
    };
    let mut fragments = Vec::with_capacity(blocks.len());

    for block in blocks {
        if let Some(html) = cache.get(&block.content_hash) {
            stats.cache_hits += 1;
            fragments.push(cached_fragment(block, html));
            continue;
        }
        let result = render_guarded(renderer, &block.raw_text);
        fragments.push(settle(block, result, cache, &mut stats));
    }

    stats.duration = started.elapsed();
    RenderOutput { fragments, stats }
}

#[cfg(test)]
mod tests {
    use super::render_sequential;
    use crate::block::split;
    use crate::cache::BlockCache;
    use crate::render::testing::CountingFactory;
    use crate::render::{FragmentOrigin, RendererFactory};

    const DOC: &str = "= Title\n\nPara one.\n\n== Section\n\nPara two.";

    #[test]
    fn second_pass_is_all_cache_hits() {
        let factory = CountingFactory::default();
        let mut renderer = factory.create().unwrap();
        let cache = BlockCache::new(16).unwrap();
        let blocks = split(DOC);

        let first = render_sequential(&blocks, &cache, renderer.as_mut());
        assert_eq!(factory.calls(), 2);
        assert_eq!(first.stats.rendered, 2);

        let second = render_sequential(&blocks, &cache, renderer.as_mut());
        assert_eq!(factory.calls(), 2);
        assert_eq!(second.stats.cache_hits, 2);
        let html = |out: &crate::render::RenderOutput| {
            out.fragments.iter().map(|f| f.html.to_string()).collect::<Vec<_>>()
        };
        assert_eq!(html(&first), html(&second));
        assert!(second.fragments.iter().all(|f| f.origin == FragmentOrigin::Cached));
    }

    #[test]
    fn only_edited_block_is_rerendered() {
        let factory = CountingFactory::default();
        let mut renderer = factory.create().unwrap();
        let cache = BlockCache::new(16).unwrap();

        render_sequential(&split("== A\na\n== B\nb\n== C\nc\n"), &cache, renderer.as_mut());
        assert_eq!(factory.calls(), 3);

        let blocks = split("== A\na\n== B\nbb\n== C\nc\n");
        let out = render_sequential(&blocks, &cache, renderer.as_mut());
        assert_eq!(factory.calls(), 4);
        assert_eq!(out.stats.cache_hits, 2);
        assert_eq!(out.fragments[1].html.as_ref(), "<r>== B\nbb</r>");
    }

    #[test]
    fn failing_block_falls_back_to_escaped_source() {
        let factory = CountingFactory {
            fail_on: Some("<boom>"),
            ..CountingFactory::default()
        };
        let mut renderer = factory.create().unwrap();
        let cache = BlockCache::new(16).unwrap();
        let blocks = split("== 0\n== 1\n== 2 <boom>\n== 3\n== 4\n");
        assert_eq!(blocks.len(), 5);

        let out = render_sequential(&blocks, &cache, renderer.as_mut());
        assert!(out.has_fallbacks());
        assert_eq!(out.stats.fallbacks, 1);
        assert_eq!(out.stats.rendered, 4);
        for (i, fragment) in out.fragments.iter().enumerate() {
            assert_eq!(fragment.index, i);
            if i == 2 {
                assert_eq!(fragment.origin, FragmentOrigin::Fallback);
                assert!(fragment.html.contains("== 2 &lt;boom&gt;"));
            } else {
                assert_eq!(fragment.html.as_ref(), format!("<r>== {i}</r>"));
            }
        }
        assert!(!cache.contains(&blocks[2].content_hash));
    }

    #[test]
    fn duplicate_blocks_render_once() {
        let factory = CountingFactory::default();
        let mut renderer = factory.create().unwrap();
        let cache = BlockCache::new(16).unwrap();
        let out = render_sequential(&split("== Same\n== Same\n"), &cache, renderer.as_mut());
        assert_eq!(factory.calls(), 1);
        assert_eq!(out.stats.cache_hits, 1);
    }
}
