//! Block adoption.
//!
//! A one-shot heuristic that maps pre-existing code in a target file
//! into blocks the template defines, so a first re-render over a
//! hand-written file does not discard the user's work.
//!
//! For every template block missing from the target, a symmetric
//! window of literal context lines around the block's markers in the
//! *template* is searched for in the target. The window starts at one
//! line and widens until the match is unambiguous on at least one
//! side; the unique side is then paired with the nearest candidate on
//! the other side and the intervening lines become the block's
//! contents.

use crate::blocks::{is_block_marker, parse_blocks, BlockInfo, BlockSyntax};
use crate::error::Result;
use std::collections::HashMap;

/// Adopt target-file content into the template's blocks.
///
/// `existing` holds the blocks already parsed from the target; only
/// template blocks absent from it are candidates. Returns the newly
/// adopted blocks keyed by name.
///
/// # Errors
///
/// Propagates block-parse errors from the template source itself.
pub fn adopt_blocks(
    template_file: &str,
    template_src: &str,
    target_src: &str,
    existing: &HashMap<String, BlockInfo>,
) -> Result<HashMap<String, BlockInfo>> {
    let template_blocks = parse_blocks(template_file, template_src)?;
    let template_lines: Vec<&str> = template_src.lines().collect();
    let target_lines: Vec<&str> = target_src.lines().collect();

    let mut adopted = HashMap::new();
    for (name, block) in template_blocks {
        if existing.contains_key(&name) {
            continue;
        }
        if let Some(found) = locate(&template_lines, &target_lines, &block) {
            tracing::debug!(block = %name, start = found.start_line, "Adopted block");
            adopted.insert(name.clone(), BlockInfo { name, ..found });
        }
    }
    Ok(adopted)
}

/// Try to locate one template block in the target by widening context
/// windows.
fn locate(
    template_lines: &[&str],
    target_lines: &[&str],
    block: &BlockInfo,
) -> Option<BlockInfo> {
    let pre_all = &template_lines[..block.start_line - 1];
    let post_all = &template_lines[block.end_line.min(template_lines.len())..];
    let max_window = pre_all.len().max(post_all.len());

    for window in 1..=max_window {
        let pre = &pre_all[pre_all.len().saturating_sub(window)..];
        let post = &post_all[..window.min(post_all.len())];

        // Context containing other markers would anchor on text that
        // is not literal in the target.
        if pre.iter().chain(post.iter()).any(|line| is_block_marker(line)) {
            return None;
        }

        let mut pres = occurrences(target_lines, pre);
        let mut posts = occurrences_end(target_lines, post);

        if let Some(&earliest_pre) = pres.iter().min() {
            posts.retain(|&end| end >= earliest_pre + pre.len());
        }
        if let Some(&latest_post) = posts.iter().max() {
            pres.retain(|&start| start + pre.len() <= latest_post);
        }

        if pres.is_empty() || posts.is_empty() {
            // A wider window is strictly harder to match.
            return None;
        }
        if pres.len() > 1 && posts.len() > 1 {
            continue;
        }

        let (start, end) = if pres.len() == 1 {
            let start = pres[0] + pre.len();
            let end = posts.iter().copied().filter(|&end| end >= start).min()?;
            (start, end)
        } else {
            let end = posts[0];
            let start = pres
                .iter()
                .copied()
                .filter(|&candidate| candidate + pre.len() <= end)
                .max()?
                + pre.len();
            (start, end)
        };

        return Some(BlockInfo {
            name: block.name.clone(),
            start_line: start + 1,
            end_line: end,
            contents: target_lines[start..end].join("\n"),
            syntax: BlockSyntax::Adopted,
        });
    }

    None
}

/// Start positions where `needle` occurs in `haystack`. An empty
/// needle anchors at the start of the file.
fn occurrences(haystack: &[&str], needle: &[&str]) -> Vec<usize> {
    if needle.is_empty() {
        return vec![0];
    }
    if needle.len() > haystack.len() {
        return Vec::new();
    }
    (0..=haystack.len() - needle.len())
        .filter(|&i| &haystack[i..i + needle.len()] == needle)
        .collect()
}

/// End positions (exclusive content end) where `needle` occurs. An
/// empty needle anchors at the end of the file.
fn occurrences_end(haystack: &[&str], needle: &[&str]) -> Vec<usize> {
    if needle.is_empty() {
        return vec![haystack.len()];
    }
    occurrences(haystack, needle)
}
