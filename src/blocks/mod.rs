//! User-edit block parsing.
//!
//! Rendered output may contain named spans the user owns; re-renders
//! preserve their contents verbatim. Two marker syntaxes are accepted
//! in input files (prior renders or hand-written):
//!
//! ```text
//! ### Block(name)          legacy open
//! ### EndBlock(name)       legacy close
//! ## <<Stencil::Block(name)>>    v2 open
//! ## <</Stencil::Block>>         v2 close
//! ```
//!
//! Comment prefixes: `///` / `###` / `<!---` (legacy), `//` / `##` /
//! `--` / `<!--` (v2). Parsing is a single linear scan; blocks may not
//! nest.

pub mod adopt;

use crate::error::{Result, StencilError};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

static LEGACY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(///|###|<!---)\s*([A-Za-z ]+)\(([A-Za-z0-9 -]+)\)").expect("Invalid regex")
});

static V2_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(//|##|--|<!--)\s?<<(/?)Stencil::([A-Za-z ]+)(\(([A-Za-z0-9 -]+)\))?>>")
        .expect("Invalid regex")
});

/// Which marker syntax delimited a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSyntax {
    /// `Block(name)` / `EndBlock(name)`
    Legacy,
    /// `<<Stencil::Block(name)>>` / `<</Stencil::Block>>`
    V2,
    /// Synthesized by the adoption heuristic, no markers in the input
    Adopted,
}

/// A named user-edit span found in an input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block name
    pub name: String,
    /// Line of the opening marker (1-based; first content line for
    /// adopted blocks)
    pub start_line: usize,
    /// Line of the closing marker (1-based; last content line for
    /// adopted blocks)
    pub end_line: usize,
    /// Raw contents between the markers, newline-joined
    pub contents: String,
    /// Which syntax delimited the block
    pub syntax: BlockSyntax,
}

/// One marker line, as recognised by the scanner.
#[derive(Debug, PartialEq, Eq)]
enum Marker {
    Open(String),
    Close(Option<String>),
    LegacyEndBlockV2Mix,
}

/// Recognise a block marker on a single line. Lines that are not
/// markers (including unknown commands) return `None`.
fn parse_marker(line: &str) -> Option<(Marker, BlockSyntax)> {
    if let Some(caps) = V2_PATTERN.captures(line) {
        let closing = !caps[2].is_empty();
        let command = caps[3].trim();
        let name = caps.get(5).map(|m| m.as_str().to_string());
        return match (command, closing) {
            ("Block", false) => name.map(|n| (Marker::Open(n), BlockSyntax::V2)),
            ("Block", true) => Some((Marker::Close(name), BlockSyntax::V2)),
            // `<<Stencil::EndBlock>>` is legacy semantics in v2 clothing.
            ("EndBlock", false) => Some((Marker::LegacyEndBlockV2Mix, BlockSyntax::V2)),
            _ => None,
        };
    }

    if let Some(caps) = LEGACY_PATTERN.captures(line) {
        let command = caps[2].trim();
        let name = caps[3].to_string();
        return match command {
            "Block" => Some((Marker::Open(name), BlockSyntax::Legacy)),
            "EndBlock" => Some((Marker::Close(Some(name)), BlockSyntax::Legacy)),
            _ => None,
        };
    }

    None
}

/// Whether a line looks like any block marker. Used by the adoption
/// heuristic to refuse context windows that contain markers.
#[must_use]
pub fn is_block_marker(line: &str) -> bool {
    parse_marker(line).is_some()
}

/// Parse every block in `content`. `file` labels errors.
///
/// # Errors
///
/// `InvalidNestedBlock`, `InvalidEndBlock`, `DanglingEndBlock`,
/// `DanglingBlock` and `LegacyEndBlockV2Mix`, all carrying
/// `file:line` context.
pub fn parse_blocks(file: &str, content: &str) -> Result<HashMap<String, BlockInfo>> {
    let mut blocks: HashMap<String, BlockInfo> = HashMap::new();
    let mut current: Option<(String, usize, BlockSyntax, Vec<String>)> = None;

    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        match parse_marker(line) {
            Some((Marker::Open(name), syntax)) => {
                if let Some((open_name, ..)) = &current {
                    return Err(StencilError::InvalidNestedBlock {
                        name,
                        current: open_name.clone(),
                        file: file.to_string(),
                        line: line_no,
                    });
                }
                current = Some((name, line_no, syntax, Vec::new()));
            }
            Some((Marker::Close(name), _)) => {
                let Some((open_name, start_line, syntax, lines)) = current.take() else {
                    return Err(StencilError::DanglingEndBlock {
                        file: file.to_string(),
                        line: line_no,
                    });
                };
                if let Some(name) = name {
                    if name != open_name {
                        return Err(StencilError::InvalidEndBlock {
                            name,
                            current: open_name,
                            file: file.to_string(),
                            line: line_no,
                        });
                    }
                }
                blocks.insert(
                    open_name.clone(),
                    BlockInfo {
                        name: open_name,
                        start_line,
                        end_line: line_no,
                        contents: lines.join("\n"),
                        syntax,
                    },
                );
            }
            Some((Marker::LegacyEndBlockV2Mix, _)) => {
                return Err(StencilError::LegacyEndBlockV2Mix {
                    file: file.to_string(),
                    line: line_no,
                });
            }
            None => {
                if let Some((.., lines)) = &mut current {
                    lines.push(line.to_string());
                }
            }
        }
    }

    if let Some((name, ..)) = current {
        return Err(StencilError::DanglingBlock { name, file: file.to_string() });
    }

    Ok(blocks)
}

/// Parse blocks from a file on disk. A missing file is not an error:
/// it yields an empty block map.
///
/// # Errors
///
/// I/O errors other than not-found, and any parse error.
pub fn parse_blocks_from_path(path: &Path) -> Result<HashMap<String, BlockInfo>> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_blocks(&path.display().to_string(), &content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(StencilError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_v2_block() {
        let blocks = parse_blocks(
            "service.yaml",
            "## <<Stencil::Block(version)>>\n  version: xyz\n## <</Stencil::Block>>\n",
        )
        .unwrap();

        let block = &blocks["version"];
        assert_eq!(block.contents, "  version: xyz");
        assert_eq!(block.start_line, 1);
        assert_eq!(block.end_line, 3);
        assert_eq!(block.syntax, BlockSyntax::V2);
    }

    #[test]
    fn test_parse_legacy_block() {
        let blocks = parse_blocks(
            "main.go",
            "/// Block(imports)\nimport \"fmt\"\n/// EndBlock(imports)\n",
        )
        .unwrap();

        assert_eq!(blocks["imports"].contents, "import \"fmt\"");
        assert_eq!(blocks["imports"].syntax, BlockSyntax::Legacy);
    }

    #[test]
    fn test_comment_prefix_variants() {
        for (open, close) in [
            ("## <<Stencil::Block(x)>>", "## <</Stencil::Block>>"),
            ("// <<Stencil::Block(x)>>", "// <</Stencil::Block>>"),
            ("-- <<Stencil::Block(x)>>", "-- <</Stencil::Block>>"),
            ("<!-- <<Stencil::Block(x)>>", "<!-- <</Stencil::Block>>"),
            ("### Block(x)", "### EndBlock(x)"),
            ("<!--- Block(x)", "<!--- EndBlock(x)"),
        ] {
            let content = format!("{open}\ncontent\n{close}\n");
            let blocks = parse_blocks("f", &content).unwrap();
            assert_eq!(blocks["x"].contents, "content", "prefix pair {open} / {close}");
        }
    }

    #[test]
    fn test_multiline_contents_join_without_separators() {
        let blocks = parse_blocks(
            "f",
            "## <<Stencil::Block(body)>>\nline one\n\nline three\n## <</Stencil::Block>>\n",
        )
        .unwrap();
        assert_eq!(blocks["body"].contents, "line one\n\nline three");
    }

    #[test]
    fn test_empty_block() {
        let blocks =
            parse_blocks("f", "## <<Stencil::Block(empty)>>\n## <</Stencil::Block>>\n").unwrap();
        assert_eq!(blocks["empty"].contents, "");
    }

    #[test]
    fn test_nested_block_fails() {
        let err = parse_blocks(
            "f",
            "## <<Stencil::Block(outer)>>\n## <<Stencil::Block(inner)>>\n",
        )
        .unwrap_err();
        assert!(matches!(err, StencilError::InvalidNestedBlock { line: 2, .. }));
    }

    #[test]
    fn test_mismatched_end_fails() {
        let err = parse_blocks("f", "### Block(a)\n### EndBlock(b)\n").unwrap_err();
        match err {
            StencilError::InvalidEndBlock { name, current, line, .. } => {
                assert_eq!(name, "b");
                assert_eq!(current, "a");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dangling_end_fails() {
        let err = parse_blocks("f", "hello\n## <</Stencil::Block>>\n").unwrap_err();
        assert!(matches!(err, StencilError::DanglingEndBlock { line: 2, .. }));
    }

    #[test]
    fn test_unclosed_block_fails() {
        let err = parse_blocks("f", "## <<Stencil::Block(a)>>\ncontent\n").unwrap_err();
        assert!(matches!(err, StencilError::DanglingBlock { .. }));
    }

    #[test]
    fn test_v2_endblock_gets_migration_hint() {
        let err = parse_blocks(
            "f",
            "## <<Stencil::Block(a)>>\n## <<Stencil::EndBlock(a)>>\n",
        )
        .unwrap_err();
        assert!(matches!(err, StencilError::LegacyEndBlockV2Mix { line: 2, .. }));
        assert!(err.to_string().contains("<</Stencil::Block>>"));
    }

    #[test]
    fn test_unknown_commands_are_content() {
        let blocks = parse_blocks(
            "f",
            "## <<Stencil::Block(a)>>\n### Note(misc)\n## <</Stencil::Block>>\n",
        )
        .unwrap();
        assert_eq!(blocks["a"].contents, "### Note(misc)");
    }

    #[test]
    fn test_missing_file_yields_empty_map() {
        let blocks = parse_blocks_from_path(Path::new("/nonexistent/file.txt")).unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_round_trip_through_render_output() {
        // Parsing the output of a previous render must produce the
        // same contents that render embedded.
        let rendered = "apiVersion: v1\n## <<Stencil::Block(custom)>>\nuser: edit\n## <</Stencil::Block>>\nkind: Service\n";
        let blocks = parse_blocks("service.yaml", rendered).unwrap();
        assert_eq!(blocks["custom"].contents, "user: edit");
    }
}
