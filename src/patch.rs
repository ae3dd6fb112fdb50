//! Patch Manager
//!
//! Injects the shadow-router call site into a host source file that routemap does not
//! own, and takes it out again. Everything here is a text transform over the whole
//! file; nothing is remembered between calls.
//!
//! # Insert mode
//!
//! The payload is placed right after the anchor line, between a start and an end
//! marker line, at the anchor's indentation:
//!
//! ```text
//!         router_logits, _ = self.gate(hidden_states)
//!         # === [START PATCH] ROUTEMAP LOGGING ===
//!         ...payload...
//!         # === [END PATCH] ===
//! ```
//!
//! `rollback` removes exactly that marker-delimited block, restoring the file byte for
//! byte.
//!
//! # Replace mode
//!
//! The anchor line is replaced by itself, an inline tag line and the payload. There
//! is no closing marker, so this mode cannot be rolled back.
//!
//! Patching is single-invoker only: concurrent read-modify-write cycles on the same
//! file are not coordinated.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::errors::{Result, RouteMapError};

/// Gate invocation in vLLM's `qwen2_moe.py` after which the payload is placed
pub const DEFAULT_ANCHOR: &str = "router_logits, _ = self.gate(hidden_states)";

/// Python call site that records routing decisions in the routemap trace format
pub const DEFAULT_PAYLOAD: &str = include_str!("../payloads/shadow_router.py");

/// Literal strings delimiting an injected block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub start: String,
    pub end: String,
    /// Tag left by replace mode
    pub inline: String,
}

impl Default for Markers {
    fn default() -> Self {
        Markers {
            start: "# === [START PATCH] ROUTEMAP LOGGING ===".to_string(),
            end: "# === [END PATCH] ===".to_string(),
            inline: "# === [INLINE PATCH] ROUTEMAP LOGGING ===".to_string(),
        }
    }
}

/// Patch status derived from the marker lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    Unpatched,
    /// Zero-based line indices of the markers
    Patched { start_line: usize, end_line: usize },
    Corrupt {
        start_markers: usize,
        end_markers: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchMode {
    /// Marker-delimited block after the anchor line
    #[default]
    Insert,
    /// Anchor line replaced inline
    Replace,
}

/// A line containing the anchor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorMatch {
    /// One-based
    pub line_number: usize,
    pub indentation: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct PatchManager {
    markers: Markers,
}

impl PatchManager {
    pub fn new(markers: Markers) -> Self {
        PatchManager { markers }
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    /// Classify `text` by its start/end marker lines
    pub fn detect(&self, text: &str) -> PatchState {
        let mut starts = Vec::new();
        let mut ends = Vec::new();
        for (idx, line) in text.split_inclusive('\n').enumerate() {
            if line.contains(self.markers.start.as_str()) {
                starts.push(idx);
            }
            if line.contains(self.markers.end.as_str()) {
                ends.push(idx);
            }
        }

        match (starts.as_slice(), ends.as_slice()) {
            ([], []) => PatchState::Unpatched,
            ([start], [end]) if start < end => PatchState::Patched {
                start_line: *start,
                end_line: *end,
            },
            _ => PatchState::Corrupt {
                start_markers: starts.len(),
                end_markers: ends.len(),
            },
        }
    }

    /// Whether replace mode has already been applied
    pub fn has_inline_patch(&self, text: &str) -> bool {
        text.split_inclusive('\n')
            .any(|line| line.contains(self.markers.inline.as_str()))
    }

    /// Insert `payload` after the first line containing `anchor`
    ///
    /// # Errors
    ///
    /// - `AlreadyPatched` if a block or an inline patch is present
    /// - `Corrupt` if the markers are mismatched
    /// - `AnchorNotFound` if no line contains `anchor`
    /// - `InvalidInput` for an empty anchor or payload, or a payload containing a marker
    pub fn apply(&self, text: &str, anchor: &str, payload: &str) -> Result<String> {
        self.ensure_unpatched(text)?;
        let payload_lines = self.payload_lines(anchor, payload)?;

        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let anchor_idx = find_anchor(&lines, anchor)?;
        let anchor_line = lines[anchor_idx];
        let indent = leading_whitespace(anchor_line);

        let mut block = Vec::with_capacity(payload_lines.len() + 2);
        block.push(format!("{}{}", indent, self.markers.start));
        block.extend(payload_lines.iter().map(|l| format!("{}{}", indent, l)));
        block.push(format!("{}{}", indent, self.markers.end));

        let mut out = String::with_capacity(text.len() + block.iter().map(|l| l.len() + 2).sum::<usize>());
        for line in &lines[..anchor_idx] {
            out.push_str(line);
        }
        out.push_str(anchor_line);
        push_block(&mut out, anchor_line, &block);
        for line in &lines[anchor_idx + 1..] {
            out.push_str(line);
        }

        Ok(out)
    }

    /// Replace the first line containing `anchor` with itself plus the inline payload
    ///
    /// Survives layout drift around a one-line anchor better than [`PatchManager::apply`],
    /// but the result cannot be rolled back.
    ///
    /// # Errors
    /// Same as [`PatchManager::apply`].
    pub fn apply_replace(&self, text: &str, anchor: &str, payload: &str) -> Result<String> {
        self.ensure_unpatched(text)?;
        let payload_lines = self.payload_lines(anchor, payload)?;

        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let anchor_idx = find_anchor(&lines, anchor)?;
        let anchor_line = lines[anchor_idx];
        let indent = leading_whitespace(anchor_line);
        let statement = strip_line_ending(anchor_line);

        let mut replacement = Vec::with_capacity(payload_lines.len() + 2);
        replacement.push(statement.to_string());
        replacement.push(format!("{}{}", indent, self.markers.inline));
        replacement.extend(payload_lines.iter().map(|l| format!("{}{}", indent, l)));

        let eol = line_ending(anchor_line);
        let mut out = String::with_capacity(text.len() * 2);
        for line in &lines[..anchor_idx] {
            out.push_str(line);
        }
        let last = replacement.len() - 1;
        for (idx, line) in replacement.iter().enumerate() {
            out.push_str(line);
            if idx < last {
                out.push_str(eol.unwrap_or("\n"));
            } else if let Some(eol) = eol {
                out.push_str(eol);
            }
        }
        for line in &lines[anchor_idx + 1..] {
            out.push_str(line);
        }

        Ok(out)
    }

    /// Remove the marker-delimited block, inclusive of both marker lines
    ///
    /// # Errors
    ///
    /// - `NoMarkersFound` if there is no block
    /// - `UnsupportedRollback` if the only patch present is an inline one
    /// - `Corrupt` if the markers are mismatched
    pub fn rollback(&self, text: &str) -> Result<String> {
        let (start, end) = match self.detect(text) {
            PatchState::Patched {
                start_line,
                end_line,
            } => (start_line, end_line),
            PatchState::Unpatched if self.has_inline_patch(text) => {
                return Err(RouteMapError::UnsupportedRollback);
            }
            PatchState::Unpatched => return Err(RouteMapError::NoMarkersFound),
            PatchState::Corrupt {
                start_markers,
                end_markers,
            } => {
                return Err(RouteMapError::Corrupt {
                    start_markers,
                    end_markers,
                });
            }
        };

        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let mut out = String::with_capacity(text.len());
        for line in &lines[..start] {
            out.push_str(line);
        }
        // A block appended after an unterminated last line also added its line break
        let appended_at_eof = end + 1 == lines.len() && !lines[end].ends_with('\n');
        if appended_at_eof && out.ends_with('\n') {
            out.pop();
        }
        for line in &lines[end + 1..] {
            out.push_str(line);
        }

        Ok(out)
    }

    /// Every line containing `anchor`, for diagnosing a failed or ambiguous patch
    pub fn inspect(text: &str, anchor: &str) -> Vec<AnchorMatch> {
        if anchor.is_empty() {
            return Vec::new();
        }
        text.split_inclusive('\n')
            .enumerate()
            .filter(|(_, line)| line.contains(anchor))
            .map(|(idx, line)| AnchorMatch {
                line_number: idx + 1,
                indentation: leading_whitespace(line).to_string(),
                text: strip_line_ending(line).to_string(),
            })
            .collect()
    }

    pub fn detect_file(&self, path: &Path) -> Result<PatchState> {
        let text = fs::read_to_string(path)?;
        Ok(self.detect(&text))
    }

    /// Patch a file in place. Nothing is written unless the transform succeeds.
    pub fn patch_file(&self, path: &Path, anchor: &str, payload: &str, mode: PatchMode) -> Result<()> {
        let text = fs::read_to_string(path)?;
        let patched = match mode {
            PatchMode::Insert => self.apply(&text, anchor, payload)?,
            PatchMode::Replace => self.apply_replace(&text, anchor, payload)?,
        };
        write_atomic(path, &patched)?;

        tracing::info!(
            path = %path.display(),
            mode = ?mode,
            added_lines = patched.lines().count() - text.lines().count(),
            "Applied shadow-router patch"
        );
        Ok(())
    }

    /// Roll a file back in place. Nothing is written unless the transform succeeds.
    pub fn rollback_file(&self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        let restored = self.rollback(&text)?;
        write_atomic(path, &restored)?;

        tracing::info!(
            path = %path.display(),
            removed_lines = text.lines().count() - restored.lines().count(),
            "Removed shadow-router patch"
        );
        Ok(())
    }

    fn ensure_unpatched(&self, text: &str) -> Result<()> {
        match self.detect(text) {
            PatchState::Unpatched => {}
            PatchState::Patched { .. } => return Err(RouteMapError::AlreadyPatched),
            PatchState::Corrupt {
                start_markers,
                end_markers,
            } => {
                return Err(RouteMapError::Corrupt {
                    start_markers,
                    end_markers,
                });
            }
        }
        if self.has_inline_patch(text) {
            return Err(RouteMapError::AlreadyPatched);
        }
        Ok(())
    }

    /// Non-blank payload lines with their common indentation removed
    fn payload_lines(&self, anchor: &str, payload: &str) -> Result<Vec<String>> {
        if anchor.is_empty() {
            return Err(RouteMapError::InvalidInput {
                message: "anchor pattern is empty".to_string(),
            });
        }

        let lines: Vec<&str> = payload
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
            .collect();
        if lines.is_empty() {
            return Err(RouteMapError::InvalidInput {
                message: "payload has no non-blank lines".to_string(),
            });
        }
        let markers = [&self.markers.start, &self.markers.end, &self.markers.inline];
        if lines
            .iter()
            .any(|l| markers.iter().any(|m| l.contains(m.as_str())))
        {
            return Err(RouteMapError::InvalidInput {
                message: "payload must not contain patch markers".to_string(),
            });
        }

        // Shared whitespace prefix, compared character by character so a tab
        // never cancels against a space
        let common = lines
            .iter()
            .map(|l| leading_whitespace(l))
            .reduce(|acc, ws| {
                let shared = acc
                    .bytes()
                    .zip(ws.bytes())
                    .take_while(|(a, b)| a == b)
                    .count();
                &acc[..shared]
            })
            .map_or(0, str::len);
        Ok(lines.iter().map(|l| l[common..].to_string()).collect())
    }
}

/// Write `contents` to a sibling temp file and rename it over `path`
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), meta.permissions())?;
    }
    tmp.persist(path).map_err(|e| RouteMapError::from(e.error))?;
    Ok(())
}

fn find_anchor(lines: &[&str], anchor: &str) -> Result<usize> {
    lines
        .iter()
        .position(|line| line.contains(anchor))
        .ok_or_else(|| RouteMapError::AnchorNotFound {
            pattern: anchor.to_string(),
        })
}

/// Append `block` after `anchor_line`, reusing its line ending
fn push_block(out: &mut String, anchor_line: &str, block: &[String]) {
    match line_ending(anchor_line) {
        Some(eol) => {
            for line in block {
                out.push_str(line);
                out.push_str(eol);
            }
        }
        None => {
            // Anchor is the unterminated last line
            for line in block {
                out.push('\n');
                out.push_str(line);
            }
        }
    }
}

fn leading_whitespace(line: &str) -> &str {
    let trimmed = line.trim_start_matches([' ', '\t']);
    &line[..line.len() - trimmed.len()]
}

fn line_ending(line: &str) -> Option<&'static str> {
    if line.ends_with("\r\n") {
        Some("\r\n")
    } else if line.ends_with('\n') {
        Some("\n")
    } else {
        None
    }
}

fn strip_line_ending(line: &str) -> &str {
    line.strip_suffix("\r\n")
        .or_else(|| line.strip_suffix('\n'))
        .unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "class Qwen2MoeSparseMoeBlock:\n    def forward(self, hidden_states):\n        router_logits, _ = self.gate(hidden_states)\n        return self.experts(hidden_states, router_logits)\n";

    #[test]
    fn test_detect_states() {
        let pm = PatchManager::default();
        let m = pm.markers().clone();

        assert_eq!(pm.detect(HOST), PatchState::Unpatched);

        let patched = format!("a\n{}\nb\n{}\n", m.start, m.end);
        assert_eq!(
            pm.detect(&patched),
            PatchState::Patched {
                start_line: 1,
                end_line: 3
            }
        );

        let reversed = format!("{}\n{}\n", m.end, m.start);
        assert!(matches!(pm.detect(&reversed), PatchState::Corrupt { .. }));

        let doubled = format!("{0}\n{1}\n{0}\n{1}\n", m.start, m.end);
        assert_eq!(
            pm.detect(&doubled),
            PatchState::Corrupt {
                start_markers: 2,
                end_markers: 2
            }
        );
    }

    #[test]
    fn test_apply_inserts_after_anchor() {
        let pm = PatchManager::default();
        let patched = pm.apply(HOST, DEFAULT_ANCHOR, "x = 1\nif x:\n    y = 2\n").unwrap();

        let lines: Vec<&str> = patched.lines().collect();
        assert_eq!(lines[2], "        router_logits, _ = self.gate(hidden_states)");
        assert_eq!(lines[3], "        # === [START PATCH] ROUTEMAP LOGGING ===");
        assert_eq!(lines[4], "        x = 1");
        assert_eq!(lines[5], "        if x:");
        assert_eq!(lines[6], "            y = 2");
        assert_eq!(lines[7], "        # === [END PATCH] ===");
        assert_eq!(lines[8], "        return self.experts(hidden_states, router_logits)");
        assert!(matches!(pm.detect(&patched), PatchState::Patched { .. }));
    }

    #[test]
    fn test_payload_is_dedented_and_blank_lines_dropped() {
        let pm = PatchManager::default();
        let payload = "\n        a = 1\n\n        if a:\n            b = 2\n   \n";
        let patched = pm.apply("  anchor\n", "anchor", payload).unwrap();
        assert_eq!(
            patched,
            "  anchor\n  # === [START PATCH] ROUTEMAP LOGGING ===\n  a = 1\n  if a:\n      b = 2\n  # === [END PATCH] ===\n"
        );
    }

    #[test]
    fn test_mixed_tab_and_space_indent_is_preserved() {
        let pm = PatchManager::default();
        let payload = "\tif a:\n\t\tb = 2\n    c = 3\n";
        let lines = pm.payload_lines("anchor", payload).unwrap();
        // No shared prefix between tab and space lines, so nothing is stripped
        assert_eq!(lines, vec!["\tif a:", "\t\tb = 2", "    c = 3"]);

        let payload = "\t  x = 1\n\t    y = 2\n";
        let lines = pm.payload_lines("anchor", payload).unwrap();
        assert_eq!(lines, vec!["x = 1", "  y = 2"]);
    }

    #[test]
    fn test_apply_uses_first_anchor_only() {
        let pm = PatchManager::default();
        let text = "anchor one\nanchor two\n";
        let patched = pm.apply(text, "anchor", "p").unwrap();
        assert!(patched.starts_with("anchor one\n# === [START PATCH]"));
    }

    #[test]
    fn test_apply_errors() {
        let pm = PatchManager::default();

        let err = pm.apply(HOST, "self.router(", "p").unwrap_err();
        assert!(matches!(err, RouteMapError::AnchorNotFound { .. }));

        let patched = pm.apply(HOST, DEFAULT_ANCHOR, "p").unwrap();
        assert!(matches!(
            pm.apply(&patched, DEFAULT_ANCHOR, "p"),
            Err(RouteMapError::AlreadyPatched)
        ));

        let corrupt = format!("{}\n{}", HOST, pm.markers().start);
        assert!(matches!(
            pm.apply(&corrupt, DEFAULT_ANCHOR, "p"),
            Err(RouteMapError::Corrupt { .. })
        ));

        assert!(matches!(
            pm.apply(HOST, DEFAULT_ANCHOR, "\n  \n"),
            Err(RouteMapError::InvalidInput { .. })
        ));
        assert!(matches!(
            pm.apply(HOST, "", "p"),
            Err(RouteMapError::InvalidInput { .. })
        ));
        assert!(matches!(
            pm.apply(HOST, DEFAULT_ANCHOR, "# === [END PATCH] ==="),
            Err(RouteMapError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_rollback_restores() {
        let pm = PatchManager::default();
        let patched = pm.apply(HOST, DEFAULT_ANCHOR, DEFAULT_PAYLOAD).unwrap();
        assert_eq!(pm.rollback(&patched).unwrap(), HOST);
    }

    #[test]
    fn test_rollback_crlf_and_unterminated() {
        let pm = PatchManager::default();

        let crlf = "def f():\r\n    anchor()\r\n    return 1\r\n";
        let patched = pm.apply(crlf, "anchor()", "p = 1").unwrap();
        assert!(patched.contains("    p = 1\r\n"));
        assert_eq!(pm.rollback(&patched).unwrap(), crlf);

        let unterminated = "def f():\n    anchor()";
        let patched = pm.apply(unterminated, "anchor()", "p = 1").unwrap();
        assert_eq!(
            patched,
            "def f():\n    anchor()\n    # === [START PATCH] ROUTEMAP LOGGING ===\n    p = 1\n    # === [END PATCH] ==="
        );
        assert_eq!(pm.rollback(&patched).unwrap(), unterminated);
    }

    #[test]
    fn test_rollback_errors() {
        let pm = PatchManager::default();
        assert!(matches!(
            pm.rollback(HOST),
            Err(RouteMapError::NoMarkersFound)
        ));

        let half = format!("{}{}\n", HOST, pm.markers().end);
        assert!(matches!(
            pm.rollback(&half),
            Err(RouteMapError::Corrupt {
                start_markers: 0,
                end_markers: 1
            })
        ));
    }

    #[test]
    fn test_apply_replace() {
        let pm = PatchManager::default();
        let patched = pm.apply_replace(HOST, DEFAULT_ANCHOR, "log(router_logits)").unwrap();

        let lines: Vec<&str> = patched.lines().collect();
        assert_eq!(lines[2], "        router_logits, _ = self.gate(hidden_states)");
        assert_eq!(lines[3], "        # === [INLINE PATCH] ROUTEMAP LOGGING ===");
        assert_eq!(lines[4], "        log(router_logits)");
        assert_eq!(lines[5], "        return self.experts(hidden_states, router_logits)");

        assert_eq!(pm.detect(&patched), PatchState::Unpatched);
        assert!(matches!(
            pm.apply_replace(&patched, DEFAULT_ANCHOR, "p"),
            Err(RouteMapError::AlreadyPatched)
        ));
        assert!(matches!(
            pm.apply(&patched, DEFAULT_ANCHOR, "p"),
            Err(RouteMapError::AlreadyPatched)
        ));
        assert!(matches!(
            pm.rollback(&patched),
            Err(RouteMapError::UnsupportedRollback)
        ));
    }

    #[test]
    fn test_inspect() {
        let found = PatchManager::inspect(HOST, "hidden_states");
        let numbers: Vec<usize> = found.iter().map(|m| m.line_number).collect();
        assert_eq!(numbers, vec![2, 3, 4]);
        assert_eq!(found[1].indentation, "        ");
        assert!(PatchManager::inspect(HOST, "").is_empty());
    }

    #[test]
    fn test_default_payload_is_clean() {
        let pm = PatchManager::default();
        assert!(pm.payload_lines(DEFAULT_ANCHOR, DEFAULT_PAYLOAD).is_ok());
        assert!(DEFAULT_PAYLOAD.contains("router_logits"));
    }
}
