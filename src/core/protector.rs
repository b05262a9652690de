use std::ops::Range;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A human-owned block that fixes must not rewrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedRegion {
    /// Label if present, otherwise a content hash
    pub id: String,

    pub label: Option<String>,

    /// Byte range covering both markers
    pub byte_range: Range<usize>,

    /// 1-indexed, inclusive, covering both markers
    pub line_range: (usize, usize),
}

impl ProtectedRegion {
    pub fn overlaps(&self, range: &Range<usize>) -> bool {
        range.start < self.byte_range.end && self.byte_range.start < range.end
    }
}

/// Finds `<!-- PROTECTED -->` ... `<!-- /PROTECTED -->` blocks in a document
pub struct EditProtector {
    protected_start_regex: Regex,
    protected_end_regex: Regex,
}

impl EditProtector {
    pub fn new() -> Self {
        Self {
            protected_start_regex: Regex::new(r"<!--\s*PROTECTED(?::\s*(.+?))?\s*-->")
                .expect("Invalid protected start regex"),
            protected_end_regex: Regex::new(r"<!--\s*/PROTECTED\s*-->")
                .expect("Invalid protected end regex"),
        }
    }

    /// Extract all protected regions. An unclosed region extends to the end
    /// of the document.
    pub fn extract_protected_regions(&self, content: &str) -> Vec<ProtectedRegion> {
        let mut regions = Vec::new();
        let mut offset = 0;

        while let Some(caps) = self.protected_start_regex.captures(&content[offset..]) {
            let Some(start) = caps.get(0) else {
                break;
            };
            let label = caps.get(1).map(|m| m.as_str().trim().to_string());
            let start_byte = offset + start.start();
            let body_start = offset + start.end();

            let end_byte = self
                .protected_end_regex
                .find(&content[body_start..])
                .map_or(content.len(), |m| body_start + m.end());

            let body = &content[body_start..end_byte];
            let id = label.clone().unwrap_or_else(|| generate_region_id(body));

            regions.push(ProtectedRegion {
                id,
                label,
                line_range: (line_at(content, start_byte), line_at(content, end_byte.saturating_sub(1))),
                byte_range: start_byte..end_byte,
            });

            offset = end_byte;
        }

        regions
    }

    pub fn has_protected_regions(&self, content: &str) -> bool {
        self.protected_start_regex.is_match(content)
    }

    /// The protected region a byte range would touch, if any
    pub fn guarding<'a>(
        &self,
        regions: &'a [ProtectedRegion],
        range: &Range<usize>,
    ) -> Option<&'a ProtectedRegion> {
        regions.iter().find(|r| r.overlaps(range))
    }

    /// First occurrence of `needle` outside every protected region
    pub fn find_unprotected(&self, content: &str, needle: &str) -> Option<Range<usize>> {
        if needle.is_empty() {
            return None;
        }
        let regions = self.extract_protected_regions(content);
        content
            .match_indices(needle)
            .map(|(start, m)| start..start + m.len())
            .find(|range| self.guarding(&regions, range).is_none())
    }

    /// Wrap content in protection markers
    pub fn protect_content(&self, content: &str, label: Option<&str>) -> String {
        let start_marker = match label {
            Some(label) => format!("<!-- PROTECTED: {} -->", label),
            None => "<!-- PROTECTED -->".to_string(),
        };

        format!("{}\n{}\n<!-- /PROTECTED -->", start_marker, content)
    }
}

impl Default for EditProtector {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_region_id(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    format!("region-{}", &hash[..8])
}

fn line_at(content: &str, byte: usize) -> usize {
    content[..byte.min(content.len())].matches('\n').count() + 1
}
