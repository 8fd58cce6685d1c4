use select::document::Document;
use select::predicate::Name;

/// The `(element, attribute)` pairs that can reference a subresource. The
/// `srcset` attributes carry comma-separated candidate lists and need their
/// own parsing; everything else holds a single URL.
const SINGLE_ATTRS: &[(&str, &str)] = &[
    ("img", "src"),
    ("script", "src"),
    ("link", "href"),
    ("source", "src"),
    ("video", "src"),
    ("audio", "src"),
];

const SRCSET_ATTRS: &[(&str, &str)] = &[("img", "srcset"), ("source", "srcset")];

/// One asset reference found in a document: where it sits (tag + attribute)
/// and the raw attribute value as authored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReference {
    pub tag: &'static str,
    pub attribute: &'static str,
    pub srcset: bool,
    pub raw: String,
}

impl AssetReference {
    /// The URL this reference asks the engine to fetch. For a `srcset` this
    /// is the first candidate; all candidates later collapse onto the same
    /// downloaded file.
    pub fn target(&self) -> Option<&str> {
        if self.srcset {
            srcset_first_candidate(&self.raw)
        } else {
            Some(self.raw.as_str())
        }
    }
}

/// Enumerate every asset reference in a parsed document. References with
/// empty attribute values are discarded.
pub fn extract_assets(document: &Document) -> Vec<AssetReference> {
    let mut refs = Vec::new();

    for &(tag, attribute) in SINGLE_ATTRS {
        for node in document.find(Name(tag)) {
            if let Some(value) = node.attr(attribute) {
                if !value.is_empty() {
                    refs.push(AssetReference {
                        tag,
                        attribute,
                        srcset: false,
                        raw: value.to_string(),
                    });
                }
            }
        }
    }

    for &(tag, attribute) in SRCSET_ATTRS {
        for node in document.find(Name(tag)) {
            if let Some(value) = node.attr(attribute) {
                if !value.is_empty() {
                    refs.push(AssetReference {
                        tag,
                        attribute,
                        srcset: true,
                        raw: value.to_string(),
                    });
                }
            }
        }
    }

    refs
}

/// URL token of the first srcset candidate, if any.
pub fn srcset_first_candidate(srcset: &str) -> Option<&str> {
    srcset
        .split(',')
        .filter_map(|candidate| candidate.split_whitespace().next())
        .next()
}

/// Collapse every candidate of a srcset onto `replacement`, keeping each
/// candidate's descriptors (`2x`, `800w`, ...) and the comma separation.
pub fn rewrite_srcset(srcset: &str, replacement: &str) -> String {
    srcset
        .split(',')
        .filter_map(|candidate| {
            let mut tokens = candidate.split_whitespace();
            tokens.next()?;
            let descriptors: Vec<&str> = tokens.collect();
            if descriptors.is_empty() {
                Some(replacement.to_string())
            } else {
                Some(format!("{replacement} {}", descriptors.join(" ")))
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
