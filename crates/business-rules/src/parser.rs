/// Parser for business rules guides.
///
/// Each guide is a standalone markdown file:
/// - Title: first `# ` line, usually with the schema in a parenthetical,
///   e.g. `# Financial Banking Rules (financial Database)`
/// - Sections: `## ` and `### ` headings
/// - Optional declaration lines such as `Schema: financial` or `Tables: loan, account`
/// - Literal values the SQL must use appear quoted: `'Closed'`, `` `status` ``, `"A"`
///
/// Tokenization here is shared by the index and by query scoring so both sides normalize
/// identically.
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::model::ParsedGuide;

const MAX_SINGLE_QUOTED_LEN: usize = 20;
const MAX_EMBEDDING_TEXT_CHARS: usize = 3000;

static TITLE_PAREN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^)]+)\)").expect("valid regex"));
static DB_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*(database|db)\s*$").expect("valid regex"));
static DECLARATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*]\s+)?[*_]*(?:schemas?|database|tables?)[*_]*\s*:[*_]*\s*(.+)$")
        .expect("valid regex")
});
static BACKTICK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\s][^`\n]{0,29})`").expect("valid regex"));
static DOUBLE_QUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"\s][^"\n]{0,29})""#).expect("valid regex"));

const STOP_WORDS: &[&str] = &[
    "a", "about", "all", "also", "an", "and", "any", "are", "as", "at", "be", "but", "by",
    "can", "data", "database", "db", "do", "doe", "each", "for", "from", "guide",
    "guideline", "ha", "her", "how", "if", "in", "into", "is", "it", "its", "must", "of",
    "on", "one", "only", "or", "our", "out", "per", "rule", "should", "standard", "than",
    "that", "the", "their", "them", "then", "there", "these", "they", "this", "those", "to",
    "wa", "was", "what", "when", "where", "which", "who", "will", "with", "you",
];

/// Read every `*.md` guide in `dir`, sorted by file name.
///
/// Unreadable or empty files are skipped with a warning.
pub fn load_guides(dir: &Path) -> Result<Vec<ParsedGuide>, AppError> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
        .collect();
    paths.sort();

    let mut guides = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(key) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "failed to read guide, skipping");
                continue;
            }
        };
        if content.trim().is_empty() {
            warn!(file = %key, "empty guide, skipping");
            continue;
        }
        guides.push(parse_guide(&key, &content));
    }

    debug!(count = guides.len(), dir = %dir.display(), "guides loaded");
    Ok(guides)
}

/// Parse a single guide. Never fails: missing structure yields empty fields.
pub fn parse_guide(key: &str, content: &str) -> ParsedGuide {
    let stem = key.strip_suffix(".md").unwrap_or(key);

    let title = content
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| humanize(stem));

    let headers: Vec<String> = content
        .lines()
        .filter_map(|line| {
            line.strip_prefix("### ")
                .or_else(|| line.strip_prefix("## "))
                .map(|h| h.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .collect();

    ParsedGuide {
        key: key.to_string(),
        schema_hints: extract_schema_hints(&title, content),
        quoted_terms: extract_quoted_terms(content),
        title,
        headers,
        text: content.to_string(),
        content_hash: content_hash(content),
    }
}

fn extract_schema_hints(title: &str, content: &str) -> Vec<String> {
    let mut hints: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        let cleaned = raw
            .trim()
            .trim_matches(|c: char| c == '`' || c == '*' || c == '_' || c == '.')
            .trim()
            .to_string();
        if !cleaned.is_empty() && !hints.iter().any(|h| h.eq_ignore_ascii_case(&cleaned)) {
            hints.push(cleaned);
        }
    };

    if let Some(caps) = TITLE_PAREN_RE.captures(title) {
        push(DB_SUFFIX_RE.replace(&caps[1], "").as_ref());
    }

    for line in content.lines() {
        if let Some(caps) = DECLARATION_RE.captures(line) {
            for name in caps[1].split(',') {
                push(name);
            }
        }
    }

    hints
}

/// Short literal spans the SQL is likely to need verbatim.
///
/// Single quotes only count when they are not apostrophes, i.e. the opening quote is not
/// preceded by a letter or digit and the closing quote is not followed by one.
pub fn extract_quoted_terms(content: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |term: &str| {
        let term = term.trim();
        if !term.is_empty() && seen.insert(term.to_lowercase()) {
            terms.push(term.to_string());
        }
    };

    for span in single_quoted_spans(content) {
        push(span);
    }
    for caps in BACKTICK_RE.captures_iter(content) {
        push(&caps[1]);
    }
    for caps in DOUBLE_QUOTE_RE.captures_iter(content) {
        push(&caps[1]);
    }

    terms
}

fn single_quoted_spans(content: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = content.char_indices().collect();
    let is_word = |i: usize| chars.get(i).is_some_and(|(_, c)| c.is_alphanumeric());

    let mut spans = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let opens = chars[i].1 == '\'' && !(i > 0 && is_word(i - 1)) && is_word(i + 1);
        if !opens {
            i += 1;
            continue;
        }

        let mut close = None;
        for j in (i + 1)..chars.len() {
            match chars[j].1 {
                '\n' => break,
                '\'' if !is_word(j + 1) => {
                    close = Some(j);
                    break;
                }
                _ => {}
            }
        }

        match close {
            Some(j) => {
                let span = &content[chars[i].0 + 1..chars[j].0];
                if span.chars().count() <= MAX_SINGLE_QUOTED_LEN {
                    spans.push(span);
                }
                i = j + 1;
            }
            None => i += 1,
        }
    }
    spans
}

/// Lowercase, split on non-alphanumerics, singularize, and drop short tokens and stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| singularize(&t.to_lowercase()))
        .filter(|t| t.chars().count() >= 2 && !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Crude English plural folding, applied identically to documents and queries.
pub fn singularize(word: &str) -> String {
    let len = word.chars().count();
    if !word.chars().all(|c| c.is_alphabetic()) || len < 3 {
        return word.to_string();
    }
    if len > 4 {
        if let Some(stem) = word.strip_suffix("ies") {
            return format!("{stem}y");
        }
    }
    if let Some(stem) = word.strip_suffix("yses") {
        return format!("{stem}ysis");
    }
    if ["sses", "shes", "ches", "xes"]
        .iter()
        .any(|suffix| word.ends_with(suffix))
        || consonant_before_uses(word)
    {
        return word[..word.len() - 2].to_string();
    }
    if word.ends_with('s') && !["ss", "us", "is"].iter().any(|s| word.ends_with(s)) {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

/// `statuses`, `buses`, `bonuses`; not `causes` or `houses`.
fn consonant_before_uses(word: &str) -> bool {
    word.strip_suffix("uses")
        .and_then(|stem| stem.chars().last())
        .is_some_and(|c| !"aeiou".contains(c))
}

/// Text embedded for a guide: title, schema hints, headings, then the body, capped.
pub fn compose_embedding_text(guide: &ParsedGuide) -> String {
    let mut text = guide.title.clone();
    if !guide.schema_hints.is_empty() {
        text.push_str("\nSchemas: ");
        text.push_str(&guide.schema_hints.join(", "));
    }
    if !guide.headers.is_empty() {
        text.push_str("\nSections: ");
        text.push_str(&guide.headers.join(". "));
    }
    text.push_str("\n\n");
    text.push_str(&guide.text);
    text.chars().take(MAX_EMBEDDING_TEXT_CHARS).collect()
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn humanize(stem: &str) -> String {
    stem.split(['_', '-'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
