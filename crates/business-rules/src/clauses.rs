/// Deterministic pre-check for exclusion clauses.
///
/// Guides state exclusions in prose ("Never count games that open with the French
/// Defense"). This scans those sentences for the literal terms they name and reports
/// each term the SQL never mentions inside a filtering construct. Findings are advisory
/// unless the gate is configured to enforce them.
use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::parser;
use crate::verifier::RuleText;

static EXCLUSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(never|exclud\w*|must\s+not|do\s+not\s+(?:count|include)|don't\s+(?:count|include)|omit\w*|filter(?:ed)?\s+out|ignor\w*)\b",
    )
    .expect("valid regex")
});
static CAPITALIZED_RUN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][A-Za-z0-9_]*(?:[ \t]+[A-Z][A-Za-z0-9_]*)*").expect("valid regex")
});
static FILTER_KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(where|having|case|on|qualify)\b").expect("valid regex")
});
/// Keywords that close a filter segment.
static CLAUSE_BOUNDARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(select|from|where|group\s+by|order\s+by|having|qualify|limit|union|intersect|except|window|join)\b",
    )
    .expect("valid regex")
});
static LIST_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*+]|\d+[.)])\s+").expect("valid regex"));

/// Capitalized words that are SQL or prose noise rather than data values.
const IGNORED_CAPITALIZED: &[&str] = &[
    "I", "SQL", "SELECT", "WHERE", "CASE", "WHEN", "THEN", "ELSE", "END", "AND", "OR", "NOT",
    "NULL", "IS", "IN", "LIKE", "HAVING", "JOIN", "ON",
];

const MIN_SIGNIFICANT_WORD_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClauseFinding {
    /// Key of the guide the sentence came from.
    pub source: String,
    pub sentence: String,
    pub term: String,
}

impl ClauseFinding {
    pub fn describe(&self) -> String {
        format!(
            "{}: \"{}\" names '{}', which the query never filters on",
            self.source, self.sentence, self.term
        )
    }
}

/// Exclusion clauses whose terms are not reflected in the SQL.
pub fn audit(rules: &[RuleText], sql: &str) -> Vec<ClauseFinding> {
    let segments = filter_segments(&sql.to_lowercase());
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut findings = Vec::new();

    for rule in rules {
        for sentence in sentences(&rule.text) {
            if !EXCLUSION_RE.is_match(&sentence) {
                continue;
            }
            for term in clause_terms(&sentence) {
                if is_reflected(&term, &segments) {
                    continue;
                }
                if seen.insert((rule.source.clone(), term.to_lowercase())) {
                    findings.push(ClauseFinding {
                        source: rule.source.clone(),
                        sentence: sentence.clone(),
                        term,
                    });
                }
            }
        }
    }
    findings
}

/// Slices of lowercased SQL running from each filter keyword to the next clause keyword.
fn filter_segments(sql_lower: &str) -> Vec<&str> {
    FILTER_KEYWORD_RE
        .find_iter(sql_lower)
        .map(|m| {
            let end = CLAUSE_BOUNDARY_RE
                .find_at(sql_lower, m.end())
                .map_or(sql_lower.len(), |b| b.start());
            &sql_lower[m.end()..end]
        })
        .collect()
}

/// A term is reflected when one filter segment holds the whole term, or every one of its
/// significant words.
fn is_reflected(term: &str, segments: &[&str]) -> bool {
    let term_lower = term.to_lowercase();
    let words: Vec<&str> = term_lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_SIGNIFICANT_WORD_LEN)
        .collect();
    segments.iter().any(|segment| {
        segment.contains(&term_lower)
            || (!words.is_empty() && words.iter().all(|w| segment.contains(w)))
    })
}

/// Literal terms named by a sentence: quoted spans, then capitalized runs that do not
/// start the sentence.
fn clause_terms(sentence: &str) -> Vec<String> {
    let mut terms = parser::extract_quoted_terms(sentence);
    let quoted: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();

    for m in CAPITALIZED_RUN_RE.find_iter(sentence) {
        let mut words: Vec<&str> = m.as_str().split_whitespace().collect();
        if m.start() == 0 && !words.is_empty() {
            words.remove(0);
        }
        words.retain(|w| !IGNORED_CAPITALIZED.contains(w));
        if words.is_empty() {
            continue;
        }
        let run = words.join(" ");
        let lower = run.to_lowercase();
        // skip words already covered by a quoted span, e.g. 'Closed'
        if quoted.iter().any(|q| q.contains(&lower)) {
            continue;
        }
        if !terms.iter().any(|t| t.eq_ignore_ascii_case(&run)) {
            terms.push(run);
        }
    }
    terms
}

/// Split markdown into sentences. Headings, blank lines and list items break paragraphs.
fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut paragraph = String::new();

    for line in text.lines() {
        let line = line.trim();
        let is_list_item = LIST_MARKER_RE.is_match(line);
        if line.is_empty() || line.starts_with('#') || is_list_item {
            split_sentences(&paragraph, &mut out);
            paragraph.clear();
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !paragraph.is_empty() {
            paragraph.push(' ');
        }
        paragraph.push_str(&LIST_MARKER_RE.replace(line, ""));
    }
    split_sentences(&paragraph, &mut out);
    out
}

fn split_sentences(paragraph: &str, out: &mut Vec<String>) {
    let mut chars = paragraph.char_indices().peekable();
    let mut start = 0;
    while let Some((i, c)) = chars.next() {
        let at_boundary = matches!(c, '.' | '!' | '?')
            && chars.peek().is_none_or(|(_, next)| next.is_whitespace());
        if at_boundary {
            push_sentence(&paragraph[start..i + c.len_utf8()], out);
            start = i + c.len_utf8();
        }
    }
    push_sentence(&paragraph[start..], out);
}

fn push_sentence(sentence: &str, out: &mut Vec<String>) {
    let sentence = sentence.trim();
    if !sentence.is_empty() {
        out.push(sentence.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CHESS, CRAFT_BEER, FINANCIAL_MARKETS};

    fn rule(source: &str, text: &str) -> RuleText {
        RuleText {
            source: source.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn missing_french_defense_exclusion_is_reported() {
        let rules = [rule("chess_tournaments.md", CHESS)];
        let sql = "SELECT opening, COUNT(*) FROM chess.games GROUP BY opening";
        let findings = audit(&rules, sql);
        assert!(
            findings.iter().any(|f| f.term == "French Defense"),
            "findings: {findings:?}"
        );
        let french = findings.iter().find(|f| f.term == "French Defense").unwrap();
        assert!(french.sentence.starts_with("Never count games"));
        assert!(french.describe().starts_with("chess_tournaments.md: \"Never count"));
    }

    #[test]
    fn exclusion_in_a_where_clause_is_reflected() {
        let rules = [rule("chess_tournaments.md", CHESS)];
        let sql = "SELECT opening, COUNT(*) FROM chess.games \
                   WHERE opening NOT LIKE '%French Defense%' GROUP BY opening";
        let findings = audit(&rules, sql);
        assert!(findings.iter().all(|f| f.term != "French Defense"));

        let nested = "SELECT COUNT(*) FROM chess.games g JOIN chess.openings o \
                      ON o.id = g.opening_id AND o.family <> 'French' AND o.variant <> 'Defense' \
                      GROUP BY 1";
        assert!(audit(&rules, nested).iter().all(|f| f.term != "French Defense"));
    }

    #[test]
    fn excluding_a_different_opening_does_not_cover_the_clause() {
        let rules = [rule("chess_tournaments.md", CHESS)];
        let sql = "SELECT COUNT(*) FROM chess.games WHERE opening NOT LIKE '%Sicilian Defense%'";
        let findings = audit(&rules, sql);
        assert!(
            findings.iter().any(|f| f.term == "French Defense"),
            "findings: {findings:?}"
        );
    }

    #[test]
    fn term_in_the_select_list_is_not_a_filter() {
        let rules = [rule("chess_tournaments.md", CHESS)];
        let sql = "SELECT 'French Defense' AS family, COUNT(*) FROM chess.games WHERE id > 0";
        let findings = audit(&rules, sql);
        assert!(findings.iter().any(|f| f.term == "French Defense"));
    }

    #[test]
    fn subquery_filters_count() {
        let rules = [rule("chess_tournaments.md", CHESS)];
        let sql = "SELECT COUNT(*) FROM chess.games WHERE id NOT IN \
                   (SELECT id FROM chess.games WHERE opening = 'French Defense')";
        assert!(audit(&rules, sql).iter().all(|f| f.term != "French Defense"));
    }

    #[test]
    fn filter_segments_stop_at_the_next_clause() {
        let sql = "select a from t where x = 1 group by a having count(*) > 2 order by a";
        assert_eq!(filter_segments(sql), vec![" x = 1 ", " count(*) > 2 "]);
    }

    #[test]
    fn term_outside_a_filter_does_not_count() {
        let rules = [rule("craft_beer_inventory.md", CRAFT_BEER)];
        let sql = "SELECT 'Closed' AS label, name FROM craft_beer.breweries";
        let findings = audit(&rules, sql);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].term, "Closed");
    }

    #[test]
    fn quoted_terms_are_not_duplicated_as_capitalized_runs() {
        let rules = [rule("financial_markets.md", FINANCIAL_MARKETS)];
        let findings = audit(&rules, "SELECT SUM(volume) FROM markets.trades");
        let terms: Vec<&str> = findings.iter().map(|f| f.term.as_str()).collect();
        assert_eq!(terms, vec!["CANCELLED"]);
    }

    #[test]
    fn sentences_without_exclusion_markers_are_ignored() {
        let rules = [rule("g.md", "Status 'A' means finished. Join on Account ids.")];
        assert!(audit(&rules, "SELECT 1").is_empty());
    }

    #[test]
    fn splits_paragraphs_lists_and_headings() {
        let text = "# Title\n\nFirst line\ncontinues here. Second one!\n- Item one\n- Item two";
        assert_eq!(
            sentences(text),
            vec![
                "First line continues here.",
                "Second one!",
                "Item one",
                "Item two",
            ]
        );
    }

    #[test]
    fn apostrophes_do_not_produce_terms() {
        let terms = clause_terms("Don't count the tournament's forfeits.");
        assert!(terms.is_empty(), "terms: {terms:?}");
    }
}
