//! Candidate scoring against the source record.
//!
//! Weighted similarity: title 0.40, author 0.30, publisher 0.15, year
//! 0.10, plus a 0.05 ISBN bonus. An exact ISBN match short-circuits to a
//! full score.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::sources::CandidateBook;
use crate::store::Item;

const TITLE_WEIGHT: f64 = 0.40;
const AUTHOR_WEIGHT: f64 = 0.30;
const PUBLISHER_WEIGHT: f64 = 0.15;
const YEAR_WEIGHT: f64 = 0.10;
const ISBN_BONUS: f64 = 0.05;

/// Two candidates within this score distance are considered tied and the
/// preferred file format wins.
pub const FORMAT_TIE_BREAK_WINDOW: f64 = 0.1;

#[allow(clippy::expect_used)]
fn year_digits() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{4}").expect("static regex"))
}

fn normalize(text: &str) -> String {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Similarity of two free-text fields in [0, 1].
fn text_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

/// Year closeness: exact 1.0, one year off 0.8, two off 0.6, else 0.
fn year_similarity(publish_date: &str, candidate_year: &str) -> f64 {
    let Some(source_year) = year_digits()
        .find(publish_date)
        .and_then(|m| m.as_str().parse::<i32>().ok())
    else {
        return 0.0;
    };
    let Ok(candidate_year) = candidate_year.trim().parse::<i32>() else {
        return 0.0;
    };
    match (source_year - candidate_year).abs() {
        0 => 1.0,
        1 => 0.8,
        2 => 0.6,
        _ => 0.0,
    }
}

fn isbn_digits(isbn: &str) -> String {
    isbn.chars().filter(char::is_ascii_digit).collect()
}

fn isbn_exact(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            let a = isbn_digits(a);
            let b = isbn_digits(b);
            !a.is_empty() && a == b
        }
        _ => false,
    }
}

/// Scores one candidate against the source item, in [0, 1].
#[must_use]
pub fn match_score(item: &Item, candidate: &CandidateBook) -> f64 {
    // Exact external identifier match leaves no room for doubt
    if isbn_exact(item.isbn.as_deref(), candidate.isbn.as_deref()) {
        return 1.0;
    }

    let mut score = 0.0;

    score += text_similarity(&item.title, &candidate.title) * TITLE_WEIGHT;

    let candidate_authors = candidate
        .authors
        .as_deref()
        .map(|a| a.replace(";;", " "))
        .unwrap_or_default();
    score += text_similarity(item.author.as_deref().unwrap_or(""), &candidate_authors)
        * AUTHOR_WEIGHT;

    score += text_similarity(
        item.publisher.as_deref().unwrap_or(""),
        candidate.publisher.as_deref().unwrap_or(""),
    ) * PUBLISHER_WEIGHT;

    score += year_similarity(
        item.publish_date.as_deref().unwrap_or(""),
        candidate.year.as_deref().unwrap_or(""),
    ) * YEAR_WEIGHT;

    if isbn_exact(item.isbn.as_deref(), candidate.isbn.as_deref()) {
        score += ISBN_BONUS;
    }

    score.min(1.0)
}

/// Ranks file formats for the tie-break between close candidates.
#[derive(Debug, Clone)]
pub struct FormatRanker {
    ranks: HashMap<String, i32>,
}

impl FormatRanker {
    /// Builds a ranker from an ordered preference list (earlier wins).
    ///
    /// The stock list keeps mobi and azw3 on the same tier; a custom
    /// list ranks strictly by position.
    #[must_use]
    pub fn new(priority: &[String]) -> Self {
        let stock = ["epub", "mobi", "azw3", "pdf", "txt"];
        let is_stock = priority.len() == stock.len()
            && priority.iter().zip(stock.iter()).all(|(a, b)| a == b);

        let ranks = if is_stock {
            [("epub", 3), ("mobi", 2), ("azw3", 2), ("pdf", 1), ("txt", 0)]
                .into_iter()
                .map(|(ext, rank)| (ext.to_string(), rank))
                .collect()
        } else {
            priority
                .iter()
                .enumerate()
                .map(|(index, ext)| {
                    let rank = i32::try_from(priority.len() - index).unwrap_or(0);
                    (ext.to_lowercase(), rank)
                })
                .collect()
        };
        Self { ranks }
    }

    /// The rank of one extension; unknown formats rank lowest.
    #[must_use]
    pub fn rank(&self, extension: Option<&str>) -> i32 {
        extension
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .and_then(|ext| self.ranks.get(&ext).copied())
            .unwrap_or(-1)
    }
}
