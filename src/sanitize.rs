//! Post-processing of raw model output.
//!
//! Small local models tend to echo the question, open with boilerplate such
//! as "Answer:" and repeat themselves. [`clean`] removes those artifacts and
//! rejects answers that are too short to be useful; callers substitute
//! [`FALLBACK_ANSWER`] when it returns `None`.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

/// Shown in place of an answer that [`clean`] rejected.
pub const FALLBACK_ANSWER: &str = "I found relevant information but couldn't generate a clear answer. Please check the references below or try rephrasing your question.";

/// The question echo is only removed when it ends within this many characters.
const ECHO_WINDOW_CHARS: usize = 150;
/// Answers shorter than this are rejected.
const MIN_ANSWER_CHARS: usize = 15;
/// Lines this short or shorter are noise.
const MIN_LINE_CHARS: usize = 3;

static PREFIXES: Lazy<[Regex; 2]> = Lazy::new(|| {
    [
        Regex::new(r"(?im)^(Answer|Response|Assistant|AI):\s*").unwrap(),
        Regex::new(r"(?im)^(According to|Based on) (the )?(documents?|context|information)[,:]?\s*")
            .unwrap(),
    ]
});

/// Clean raw model output for `question`. Returns `None` when nothing usable
/// is left.
///
/// Applying `clean` to its own output returns that output unchanged.
pub fn clean(raw: &str, question: &str) -> Option<String> {
    let question = question.trim();
    let echo = echo_pattern(question);

    let mut answer = raw.trim().to_string();
    loop {
        let next = clean_pass(&answer, echo.as_ref());
        if next == answer {
            break;
        }
        answer = next;
    }

    if answer.chars().count() < MIN_ANSWER_CHARS || answer.to_lowercase() == question.to_lowercase() {
        tracing::debug!(chars = answer.chars().count(), "rejected degenerate answer");
        return None;
    }
    Some(answer)
}

fn echo_pattern(question: &str) -> Option<Regex> {
    if question.is_empty() {
        return None;
    }
    Regex::new(&format!("(?i){}", regex::escape(question))).ok()
}

fn clean_pass(text: &str, echo: Option<&Regex>) -> String {
    let mut answer = text.trim();

    if let Some(m) = echo.and_then(|re| re.find(answer)) {
        if answer[..m.end()].chars().count() <= ECHO_WINDOW_CHARS {
            answer = answer[m.end()..].trim();
        }
    }

    let mut stripped = answer.to_string();
    for pattern in PREFIXES.iter() {
        stripped = pattern.replace_all(&stripped, "").into_owned();
    }

    dedupe_lines(&stripped)
}

fn dedupe_lines(text: &str) -> String {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let key = line.to_lowercase();
        if key.chars().count() > MIN_LINE_CHARS && seen.insert(key) {
            kept.push(dedupe_sentences(line));
        }
    }
    kept.join("\n").trim().to_string()
}

/// Drop sentences repeated within one line. The line is returned untouched
/// when it has no repeats.
fn dedupe_sentences(line: &str) -> String {
    let sentences = split_sentences(line);
    let mut seen = HashSet::new();
    let unique: Vec<&str> = sentences
        .iter()
        .copied()
        .filter(|s| seen.insert(s.to_lowercase()))
        .collect();

    if unique.len() == sentences.len() {
        line.to_string()
    } else {
        unique.join(" ")
    }
}

/// A sentence ends at a run of `.`, `!` or `?` followed by whitespace or the
/// end of the line.
fn split_sentences(line: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = line.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0;

    for (i, &(idx, c)) in chars.iter().enumerate() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let at_boundary = chars.get(i + 1).map_or(true, |&(_, next)| next.is_whitespace());
        if at_boundary {
            let end = idx + c.len_utf8();
            let sentence = line[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let rest = line[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}
