//! Card-location and field-extraction heuristics over a parsed page.
//!
//! Everything here is a pure function of the HTML so it can be exercised
//! against synthetic fixtures.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::config::dom_vocab::{
    ACTION_LABELS, BUY_KEYWORDS, CURRENCY_MARKERS, ROW_AMOUNT_CELL, ROW_METHOD_CELL, STOP_WORDS,
};
use crate::config::UNKNOWN_METHOD;
use crate::pipeline::normalizer::parse_decimal;
use crate::types::{DomExtract, RawRecord};

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥', '₿'];

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d[\d.,]*\d|\d)\s*(?:USDC|USDT|USD)\b").expect("valid amount regex")
    })
}

fn digit_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{2,}").expect("valid digit-run regex"))
}

fn button_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| {
        Selector::parse(r#"button, [role="button"], a, input[type="button"], input[type="submit"]"#)
            .expect("valid button selector")
    })
}

fn cell_selector() -> &'static Selector {
    static SEL: OnceLock<Selector> = OnceLock::new();
    SEL.get_or_init(|| {
        Selector::parse(r#"td, th, [role="cell"], [role="gridcell"]"#).expect("valid cell selector")
    })
}

// ---------------------------------------------------------------------------
// Text predicates
// ---------------------------------------------------------------------------

pub fn has_currency_marker(text: &str) -> bool {
    CURRENCY_MARKERS.iter().any(|m| text.contains(m))
}

/// First decimal-plus-currency-suffix amount in `text`.
pub fn amount_in(text: &str) -> Option<f64> {
    amount_re()
        .captures_iter(text)
        .filter_map(|caps| parse_decimal(caps.get(1)?.as_str()))
        .next()
}

fn words_lower(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

pub fn is_action_label(text: &str) -> bool {
    words_lower(text).any(|w| ACTION_LABELS.contains(&w.as_str()))
}

fn is_stop_line(line: &str) -> bool {
    let lower = line.trim().to_lowercase();
    if STOP_WORDS.contains(&lower.as_str()) {
        return true;
    }
    words_lower(line)
        .next()
        .is_some_and(|first| STOP_WORDS.contains(&first.as_str()))
}

/// First line that is not a stop word, carries no currency symbol and has no
/// run of two or more digits.
pub fn pick_label<'a, I>(lines: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find(|l| {
            !is_stop_line(l)
                && !l.contains(CURRENCY_SYMBOLS)
                && !has_currency_marker(l)
                && !digit_run_re().is_match(l)
        })
        .map(str::to_string)
}

fn is_buy_text<'a, I>(lines: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .any(|l| words_lower(l).any(|w| BUY_KEYWORDS.contains(&w.as_str())))
}

// ---------------------------------------------------------------------------
// Element helpers
// ---------------------------------------------------------------------------

/// Visible text lines of an element in document order.
pub fn text_lines(el: ElementRef<'_>) -> Vec<String> {
    el.text()
        .flat_map(str::lines)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn action_button_count(el: ElementRef<'_>) -> usize {
    el.select(button_selector())
        .filter(|button| {
            let label: String = button.text().collect::<Vec<_>>().join(" ");
            let value = button.value().attr("value").unwrap_or_default();
            is_action_label(&label) || is_action_label(value)
        })
        .count()
}

fn is_row(el: ElementRef<'_>) -> bool {
    el.value().name() == "tr" || el.value().attr("role") == Some("row")
}

fn owns_currency_text(el: ElementRef<'_>) -> bool {
    el.children()
        .filter_map(|child| child.value().as_text())
        .any(|text| has_currency_marker(text))
}

// ---------------------------------------------------------------------------
// Card location & extraction
// ---------------------------------------------------------------------------

/// Walks from `anchor` up at most `max_depth` ancestors and returns the first
/// element that contains a recognized action button. An ancestor holding
/// several action buttons spans more than one card and yields nothing.
pub fn locate_card(anchor: ElementRef<'_>, max_depth: usize) -> Option<ElementRef<'_>> {
    let candidates = std::iter::once(anchor)
        .chain(anchor.ancestors().filter_map(ElementRef::wrap))
        .take(max_depth + 1);
    for el in candidates {
        match action_button_count(el) {
            0 => continue,
            1 => return Some(el),
            _ => return None,
        }
    }
    None
}

/// Pulls amount, label and direction out of a located card. Rows read fixed
/// cell positions; other cards are read as free text.
pub fn extract_card(card: ElementRef<'_>) -> Option<RawRecord> {
    if is_row(card) {
        return extract_row(card);
    }
    let lines = text_lines(card);
    let amount = amount_in(&lines.join(" "))?;
    let method = pick_label(lines.iter().map(String::as_str))
        .unwrap_or_else(|| UNKNOWN_METHOD.to_string());
    let is_buy = is_buy_text(lines.iter().map(String::as_str));
    Some(RawRecord::DomCard(DomExtract {
        amount,
        method,
        is_buy,
    }))
}

fn extract_row(row: ElementRef<'_>) -> Option<RawRecord> {
    let cells: Vec<ElementRef<'_>> = row.select(cell_selector()).collect();
    let cell_text = |idx: usize| -> Option<String> {
        cells
            .get(idx)
            .map(|c| text_lines(*c).join(" "))
            .filter(|t| !t.is_empty())
    };
    let amount_text = cell_text(ROW_AMOUNT_CELL)?;
    let amount = amount_in(&amount_text).or_else(|| {
        let numeric: String = amount_text
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
            .collect();
        parse_decimal(&numeric)
    })?;
    let method = cell_text(ROW_METHOD_CELL).unwrap_or_else(|| UNKNOWN_METHOD.to_string());
    let lines = text_lines(row);
    let is_buy = is_buy_text(lines.iter().map(String::as_str));
    Some(RawRecord::DomRow(DomExtract {
        amount,
        method,
        is_buy,
    }))
}

/// Scans a full page snapshot. Elements that do not yield both a button and
/// a parsable amount are skipped; each card is reported once per scan.
pub fn scan_document(html: &str, max_depth: usize) -> Vec<RawRecord> {
    let document = Html::parse_document(html);
    let mut seen_cards = HashSet::new();
    let mut records = Vec::new();

    for el in document.root_element().descendants().filter_map(ElementRef::wrap) {
        if matches!(el.value().name(), "script" | "style" | "noscript") || !owns_currency_text(el) {
            continue;
        }
        let Some(card) = locate_card(el, max_depth) else {
            continue;
        };
        if !seen_cards.insert(card.id()) {
            continue;
        }
        if let Some(record) = extract_card(card) {
            records.push(record);
        }
    }
    records
}
