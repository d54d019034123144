//! Cleanup for text returned by the recognizer.

use regex::Regex;
use std::sync::LazyLock;

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

static NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(?:player|jugador|user|usuario)[\s:]+([^\n\r]+)",
        r"(?i)(?:name|nombre)[\s:]+([^\n\r]+)",
        r"^([A-Za-z0-9_\-\s]+?)[\s:]+\d",
        r"\[([^\]]+)\]",
        r"^([A-Za-z0-9_\-]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("name pattern is valid"))
    .collect()
});

/// Strings at most this long get letter-context digit fixes.
const SHORT_TEXT_LEN: usize = 30;

/// Collapses whitespace, drops bracket noise and fixes digits the
/// recognizer confuses with letters when they sit between letters.
///
/// Parentheses survive only around arithmetic ("(14 + 16) * 2").
pub fn clean_ocr_text(text: &str) -> String {
    let collapsed = WHITESPACE.replace_all(text, " ");
    let chars: Vec<char> = collapsed.trim().chars().collect();
    let keep = arithmetic_parens(&chars);
    let stripped: String = chars
        .iter()
        .enumerate()
        .filter(|&(i, c)| match *c {
            '(' | ')' => keep[i],
            '|' | '_' | '[' | ']' | '{' | '}' | '<' | '>' => false,
            _ => true,
        })
        .map(|(_, &c)| c)
        .collect();

    if stripped.chars().count() >= SHORT_TEXT_LEN {
        return stripped.trim().to_string();
    }

    let chars: Vec<char> = stripped.chars().collect();
    let fixed: String = chars
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let between_letters = i > 0
                && i + 1 < chars.len()
                && chars[i - 1].is_ascii_alphabetic()
                && chars[i + 1].is_ascii_alphabetic();
            match c {
                '0' if between_letters => 'O',
                '1' if between_letters => 'l',
                other => other,
            }
        })
        .collect();

    fixed.trim().to_string()
}

/// Marks balanced parentheses whose group holds nothing but an arithmetic
/// expression with at least one digit.
fn arithmetic_parens(chars: &[char]) -> Vec<bool> {
    let mut keep = vec![false; chars.len()];
    let mut open = Vec::new();

    for (i, &c) in chars.iter().enumerate() {
        match c {
            '(' => open.push(i),
            ')' => {
                let Some(start) = open.pop() else { continue };
                let inner = &chars[start + 1..i];
                let arithmetic = inner.iter().any(|c| c.is_ascii_digit())
                    && inner.iter().all(|&c| {
                        c.is_ascii_digit() || c == ' ' || matches!(c, '+' | '-' | '*' | '/' | '.' | '(' | ')')
                    });
                if arithmetic {
                    keep[start] = true;
                    keep[i] = true;
                }
            }
            _ => {}
        }
    }
    keep
}

/// Pulls a plausible player name (2..=30 chars, not all digits) out of a line.
pub fn extract_player_name(text: &str) -> Option<String> {
    let text = text.trim();
    let plausible = |name: &str| {
        let len = name.chars().count();
        (2..=30).contains(&len) && !name.chars().all(|c| c.is_ascii_digit())
    };

    for pattern in NAME_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            let name = caps[1].trim();
            if plausible(name) {
                return Some(name.to_string());
            }
        }
    }

    text.split_whitespace()
        .find(|word| plausible(word))
        .map(str::to_string)
}
