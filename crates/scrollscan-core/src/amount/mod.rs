//! Value parser for amounts read off the feed.
//!
//! Accepts compact suffixes ("45b", "39.1 mil"), arithmetic sums
//! ("14 + 15 + 16"), stated equations ("14 + 15 + 16 = 45b"), level forms
//! ("CP 23 = 39.1 plata") and labelled contributions ("total: 45b").
//! Amounts without a suffix are read in the parser's default unit
//! (billions unless configured otherwise).

pub mod expr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

const NUMBER: &str = r"(\d+(?:\.\d+)?)";
const SUFFIX: &str = r"(bill|mil|[kmbt])?";

static CP_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"cp\s*(\d+)\s*(?:valor)?\s*=\s*{NUMBER}\s*{SUFFIX}\b"))
        .expect("cp pattern is valid")
});

static EQUATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^([\d\s+\-*/().]+?)\s*=\s*{NUMBER}\s*{SUFFIX}\b"))
        .expect("equation pattern is valid")
});

static NUMBER_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^{NUMBER}\s*(bill|mil|[kmbt])$")).expect("number-unit pattern is valid")
});

static CONTRIBUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:contribución|contribucion|contribution|aporte|total|suma)[\s:]*{NUMBER}\s*{SUFFIX}\b"
    ))
    .expect("contribution pattern is valid")
});

static EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\d\s+\-*/().]+$").expect("expression pattern is valid"));

static SIMPLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{NUMBER}\s*{SUFFIX}\b")).expect("simple pattern is valid")
});

/// Errors raised when text cannot be read as an amount.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AmountParseError {
    #[error("empty input")]
    Empty,
    #[error("no amount pattern matched {0:?}")]
    NoMatch(String),
    #[error("invalid number literal {0:?}")]
    InvalidNumber(String),
    #[error("unexpected character {0:?} in expression")]
    UnexpectedChar(char),
    #[error("unbalanced parentheses")]
    UnbalancedParens,
    #[error("malformed expression")]
    MalformedExpression,
    #[error("division by zero")]
    DivisionByZero,
}

/// Magnitude suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Thousand,
    Million,
    Billion,
    Trillion,
}

impl Unit {
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "k" => Some(Unit::Thousand),
            "m" | "mil" => Some(Unit::Million),
            "b" | "bill" => Some(Unit::Billion),
            "t" => Some(Unit::Trillion),
            _ => None,
        }
    }

    pub fn multiplier(&self) -> f64 {
        match self {
            Unit::Thousand => 1e3,
            Unit::Million => 1e6,
            Unit::Billion => 1e9,
            Unit::Trillion => 1e12,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Unit::Thousand => "k",
            Unit::Million => "m",
            Unit::Billion => "b",
            Unit::Trillion => "t",
        }
    }
}

/// Which textual form produced the amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseMethod {
    CpValue,
    Equation,
    NumberUnit,
    Contribution,
    Expression,
    Simple,
}

/// A parsed amount, already scaled to base units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amount {
    pub text: String,
    pub value: f64,
    pub unit: Unit,
    pub method: ParseMethod,
    /// Result of evaluating the left side of an equation, when present.
    pub computed: Option<f64>,
    pub cp_level: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AmountParser {
    default_unit: Unit,
}

impl AmountParser {
    pub fn new() -> Self {
        Self {
            default_unit: Unit::Billion,
        }
    }

    pub fn with_default_unit(default_unit: Unit) -> Self {
        Self { default_unit }
    }

    /// Parses `text` into an amount in base units.
    pub fn parse(&self, text: &str) -> Result<Amount, AmountParseError> {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(AmountParseError::Empty);
        }

        if let Some(caps) = CP_VALUE.captures(&normalized) {
            let cp_level = caps[1].parse::<u32>().ok();
            let (value, unit) = self.scaled(&caps[2], caps.get(3).map(|m| m.as_str()))?;
            return Ok(self.amount(&normalized, value, unit, ParseMethod::CpValue)
                .with_cp_level(cp_level));
        }

        if let Some(caps) = EQUATION.captures(&normalized) {
            let (value, unit) = self.scaled(&caps[2], caps.get(3).map(|m| m.as_str()))?;
            let computed = expr::evaluate(&caps[1]).ok().map(|v| v * unit.multiplier());
            if computed.is_some_and(|c| (c - value).abs() > value.abs() * 1e-6) {
                log::debug!(
                    "stated amount {} disagrees with its expression {:?}",
                    value,
                    &caps[1]
                );
            }
            let mut amount = self.amount(&normalized, value, unit, ParseMethod::Equation);
            amount.computed = computed;
            return Ok(amount);
        }

        if let Some(caps) = NUMBER_UNIT.captures(&normalized) {
            let (value, unit) = self.scaled(&caps[1], Some(&caps[2]))?;
            return Ok(self.amount(&normalized, value, unit, ParseMethod::NumberUnit));
        }

        if let Some(caps) = CONTRIBUTION.captures(&normalized) {
            let (value, unit) = self.scaled(&caps[1], caps.get(2).map(|m| m.as_str()))?;
            return Ok(self.amount(&normalized, value, unit, ParseMethod::Contribution));
        }

        if EXPRESSION.is_match(&normalized) && normalized.contains(['+', '-', '*', '/']) {
            let raw = expr::evaluate(&normalized)?;
            let unit = self.default_unit;
            return Ok(self.amount(&normalized, raw * unit.multiplier(), unit, ParseMethod::Expression));
        }

        if let Some(caps) = SIMPLE.captures(&normalized) {
            let (value, unit) = self.scaled(&caps[1], caps.get(2).map(|m| m.as_str()))?;
            return Ok(self.amount(&normalized, value, unit, ParseMethod::Simple));
        }

        Err(AmountParseError::NoMatch(normalized))
    }

    fn scaled(&self, number: &str, suffix: Option<&str>) -> Result<(f64, Unit), AmountParseError> {
        let value = number
            .parse::<f64>()
            .map_err(|_| AmountParseError::InvalidNumber(number.to_string()))?;
        let unit = suffix.and_then(Unit::from_suffix).unwrap_or(self.default_unit);
        Ok((value * unit.multiplier(), unit))
    }

    fn amount(&self, text: &str, value: f64, unit: Unit, method: ParseMethod) -> Amount {
        Amount {
            text: text.to_string(),
            value,
            unit,
            method,
            computed: None,
            cp_level: None,
        }
    }
}

impl Default for AmountParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Amount {
    fn with_cp_level(mut self, cp_level: Option<u32>) -> Self {
        self.cp_level = cp_level;
        self
    }
}

/// Formats a base-unit value with the largest fitting suffix ("45.5b").
pub fn format_amount(value: f64, precision: usize) -> String {
    for unit in [Unit::Trillion, Unit::Billion, Unit::Million, Unit::Thousand] {
        if value.abs() >= unit.multiplier() {
            return format!("{:.*}{}", precision, value / unit.multiplier(), unit.suffix());
        }
    }
    format!("{:.*}", precision, value)
}
