// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// NLP entity path
//
// Named-entity recognition for personal-data classes. Unlike the fast path,
// this pass collects every candidate in the text and validates each with a
// deterministic check (Luhn for credit cards, area/group/serial rules for
// SSNs) before reporting, so it is meaningfully slower and sits behind the
// calibrated sync threshold.

use std::sync::OnceLock;

use regex::Regex;

use super::{Decision, RiskLevel, ScanOrigin, ScanResult};

/// A single recognized entity.
#[derive(Debug, Clone)]
pub struct EntityMatch {
    pub entity_type: &'static str,
    pub start: usize,
    pub end: usize,
    pub score: f32,
}

/// Entity recognizer pipeline. Built once at startup from the configured
/// entity set; `scan` is synchronous and CPU-only.
pub struct NlpScanner {
    credit_card: bool,
    ssn: bool,
    email: bool,
    phone: bool,
    crypto: bool,
}

struct Recognizers {
    digit_run: Regex,
    ssn: Regex,
    email: Regex,
    phone: Regex,
    crypto: Vec<(&'static str, Regex)>,
}

fn recognizers() -> &'static Recognizers {
    static RECOGNIZERS: OnceLock<Recognizers> = OnceLock::new();
    RECOGNIZERS.get_or_init(|| Recognizers {
        // Candidate runs of 13-19 digits with optional separators; validated
        // with Luhn before reporting.
        digit_run: Regex::new(r"\b\d(?:[-\s]?\d){12,18}\b").unwrap(),
        ssn: Regex::new(r"\b(\d{3})[-. ]?(\d{2})[-. ]?(\d{4})\b").unwrap(),
        email: Regex::new(r"\b[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}\b").unwrap(),
        phone: Regex::new(
            r"(?:\+1[-.\s]?)?(?:\([2-9][0-9]{2}\)|[2-9][0-9]{2})[-.\s][0-9]{3}[-.\s]?[0-9]{4}",
        )
        .unwrap(),
        crypto: vec![
            ("CRYPTO", Regex::new(r"\b[13][a-km-zA-HJ-NP-Z1-9]{25,34}\b").unwrap()),
            ("CRYPTO", Regex::new(r"\bbc1[ac-hj-np-z02-9]{6,87}\b").unwrap()),
            ("CRYPTO", Regex::new(r"\b0x[a-fA-F0-9]{40}\b").unwrap()),
        ],
    })
}

impl NlpScanner {
    /// Build a scanner restricted to the configured entity set. Recognizer
    /// patterns compile here, not on the first request.
    pub fn new(entity_set: &[String]) -> Self {
        let _ = recognizers();
        let has = |name: &str| entity_set.iter().any(|e| e == name);
        Self {
            credit_card: has("CREDIT_CARD"),
            ssn: has("US_SSN"),
            email: has("EMAIL_ADDRESS"),
            phone: has("PHONE_NUMBER"),
            crypto: has("CRYPTO"),
        }
    }

    /// Recognize every entity in `text`. Collects all matches rather than
    /// short-circuiting on the first, so callers can audit the full set.
    pub fn scan(&self, text: &str) -> Vec<EntityMatch> {
        let r = recognizers();
        let mut out = Vec::new();

        if self.credit_card {
            for m in r.digit_run.find_iter(text) {
                let digits: String = m.as_str().chars().filter(|c| c.is_ascii_digit()).collect();
                if (13..=19).contains(&digits.len()) && luhn_valid(&digits) {
                    out.push(EntityMatch {
                        entity_type: "CREDIT_CARD",
                        start: m.start(),
                        end: m.end(),
                        score: 1.0,
                    });
                }
            }
        }

        if self.ssn {
            for caps in r.ssn.captures_iter(text) {
                let m = caps.get(0).unwrap();
                if ssn_plausible(&caps[1], &caps[2], &caps[3])
                    && !overlaps(&out, m.start(), m.end())
                {
                    out.push(EntityMatch {
                        entity_type: "US_SSN",
                        start: m.start(),
                        end: m.end(),
                        score: 0.85,
                    });
                }
            }
        }

        if self.email {
            for m in r.email.find_iter(text) {
                out.push(EntityMatch {
                    entity_type: "EMAIL_ADDRESS",
                    start: m.start(),
                    end: m.end(),
                    score: 1.0,
                });
            }
        }

        if self.phone {
            for m in r.phone.find_iter(text) {
                if !overlaps(&out, m.start(), m.end()) {
                    out.push(EntityMatch {
                        entity_type: "PHONE_NUMBER",
                        start: m.start(),
                        end: m.end(),
                        score: 0.7,
                    });
                }
            }
        }

        if self.crypto {
            for (entity, re) in &r.crypto {
                for m in re.find_iter(text) {
                    out.push(EntityMatch {
                        entity_type: entity,
                        start: m.start(),
                        end: m.end(),
                        score: 0.9,
                    });
                }
            }
        }

        out
    }

    /// Scan and convert to a ScanResult: the highest-scoring entity becomes
    /// the primary detection.
    pub fn scan_result(&self, text: &str, scan_id: &str) -> ScanResult {
        let entities = self.scan(text);
        match entities
            .iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
        {
            Some(primary) => nlp_block_result(text, primary, scan_id),
            None => ScanResult::pass(scan_id, ScanOrigin::Nlp),
        }
    }
}

fn overlaps(found: &[EntityMatch], start: usize, end: usize) -> bool {
    found.iter().any(|e| start < e.end && e.start < end)
}

/// Luhn checksum over an all-digit string.
fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0u32;
    let mut double = false;
    for c in digits.chars().rev() {
        let mut d = c.to_digit(10).unwrap_or(0);
        if double {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
        double = !double;
    }
    sum % 10 == 0
}

/// US SSN plausibility: area 000/666/9xx, group 00, and serial 0000 are
/// never issued.
fn ssn_plausible(area: &str, group: &str, serial: &str) -> bool {
    area != "000" && area != "666" && !area.starts_with('9') && group != "00" && serial != "0000"
}

pub fn nlp_block_result(text: &str, entity: &EntityMatch, scan_id: &str) -> ScanResult {
    let rule_id = format!("NLP_{}", entity.entity_type);

    let ctx_start = floor_boundary(text, entity.start.saturating_sub(20));
    let ctx_end = ceil_boundary(text, (entity.end + 20).min(text.len()));
    let excerpt = format!(
        "{}[REDACTED]{}",
        &text[ctx_start..entity.start],
        &text[entity.end..ctx_end]
    );

    let hint = super::regex_engine::make_suppression_hint(
        &rule_id,
        &entity.entity_type.to_lowercase(),
    );

    ScanResult {
        decision: Decision::Block,
        scan_id: scan_id.to_string(),
        rule_id: Some(rule_id),
        risk_level: Some(RiskLevel::High),
        redacted_excerpt: Some(excerpt),
        suppression_hint: Some(hint),
        origin: ScanOrigin::Nlp,
        test: false,
        suppressed_by_allowlist: false,
        tokens_delivered: None,
    }
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
