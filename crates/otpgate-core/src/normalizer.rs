//! Rewrites typographic characters so a message costs fewer parts

use crate::encoding::{is_gsm7, segment, Segmentation};
use otpgate_common::types::Encoding;
use otpgate_common::Result;
use serde::Serialize;

/// Typographic characters and their GSM-7 friendly replacements
const REPLACEMENTS: &[(char, &str)] = &[
    ('\u{201C}', "\""),
    ('\u{201D}', "\""),
    ('\u{201E}', "\""),
    ('\u{00AB}', "\""),
    ('\u{00BB}', "\""),
    ('\u{2018}', "'"),
    ('\u{2019}', "'"),
    ('\u{2014}', "-"),
    ('\u{2013}', "-"),
    ('\u{2026}', "..."),
    ('\u{2116}', "N"),
    ('\u{00B0}', " "),
    ('\u{00A0}', " "),
    ('\u{2122}', "(TM)"),
    ('\u{00A9}', "(C)"),
    ('\u{00AE}', "(R)"),
];

/// Before/after view of a normalized message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Normalization {
    pub original_message: String,
    pub normalized_message: String,
    pub original: Segmentation,
    pub normalized: Segmentation,
    /// Share of parts saved, 0 when nothing was saved
    pub savings_percent: f64,
    pub recommendations: Vec<String>,
}

/// Replace typographic characters and report the part savings.
///
/// Part counts are not capped here; the send path enforces the part limit.
pub fn normalize(text: &str) -> Result<Normalization> {
    let original = segment(text, u32::MAX)?;

    let mut normalized_message = String::with_capacity(text.len());
    for c in text.chars() {
        match REPLACEMENTS.iter().find(|(from, _)| *from == c) {
            Some((_, to)) => normalized_message.push_str(to),
            None => normalized_message.push(c),
        }
    }
    let normalized = segment(&normalized_message, u32::MAX)?;

    let savings_percent = if normalized.part_count < original.part_count {
        f64::from(original.part_count - normalized.part_count) * 100.0
            / f64::from(original.part_count)
    } else {
        0.0
    };

    let mut recommendations = Vec::new();
    if normalized.part_count < original.part_count {
        recommendations.push(format!(
            "Normalized message reduces SMS parts from {} to {}",
            original.part_count, normalized.part_count
        ));
    }
    if original.encoding == Encoding::Ucs2 && normalized.encoding == Encoding::Gsm7 {
        recommendations.push("Normalized message fits the GSM-7 alphabet".to_string());
    }

    let original_chars = text.chars().count();
    let normalized_chars = normalized_message.chars().count();
    if normalized_chars < original_chars {
        recommendations.push(format!(
            "Removed {} special characters",
            original_chars - normalized_chars
        ));
    }

    if normalized.encoding == Encoding::Ucs2 {
        let mut sample = String::new();
        for c in normalized_message.chars().filter(|c| !is_gsm7(*c)) {
            if !sample.contains(c) {
                sample.push(c);
            }
            if sample.chars().count() == 5 {
                break;
            }
        }
        recommendations.push(format!(
            "Characters outside the GSM-7 alphabet keep the message in UCS-2: {}",
            sample
        ));
    }
    if normalized_message.contains("http://") || normalized_message.contains("https://") {
        recommendations.push("Consider using URL shortener to reduce message length".to_string());
    }
    if normalized_message.contains("  ") {
        recommendations.push("Remove extra spaces to reduce message length".to_string());
    }

    Ok(Normalization {
        original_message: text.to_string(),
        normalized_message,
        original,
        normalized,
        savings_percent,
        recommendations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_replaces_typographic_characters() {
        let result = normalize("\u{201C}Hi\u{201D} \u{2014} it\u{2019}s \u{2116}1\u{2026}").unwrap();
        assert_eq!(result.normalized_message, "\"Hi\" - it's N1...");
        assert_eq!(result.original.encoding, Encoding::Ucs2);
        assert_eq!(result.normalized.encoding, Encoding::Gsm7);
        assert!(result
            .recommendations
            .iter()
            .any(|r| r == "Normalized message fits the GSM-7 alphabet"));
    }

    #[test]
    fn test_savings_when_parts_drop() {
        // 80 UTF-16 units is two UCS-2 parts; the rewrite fits one GSM-7 part
        let text = format!("{}\u{2014}", "a".repeat(79));
        let result = normalize(&text).unwrap();
        assert_eq!(result.original.part_count, 2);
        assert_eq!(result.normalized.part_count, 1);
        assert_eq!(result.savings_percent, 50.0);
        assert_eq!(
            result.recommendations[0],
            "Normalized message reduces SMS parts from 2 to 1"
        );
    }

    #[test]
    fn test_plain_text_is_unchanged() {
        let result = normalize("Your code is 1234").unwrap();
        assert_eq!(result.normalized_message, "Your code is 1234");
        assert_eq!(result.savings_percent, 0.0);
        assert!(result.recommendations.is_empty());
    }

    #[test]
    fn test_hints_for_links_spaces_and_cyrillic() {
        let result = normalize("Код:  1234 https://example.com").unwrap();
        assert_eq!(result.normalized.encoding, Encoding::Ucs2);
        assert_eq!(result.recommendations.len(), 3);
        assert!(result.recommendations[0].ends_with(": Код"));
        assert_eq!(
            result.recommendations[1],
            "Consider using URL shortener to reduce message length"
        );
        assert_eq!(
            result.recommendations[2],
            "Remove extra spaces to reduce message length"
        );
    }

    #[test]
    fn test_empty_message_rejected() {
        assert_eq!(normalize("").unwrap_err().field(), Some("message"));
    }
}
