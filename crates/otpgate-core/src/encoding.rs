//! Encoding detection and segmentation of SMS text

use otpgate_common::types::Encoding;
use otpgate_common::{Error, Result};
use serde::Serialize;

/// Characters accepted from users before segmentation is even attempted
pub const MAX_MESSAGE_CHARS: usize = 1530;

const GSM7_SINGLE: u32 = 160;
const GSM7_MULTI: u32 = 153;
const UCS2_SINGLE: u32 = 70;
const UCS2_MULTI: u32 = 67;

/// GSM 03.38 default alphabet (escape excluded)
const GSM7_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
                          ¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";

/// GSM 03.38 extension table; each costs an escape plus the character
const GSM7_EXTENDED: &str = "\u{0C}^{}\\[~]|€";

/// How a message will travel over the air
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Segmentation {
    pub encoding: Encoding,
    pub part_count: u32,
    pub char_budget_per_part: u32,
    /// Length in septets (GSM7) or UTF-16 code units (UCS2)
    pub length: u32,
}

/// Septet cost of a character in GSM7, or `None` if it needs UCS2
fn gsm7_cost(c: char) -> Option<u32> {
    if GSM7_BASIC.contains(c) {
        Some(1)
    } else if GSM7_EXTENDED.contains(c) {
        Some(2)
    } else {
        None
    }
}

pub(crate) fn is_gsm7(c: char) -> bool {
    gsm7_cost(c).is_some()
}

/// Pick the encoding for `text` and split it into parts.
pub fn segment(text: &str, max_parts: u32) -> Result<Segmentation> {
    if text.is_empty() {
        return Err(Error::validation("message", "message must not be empty"));
    }

    let chars = text.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(Error::MessageTooLong {
            length: chars,
            parts: 0,
            max_parts,
        });
    }

    let septets: Option<u32> = text.chars().map(gsm7_cost).sum();
    let (encoding, length, single, multi) = match septets {
        Some(septets) => (Encoding::Gsm7, septets, GSM7_SINGLE, GSM7_MULTI),
        None => (
            Encoding::Ucs2,
            text.encode_utf16().count() as u32,
            UCS2_SINGLE,
            UCS2_MULTI,
        ),
    };

    let (part_count, char_budget_per_part) = if length <= single {
        (1, single)
    } else {
        (length.div_ceil(multi), multi)
    };

    if part_count > max_parts {
        return Err(Error::MessageTooLong {
            length: chars,
            parts: part_count,
            max_parts,
        });
    }

    Ok(Segmentation {
        encoding,
        part_count,
        char_budget_per_part,
        length,
    })
}
