//! WhatsApp notification composition.
//!
//! Builds the parent-facing message and the `wa.me` deep link the UI opens
//! in a new browser context. There is no delivery path here: the external
//! app owns sending, so logged notifications stay `pending` forever.

use chrono::{Datelike, NaiveDateTime, Timelike};

pub const DEFAULT_SIGNATURE: &str = "Sistema Kiddo QR Assist";

/// Permissive E.164-style check: optional leading '+', first digit 1-9,
/// 7..=15 digits total. Best-effort only; the number is never dialed here.
pub fn is_valid_phone(phone: &str) -> bool {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if digits.len() < 7 || digits.len() > 15 {
        return false;
    }
    let mut chars = digits.chars();
    match chars.next() {
        Some(c) if ('1'..='9').contains(&c) => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_digit())
}

const MONTHS_ES: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

/// "3 de mayo": day plus long month, es-ES style.
pub fn format_date_es(ts: NaiveDateTime) -> String {
    let month = MONTHS_ES[(ts.month0()) as usize];
    format!("{} de {}", ts.day(), month)
}

/// "10:15", two-digit 24h clock.
pub fn format_time_es(ts: NaiveDateTime) -> String {
    format!("{:02}:{:02}", ts.hour(), ts.minute())
}

/// The message the parent receives. The salutation names the parent; the
/// body embeds the student, check-in date and time.
pub fn compose_message(
    student_name: &str,
    parent_name: &str,
    ts: NaiveDateTime,
    signature: &str,
) -> String {
    format!(
        "Buen día, Sr(a). {}. Su representado *{}* asistió hoy {} a las {}.\n– {}",
        parent_name,
        student_name,
        format_date_es(ts),
        format_time_es(ts),
        signature
    )
}

/// Minimal application/x-www-form-urlencoded-style escaping for the text
/// query parameter. Unreserved characters pass through; everything else is
/// percent-encoded byte-wise.
pub fn encode_query_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{:02X}", byte));
            }
        }
    }
    out
}

/// Deep link that opens the external messaging app with the message
/// pre-filled. The phone is passed through as stored (with its '+').
pub fn deep_link(phone: &str, message: &str) -> String {
    format!(
        "https://wa.me/{}?text={}",
        phone,
        encode_query_component(message)
    )
}
