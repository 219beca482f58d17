// ============================================================================
// Log Sanitization Utility - Log-safe rendering of caller input
// ============================================================================
//
// 🔒 SECURITY: Tenant ids, record ids and secret-store names reach this crate
// from callers and remote services. Anything that is not already validated
// passes through `sanitize_for_log` before it is logged or placed in an error.
//
// ## Threats Mitigated:
//
// 1. **Log Injection** - newlines forging extra log entries
// 2. **ANSI Escape Injection** - terminal control codes hiding log content
// 3. **Secret Disclosure** - tokens and key material rendered only as
//    `redact_sensitive` placeholders or key fingerprints
//
// ============================================================================

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum length for logged caller input
const MAX_LOG_LENGTH: usize = 200;

static ANSI_ESCAPE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").expect("ANSI escape regex is valid")
});

/// Sanitize caller input for safe logging
///
/// 1. Removes ANSI escape sequences
/// 2. Replaces newlines and tabs with spaces
/// 3. Drops other control characters (0x00-0x1F, 0x7F)
/// 4. Truncates to MAX_LOG_LENGTH characters
///
/// ```
/// use district_keyvault::utils::log_sanitizer::sanitize_for_log;
///
/// assert_eq!(sanitize_for_log("D001\nINFO: forged"), "D001 INFO: forged");
/// assert_eq!(sanitize_for_log("D\x1b[31m001"), "D001");
/// ```
pub fn sanitize_for_log(input: &str) -> String {
    let no_ansi = ANSI_ESCAPE_REGEX.replace_all(input, "");

    let mut cleaned = String::with_capacity(no_ansi.len().min(MAX_LOG_LENGTH + 3));
    let mut kept = 0;
    for c in no_ansi.chars() {
        let c = match c {
            '\n' | '\r' | '\t' => ' ',
            c if c.is_control() => continue,
            c => c,
        };
        if kept == MAX_LOG_LENGTH {
            cleaned.push_str("...");
            break;
        }
        cleaned.push(c);
        kept += 1;
    }
    cleaned
}

/// Placeholder for values that must never be logged (tokens, keys)
///
/// Only the length survives, e.g. `[REDACTED-16]`.
pub fn redact_sensitive(input: &str) -> String {
    format!("[REDACTED-{}]", input.len())
}
