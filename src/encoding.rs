//! GBK → UTF-8 conversion for broker error strings.
//!
//! The brokerage library reports last-error text in the local code page.
//! All re-encoding is funneled through here so the rest of the crate only
//! ever sees UTF-8.

use encoding_rs::GBK;

/// Decode a GBK byte string to UTF-8, lossily.
///
/// Already-valid UTF-8 input passes through unchanged, so callers do not
/// need to know which encoding a particular broker build emits.
pub fn gbk_to_utf8(raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        return s.to_string();
    }
    let (decoded, _, _) = GBK.decode(raw);
    decoded.into_owned()
}
