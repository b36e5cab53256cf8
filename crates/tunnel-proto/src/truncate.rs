pub const MAX_BODY_SIZE: usize = 5000;
pub const MAX_NUM_HEADERS: usize = 20;
pub const MAX_HEADER_KEY_SIZE: usize = 50;
pub const MAX_HEADER_VALUE_SIZE: usize = 200;

const ELLIPSIS: &str = "...";

/// Cuts `value` to at most `max_bytes` bytes without splitting a UTF-8
/// sequence. With `ellipsis`, the marker counts towards the limit; limits
/// too small to hold it get a plain cut.
pub fn truncate(value: &str, max_bytes: usize, ellipsis: bool) -> String {
    if value.len() <= max_bytes {
        return value.to_owned();
    }

    let ellipsis = ellipsis && max_bytes > ELLIPSIS.len();
    let budget = if ellipsis {
        max_bytes.saturating_sub(ELLIPSIS.len())
    } else {
        max_bytes
    };
    let mut cut = budget;
    while cut > 0 && !value.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut out = String::with_capacity(cut + ELLIPSIS.len());
    out.push_str(&value[..cut]);
    if ellipsis {
        out.push_str(ELLIPSIS);
    }
    out
}
