use std::borrow::Cow;

/// Return the input string with an added "s" at the end if `count` is not one.
pub fn pluralize(value: &str, count: usize) -> Cow<'_, str> {
    if count == 1 {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("{value}s"))
    }
}

/// Keeps the first and the last `max_chars / 2` characters of `value` and replaces the rest
/// with a note saying how many characters were skipped.
pub fn truncate_head_tail(value: &str, max_chars: usize) -> Cow<'_, str> {
    let length = value.chars().count();
    if length <= max_chars {
        return value.into();
    }
    let head = max_chars.div_ceil(2);
    let tail = max_chars / 2;
    let skipped = length - head - tail;

    let head_end = value
        .char_indices()
        .nth(head)
        .map(|(idx, _)| idx)
        .unwrap_or(value.len());
    let tail_start = value
        .char_indices()
        .nth(length - tail)
        .map(|(idx, _)| idx)
        .unwrap_or(value.len());
    format!(
        "{}\n\n[{skipped} characters skipped]\n\n{}",
        &value[..head_end],
        &value[tail_start..]
    )
    .into()
}
