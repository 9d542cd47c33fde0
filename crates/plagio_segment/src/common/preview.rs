use crate::common::strings::floor_char_boundary;

/// Лимит превью в doc-info, в байтах.
pub const PREVIEW_MAX_BYTES: usize = 240;

/// Префикс нормализованного текста не длиннее `max_bytes`, срез только
/// по границе UTF-8 символа.
pub fn preview_prefix(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    text[..floor_char_boundary(text, max_bytes)].to_string()
}
