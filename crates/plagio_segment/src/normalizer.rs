//! Нормализация текста под шинглование.
//!
//! От этих правил зависит тождество шингл-хэшей между сборкой и запросом,
//! поэтому набор сворачиваемых букв фиксирован и не расширяется.

/// Привести байтовый вход к нормальной форме:
/// - UTF-8 декодируется вручную, overlong/суррогаты/за-пределами-Unicode
///   отбрасываются; битый байт работает как разделитель (ровно один байт за шаг);
/// - ASCII: `A-Z` -> `a-z`, сохраняются только `[a-z0-9]`;
/// - кириллица: `А-Я` -> `а-я`, `Ѐ-Џ` -> `ѐ-џ` (включая `Ё` и `І`),
///   казахские заглавные `Ә Ғ Қ Ң Ө Ұ Ү Һ` -> строчные; блок
///   U+0400..U+052F сохраняется как есть;
/// - всё остальное (пробелы, пунктуация, другие алфавиты) схлопывается
///   в одиночный пробел, края обрезаются.
pub fn normalize(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_space = true;
    let mut i = 0usize;
    while i < input.len() {
        let (cp, consumed) = decode_codepoint(&input[i..]);
        i += consumed;
        match cp.and_then(fold_codepoint) {
            Some(ch) => {
                out.push(ch);
                prev_space = false;
            }
            None => {
                if !prev_space {
                    out.push(' ');
                    prev_space = true;
                }
            }
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

pub fn normalize_str(s: &str) -> String {
    normalize(s.as_bytes())
}

/// Один кодпоинт из головы среза. Возвращает (кодпоинт, сколько байт съели);
/// для невалидной последовательности (None, 1).
fn decode_codepoint(b: &[u8]) -> (Option<u32>, usize) {
    let b0 = b[0];
    if b0 < 0x80 {
        return (Some(b0 as u32), 1);
    }
    // 0xC0/0xC1: заведомый overlong; 0xF5..: за пределами Unicode;
    // 0x80..0xBF: continuation без начала
    let (len, init, min) = match b0 {
        0xC2..=0xDF => (2usize, (b0 & 0x1F) as u32, 0x80u32),
        0xE0..=0xEF => (3, (b0 & 0x0F) as u32, 0x800),
        0xF0..=0xF4 => (4, (b0 & 0x07) as u32, 0x1_0000),
        _ => return (None, 1),
    };
    if b.len() < len {
        return (None, 1);
    }
    let mut cp = init;
    for &c in &b[1..len] {
        if c & 0xC0 != 0x80 {
            return (None, 1);
        }
        cp = (cp << 6) | (c & 0x3F) as u32;
    }
    if cp < min || (0xD800..=0xDFFF).contains(&cp) || cp > 0x10FFFF {
        return (None, 1);
    }
    (Some(cp), len)
}

/// Сворачивание одного кодпоинта: Some(символ) оставить, None значит разделитель.
fn fold_codepoint(cp: u32) -> Option<char> {
    if cp < 0x80 {
        let c = cp as u8;
        let c = if c.is_ascii_uppercase() { c + 0x20 } else { c };
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            return Some(c as char);
        }
        return None;
    }
    let folded = match cp {
        0x0410..=0x042F => cp + 0x20, // А-Я -> а-я
        0x0400..=0x040F => cp + 0x50, // Ѐ-Џ -> ѐ-џ (Ё, І, Ї, ...)
        // казахские заглавные и их пары в Cyrillic Supplement: Ә Ғ Қ Ң Ү Ұ Һ Ө
        0x04D8 | 0x0492 | 0x049A | 0x04A2 | 0x04AE | 0x04B0 | 0x04BA | 0x04E8 => cp + 1,
        _ => cp,
    };
    if (0x0400..=0x052F).contains(&folded) {
        return char::from_u32(folded);
    }
    None
}
