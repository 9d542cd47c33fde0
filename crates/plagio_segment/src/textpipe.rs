//! Токены, токен-хэши, шингл-хэши и SimHash128 поверх нормализованного текста.

/// Токен: кусок нормализованного буфера между одиночными пробелами.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSpan {
    pub start: u32,
    pub len: u32,
}

/// Разбить нормализованный буфер на токены.
pub fn tokenize_spans(s: &str) -> Vec<TokenSpan> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i] == b' ' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let start = i;
        while i < bytes.len() && bytes[i] != b' ' {
            i += 1;
        }
        out.push(TokenSpan {
            start: start as u32,
            len: (i - start) as u32,
        });
    }
    out
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Сид свёртки шингла (splitmix-константа).
const SHINGLE_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Второй поток SimHash: токен-хэш XOR эта константа.
const SIMHASH_STREAM_B: u64 = 0xD6E8_FEB8_6659_FD93;

/// FNV-1a 64 по байтам токена.
pub fn hash_token(buf: &str, span: TokenSpan) -> u64 {
    let a = span.start as usize;
    let b = a + span.len as usize;
    let mut h = FNV_OFFSET;
    for &c in &buf.as_bytes()[a..b] {
        h ^= c as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Токен-хэши считаются один раз на документ; шинглы и SimHash
/// выводятся из этого массива без повторного обхода байтов.
pub fn token_hashes(buf: &str, spans: &[TokenSpan]) -> Vec<u64> {
    spans.iter().map(|&sp| hash_token(buf, sp)).collect()
}

/// Хэш шингла из K подряд идущих токен-хэшей, O(K) на окно.
/// Свёртка чувствительна к порядку: перестановка токенов внутри окна
/// даёт другой хэш; без этого склейка спанов теряет смысл.
pub fn hash_shingle(token_hashes: &[u64], pos: usize, k: usize) -> u64 {
    let mut h = SHINGLE_SEED;
    for &th in &token_hashes[pos..pos + k] {
        h ^= th
            .wrapping_add(SHINGLE_SEED)
            .wrapping_add(h << 6)
            .wrapping_add(h >> 2);
    }
    h
}

/// Два параллельных 64-битных SimHash-а (итого 128 бит):
/// поток A берёт токен-хэш как есть, поток B с XOR-сдвигом.
pub fn simhash128(token_hashes: &[u64]) -> (u64, u64) {
    let mut v0 = [0i32; 64];
    let mut v1 = [0i32; 64];
    for &th in token_hashes {
        let a = th;
        let b = th ^ SIMHASH_STREAM_B;
        for i in 0..64 {
            v0[i] += if (a >> i) & 1 == 1 { 1 } else { -1 };
            v1[i] += if (b >> i) & 1 == 1 { 1 } else { -1 };
        }
    }
    let mut hi = 0u64;
    let mut lo = 0u64;
    for i in 0..64 {
        if v0[i] > 0 {
            hi |= 1 << i;
        }
        if v1[i] > 0 {
            lo |= 1 << i;
        }
    }
    (hi, lo)
}
