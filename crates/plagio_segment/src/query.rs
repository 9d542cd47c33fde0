//! Превращение текста запроса в набор уникальных шингл-хэшей
//! с позициями их вхождений.

use std::collections::BTreeMap;

use crate::normalizer::normalize_str;
use crate::textpipe::{hash_shingle, token_hashes, tokenize_spans};
use crate::K_SHINGLE;

/// Уникальный хэш запроса и все его позиции (по возрастанию).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryHash {
    pub h: u64,
    pub qpos: Vec<u32>,
}

/// `items` упорядочены по хэшу; `total_shingles` считает вхождения
/// с повторами (это знаменатель покрытия запроса).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryShingles {
    pub items: Vec<QueryHash>,
    pub total_shingles: u32,
}

impl QueryShingles {
    /// Пустой набор: валидный сигнал «запрос короче K токенов»,
    /// поиск по нему сразу отвечает пустотой.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub fn build_query_shingles(query_text: &str, text_is_normalized: bool) -> QueryShingles {
    let norm = if text_is_normalized {
        query_text.to_string()
    } else {
        normalize_str(query_text)
    };
    let spans = tokenize_spans(&norm);
    if spans.len() < K_SHINGLE {
        return QueryShingles::default();
    }
    let th = token_hashes(&norm, &spans);
    let cnt = spans.len() - K_SHINGLE + 1;

    // BTreeMap даёт детерминированный порядок items по хэшу
    let mut by_hash: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
    for pos in 0..cnt {
        let h = hash_shingle(&th, pos, K_SHINGLE);
        by_hash.entry(h).or_default().push(pos as u32);
    }
    QueryShingles {
        items: by_hash
            .into_iter()
            .map(|(h, qpos)| QueryHash { h, qpos })
            .collect(),
        total_shingles: cnt as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_query_is_empty_sentinel() {
        let q = build_query_shingles("a b c", true);
        assert!(q.is_empty());
        assert_eq!(q.total_shingles, 0);
    }

    #[test]
    fn nine_tokens_single_shingle() {
        let q = build_query_shingles("a b c d e f g h i", true);
        assert_eq!(q.items.len(), 1);
        assert_eq!(q.total_shingles, 1);
        assert_eq!(q.items[0].qpos, vec![0]);
    }

    #[test]
    fn repeated_shingles_group_positions() {
        // период 9: окна 0 и 9 совпадают токен в токен
        let tokens: Vec<String> = (0..18).map(|i| format!("t{}", i % 9)).collect();
        let q = build_query_shingles(&tokens.join(" "), true);
        assert_eq!(q.total_shingles, 10);
        let with_repeat: Vec<&QueryHash> =
            q.items.iter().filter(|it| it.qpos.len() > 1).collect();
        assert_eq!(with_repeat.len(), 1);
        assert_eq!(with_repeat[0].qpos, vec![0, 9]);
        // суммарно позиций столько же, сколько шинглов
        let total: usize = q.items.iter().map(|it| it.qpos.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn items_sorted_by_hash() {
        let text = (0..30).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let q = build_query_shingles(&text, true);
        assert!(q.items.windows(2).all(|w| w[0].h < w[1].h));
    }

    #[test]
    fn raw_query_gets_normalized() {
        let a = build_query_shingles("A b C d E f G h I", false);
        let b = build_query_shingles("a b c d e f g h i", true);
        assert_eq!(a, b);
    }
}
