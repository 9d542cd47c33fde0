use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Описание документа, один к одному с локальным `did`.
/// Обязателен только `doc_id`; остальные поля несут провенанс и превью.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocInfo {
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_name: String,
    /// Провенанс сегмента, например `"seg_20250101_000000/"`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub meta_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preview_text: String,
}

/// Элемент массива docids на диске: объект нового формата либо голая
/// строка старого (строка == `doc_id`, остальные поля пустые).
#[derive(Deserialize)]
#[serde(untagged)]
enum DocInfoRepr {
    Full(DocInfo),
    Legacy(String),
}

impl From<DocInfoRepr> for DocInfo {
    fn from(r: DocInfoRepr) -> Self {
        match r {
            DocInfoRepr::Full(d) => d,
            DocInfoRepr::Legacy(doc_id) => DocInfo {
                doc_id,
                ..DocInfo::default()
            },
        }
    }
}

/// Разобрать массив doc-info; оба дисковых формата равноправны.
pub fn parse_docinfo_array(bytes: &[u8]) -> Result<Vec<DocInfo>> {
    let items: Vec<DocInfoRepr> =
        serde_json::from_slice(bytes).map_err(|e| Error::Parse(format!("docids json: {e}")))?;
    Ok(items.into_iter().map(DocInfo::from).collect())
}
