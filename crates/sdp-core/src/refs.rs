//! Extraction of embedded `$ref` links from provider documents.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentShape {
    /// Only reference collections, no primary identifier. Traversed, never persisted.
    Index,
    Content,
}

pub fn extract_refs(json: &str) -> Result<BTreeSet<String>, serde_json::Error> {
    let value: Value = serde_json::from_str(json)?;
    Ok(extract_refs_from_value(&value))
}

pub fn extract_refs_from_value(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    walk(value, &mut out);
    out
}

fn walk(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "$ref" {
                    if let Some(clean) = child.as_str().and_then(clean_ref) {
                        out.insert(clean);
                    }
                    continue;
                }
                walk(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, out);
            }
        }
        _ => {}
    }
}

/// Absolute http(s) URL with query and fragment removed; anything else is ignored.
pub fn clean_ref(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

// TODO: replace the heuristic with an explicit marker once providers expose one;
// a content document that legitimately lacks `id` is misread as an index.
pub fn classify_value(value: &Value) -> DocumentShape {
    let Some(map) = value.as_object() else {
        return DocumentShape::Content;
    };
    let has_list = map.get("items").is_some_and(Value::is_array)
        || ["count", "pageIndex", "pageCount"]
            .iter()
            .any(|key| map.contains_key(*key));
    if has_list && !map.contains_key("id") {
        DocumentShape::Index
    } else {
        DocumentShape::Content
    }
}

pub fn classify(json: &str) -> Result<DocumentShape, serde_json::Error> {
    let value: Value = serde_json::from_str(json)?;
    Ok(classify_value(&value))
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexItem {
    #[serde(rename = "$ref")]
    pub href: String,
}

/// One page of a paginated provider index.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIndexPage {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub page_index: u32,
    #[serde(default)]
    pub page_size: u32,
    #[serde(default)]
    pub page_count: u32,
    #[serde(default)]
    pub items: Vec<IndexItem>,
}

impl ResourceIndexPage {
    pub fn item_refs(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|item| clean_ref(&item.href))
            .collect()
    }

    pub fn has_next_page(&self) -> bool {
        self.page_index < self.page_count
    }

    /// URL of the following page, built from `base` with `limit` and `page` set.
    pub fn next_page_url(&self, base: &str) -> Option<String> {
        if !self.has_next_page() {
            return None;
        }
        let mut url = Url::parse(base).ok()?;
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("limit", &self.page_size.max(1).to_string())
            .append_pair("page", &(self.page_index + 1).to_string());
        Some(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEAM: &str = r#"{
        "$ref": "http://api.test/v2/seasons/2024/teams/99?lang=en&region=us",
        "id": "99",
        "venue": { "$ref": "http://api.test/v2/venues/3958?lang=en" },
        "groups": { "$ref": "http://api.test/v2/seasons/2024/types/2/groups/8#frag" },
        "links": [
            { "href": "http://www.test/team/99" },
            { "nested": [ { "$ref": "http://api.test/v2/venues/3958" } ] }
        ],
        "notes": { "$ref": "relative/path" }
    }"#;

    #[test]
    fn extracts_unique_absolute_refs_without_query_or_fragment() {
        let refs = extract_refs(TEAM).expect("refs");
        let expected: BTreeSet<String> = [
            "http://api.test/v2/seasons/2024/teams/99",
            "http://api.test/v2/seasons/2024/types/2/groups/8",
            "http://api.test/v2/venues/3958",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(refs, expected);
    }

    #[test]
    fn index_documents_are_classified_by_shape() {
        let index = r#"{"count":2,"pageIndex":1,"pageSize":25,"pageCount":1,
            "items":[{"$ref":"http://api.test/v2/venues/1"},{"$ref":"http://api.test/v2/venues/2"}]}"#;
        assert_eq!(classify(index).expect("index"), DocumentShape::Index);
        assert_eq!(classify(TEAM).expect("team"), DocumentShape::Content);
        assert_eq!(classify("[1,2]").expect("array"), DocumentShape::Content);
    }

    #[test]
    fn next_page_url_follows_cursor_until_last_page() {
        let page: ResourceIndexPage = serde_json::from_str(
            r#"{"count":60,"pageIndex":1,"pageSize":25,"pageCount":3,"items":[]}"#,
        )
        .expect("page");
        assert_eq!(
            page.next_page_url("http://api.test/v2/venues?lang=en").as_deref(),
            Some("http://api.test/v2/venues?limit=25&page=2")
        );

        let last = ResourceIndexPage {
            page_index: 3,
            page_count: 3,
            ..page
        };
        assert!(last.next_page_url("http://api.test/v2/venues").is_none());
    }
}
