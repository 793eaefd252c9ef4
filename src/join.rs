use std::collections::HashMap;

use serde_json::Value;

use crate::document::Document;
use crate::value::{self, ArrayKeys, JoinKey};

/// In-memory multi-map from join key to the foreign documents carrying it.
///
/// Built once per lookup execution and dropped with it. The index owns the
/// foreign documents; buckets hold positions into that vector so a document
/// reachable through several keys is stored once and probes can merge
/// buckets back into foreign-collection order.
pub struct JoinIndex {
    docs: Vec<Document>,
    buckets: HashMap<JoinKey, Vec<usize>>,
    unindexed: usize,
}

impl JoinIndex {
    /// Index `foreign` on the value found at `foreign_field`.
    ///
    /// Documents without the field are left out of every bucket.
    pub fn build(foreign: Vec<Document>, foreign_field: &str, arrays: ArrayKeys) -> Self {
        let mut buckets: HashMap<JoinKey, Vec<usize>> = HashMap::new();
        let mut unindexed = 0;

        for (pos, doc) in foreign.iter().enumerate() {
            let keys = value::join_keys(doc, foreign_field, arrays);
            if keys.is_empty() {
                unindexed += 1;
                continue;
            }
            for key in keys {
                let bucket = buckets.entry(key).or_default();
                // A key repeated within one document must not duplicate it.
                if bucket.last() != Some(&pos) {
                    bucket.push(pos);
                }
            }
        }

        Self {
            docs: foreign,
            buckets,
            unindexed,
        }
    }

    /// Foreign documents matching any of `keys`, in foreign-collection order,
    /// each at most once.
    pub fn probe(&self, keys: &[JoinKey]) -> Vec<Value> {
        match keys {
            [] => Vec::new(),
            [key] => self.collect(self.buckets.get(key).map(Vec::as_slice).unwrap_or(&[])),
            _ => {
                let mut positions: Vec<usize> = keys
                    .iter()
                    .filter_map(|k| self.buckets.get(k))
                    .flatten()
                    .copied()
                    .collect();
                positions.sort_unstable();
                positions.dedup();
                self.collect(&positions)
            }
        }
    }

    fn collect(&self, positions: &[usize]) -> Vec<Value> {
        positions
            .iter()
            .map(|&pos| Value::Object(self.docs[pos].clone()))
            .collect()
    }

    /// Number of foreign documents held by the index, indexed or not.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }

    /// Foreign documents that had no value at the join field.
    pub fn unindexed(&self) -> usize {
        self.unindexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::into_document;
    use serde_json::json;

    fn docs(values: Vec<Value>) -> Vec<Document> {
        values.into_iter().map(|v| into_document(v).unwrap()).collect()
    }

    fn k(v: Value) -> JoinKey {
        JoinKey::from_json(&v)
    }

    #[test]
    fn fan_out_keeps_encounter_order() {
        let index = JoinIndex::build(
            docs(vec![
                json!({"comicID": 1, "characterID": 10}),
                json!({"comicID": 2, "characterID": 11}),
                json!({"comicID": 1, "characterID": 12}),
            ]),
            "comicID",
            ArrayKeys::Whole,
        );
        assert_eq!(index.len(), 3);
        assert_eq!(index.key_count(), 2);
        let hits = index.probe(&[k(json!(1))]);
        assert_eq!(
            hits,
            vec![
                json!({"comicID": 1, "characterID": 10}),
                json!({"comicID": 1, "characterID": 12}),
            ]
        );
    }

    #[test]
    fn absent_field_is_unindexed_but_null_is_indexed() {
        let index = JoinIndex::build(
            docs(vec![json!({"other": 1}), json!({"k": null})]),
            "k",
            ArrayKeys::Whole,
        );
        assert_eq!(index.unindexed(), 1);
        assert_eq!(index.probe(&[JoinKey::Null]), vec![json!({"k": null})]);
    }

    #[test]
    fn probe_missing_key_is_empty() {
        let index = JoinIndex::build(docs(vec![json!({"k": 1})]), "k", ArrayKeys::Whole);
        assert!(index.probe(&[k(json!(2))]).is_empty());
        assert!(index.probe(&[]).is_empty());
    }

    #[test]
    fn multi_key_probe_merges_in_foreign_order_without_duplicates() {
        let index = JoinIndex::build(
            docs(vec![
                json!({"id": 3, "n": "c"}),
                json!({"id": 1, "n": "a"}),
                json!({"id": 2, "n": "b"}),
            ]),
            "id",
            ArrayKeys::Whole,
        );
        let hits = index.probe(&[k(json!(2)), k(json!(3)), k(json!(2)), k(json!(9))]);
        assert_eq!(
            hits,
            vec![json!({"id": 3, "n": "c"}), json!({"id": 2, "n": "b"})]
        );
    }

    #[test]
    fn element_keys_index_each_array_member_once() {
        let index = JoinIndex::build(
            docs(vec![json!({"tags": ["x", "y", "x"]})]),
            "tags",
            ArrayKeys::Elements,
        );
        assert_eq!(index.key_count(), 2);
        assert_eq!(index.probe(&[k(json!("x"))]).len(), 1);
        assert_eq!(index.probe(&[k(json!("x")), k(json!("y"))]).len(), 1);
    }

    #[test]
    fn whole_array_key_matches_equal_array_only() {
        let index = JoinIndex::build(
            docs(vec![json!({"pair": [1, 2]})]),
            "pair",
            ArrayKeys::Whole,
        );
        assert_eq!(index.probe(&[k(json!([1, 2]))]).len(), 1);
        assert!(index.probe(&[k(json!(1))]).is_empty());
    }

    #[test]
    fn empty_foreign_collection() {
        let index = JoinIndex::build(Vec::new(), "k", ArrayKeys::Whole);
        assert!(index.is_empty());
        assert_eq!(index.key_count(), 0);
    }
}
