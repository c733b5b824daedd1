//! In-process backend.
//!
//! A single async mutex over an ordered map gives every transaction a total
//! order, which is the linearizability the engine assumes of its store.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Backend, KeyValue, OpResponse, Txn, TxnOp, TxnResponse};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    version: i64,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let mut written = BTreeSet::new();
        for op in &txn.ops {
            if let TxnOp::Put(key, _) | TxnOp::Delete(key) = op
                && !written.insert(key.as_str())
            {
                return Err(Error::Backend(format!(
                    "duplicate key given in txn request: {}",
                    key
                )));
            }
        }

        let mut data = self.data.lock().await;

        let holds = txn.compares.iter().all(|compare| {
            let current = data.get(&compare.key).map_or(0, |entry| entry.version);
            current == compare.version
        });
        if !holds {
            return Ok(TxnResponse {
                succeeded: false,
                responses: Vec::new(),
            });
        }

        let mut responses = Vec::with_capacity(txn.ops.len());
        for op in txn.ops {
            match op {
                TxnOp::Get(key) => {
                    let found = data.get(&key).map(|entry| KeyValue {
                        key: key.clone(),
                        value: entry.value.clone(),
                        version: entry.version,
                    });
                    responses.push(OpResponse::Get(found));
                }
                TxnOp::Put(key, value) => {
                    let version = data.get(&key).map_or(0, |entry| entry.version) + 1;
                    data.insert(key, Entry { value, version });
                    responses.push(OpResponse::Done);
                }
                TxnOp::Delete(key) => {
                    data.remove(&key);
                    responses.push(OpResponse::Done);
                }
            }
        }

        Ok(TxnResponse {
            succeeded: true,
            responses,
        })
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let data = self.data.lock().await;
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
                version: entry.version,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Compare;

    fn put(key: &str, value: &str) -> TxnOp {
        TxnOp::Put(key.to_string(), value.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_versions_follow_modification_count() {
        let backend = MemoryBackend::new();
        for _ in 0..3 {
            backend
                .txn(Txn {
                    compares: vec![],
                    ops: vec![put("/k", "v")],
                })
                .await
                .unwrap();
        }
        let found = backend.get_prefix("/k").await.unwrap();
        assert_eq!(found[0].version, 3);

        for op in [TxnOp::Delete("/k".to_string()), put("/k", "again")] {
            backend
                .txn(Txn {
                    compares: vec![],
                    ops: vec![op],
                })
                .await
                .unwrap();
        }
        let found = backend.get_prefix("/k").await.unwrap();
        assert_eq!(found[0].version, 1);
    }

    #[tokio::test]
    async fn test_failed_compare_applies_nothing() {
        let backend = MemoryBackend::new();
        let response = backend
            .txn(Txn {
                compares: vec![Compare {
                    key: "/a".to_string(),
                    version: 4,
                }],
                ops: vec![put("/a", "x")],
            })
            .await
            .unwrap();
        assert!(!response.succeeded);
        assert!(backend.get_prefix("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_key_is_rejected() {
        let backend = MemoryBackend::new();
        let result = backend
            .txn(Txn {
                compares: vec![],
                ops: vec![put("/a", "x"), put("/b", "y"), put("/a", "z")],
            })
            .await;
        assert!(matches!(result, Err(Error::Backend(_))));
        assert!(backend.get_prefix("/").await.unwrap().is_empty());

        let result = backend
            .txn(Txn {
                compares: vec![],
                ops: vec![put("/a", "x"), TxnOp::Delete("/a".to_string())],
            })
            .await;
        assert!(result.is_err());

        let reads = backend
            .txn(Txn {
                compares: vec![],
                ops: vec![TxnOp::Get("/a".to_string()), TxnOp::Get("/a".to_string())],
            })
            .await
            .unwrap();
        assert!(reads.succeeded);
    }

    #[tokio::test]
    async fn test_prefix_scan_is_bounded_and_ordered() {
        let backend = MemoryBackend::new();
        backend
            .txn(Txn {
                compares: vec![],
                ops: vec![
                    put("/member/net/b/02", "02"),
                    put("/member/net/a/01", "01"),
                    put("/member/net/ab/03", "03"),
                    put("/member/net/b/01", "01"),
                    put("/net/b", "{}"),
                ],
            })
            .await
            .unwrap();

        let keys: Vec<String> = backend
            .get_prefix("/member/net/b/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/member/net/b/01", "/member/net/b/02"]);
    }
}
