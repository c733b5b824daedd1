//! Versioned object storage over a transactional key-value backend.
//!
//! Every persisted entity implements [`Object`]: it knows its key, the
//! version it was last read at, and how to encode and decode its value. The
//! [`Store`] turns lists of objects into single multi-key transactions:
//!
//! - [`Store::read_objects`] fetches current values and versions. Keys that
//!   do not exist leave their object untouched.
//! - [`Store::write_objects`] puts every object, guarded by a comparison of
//!   each key's stored version against the version the object was read at.
//!   If any key changed in between, nothing is written and the call fails
//!   with [`Error::TxnFailed`].
//! - [`Store::write_objects_guarded`] adds version checks on keys that are
//!   not written, so a write can depend on an unrelated key staying absent.
//! - [`Store::delete_objects`] removes every key without preconditions.
//! - [`Store::run_object_tx`] applies a put set and a delete set without
//!   preconditions; [`Store::commit_object_tx`] does the same with version
//!   checks on every put.
//!
//! Objects whose [`Object::key`] is `None` are skipped by every operation, so
//! callers can build a uniform list of index objects for a member without
//! checking which of its fields are populated.
//!
//! Versions follow etcd: an absent key has version 0, creation sets 1, every
//! put increments it, and delete resets it. Writing a freshly built object
//! (version 0) therefore asserts that its key does not exist yet.

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BackendKind, StoreConfig};
use crate::error::{Error, Result};

pub use memory::MemoryBackend;

/// A stored key with its value and modification count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub version: i64,
}

/// Holds when the stored version of `key` equals `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Get(String),
    Put(String, Vec<u8>),
    Delete(String),
}

/// Operations applied atomically when every comparison holds.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub ops: Vec<TxnOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResponse {
    Get(Option<KeyValue>),
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct TxnResponse {
    pub succeeded: bool,
    /// One entry per operation, in order. Empty when the comparisons failed.
    pub responses: Vec<OpResponse>,
}

/// A linearizable key-value service with multi-key transactions.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    /// Returns every key starting with `prefix`, ordered by key.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;
}

/// An entity or index entry persisted under a single key.
pub trait Object: Send + Sync {
    /// Store key, or `None` when the object has nothing to index.
    fn key(&self) -> Option<String>;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);
    fn encode(&self) -> Result<Vec<u8>>;
    fn decode(&mut self, data: &[u8]) -> Result<()>;
}

/// A put set and a delete set applied in one transaction.
#[derive(Default)]
pub struct ObjectTx {
    pub put: Vec<Box<dyn Object>>,
    pub delete: Vec<Box<dyn Object>>,
}

impl ObjectTx {
    pub fn is_empty(&self) -> bool {
        self.put.iter().chain(self.delete.iter()).all(|object| object.key().is_none())
    }
}

/// Handle to the shared state. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    timeout: Duration,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// A store over a fresh in-process backend.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Duration::from_secs(3))
    }

    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        match config.backend {
            BackendKind::Memory => Ok(Self::new(Arc::new(MemoryBackend::new()), timeout)),
            #[cfg(feature = "etcd")]
            BackendKind::Etcd => {
                let backend = etcd::EtcdBackend::connect(&config.endpoints, timeout).await?;
                Ok(Self::new(Arc::new(backend), timeout))
            }
            #[cfg(not(feature = "etcd"))]
            BackendKind::Etcd => Err(Error::InvalidConfig(
                "etcd backend requested but this build lacks the `etcd` feature".to_string(),
            )),
        }
    }

    async fn timed<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::Backend(format!("store call timed out after {:?}", self.timeout)))?
    }

    async fn execute(&self, txn: Txn, context: &str) -> Result<Vec<OpResponse>> {
        if txn.ops.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.timed(self.backend.txn(txn)).await?;
        if !response.succeeded {
            return Err(Error::TxnFailed(context.to_string()));
        }
        Ok(response.responses)
    }

    pub async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.timed(self.backend.get_prefix(prefix)).await
    }

    /// Reads several keys in one transaction. Absent keys are omitted.
    pub async fn get_values(&self, keys: Vec<String>) -> Result<Vec<KeyValue>> {
        let txn = Txn {
            compares: Vec::new(),
            ops: keys.into_iter().map(TxnOp::Get).collect(),
        };
        let responses = self.execute(txn, "multi-key read failed").await?;
        Ok(responses
            .into_iter()
            .filter_map(|response| match response {
                OpResponse::Get(found) => found,
                OpResponse::Done => None,
            })
            .collect())
    }

    pub async fn read(&self, object: &mut dyn Object) -> Result<()> {
        let mut objects: [&mut dyn Object; 1] = [object];
        self.read_objects(&mut objects).await
    }

    /// Like [`read`](Self::read) but fails with [`Error::NotFound`] when the
    /// key does not exist.
    pub async fn fetch(&self, object: &mut dyn Object) -> Result<()> {
        let Some(key) = object.key() else {
            return Err(Error::NotFound("object has no key".to_string()));
        };
        object.set_version(0);
        self.read(object).await?;
        if object.version() == 0 {
            return Err(Error::NotFound(key));
        }
        Ok(())
    }

    pub async fn read_objects(&self, objects: &mut [&mut dyn Object]) -> Result<()> {
        let mut targets = Vec::new();
        let mut ops = Vec::new();
        for (index, object) in objects.iter().enumerate() {
            if let Some(key) = object.key() {
                targets.push(index);
                ops.push(TxnOp::Get(key));
            }
        }

        let txn = Txn {
            compares: Vec::new(),
            ops,
        };
        let responses = self.execute(txn, "read failed").await?;

        for (index, response) in targets.into_iter().zip(responses) {
            if let OpResponse::Get(Some(kv)) = response {
                let object = &mut objects[index];
                object.decode(&kv.value)?;
                object.set_version(kv.version);
            }
        }

        Ok(())
    }

    pub async fn write(&self, object: &dyn Object) -> Result<()> {
        self.write_objects(&[object]).await
    }

    pub async fn write_objects(&self, objects: &[&dyn Object]) -> Result<()> {
        let mut txn = Txn::default();
        for object in objects {
            guarded_put(&mut txn, *object)?;
        }
        self.execute(txn, "state has changed since read").await?;
        Ok(())
    }

    /// Like [`write_objects`](Self::write_objects), but the write also
    /// requires every object in `guards` to still be at the version it was
    /// read at. Guards are compared, never written.
    pub async fn write_objects_guarded(
        &self,
        objects: &[&dyn Object],
        guards: &[&dyn Object],
    ) -> Result<()> {
        let mut txn = Txn::default();
        for object in objects {
            guarded_put(&mut txn, *object)?;
        }
        for guard in guards {
            if let Some(key) = guard.key() {
                txn.compares.push(Compare {
                    key,
                    version: guard.version(),
                });
            }
        }
        self.execute(txn, "state has changed since read").await?;
        Ok(())
    }

    pub async fn delete_objects(&self, objects: &[&dyn Object]) -> Result<()> {
        let mut txn = Txn::default();
        for object in objects {
            if let Some(key) = object.key() {
                txn.ops.push(TxnOp::Delete(key));
            }
        }
        self.execute(txn, "delete objects failed").await?;
        Ok(())
    }

    pub async fn run_object_tx(&self, tx: &ObjectTx) -> Result<()> {
        let mut txn = Txn::default();
        for object in &tx.put {
            if let Some(key) = object.key() {
                txn.ops.push(TxnOp::Put(key, object.encode()?));
            }
        }
        push_deletes(&mut txn, tx);
        self.execute(txn, "run object txn failed").await?;
        Ok(())
    }

    pub async fn commit_object_tx(&self, tx: &ObjectTx) -> Result<()> {
        let mut txn = Txn::default();
        for object in &tx.put {
            guarded_put(&mut txn, object.as_ref())?;
        }
        push_deletes(&mut txn, tx);
        self.execute(txn, "state has changed since read").await?;
        Ok(())
    }
}

fn guarded_put(txn: &mut Txn, object: &dyn Object) -> Result<()> {
    if let Some(key) = object.key() {
        txn.compares.push(Compare {
            key: key.clone(),
            version: object.version(),
        });
        txn.ops.push(TxnOp::Put(key, object.encode()?));
    }
    Ok(())
}

fn push_deletes(txn: &mut Txn, tx: &ObjectTx) {
    for object in &tx.delete {
        if let Some(key) = object.key() {
            txn.ops.push(TxnOp::Delete(key));
        }
    }
}
