//! etcd v3 backend.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare as EtcdCompare, CompareOp, ConnectOptions, GetOptions, KvClient,
    Txn as EtcdTxn, TxnOp as EtcdTxnOp, TxnOpResponse,
};
use tracing::info;

use super::{Backend, KeyValue, OpResponse, Txn, TxnOp, TxnResponse};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct EtcdBackend {
    kv: KvClient,
}

impl std::fmt::Debug for EtcdBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdBackend").finish_non_exhaustive()
    }
}

fn backend_error(error: etcd_client::Error) -> Error {
    Error::Backend(error.to_string())
}

fn convert(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).to_string(),
        value: kv.value().to_vec(),
        version: kv.version(),
    }
}

impl EtcdBackend {
    pub async fn connect(endpoints: &[String], timeout: Duration) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(timeout)
            .with_timeout(timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(backend_error)?;
        info!(endpoints = ?endpoints, "connected to etcd");
        Ok(Self {
            kv: client.kv_client(),
        })
    }
}

#[async_trait]
impl Backend for EtcdBackend {
    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let compares: Vec<EtcdCompare> = txn
            .compares
            .into_iter()
            .map(|compare| EtcdCompare::version(compare.key, CompareOp::Equal, compare.version))
            .collect();
        let ops: Vec<EtcdTxnOp> = txn
            .ops
            .into_iter()
            .map(|op| match op {
                TxnOp::Get(key) => EtcdTxnOp::get(key, None),
                TxnOp::Put(key, value) => EtcdTxnOp::put(key, value, None),
                TxnOp::Delete(key) => EtcdTxnOp::delete(key, None),
            })
            .collect();

        let mut kv = self.kv.clone();
        let response = kv
            .txn(EtcdTxn::new().when(compares).and_then(ops))
            .await
            .map_err(backend_error)?;

        if !response.succeeded() {
            return Ok(TxnResponse {
                succeeded: false,
                responses: Vec::new(),
            });
        }

        let responses = response
            .op_responses()
            .into_iter()
            .map(|op| match op {
                TxnOpResponse::Get(get) => OpResponse::Get(get.kvs().first().map(convert)),
                _ => OpResponse::Done,
            })
            .collect();

        Ok(TxnResponse {
            succeeded: true,
            responses,
        })
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut kv = self.kv.clone();
        let response = kv
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(backend_error)?;
        Ok(response.kvs().iter().map(convert).collect())
    }
}
