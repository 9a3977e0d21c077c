//! Shared test doubles: a scripted RPC facade and record builders.

use async_trait::async_trait;
use chrono::DateTime;
use solana_pubkey::Pubkey;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::network::Network;
use crate::parser::SYSTEM_PROGRAM_PUBKEY;
use crate::rpc::{
    GetTransactionOptions, ListSignaturesOptions, RawInstruction, RpcError, RpcErrorKind, SigInfo,
    SolanaRpc, TxnDetail,
};

/// Deterministic pubkey for tests; distinct seeds give distinct keys.
pub(crate) fn test_pubkey(seed: u8) -> Pubkey {
    Pubkey::new_from_array([seed; 32])
}

pub(crate) fn rpc_err(kind: RpcErrorKind) -> RpcError {
    RpcError::Call {
        kind,
        endpoint: "mock".to_string(),
        message: "scripted failure".to_string(),
    }
}

pub(crate) fn confirmed_sig(signature: &str, slot: u64) -> SigInfo {
    SigInfo {
        signature: signature.to_string(),
        slot,
        err: None,
        memo: None,
        block_time: DateTime::from_timestamp(1_700_000_000 + slot as i64, 0),
    }
}

pub(crate) fn failed_sig(signature: &str, slot: u64) -> SigInfo {
    SigInfo {
        err: Some(r#"InstructionError(0, "InsufficientFunds")"#.to_string()),
        ..confirmed_sig(signature, slot)
    }
}

/// A detail holding one native transfer of `lamports` from `from`.
pub(crate) fn native_detail(lamports: u64, from: Pubkey) -> TxnDetail {
    let mut data = 2u32.to_le_bytes().to_vec();
    data.extend_from_slice(&lamports.to_le_bytes());
    TxnDetail {
        slot: 0,
        block_time: DateTime::from_timestamp(1_700_000_000, 0),
        err: None,
        instructions: vec![RawInstruction {
            program_id: SYSTEM_PROGRAM_PUBKEY,
            accounts: vec![from, test_pubkey(0xEE)],
            data,
        }],
    }
}

/// A detail holding one checked token transfer of `amount` of `mint`,
/// authorized by `authority`.
pub(crate) fn checked_detail(amount: u64, mint: Pubkey, authority: Pubkey) -> TxnDetail {
    let mut data = vec![12u8];
    data.extend_from_slice(&amount.to_le_bytes());
    data.push(6); // decimals
    TxnDetail {
        slot: 0,
        block_time: DateTime::from_timestamp(1_700_000_000, 0),
        err: None,
        instructions: vec![RawInstruction {
            program_id: spl_token::ID,
            accounts: vec![test_pubkey(0xAA), mint, test_pubkey(0xBB), authority],
            data,
        }],
    }
}

/// Scripted [`SolanaRpc`] implementation.
///
/// Signature batches are consumed one per `list_signatures` call (an empty
/// queue yields an empty page); detail responses are consumed per signature
/// in push order.
#[derive(Default)]
pub(crate) struct MockRpc {
    sig_batches: Mutex<VecDeque<Result<Vec<SigInfo>, RpcError>>>,
    details: Mutex<HashMap<String, VecDeque<Result<TxnDetail, RpcError>>>>,
    list_calls: Mutex<Vec<(Network, String, Option<String>)>>,
    detail_calls: Mutex<Vec<(String, Option<u8>)>>,
}

impl MockRpc {
    pub fn push_sig_batch(&self, batch: Result<Vec<SigInfo>, RpcError>) {
        self.sig_batches.lock().unwrap().push_back(batch);
    }

    pub fn push_detail(&self, signature: &str, detail: Result<TxnDetail, RpcError>) {
        self.details
            .lock()
            .unwrap()
            .entry(signature.to_string())
            .or_default()
            .push_back(detail);
    }

    pub fn list_calls(&self) -> Vec<(Network, String, Option<String>)> {
        self.list_calls.lock().unwrap().clone()
    }

    pub fn detail_calls(&self) -> Vec<(String, Option<u8>)> {
        self.detail_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SolanaRpc for MockRpc {
    async fn list_signatures(
        &self,
        network: Network,
        address: &str,
        options: ListSignaturesOptions,
    ) -> Result<Vec<SigInfo>, RpcError> {
        self.list_calls.lock().unwrap().push((
            network,
            address.to_string(),
            options.until_signature.clone(),
        ));
        match self.sig_batches.lock().unwrap().pop_front() {
            Some(batch) => batch,
            None => Ok(Vec::new()),
        }
    }

    async fn get_transaction(
        &self,
        _network: Network,
        signature: &str,
        options: GetTransactionOptions,
    ) -> Result<TxnDetail, RpcError> {
        self.detail_calls
            .lock()
            .unwrap()
            .push((signature.to_string(), options.max_supported_version));
        match self
            .details
            .lock()
            .unwrap()
            .get_mut(signature)
            .and_then(VecDeque::pop_front)
        {
            Some(result) => result,
            None => Ok(TxnDetail::default()),
        }
    }
}
