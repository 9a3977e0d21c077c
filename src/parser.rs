//! Instruction-level decoding of fetched transactions.
//!
//! Recognizes native transfers, SPL token transfers (plain and checked),
//! and memo instructions by program id and byte layout. Anything else
//! degrades to a metadata-only record built from the signature listing
//! entry.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use chrono::{DateTime, Utc};
use solana_pubkey::{Pubkey, pubkey};

use crate::network::Network;
use crate::rpc::{RawInstruction, SigInfo, TxnDetail};
use crate::types::ConfirmationStatus;

/// The system program, owner of native transfers.
pub const SYSTEM_PROGRAM_PUBKEY: Pubkey = pubkey!("11111111111111111111111111111111");

/// SPL Memo program ids, v1 and v2. Both are recognized.
pub const MEMO_V1_PROGRAM_PUBKEY: Pubkey = pubkey!("Memo1UhkJRfHyvLMcVucJwxXeuD728EqVDDwQDxFMNo");
pub const MEMO_V2_PROGRAM_PUBKEY: Pubkey = pubkey!("MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr");

/// System-program instruction discriminator for `Transfer`.
const SYSTEM_TRANSFER_DISCRIMINATOR: u32 = 2;
/// SPL token instruction tags.
const TOKEN_TRANSFER_TAG: u8 = 3;
const TOKEN_TRANSFER_CHECKED_TAG: u8 = 12;

/// A normalized transaction as extracted from the instruction stream.
///
/// `wallet_address` attribution happens at persistence time; the parser only
/// knows what the instructions say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTransaction {
    pub signature: String,
    pub slot: u64,
    pub network: Network,
    pub from_address: Option<String>,
    pub amount: u64,
    pub token_mint: Option<String>,
    pub memo: Option<String>,
    pub block_time: Option<DateTime<Utc>>,
    pub confirmation_status: ConfirmationStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed {what} instruction in {signature}: {detail}")]
    MalformedInstruction {
        what: &'static str,
        signature: String,
        detail: String,
    },
}

struct Transfer {
    amount: u64,
    token_mint: Option<String>,
    from_address: Option<String>,
}

/// Convert a `(SigInfo, TxnDetail)` pair into a [`ParsedTransaction`].
///
/// Failed signatures are never instruction-parsed; they yield a
/// metadata-only record with `confirmation_status = failed` and zero amount.
/// When multiple transfer instructions appear, the last recognized one wins
/// for amount, mint, and sender; memos from all memo instructions are
/// concatenated in program order.
pub fn parse_transaction(
    network: Network,
    sig: &SigInfo,
    detail: &TxnDetail,
) -> Result<ParsedTransaction, ParseError> {
    if sig.is_failed() {
        return Ok(metadata_only(network, sig, ConfirmationStatus::Failed));
    }

    let mut transfer: Option<Transfer> = None;
    let mut memos: Vec<String> = Vec::new();

    for instruction in &detail.instructions {
        if instruction.program_id == SYSTEM_PROGRAM_PUBKEY {
            if let Some(parsed) = parse_native_transfer(sig, instruction)? {
                transfer = Some(parsed);
            }
        } else if instruction.program_id == spl_token::ID {
            if let Some(parsed) = parse_token_transfer(sig, instruction)? {
                transfer = Some(parsed);
            }
        } else if instruction.program_id == MEMO_V1_PROGRAM_PUBKEY
            || instruction.program_id == MEMO_V2_PROGRAM_PUBKEY
        {
            if let Some(memo) = parse_memo(instruction) {
                memos.push(memo);
            }
        }
    }

    let memo = if memos.is_empty() {
        sig.memo.clone()
    } else {
        Some(memos.join("\n"))
    };
    let transfer = transfer.unwrap_or(Transfer {
        amount: 0,
        token_mint: None,
        from_address: None,
    });

    Ok(ParsedTransaction {
        signature: sig.signature.clone(),
        slot: sig.slot,
        network,
        from_address: transfer.from_address,
        amount: transfer.amount,
        token_mint: transfer.token_mint,
        memo,
        block_time: detail.block_time.or(sig.block_time),
        confirmation_status: ConfirmationStatus::Confirmed,
    })
}

fn metadata_only(network: Network, sig: &SigInfo, status: ConfirmationStatus) -> ParsedTransaction {
    ParsedTransaction {
        signature: sig.signature.clone(),
        slot: sig.slot,
        network,
        from_address: None,
        amount: 0,
        token_mint: None,
        memo: sig.memo.clone(),
        block_time: sig.block_time,
        confirmation_status: status,
    }
}

/// Native transfer: 12 bytes of data, little-endian u32 discriminator 2,
/// then a u64 lamport amount. Accounts are `[from, to]`.
fn parse_native_transfer(
    sig: &SigInfo,
    instruction: &RawInstruction,
) -> Result<Option<Transfer>, ParseError> {
    let data = instruction.data.as_slice();
    if data.len() != 12 {
        return Ok(None);
    }
    let discriminator = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if discriminator != SYSTEM_TRANSFER_DISCRIMINATOR {
        return Ok(None);
    }
    let amount = u64::from_le_bytes(data[4..12].try_into().expect("8-byte slice"));
    let from = instruction
        .accounts
        .first()
        .ok_or_else(|| ParseError::MalformedInstruction {
            what: "native transfer",
            signature: sig.signature.clone(),
            detail: "missing source account".to_string(),
        })?;
    Ok(Some(Transfer {
        amount,
        token_mint: None,
        from_address: Some(from.to_string()),
    }))
}

/// SPL token transfers, both variants.
///
/// Tag 3 carries only the amount; its source account is a token account, so
/// the owning wallet is not derivable from the instruction alone. Tag 12
/// (`TransferChecked`) adds the mint at accounts\[1\] and the authority at
/// accounts\[3\].
fn parse_token_transfer(
    sig: &SigInfo,
    instruction: &RawInstruction,
) -> Result<Option<Transfer>, ParseError> {
    let data = instruction.data.as_slice();
    match data.first() {
        Some(&TOKEN_TRANSFER_TAG) => {
            if data.len() < 9 {
                return Err(ParseError::MalformedInstruction {
                    what: "token transfer",
                    signature: sig.signature.clone(),
                    detail: format!("data too short: {} bytes", data.len()),
                });
            }
            let amount = u64::from_le_bytes(data[1..9].try_into().expect("8-byte slice"));
            Ok(Some(Transfer {
                amount,
                token_mint: None,
                from_address: None,
            }))
        }
        Some(&TOKEN_TRANSFER_CHECKED_TAG) => {
            if data.len() < 10 {
                return Err(ParseError::MalformedInstruction {
                    what: "checked token transfer",
                    signature: sig.signature.clone(),
                    detail: format!("data too short: {} bytes", data.len()),
                });
            }
            let amount = u64::from_le_bytes(data[1..9].try_into().expect("8-byte slice"));
            if instruction.accounts.len() < 4 {
                return Err(ParseError::MalformedInstruction {
                    what: "checked token transfer",
                    signature: sig.signature.clone(),
                    detail: format!("expected 4 accounts, got {}", instruction.accounts.len()),
                });
            }
            Ok(Some(Transfer {
                amount,
                token_mint: Some(instruction.accounts[1].to_string()),
                from_address: Some(instruction.accounts[3].to_string()),
            }))
        }
        _ => Ok(None),
    }
}

/// Memo instruction data is UTF-8 text. If the text decodes cleanly as
/// standard base64 to NUL-free UTF-8, the decoded form is kept; otherwise
/// the raw text is stored verbatim.
fn parse_memo(instruction: &RawInstruction) -> Option<String> {
    let raw = std::str::from_utf8(&instruction.data).ok()?;
    Some(decode_memo_text(raw))
}

fn decode_memo_text(raw: &str) -> String {
    if let Ok(decoded) = b64.decode(raw.trim()) {
        if !decoded.contains(&0) {
            if let Ok(text) = String::from_utf8(decoded) {
                return text;
            }
        }
    }
    raw.to_string()
}
