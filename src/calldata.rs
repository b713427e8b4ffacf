//! Call payload codec.
//!
//! Payloads are a 4-byte selector followed by contract-ABI encoded
//! arguments. Identities are 32 bytes wide, so they travel as `bytes32`; the
//! address slots of the token transfer selectors carry the same full word.

use std::sync::LazyLock;

use ethers_core::abi::{self, ParamType, Token};
use ethers_core::types::U256;
use ethers_core::utils::id;
use thiserror::Error;

use crate::types::{Address, Amount, Call, Selector};

const TRANSFER_SIGNATURE: &str = "transfer(address,uint256)";
const TRANSFER_FROM_SIGNATURE: &str = "transferFrom(address,address,uint256)";
const EXECUTE_SIGNATURE: &str = "execute(bytes32,uint256,bytes)";
const EXECUTE_BATCH_SIGNATURE: &str = "executeBatch((bytes32,uint256,bytes)[])";
const EXECUTE_AS_SESSION_SIGNATURE: &str = "executeAsSession(bytes32,bytes32,(bytes32,uint256,bytes)[])";

pub static TRANSFER_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::new(id(TRANSFER_SIGNATURE)));
pub static TRANSFER_FROM_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::new(id(TRANSFER_FROM_SIGNATURE)));
pub static EXECUTE_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::new(id(EXECUTE_SIGNATURE)));
pub static EXECUTE_BATCH_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::new(id(EXECUTE_BATCH_SIGNATURE)));
pub static EXECUTE_AS_SESSION_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::new(id(EXECUTE_AS_SESSION_SIGNATURE)));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload of {0} bytes carries no selector")]
    MissingSelector(usize),
    #[error("unknown selector {0}")]
    UnknownSelector(Selector),
    #[error("malformed arguments: {0}")]
    Malformed(String),
    #[error("integer does not fit in 128 bits")]
    IntegerOverflow,
    #[error("arguments are not canonically encoded")]
    NonCanonical,
}

/// A recognised asset transfer found in a call payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub from: Option<Address>,
    pub to: Address,
    pub amount: Amount,
}

/// Decoded form of the call data an operation asks the account to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountCall {
    Execute(Call),
    ExecuteBatch(Vec<Call>),
    ExecuteAsSession {
        validator: Address,
        session_key: Address,
        calls: Vec<Call>,
    },
}

impl AccountCall {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AccountCall::Execute(call) => with_selector(
                *EXECUTE_SELECTOR,
                &[identity(&call.target), amount(call.value), Token::Bytes(call.payload.clone())],
            ),
            AccountCall::ExecuteBatch(calls) => with_selector(*EXECUTE_BATCH_SELECTOR, &[calls_token(calls)]),
            AccountCall::ExecuteAsSession { validator, session_key, calls } => with_selector(
                *EXECUTE_AS_SESSION_SELECTOR,
                &[identity(validator), identity(session_key), calls_token(calls)],
            ),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let (selector, args) = split_selector(data)?;
        if selector == *EXECUTE_SELECTOR {
            let [target, value, payload] =
                decode_exact(&[ParamType::FixedBytes(32), ParamType::Uint(256), ParamType::Bytes], args)?;
            Ok(AccountCall::Execute(Call {
                target: take_identity(target)?,
                value: take_amount(value)?,
                payload: take_bytes(payload)?,
            }))
        } else if selector == *EXECUTE_BATCH_SELECTOR {
            let [calls] = decode_exact(&[calls_type()], args)?;
            Ok(AccountCall::ExecuteBatch(take_calls(calls)?))
        } else if selector == *EXECUTE_AS_SESSION_SELECTOR {
            let [validator, session_key, calls] =
                decode_exact(&[ParamType::FixedBytes(32), ParamType::FixedBytes(32), calls_type()], args)?;
            Ok(AccountCall::ExecuteAsSession {
                validator: take_identity(validator)?,
                session_key: take_identity(session_key)?,
                calls: take_calls(calls)?,
            })
        } else {
            Err(DecodeError::UnknownSelector(selector))
        }
    }
}

pub fn encode_transfer(to: &Address, value: Amount) -> Vec<u8> {
    with_selector(*TRANSFER_SELECTOR, &[identity(to), amount(value)])
}

pub fn encode_transfer_from(from: &Address, to: &Address, value: Amount) -> Vec<u8> {
    with_selector(*TRANSFER_FROM_SELECTOR, &[identity(from), identity(to), amount(value)])
}

/// Return data of a token transfer: a single ABI `bool`.
pub fn encode_transfer_result(ok: bool) -> Vec<u8> {
    abi::encode(&[Token::Bool(ok)])
}

/// Recognise a direct or delegated token transfer. Any other payload, or a
/// malformed transfer payload, yields `None`.
pub fn parse_token_transfer(payload: &[u8]) -> Option<TokenTransfer> {
    let (selector, args) = split_selector(payload).ok()?;
    if selector == *TRANSFER_SELECTOR {
        let [to, value] = decode_exact(&[ParamType::FixedBytes(32), ParamType::Uint(256)], args).ok()?;
        Some(TokenTransfer {
            from: None,
            to: take_identity(to).ok()?,
            amount: take_amount(value).ok()?,
        })
    } else if selector == *TRANSFER_FROM_SELECTOR {
        let [from, to, value] = decode_exact(
            &[ParamType::FixedBytes(32), ParamType::FixedBytes(32), ParamType::Uint(256)],
            args,
        )
        .ok()?;
        Some(TokenTransfer {
            from: Some(take_identity(from).ok()?),
            to: take_identity(to).ok()?,
            amount: take_amount(value).ok()?,
        })
    } else {
        None
    }
}

// --- Encoding ---

fn with_selector(selector: Selector, args: &[Token]) -> Vec<u8> {
    let mut out = selector.bytes().unwrap_or_default().to_vec();
    out.extend(abi::encode(args));
    out
}

fn identity(a: &Address) -> Token {
    Token::FixedBytes(a.0.to_vec())
}

fn amount(v: Amount) -> Token {
    Token::Uint(U256::from(v))
}

fn calls_token(calls: &[Call]) -> Token {
    Token::Array(
        calls
            .iter()
            .map(|c| Token::Tuple(vec![identity(&c.target), amount(c.value), Token::Bytes(c.payload.clone())]))
            .collect(),
    )
}

fn calls_type() -> ParamType {
    ParamType::Array(Box::new(ParamType::Tuple(vec![
        ParamType::FixedBytes(32),
        ParamType::Uint(256),
        ParamType::Bytes,
    ])))
}

// --- Decoding ---

fn malformed(what: &str) -> DecodeError {
    DecodeError::Malformed(format!("expected {what}"))
}

fn split_selector(data: &[u8]) -> Result<(Selector, &[u8]), DecodeError> {
    if data.len() < 4 {
        return Err(DecodeError::MissingSelector(data.len()));
    }
    Ok((Selector::of(data), &data[4..]))
}

/// Decode exactly `N` arguments. Trailing bytes, stray offsets and dirty
/// padding all fail the re-encoding comparison.
fn decode_exact<const N: usize>(types: &[ParamType; N], args: &[u8]) -> Result<[Token; N], DecodeError> {
    let tokens = abi::decode(types, args).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if abi::encode(&tokens) != args {
        return Err(DecodeError::NonCanonical);
    }
    tokens.try_into().map_err(|_| malformed("argument count"))
}

fn take_identity(token: Token) -> Result<Address, DecodeError> {
    match token {
        Token::FixedBytes(bytes) => <[u8; 32]>::try_from(bytes.as_slice())
            .map(Address)
            .map_err(|_| malformed("bytes32")),
        _ => Err(malformed("bytes32")),
    }
}

fn take_amount(token: Token) -> Result<Amount, DecodeError> {
    match token {
        Token::Uint(v) if v.bits() > 128 => Err(DecodeError::IntegerOverflow),
        Token::Uint(v) => Ok(v.low_u128()),
        _ => Err(malformed("uint256")),
    }
}

fn take_bytes(token: Token) -> Result<Vec<u8>, DecodeError> {
    match token {
        Token::Bytes(bytes) => Ok(bytes),
        _ => Err(malformed("bytes")),
    }
}

fn take_calls(token: Token) -> Result<Vec<Call>, DecodeError> {
    let Token::Array(items) = token else {
        return Err(malformed("call array"));
    };
    items
        .into_iter()
        .map(|item| {
            let Token::Tuple(fields) = item else {
                return Err(malformed("call tuple"));
            };
            let [target, value, payload]: [Token; 3] = fields.try_into().map_err(|_| malformed("call tuple"))?;
            Ok(Call {
                target: take_identity(target)?,
                value: take_amount(value)?,
                payload: take_bytes(payload)?,
            })
        })
        .collect()
}
