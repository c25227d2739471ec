//! Host-facing API surface, shaped like the JSON-RPC wallet interface:
//! requests, the `ChannelResult` they resolve to, and the numeric,
//! per-operation error codes every rejected request maps to.

use crate::channel::AllocationItem;
use crate::{Address, Hash, U256};
use alloc::string::String;
use alloc::vec::Vec;

use super::ParticipantMessage;

/// Which funding sub-protocol a new channel should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingStrategy {
    Direct,
    Ledger,
    Virtual,
}

/// Requests a host may issue against the wallet.
#[derive(Debug, Clone)]
pub enum ApiRequest {
    CreateChannel {
        chain_id: U256,
        participants: Vec<Address>,
        allocations: Vec<AllocationItem>,
        app_definition: Address,
        app_data: Vec<u8>,
        challenge_duration: u64,
        funding_strategy: FundingStrategy,
    },
    JoinChannel {
        channel_id: Hash,
    },
    UpdateChannel {
        channel_id: Hash,
        /// Must match the channel's participant set; participants cannot
        /// change after creation.
        participants: Vec<Address>,
        allocations: Vec<AllocationItem>,
        app_data: Vec<u8>,
    },
    GetState {
        channel_id: Hash,
    },
    CloseChannel {
        channel_id: Hash,
    },
    ChallengeChannel {
        channel_id: Hash,
    },
    /// A message from another participant, delivered by the host's
    /// transport.
    PushMessage {
        sender: Address,
        recipient: Address,
        message: ParticipantMessage,
    },
}

/// Lifecycle position reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Proposed,
    Opening,
    Running,
    Closing,
    Closed,
    Challenging,
}

/// Snapshot of a channel returned by most requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelResult {
    pub channel_id: Hash,
    pub turn_num: u64,
    pub status: ChannelStatus,
    pub participants: Vec<Address>,
    pub allocations: Vec<AllocationItem>,
    pub app_data: Vec<u8>,
}

/// Numeric error codes, namespaced per operation. The wire protocol
/// promises stable numbers, so these are spelled out rather than derived.
pub mod codes {
    // CreateChannel: 100..
    pub const CREATE_CHANNEL_CHANNEL_EXISTS: u32 = 100;
    pub const CREATE_CHANNEL_INVALID_ALLOCATION: u32 = 101;
    pub const CREATE_CHANNEL_SIGNING_FAILED: u32 = 102;

    // JoinChannel: 200..
    pub const JOIN_CHANNEL_CHANNEL_NOT_FOUND: u32 = 200;
    pub const JOIN_CHANNEL_INVALID_STATE: u32 = 201;

    // CloseChannel: 300..
    pub const CLOSE_CHANNEL_NOT_YOUR_TURN: u32 = 300;
    pub const CLOSE_CHANNEL_CHANNEL_NOT_FOUND: u32 = 301;

    // UpdateChannel: 400..
    pub const UPDATE_CHANNEL_CHANNEL_NOT_FOUND: u32 = 400;
    pub const UPDATE_CHANNEL_INVALID_TRANSITION: u32 = 401;
    pub const UPDATE_CHANNEL_INVALID_APP_DATA: u32 = 402;
    pub const UPDATE_CHANNEL_NOT_YOUR_TURN: u32 = 403;

    // GetState: 500..
    pub const GET_STATE_CHANNEL_NOT_FOUND: u32 = 500;

    // ChallengeChannel: 600..
    pub const CHALLENGE_CHANNEL_CHANNEL_NOT_FOUND: u32 = 600;
    pub const CHALLENGE_CHANNEL_NO_SUPPORTED_STATE: u32 = 601;

    // PushMessage: 700..
    pub const PUSH_MESSAGE_CHANNEL_NOT_FOUND: u32 = 700;
    pub const PUSH_MESSAGE_VALIDATION_FAILED: u32 = 701;
    pub const PUSH_MESSAGE_WRONG_RECIPIENT: u32 = 702;
}

/// Structured error response. Every rejected request carries one of the
/// [codes]; a request never fails with a stringly-typed error alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: u32,
    pub message: String,
}

impl ApiError {
    pub fn new(code: u32, message: &str) -> Self {
        ApiError {
            code,
            message: String::from(message),
        }
    }
}

/// Successful payloads mirroring the request set.
#[derive(Debug, Clone)]
pub enum ApiResponse {
    ChannelResult(ChannelResult),
    /// PushMessage acknowledges without a channel snapshot when the
    /// message concerned a channel we are not a participant of yet.
    Ack,
}

pub type ApiResult = Result<ApiResponse, ApiError>;
