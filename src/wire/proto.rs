//! Protobuf messages for the participant wire protocol, written out by
//! hand so no protoc run is needed at build time, plus the conversions
//! between them and the in-memory types.
//!
//! Scalars that do not fit protobuf's integer types travel as bytes:
//! uints as 32 big-endian bytes, addresses as 20, signatures as 65.

use alloc::string::String;
use alloc::vec::Vec;

use crate::channel::{AllocationItem, Channel, Destination, Outcome, SignedState, State};
use crate::messages::{api::FundingStrategy, ChannelProposal, ParticipantMessage};
use crate::{Address, Bytes32, Hash, Signature, U256};

use super::Error;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(bytes = "vec", tag = "1")]
    pub sender: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub recipient: Vec<u8>,
    #[prost(oneof = "envelope::Msg", tags = "3, 4, 5, 6")]
    pub msg: Option<envelope::Msg>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "3")]
        ChannelProposalMsg(super::ChannelProposalMsg),
        #[prost(message, tag = "4")]
        SignedStatesMsg(super::SignedStatesMsg),
        #[prost(message, tag = "5")]
        ProposalRejMsg(super::ProposalRejMsg),
        #[prost(message, tag = "6")]
        UpdateRejMsg(super::UpdateRejMsg),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub chain_id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub participants: Vec<Vec<u8>>,
    #[prost(bytes = "vec", tag = "3")]
    pub channel_nonce: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AllocationItemMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub destination: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub amount: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AllocationMsg {
    #[prost(message, repeated, tag = "1")]
    pub items: Vec<AllocationItemMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GuaranteeMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub target_channel_id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub destinations: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutcomeMsg {
    #[prost(oneof = "outcome_msg::Outcome", tags = "1, 2")]
    pub outcome: Option<outcome_msg::Outcome>,
}

pub mod outcome_msg {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(message, tag = "1")]
        Allocation(super::AllocationMsg),
        #[prost(message, tag = "2")]
        Guarantee(super::GuaranteeMsg),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StateMsg {
    #[prost(message, optional, tag = "1")]
    pub channel: Option<ChannelMsg>,
    #[prost(message, optional, tag = "2")]
    pub outcome: Option<OutcomeMsg>,
    #[prost(uint64, tag = "3")]
    pub turn_num: u64,
    #[prost(bool, tag = "4")]
    pub is_final: bool,
    #[prost(bytes = "vec", tag = "5")]
    pub app_definition: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub app_data: Vec<u8>,
    #[prost(uint64, tag = "7")]
    pub challenge_duration: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedStateMsg {
    #[prost(message, optional, tag = "1")]
    pub state: Option<StateMsg>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub signatures: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedStatesMsg {
    #[prost(message, repeated, tag = "1")]
    pub states: Vec<SignedStateMsg>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FundingStrategyMsg {
    Direct = 0,
    Ledger = 1,
    Virtual = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChannelProposalMsg {
    #[prost(message, optional, tag = "1")]
    pub signed_state: Option<SignedStateMsg>,
    #[prost(enumeration = "FundingStrategyMsg", tag = "2")]
    pub funding_strategy: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProposalRejMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateRejMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub channel_id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub turn_num: u64,
    #[prost(string, tag = "3")]
    pub reason: String,
}

fn u256_to_vec(v: &U256) -> Vec<u8> {
    let mut bytes = [0u8; 32];
    v.to_big_endian(&mut bytes);
    bytes.to_vec()
}

fn u256_from(bytes: &[u8], field: &'static str) -> Result<U256, Error> {
    if bytes.len() > 32 {
        return Err(Error::InvalidLength(field));
    }
    Ok(U256::from_big_endian(bytes))
}

pub(super) fn address_from(bytes: &[u8], field: &'static str) -> Result<Address, Error> {
    let bytes: [u8; 20] = bytes.try_into().map_err(|_| Error::InvalidLength(field))?;
    Ok(Address(bytes))
}

fn bytes32_from(bytes: &[u8], field: &'static str) -> Result<Bytes32, Error> {
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidLength(field))?;
    Ok(Bytes32(bytes))
}

fn hash_from(bytes: &[u8], field: &'static str) -> Result<Hash, Error> {
    Ok(Hash(bytes32_from(bytes, field)?.0))
}

fn signature_from(bytes: &[u8], field: &'static str) -> Result<Signature, Error> {
    let bytes: [u8; 65] = bytes.try_into().map_err(|_| Error::InvalidLength(field))?;
    Ok(Signature(bytes))
}

impl From<&Channel> for ChannelMsg {
    fn from(channel: &Channel) -> Self {
        ChannelMsg {
            chain_id: u256_to_vec(&channel.chain_id),
            participants: channel
                .participants
                .iter()
                .map(|a| a.0.to_vec())
                .collect(),
            channel_nonce: u256_to_vec(&channel.channel_nonce),
        }
    }
}

impl TryFrom<ChannelMsg> for Channel {
    type Error = Error;
    fn try_from(msg: ChannelMsg) -> Result<Self, Error> {
        Ok(Channel {
            chain_id: u256_from(&msg.chain_id, "chain_id")?,
            participants: msg
                .participants
                .iter()
                .map(|p| address_from(p, "participants"))
                .collect::<Result<_, _>>()?,
            channel_nonce: u256_from(&msg.channel_nonce, "channel_nonce")?,
        })
    }
}

impl From<&Outcome> for OutcomeMsg {
    fn from(outcome: &Outcome) -> Self {
        let outcome = match outcome {
            Outcome::Allocation(items) => outcome_msg::Outcome::Allocation(AllocationMsg {
                items: items
                    .iter()
                    .map(|item| AllocationItemMsg {
                        destination: item.destination.0 .0.to_vec(),
                        amount: u256_to_vec(&item.amount),
                    })
                    .collect(),
            }),
            Outcome::Guarantee {
                target_channel_id,
                destinations,
            } => outcome_msg::Outcome::Guarantee(GuaranteeMsg {
                target_channel_id: target_channel_id.0.to_vec(),
                destinations: destinations.iter().map(|d| d.0 .0.to_vec()).collect(),
            }),
        };
        OutcomeMsg {
            outcome: Some(outcome),
        }
    }
}

impl TryFrom<OutcomeMsg> for Outcome {
    type Error = Error;
    fn try_from(msg: OutcomeMsg) -> Result<Self, Error> {
        match msg.outcome.ok_or(Error::MissingField("outcome"))? {
            outcome_msg::Outcome::Allocation(msg) => Ok(Outcome::Allocation(
                msg.items
                    .iter()
                    .map(|item| {
                        Ok(AllocationItem {
                            destination: Destination(bytes32_from(
                                &item.destination,
                                "destination",
                            )?),
                            amount: u256_from(&item.amount, "amount")?,
                        })
                    })
                    .collect::<Result<_, Error>>()?,
            )),
            outcome_msg::Outcome::Guarantee(msg) => Ok(Outcome::Guarantee {
                target_channel_id: hash_from(&msg.target_channel_id, "target_channel_id")?,
                destinations: msg
                    .destinations
                    .iter()
                    .map(|d| Ok(Destination(bytes32_from(d, "destinations")?)))
                    .collect::<Result<_, Error>>()?,
            }),
        }
    }
}

impl From<&State> for StateMsg {
    fn from(state: &State) -> Self {
        StateMsg {
            channel: Some((&state.channel).into()),
            outcome: Some((&state.outcome).into()),
            turn_num: state.turn_num(),
            is_final: state.is_final,
            app_definition: state.app_definition.0.to_vec(),
            app_data: state.app_data.clone(),
            challenge_duration: state.challenge_duration,
        }
    }
}

impl TryFrom<StateMsg> for State {
    type Error = Error;
    fn try_from(msg: StateMsg) -> Result<Self, Error> {
        Ok(State::from_parts(
            msg.channel.ok_or(Error::MissingField("channel"))?.try_into()?,
            msg.outcome.ok_or(Error::MissingField("outcome"))?.try_into()?,
            msg.turn_num,
            msg.is_final,
            address_from(&msg.app_definition, "app_definition")?,
            msg.app_data,
            msg.challenge_duration,
        ))
    }
}

impl From<&SignedState> for SignedStateMsg {
    fn from(signed: &SignedState) -> Self {
        SignedStateMsg {
            state: Some(signed.state().into()),
            signatures: signed.signatures().iter().map(|s| s.0.to_vec()).collect(),
        }
    }
}

impl TryFrom<SignedStateMsg> for SignedState {
    type Error = Error;
    fn try_from(msg: SignedStateMsg) -> Result<Self, Error> {
        Ok(SignedState::from_parts(
            msg.state.ok_or(Error::MissingField("state"))?.try_into()?,
            msg.signatures
                .iter()
                .map(|s| signature_from(s, "signatures"))
                .collect::<Result<_, _>>()?,
        ))
    }
}

impl From<FundingStrategy> for FundingStrategyMsg {
    fn from(strategy: FundingStrategy) -> Self {
        match strategy {
            FundingStrategy::Direct => FundingStrategyMsg::Direct,
            FundingStrategy::Ledger => FundingStrategyMsg::Ledger,
            FundingStrategy::Virtual => FundingStrategyMsg::Virtual,
        }
    }
}

impl From<FundingStrategyMsg> for FundingStrategy {
    fn from(msg: FundingStrategyMsg) -> Self {
        match msg {
            FundingStrategyMsg::Direct => FundingStrategy::Direct,
            FundingStrategyMsg::Ledger => FundingStrategy::Ledger,
            FundingStrategyMsg::Virtual => FundingStrategy::Virtual,
        }
    }
}

impl From<&ParticipantMessage> for envelope::Msg {
    fn from(msg: &ParticipantMessage) -> Self {
        match msg {
            ParticipantMessage::ChannelProposal(proposal) => {
                envelope::Msg::ChannelProposalMsg(ChannelProposalMsg {
                    signed_state: Some((&proposal.signed_state).into()),
                    funding_strategy: FundingStrategyMsg::from(proposal.funding_strategy) as i32,
                })
            }
            ParticipantMessage::SignedStates(states) => {
                envelope::Msg::SignedStatesMsg(SignedStatesMsg {
                    states: states.iter().map(Into::into).collect(),
                })
            }
            ParticipantMessage::ProposalRejected { channel_id, reason } => {
                envelope::Msg::ProposalRejMsg(ProposalRejMsg {
                    channel_id: channel_id.0.to_vec(),
                    reason: reason.clone(),
                })
            }
            ParticipantMessage::UpdateRejected {
                channel_id,
                turn_num,
                reason,
            } => envelope::Msg::UpdateRejMsg(UpdateRejMsg {
                channel_id: channel_id.0.to_vec(),
                turn_num: *turn_num,
                reason: reason.clone(),
            }),
        }
    }
}

impl TryFrom<envelope::Msg> for ParticipantMessage {
    type Error = Error;
    fn try_from(msg: envelope::Msg) -> Result<Self, Error> {
        match msg {
            envelope::Msg::ChannelProposalMsg(msg) => {
                let funding_strategy = FundingStrategyMsg::from_i32(msg.funding_strategy)
                    .ok_or(Error::UnknownEnumValue("funding_strategy"))?
                    .into();
                Ok(ParticipantMessage::ChannelProposal(ChannelProposal {
                    signed_state: msg
                        .signed_state
                        .ok_or(Error::MissingField("signed_state"))?
                        .try_into()?,
                    funding_strategy,
                }))
            }
            envelope::Msg::SignedStatesMsg(msg) => Ok(ParticipantMessage::SignedStates(
                msg.states
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<_, _>>()?,
            )),
            envelope::Msg::ProposalRejMsg(msg) => Ok(ParticipantMessage::ProposalRejected {
                channel_id: hash_from(&msg.channel_id, "channel_id")?,
                reason: msg.reason,
            }),
            envelope::Msg::UpdateRejMsg(msg) => Ok(ParticipantMessage::UpdateRejected {
                channel_id: hash_from(&msg.channel_id, "channel_id")?,
                turn_num: msg.turn_num,
                reason: msg.reason,
            }),
        }
    }
}
