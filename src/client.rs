//! The wallet: host-facing coordinator over the protocol state machines.
//!
//! One [Wallet] owns the channel store and a protocol instance per
//! channel. The host feeds it API requests, peer messages and chain
//! events; the wallet routes each to the protocol that consumes it and
//! hands back the resulting effects. Outgoing peer messages surface as
//! [Notification::MessageQueued] effects, so the host stays in charge of
//! the transport.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, warn};
use rand::Rng;

use crate::channel::{
    AllocationItem, Channel, ChannelStore, Funding, Outcome, SignedState, State, StoreError,
};
use crate::messages::api::{
    codes, ApiError, ApiRequest, ApiResponse, ApiResult, ChannelResult, ChannelStatus,
    FundingStrategy,
};
use crate::messages::{
    ChainEvent, ChannelProposal, Notification, ParticipantMessage, SupportProof,
    TransactionRequest,
};
use crate::protocol::{
    messages_to_peers, ApplicationAction, ApplicationProtocol, DepositPlan, DirectFunding,
    DisputeAction, Effect, Effects, FailureReason, LedgerFunding, LedgerFundingAction, SharedData,
    VirtualCtx, VirtualFunding, VirtualFundingAction,
};
use crate::sig::Signer;
use crate::{Address, Hash, U256};

/// Funding protocol running for a target channel.
#[derive(Debug)]
enum FundingProcess {
    Direct(DirectFunding),
    Ledger(LedgerFunding),
    Virtual(VirtualFunding),
}

impl FundingProcess {
    fn is_terminal(&self) -> bool {
        match self {
            FundingProcess::Direct(p) => p.is_terminal(),
            FundingProcess::Ledger(p) => p.is_terminal(),
            FundingProcess::Virtual(p) => p.is_terminal(),
        }
    }
}

/// Which infrastructure channel of a funding process an incoming state or
/// rejection concerns.
#[derive(Debug, Clone, Copy)]
enum FundingRoute {
    Ledger,
    VirtualJoint,
    VirtualGuarantor,
    VirtualLedger,
}

/// The wallet. Pure state machine like the protocols it hosts: it never
/// performs I/O itself, every entry point returns the effects the host
/// has to apply.
#[derive(Debug)]
pub struct Wallet {
    address: Address,
    shared: SharedData,
    /// Application protocol per channel we participate in.
    channels: BTreeMap<Hash, ApplicationProtocol>,
    /// Funding protocol per target channel, keyed by the target.
    funding: BTreeMap<Hash, FundingProcess>,
    /// Funding strategy agreed at proposal time, waiting for the pre-fund
    /// setup to be fully signed. Depositing earlier would be unsafe.
    pending_funding: BTreeMap<Hash, FundingStrategy>,
    /// Proposals received from peers, kept until the host joins or the
    /// proposer gives up.
    proposals: BTreeMap<Hash, ChannelProposal>,
}

impl Wallet {
    pub fn new(signer: Signer) -> Self {
        let address = signer.address();
        Wallet {
            address,
            shared: SharedData::new(ChannelStore::new(signer)),
            channels: BTreeMap::new(),
            funding: BTreeMap::new(),
            pending_funding: BTreeMap::new(),
            proposals: BTreeMap::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Read access to the underlying store, for inspection by the host.
    pub fn store(&self) -> &ChannelStore {
        &self.shared.store
    }

    /// Handle one host request. The randomness source is only used for
    /// channel nonces.
    pub fn handle_request<R: Rng>(&mut self, rng: &mut R, request: ApiRequest) -> (ApiResult, Effects) {
        let (result, effects) = match request {
            ApiRequest::CreateChannel {
                chain_id,
                participants,
                allocations,
                app_definition,
                app_data,
                challenge_duration,
                funding_strategy,
            } => self.create_channel(
                rng,
                chain_id,
                participants,
                allocations,
                app_definition,
                app_data,
                challenge_duration,
                funding_strategy,
            ),
            ApiRequest::JoinChannel { channel_id } => self.join_channel(channel_id),
            ApiRequest::UpdateChannel {
                channel_id,
                participants,
                allocations,
                app_data,
            } => self.update_channel(channel_id, participants, allocations, app_data),
            ApiRequest::GetState { channel_id } => (
                self.channel_result(channel_id)
                    .map(ApiResponse::ChannelResult)
                    .map_err(|_| {
                        ApiError::new(codes::GET_STATE_CHANNEL_NOT_FOUND, "unknown channel")
                    }),
                vec![],
            ),
            ApiRequest::CloseChannel { channel_id } => self.close_channel(channel_id),
            ApiRequest::ChallengeChannel { channel_id } => self.challenge_channel(channel_id),
            ApiRequest::PushMessage {
                sender,
                recipient,
                message,
            } => self.push_message(sender, recipient, message),
        };
        (result, self.queue_outgoing(effects))
    }

    /// Feed one chain watcher event. Events are idempotent; replays after
    /// a watcher reconnect are absorbed.
    pub fn handle_chain_event(&mut self, event: ChainEvent) -> Effects {
        let effects = match &event {
            ChainEvent::Deposited { destination, .. } => {
                let dest = *destination;
                match self.funding.remove(&dest) {
                    Some(FundingProcess::Direct(process)) => {
                        let was_terminal = process.is_terminal();
                        let (process, effects) = process.reduce(&event);
                        self.settle_funding(
                            dest,
                            FundingProcess::Direct(process),
                            was_terminal,
                            effects,
                        )
                    }
                    Some(other) => {
                        self.funding.insert(dest, other);
                        vec![]
                    }
                    // deposits into a fresh ledger channel drive the
                    // ledger funding of its target
                    None => match self.funding_route_for(dest) {
                        Some((target, FundingRoute::Ledger)) => {
                            match self.funding.remove(&target) {
                                Some(FundingProcess::Ledger(process)) => {
                                    let was_terminal = process.is_terminal();
                                    let (process, effects) = process.reduce(
                                        LedgerFundingAction::Deposited(event.clone()),
                                        &mut self.shared,
                                    );
                                    self.settle_funding(
                                        target,
                                        FundingProcess::Ledger(process),
                                        was_terminal,
                                        effects,
                                    )
                                }
                                Some(other) => {
                                    self.funding.insert(target, other);
                                    vec![]
                                }
                                None => vec![],
                            }
                        }
                        _ => vec![],
                    },
                }
            }
            ChainEvent::ChallengeRegistered {
                channel_id,
                finalizes_at,
                challenge_states,
                ..
            } => {
                let channel_id = *channel_id;
                // our own challenge landing vs. one we have to answer
                let action = if matches!(
                    self.channels.get(&channel_id),
                    Some(ApplicationProtocol::WaitForDispute { .. })
                ) {
                    ApplicationAction::Dispute(DisputeAction::ChallengeRegistered {
                        channel_id,
                        finalizes_at: *finalizes_at,
                    })
                } else {
                    ApplicationAction::ChallengeDetected {
                        finalizes_at: *finalizes_at,
                        challenge_states: challenge_states.clone(),
                    }
                };
                let mut effects = self.reduce_application(channel_id, action);
                if let Ok(result) = self.channel_result(channel_id) {
                    effects.push(Effect::Notify(Notification::ChannelUpdated(result)));
                }
                effects
            }
            ChainEvent::ChallengeCleared { channel_id, .. } => self.reduce_application(
                *channel_id,
                ApplicationAction::Dispute(DisputeAction::ChallengeCleared {
                    channel_id: *channel_id,
                }),
            ),
            ChainEvent::Concluded { channel_id } => {
                let channel_id = *channel_id;
                let mut effects = self.reduce_application(channel_id, ApplicationAction::Concluded);
                if let Ok(result) = self.channel_result(channel_id) {
                    effects.push(Effect::Notify(Notification::ChannelUpdated(result)));
                }
                effects
            }
            ChainEvent::AssetTransferred { channel_id, .. } => {
                debug!("wallet: payout observed for {:?}", channel_id);
                vec![]
            }
        };
        self.queue_outgoing(effects)
    }

    /// Advance wall-clock time, expiring challenges that ran out.
    pub fn handle_time(&mut self, now: u64) -> Effects {
        let disputing: Vec<Hash> = self
            .channels
            .iter()
            .filter(|(_, p)| matches!(p, ApplicationProtocol::WaitForDispute { .. }))
            .map(|(id, _)| *id)
            .collect();
        let mut effects = vec![];
        for channel_id in disputing {
            effects.extend(self.reduce_application(
                channel_id,
                ApplicationAction::Dispute(DisputeAction::ChallengeExpired { channel_id, now }),
            ));
        }
        self.queue_outgoing(effects)
    }

    /// Report that a transaction the wallet requested never landed. Only
    /// disputes care; everything else is retried by the host.
    pub fn handle_transaction_failure(&mut self, channel_id: Hash) -> Effects {
        let effects = self.reduce_application(
            channel_id,
            ApplicationAction::Dispute(DisputeAction::TransactionFailed { channel_id }),
        );
        self.queue_outgoing(effects)
    }

    /// Kick off virtual funding for a channel created with
    /// [FundingStrategy::Virtual]. The joint/guarantor/ledger topology is
    /// negotiated with the hub out of band and supplied by the host.
    pub fn start_virtual_funding(&mut self, ctx: VirtualCtx) -> Effects {
        let target = ctx.target_id;
        self.pending_funding.remove(&target);
        let (process, effects) = VirtualFunding::new(ctx, &mut self.shared);
        let effects = self.settle_funding(target, FundingProcess::Virtual(process), false, effects);
        self.queue_outgoing(effects)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_channel<R: Rng>(
        &mut self,
        rng: &mut R,
        chain_id: U256,
        participants: Vec<Address>,
        allocations: Vec<AllocationItem>,
        app_definition: Address,
        app_data: Vec<u8>,
        challenge_duration: u64,
        funding_strategy: FundingStrategy,
    ) -> (ApiResult, Effects) {
        if participants.first() != Some(&self.address) {
            return (
                Err(ApiError::new(
                    codes::CREATE_CHANNEL_SIGNING_FAILED,
                    "the creator must be the first participant",
                )),
                vec![],
            );
        }
        if allocations.is_empty() {
            return (
                Err(ApiError::new(
                    codes::CREATE_CHANNEL_INVALID_ALLOCATION,
                    "a channel needs at least one allocation",
                )),
                vec![],
            );
        }

        let mut nonce = [0u8; 32];
        rng.fill(&mut nonce);
        let channel = Channel {
            chain_id,
            participants,
            channel_nonce: U256::from_big_endian(&nonce),
        };
        let state0 = State::new(
            channel,
            Outcome::Allocation(allocations),
            app_definition,
            app_data,
            challenge_duration,
        );

        // strategy feasibility before anything is stored
        match funding_strategy {
            FundingStrategy::Direct => {
                if DepositPlan::from_state(&state0, 0).is_err() {
                    return (
                        Err(ApiError::new(
                            codes::CREATE_CHANNEL_INVALID_ALLOCATION,
                            "allocations do not yield a deposit plan",
                        )),
                        vec![],
                    );
                }
            }
            // ledger funding opens a fresh ledger channel when no shared
            // one exists; the virtual topology arrives later from the host
            FundingStrategy::Ledger | FundingStrategy::Virtual => {}
        }

        let (protocol, effects) = match ApplicationProtocol::propose(state0, &mut self.shared) {
            Ok(ok) => ok,
            Err(StoreError::ChannelExists) => {
                return (
                    Err(ApiError::new(
                        codes::CREATE_CHANNEL_CHANNEL_EXISTS,
                        "channel already exists",
                    )),
                    vec![],
                )
            }
            Err(e) => {
                return (
                    Err(ApiError {
                        code: codes::CREATE_CHANNEL_SIGNING_FAILED,
                        message: format!("{:?}", e),
                    }),
                    vec![],
                )
            }
        };
        let channel_id = protocol.channel_id();

        // peers get the full proposal, funding strategy included
        let mut effects: Effects = effects
            .into_iter()
            .map(|e| match e {
                Effect::Message {
                    recipient,
                    message: ParticipantMessage::SignedStates(states),
                } if states.len() == 1 => Effect::Message {
                    recipient,
                    message: ParticipantMessage::ChannelProposal(ChannelProposal {
                        signed_state: states[0].clone(),
                        funding_strategy,
                    }),
                },
                other => other,
            })
            .collect();

        self.channels.insert(channel_id, protocol);
        self.pending_funding.insert(channel_id, funding_strategy);

        match self.channel_result(channel_id) {
            Ok(result) => {
                effects.push(Effect::Notify(Notification::ChannelProposed(result.clone())));
                (Ok(ApiResponse::ChannelResult(result)), effects)
            }
            Err(e) => (
                Err(ApiError {
                    code: codes::CREATE_CHANNEL_SIGNING_FAILED,
                    message: format!("{:?}", e),
                }),
                effects,
            ),
        }
    }

    fn join_channel(&mut self, channel_id: Hash) -> (ApiResult, Effects) {
        let proposal = match self.proposals.get(&channel_id) {
            Some(p) => p.clone(),
            None => {
                return (
                    Err(ApiError::new(
                        codes::JOIN_CHANNEL_CHANNEL_NOT_FOUND,
                        "no proposal for this channel",
                    )),
                    vec![],
                )
            }
        };
        let our_index = match proposal.signed_state.state().channel.index_of(self.address) {
            Some(i) => i,
            None => {
                return (
                    Err(ApiError::new(
                        codes::JOIN_CHANNEL_INVALID_STATE,
                        "we are not a participant of the proposed channel",
                    )),
                    vec![],
                )
            }
        };

        let (protocol, mut effects) =
            match ApplicationProtocol::join(proposal.signed_state, our_index, &mut self.shared) {
                Ok(ok) => ok,
                Err(e) => {
                    return (
                        Err(ApiError {
                            code: codes::JOIN_CHANNEL_INVALID_STATE,
                            message: format!("{:?}", e),
                        }),
                        vec![],
                    )
                }
            };
        self.proposals.remove(&channel_id);
        let running = matches!(protocol, ApplicationProtocol::Ongoing { .. });
        self.channels.insert(channel_id, protocol);
        self.pending_funding
            .insert(channel_id, proposal.funding_strategy);
        if running {
            effects.extend(self.start_funding(channel_id));
        }

        match self.channel_result(channel_id) {
            Ok(result) => {
                effects.push(Effect::Notify(Notification::ChannelUpdated(result.clone())));
                (Ok(ApiResponse::ChannelResult(result)), effects)
            }
            Err(e) => (
                Err(ApiError {
                    code: codes::JOIN_CHANNEL_INVALID_STATE,
                    message: format!("{:?}", e),
                }),
                effects,
            ),
        }
    }

    fn update_channel(
        &mut self,
        channel_id: Hash,
        participants: Vec<Address>,
        allocations: Vec<AllocationItem>,
        app_data: Vec<u8>,
    ) -> (ApiResult, Effects) {
        match self.shared.store.entry(channel_id) {
            Ok(entry) => {
                if !participants.is_empty() && entry.channel().participants != participants {
                    return (
                        Err(ApiError::new(
                            codes::UPDATE_CHANNEL_INVALID_TRANSITION,
                            "participants cannot change",
                        )),
                        vec![],
                    );
                }
            }
            Err(_) => {
                return (
                    Err(ApiError::new(
                        codes::UPDATE_CHANNEL_CHANNEL_NOT_FOUND,
                        "unknown channel",
                    )),
                    vec![],
                )
            }
        }
        if !matches!(
            self.channels.get(&channel_id),
            Some(ApplicationProtocol::Ongoing { .. })
        ) {
            return (
                Err(ApiError::new(
                    codes::UPDATE_CHANNEL_INVALID_TRANSITION,
                    "channel is not running",
                )),
                vec![],
            );
        }
        // base the update on the newest stored state, countersigned or
        // not; the store already validated it
        let latest = match self
            .shared
            .store
            .entry(channel_id)
            .ok()
            .and_then(|e| e.latest())
        {
            Some(signed) => signed.state().clone(),
            None => {
                return (
                    Err(ApiError::new(
                        codes::UPDATE_CHANNEL_INVALID_TRANSITION,
                        "no state to update from",
                    )),
                    vec![],
                )
            }
        };

        let mut next = latest.next();
        next.outcome = Outcome::Allocation(allocations);
        next.app_data = app_data;
        let turn_num = next.turn_num();

        match self.shared.store.sign_and_store(next) {
            Ok(signed) => {
                let entry = match self.shared.store.entry(channel_id) {
                    Ok(e) => e,
                    Err(_) => {
                        return (
                            Err(ApiError::new(
                                codes::UPDATE_CHANNEL_CHANNEL_NOT_FOUND,
                                "unknown channel",
                            )),
                            vec![],
                        )
                    }
                };
                let mut effects = messages_to_peers(
                    entry.channel(),
                    entry.our_index(),
                    ParticipantMessage::SignedStates(vec![signed]),
                );
                effects.push(Effect::Notify(Notification::StateSigned {
                    channel_id,
                    turn_num,
                }));
                match self.channel_result(channel_id) {
                    Ok(result) => {
                        effects.push(Effect::Notify(Notification::ChannelUpdated(result.clone())));
                        (Ok(ApiResponse::ChannelResult(result)), effects)
                    }
                    Err(e) => (
                        Err(ApiError {
                            code: codes::UPDATE_CHANNEL_INVALID_TRANSITION,
                            message: format!("{:?}", e),
                        }),
                        effects,
                    ),
                }
            }
            Err(StoreError::NotYourTurn) => (
                Err(ApiError::new(
                    codes::UPDATE_CHANNEL_NOT_YOUR_TURN,
                    "another participant moves next",
                )),
                vec![],
            ),
            Err(StoreError::ChannelNotFound) => (
                Err(ApiError::new(
                    codes::UPDATE_CHANNEL_CHANNEL_NOT_FOUND,
                    "unknown channel",
                )),
                vec![],
            ),
            Err(e) => (
                Err(ApiError {
                    code: codes::UPDATE_CHANNEL_INVALID_TRANSITION,
                    message: format!("{:?}", e),
                }),
                vec![],
            ),
        }
    }

    fn close_channel(&mut self, channel_id: Hash) -> (ApiResult, Effects) {
        if self.shared.store.entry(channel_id).is_err() {
            return (
                Err(ApiError::new(
                    codes::CLOSE_CHANNEL_CHANNEL_NOT_FOUND,
                    "unknown channel",
                )),
                vec![],
            );
        }
        if !matches!(
            self.channels.get(&channel_id),
            Some(ApplicationProtocol::Ongoing { .. })
        ) {
            return (
                Err(ApiError::new(
                    codes::CLOSE_CHANNEL_NOT_YOUR_TURN,
                    "channel is not in a closable state",
                )),
                vec![],
            );
        }

        // countersign a peer's final state if one is already pending,
        // otherwise produce our own
        let to_sign = {
            let entry = match self.shared.store.entry(channel_id) {
                Ok(e) => e,
                Err(_) => {
                    return (
                        Err(ApiError::new(
                            codes::CLOSE_CHANNEL_CHANNEL_NOT_FOUND,
                            "unknown channel",
                        )),
                        vec![],
                    )
                }
            };
            match entry.latest() {
                Some(signed) if signed.state().is_final => signed.state().clone(),
                Some(signed) => signed.state().next_final(),
                None => {
                    return (
                        Err(ApiError::new(
                            codes::CLOSE_CHANNEL_NOT_YOUR_TURN,
                            "no state to close from",
                        )),
                        vec![],
                    )
                }
            }
        };

        match self.shared.store.sign_and_store(to_sign) {
            Ok(signed) => {
                let turn_num = signed.state().turn_num();
                let entry = match self.shared.store.entry(channel_id) {
                    Ok(e) => e,
                    Err(_) => {
                        return (
                            Err(ApiError::new(
                                codes::CLOSE_CHANNEL_CHANNEL_NOT_FOUND,
                                "unknown channel",
                            )),
                            vec![],
                        )
                    }
                };
                let mut effects = messages_to_peers(
                    entry.channel(),
                    entry.our_index(),
                    ParticipantMessage::SignedStates(vec![signed]),
                );
                effects.push(Effect::Notify(Notification::StateSigned {
                    channel_id,
                    turn_num,
                }));
                // our signature may have completed the final state
                if let Ok(supported) = self.shared.store.latest_supported_signed_state(channel_id) {
                    if supported.state().is_final {
                        effects.push(Effect::Transaction(TransactionRequest::Conclude {
                            proof: SupportProof::from_supported_state(&supported),
                        }));
                    }
                }
                match self.channel_result(channel_id) {
                    Ok(result) => {
                        effects.push(Effect::Notify(Notification::ChannelUpdated(result.clone())));
                        (Ok(ApiResponse::ChannelResult(result)), effects)
                    }
                    Err(e) => (
                        Err(ApiError {
                            code: codes::CLOSE_CHANNEL_CHANNEL_NOT_FOUND,
                            message: format!("{:?}", e),
                        }),
                        effects,
                    ),
                }
            }
            Err(StoreError::NotYourTurn) => (
                Err(ApiError::new(
                    codes::CLOSE_CHANNEL_NOT_YOUR_TURN,
                    "another participant moves next",
                )),
                vec![],
            ),
            Err(StoreError::ChannelNotFound) => (
                Err(ApiError::new(
                    codes::CLOSE_CHANNEL_CHANNEL_NOT_FOUND,
                    "unknown channel",
                )),
                vec![],
            ),
            Err(e) => (
                Err(ApiError {
                    code: codes::CLOSE_CHANNEL_NOT_YOUR_TURN,
                    message: format!("{:?}", e),
                }),
                vec![],
            ),
        }
    }

    fn challenge_channel(&mut self, channel_id: Hash) -> (ApiResult, Effects) {
        if !self.channels.contains_key(&channel_id) {
            return (
                Err(ApiError::new(
                    codes::CHALLENGE_CHANNEL_CHANNEL_NOT_FOUND,
                    "unknown channel",
                )),
                vec![],
            );
        }
        if self.shared.store.latest_supported_state(channel_id).is_err() {
            return (
                Err(ApiError::new(
                    codes::CHALLENGE_CHANNEL_NO_SUPPORTED_STATE,
                    "nothing to challenge with",
                )),
                vec![],
            );
        }

        let effects = self.reduce_application(channel_id, ApplicationAction::ChallengeRequested);
        match self.channel_result(channel_id) {
            Ok(result) => (Ok(ApiResponse::ChannelResult(result)), effects),
            Err(e) => (
                Err(ApiError {
                    code: codes::CHALLENGE_CHANNEL_CHANNEL_NOT_FOUND,
                    message: format!("{:?}", e),
                }),
                effects,
            ),
        }
    }

    fn push_message(
        &mut self,
        _sender: Address,
        recipient: Address,
        message: ParticipantMessage,
    ) -> (ApiResult, Effects) {
        if recipient != self.address {
            return (
                Err(ApiError::new(
                    codes::PUSH_MESSAGE_WRONG_RECIPIENT,
                    "message addressed to someone else",
                )),
                vec![],
            );
        }

        match message {
            ParticipantMessage::ChannelProposal(proposal) => {
                let state = proposal.signed_state.state();
                let channel_id = match state.channel_id() {
                    Ok(id) => id,
                    Err(_) => {
                        return (
                            Err(ApiError::new(
                                codes::PUSH_MESSAGE_VALIDATION_FAILED,
                                "undecodable proposal",
                            )),
                            vec![],
                        )
                    }
                };
                if state.channel.index_of(self.address).is_none() {
                    return (
                        Err(ApiError::new(
                            codes::PUSH_MESSAGE_VALIDATION_FAILED,
                            "proposal does not include us",
                        )),
                        vec![],
                    );
                }
                let result = ChannelResult {
                    channel_id,
                    turn_num: 0,
                    status: ChannelStatus::Proposed,
                    participants: state.channel.participants.clone(),
                    allocations: match &state.outcome {
                        Outcome::Allocation(items) => items.clone(),
                        Outcome::Guarantee { .. } => vec![],
                    },
                    app_data: state.app_data.clone(),
                };
                self.proposals.insert(channel_id, proposal);
                // the host decides whether to join
                (
                    Ok(ApiResponse::Ack),
                    vec![Effect::Notify(Notification::ChannelProposed(result))],
                )
            }

            ParticipantMessage::SignedStates(states) => {
                if states.is_empty() {
                    return (
                        Err(ApiError::new(
                            codes::PUSH_MESSAGE_VALIDATION_FAILED,
                            "empty state list",
                        )),
                        vec![],
                    );
                }
                let mut effects = vec![];
                let mut routed = 0usize;
                let mut first_err = None;
                for signed in states {
                    match self.route_signed_state(signed) {
                        Ok(more) => {
                            routed += 1;
                            effects.extend(more);
                        }
                        Err(e) => {
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                        }
                    }
                }
                match (routed, first_err) {
                    (0, Some(e)) => (Err(e), effects),
                    _ => (Ok(ApiResponse::Ack), effects),
                }
            }

            ParticipantMessage::ProposalRejected { channel_id, reason } => {
                let mut effects = vec![];
                if matches!(
                    self.channels.get(&channel_id),
                    Some(ApplicationProtocol::WaitForFirstState { .. })
                ) {
                    warn!("wallet: proposal for {:?} rejected: {}", channel_id, reason);
                    self.pending_funding.remove(&channel_id);
                    self.channels.insert(
                        channel_id,
                        ApplicationProtocol::Failure {
                            channel_id,
                            reason: FailureReason::Rejected,
                        },
                    );
                    effects.push(Effect::Notify(Notification::ProtocolFailed {
                        channel_id,
                        reason,
                    }));
                }
                (Ok(ApiResponse::Ack), effects)
            }

            ParticipantMessage::UpdateRejected { channel_id, .. } => {
                let effects = match self.funding_route_for(channel_id) {
                    Some((target, route)) => self.reduce_funding_rejection(target, route),
                    None => vec![],
                };
                (Ok(ApiResponse::Ack), effects)
            }
        }
    }

    /// Route a signed state to the funding protocol listening on its
    /// channel, falling back to the application protocol.
    fn route_signed_state(&mut self, signed: SignedState) -> Result<Effects, ApiError> {
        let channel_id = match signed.state().channel_id() {
            Ok(id) => id,
            Err(_) => {
                return Err(ApiError::new(
                    codes::PUSH_MESSAGE_VALIDATION_FAILED,
                    "undecodable state",
                ))
            }
        };
        if let Some((target, route)) = self.funding_route_for(channel_id) {
            return Ok(self.reduce_funding_state(target, route, signed));
        }
        if self.channels.contains_key(&channel_id) {
            let mut effects =
                self.reduce_application(channel_id, ApplicationAction::StateReceived(signed));
            if effects.iter().any(|e| {
                matches!(e, Effect::Notify(Notification::ValidationSucceeded { .. }))
            }) {
                if let Ok(result) = self.channel_result(channel_id) {
                    effects.push(Effect::Notify(Notification::ChannelUpdated(result)));
                }
            }
            return Ok(effects);
        }
        Err(ApiError::new(
            codes::PUSH_MESSAGE_CHANNEL_NOT_FOUND,
            "no protocol for this state",
        ))
    }

    /// Which funding process, if any, consumes states for the given
    /// infrastructure channel.
    fn funding_route_for(&self, channel_id: Hash) -> Option<(Hash, FundingRoute)> {
        for (target, process) in &self.funding {
            match process {
                FundingProcess::Ledger(lf) if lf.ledger_id() == Some(channel_id) => {
                    return Some((*target, FundingRoute::Ledger));
                }
                FundingProcess::Virtual(vf) => {
                    if let Some(ctx) = vf.ctx() {
                        if ctx.joint_id == channel_id {
                            return Some((*target, FundingRoute::VirtualJoint));
                        }
                        if ctx.guarantor_id == channel_id {
                            return Some((*target, FundingRoute::VirtualGuarantor));
                        }
                        if ctx.ledger_id == channel_id {
                            return Some((*target, FundingRoute::VirtualLedger));
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn reduce_funding_state(
        &mut self,
        target: Hash,
        route: FundingRoute,
        signed: SignedState,
    ) -> Effects {
        let process = match self.funding.remove(&target) {
            Some(p) => p,
            None => return vec![],
        };
        let was_terminal = process.is_terminal();
        let (process, effects) = match (process, route) {
            (FundingProcess::Ledger(lf), FundingRoute::Ledger) => {
                let (lf, effects) =
                    lf.reduce(LedgerFundingAction::StateReceived(signed), &mut self.shared);
                (FundingProcess::Ledger(lf), effects)
            }
            (FundingProcess::Virtual(vf), route) => {
                let action = match route {
                    FundingRoute::VirtualJoint => VirtualFundingAction::JointStateReceived(signed),
                    FundingRoute::VirtualGuarantor => {
                        VirtualFundingAction::GuarantorStateReceived(signed)
                    }
                    FundingRoute::VirtualLedger | FundingRoute::Ledger => {
                        VirtualFundingAction::Ledger(LedgerFundingAction::StateReceived(signed))
                    }
                };
                let (vf, effects) = vf.reduce(action, &mut self.shared);
                (FundingProcess::Virtual(vf), effects)
            }
            (process, _) => (process, vec![]),
        };
        self.settle_funding(target, process, was_terminal, effects)
    }

    fn reduce_funding_rejection(&mut self, target: Hash, route: FundingRoute) -> Effects {
        let process = match self.funding.remove(&target) {
            Some(p) => p,
            None => return vec![],
        };
        let was_terminal = process.is_terminal();
        let (process, effects) = match (process, route) {
            (FundingProcess::Ledger(lf), FundingRoute::Ledger) => {
                let (lf, effects) = lf.reduce(LedgerFundingAction::UpdateRejected, &mut self.shared);
                (FundingProcess::Ledger(lf), effects)
            }
            (FundingProcess::Virtual(vf), route) => {
                let action = match route {
                    FundingRoute::VirtualLedger | FundingRoute::Ledger => {
                        VirtualFundingAction::Ledger(LedgerFundingAction::UpdateRejected)
                    }
                    _ => VirtualFundingAction::Rejected,
                };
                let (vf, effects) = vf.reduce(action, &mut self.shared);
                (FundingProcess::Virtual(vf), effects)
            }
            (process, _) => (process, vec![]),
        };
        self.settle_funding(target, process, was_terminal, effects)
    }

    /// Put a funding process back and react to it crossing into a
    /// terminal state: record the funding, fail the channel, notify.
    fn settle_funding(
        &mut self,
        target: Hash,
        process: FundingProcess,
        was_terminal: bool,
        mut effects: Effects,
    ) -> Effects {
        if !was_terminal {
            match &process {
                FundingProcess::Direct(DirectFunding::Success { .. }) => {
                    self.shared.store.set_funding(target, Funding::Direct);
                    if let Ok(result) = self.channel_result(target) {
                        effects.push(Effect::Notify(Notification::ChannelUpdated(result)));
                    }
                }
                // the ledger and virtual protocols record their funding
                // in the store themselves
                FundingProcess::Ledger(LedgerFunding::Success { .. })
                | FundingProcess::Virtual(VirtualFunding::Success { .. }) => {
                    if let Ok(result) = self.channel_result(target) {
                        effects.push(Effect::Notify(Notification::ChannelUpdated(result)));
                    }
                }
                FundingProcess::Direct(DirectFunding::Failure { reason, .. })
                | FundingProcess::Ledger(LedgerFunding::Failure { reason, .. })
                | FundingProcess::Virtual(VirtualFunding::Failure { reason, .. }) => {
                    warn!("wallet: funding {:?} failed: {:?}", target, reason);
                    effects.push(Effect::Notify(Notification::ProtocolFailed {
                        channel_id: target,
                        reason: format!("{:?}", reason),
                    }));
                    self.channels.insert(
                        target,
                        ApplicationProtocol::Failure {
                            channel_id: target,
                            reason: reason.clone(),
                        },
                    );
                }
                _ => {}
            }
        }
        self.funding.insert(target, process);
        effects
    }

    /// Reduce the application protocol for a channel and start funding
    /// the moment the pre-fund setup is fully signed.
    fn reduce_application(&mut self, channel_id: Hash, action: ApplicationAction) -> Effects {
        let protocol = match self.channels.remove(&channel_id) {
            Some(p) => p,
            None => return vec![],
        };
        let was_waiting = matches!(protocol, ApplicationProtocol::WaitForFirstState { .. });
        let (protocol, mut effects) = protocol.reduce(action, &mut self.shared);
        let opened = was_waiting && matches!(protocol, ApplicationProtocol::Ongoing { .. });
        self.channels.insert(channel_id, protocol);
        if opened {
            effects.extend(self.start_funding(channel_id));
            if let Ok(result) = self.channel_result(channel_id) {
                effects.push(Effect::Notify(Notification::ChannelUpdated(result)));
            }
        }
        effects
    }

    /// Start the funding protocol agreed at proposal time. Runs once, on
    /// the supported pre-fund setup state.
    fn start_funding(&mut self, channel_id: Hash) -> Effects {
        let strategy = match self.pending_funding.remove(&channel_id) {
            Some(s) => s,
            None => return vec![],
        };
        let state = match self.shared.store.latest_supported_state(channel_id) {
            Ok(s) => s,
            Err(e) => {
                warn!("wallet: cannot start funding for {:?}: {:?}", channel_id, e);
                return vec![];
            }
        };
        match strategy {
            FundingStrategy::Direct => {
                let our_index = match self.shared.store.entry(channel_id) {
                    Ok(entry) => entry.our_index(),
                    Err(_) => return vec![],
                };
                match DepositPlan::from_state(&state, our_index) {
                    Ok(plan) => {
                        let (process, effects) = DirectFunding::new(plan);
                        self.settle_funding(
                            channel_id,
                            FundingProcess::Direct(process),
                            false,
                            effects,
                        )
                    }
                    Err(reason) => self.settle_funding(
                        channel_id,
                        FundingProcess::Direct(DirectFunding::Failure { channel_id, reason }),
                        false,
                        vec![],
                    ),
                }
            }
            FundingStrategy::Ledger => {
                let (process, effects) = match self.find_ledger(&state.channel.participants) {
                    Some(ledger_id) => LedgerFunding::new(&state, ledger_id, &mut self.shared),
                    // no shared ledger yet: open and directly fund a
                    // fresh one as part of the run
                    None => LedgerFunding::open(
                        &state,
                        Self::ledger_setup(&state, channel_id),
                        &mut self.shared,
                    ),
                };
                self.settle_funding(channel_id, FundingProcess::Ledger(process), false, effects)
            }
            // topology comes from the host via start_virtual_funding
            FundingStrategy::Virtual => {
                self.pending_funding.insert(channel_id, strategy);
                vec![]
            }
        }
    }

    /// Pre-fund setup of a fresh ledger channel backing `target`. Every
    /// participant derives the identical state on their own, so the nonce
    /// comes from the target's id instead of fresh randomness.
    fn ledger_setup(target: &State, target_id: Hash) -> State {
        State::new(
            Channel {
                chain_id: target.channel.chain_id,
                participants: target.channel.participants.clone(),
                channel_nonce: U256::from_big_endian(&target_id.0),
            },
            target.outcome.clone(),
            Address::default(),
            vec![],
            target.challenge_duration,
        )
    }

    /// An existing funded ledger channel with exactly these participants.
    fn find_ledger(&self, participants: &[Address]) -> Option<Hash> {
        let signer = self.shared.store.signer();
        self.shared.store.iter().find_map(|(id, entry)| {
            let funded = matches!(self.shared.store.funding(*id), Some(Funding::Direct));
            if funded
                && entry.latest_supported(signer).is_some()
                && entry.channel().participants == participants
            {
                Some(*id)
            } else {
                None
            }
        })
    }

    fn channel_result(&self, channel_id: Hash) -> Result<ChannelResult, StoreError> {
        let entry = self.shared.store.entry(channel_id)?;
        let (allocations, app_data) = match entry.latest() {
            Some(signed) => (
                match &signed.state().outcome {
                    Outcome::Allocation(items) => items.clone(),
                    Outcome::Guarantee { .. } => vec![],
                },
                signed.state().app_data.clone(),
            ),
            None => (vec![], vec![]),
        };
        Ok(ChannelResult {
            channel_id,
            turn_num: entry.current_turn_num().unwrap_or(0),
            status: self.status(channel_id),
            participants: entry.channel().participants.clone(),
            allocations,
            app_data,
        })
    }

    fn status(&self, channel_id: Hash) -> ChannelStatus {
        let protocol = match self.channels.get(&channel_id) {
            Some(p) => p,
            // infrastructure channel without an application protocol
            None => {
                return if self.shared.store.latest_supported_state(channel_id).is_ok() {
                    ChannelStatus::Running
                } else {
                    ChannelStatus::Proposed
                }
            }
        };
        match protocol {
            ApplicationProtocol::WaitForFirstState { .. } => ChannelStatus::Proposed,
            ApplicationProtocol::WaitForDispute { .. } => ChannelStatus::Challenging,
            ApplicationProtocol::Success { .. } | ApplicationProtocol::Failure { .. } => {
                ChannelStatus::Closed
            }
            ApplicationProtocol::Ongoing { .. } => {
                let closing = self
                    .shared
                    .store
                    .entry(channel_id)
                    .ok()
                    .and_then(|e| e.latest())
                    .map(|s| s.state().is_final)
                    .unwrap_or(false);
                if closing {
                    ChannelStatus::Closing
                } else if self.shared.store.funding(channel_id).is_some() {
                    ChannelStatus::Running
                } else {
                    ChannelStatus::Opening
                }
            }
        }
    }

    /// Outgoing peer messages become queued-message notifications; the
    /// host owns the transport and drains the queue.
    fn queue_outgoing(&self, effects: Effects) -> Effects {
        effects
            .into_iter()
            .map(|e| match e {
                Effect::Message { recipient, message } => {
                    Effect::Notify(Notification::MessageQueued {
                        sender: self.address,
                        recipient,
                        message,
                    })
                }
                other => other,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Destination;
    use rand::{rngs::StdRng, SeedableRng};

    fn wallets() -> (Wallet, Wallet, StdRng) {
        let mut rng = StdRng::seed_from_u64(71);
        let a = Wallet::new(Signer::new(&mut rng));
        let b = Wallet::new(Signer::new(&mut rng));
        (a, b, rng)
    }

    fn create_request(a: &Wallet, b: &Wallet, strategy: FundingStrategy) -> ApiRequest {
        ApiRequest::CreateChannel {
            chain_id: U256::from(1),
            participants: vec![a.address(), b.address()],
            allocations: vec![
                AllocationItem {
                    destination: Destination::from_address(a.address()),
                    amount: U256::from(6),
                },
                AllocationItem {
                    destination: Destination::from_address(b.address()),
                    amount: U256::from(4),
                },
            ],
            app_definition: Address::default(),
            app_data: vec![],
            challenge_duration: 60,
            funding_strategy: strategy,
        }
    }

    fn ok_result(result: ApiResult) -> ChannelResult {
        match result {
            Ok(ApiResponse::ChannelResult(r)) => r,
            other => panic!("expected a channel result, got {:?}", other),
        }
    }

    fn queued(effects: &Effects) -> Vec<(Address, ParticipantMessage)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Notify(Notification::MessageQueued {
                    recipient, message, ..
                }) => Some((*recipient, message.clone())),
                _ => None,
            })
            .collect()
    }

    /// Deliver queued messages from `from` into `to`, returning the
    /// receiver's effects.
    fn deliver(
        to: &mut Wallet,
        from: Address,
        msgs: Vec<(Address, ParticipantMessage)>,
        rng: &mut StdRng,
    ) -> Effects {
        let mut effects = vec![];
        for (recipient, message) in msgs {
            let (result, more) = to.handle_request(
                rng,
                ApiRequest::PushMessage {
                    sender: from,
                    recipient,
                    message,
                },
            );
            assert!(result.is_ok(), "push failed: {:?}", result);
            effects.extend(more);
        }
        effects
    }

    fn deposited(destination: Hash, holdings: u64) -> ChainEvent {
        ChainEvent::Deposited {
            destination,
            amount_deposited: U256::zero(),
            destination_holdings: U256::from(holdings),
        }
    }

    fn deposit_amounts(effects: &Effects) -> Vec<U256> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Transaction(TransactionRequest::Deposit { amount, .. }) => Some(*amount),
                _ => None,
            })
            .collect()
    }

    fn status_of(wallet: &mut Wallet, channel_id: Hash, rng: &mut StdRng) -> ChannelStatus {
        let (result, _) = wallet.handle_request(rng, ApiRequest::GetState { channel_id });
        ok_result(result).status
    }

    /// Runs proposal, join, prefund handshake and on-chain deposits for a
    /// directly funded channel, leaving both wallets running.
    fn open_direct() -> (Wallet, Wallet, Hash, StdRng) {
        let (mut a, mut b, mut rng) = wallets();

        let (result, a_fx) =
            a.handle_request(&mut rng, create_request(&a, &b, FundingStrategy::Direct));
        let result = ok_result(result);
        let channel_id = result.channel_id;
        assert_eq!(result.status, ChannelStatus::Proposed);

        // the proposal reaches bob and he joins
        let b_fx = deliver(&mut b, a.address(), queued(&a_fx), &mut rng);
        assert!(b_fx.iter().any(|e| matches!(
            e,
            Effect::Notify(Notification::ChannelProposed(_))
        )));
        let (result, b_fx) = b.handle_request(&mut rng, ApiRequest::JoinChannel { channel_id });
        let result = ok_result(result);
        // bob's side is fully signed but unfunded
        assert_eq!(result.status, ChannelStatus::Opening);
        // bob is second in the allocation order, no deposit yet
        assert!(deposit_amounts(&b_fx).is_empty());

        // bob's countersignature reaches alice; her deposit goes out
        let a_fx = deliver(&mut a, b.address(), queued(&b_fx), &mut rng);
        assert_eq!(deposit_amounts(&a_fx), vec![U256::from(6)]);

        // alice's deposit lands, unlocking bob's
        let b_fx = b.handle_chain_event(deposited(channel_id, 6));
        assert_eq!(deposit_amounts(&b_fx), vec![U256::from(4)]);
        let _ = a.handle_chain_event(deposited(channel_id, 6));

        // full funding observed by both
        let _ = a.handle_chain_event(deposited(channel_id, 10));
        let _ = b.handle_chain_event(deposited(channel_id, 10));
        assert_eq!(status_of(&mut a, channel_id, &mut rng), ChannelStatus::Running);
        assert_eq!(status_of(&mut b, channel_id, &mut rng), ChannelStatus::Running);

        (a, b, channel_id, rng)
    }

    #[test]
    fn direct_channel_reaches_running() {
        let (mut a, _, channel_id, mut rng) = open_direct();
        let (result, _) = a.handle_request(&mut rng, ApiRequest::GetState { channel_id });
        let result = ok_result(result);
        assert_eq!(result.turn_num, 0);
        assert_eq!(result.allocations.len(), 2);
        assert_eq!(
            a.store().funding(channel_id),
            Some(&Funding::Direct)
        );
    }

    #[test]
    fn update_and_close_cooperatively() {
        let (mut a, mut b, channel_id, mut rng) = open_direct();

        // turn 1 is bob's; he shifts 2 to alice
        let (result, b_fx) = b.handle_request(
            &mut rng,
            ApiRequest::UpdateChannel {
                channel_id,
                participants: vec![],
                allocations: vec![
                    AllocationItem {
                        destination: Destination::from_address(a.address()),
                        amount: U256::from(8),
                    },
                    AllocationItem {
                        destination: Destination::from_address(b.address()),
                        amount: U256::from(2),
                    },
                ],
                app_data: vec![],
            },
        );
        let result = ok_result(result);
        assert_eq!(result.turn_num, 1);
        let a_fx = deliver(&mut a, b.address(), queued(&b_fx), &mut rng);
        assert!(a_fx.iter().any(|e| matches!(
            e,
            Effect::Notify(Notification::ValidationSucceeded { turn_num: 1, .. })
        )));

        // turn 2 is alice's; she closes with a final state
        let (result, a_fx) =
            a.handle_request(&mut rng, ApiRequest::CloseChannel { channel_id });
        let result = ok_result(result);
        assert_eq!(result.status, ChannelStatus::Closing);

        // bob countersigns the final state, which concludes on-chain
        let b_fx = deliver(&mut b, a.address(), queued(&a_fx), &mut rng);
        let (result, b_fx2) =
            b.handle_request(&mut rng, ApiRequest::CloseChannel { channel_id });
        ok_result(result);
        assert!(b_fx2.iter().any(|e| matches!(
            e,
            Effect::Transaction(TransactionRequest::Conclude { .. })
        )));
        // alice's side concludes too once the countersignature arrives
        let a_fx = deliver(&mut a, b.address(), [queued(&b_fx), queued(&b_fx2)].concat(), &mut rng);
        assert!(a_fx.iter().any(|e| matches!(
            e,
            Effect::Transaction(TransactionRequest::Conclude { .. })
        )));

        let _ = a.handle_chain_event(ChainEvent::Concluded { channel_id });
        let _ = b.handle_chain_event(ChainEvent::Concluded { channel_id });
        assert_eq!(status_of(&mut a, channel_id, &mut rng), ChannelStatus::Closed);
        assert_eq!(status_of(&mut b, channel_id, &mut rng), ChannelStatus::Closed);
    }

    #[test]
    fn update_out_of_turn_is_rejected() {
        let (mut a, b, channel_id, mut rng) = open_direct();

        // turn 1 is bob's; alice's update must be refused
        let (result, _) = a.handle_request(
            &mut rng,
            ApiRequest::UpdateChannel {
                channel_id,
                participants: vec![],
                allocations: vec![AllocationItem {
                    destination: Destination::from_address(b.address()),
                    amount: U256::from(10),
                }],
                app_data: vec![],
            },
        );
        assert_eq!(result.unwrap_err().code, codes::UPDATE_CHANNEL_NOT_YOUR_TURN);
    }

    #[test]
    fn update_changing_the_total_is_an_invalid_transition() {
        let (a, mut b, channel_id, mut rng) = open_direct();

        let (result, _) = b.handle_request(
            &mut rng,
            ApiRequest::UpdateChannel {
                channel_id,
                participants: vec![],
                allocations: vec![AllocationItem {
                    destination: Destination::from_address(a.address()),
                    amount: U256::from(11),
                }],
                app_data: vec![],
            },
        );
        assert_eq!(
            result.unwrap_err().code,
            codes::UPDATE_CHANNEL_INVALID_TRANSITION
        );
    }

    #[test]
    fn changing_participants_is_an_invalid_transition() {
        let (mut a, _, channel_id, mut rng) = open_direct();

        let (result, _) = a.handle_request(
            &mut rng,
            ApiRequest::UpdateChannel {
                channel_id,
                participants: vec![a.address(), Address([0xcc; 20])],
                allocations: vec![],
                app_data: vec![],
            },
        );
        assert_eq!(
            result.unwrap_err().code,
            codes::UPDATE_CHANNEL_INVALID_TRANSITION
        );
    }

    #[test]
    fn close_out_of_turn_is_rejected() {
        let (mut a, _, channel_id, mut rng) = open_direct();

        // turn 1 is bob's, so alice cannot produce the final state yet
        let (result, _) =
            a.handle_request(&mut rng, ApiRequest::CloseChannel { channel_id });
        assert_eq!(result.unwrap_err().code, codes::CLOSE_CHANNEL_NOT_YOUR_TURN);
    }

    #[test]
    fn requests_for_unknown_channels_are_rejected() {
        let (mut a, _, mut rng) = wallets();
        let channel_id = Hash([0xee; 32]);

        let (result, _) = a.handle_request(&mut rng, ApiRequest::GetState { channel_id });
        assert_eq!(result.unwrap_err().code, codes::GET_STATE_CHANNEL_NOT_FOUND);

        let (result, _) = a.handle_request(&mut rng, ApiRequest::JoinChannel { channel_id });
        assert_eq!(result.unwrap_err().code, codes::JOIN_CHANNEL_CHANNEL_NOT_FOUND);

        let (result, _) = a.handle_request(
            &mut rng,
            ApiRequest::UpdateChannel {
                channel_id,
                participants: vec![],
                allocations: vec![],
                app_data: vec![],
            },
        );
        assert_eq!(
            result.unwrap_err().code,
            codes::UPDATE_CHANNEL_CHANNEL_NOT_FOUND
        );

        let (result, _) = a.handle_request(&mut rng, ApiRequest::CloseChannel { channel_id });
        assert_eq!(
            result.unwrap_err().code,
            codes::CLOSE_CHANNEL_CHANNEL_NOT_FOUND
        );

        let (result, _) =
            a.handle_request(&mut rng, ApiRequest::ChallengeChannel { channel_id });
        assert_eq!(
            result.unwrap_err().code,
            codes::CHALLENGE_CHANNEL_CHANNEL_NOT_FOUND
        );
    }

    #[test]
    fn challenge_and_clearance_round_trip() {
        let (mut a, _, channel_id, mut rng) = open_direct();

        let (result, a_fx) =
            a.handle_request(&mut rng, ApiRequest::ChallengeChannel { channel_id });
        assert_eq!(ok_result(result).status, ChannelStatus::Challenging);
        assert!(a_fx.iter().any(|e| matches!(
            e,
            Effect::Transaction(TransactionRequest::ForceMove { .. })
        )));

        let _ = a.handle_chain_event(ChainEvent::ChallengeRegistered {
            channel_id,
            challenger: a.address(),
            finalizes_at: 1000,
            challenge_states: vec![],
        });
        assert_eq!(
            status_of(&mut a, channel_id, &mut rng),
            ChannelStatus::Challenging
        );

        // the peer responded on-chain; the channel stays open
        let _ = a.handle_chain_event(ChainEvent::ChallengeCleared {
            channel_id,
            new_turn_num_record: 1,
        });
        assert_eq!(status_of(&mut a, channel_id, &mut rng), ChannelStatus::Running);
    }

    #[test]
    fn expired_challenge_pays_out_and_closes() {
        let (mut a, _, channel_id, mut rng) = open_direct();

        let (_, _) = a.handle_request(&mut rng, ApiRequest::ChallengeChannel { channel_id });
        let _ = a.handle_chain_event(ChainEvent::ChallengeRegistered {
            channel_id,
            challenger: a.address(),
            finalizes_at: 1000,
            challenge_states: vec![],
        });

        let fx = a.handle_time(999);
        assert!(fx.is_empty());
        assert_eq!(
            status_of(&mut a, channel_id, &mut rng),
            ChannelStatus::Challenging
        );

        let fx = a.handle_time(1000);
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::Transaction(TransactionRequest::TransferAll { .. })
        )));
        assert_eq!(status_of(&mut a, channel_id, &mut rng), ChannelStatus::Closed);
    }

    #[test]
    fn proposal_rejection_fails_the_proposers_channel() {
        let (mut a, b, mut rng) = wallets();

        let (result, _) =
            a.handle_request(&mut rng, create_request(&a, &b, FundingStrategy::Direct));
        let channel_id = ok_result(result).channel_id;

        let (result, fx) = a.handle_request(
            &mut rng,
            ApiRequest::PushMessage {
                sender: b.address(),
                recipient: a.address(),
                message: ParticipantMessage::ProposalRejected {
                    channel_id,
                    reason: alloc::string::String::from("not interested"),
                },
            },
        );
        assert!(result.is_ok());
        assert!(fx.iter().any(|e| matches!(
            e,
            Effect::Notify(Notification::ProtocolFailed { .. })
        )));
        assert_eq!(status_of(&mut a, channel_id, &mut rng), ChannelStatus::Closed);
    }

    #[test]
    fn ledger_funded_channel_completes_off_chain() {
        // the direct channel doubles as the ledger
        let (mut a, mut b, ledger_id, mut rng) = open_direct();

        let (result, a_fx) =
            a.handle_request(&mut rng, create_request(&a, &b, FundingStrategy::Ledger));
        let target = ok_result(result).channel_id;
        assert_ne!(target, ledger_id);

        // bob joins; his side becomes supported at once, so he proposes
        // the ledger funding update (turn 1's mover is bob)
        let _ = deliver(&mut b, a.address(), queued(&a_fx), &mut rng);
        let (result, b_fx) = b.handle_request(&mut rng, ApiRequest::JoinChannel { channel_id: target });
        ok_result(result);

        // alice processes the countersignature and the ledger update; her
        // countersignature completes the funding on her side
        let a_fx = deliver(&mut a, b.address(), queued(&b_fx), &mut rng);
        assert_eq!(
            a.store().funding(target),
            Some(&Funding::Ledger { ledger_id })
        );
        assert_eq!(status_of(&mut a, target, &mut rng), ChannelStatus::Running);

        // and bob's once it travels back
        let _ = deliver(&mut b, a.address(), queued(&a_fx), &mut rng);
        assert_eq!(
            b.store().funding(target),
            Some(&Funding::Ledger { ledger_id })
        );
        assert_eq!(status_of(&mut b, target, &mut rng), ChannelStatus::Running);

        // no chain interaction for the whole run
        assert!(deposit_amounts(&a_fx).is_empty());
        assert!(deposit_amounts(&b_fx).is_empty());
    }

    #[test]
    fn ledger_funding_opens_a_fresh_ledger_when_none_exists() {
        let (mut a, mut b, mut rng) = wallets();

        let (result, a_fx) =
            a.handle_request(&mut rng, create_request(&a, &b, FundingStrategy::Ledger));
        let target = ok_result(result).channel_id;

        // bob joins; both sides derive the same fresh ledger channel
        let _ = deliver(&mut b, a.address(), queued(&a_fx), &mut rng);
        let (result, b_fx) =
            b.handle_request(&mut rng, ApiRequest::JoinChannel { channel_id: target });
        ok_result(result);

        // the countersignature reaches alice, who proposes the ledger
        // channel's setup state
        let a_fx = deliver(&mut a, b.address(), queued(&b_fx), &mut rng);
        let ledger_id = Channel {
            chain_id: U256::from(1),
            participants: vec![a.address(), b.address()],
            channel_nonce: U256::from_big_endian(&target.0),
        }
        .id()
        .unwrap();

        // bob countersigns the setup; second in the deposit order, he waits
        let b_fx = deliver(&mut b, a.address(), queued(&a_fx), &mut rng);
        assert!(deposit_amounts(&b_fx).is_empty());

        // alice's side becomes supported and her deposit goes out
        let a_fx = deliver(&mut a, b.address(), queued(&b_fx), &mut rng);
        assert_eq!(deposit_amounts(&a_fx), vec![U256::from(6)]);

        // her deposit lands, unlocking bob's
        let b_fx = b.handle_chain_event(deposited(ledger_id, 6));
        assert_eq!(deposit_amounts(&b_fx), vec![U256::from(4)]);
        let _ = a.handle_chain_event(deposited(ledger_id, 6));

        // full funding makes bob the mover of the funding update
        let b_fx = b.handle_chain_event(deposited(ledger_id, 10));
        assert_eq!(b.store().funding(ledger_id), Some(&Funding::Direct));

        // his update overtakes alice's chain watcher and is buffered
        let _ = deliver(&mut a, b.address(), queued(&b_fx), &mut rng);
        assert!(a.store().funding(target).is_none());

        // her watcher catches up; the buffered update is countersigned
        let a_fx = a.handle_chain_event(deposited(ledger_id, 10));
        assert_eq!(
            a.store().funding(target),
            Some(&Funding::Ledger { ledger_id })
        );
        assert_eq!(status_of(&mut a, target, &mut rng), ChannelStatus::Running);

        let _ = deliver(&mut b, a.address(), queued(&a_fx), &mut rng);
        assert_eq!(
            b.store().funding(target),
            Some(&Funding::Ledger { ledger_id })
        );
        assert_eq!(status_of(&mut b, target, &mut rng), ChannelStatus::Running);
    }

    #[test]
    fn virtual_funding_waits_for_host_topology() {
        let (mut a, mut b, mut rng) = wallets();

        let (result, a_fx) =
            a.handle_request(&mut rng, create_request(&a, &b, FundingStrategy::Virtual));
        let target = ok_result(result).channel_id;

        let _ = deliver(&mut b, a.address(), queued(&a_fx), &mut rng);
        let (result, b_fx) =
            b.handle_request(&mut rng, ApiRequest::JoinChannel { channel_id: target });
        ok_result(result);
        let _ = deliver(&mut a, b.address(), queued(&b_fx), &mut rng);

        // fully signed but not funded: no deposits, still opening
        assert_eq!(status_of(&mut a, target, &mut rng), ChannelStatus::Opening);

        // the host supplies the topology; alice proposes the joint setup
        let hub = Address([9; 20]);
        let target_state = a.store().latest_supported_state(target).unwrap();
        let joint0 = State::new(
            Channel {
                chain_id: U256::from(1),
                participants: vec![a.address(), b.address(), hub],
                channel_nonce: U256::from(8),
            },
            Outcome::Allocation(vec![
                AllocationItem {
                    destination: Destination::from_address(a.address()),
                    amount: U256::from(6),
                },
                AllocationItem {
                    destination: Destination::from_address(b.address()),
                    amount: U256::from(4),
                },
            ]),
            Address::default(),
            vec![],
            60,
        );
        let joint_id = joint0.channel_id().unwrap();
        let guarantor0 = State::new(
            Channel {
                chain_id: U256::from(1),
                participants: vec![a.address(), hub],
                channel_nonce: U256::from(9),
            },
            Outcome::Guarantee {
                target_channel_id: joint_id,
                destinations: vec![
                    Destination::from_address(a.address()),
                    Destination::from_address(hub),
                ],
            },
            Address::default(),
            vec![],
            60,
        );
        let ctx = VirtualCtx::new(
            &target_state,
            joint0,
            guarantor0,
            Hash([3; 32]),
            hub,
            a.address(),
        )
        .unwrap();

        let fx = a.start_virtual_funding(ctx);
        // the joint pre-fund setup goes out to bob and the hub
        let joint_msgs: Vec<_> = queued(&fx)
            .into_iter()
            .filter(|(_, m)| matches!(m, ParticipantMessage::SignedStates(_)))
            .collect();
        assert_eq!(joint_msgs.len(), 2);
        assert!(joint_msgs.iter().any(|(r, _)| *r == hub));
        assert_eq!(status_of(&mut a, target, &mut rng), ChannelStatus::Opening);
    }

    #[test]
    fn misaddressed_and_unroutable_messages_are_rejected() {
        let (mut a, b, channel_id, mut rng) = open_direct();

        let (result, _) = a.handle_request(
            &mut rng,
            ApiRequest::PushMessage {
                sender: b.address(),
                recipient: Address([0x77; 20]),
                message: ParticipantMessage::ProposalRejected {
                    channel_id,
                    reason: alloc::string::String::new(),
                },
            },
        );
        assert_eq!(
            result.unwrap_err().code,
            codes::PUSH_MESSAGE_WRONG_RECIPIENT
        );

        // a state for a channel nobody knows
        let state = State::new(
            Channel {
                chain_id: U256::from(1),
                participants: vec![b.address(), a.address()],
                channel_nonce: U256::from(404),
            },
            Outcome::Allocation(vec![AllocationItem {
                destination: Destination::from_address(b.address()),
                amount: U256::from(1),
            }]),
            Address::default(),
            vec![],
            60,
        );
        let (result, _) = a.handle_request(
            &mut rng,
            ApiRequest::PushMessage {
                sender: b.address(),
                recipient: a.address(),
                message: ParticipantMessage::SignedStates(vec![SignedState::new(state)]),
            },
        );
        assert_eq!(
            result.unwrap_err().code,
            codes::PUSH_MESSAGE_CHANNEL_NOT_FOUND
        );
    }

    #[test]
    fn challenge_without_supported_state_is_rejected() {
        let (mut a, mut b, mut rng) = wallets();

        let (result, _) =
            a.handle_request(&mut rng, create_request(&a, &b, FundingStrategy::Direct));
        let channel_id = ok_result(result).channel_id;

        // only alice has signed so far
        let (result, _) =
            a.handle_request(&mut rng, ApiRequest::ChallengeChannel { channel_id });
        assert_eq!(
            result.unwrap_err().code,
            codes::CHALLENGE_CHANNEL_NO_SUPPORTED_STATE
        );
        // bob has never heard of the channel at all
        let (result, _) =
            b.handle_request(&mut rng, ApiRequest::ChallengeChannel { channel_id });
        assert_eq!(
            result.unwrap_err().code,
            codes::CHALLENGE_CHANNEL_CHANNEL_NOT_FOUND
        );
    }
}
