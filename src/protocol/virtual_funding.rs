use alloc::vec;
use alloc::vec::Vec;
use log::{debug, warn};

use super::ledger_funding::funding_update;
use super::{
    consensus_round, messages_to_peers, Effects, FailureReason, LedgerFunding,
    LedgerFundingAction, SharedData,
};
use crate::channel::{AllocationItem, Destination, Funding, Outcome, SignedState, State};
use crate::messages::ParticipantMessage;
use crate::{Address, Hash, U256};

/// Actions driving a [VirtualFunding] protocol, routed by the host from
/// peer messages concerning the joint, guarantor or ledger channel.
#[derive(Debug, Clone)]
pub enum VirtualFundingAction {
    /// A signed state for the joint channel.
    JointStateReceived(SignedState),
    /// A signed state for our guarantor channel.
    GuarantorStateReceived(SignedState),
    /// Funding update on the ledger channel backing our guarantor.
    Ledger(LedgerFundingAction),
    Rejected,
}

/// Everything a virtual funding run needs to know up front.
///
/// The target channel connects the two leaves; the joint channel adds the
/// hub; our guarantor channel redirects our ledger funds to the joint
/// channel. The peer leaf runs the mirror image with its own guarantor
/// and ledger.
#[derive(Debug, Clone)]
pub struct VirtualCtx {
    pub target_id: Hash,
    pub joint_id: Hash,
    pub guarantor_id: Hash,
    pub ledger_id: Hash,
    pub joint0: State,
    pub guarantor0: State,
    /// Ledger balances locked for the guarantor: our own joint
    /// contribution plus the hub covering the peer leaf's side.
    contributions: Vec<AllocationItem>,
    /// Actions that arrived before the phase that consumes them.
    queued: Vec<VirtualFundingAction>,
}

impl VirtualCtx {
    pub fn new(
        target: &State,
        joint0: State,
        guarantor0: State,
        ledger_id: Hash,
        hub: Address,
        our_addr: Address,
    ) -> Result<Self, FailureReason> {
        let target_id = target.channel_id().map_err(|_| FailureReason::Store)?;
        let joint_id = joint0.channel_id().map_err(|_| FailureReason::Store)?;
        let guarantor_id = guarantor0.channel_id().map_err(|_| FailureReason::Store)?;

        let our_dest = Destination::from_address(our_addr);
        let mut ours = U256::zero();
        let mut hubs = U256::zero();
        match &joint0.outcome {
            Outcome::Allocation(items) => {
                for item in items {
                    if item.destination == our_dest {
                        ours = ours + item.amount;
                    } else {
                        hubs = hubs + item.amount;
                    }
                }
            }
            Outcome::Guarantee { .. } => return Err(FailureReason::Store),
        }
        let mut contributions = Vec::new();
        if !ours.is_zero() {
            contributions.push(AllocationItem {
                destination: our_dest,
                amount: ours,
            });
        }
        if !hubs.is_zero() {
            contributions.push(AllocationItem {
                destination: Destination::from_address(hub),
                amount: hubs,
            });
        }

        Ok(VirtualCtx {
            target_id,
            joint_id,
            guarantor_id,
            ledger_id,
            joint0,
            guarantor0,
            contributions,
            queued: Vec::new(),
        })
    }
}

/// Funds a channel through an intermediary hub neither leaf shares a
/// ledger channel with the other.
///
/// Four consensus rounds in sequence: the joint channel's pre-fund setup,
/// our guarantor's pre-fund setup, the ledger update funding the
/// guarantor and finally the joint update allocating everything to the
/// target. Peer messages may overtake each other on the wire; an action
/// arriving before its phase is buffered and replayed the moment the
/// protocol reaches the phase that consumes it.
#[derive(Debug)]
pub enum VirtualFunding {
    WaitForJointChannel { ctx: VirtualCtx },
    WaitForGuarantorChannel { ctx: VirtualCtx },
    WaitForGuarantorFunding { ctx: VirtualCtx, inner: LedgerFunding },
    WaitForApplicationFunding { ctx: VirtualCtx, expected: State },
    Success { channel_id: Hash },
    Failure { channel_id: Hash, reason: FailureReason },
}

impl VirtualFunding {
    /// Register the joint and guarantor channels and, if we are the joint
    /// channel's proposer, put its pre-fund setup on the wire.
    pub fn new(ctx: VirtualCtx, shared: &mut SharedData) -> (Self, Effects) {
        let our_addr = shared.store.signer().address();
        let joint_index = match ctx.joint0.channel.index_of(our_addr) {
            Some(i) => i,
            None => return Self::fail(ctx.target_id, FailureReason::Store),
        };
        let guarantor_index = match ctx.guarantor0.channel.index_of(our_addr) {
            Some(i) => i,
            None => return Self::fail(ctx.target_id, FailureReason::Store),
        };
        if shared
            .store
            .initialize(ctx.joint0.channel.clone(), joint_index)
            .and_then(|_| {
                shared
                    .store
                    .initialize(ctx.guarantor0.channel.clone(), guarantor_index)
            })
            .is_err()
        {
            return Self::fail(ctx.target_id, FailureReason::Store);
        }

        let mut effects = vec![];
        if ctx.joint0.mover() == joint_index {
            match shared.store.sign_and_store(ctx.joint0.clone()) {
                Ok(signed) => {
                    effects = messages_to_peers(
                        &ctx.joint0.channel,
                        joint_index,
                        ParticipantMessage::SignedStates(vec![signed]),
                    );
                }
                Err(e) => {
                    warn!("virtual funding: signing joint setup failed: {:?}", e);
                    return Self::fail(ctx.target_id, FailureReason::Store);
                }
            }
        }
        (VirtualFunding::WaitForJointChannel { ctx }, effects)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VirtualFunding::Success { .. } | VirtualFunding::Failure { .. })
    }

    /// Feed an action, then replay any buffered actions the resulting
    /// phase is able to consume.
    pub fn reduce(self, action: VirtualFundingAction, shared: &mut SharedData) -> (Self, Effects) {
        let (mut state, mut effects) = self.step(action, shared);
        loop {
            let idx = match state.ctx() {
                Some(ctx) => state.ready_index_in(&ctx.queued),
                None => None,
            };
            let ready = match idx {
                Some(i) => match state.ctx_mut() {
                    Some(ctx) => ctx.queued.remove(i),
                    None => break,
                },
                None => break,
            };
            let (next, more) = state.step(ready, shared);
            state = next;
            effects.extend(more);
        }
        (state, effects)
    }

    fn step(self, action: VirtualFundingAction, shared: &mut SharedData) -> (Self, Effects) {
        match self {
            VirtualFunding::WaitForJointChannel { mut ctx } => match action {
                VirtualFundingAction::Rejected => {
                    Self::fail(ctx.target_id, FailureReason::Rejected)
                }
                VirtualFundingAction::JointStateReceived(signed)
                    if signed.state().turn_num() == 0 =>
                {
                    match consensus_round(&ctx.joint0, signed, shared) {
                        Ok((true, effects)) => {
                            let (next, more) = Self::start_guarantor(ctx, shared);
                            (next, [effects, more].concat())
                        }
                        Ok((false, effects)) => {
                            (VirtualFunding::WaitForJointChannel { ctx }, effects)
                        }
                        Err(reason) => Self::fail(ctx.target_id, reason),
                    }
                }
                early => {
                    ctx.queued.push(early);
                    (VirtualFunding::WaitForJointChannel { ctx }, vec![])
                }
            },

            VirtualFunding::WaitForGuarantorChannel { mut ctx } => match action {
                VirtualFundingAction::Rejected => {
                    Self::fail(ctx.target_id, FailureReason::Rejected)
                }
                VirtualFundingAction::GuarantorStateReceived(signed)
                    if signed.state().turn_num() == 0 =>
                {
                    match consensus_round(&ctx.guarantor0, signed, shared) {
                        Ok((true, effects)) => {
                            let (next, more) = Self::start_ledger(ctx, shared);
                            (next, [effects, more].concat())
                        }
                        Ok((false, effects)) => {
                            (VirtualFunding::WaitForGuarantorChannel { ctx }, effects)
                        }
                        Err(reason) => Self::fail(ctx.target_id, reason),
                    }
                }
                // replays of the finished joint round are dropped
                VirtualFundingAction::JointStateReceived(signed)
                    if signed.state().turn_num() == 0 =>
                {
                    (VirtualFunding::WaitForGuarantorChannel { ctx }, vec![])
                }
                early => {
                    ctx.queued.push(early);
                    (VirtualFunding::WaitForGuarantorChannel { ctx }, vec![])
                }
            },

            VirtualFunding::WaitForGuarantorFunding { mut ctx, inner } => match action {
                VirtualFundingAction::Rejected => {
                    Self::fail(ctx.target_id, FailureReason::Rejected)
                }
                VirtualFundingAction::Ledger(a) => {
                    let (inner, effects) = inner.reduce(a, shared);
                    match inner {
                        LedgerFunding::Success { .. } => {
                            let (next, more) = Self::start_application_funding(ctx, shared);
                            (next, [effects, more].concat())
                        }
                        LedgerFunding::Failure { reason, .. } => {
                            let (next, more) = Self::fail(ctx.target_id, reason);
                            (next, [effects, more].concat())
                        }
                        pending => (
                            VirtualFunding::WaitForGuarantorFunding { ctx, inner: pending },
                            effects,
                        ),
                    }
                }
                // replays of finished rounds are dropped
                VirtualFundingAction::GuarantorStateReceived(_) => (
                    VirtualFunding::WaitForGuarantorFunding { ctx, inner },
                    vec![],
                ),
                VirtualFundingAction::JointStateReceived(signed)
                    if signed.state().turn_num() == 0 =>
                {
                    (
                        VirtualFunding::WaitForGuarantorFunding { ctx, inner },
                        vec![],
                    )
                }
                early => {
                    ctx.queued.push(early);
                    (
                        VirtualFunding::WaitForGuarantorFunding { ctx, inner },
                        vec![],
                    )
                }
            },

            VirtualFunding::WaitForApplicationFunding { ctx, expected } => match action {
                VirtualFundingAction::Rejected => {
                    Self::fail(ctx.target_id, FailureReason::Rejected)
                }
                VirtualFundingAction::JointStateReceived(signed)
                    if signed.state().turn_num() == expected.turn_num() =>
                {
                    match consensus_round(&expected, signed, shared) {
                        Ok((true, effects)) => {
                            debug!(
                                "virtual funding complete: {:?} via joint {:?}",
                                ctx.target_id, ctx.joint_id
                            );
                            shared.store.set_funding(
                                ctx.target_id,
                                Funding::Virtual {
                                    joint_id: ctx.joint_id,
                                    guarantor_id: ctx.guarantor_id,
                                },
                            );
                            (
                                VirtualFunding::Success {
                                    channel_id: ctx.target_id,
                                },
                                effects,
                            )
                        }
                        Ok((false, effects)) => (
                            VirtualFunding::WaitForApplicationFunding { ctx, expected },
                            effects,
                        ),
                        Err(reason) => Self::fail(ctx.target_id, reason),
                    }
                }
                _ => (
                    VirtualFunding::WaitForApplicationFunding { ctx, expected },
                    vec![],
                ),
            },

            terminal => (terminal, vec![]),
        }
    }

    fn start_guarantor(ctx: VirtualCtx, shared: &mut SharedData) -> (Self, Effects) {
        let our_index = match shared.store.entry(ctx.guarantor_id) {
            Ok(entry) => entry.our_index(),
            Err(_) => return Self::fail(ctx.target_id, FailureReason::Store),
        };
        let mut effects = vec![];
        if ctx.guarantor0.mover() == our_index {
            match shared.store.sign_and_store(ctx.guarantor0.clone()) {
                Ok(signed) => {
                    effects = messages_to_peers(
                        &ctx.guarantor0.channel,
                        our_index,
                        ParticipantMessage::SignedStates(vec![signed]),
                    );
                }
                Err(e) => {
                    warn!("virtual funding: signing guarantor setup failed: {:?}", e);
                    return Self::fail(ctx.target_id, FailureReason::Store);
                }
            }
        }
        (VirtualFunding::WaitForGuarantorChannel { ctx }, effects)
    }

    fn start_ledger(ctx: VirtualCtx, shared: &mut SharedData) -> (Self, Effects) {
        let (inner, effects) = LedgerFunding::with_contributions(
            ctx.guarantor_id,
            &ctx.contributions,
            ctx.ledger_id,
            shared,
        );
        match inner {
            LedgerFunding::Failure { reason, .. } => {
                let (next, more) = Self::fail(ctx.target_id, reason);
                (next, [effects, more].concat())
            }
            inner => (VirtualFunding::WaitForGuarantorFunding { ctx, inner }, effects),
        }
    }

    fn start_application_funding(ctx: VirtualCtx, shared: &mut SharedData) -> (Self, Effects) {
        let joint_state = match shared.store.latest_supported_state(ctx.joint_id) {
            Ok(state) => state,
            Err(_) => return Self::fail(ctx.target_id, FailureReason::Store),
        };
        let joint_items = match &joint_state.outcome {
            Outcome::Allocation(items) => items.clone(),
            Outcome::Guarantee { .. } => return Self::fail(ctx.target_id, FailureReason::Store),
        };
        let expected = match funding_update(&joint_state, ctx.target_id, &joint_items) {
            Ok(state) => state,
            Err(reason) => return Self::fail(ctx.target_id, reason),
        };

        let our_index = match shared.store.entry(ctx.joint_id) {
            Ok(entry) => entry.our_index(),
            Err(_) => return Self::fail(ctx.target_id, FailureReason::Store),
        };
        let mut effects = vec![];
        if expected.mover() == our_index {
            match shared.store.sign_and_store(expected.clone()) {
                Ok(signed) => {
                    effects = messages_to_peers(
                        &ctx.joint0.channel,
                        our_index,
                        ParticipantMessage::SignedStates(vec![signed]),
                    );
                }
                Err(e) => {
                    warn!("virtual funding: signing joint update failed: {:?}", e);
                    return Self::fail(ctx.target_id, FailureReason::Store);
                }
            }
        }
        (
            VirtualFunding::WaitForApplicationFunding { ctx, expected },
            effects,
        )
    }

    pub(crate) fn ctx(&self) -> Option<&VirtualCtx> {
        match self {
            VirtualFunding::WaitForJointChannel { ctx }
            | VirtualFunding::WaitForGuarantorChannel { ctx }
            | VirtualFunding::WaitForGuarantorFunding { ctx, .. }
            | VirtualFunding::WaitForApplicationFunding { ctx, .. } => Some(ctx),
            _ => None,
        }
    }

    fn ctx_mut(&mut self) -> Option<&mut VirtualCtx> {
        match self {
            VirtualFunding::WaitForJointChannel { ctx }
            | VirtualFunding::WaitForGuarantorChannel { ctx }
            | VirtualFunding::WaitForGuarantorFunding { ctx, .. }
            | VirtualFunding::WaitForApplicationFunding { ctx, .. } => Some(ctx),
            _ => None,
        }
    }

    /// Index of the first queued action the current phase consumes.
    fn ready_index_in(&self, queued: &[VirtualFundingAction]) -> Option<usize> {
        queued.iter().position(|action| match (self, action) {
            (
                VirtualFunding::WaitForGuarantorChannel { .. },
                VirtualFundingAction::GuarantorStateReceived(_),
            ) => true,
            (
                VirtualFunding::WaitForGuarantorFunding { .. },
                VirtualFundingAction::Ledger(_),
            ) => true,
            (
                VirtualFunding::WaitForApplicationFunding { expected, .. },
                VirtualFundingAction::JointStateReceived(signed),
            ) => signed.state().turn_num() == expected.turn_num(),
            _ => false,
        })
    }

    fn fail(channel_id: Hash, reason: FailureReason) -> (Self, Effects) {
        (VirtualFunding::Failure { channel_id, reason }, vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelStore};
    use crate::protocol::Effect;
    use crate::sig::Signer;
    use rand::{rngs::StdRng, SeedableRng};

    /// Alice (leaf, our side), Bob (peer leaf), Hank (hub).
    struct Fixture {
        alice: Signer,
        bob: Signer,
        hank: Signer,
        target0: State,
        joint0: State,
        guarantor0: State,
        ledger0: State,
    }

    fn alloc_to(pairs: &[(Address, u64)]) -> Outcome {
        Outcome::Allocation(
            pairs
                .iter()
                .map(|(addr, amount)| AllocationItem {
                    destination: Destination::from_address(*addr),
                    amount: U256::from(*amount),
                })
                .collect(),
        )
    }

    fn fixture() -> Fixture {
        let mut rng = StdRng::seed_from_u64(31);
        let alice = Signer::new(&mut rng);
        let bob = Signer::new(&mut rng);
        let hank = Signer::new(&mut rng);
        let (a, b, h) = (alice.address(), bob.address(), hank.address());

        let chan = |participants: Vec<Address>, nonce: u64, outcome: Outcome| {
            State::new(
                Channel {
                    chain_id: U256::from(1),
                    participants,
                    channel_nonce: U256::from(nonce),
                },
                outcome,
                Address::default(),
                vec![],
                60,
            )
        };
        let target0 = chan(vec![a, b], 1, alloc_to(&[(a, 6), (b, 4)]));
        let joint0 = chan(vec![a, b, h], 2, alloc_to(&[(a, 6), (b, 4)]));
        let guarantor0 = chan(
            vec![a, h],
            3,
            Outcome::Guarantee {
                target_channel_id: joint0.channel_id().unwrap(),
                destinations: vec![
                    Destination::from_address(a),
                    Destination::from_address(h),
                ],
            },
        );
        // hub first, so alice is the mover of the ledger funding update
        let ledger0 = chan(vec![h, a], 4, alloc_to(&[(h, 50), (a, 50)]));
        Fixture {
            alice,
            bob,
            hank,
            target0,
            joint0,
            guarantor0,
            ledger0,
        }
    }

    /// Alice's shared data with her ledger channel to the hub supported at
    /// turn 0.
    fn shared_alice(f: &Fixture) -> SharedData {
        let mut rng = StdRng::seed_from_u64(31);
        let alice = Signer::new(&mut rng);
        let mut store = ChannelStore::new(alice);
        store.initialize(f.ledger0.channel.clone(), 1).unwrap();
        let hash = f.ledger0.hash().unwrap();
        store
            .check_and_store(SignedState::from_parts(
                f.ledger0.clone(),
                vec![f.hank.sign_eth(hash), f.alice.sign_eth(hash)],
            ))
            .unwrap();
        SharedData::new(store)
    }

    fn ctx(f: &Fixture) -> VirtualCtx {
        VirtualCtx::new(
            &f.target0,
            f.joint0.clone(),
            f.guarantor0.clone(),
            f.ledger0.channel_id().unwrap(),
            f.hank.address(),
            f.alice.address(),
        )
        .unwrap()
    }

    fn signed_by(state: &State, signers: &[&Signer]) -> SignedState {
        let hash = state.hash().unwrap();
        SignedState::from_parts(
            state.clone(),
            signers.iter().map(|s| s.sign_eth(hash)).collect(),
        )
    }

    fn count_messages(effects: &Effects) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Message { .. }))
            .count()
    }

    #[test]
    fn happy_path_funds_virtually() {
        let f = fixture();
        let mut shared = shared_alice(&f);
        let target_id = f.target0.channel_id().unwrap();
        let joint_id = f.joint0.channel_id().unwrap();
        let guarantor_id = f.guarantor0.channel_id().unwrap();

        // alice proposes the joint channel to bob and the hub
        let (vf, effects) = VirtualFunding::new(ctx(&f), &mut shared);
        assert!(matches!(vf, VirtualFunding::WaitForJointChannel { .. }));
        assert_eq!(count_messages(&effects), 2);

        // bob's and the hub's countersignatures arrive together
        let (vf, _) = vf.reduce(
            VirtualFundingAction::JointStateReceived(signed_by(
                &f.joint0,
                &[&f.alice, &f.bob, &f.hank],
            )),
            &mut shared,
        );
        // joint supported, so alice proposed the guarantor to the hub
        assert!(matches!(vf, VirtualFunding::WaitForGuarantorChannel { .. }));

        // hub countersigns the guarantor setup; alice is the mover of the
        // ledger funding update and proposes it right away
        let (vf, effects) = vf.reduce(
            VirtualFundingAction::GuarantorStateReceived(signed_by(
                &f.guarantor0,
                &[&f.alice, &f.hank],
            )),
            &mut shared,
        );
        assert!(matches!(vf, VirtualFunding::WaitForGuarantorFunding { .. }));
        assert_eq!(count_messages(&effects), 1);
        let ledger_update = match &vf {
            VirtualFunding::WaitForGuarantorFunding {
                inner: LedgerFunding::WaitForLedgerUpdate { expected, .. },
                ..
            } => expected.clone(),
            other => panic!("unexpected phase: {:?}", other),
        };

        // hub countersigns the ledger update; the joint funding update is
        // derived and bob (its mover) will propose it
        let (vf, _) = vf.reduce(
            VirtualFundingAction::Ledger(LedgerFundingAction::StateReceived(signed_by(
                &ledger_update,
                &[&f.hank],
            ))),
            &mut shared,
        );
        let app_update = match &vf {
            VirtualFunding::WaitForApplicationFunding { expected, .. } => expected.clone(),
            other => panic!("unexpected phase: {:?}", other),
        };
        assert_eq!(app_update.mover(), 1); // bob

        // bob's proposal arrives; alice countersigns
        let (vf, effects) = vf.reduce(
            VirtualFundingAction::JointStateReceived(signed_by(&app_update, &[&f.bob])),
            &mut shared,
        );
        assert!(matches!(
            vf,
            VirtualFunding::WaitForApplicationFunding { .. }
        ));
        assert_eq!(count_messages(&effects), 2);

        // the hub's signature completes the round
        let (vf, _) = vf.reduce(
            VirtualFundingAction::JointStateReceived(signed_by(
                &app_update,
                &[&f.bob, &f.alice, &f.hank],
            )),
            &mut shared,
        );
        assert!(matches!(vf, VirtualFunding::Success { channel_id } if channel_id == target_id));
        assert_eq!(
            shared.store.funding(target_id),
            Some(&Funding::Virtual {
                joint_id,
                guarantor_id
            })
        );
        // the joint channel now allocates everything to the target
        let joint = shared.store.latest_supported_state(joint_id).unwrap();
        match &joint.outcome {
            Outcome::Allocation(items) => assert_eq!(
                items.as_slice(),
                &[AllocationItem {
                    destination: Destination::from_channel(target_id),
                    amount: U256::from(10),
                }]
            ),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn early_application_funding_is_buffered_and_replayed() {
        let f = fixture();
        let mut shared = shared_alice(&f);
        let target_id = f.target0.channel_id().unwrap();

        let (vf, _) = VirtualFunding::new(ctx(&f), &mut shared);

        // bob races ahead: his joint funding update overtakes everything
        let app_update =
            funding_update(&f.joint0, target_id, &[
                AllocationItem {
                    destination: Destination::from_address(f.alice.address()),
                    amount: U256::from(6),
                },
                AllocationItem {
                    destination: Destination::from_address(f.bob.address()),
                    amount: U256::from(4),
                },
            ])
            .unwrap();
        let (vf, effects) = vf.reduce(
            VirtualFundingAction::JointStateReceived(signed_by(&app_update, &[&f.bob])),
            &mut shared,
        );
        // buffered, not acted on
        assert!(matches!(vf, VirtualFunding::WaitForJointChannel { .. }));
        assert!(effects.is_empty());

        // the remaining rounds complete in order
        let (vf, _) = vf.reduce(
            VirtualFundingAction::JointStateReceived(signed_by(
                &f.joint0,
                &[&f.alice, &f.bob, &f.hank],
            )),
            &mut shared,
        );
        let (vf, _) = vf.reduce(
            VirtualFundingAction::GuarantorStateReceived(signed_by(
                &f.guarantor0,
                &[&f.alice, &f.hank],
            )),
            &mut shared,
        );
        let ledger_update = match &vf {
            VirtualFunding::WaitForGuarantorFunding {
                inner: LedgerFunding::WaitForLedgerUpdate { expected, .. },
                ..
            } => expected.clone(),
            other => panic!("unexpected phase: {:?}", other),
        };
        // finishing the ledger round replays bob's buffered update: alice
        // countersigns it without being prodded again
        let (vf, effects) = vf.reduce(
            VirtualFundingAction::Ledger(LedgerFundingAction::StateReceived(signed_by(
                &ledger_update,
                &[&f.hank],
            ))),
            &mut shared,
        );
        assert!(matches!(
            vf,
            VirtualFunding::WaitForApplicationFunding { .. }
        ));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Message { .. })));

        // hub's signature arrives, completing the round
        let (vf, _) = vf.reduce(
            VirtualFundingAction::JointStateReceived(signed_by(
                &app_update,
                &[&f.bob, &f.alice, &f.hank],
            )),
            &mut shared,
        );
        assert!(matches!(vf, VirtualFunding::Success { .. }));
    }

    #[test]
    fn competing_joint_setup_fails_the_protocol() {
        let f = fixture();
        let mut shared = shared_alice(&f);

        let (vf, _) = VirtualFunding::new(ctx(&f), &mut shared);
        let mut competing = f.joint0.clone();
        competing.app_data = vec![0xde, 0xad];
        let (vf, _) = vf.reduce(
            VirtualFundingAction::JointStateReceived(signed_by(&competing, &[&f.bob])),
            &mut shared,
        );
        assert!(matches!(
            vf,
            VirtualFunding::Failure {
                reason: FailureReason::Rejected,
                ..
            }
        ));
    }

    #[test]
    fn rejection_is_terminal() {
        let f = fixture();
        let mut shared = shared_alice(&f);

        let (vf, _) = VirtualFunding::new(ctx(&f), &mut shared);
        let (vf, _) = vf.reduce(VirtualFundingAction::Rejected, &mut shared);
        assert!(vf.is_terminal());

        // terminal states absorb late deliveries
        let (vf, effects) = vf.reduce(
            VirtualFundingAction::JointStateReceived(signed_by(&f.joint0, &[&f.bob])),
            &mut shared,
        );
        assert!(vf.is_terminal());
        assert!(effects.is_empty());
    }
}
