use alloc::vec::Vec;
use log::warn;
use prost::{bytes::BufMut, Message};

use super::proto::{address_from, envelope, Envelope};
use super::{BytesBus, Error, MessageBus};
use crate::messages::ParticipantMessage;
use crate::Address;

/// Encodes [ParticipantMessage]s as protobuf and frames them with a
/// big-endian u16 length prefix, the framing nitro wallets speak on the
/// participant wire.
#[derive(Debug)]
pub struct ProtoBufEncodingLayer<B: BytesBus> {
    pub bus: B,
}

impl<B: BytesBus> ProtoBufEncodingLayer<B> {
    /// One frame: 2 length bytes (big-endian, excluding themselves)
    /// followed by the encoded envelope.
    pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, Error> {
        let len = envelope.encoded_len();
        // the prefix is a fixed u16, not LEB128, so big messages are a
        // hard error instead of a silent truncation
        if len >= 1 << 16 {
            return Err(Error::MessageTooLarge);
        }
        let mut buf = Vec::with_capacity(2 + len);
        buf.put_slice(&(len as u16).to_be_bytes());
        envelope.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode one frame produced by [ProtoBufEncodingLayer::encode].
    pub fn decode(buf: &[u8]) -> Result<(Address, Address, ParticipantMessage), Error> {
        if buf.len() < 2 {
            return Err(Error::IncompleteFrame);
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.len() < 2 + len {
            return Err(Error::IncompleteFrame);
        }
        let envelope = Envelope::decode(&buf[2..2 + len])?;

        let sender = address_from(&envelope.sender, "sender")?;
        let recipient = address_from(&envelope.recipient, "recipient")?;
        let msg = envelope.msg.ok_or(Error::MissingField("msg"))?.try_into()?;
        Ok((sender, recipient, msg))
    }
}

impl<B: BytesBus> MessageBus for ProtoBufEncodingLayer<B> {
    fn send_to_participant(&self, sender: Address, recipient: Address, msg: ParticipantMessage) {
        let wiremsg: envelope::Msg = (&msg).into();
        let envelope = Envelope {
            sender: sender.0.to_vec(),
            recipient: recipient.0.to_vec(),
            msg: Some(wiremsg),
        };
        match Self::encode(&envelope) {
            Ok(buf) => self.bus.send_to_participant(recipient, &buf),
            // a message that cannot be framed is dropped, not truncated
            Err(e) => warn!("wire: dropping unencodable message: {:?}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AllocationItem, Channel, Destination, Outcome, SignedState, State};
    use crate::sig::Signer;
    use crate::U256;
    use alloc::vec;
    use core::cell::RefCell;
    use rand::{rngs::StdRng, SeedableRng};

    #[derive(Debug, Default)]
    struct RecordingBus {
        sent: RefCell<Vec<(Address, Vec<u8>)>>,
    }

    impl BytesBus for RecordingBus {
        fn send_to_participant(&self, recipient: Address, msg: &[u8]) {
            self.sent.borrow_mut().push((recipient, msg.to_vec()));
        }
    }

    fn sample_signed_state() -> (Signer, Signer, SignedState) {
        let mut rng = StdRng::seed_from_u64(61);
        let alice = Signer::new(&mut rng);
        let bob = Signer::new(&mut rng);
        let channel = Channel {
            chain_id: U256::from(1),
            participants: vec![alice.address(), bob.address()],
            channel_nonce: U256::from(77),
        };
        let outcome = Outcome::Allocation(vec![AllocationItem {
            destination: Destination::from_address(alice.address()),
            amount: U256::from(9),
        }]);
        let state = State::new(channel, outcome, Address::default(), vec![1, 2, 3], 60);
        let mut signed = SignedState::new(state);
        signed.sign(&alice).unwrap();
        (alice, bob, signed)
    }

    #[test]
    fn frame_carries_length_prefix() {
        let (alice, bob, signed) = sample_signed_state();
        let layer = ProtoBufEncodingLayer {
            bus: RecordingBus::default(),
        };
        layer.send_to_participant(
            alice.address(),
            bob.address(),
            ParticipantMessage::SignedStates(vec![signed]),
        );

        let sent = layer.bus.sent.borrow();
        let (recipient, buf) = &sent[0];
        assert_eq!(*recipient, bob.address());
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        assert_eq!(buf.len(), 2 + len);
    }

    #[test]
    fn signed_states_survive_the_wire() {
        let (alice, bob, signed) = sample_signed_state();
        let layer = ProtoBufEncodingLayer {
            bus: RecordingBus::default(),
        };
        layer.send_to_participant(
            alice.address(),
            bob.address(),
            ParticipantMessage::SignedStates(vec![signed.clone()]),
        );

        let sent = layer.bus.sent.borrow();
        let (sender, recipient, msg) = ProtoBufEncodingLayer::<RecordingBus>::decode(&sent[0].1)
            .unwrap();
        assert_eq!(sender, alice.address());
        assert_eq!(recipient, bob.address());
        match msg {
            ParticipantMessage::SignedStates(states) => {
                assert_eq!(states.len(), 1);
                assert_eq!(states[0].state(), signed.state());
                assert_eq!(states[0].signatures(), signed.signatures());
                // the signature still recovers after the round trip
                assert!(states[0].signed_by(0, &alice).unwrap());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn rejections_survive_the_wire() {
        let (alice, bob, signed) = sample_signed_state();
        let channel_id = signed.state().channel_id().unwrap();
        let layer = ProtoBufEncodingLayer {
            bus: RecordingBus::default(),
        };
        layer.send_to_participant(
            bob.address(),
            alice.address(),
            ParticipantMessage::UpdateRejected {
                channel_id,
                turn_num: 3,
                reason: alloc::string::String::from("not the agreed funding update"),
            },
        );

        let sent = layer.bus.sent.borrow();
        let (_, _, msg) = ProtoBufEncodingLayer::<RecordingBus>::decode(&sent[0].1).unwrap();
        match msg {
            ParticipantMessage::UpdateRejected {
                channel_id: id,
                turn_num,
                reason,
            } => {
                assert_eq!(id, channel_id);
                assert_eq!(turn_num, 3);
                assert_eq!(reason, "not the agreed funding update");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let (alice, bob, signed) = sample_signed_state();
        let layer = ProtoBufEncodingLayer {
            bus: RecordingBus::default(),
        };
        layer.send_to_participant(
            alice.address(),
            bob.address(),
            ParticipantMessage::SignedStates(vec![signed]),
        );

        let sent = layer.bus.sent.borrow();
        let buf = &sent[0].1;
        assert!(matches!(
            ProtoBufEncodingLayer::<RecordingBus>::decode(&buf[..buf.len() - 1]),
            Err(Error::IncompleteFrame)
        ));
        assert!(matches!(
            ProtoBufEncodingLayer::<RecordingBus>::decode(&buf[..1]),
            Err(Error::IncompleteFrame)
        ));
    }

    #[test]
    fn garbage_signature_length_is_rejected() {
        let (_, _, signed) = sample_signed_state();
        let msg = crate::wire::proto::SignedStateMsg {
            state: Some(signed.state().into()),
            signatures: vec![vec![0u8; 10]],
        };
        assert!(matches!(
            SignedState::try_from(msg),
            Err(Error::InvalidLength("signatures"))
        ));
    }
}
