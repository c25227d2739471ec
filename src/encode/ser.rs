use super::error::{Error, Result};
use super::types::Hash;
use serde::{
    ser::{
        self, SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant, SerializeTuple,
        SerializeTupleStruct, SerializeTupleVariant,
    },
    Serialize,
};
use sha3::{Digest, Keccak256};

/// Size of one encoded slot in bytes. Every scalar occupies exactly one
/// slot, which keeps the encoding trivially canonical: there is exactly
/// one byte string per value and no alignment ambiguity.
const SLOT_SIZE: usize = 32;

/// Sink for encoded slots.
///
/// The encoder never allocates; it pushes 32-byte slots (and, for byte
/// strings, padded chunks) straight into the writer, which is usually a
/// running Keccak256 hasher.
pub trait Writer {
    fn write(&mut self, slot: &[u8]);
}

/// Canonical encoder used for content addressing (channel ids) and state
/// hashing.
///
/// The format is deliberately simple: scalars are single big-endian
/// right-aligned slots, byte strings and sequences are a length slot
/// followed by their contents in order, structs and tuples are their
/// fields in declaration order with no framing. Length prefixes make the
/// encoding injective for the types we hash; two distinct `State` values
/// can never encode to the same byte string.
///
/// This is not the ABI encoding of any particular chain. The adjudicator
/// binding (which must agree on the exact bytes) lives outside this crate;
/// here only determinism matters.
pub struct Serializer<'a, W>
where
    W: Writer,
{
    writer: &'a mut W,
}

pub fn to_writer<T, W>(value: &T, writer: &mut W) -> Result<()>
where
    T: Serialize,
    W: Writer,
{
    let mut serializer = Serializer { writer };
    value.serialize(&mut serializer)
}

/// Hash the canonical encoding of `value`.
///
/// This is the content address used for channel ids and the message that
/// gets signed for every channel state.
pub fn to_hash<T>(value: &T) -> Result<Hash>
where
    T: Serialize,
{
    let mut hasher = KeccakWriter::default();
    to_writer(value, &mut hasher)?;
    Ok(hasher.finish())
}

// [Writer] feeding every slot into a running Keccak256, so hashing never
// materializes the encoded byte string.
#[derive(Default)]
struct KeccakWriter {
    hasher: Keccak256,
}

impl Writer for KeccakWriter {
    fn write(&mut self, slot: &[u8]) {
        self.hasher.update(slot);
    }
}

impl KeccakWriter {
    fn finish(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl<'a, W> Serializer<'a, W>
where
    W: Writer,
{
    // Panics if N > SLOT_SIZE, which cannot happen for primitive widths.
    fn write_right_aligned<const N: usize>(&mut self, v: [u8; N]) {
        let mut bytes: [u8; SLOT_SIZE] = Default::default();
        bytes[SLOT_SIZE - N..].copy_from_slice(v.as_slice());
        self.writer.write(bytes.as_slice())
    }

    fn write_signed<const N: usize>(&mut self, negative: bool, v: [u8; N]) {
        let filler = if negative { 0xff } else { 0x00 };
        let mut bytes: [u8; SLOT_SIZE] = [filler; SLOT_SIZE];
        bytes[SLOT_SIZE - N..].copy_from_slice(v.as_slice());
        self.writer.write(bytes.as_slice())
    }

    fn write_left_aligned_slice(&mut self, v: &[u8]) {
        let mut bytes: [u8; SLOT_SIZE] = Default::default();
        bytes[..v.len()].copy_from_slice(v);
        self.writer.write(bytes.as_slice());
    }

    /// Length slot followed by the data padded to full slots.
    fn write_length_prefixed(&mut self, v: &[u8]) {
        self.write_right_aligned(v.len().to_be_bytes());
        let iter = v.chunks_exact(SLOT_SIZE);
        let rem = iter.remainder();
        for chunk in iter {
            self.writer.write(chunk);
        }
        if !rem.is_empty() {
            self.write_left_aligned_slice(rem);
        }
    }
}

impl<'a, 'b, W> ser::Serializer for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.serialize_u8(if v { 1 } else { 0 })
    }

    fn serialize_i8(self, v: i8) -> Result<()> {
        self.write_signed(v < 0, v.to_be_bytes());
        Ok(())
    }

    fn serialize_i16(self, v: i16) -> Result<()> {
        self.write_signed(v < 0, v.to_be_bytes());
        Ok(())
    }

    fn serialize_i32(self, v: i32) -> Result<()> {
        self.write_signed(v < 0, v.to_be_bytes());
        Ok(())
    }

    fn serialize_i64(self, v: i64) -> Result<()> {
        self.write_signed(v < 0, v.to_be_bytes());
        Ok(())
    }

    fn serialize_i128(self, v: i128) -> Result<()> {
        self.write_signed(v < 0, v.to_be_bytes());
        Ok(())
    }

    fn serialize_u8(self, v: u8) -> Result<()> {
        self.write_right_aligned(v.to_be_bytes());
        Ok(())
    }

    fn serialize_u16(self, v: u16) -> Result<()> {
        self.write_right_aligned(v.to_be_bytes());
        Ok(())
    }

    fn serialize_u32(self, v: u32) -> Result<()> {
        self.write_right_aligned(v.to_be_bytes());
        Ok(())
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.write_right_aligned(v.to_be_bytes());
        Ok(())
    }

    fn serialize_u128(self, v: u128) -> Result<()> {
        self.write_right_aligned(v.to_be_bytes());
        Ok(())
    }

    fn serialize_f32(self, _: f32) -> Result<()> {
        Err(Error::TypeNotRepresentable("f32"))
    }

    fn serialize_f64(self, _: f64) -> Result<()> {
        Err(Error::TypeNotRepresentable("f64"))
    }

    fn serialize_char(self, _: char) -> Result<()> {
        Err(Error::TypeNotYetSupported("char"))
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        self.write_length_prefixed(v.as_bytes());
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        self.write_length_prefixed(v);
        Ok(())
    }

    fn serialize_none(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("none"))
    }

    fn serialize_some<T: ?Sized>(self, _: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("some"))
    }

    fn serialize_unit(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("unit"))
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<()> {
        Err(Error::TypeNotRepresentable("unit struct"))
    }

    fn serialize_unit_variant(self, _: &'static str, index: u32, _: &'static str) -> Result<()> {
        // Field-less enums encode as their discriminant. Used by the
        // outcome type to distinguish allocations from guarantees.
        self.write_right_aligned(index.to_be_bytes());
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _: &'static str,
        index: u32,
        _: &'static str,
        value: &T,
    ) -> Result<()>
    where
        T: Serialize,
    {
        // Discriminant slot, then the payload. The discriminant keeps
        // values of different variants from colliding.
        self.write_right_aligned(index.to_be_bytes());
        value.serialize(self)
    }

    fn serialize_seq(self, size: Option<usize>) -> Result<Self::SerializeSeq> {
        // Sequences must know their length up front so the length slot can
        // be written before the elements. All our types are slices or
        // Vecs, which do.
        match size {
            Some(size) => {
                self.write_right_aligned(size.to_be_bytes());
                Ok(self)
            }
            None => Err(Error::TypeNotRepresentable("seq of unknown length")),
        }
    }

    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        self.write_right_aligned(variant_index.to_be_bytes());
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        self.write_right_aligned(variant_index.to_be_bytes());
        Ok(self)
    }

    fn collect_str<T: ?Sized>(self, _value: &T) -> Result<()>
    where
        T: core::fmt::Display,
    {
        Err(Error::TypeNotRepresentable("displayed string"))
    }
}

impl<'a, 'b, W> SerializeSeq for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeTuple for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeTupleStruct for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeTupleVariant for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeMap for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized>(&mut self, _key: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn serialize_value<T: ?Sized>(&mut self, _value: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeStruct for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, _name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeStructVariant for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, _key: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}
