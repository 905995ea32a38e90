//! Compact binary encodings shared by the persistent DAG records.
//!
//! Readers take `&mut &[u8]` and advance the slice past what they consumed,
//! so records can be decoded field by field without tracking offsets.
//!
//! Tagged node id layout:
//!
//! ```text
//! 0x01 <name>                          canonical
//! 0x02 <name> <count varint> <packed>  quadrant
//! ```
//!
//! where `<name>` is a varint length followed by UTF-8 bytes and `<packed>`
//! holds four 2-bit quadrant indices per byte, lowest bits first.

use crate::error::{TypeError, TypeResult};
use crate::node_id::NodeId;
use crate::spatial::Quadrant;

pub const TAG_CANONICAL: u8 = 0x01;
pub const TAG_QUADRANT: u8 = 0x02;

/// Encode an unsigned LEB128 varint.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn read_varint(input: &mut &[u8]) -> TypeResult<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in input.iter().enumerate() {
        if shift >= 64 || (shift == 63 && byte & 0x7E != 0) {
            return Err(TypeError::VarintOverflow);
        }
        value |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            *input = &input[i + 1..];
            return Ok(value);
        }
    }
    Err(TypeError::Truncated("varint"))
}

pub fn read_u8(input: &mut &[u8]) -> TypeResult<u8> {
    let (&first, rest) = input.split_first().ok_or(TypeError::Truncated("byte"))?;
    *input = rest;
    Ok(first)
}

/// Take exactly `len` bytes off the front of `input`.
pub fn read_exact<'a>(input: &mut &'a [u8], len: usize, what: &'static str) -> TypeResult<&'a [u8]> {
    if input.len() < len {
        return Err(TypeError::Truncated(what));
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    Ok(head)
}

/// Varint length followed by the raw bytes.
pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn read_bytes<'a>(input: &mut &'a [u8]) -> TypeResult<&'a [u8]> {
    let len = read_varint(input)? as usize;
    read_exact(input, len, "byte string")
}

pub fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_bytes(buf, s.as_bytes());
}

pub fn read_str(input: &mut &[u8]) -> TypeResult<String> {
    let bytes = read_bytes(input)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| TypeError::InvalidUtf8(e.to_string()))
}

/// Pack quadrants four to a byte, 2 bits each, lowest bits first.
pub fn pack_quadrants(quadrants: &[Quadrant]) -> Vec<u8> {
    let mut packed = vec![0u8; quadrants.len().div_ceil(4)];
    for (i, q) in quadrants.iter().enumerate() {
        packed[i / 4] |= q.index() << ((i % 4) * 2);
    }
    packed
}

pub fn unpack_quadrants(packed: &[u8], count: usize) -> TypeResult<Vec<Quadrant>> {
    if packed.len() < count.div_ceil(4) {
        return Err(TypeError::Truncated("quadrants"));
    }
    (0..count)
        .map(|i| {
            let index = (packed[i / 4] >> ((i % 4) * 2)) & 0b11;
            Quadrant::from_index(index).ok_or(TypeError::InvalidQuadrant(index))
        })
        .collect()
}

/// Append the tagged encoding of `id`.
pub fn write_node_id(buf: &mut Vec<u8>, id: &NodeId) {
    match id {
        NodeId::Canonical { name, .. } => {
            buf.push(TAG_CANONICAL);
            write_str(buf, name);
        }
        NodeId::Quadrant {
            name, quadrants, ..
        } => {
            buf.push(TAG_QUADRANT);
            write_str(buf, name);
            write_varint(buf, quadrants.len() as u64);
            buf.extend_from_slice(&pack_quadrants(quadrants));
        }
    }
}

pub fn read_node_id(input: &mut &[u8]) -> TypeResult<NodeId> {
    match read_u8(input)? {
        TAG_CANONICAL => Ok(NodeId::canonical(read_str(input)?)),
        TAG_QUADRANT => {
            let name = read_str(input)?;
            let count = read_varint(input)? as usize;
            let packed = read_exact(input, count.div_ceil(4), "quadrants")?;
            Ok(NodeId::quadrant(name, unpack_quadrants(packed, count)?))
        }
        tag => Err(TypeError::UnknownTag(tag)),
    }
}

pub fn encode_node_id(id: &NodeId) -> Vec<u8> {
    let mut buf = Vec::new();
    write_node_id(&mut buf, id);
    buf
}

pub fn decode_node_id(mut data: &[u8]) -> TypeResult<NodeId> {
    read_node_id(&mut data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn quadrant_strategy() -> impl Strategy<Value = Quadrant> {
        (0u8..4).prop_map(|i| Quadrant::from_index(i).unwrap())
    }

    fn assert_same(a: &NodeId, b: &NodeId) {
        assert_eq!(a, b);
        assert_eq!(a.is_canonical(), b.is_canonical());
        assert_eq!(a.quadrants(), b.quadrants());
        assert_eq!(a.hash_bits(), b.hash_bits());
    }

    // ----------------------------------------------------------
    // Varints and strings
    // ----------------------------------------------------------

    #[test]
    fn varint_known_encodings() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0);
        write_varint(&mut buf, 127);
        write_varint(&mut buf, 300);
        assert_eq!(buf, vec![0x00, 0x7F, 0xAC, 0x02]);

        let mut input = buf.as_slice();
        assert_eq!(read_varint(&mut input).unwrap(), 0);
        assert_eq!(read_varint(&mut input).unwrap(), 127);
        assert_eq!(read_varint(&mut input).unwrap(), 300);
        assert!(input.is_empty());
    }

    #[test]
    fn varint_extremes() {
        let mut buf = Vec::new();
        write_varint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        assert_eq!(read_varint(&mut buf.as_slice()).unwrap(), u64::MAX);
    }

    #[test]
    fn varint_truncated_and_overflow() {
        assert_eq!(
            read_varint(&mut [0x80u8].as_slice()),
            Err(TypeError::Truncated("varint"))
        );
        let too_long = [0xFFu8; 11];
        assert_eq!(
            read_varint(&mut too_long.as_slice()),
            Err(TypeError::VarintOverflow)
        );
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut buf = Vec::new();
        write_str(&mut buf, "héllo");
        assert_eq!(buf[0] as usize, "héllo".len());
        let mut input = buf.as_slice();
        assert_eq!(read_str(&mut input).unwrap(), "héllo");
        assert!(input.is_empty());
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let data = [2u8, 0xC3, 0x28];
        assert!(matches!(
            read_str(&mut data.as_slice()),
            Err(TypeError::InvalidUtf8(_))
        ));
    }

    // ----------------------------------------------------------
    // Quadrant packing
    // ----------------------------------------------------------

    #[test]
    fn packing_puts_first_quadrant_in_low_bits() {
        let packed = pack_quadrants(&[
            Quadrant::NorthWest,
            Quadrant::NorthEast,
            Quadrant::SouthEast,
            Quadrant::SouthWest,
            Quadrant::SouthEast,
        ]);
        assert_eq!(packed, vec![0b00_11_10_01, 0b11]);
    }

    #[test]
    fn empty_and_single_quadrant_paths() {
        for path in [vec![], vec![Quadrant::SouthEast]] {
            let id = NodeId::quadrant("q", path.clone());
            let back = decode_node_id(&encode_node_id(&id)).unwrap();
            assert_same(&id, &back);
            assert_eq!(back.quadrants(), path.as_slice());
        }
    }

    #[test]
    fn long_quadrant_path_roundtrips() {
        let path: Vec<Quadrant> = (0..131).map(|i| Quadrant::ALL[(i * 7) % 4]).collect();
        let id = NodeId::quadrant("deep", path.clone());
        let encoded = encode_node_id(&id);
        let back = decode_node_id(&encoded).unwrap();
        assert_eq!(back.quadrants(), path.as_slice());
    }

    // ----------------------------------------------------------
    // Tagged node ids
    // ----------------------------------------------------------

    #[test]
    fn canonical_tag_layout() {
        let encoded = encode_node_id(&NodeId::canonical("ab"));
        assert_eq!(encoded, vec![TAG_CANONICAL, 2, b'a', b'b']);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(decode_node_id(&[0x07, 0]), Err(TypeError::UnknownTag(0x07)));
    }

    #[test]
    fn truncated_quadrants_are_rejected() {
        let mut encoded = encode_node_id(&NodeId::quadrant("x", vec![Quadrant::NorthEast; 9]));
        encoded.pop();
        assert_eq!(
            decode_node_id(&encoded),
            Err(TypeError::Truncated("quadrants"))
        );
    }

    proptest! {
        #[test]
        fn varint_roundtrip(value in any::<u64>()) {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut input = buf.as_slice();
            prop_assert_eq!(read_varint(&mut input).unwrap(), value);
            prop_assert!(input.is_empty());
        }

        #[test]
        fn canonical_roundtrip(name in "\\PC{0,40}") {
            let id = NodeId::canonical(name);
            let back = decode_node_id(&encode_node_id(&id)).unwrap();
            assert_same(&id, &back);
        }

        #[test]
        fn quadrant_roundtrip(
            name in "[a-z0-9.]{1,24}",
            path in proptest::collection::vec(quadrant_strategy(), 0..160),
        ) {
            let id = NodeId::quadrant(name, path);
            let back = decode_node_id(&encode_node_id(&id)).unwrap();
            assert_same(&id, &back);
        }
    }
}
