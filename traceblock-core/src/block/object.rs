//! Object framing for block data files
//!
//! Format:
//! - 4 bytes: frame length (excluding this field)
//! - 2 bytes: id length
//! - N bytes: id
//! - N bytes: payload
//! - 4 bytes: CRC32 checksum of everything after the length field

use crate::{BlockError, Id, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes added around `id` and `payload` by the framing
pub const FRAME_OVERHEAD: usize = 4 + 2 + 4;

/// Serialize an object with length prefix and CRC checksum
pub fn encode_object(id: &Id, payload: &[u8]) -> Result<Bytes> {
    let frame_len = FRAME_OVERHEAD - 4 + id.len() + payload.len();
    let frame_len = u32::try_from(frame_len).map_err(|_| {
        BlockError::InvalidArgument(format!("object payload too large: {} bytes", payload.len()))
    })?;

    let mut buf = BytesMut::with_capacity(4 + frame_len as usize);
    buf.put_u32_le(frame_len);
    buf.put_u16_le(id.len() as u16);
    buf.put_slice(id.as_bytes());
    buf.put_slice(payload);

    let checksum = crc32fast::hash(&buf[4..]);
    buf.put_u32_le(checksum);

    Ok(buf.freeze())
}

/// Deserialize one object, validating its checksum.
///
/// Returns the id, the payload and the number of bytes consumed.
pub fn decode_object(data: &[u8]) -> Result<(Id, Bytes, usize)> {
    if data.len() < 4 {
        return Err(BlockError::InvalidFormat("Object too short".into()));
    }

    let mut cursor = std::io::Cursor::new(data);
    let len = cursor.get_u32_le() as usize;
    if len < FRAME_OVERHEAD - 4 || data.len() < 4 + len {
        return Err(BlockError::InvalidFormat("Incomplete object".into()));
    }

    let frame = &data[4..4 + len];
    let body = &frame[..len - 4];

    let expected = {
        let mut c = std::io::Cursor::new(&frame[len - 4..]);
        c.get_u32_le()
    };
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(BlockError::ChecksumMismatch { expected, actual });
    }

    let mut cursor = std::io::Cursor::new(body);
    let id_len = cursor.get_u16_le() as usize;
    if 2 + id_len > body.len() {
        return Err(BlockError::InvalidFormat("Object id overruns frame".into()));
    }
    let id = Id::from_slice(&body[2..2 + id_len])
        .map_err(|e| BlockError::InvalidFormat(e.to_string()))?;
    let payload = Bytes::copy_from_slice(&body[2 + id_len..]);

    Ok((id, payload, 4 + len))
}

/// Iterator over the framed objects of a data file
pub struct ObjectIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ObjectIter<'a> {
    /// Iterate objects starting at the beginning of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for ObjectIter<'a> {
    type Item = Result<(Id, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        match decode_object(&self.data[self.offset..]) {
            Ok((id, payload, consumed)) => {
                self.offset += consumed;
                Some(Ok((id, payload)))
            }
            Err(e) => {
                // Stop after the first bad frame
                self.offset = self.data.len();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_framing() {
        let id = Id::from_slice(&[0xab; 16]).unwrap();
        let encoded = encode_object(&id, b"span data").unwrap();
        assert_eq!(encoded.len(), FRAME_OVERHEAD + 16 + 9);

        let (decoded_id, payload, consumed) = decode_object(&encoded).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(&payload[..], b"span data");
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_empty_payload() {
        let id = Id::from_slice(&[1]).unwrap();
        let encoded = encode_object(&id, &[]).unwrap();

        let (_, payload, _) = decode_object(&encoded).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_checksum_validation() {
        let id = Id::from_slice(&[9; 8]).unwrap();
        let mut encoded = encode_object(&id, b"payload").unwrap().to_vec();

        // Corrupt the data
        encoded[8] ^= 0xFF;

        let result = decode_object(&encoded);
        assert!(matches!(result, Err(BlockError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_object() {
        let id = Id::from_slice(&[9; 8]).unwrap();
        let encoded = encode_object(&id, b"payload").unwrap();

        let result = decode_object(&encoded[..encoded.len() - 1]);
        assert!(matches!(result, Err(BlockError::InvalidFormat(_))));
    }

    #[test]
    fn test_object_iter() {
        let mut data = Vec::new();
        for i in 0..5u8 {
            let id = Id::from_slice(&[i; 4]).unwrap();
            data.extend_from_slice(&encode_object(&id, &vec![i; i as usize]).unwrap());
        }

        let objects: Vec<_> = ObjectIter::new(&data).collect::<Result<_>>().unwrap();
        assert_eq!(objects.len(), 5);
        assert_eq!(objects[3].0.as_bytes(), &[3; 4]);
        assert_eq!(objects[3].1.len(), 3);
    }
}
