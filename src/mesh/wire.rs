use std::fmt;

use rkyv::{
    bytecheck::CheckBytes,
    de::deserializers::SharedDeserializeMap,
    ser::serializers::AllocSerializer,
    validation::validators::DefaultValidator,
    AlignedVec, Archive, Deserialize, Serialize,
};

use super::{error::Error, Rank};

/// Bodies larger than this are zstd compressed before they hit a link.
pub const COMPRESSION_THRESHOLD: usize = 4 * 1024;
const COMPRESSION_LEVEL: i32 = 3;

/// Upper bound on a single frame body. Anything larger is treated as a
/// corrupt length prefix.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Identifies which channel a frame belongs to. Tags below 8 are reserved for
/// the mesh itself (handshake and collectives); the search layer allocates its
/// own above that.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u8);

impl Tag {
    pub const HELLO: Tag = Tag(1);
    pub const WELCOME: Tag = Tag(2);
    pub const BARRIER: Tag = Tag(3);
    pub const RELEASE: Tag = Tag(4);
    pub const COUNT: Tag = Tag(5);

    /// Highest tag that still fits in the prefix byte.
    pub const MAX: u8 = 0b0011_1111;
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

/// Frame prefix is 8 bits. The first bit specifies whether the body is zstd
/// compressed, the second bit is reserved and the last 6 bits carry the tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePrefix(u8);

impl FramePrefix {
    pub fn new(compressed: bool, tag: Tag) -> Result<Self, Error> {
        if tag.0 > Tag::MAX {
            Err(Error::UnknownTag(tag.0))?
        }
        let mut prefix = 0b0000_0000;
        if compressed {
            prefix |= 0b1000_0000;
        }
        prefix |= tag.0;
        Ok(Self(prefix))
    }

    pub fn compressed(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }

    pub fn tag(&self) -> Tag {
        Tag(self.0 & Tag::MAX)
    }

    pub fn byte(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for FramePrefix {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        if byte & 0b0100_0000 != 0 {
            Err(Error::UnknownTag(byte))
        } else {
            Ok(Self(byte))
        }
    }
}

/// One unit of traffic between two ranks. The body is an archived payload,
/// possibly compressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub source: Rank,
    pub prefix: FramePrefix,
    pub body: Vec<u8>,
}

impl Frame {
    /// Builds a frame around an encoded body, compressing it when it is large
    /// enough to be worth it.
    pub fn seal(source: Rank, tag: Tag, body: Vec<u8>) -> Result<Self, Error> {
        let (compressed, body) = if body.len() > COMPRESSION_THRESHOLD {
            (true, zstd::bulk::compress(&body, COMPRESSION_LEVEL)?)
        } else {
            (false, body)
        };
        Ok(Self {
            source,
            prefix: FramePrefix::new(compressed, tag)?,
            body,
        })
    }

    pub fn tag(&self) -> Tag {
        self.prefix.tag()
    }

    /// Size of the frame on the wire, header included.
    pub fn wire_len(&self) -> usize {
        let mut buf = unsigned_varint::encode::u64_buffer();
        1 + unsigned_varint::encode::u64(self.body.len() as u64, &mut buf).len()
            + self.body.len()
    }

    /// Returns the plain archived body.
    pub fn open(&self) -> Result<Vec<u8>, Error> {
        if self.prefix.compressed() {
            Ok(zstd::stream::decode_all(self.body.as_slice())?)
        } else {
            Ok(self.body.clone())
        }
    }

    /// prefix | varint(len) | body
    pub fn to_wire(&self) -> Vec<u8> {
        let mut len_buf = unsigned_varint::encode::u64_buffer();
        let len = unsigned_varint::encode::u64(self.body.len() as u64, &mut len_buf);
        let mut buf = Vec::with_capacity(1 + len.len() + self.body.len());
        buf.push(self.prefix.byte());
        buf.extend_from_slice(len);
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decodes a complete frame produced by [`Frame::to_wire`].
    pub fn from_wire(source: Rank, bytes: &[u8]) -> Result<Self, Error> {
        let (&prefix, rest) = bytes.split_first().ok_or(Error::TruncatedFrame)?;
        let prefix = FramePrefix::try_from(prefix)?;
        let (len, body) =
            unsigned_varint::decode::u64(rest).map_err(|_| Error::TruncatedFrame)?;
        if len > MAX_FRAME_LEN {
            Err(Error::FrameTooLarge(len))?
        }
        if body.len() as u64 != len {
            Err(Error::TruncatedFrame)?
        }
        Ok(Self {
            source,
            prefix,
            body: body.to_vec(),
        })
    }
}

/// A typed message that can travel over the mesh on its own channel.
pub trait Payload: Sized {
    const TAG: Tag;

    fn encode(&self) -> Result<Vec<u8>, Error>;
    fn decode(body: &[u8]) -> Result<Self, Error>;
}

/// Archives a value with rkyv.
pub fn archive<T>(value: &T) -> Result<Vec<u8>, Error>
where
    T: Serialize<AllocSerializer<256>>,
{
    let bytes = rkyv::to_bytes::<_, 256>(value).map_err(|_| Error::CouldNotEncodeMessage)?;
    Ok(bytes.to_vec())
}

/// Validates and deserializes an archived value. Bodies read off a link are
/// not guaranteed to be aligned, so they are copied into an aligned buffer
/// first.
pub fn unarchive<T>(body: &[u8]) -> Result<T, Error>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, SharedDeserializeMap>,
{
    let mut aligned = AlignedVec::with_capacity(body.len());
    aligned.extend_from_slice(body);
    rkyv::from_bytes::<T>(&aligned).map_err(|_| Error::CouldNotDecodeMessage)
}

/// Implements [`Payload`] for an rkyv archived type on the given tag.
macro_rules! archived_payload {
    ($ty:ty => $tag:expr) => {
        impl $crate::mesh::Payload for $ty {
            const TAG: $crate::mesh::Tag = $tag;

            fn encode(&self) -> Result<Vec<u8>, $crate::mesh::Error> {
                $crate::mesh::wire::archive(self)
            }

            fn decode(body: &[u8]) -> Result<Self, $crate::mesh::Error> {
                $crate::mesh::wire::unarchive(body)
            }
        }
    };
}

pub(crate) use archived_payload;

/// First frame on every link, sent by the dialing side.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Hello {
    pub rank: u32,
    pub size: u32,
    pub fingerprint: [u8; 32],
}

/// Reply to a [`Hello`], carrying the accepting side's view of the run.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Welcome(pub Hello);

/// Arrival at a barrier.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Arrive {
    pub epoch: u64,
}

/// Release from a barrier, sent by the root once everyone arrived.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Release {
    pub epoch: u64,
}

/// Item count announced ahead of a variable sized gather.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct Count(pub u64);

archived_payload!(Hello => Tag::HELLO);
archived_payload!(Welcome => Tag::WELCOME);
archived_payload!(Arrive => Tag::BARRIER);
archived_payload!(Release => Tag::RELEASE);
archived_payload!(Count => Tag::COUNT);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_bits() {
        let prefix = FramePrefix::new(true, Tag(13)).unwrap();
        assert!(prefix.compressed());
        assert_eq!(prefix.tag(), Tag(13));
        assert_eq!(prefix.byte(), 0b1000_1101);

        assert!(FramePrefix::new(false, Tag(64)).is_err());
        assert!(FramePrefix::try_from(0b0100_0001).is_err());
    }

    #[test]
    fn large_bodies_are_compressed() {
        let body = vec![7u8; COMPRESSION_THRESHOLD * 4];
        let frame = Frame::seal(2, Tag(20), body.clone()).unwrap();
        assert!(frame.prefix.compressed());
        assert!(frame.body.len() < body.len());
        assert_eq!(frame.open().unwrap(), body);

        let small = Frame::seal(2, Tag(20), vec![1, 2, 3]).unwrap();
        assert!(!small.prefix.compressed());
        assert_eq!(small.open().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn wire_form_survives_a_link() {
        let hello = Hello {
            rank: 3,
            size: 4,
            fingerprint: [9; 32],
        };
        let frame = Frame::seal(3, Tag::HELLO, hello.encode().unwrap()).unwrap();
        let bytes = frame.to_wire();
        assert_eq!(bytes.len(), frame.wire_len());

        let decoded = Frame::from_wire(3, &bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(Hello::decode(&decoded.open().unwrap()).unwrap(), hello);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = Frame::seal(0, Tag::COUNT, Count(5).encode().unwrap()).unwrap();
        let bytes = frame.to_wire();
        assert!(matches!(
            Frame::from_wire(0, &bytes[..bytes.len() - 1]),
            Err(Error::TruncatedFrame)
        ));
        assert!(matches!(Frame::from_wire(0, &[]), Err(Error::TruncatedFrame)));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(Hello::decode(&[1, 2, 3]).is_err());
    }
}
