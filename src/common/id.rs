//! Kademlia node Id or a lookup target
use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits, which is also the number of buckets in a routing table.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
/// Kademlia node Id or a lookup target
///
/// Ordering is byte-wise, so ordering two XOR distances to the same target
/// orders their ids by closeness to that target.
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// Generate a random Id, uniform over the whole key space.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, DecodeIdError> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(DecodeIdError::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    /// Returns a byte slice of this Id.
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// XOR metric between this Id and another one.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            result[i] = a ^ b;
        }

        Id(result)
    }

    /// Index of the first set bit, scanning the most significant byte first,
    /// and the most significant bit first within each byte.
    ///
    /// An all-zero Id (the XOR of identical ids) returns the last index, `ID_BITS - 1`,
    /// so an identical id lands in the last bucket of a routing table.
    pub fn prefix_len(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        ID_BITS - 1
    }

    /// Returns `true` if every bit of this Id is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl FromStr for Id {
    type Err = DecodeIdError;

    fn from_str(s: &str) -> Result<Id, DecodeIdError> {
        if s.len() % 2 != 0 {
            return Err(DecodeIdError::OddNumberOfCharacters);
        }

        let mut bytes = Vec::with_capacity(s.len() / 2);

        for i in 0..s.len() / 2 {
            let byte_str = s
                .get(i * 2..(i * 2) + 2)
                .ok_or_else(|| DecodeIdError::InvalidHexCharacter(s.into()))?;

            // Lowercase only, and from_str_radix alone would accept a leading `+`.
            if !byte_str
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
            {
                return Err(DecodeIdError::InvalidHexCharacter(byte_str.into()));
            }

            match u8::from_str_radix(byte_str, 16) {
                Ok(byte) => bytes.push(byte),
                Err(_) => return Err(DecodeIdError::InvalidHexCharacter(byte_str.into())),
            }
        }

        Id::from_bytes(bytes)
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Malformed identifier errors.
pub enum DecodeIdError {
    /// Id is expected to by 20 bytes.
    #[error("Invalid Id size, expected {ID_SIZE}, got {0}")]
    InvalidIdSize(usize),

    /// Hex encoding should be of an even length.
    #[error("Hex encoding should contain an even number of hex characters")]
    OddNumberOfCharacters,

    /// Invalid hex character.
    #[error("Invalid Id encoding: {0}")]
    InvalidHexCharacter(String),
}

#[cfg(test)]
mod test {
    use super::*;

    const ZERO: &str = "0000000000000000000000000000000000000000";

    #[test]
    fn hex_round_trip() {
        let hex = "5a3ce9c14e7a08645677bbd1cfe7d8f956d53256";
        let id = Id::from_str(hex).unwrap();

        assert_eq!(id.to_string(), hex);

        let random = Id::random();
        assert_eq!(Id::from_str(&random.to_string()).unwrap(), random);
    }

    #[test]
    fn malformed_identifier() {
        assert_eq!(
            Id::from_str("5a3ce9c14e7a0864"),
            Err(DecodeIdError::InvalidIdSize(8))
        );
        assert_eq!(
            Id::from_str("5a3ce9c14e7a08645677bbd1cfe7d8f956d5325"),
            Err(DecodeIdError::OddNumberOfCharacters)
        );
        assert!(matches!(
            Id::from_str("zz3ce9c14e7a08645677bbd1cfe7d8f956d53256"),
            Err(DecodeIdError::InvalidHexCharacter(_))
        ));
        assert!(matches!(
            Id::from_str("5A3CE9C14E7A08645677BBD1CFE7D8F956D53256"),
            Err(DecodeIdError::InvalidHexCharacter(_))
        ));
        assert_eq!(
            Id::from_bytes([0; 21]),
            Err(DecodeIdError::InvalidIdSize(21))
        );
    }

    #[test]
    fn xor_is_symmetric() {
        let a = Id::random();
        let b = Id::random();

        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn xor_self_is_zero_with_max_prefix_len() {
        let a = Id::random();
        let distance = a.xor(&a);

        assert!(distance.is_zero());
        assert_eq!(distance, Id::from_str(ZERO).unwrap());
        assert_eq!(distance.prefix_len(), ID_BITS - 1);
    }

    #[test]
    fn prefix_len() {
        assert_eq!(
            Id::from_str("8000000000000000000000000000000000000000")
                .unwrap()
                .prefix_len(),
            0
        );
        assert_eq!(
            Id::from_str("0100000000000000000000000000000000000000")
                .unwrap()
                .prefix_len(),
            7
        );
        assert_eq!(
            Id::from_str("0000400000000000000000000000000000000000")
                .unwrap()
                .prefix_len(),
            17
        );
        assert_eq!(
            Id::from_str("0000000000000000000000000000000000000002")
                .unwrap()
                .prefix_len(),
            158
        );
        assert_eq!(
            Id::from_str("0000000000000000000000000000000000000001")
                .unwrap()
                .prefix_len(),
            159
        );
    }

    #[test]
    fn prefix_len_grows_with_shared_bits() {
        let a = Id::random();
        let mut previous = None;

        for shared in 0..ID_BITS {
            // Flip the bit right after the shared prefix.
            let mut bytes = *a.as_bytes();
            bytes[shared / 8] ^= 0x80 >> (shared % 8);
            let b = Id::from(bytes);

            let prefix = a.xor(&b).prefix_len();
            assert_eq!(prefix, shared);

            if let Some(previous) = previous {
                assert!(prefix > previous);
            }
            previous = Some(prefix);
        }
    }

    #[test]
    fn xor_ordering_sorts_by_closeness() {
        let target = Id::from_str(ZERO).unwrap();
        let near = Id::from_str("0000000000000000000000000000000000000100").unwrap();
        let far = Id::from_str("0100000000000000000000000000000000000000").unwrap();

        assert!(near.xor(&target) < far.xor(&target));
    }
}
