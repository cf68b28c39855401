//! Kademlia node Id or a lookup target

use std::fmt::{self, Debug, Display, Formatter};
use std::net::SocketAddrV4;
use std::str::FromStr;

use rand::Rng;
use sha1_smol::Sha1;

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 20;
/// The size of node IDs in bits, also the number of routing table buckets.
pub const MAX_DISTANCE: usize = ID_SIZE * 8;

/// Kademlia node Id or a lookup target
#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
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
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// The Id a node with this address operates under, the sha1 digest of the
    /// textual `ip:port` form.
    pub fn from_address(address: &SocketAddrV4) -> Id {
        Id::sha1(address.to_string().as_bytes())
    }

    /// The Id a username's record lives at.
    pub fn from_username(username: &str) -> Id {
        Id::sha1(username.as_bytes())
    }

    /// XOR distance between this Id and a target.
    ///
    /// Distance to self is all zeros, and [Ord] on the result compares
    /// distances as 160 bit unsigned integers.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Id(result)
    }

    /// The number of leading bits shared between this Id and `other`.
    ///
    /// Ranges from 0 (first bits differ) to [MAX_DISTANCE] (same Id), and
    /// indexes the routing table bucket a node belongs in.
    pub fn shared_prefix_length(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // matching bits so far + leading matching bits of this byte
                return i * 8 + (a ^ b).leading_zeros() as usize;
            }
        }

        MAX_DISTANCE
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn sha1(bytes: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(bytes);

        Id(hasher.digest().bytes())
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = DecodeIdError;

    fn from_str(s: &str) -> Result<Id, DecodeIdError> {
        if !s.is_ascii() {
            return Err(DecodeIdError::InvalidHex);
        }
        if s.len() != ID_SIZE * 2 {
            return Err(DecodeIdError::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DecodeIdError::InvalidHex)?;
        }

        Ok(Id(bytes))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeIdError {
    /// Ids are expected to be 20 bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),
    #[error("Invalid hex character in Id")]
    InvalidHex,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_string() {
        let str = "0639a1e24fa732dcfa699aed80b17ea53bd5b768";
        let id: Id = str.parse().unwrap();

        assert_eq!(id.to_string(), str);
    }

    #[test]
    fn from_string_rejects_bad_input() {
        assert!(Id::from_str("0639a1").is_err());
        assert!(Id::from_str("zz39a1e24fa732dcfa699aed80b17ea53bd5b768").is_err());
        assert!(Id::from_str("ΧΧ39a1e24fa732dcfa699aed80b17ea53bd5b768").is_err());
    }

    #[test]
    fn xor_with_self_is_zero() {
        let id = Id::random();

        assert_eq!(id.xor(&id), Id([0_u8; ID_SIZE]));
    }

    #[test]
    fn xor_is_symmetric() {
        let a = Id::random();
        let b = Id::random();

        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn differing_first_bit_maximizes_distance() {
        let a = Id([0_u8; ID_SIZE]);
        let mut far = [0_u8; ID_SIZE];
        far[0] = 0b1000_0000;
        let b = Id(far);

        assert_eq!(a.shared_prefix_length(&b), 0);

        // any Id sharing the first bit with `a` is closer to it than `b`
        for _ in 0..20 {
            let mut near = Id::random();
            near.0[0] &= 0b0111_1111;
            assert!(a.xor(&near) < a.xor(&b));
        }
    }

    #[test]
    fn shared_prefix_length_of_self_is_max() {
        let id = Id::random();

        assert_eq!(id.shared_prefix_length(&id), MAX_DISTANCE);
    }

    #[test]
    fn shared_prefix_length_counts_bits() {
        let a = Id([0_u8; ID_SIZE]);

        let mut bytes = [0_u8; ID_SIZE];
        bytes[1] = 0b0001_0000;
        assert_eq!(a.shared_prefix_length(&Id(bytes)), 11);

        let mut bytes = [0_u8; ID_SIZE];
        bytes[19] = 0b0000_0001;
        assert_eq!(a.shared_prefix_length(&Id(bytes)), 159);
    }

    #[test]
    fn longer_shared_prefix_is_strictly_closer() {
        let target = Id::random();

        for _ in 0..100 {
            let a = Id::random();
            let b = Id::random();

            let prefix_a = target.shared_prefix_length(&a);
            let prefix_b = target.shared_prefix_length(&b);

            if prefix_a > prefix_b {
                assert!(target.xor(&a) < target.xor(&b));
            } else if prefix_b > prefix_a {
                assert!(target.xor(&b) < target.xor(&a));
            }
        }
    }

    #[test]
    fn address_hashing_is_deterministic() {
        let address = SocketAddrV4::new([127, 0, 0, 1].into(), 6881);

        assert_eq!(Id::from_address(&address), Id::from_address(&address));
        assert_ne!(
            Id::from_address(&address),
            Id::from_address(&SocketAddrV4::new([127, 0, 0, 1].into(), 6882))
        );
    }

    #[test]
    fn username_hashing_is_deterministic() {
        assert_eq!(Id::from_username("alice"), Id::from_username("alice"));
        assert_ne!(Id::from_username("alice"), Id::from_username("bob"));
    }
}
