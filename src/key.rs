use rand::RngCore;
use std::fmt::{Debug, Formatter, Result};

use crate::KEY_LENGTH;

/// A 512-bit opaque node/key identifier. Distance between two `NodeId`s is
/// bitwise XOR interpreted as an unsigned big-endian integer.
#[derive(Ord, PartialOrd, PartialEq, Eq, Clone, Hash, Serialize, Deserialize, Copy)]
pub struct NodeId(pub [u8; KEY_LENGTH]);

impl Default for NodeId {
    fn default() -> Self {
        NodeId([0; KEY_LENGTH])
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter) -> Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl NodeId {
    pub fn new(data: [u8; KEY_LENGTH]) -> Self {
        NodeId(data)
    }

    pub fn rand() -> Self {
        let mut ret = NodeId([0; KEY_LENGTH]);
        rand::thread_rng().fill_bytes(&mut ret.0);
        ret
    }

    /// Generates a random id in the range covered by bucket `index`, i.e. in
    /// `[2^(KEY_LENGTH*8 - index - 1), 2^(KEY_LENGTH*8 - index))`.
    pub fn rand_in_range(index: usize) -> Self {
        let mut ret = NodeId::rand();
        let bytes = index / 8;
        let bit = index % 8;
        for byte in ret.0.iter_mut().take(bytes) {
            *byte = 0;
        }
        ret.0[bytes] &= 0xFF >> bit;
        ret.0[bytes] |= 1 << (8 - bit - 1);
        ret
    }

    pub fn xor(&self, other: &NodeId) -> NodeId {
        let mut ret = [0; KEY_LENGTH];
        for (i, byte) in ret.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(ret)
    }

    pub fn leading_zeros(&self) -> usize {
        let mut ret = 0;
        for byte in &self.0 {
            if *byte == 0 {
                ret += 8;
            } else {
                return ret + byte.leading_zeros() as usize;
            }
        }
        ret
    }

    /// All-zero key; used as the lower bound of the id space.
    pub fn min() -> Self {
        NodeId([0u8; KEY_LENGTH])
    }

    /// All-`0xff` key; used as the (exclusive) upper bound of the id space.
    pub fn max() -> Self {
        NodeId([0xffu8; KEY_LENGTH])
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != KEY_LENGTH * 2 {
            return None;
        }
        let mut ret = [0u8; KEY_LENGTH];
        for i in 0..KEY_LENGTH {
            ret[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(NodeId(ret))
    }
}

#[cfg(test)]
mod tests {
    extern crate num_bigint;
    use self::num_bigint::BigUint;

    use super::NodeId;
    use crate::KEY_LENGTH;

    #[test]
    fn test_rand_in_range() {
        for i in 0..KEY_LENGTH * 8 {
            let key = BigUint::from_bytes_be(&NodeId::rand_in_range(i).0);
            let mut lower = [0u8; KEY_LENGTH];
            lower[i / 8] = 1 << ((KEY_LENGTH * 8 - i - 1) % 8);
            assert!(BigUint::from_bytes_be(&lower) <= key);
            assert!(key < BigUint::from_bytes_be(&lower) << 1);
        }
    }

    #[test]
    fn test_leading_zeros() {
        for i in 0..KEY_LENGTH * 8 {
            assert_eq!(NodeId::rand_in_range(i).leading_zeros(), i);
        }
    }

    #[test]
    fn test_xor_symmetry() {
        let a = NodeId::rand();
        let b = NodeId::rand();
        assert_eq!(a.xor(&b), b.xor(&a));
        assert_eq!(a.xor(&a), NodeId::min());
    }

    #[test]
    fn test_hex_roundtrip() {
        let a = NodeId::rand();
        assert_eq!(NodeId::from_hex(&a.to_hex()).unwrap(), a);
    }
}
