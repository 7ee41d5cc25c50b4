//! Packet headers, batches, and classification results
//!
//! All hot-path types are `Copy` and fixed-width so batches can move through
//! worker queues without touching the allocator.

/// Scalar type shared between the learned models and the interval indices.
///
/// The index boundary keys and the model outputs must use the same float
/// width, otherwise the integer positions derived from a prediction disagree
/// with the positions the index was packed with.
pub type Scalar = f32;

/// Maximum number of header fields a classifier can match on
pub const MAX_FIELDS: usize = 8;

/// A parsed packet header: a fixed-width tuple of unsigned 32-bit fields.
///
/// The field schema (how many fields are live and what they mean) is fixed by
/// the loaded classifier; unused trailing slots are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C, align(32))]
pub struct PacketHeader {
    fields: [u32; MAX_FIELDS],
}

impl PacketHeader {
    /// Create a header from up to [`MAX_FIELDS`] field values
    #[inline(always)]
    pub fn new(values: &[u32]) -> Self {
        let mut fields = [0u32; MAX_FIELDS];
        let n = values.len().min(MAX_FIELDS);
        fields[..n].copy_from_slice(&values[..n]);
        Self { fields }
    }

    /// Create a classic 5-tuple header (src, dst, sport, dport, proto)
    #[inline(always)]
    pub const fn five_tuple(
        src_ip: u32,
        dst_ip: u32,
        src_port: u32,
        dst_port: u32,
        protocol: u32,
    ) -> Self {
        Self {
            fields: [src_ip, dst_ip, src_port, dst_port, protocol, 0, 0, 0],
        }
    }

    /// Get a single field value
    #[inline(always)]
    pub fn field(&self, index: usize) -> u32 {
        self.fields[index]
    }

    /// All field slots, including unused trailing zeros
    #[inline(always)]
    pub fn as_slice(&self) -> &[u32] {
        &self.fields
    }
}

/// Result of classifying one packet.
///
/// Both fields carry the winning rule's values; the all-minus-one sentinel
/// means no rule matched. Smaller numeric `priority` outranks larger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ActionOutput {
    /// Priority of the matched rule (lower value = higher rank)
    pub priority: i32,
    /// Action of the matched rule
    pub action: i32,
}

impl ActionOutput {
    /// The "no match" sentinel
    pub const NO_MATCH: ActionOutput = ActionOutput {
        priority: -1,
        action: -1,
    };

    /// Whether this output carries a concrete match
    #[inline(always)]
    pub fn is_match(&self) -> bool {
        *self != Self::NO_MATCH
    }

    /// Whether `other` outranks this output.
    ///
    /// Priorities compare as unsigned so the -1 sentinel loses to every
    /// concrete rule.
    #[inline(always)]
    pub fn outranked_by(&self, other: &ActionOutput) -> bool {
        (other.priority as u32) < (self.priority as u32)
    }
}

impl Default for ActionOutput {
    fn default() -> Self {
        Self::NO_MATCH
    }
}

/// A batch of `N` packet header slots; `None` marks an empty lane
pub type PacketBatch<const N: usize> = [Option<PacketHeader>; N];

/// A batch of `N` classification results
pub type ActionBatch<const N: usize> = [ActionOutput; N];

/// An all-sentinel action batch
#[inline(always)]
pub fn empty_action_batch<const N: usize>() -> ActionBatch<N> {
    [ActionOutput::NO_MATCH; N]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields() {
        let h = PacketHeader::new(&[1, 2, 3]);
        assert_eq!(h.field(0), 1);
        assert_eq!(h.field(2), 3);
        assert_eq!(h.field(5), 0);

        let t = PacketHeader::five_tuple(10, 20, 30, 40, 6);
        assert_eq!(t.field(4), 6);
    }

    #[test]
    fn test_no_match_sentinel() {
        let out = ActionOutput::default();
        assert!(!out.is_match());

        let hit = ActionOutput {
            priority: 7,
            action: 7,
        };
        assert!(hit.is_match());
        assert!(out.outranked_by(&hit));
        assert!(!hit.outranked_by(&out));
    }

    #[test]
    fn test_rank_is_unsigned() {
        // A concrete rule always outranks the sentinel, even though -1 < 0
        // under signed comparison.
        let sentinel = ActionOutput::NO_MATCH;
        let worst = ActionOutput {
            priority: i32::MAX,
            action: 0,
        };
        assert!(sentinel.outranked_by(&worst));
    }
}
