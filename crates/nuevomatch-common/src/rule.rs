//! Range-match rules
//!
//! A rule matches a packet when every header field falls inside the rule's
//! per-field inclusive range. Rules carry a priority (lower numeric value
//! outranks) and an action; well-formed databases have unique priorities.

use crate::error::{ReadError, ReadResult};
use crate::object_io::{ObjectPacker, ObjectReader};
use crate::types::{ActionOutput, PacketHeader, MAX_FIELDS};

/// Inclusive range over one header field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRange {
    /// Lowest matching value
    pub low: u32,
    /// Highest matching value
    pub high: u32,
}

impl FieldRange {
    /// The range matching any field value
    pub const ANY: FieldRange = FieldRange {
        low: 0,
        high: u32::MAX,
    };

    /// Create a range over `[low, high]`
    pub const fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    /// Create a range matching exactly one value
    pub const fn exact(value: u32) -> Self {
        Self {
            low: value,
            high: value,
        }
    }

    /// Whether `value` falls inside this range
    #[inline(always)]
    pub fn contains(&self, value: u32) -> bool {
        value >= self.low && value <= self.high
    }
}

/// One classification rule: per-field ranges, a priority, and an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    /// Rule priority; smaller numeric value is higher rank
    pub priority: i32,
    /// Action to apply on match
    pub action: i32,
    /// One inclusive range per header field
    pub fields: Vec<FieldRange>,
}

impl MatchRule {
    /// Match this rule against a header
    #[inline]
    pub fn matches(&self, header: &PacketHeader) -> bool {
        for (index, range) in self.fields.iter().enumerate() {
            if !range.contains(header.field(index)) {
                return false;
            }
        }
        true
    }

    /// The classification result this rule produces
    #[inline(always)]
    pub fn output(&self) -> ActionOutput {
        ActionOutput {
            priority: self.priority,
            action: self.action,
        }
    }

    /// Reorder the rule's fields to a new field permutation.
    ///
    /// `permutation[i]` names the original field index that now lives at
    /// header position `i`.
    pub fn rearranged(&self, permutation: &[u32]) -> MatchRule {
        let fields = permutation
            .iter()
            .map(|&original| {
                self.fields
                    .get(original as usize)
                    .copied()
                    .unwrap_or(FieldRange::ANY)
            })
            .collect();
        MatchRule {
            priority: self.priority,
            action: self.action,
            fields,
        }
    }

    /// Read one rule from a packed buffer
    pub fn read_from(reader: &mut ObjectReader<'_>) -> ReadResult<MatchRule> {
        let priority = reader.read_i32()?;
        let action = reader.read_i32()?;
        let num_fields = reader.read_u32()? as usize;
        if num_fields > MAX_FIELDS {
            return Err(ReadError::InvalidValue(format!(
                "rule with {num_fields} fields exceeds the {MAX_FIELDS}-field schema"
            )));
        }
        let mut fields = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            let low = reader.read_u32()?;
            let high = reader.read_u32()?;
            fields.push(FieldRange::new(low, high));
        }
        Ok(MatchRule {
            priority,
            action,
            fields,
        })
    }

    /// Append this rule to a packer
    pub fn write_to(&self, packer: &mut ObjectPacker) {
        packer.push_i32(self.priority);
        packer.push_i32(self.action);
        packer.push_u32(self.fields.len() as u32);
        for range in &self.fields {
            packer.push_u32(range.low);
            packer.push_u32(range.high);
        }
    }
}

/// Read a counted rule list from a packed buffer
pub fn read_rule_list(reader: &mut ObjectReader<'_>) -> ReadResult<Vec<MatchRule>> {
    let count = reader.read_u32()? as usize;
    let mut rules = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        rules.push(MatchRule::read_from(reader)?);
    }
    Ok(rules)
}

/// Append a counted rule list to a packer
pub fn write_rule_list(packer: &mut ObjectPacker, rules: &[MatchRule]) {
    packer.push_u32(rules.len() as u32);
    for rule in rules {
        rule.write_to(packer);
    }
}
