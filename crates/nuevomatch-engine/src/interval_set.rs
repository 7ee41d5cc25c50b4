//! Interval sets
//!
//! An iSet covers a subset of rules whose intervals on one header field are
//! mutually non-overlapping. It owns a sorted boundary array (`size + 1`
//! keys, the last one a sentinel upper bound), one validation rule slot per
//! interval, and the RQRMI model predicting a boundary position for a key.

use crate::model::{ModelOutput, RqrmiModel};
use nuevomatch_common::{
    ActionOutput, MatchRule, ObjectReader, PacketBatch, PacketHeader, ReadError, ReadResult, Scalar,
};

/// Per-packet output of the model inference stage for one iSet
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalSetInfo {
    /// The field value the model was evaluated on
    pub rqrmi_input: Scalar,
    /// Predicted normalized position in [0, 1]
    pub rqrmi_output: Scalar,
    /// Worst-case error bound around the predicted position
    pub rqrmi_error: u32,
    /// Whether the input fell inside the model's trained range
    pub valid: bool,
}

/// Inference results for a whole batch
pub type IntervalSetInfoBatch<const N: usize> = [IntervalSetInfo; N];

/// A learned-index-backed lookup over one header field
#[derive(Debug, Clone)]
pub struct IntervalSet {
    iset_index: u32,
    field_index: u32,
    /// `size + 1` non-decreasing boundary keys
    index: Vec<Scalar>,
    /// One validation slot per interval
    rules: Vec<Option<MatchRule>>,
    model: RqrmiModel,
    size_bytes: u32,
}

impl IntervalSet {
    /// Load an iSet from its packed sub-object
    pub fn load(iset_index: u32, reader: &mut ObjectReader<'_>) -> ReadResult<Self> {
        let size_bytes = reader.size() as u32;

        let field_index = reader.read_u32()?;
        let size = reader.read_u32()? as usize;

        let mut index = Vec::with_capacity(size + 1);
        for _ in 0..size + 1 {
            index.push(reader.read_f32()?);
        }
        if index.windows(2).any(|w| w[0] > w[1]) {
            return Err(ReadError::InvalidValue(format!(
                "iSet {iset_index} boundary keys are not sorted"
            )));
        }

        let mut rules = Vec::with_capacity(size);
        for _ in 0..size {
            let present = reader.read_u8()?;
            if present != 0 {
                rules.push(Some(MatchRule::read_from(reader)?));
            } else {
                rules.push(None);
            }
        }

        let mut model_reader = reader.sub_reader()?;
        let model = RqrmiModel::load(&mut model_reader)?;

        Ok(Self {
            iset_index,
            field_index,
            index,
            rules,
            model,
            size_bytes,
        })
    }

    /// Position of this iSet in the container
    pub fn iset_index(&self) -> u32 {
        self.iset_index
    }

    /// Header field this iSet matches on
    pub fn field_index(&self) -> u32 {
        self.field_index
    }

    /// Number of stored intervals
    #[inline(always)]
    pub fn size(&self) -> u32 {
        self.rules.len() as u32
    }

    /// Serialized size of this iSet in bytes
    pub fn size_bytes(&self) -> u32 {
        self.size_bytes
    }

    /// Number of rules validated by this iSet
    pub fn num_rules(&self) -> u32 {
        self.rules.iter().filter(|r| r.is_some()).count() as u32
    }

    /// Boundary key at `pos`, clamped to the sentinel upper bound.
    ///
    /// The secondary search probes `pos + 1` for positions derived from an
    /// unclamped model prediction, so reads past the end must stay safe.
    #[inline(always)]
    pub fn get_index(&self, pos: u32) -> Scalar {
        self.index[(pos as usize).min(self.index.len() - 1)]
    }

    /// Run model inference for every occupied lane of a batch
    pub fn rqrmi_search<const N: usize>(
        &self,
        packets: &PacketBatch<N>,
    ) -> IntervalSetInfoBatch<N> {
        let mut info = [IntervalSetInfo::default(); N];
        for (lane, packet) in packets.iter().enumerate() {
            if let Some(header) = packet {
                let input = header.field(self.field_index as usize) as Scalar;
                let ModelOutput {
                    output,
                    error,
                    valid,
                } = self.model.evaluate(input);
                info[lane] = IntervalSetInfo {
                    rqrmi_input: input,
                    rqrmi_output: output,
                    rqrmi_error: error,
                    valid,
                };
            }
        }
        info
    }

    /// Check whether the rule stored at `pos` matches the full header
    #[inline]
    pub fn do_validation(&self, header: &PacketHeader, pos: u32) -> ActionOutput {
        match self.rules.get(pos as usize) {
            Some(Some(rule)) if rule.matches(header) => rule.output(),
            _ => ActionOutput::NO_MATCH,
        }
    }

    /// Clone out every rule this iSet validates
    pub fn extract_rules(&self) -> Vec<MatchRule> {
        self.rules.iter().flatten().cloned().collect()
    }

    /// Remap this iSet onto a reordered field schema.
    ///
    /// `fields[i]` names the original field index that now lives at header
    /// position `i`. The iSet's own field index and every validation rule
    /// are rewritten to the new ordering.
    pub fn rearrange_field_indices(&mut self, fields: &[u32]) {
        if let Some(new_index) = fields.iter().position(|&f| f == self.field_index) {
            self.field_index = new_index as u32;
        }
        for slot in &mut self.rules {
            if let Some(rule) = slot {
                *rule = rule.rearranged(fields);
            }
        }
    }

    /// Worst-case model error per leaf submodel
    pub fn error_list(&self) -> &[u32] {
        self.model.error_list()
    }

    /// Mean model error bound
    pub fn expected_error(&self) -> f64 {
        self.model.expected_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubModel;
    use nuevomatch_common::{FieldRange, ObjectPacker};

    /// Pack an iSet whose intervals start at the given boundaries, with one
    /// exact-match rule per interval and an identity linear model.
    fn pack_iset(field_index: u32, boundaries: &[u32], error: u32) -> Vec<u8> {
        let size = boundaries.len() - 1;
        let mut packer = ObjectPacker::new();
        packer.push_u32(field_index);
        packer.push_u32(size as u32);
        for &b in boundaries {
            packer.push_f32(b as Scalar);
        }
        for i in 0..size {
            packer.push_u8(1);
            let rule = MatchRule {
                priority: i as i32,
                action: i as i32,
                fields: vec![
                    FieldRange::ANY,
                    FieldRange::new(boundaries[i], boundaries[i + 1] - 1),
                ],
            };
            rule.write_to(&mut packer);
        }

        let model = RqrmiModel::from_parts(
            vec![vec![SubModel {
                slope: 1.0,
                intercept: 0.0,
            }]],
            vec![error],
            boundaries[0] as Scalar,
            *boundaries.last().unwrap() as Scalar,
        );
        let mut model_packer = ObjectPacker::new();
        model.write_to(&mut model_packer);
        packer.push_object(&model_packer);

        packer.into_bytes()
    }

    #[test]
    fn test_load_and_probe() {
        let bytes = pack_iset(1, &[0, 100, 200, 300, 400], 2);
        let mut reader = ObjectReader::new(&bytes);
        let iset = IntervalSet::load(0, &mut reader).unwrap();

        assert_eq!(iset.size(), 4);
        assert_eq!(iset.field_index(), 1);
        assert_eq!(iset.num_rules(), 4);
        assert_eq!(iset.get_index(0), 0.0);
        assert_eq!(iset.get_index(4), 400.0);
        // Past-the-end probes clamp to the sentinel
        assert_eq!(iset.get_index(99), 400.0);
    }

    #[test]
    fn test_unsorted_index_rejected() {
        let bytes = pack_iset(0, &[0, 100, 50, 300], 1);
        let mut reader = ObjectReader::new(&bytes);
        assert!(matches!(
            IntervalSet::load(0, &mut reader),
            Err(ReadError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_validation_checks_full_header() {
        let bytes = pack_iset(1, &[0, 100, 200], 1);
        let mut reader = ObjectReader::new(&bytes);
        let iset = IntervalSet::load(0, &mut reader).unwrap();

        // Field 1 inside interval 1
        let hit = iset.do_validation(&PacketHeader::new(&[9, 150]), 1);
        assert_eq!(hit.priority, 1);

        // Right interval position, but the header's field lies outside
        let miss = iset.do_validation(&PacketHeader::new(&[9, 500]), 1);
        assert!(!miss.is_match());

        // Out-of-range position
        let oob = iset.do_validation(&PacketHeader::new(&[9, 150]), 42);
        assert!(!oob.is_match());
    }

    #[test]
    fn test_rqrmi_search_echoes_input() {
        let bytes = pack_iset(0, &[0, 100, 200], 3);
        let mut reader = ObjectReader::new(&bytes);
        let iset = IntervalSet::load(0, &mut reader).unwrap();

        let batch: PacketBatch<2> = [Some(PacketHeader::new(&[150])), None];
        let info = iset.rqrmi_search(&batch);

        assert_eq!(info[0].rqrmi_input, 150.0);
        assert_eq!(info[0].rqrmi_error, 3);
        assert!(info[0].valid);
        assert!(!info[1].valid);
    }

    #[test]
    fn test_extract_and_rearrange() {
        let bytes = pack_iset(1, &[0, 100, 200], 1);
        let mut reader = ObjectReader::new(&bytes);
        let mut iset = IntervalSet::load(0, &mut reader).unwrap();

        assert_eq!(iset.extract_rules().len(), 2);

        // New schema keeps only the original field 1, now at position 0
        iset.rearrange_field_indices(&[1]);
        assert_eq!(iset.field_index(), 0);
        let hit = iset.do_validation(&PacketHeader::new(&[150]), 1);
        assert_eq!(hit.priority, 1);
    }
}
