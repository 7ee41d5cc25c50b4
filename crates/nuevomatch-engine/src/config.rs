//! Classifier configuration
//!
//! All options are behavioral and fixed at construction; the configuration is
//! read-only once `load` completes.

use crate::error::ClassifierError;
use crate::remainder::RemainderClassifier;
use std::fmt;
use std::str::FromStr;

/// Which exact classifier to construct when the remainder must be rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemainderType {
    /// Decision-tree style classifier cut on small fields
    #[default]
    CutSplit,
    /// Hash-table classifier keyed by per-field mask tuples
    TupleMerge,
}

impl RemainderType {
    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            RemainderType::CutSplit => "cutsplit",
            RemainderType::TupleMerge => "tuplemerge",
        }
    }
}

impl fmt::Display for RemainderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RemainderType {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cutsplit" => Ok(RemainderType::CutSplit),
            "tuplemerge" => Ok(RemainderType::TupleMerge),
            other => Err(ClassifierError::UnknownRemainderType(other.to_string())),
        }
    }
}

/// Configuration for a NuevoMatch classifier instance
pub struct NuevoMatchConfig<const N: usize = 1> {
    /// Number of worker processing units; unit 0 runs in the caller
    pub num_of_cores: u32,
    /// Bounded queue depth per parallel worker; must be a power of two
    pub queue_size: u32,
    /// Keep only iSet indices below this bound; -1 disables the bound
    pub max_subsets: i32,
    /// Keep only iSet indices at or above this bound
    pub start_from_iset: u32,
    /// Keep only iSets whose field is listed; also permutes field indices
    pub arbitrary_fields: Vec<u32>,
    /// Drop all iSets at load; every rule moves to the remainder
    pub disable_isets: bool,
    /// Skip the remainder classification stage
    pub disable_remainder: bool,
    /// Skip secondary search, validation, and remainder (inference still runs)
    pub disable_bin_search: bool,
    /// Skip the validation stage; remainder still runs
    pub disable_validation_phase: bool,
    /// Always return the no-match sentinel
    pub disable_all_classification: bool,
    /// The supplied remainder is authoritative; never rebuild it
    pub external_remainder: bool,
    /// Unconditionally rebuild the remainder from the rule list
    pub force_rebuilding_remainder: bool,
    /// Classifier type constructed on rebuild
    pub remainder_type: RemainderType,
    /// The remainder classifier instance loads run against
    pub remainder_classifier: Option<Box<dyn RemainderClassifier<N>>>,
}

impl<const N: usize> Default for NuevoMatchConfig<N> {
    fn default() -> Self {
        Self {
            num_of_cores: 1,
            queue_size: 128,
            max_subsets: -1,
            start_from_iset: 0,
            arbitrary_fields: Vec::new(),
            disable_isets: false,
            disable_remainder: false,
            disable_bin_search: false,
            disable_validation_phase: false,
            disable_all_classification: false,
            external_remainder: false,
            force_rebuilding_remainder: false,
            remainder_type: RemainderType::default(),
            remainder_classifier: None,
        }
    }
}

impl<const N: usize> fmt::Debug for NuevoMatchConfig<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NuevoMatchConfig")
            .field("num_of_cores", &self.num_of_cores)
            .field("queue_size", &self.queue_size)
            .field("max_subsets", &self.max_subsets)
            .field("start_from_iset", &self.start_from_iset)
            .field("arbitrary_fields", &self.arbitrary_fields)
            .field("disable_isets", &self.disable_isets)
            .field("disable_remainder", &self.disable_remainder)
            .field("disable_bin_search", &self.disable_bin_search)
            .field("disable_validation_phase", &self.disable_validation_phase)
            .field(
                "disable_all_classification",
                &self.disable_all_classification,
            )
            .field("external_remainder", &self.external_remainder)
            .field(
                "force_rebuilding_remainder",
                &self.force_rebuilding_remainder,
            )
            .field("remainder_type", &self.remainder_type)
            .field(
                "remainder_classifier",
                &self.remainder_classifier.as_ref().map(|r| r.name()),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remainder_type_parsing() {
        assert_eq!(
            "cutsplit".parse::<RemainderType>().unwrap(),
            RemainderType::CutSplit
        );
        assert_eq!(
            "tuplemerge".parse::<RemainderType>().unwrap(),
            RemainderType::TupleMerge
        );
        assert!(matches!(
            "hicuts".parse::<RemainderType>(),
            Err(ClassifierError::UnknownRemainderType(_))
        ));
    }

    #[test]
    fn test_defaults() {
        let config: NuevoMatchConfig<1> = NuevoMatchConfig::default();
        assert_eq!(config.num_of_cores, 1);
        assert_eq!(config.max_subsets, -1);
        assert!(config.queue_size.is_power_of_two());
        assert!(config.remainder_classifier.is_none());
    }
}
