//! RQRMI model evaluation
//!
//! An RQRMI model is a small pipeline of piecewise linear stages: stage 0 has
//! a single submodel, every later stage selects one of its submodels from the
//! previous stage's output. The final output is a normalized position in
//! [0, 1] plus a per-submodel worst-case error bound computed at training
//! time. Training happens in the external toolchain; this module only loads
//! and evaluates.

use nuevomatch_common::{ObjectPacker, ObjectReader, ReadError, ReadResult, Scalar};

/// One linear submodel: `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubModel {
    /// Linear coefficient
    pub slope: Scalar,
    /// Constant term
    pub intercept: Scalar,
}

impl SubModel {
    #[inline(always)]
    fn predict(&self, x: Scalar) -> Scalar {
        self.slope * x + self.intercept
    }
}

/// Result of evaluating a model for one input
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelOutput {
    /// Predicted normalized position in [0, 1]
    pub output: Scalar,
    /// Worst-case distance between prediction and true position
    pub error: u32,
    /// Whether the input fell inside the trained key range
    pub valid: bool,
}

/// A loaded RQRMI model
#[derive(Debug, Clone)]
pub struct RqrmiModel {
    stages: Vec<Vec<SubModel>>,
    leaf_errors: Vec<u32>,
    input_min: Scalar,
    input_max: Scalar,
}

impl RqrmiModel {
    /// Build a model from raw parts. The last stage must have one error
    /// bound per submodel.
    pub fn from_parts(
        stages: Vec<Vec<SubModel>>,
        leaf_errors: Vec<u32>,
        input_min: Scalar,
        input_max: Scalar,
    ) -> Self {
        debug_assert!(!stages.is_empty());
        debug_assert_eq!(stages.last().map(Vec::len), Some(leaf_errors.len()));
        Self {
            stages,
            leaf_errors,
            input_min,
            input_max,
        }
    }

    /// Load a model from its packed form
    pub fn load(reader: &mut ObjectReader<'_>) -> ReadResult<Self> {
        let num_stages = reader.read_u32()? as usize;
        if num_stages == 0 {
            return Err(ReadError::InvalidValue("model with zero stages".into()));
        }

        let mut stages = Vec::with_capacity(num_stages);
        for _ in 0..num_stages {
            let width = reader.read_u32()? as usize;
            if width == 0 {
                return Err(ReadError::InvalidValue("model stage with zero width".into()));
            }
            let mut stage = Vec::with_capacity(width);
            for _ in 0..width {
                let slope = reader.read_f32()?;
                let intercept = reader.read_f32()?;
                stage.push(SubModel { slope, intercept });
            }
            stages.push(stage);
        }

        let leaf_count = reader.read_u32()? as usize;
        if leaf_count != stages[num_stages - 1].len() {
            return Err(ReadError::InvalidValue(format!(
                "model declares {} error bounds for {} leaf submodels",
                leaf_count,
                stages[num_stages - 1].len()
            )));
        }
        let mut leaf_errors = Vec::with_capacity(leaf_count);
        for _ in 0..leaf_count {
            leaf_errors.push(reader.read_u32()?);
        }

        let input_min = reader.read_f32()?;
        let input_max = reader.read_f32()?;

        Ok(Self {
            stages,
            leaf_errors,
            input_min,
            input_max,
        })
    }

    /// Append the packed form of this model
    pub fn write_to(&self, packer: &mut ObjectPacker) {
        packer.push_u32(self.stages.len() as u32);
        for stage in &self.stages {
            packer.push_u32(stage.len() as u32);
            for submodel in stage {
                packer.push_f32(submodel.slope);
                packer.push_f32(submodel.intercept);
            }
        }
        packer.push_u32(self.leaf_errors.len() as u32);
        for &error in &self.leaf_errors {
            packer.push_u32(error);
        }
        packer.push_f32(self.input_min);
        packer.push_f32(self.input_max);
    }

    /// Evaluate the model for one input key
    #[inline]
    pub fn evaluate(&self, input: Scalar) -> ModelOutput {
        let valid = input >= self.input_min && input <= self.input_max;

        let span = self.input_max - self.input_min;
        let x = if span > 0.0 {
            ((input - self.input_min) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let mut out = self.stages[0][0].predict(x);
        let mut leaf = 0usize;
        for stage in &self.stages[1..] {
            let width = stage.len();
            leaf = ((out * width as Scalar) as usize).min(width - 1);
            out = stage[leaf].predict(x);
        }

        ModelOutput {
            output: out.clamp(0.0, 1.0),
            error: self.leaf_errors[leaf],
            valid,
        }
    }

    /// Evaluate one batch of optional inputs; empty lanes come back invalid
    #[inline]
    pub fn evaluate_batch<const N: usize>(&self, inputs: &[Option<Scalar>; N]) -> [ModelOutput; N] {
        let mut out = [ModelOutput::default(); N];
        for (lane, input) in inputs.iter().enumerate() {
            if let Some(value) = input {
                out[lane] = self.evaluate(*value);
            }
        }
        out
    }

    /// Worst-case error bound per leaf submodel
    pub fn error_list(&self) -> &[u32] {
        &self.leaf_errors
    }

    /// Mean leaf error bound
    pub fn expected_error(&self) -> f64 {
        if self.leaf_errors.is_empty() {
            return 0.0;
        }
        let total: u64 = self.leaf_errors.iter().map(|&e| e as u64).sum();
        total as f64 / self.leaf_errors.len() as f64
    }

    /// Serialized size of this model in bytes
    pub fn size_bytes(&self) -> u32 {
        let stage_bytes: usize = self.stages.iter().map(|s| 4 + s.len() * 8).sum();
        (4 + stage_bytes + 4 + self.leaf_errors.len() * 4 + 8) as u32
    }
}
