use super::ExpertWeightProvider;
use crate::error::{MoEError, Result};

/// Parameter-free expert that returns its input.
///
/// Useful for exercising the dispatch path without a weight archive; with the
/// blend in [`crate::moe::combine`] the layer output then equals its input.
#[derive(Debug, Clone)]
pub struct IdentityExpert {
    embedding_size: usize,
}

impl IdentityExpert {
    pub fn new(embedding_size: usize) -> Self {
        Self { embedding_size }
    }
}

impl ExpertWeightProvider for IdentityExpert {
    fn weight_size(&self) -> usize {
        0
    }

    fn working_size(&self, _token_count: usize) -> usize {
        0
    }

    fn load_weights(&self, _target: &mut [u8], _expert_id: usize) -> Result<()> {
        Ok(())
    }

    fn compute(
        &self,
        token_count: usize,
        _weights: &[u8],
        input: &[f32],
        output: &mut [f32],
        _working: &mut [u8],
    ) -> Result<()> {
        let expected = token_count * self.embedding_size;
        if input.len() != expected || output.len() != expected {
            return Err(MoEError::data(format!(
                "identity expert expected {expected} values, got {}/{}",
                input.len(),
                output.len()
            )));
        }
        output.copy_from_slice(input);
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn terminate(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_input() {
        let expert = IdentityExpert::new(2);
        let mut out = [0f32; 4];
        expert
            .compute(2, &[], &[1.0, 2.0, 3.0, 4.0], &mut out, &mut [])
            .unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn rejects_short_buffers() {
        let expert = IdentityExpert::new(2);
        let mut out = [0f32; 2];
        assert!(expert.compute(2, &[], &[1.0, 2.0], &mut out, &mut []).is_err());
    }
}
