//! One-shot execution helpers
//!
//! [`execute`] wraps the create / bind / run / collect cycle of a [`Session`]
//! for callers working with plain `f32` buffers, and [`classify`] turns a
//! classifier's output into ranked predictions.

use crate::error::{Error, Result};
use crate::loader::Engine;
use crate::tensor::{DataType, HostTensor};
use serde::{Deserialize, Serialize};

/// Input descriptor for execution
#[derive(Debug, Clone)]
pub struct TensorInput {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Output descriptor from execution
#[derive(Debug, Clone)]
pub struct TensorOutput {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Run `engine` once with `inputs` and return every output, in engine order
///
/// Every input binding must be supplied; all bindings must be `float32`.
pub fn execute(engine: &Engine, inputs: &[TensorInput]) -> Result<Vec<TensorOutput>> {
    let mut session = engine.create_session()?;

    for input in inputs {
        let tensor = HostTensor::from_f32(input.shape.clone(), &input.data)?;
        session.bind(&input.name, tensor)?;
    }
    session.run()?;

    let outputs = engine
        .outputs()
        .map(|spec| {
            let tensor = session.take_output(&spec.name)?;
            Ok(TensorOutput {
                name: spec.name.clone(),
                shape: spec.shape.clone(),
                data: tensor.to_f32_vec()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    session.destroy()?;
    Ok(outputs)
}

/// Run `engine` with every `float32` input zero-filled
pub fn execute_zeroed(engine: &Engine) -> Result<Vec<TensorOutput>> {
    let inputs = engine
        .inputs()
        .map(|spec| {
            if spec.dtype != DataType::Float32 {
                return Err(Error::InvalidArgument(format!(
                    "input `{}` is {}, only float32 inputs can be zero-filled",
                    spec.name, spec.dtype
                )));
            }
            Ok(TensorInput {
                name: spec.name.clone(),
                shape: spec.shape.clone(),
                data: vec![0.0; spec.element_count()],
            })
        })
        .collect::<Result<Vec<_>>>()?;

    execute(engine, &inputs)
}

/// One ranked class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub index: usize,
    pub probability: f32,
}

/// Rank the classes of each batch row of a `float32` output
///
/// The first dimension is the batch when the tensor has more than one
/// dimension. Each row is sorted by descending probability, ties keeping
/// class order, and cut to `top_k` entries.
pub fn classify(output: &HostTensor, top_k: usize) -> Result<Vec<Vec<Prediction>>> {
    let values = output.to_f32_vec()?;
    let batch = match output.shape() {
        [] => 1,
        [_] => 1,
        [batch, ..] => *batch,
    };
    if batch == 0 || values.is_empty() {
        return Ok(Vec::new());
    }
    let classes = values.len() / batch;

    Ok(values
        .chunks(classes)
        .map(|row| {
            let mut ranked: Vec<Prediction> = row
                .iter()
                .enumerate()
                .map(|(index, &probability)| Prediction { index, probability })
                .collect();
            ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));
            ranked.truncate(top_k);
            ranked
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ranks_each_row() {
        let output =
            HostTensor::from_f32(vec![2, 3], &[0.1, 0.7, 0.2, 0.5, 0.5, 0.0]).unwrap();
        let rows = classify(&output, 2).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Prediction { index: 1, probability: 0.7 });
        assert_eq!(rows[0][1].index, 2);
        // Ties keep class order
        assert_eq!(rows[1][0].index, 0);
        assert_eq!(rows[1][1].index, 1);
    }

    #[test]
    fn test_classify_flat_output() {
        let output = HostTensor::from_f32(vec![4], &[0.0, 0.3, 0.6, 0.1]).unwrap();
        let rows = classify(&output, usize::MAX).unwrap();
        assert_eq!(rows.len(), 1);
        let order: Vec<usize> = rows[0].iter().map(|p| p.index).collect();
        assert_eq!(order, vec![2, 1, 3, 0]);
    }

    #[test]
    fn test_classify_rejects_integer_output() {
        let output = HostTensor::from_i32(vec![1, 2], &[1, 2]).unwrap();
        assert!(classify(&output, 1).is_err());
    }

    #[test]
    fn test_prediction_json() {
        let json = serde_json::to_string(&Prediction {
            index: 3,
            probability: 0.5,
        })
        .unwrap();
        assert_eq!(json, r#"{"index":3,"probability":0.5}"#);
    }
}
