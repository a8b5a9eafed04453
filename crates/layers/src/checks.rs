//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape assertions for constructors and forward
//! paths. Every check takes a `label` naming the tensor under test so that
//! errors surfacing from deep inside a network still point at the offending
//! layer. They return `candle_core::Result<()>` so call sites can propagate
//! errors without panicking.

use candle_core::{Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures the tensor has exactly `rank` dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got {:?}",
            dims
        )))
    }
}

/// Validates the `(batch, features)` convention with a known feature width.
pub fn expect_batch_features(label: &str, tensor: &Tensor, features: usize) -> Result<()> {
    match tensor.dims() {
        [batch, actual] if *actual == features && *batch > 0 => Ok(()),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, {features}) layout, got {:?}",
            dims
        ))),
    }
}

/// Validates the `(batch, channels, height, width)` convention with a known
/// channel count.
pub fn expect_nchw(label: &str, tensor: &Tensor, channels: usize) -> Result<()> {
    match tensor.dims() {
        [batch, actual, height, width]
            if *actual == channels && *batch > 0 && *height > 0 && *width > 0 =>
        {
            Ok(())
        }
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, {channels}, height, width) layout, got {:?}",
            dims
        ))),
    }
}
