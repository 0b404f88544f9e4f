//! Weight export parsing and GPU buffer layouts
//!
//! The training framework exports one flat, ordered list of arrays. Each operator consumes a fixed
//! number of consecutive entries through a [`WeightCursor`] and turns them into the single flat
//! buffer its compute kernel reads.

use crate::Shape;
use crate::architecture::{BatchNormConfig, Conv2dConfig};
use crate::error::{ModelError, ModelResult};
use serde::Deserialize;

/// Nested 4-D array as exported for convolution kernels `(kH, kW, Cin, Cout)`
pub type KernelArray = Vec<Vec<Vec<Vec<f32>>>>;

/// Values of a weight entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WeightData {
    /// Flat per-channel array (bias, normalization statistics) or pre-flattened tensor
    Flat(Vec<f32>),
    /// Nested 4-D convolution kernel
    Kernel(KernelArray),
}

impl WeightData {
    /// Total number of values
    pub fn len(&self) -> usize {
        match self {
            Self::Flat(values) => values.len(),
            Self::Kernel(kernel) => kernel.iter().flatten().flatten().map(Vec::len).sum(),
        }
    }

    /// Returns true when no values are present
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Deserialize)]
struct RawWeightEntry {
    shape: Vec<usize>,
    #[serde(default)]
    data: Option<WeightData>,
    #[serde(default)]
    kernelweight: Option<KernelArray>,
    #[serde(default)]
    arrayweight: Option<Vec<f32>>,
}

/// One array of the weight export
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawWeightEntry")]
pub struct WeightEntry {
    shape: Vec<usize>,
    data: WeightData,
}

impl TryFrom<RawWeightEntry> for WeightEntry {
    type Error = ModelError;

    fn try_from(raw: RawWeightEntry) -> Result<Self, Self::Error> {
        let expected: usize = raw.shape.iter().product();
        let data = [raw.data, raw.kernelweight.map(WeightData::Kernel), raw.arrayweight.map(WeightData::Flat)]
            .into_iter()
            .flatten()
            .find(|data| !data.is_empty() || expected == 0)
            .ok_or(ModelError::MissingWeightData)?;
        Self::new(raw.shape, data)
    }
}

impl WeightEntry {
    /// Creates a weight entry, checking that the values fill the shape exactly
    ///
    /// Nested kernels must additionally be rank 4 and regular along every axis.
    pub fn new(shape: Vec<usize>, data: WeightData) -> ModelResult<Self> {
        let expected: usize = shape.iter().product();
        let mismatch = || ModelError::WeightDataMismatch {
            shape: shape.clone(),
            expected,
            actual: data.len(),
        };
        if data.len() != expected {
            return Err(mismatch());
        }
        if let WeightData::Kernel(kernel) = &data {
            let regular = shape.len() == 4
                && kernel.len() == shape[0]
                && kernel.iter().all(|rows| {
                    rows.len() == shape[1] && rows.iter().all(|channels| channels.len() == shape[2] && channels.iter().all(|filters| filters.len() == shape[3]))
                });
            if !regular {
                return Err(mismatch());
            }
        }
        Ok(Self { shape, data })
    }

    /// Creates a rank-1 entry from a flat array
    pub fn flat(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            data: WeightData::Flat(values),
        }
    }

    /// Exported shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw values
    pub fn data(&self) -> &WeightData {
        &self.data
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true when the entry holds no values
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Values flattened in row-major order of the exported shape
    pub fn values(&self) -> Vec<f32> {
        match &self.data {
            WeightData::Flat(values) => values.clone(),
            WeightData::Kernel(kernel) => kernel.iter().flatten().flatten().flatten().copied().collect(),
        }
    }
}

/// Positional reader over the flat weight export
///
/// Operators are assigned weights strictly in declaration order; the cursor checks every request
/// against what is left so that a misaligned export fails loudly instead of shifting every
/// following layer's weights.
#[derive(Debug)]
pub struct WeightCursor<'a> {
    entries: &'a [WeightEntry],
    position: usize,
}

impl<'a> WeightCursor<'a> {
    /// Creates a cursor at the start of the export
    pub fn new(entries: &'a [WeightEntry]) -> Self {
        Self { entries, position: 0 }
    }

    /// Takes the next `count` entries for the layer at `layer_index`
    pub fn take(&mut self, layer_index: usize, layer: &str, count: usize) -> ModelResult<&'a [WeightEntry]> {
        let available = self.entries.len() - self.position;
        if count > available {
            return Err(ModelError::WeightCountMismatch {
                layer_index,
                layer: layer.to_string(),
                expected: count,
                available,
            });
        }
        let taken = &self.entries[self.position..self.position + count];
        self.position += count;
        Ok(taken)
    }

    /// Ensures every entry of the export has been consumed
    pub fn finish(self) -> ModelResult<()> {
        if self.position != self.entries.len() {
            return Err(ModelError::UnusedWeights {
                consumed: self.position,
                total: self.entries.len(),
            });
        }
        Ok(())
    }
}

/// Builds the Conv2D weight buffer: the `(kH, kW, Cin, Cout)` kernel in row-major order followed
/// by `Cout` bias values
///
/// # Returns
/// The 4-D weight shape and the flat buffer of `kH * kW * Cin * Cout + Cout` values
pub fn conv2d_layout(layer: &str, config: &Conv2dConfig, entries: &[WeightEntry]) -> ModelResult<(Shape, Vec<f32>)> {
    let mismatch = |reason: String| ModelError::WeightShapeMismatch { layer: layer.to_string(), reason };

    let (kernel, bias) = match entries {
        [kernel] if !config.use_bias => (kernel, None),
        [kernel, bias] if config.use_bias => (kernel, Some(bias)),
        _ => return Err(mismatch(format!("expected {} weight entries, got {}", config.weight_count(), entries.len()))),
    };

    let &[kernel_rows, kernel_cols, channels, filters] = kernel.shape() else {
        return Err(mismatch(format!("kernel must be rank 4, got shape {:?}", kernel.shape())));
    };
    if (kernel_rows as u32, kernel_cols as u32) != config.kernel_size {
        return Err(mismatch(format!("kernel is {kernel_rows}x{kernel_cols}, configuration says {:?}", config.kernel_size)));
    }
    if filters as u32 != config.filters {
        return Err(mismatch(format!("kernel has {filters} filters, configuration says {}", config.filters)));
    }

    let mut weights = kernel.values();
    match bias {
        Some(bias) if bias.len() != filters => return Err(mismatch(format!("bias has {} values for {filters} filters", bias.len()))),
        Some(bias) => weights.extend(bias.values()),
        None => weights.extend(std::iter::repeat_n(0.0, filters)),
    }

    let shape = Shape::new4(kernel_rows as u32, kernel_cols as u32, channels as u32, filters as u32);
    Ok((shape, weights))
}

/// Builds the BatchNorm weight buffer by interleaving the per-channel statistics as
/// `[scale, offset, mean, variance]` with stride 4
///
/// Entries arrive in export order: scale (when `config.scale`), offset (when `config.center`),
/// moving mean, moving variance. Absent scale and offset default to 1 and 0.
pub fn batch_norm_layout(layer: &str, config: &BatchNormConfig, entries: &[WeightEntry]) -> ModelResult<(Shape, Vec<f32>)> {
    let mismatch = |reason: String| ModelError::WeightShapeMismatch { layer: layer.to_string(), reason };
    if entries.len() != config.weight_count() {
        return Err(mismatch(format!("expected {} weight entries, got {}", config.weight_count(), entries.len())));
    }

    let mut arrays = entries.iter().map(WeightEntry::values);
    let scale = if config.scale { arrays.next() } else { None };
    let offset = if config.center { arrays.next() } else { None };
    let (Some(mean), Some(variance)) = (arrays.next(), arrays.next()) else {
        return Err(mismatch("missing moving statistics".to_string()));
    };

    let channels = mean.len();
    for (name, array) in [("scale", scale.as_ref()), ("offset", offset.as_ref()), ("variance", Some(&variance))] {
        if let Some(array) = array
            && array.len() != channels
        {
            return Err(mismatch(format!("{name} has {} values, mean has {channels}", array.len())));
        }
    }

    let mut weights = Vec::with_capacity(channels * 4);
    for i in 0..channels {
        weights.push(scale.as_ref().map_or(1.0, |scale| scale[i]));
        weights.push(offset.as_ref().map_or(0.0, |offset| offset[i]));
        weights.push(mean[i]);
        weights.push(variance[i]);
    }

    Ok((Shape::new4(channels as u32, 0, 0, 0), weights))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv_config(kernel_size: (u32, u32), filters: u32, use_bias: bool) -> Conv2dConfig {
        Conv2dConfig {
            filters,
            kernel_size,
            strides: (1, 1),
            use_bias,
        }
    }

    fn kernel_entry(kh: usize, kw: usize, cin: usize, cout: usize) -> (WeightEntry, Vec<f32>) {
        let mut flat = Vec::new();
        let kernel: KernelArray = (0..kh)
            .map(|i| {
                (0..kw)
                    .map(|j| {
                        (0..cin)
                            .map(|k| {
                                (0..cout)
                                    .map(|w| {
                                        let value = (i * 1000 + j * 100 + k * 10 + w) as f32;
                                        flat.push(value);
                                        value
                                    })
                                    .collect()
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect();
        (WeightEntry::new(vec![kh, kw, cin, cout], WeightData::Kernel(kernel)).unwrap(), flat)
    }

    #[test]
    fn test_conv2d_layout_appends_bias() {
        let (kernel, _) = kernel_entry(2, 2, 3, 4);
        let bias = WeightEntry::flat(vec![-1.0, -2.0, -3.0, -4.0]);
        let (shape, weights) = conv2d_layout("conv", &conv_config((2, 2), 4, true), &[kernel.clone(), bias]).unwrap();

        assert_eq!(shape, Shape::new4(2, 2, 3, 4));
        assert_eq!(weights.len(), 2 * 2 * 3 * 4 + 4);
        assert_eq!(&weights[48..], &[-1.0, -2.0, -3.0, -4.0]);

        // Reconstruct the nested tensor from the flat buffer through the stride multipliers
        let WeightData::Kernel(nested) = kernel.data() else { unreachable!() };
        let [si, sj, sk, sw] = shape.weight_id_multiplier();
        for i in 0..2 {
            for j in 0..2 {
                for k in 0..3 {
                    for w in 0..4 {
                        let index = (i * si + j * sj + k * sk + w * sw) as usize;
                        assert_eq!(weights[index], nested[i as usize][j as usize][k as usize][w as usize]);
                    }
                }
            }
        }
    }

    #[test]
    fn test_conv2d_layout_without_bias() {
        let (kernel, flat) = kernel_entry(1, 1, 2, 3);
        let (_, weights) = conv2d_layout("conv", &conv_config((1, 1), 3, false), &[kernel]).unwrap();
        assert_eq!(&weights[..6], flat.as_slice());
        assert_eq!(&weights[6..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_conv2d_layout_accepts_flat_kernel() {
        let (_, flat) = kernel_entry(2, 2, 3, 4);
        let kernel = WeightEntry::new(vec![2, 2, 3, 4], WeightData::Flat(flat.clone())).unwrap();
        let bias = WeightEntry::flat(vec![0.0; 4]);
        let (_, weights) = conv2d_layout("conv", &conv_config((2, 2), 4, true), &[kernel, bias]).unwrap();
        assert_eq!(&weights[..48], flat.as_slice());
    }

    #[test]
    fn test_conv2d_layout_rejects_mismatches() {
        let (kernel, _) = kernel_entry(2, 2, 3, 4);
        let short_bias = WeightEntry::flat(vec![0.0; 3]);
        let error = conv2d_layout("conv", &conv_config((2, 2), 4, true), &[kernel.clone(), short_bias]).unwrap_err();
        assert!(matches!(error, ModelError::WeightShapeMismatch { .. }));

        let bias = WeightEntry::flat(vec![0.0; 4]);
        let error = conv2d_layout("conv", &conv_config((3, 3), 4, true), &[kernel.clone(), bias.clone()]).unwrap_err();
        assert!(matches!(error, ModelError::WeightShapeMismatch { .. }));

        let error = conv2d_layout("conv", &conv_config((2, 2), 8, true), &[kernel.clone(), bias.clone()]).unwrap_err();
        assert!(matches!(error, ModelError::WeightShapeMismatch { .. }));

        let error = conv2d_layout("conv", &conv_config((2, 2), 4, true), &[bias.clone(), kernel]).unwrap_err();
        assert!(matches!(error, ModelError::WeightShapeMismatch { .. }));
    }

    #[test]
    fn test_batch_norm_interleave() {
        let entries = [
            WeightEntry::flat(vec![1.0, 2.0]),
            WeightEntry::flat(vec![3.0, 4.0]),
            WeightEntry::flat(vec![5.0, 6.0]),
            WeightEntry::flat(vec![7.0, 8.0]),
        ];
        let (shape, weights) = batch_norm_layout("bn", &BatchNormConfig::default(), &entries).unwrap();
        assert_eq!(shape.x, 2);
        assert_eq!(weights, vec![1.0, 3.0, 5.0, 7.0, 2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_batch_norm_without_scale_and_center() {
        let config = BatchNormConfig {
            scale: false,
            center: false,
            ..BatchNormConfig::default()
        };
        let entries = [WeightEntry::flat(vec![5.0, 6.0]), WeightEntry::flat(vec![7.0, 8.0])];
        let (_, weights) = batch_norm_layout("bn", &config, &entries).unwrap();
        assert_eq!(weights, vec![1.0, 0.0, 5.0, 7.0, 1.0, 0.0, 6.0, 8.0]);
    }

    #[test]
    fn test_batch_norm_length_mismatch() {
        let entries = [
            WeightEntry::flat(vec![1.0, 2.0]),
            WeightEntry::flat(vec![3.0]),
            WeightEntry::flat(vec![5.0, 6.0]),
            WeightEntry::flat(vec![7.0, 8.0]),
        ];
        let error = batch_norm_layout("bn", &BatchNormConfig::default(), &entries).unwrap_err();
        assert!(matches!(error, ModelError::WeightShapeMismatch { .. }));
    }

    #[test]
    fn test_cursor_overrun_reports_layer() {
        let entries = [WeightEntry::flat(vec![1.0]), WeightEntry::flat(vec![2.0]), WeightEntry::flat(vec![3.0])];
        let mut cursor = WeightCursor::new(&entries);
        assert_eq!(cursor.take(0, "conv", 2).unwrap().len(), 2);
        match cursor.take(3, "bn", 4) {
            Err(ModelError::WeightCountMismatch {
                layer_index,
                layer,
                expected,
                available,
            }) => {
                assert_eq!(layer_index, 3);
                assert_eq!(layer, "bn");
                assert_eq!(expected, 4);
                assert_eq!(available, 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_cursor_underrun() {
        let entries = [WeightEntry::flat(vec![1.0]), WeightEntry::flat(vec![2.0])];
        let mut cursor = WeightCursor::new(&entries);
        cursor.take(0, "conv", 1).unwrap();
        assert!(matches!(cursor.finish(), Err(ModelError::UnusedWeights { consumed: 1, total: 2 })));

        let mut cursor = WeightCursor::new(&entries);
        cursor.take(0, "conv", 2).unwrap();
        assert!(cursor.finish().is_ok());
    }

    #[test]
    fn test_entry_deserialization() {
        let entry: WeightEntry = serde_json::from_str(r#"{ "shape": [2], "arrayweight": [1.5, 2.5], "kernelweight": null }"#).unwrap();
        assert_eq!(entry.values(), vec![1.5, 2.5]);

        let entry: WeightEntry = serde_json::from_str(r#"{ "shape": [1, 1, 1, 2], "kernelweight": [[[[1, 2]]]], "arrayweight": [] }"#).unwrap();
        assert_eq!(entry.shape(), &[1, 1, 1, 2]);
        assert_eq!(entry.values(), vec![1.0, 2.0]);

        let entry: WeightEntry = serde_json::from_str(r#"{ "shape": [2, 2], "data": [1, 2, 3, 4] }"#).unwrap();
        assert_eq!(entry.len(), 4);
    }

    #[test]
    fn test_entry_rejects_inconsistent_data() {
        assert!(serde_json::from_str::<WeightEntry>(r#"{ "shape": [3], "arrayweight": [1, 2] }"#).is_err());
        assert!(serde_json::from_str::<WeightEntry>(r#"{ "shape": [2] }"#).is_err());
        assert!(WeightEntry::new(vec![1, 2, 1, 1], WeightData::Kernel(vec![vec![vec![vec![1.0, 2.0]]]])).is_err());
    }
}
