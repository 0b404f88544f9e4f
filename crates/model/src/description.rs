//! Keras-style model description
//!
//! The exporter writes one JSON document holding the layer list of a functional or sequential
//! model together with a flat, ordered list of weight arrays. These types mirror that document;
//! [`crate::Architecture`] turns them into an executable operator list.

use crate::error::{ModelError, ModelResult};
use crate::weights::WeightEntry;
use serde::Deserialize;
use std::path::Path;

/// Root of an exported model document
#[derive(Debug, Clone, Deserialize)]
pub struct ModelDescription {
    /// Layer topology
    pub model: ModelTopology,
    /// Flat weight export, ordered like the layers that own the weights
    #[serde(default)]
    pub weights: Vec<WeightEntry>,
}

/// The `model` section of the document
#[derive(Debug, Clone, Deserialize)]
pub struct ModelTopology {
    /// Keras model class (`Model`, `Functional`, `Sequential`)
    #[serde(default)]
    pub class_name: Option<String>,
    /// Model configuration holding the layer list
    pub config: TopologyConfig,
}

/// Model configuration holding the layer list
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyConfig {
    /// Model name
    #[serde(default)]
    pub name: Option<String>,
    /// Layers in declaration order
    pub layers: Vec<LayerSpec>,
}

/// One declared layer
#[derive(Debug, Clone, Deserialize)]
pub struct LayerSpec {
    /// Layer class such as `Conv2D` or `BatchNormalization`
    pub class_name: String,
    /// Layer name (functional models put it here, sequential ones only in the config)
    #[serde(default)]
    pub name: Option<String>,
    /// Operator-specific configuration
    #[serde(default)]
    pub config: LayerConfig,
    /// Adjacency metadata, `[[["previous_layer", 0, 0, {}], ...], ...]`
    #[serde(default)]
    pub inbound_nodes: Vec<serde_json::Value>,
}

/// Operator-specific layer configuration
///
/// Only the fields the engine understands are read; every field is optional here and checked
/// by the architecture compiler for the layer classes that require it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayerConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub filters: Option<u32>,
    #[serde(default)]
    pub kernel_size: Option<[u32; 2]>,
    #[serde(default)]
    pub strides: Option<[u32; 2]>,
    #[serde(default)]
    pub dilation_rate: Option<[u32; 2]>,
    #[serde(default)]
    pub padding: Option<String>,
    #[serde(default)]
    pub activation: Option<String>,
    #[serde(default)]
    pub use_bias: Option<bool>,
    #[serde(default, alias = "negative_slope")]
    pub alpha: Option<f32>,
    /// Upper clamp of a `ReLU` layer (6 for ReLU6)
    #[serde(default)]
    pub max_value: Option<f32>,
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub size: Option<[u32; 2]>,
    #[serde(default)]
    pub interpolation: Option<String>,
    #[serde(default)]
    pub epsilon: Option<f32>,
    #[serde(default)]
    pub center: Option<bool>,
    #[serde(default)]
    pub scale: Option<bool>,
}

impl ModelDescription {
    /// Parses a model description from its JSON text
    pub fn from_json(json: &str) -> ModelResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a model description file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModelResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }
}

impl LayerSpec {
    /// Layer name, falling back to a generated one for anonymous layers
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .or_else(|| self.config.name.clone())
            .unwrap_or_else(|| format!("{}_{index}", self.class_name.to_lowercase()))
    }

    /// Names of the layers feeding the first inbound node of this layer
    ///
    /// Returns an empty list when the layer carries no adjacency metadata (input layers and
    /// sequential models).
    pub fn inbound_layers(&self, index: usize) -> ModelResult<Vec<String>> {
        let Some(node) = self.inbound_nodes.first() else {
            return Ok(Vec::new());
        };
        let malformed = || ModelError::InvalidInboundNodes { layer: self.display_name(index) };
        node.as_array()
            .ok_or_else(malformed)?
            .iter()
            .map(|reference| {
                reference
                    .as_array()
                    .and_then(|reference| reference.first())
                    .and_then(|name| name.as_str())
                    .map(str::to_string)
                    .ok_or_else(malformed)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = r#"
{
  "model": {
    "class_name": "Model",
    "config": {
      "name": "terrain",
      "layers": [
        { "class_name": "InputLayer", "name": "input_1", "config": { "name": "input_1" }, "inbound_nodes": [] },
        {
          "class_name": "Conv2D",
          "name": "conv2d_1",
          "config": { "name": "conv2d_1", "filters": 4, "kernel_size": [2, 2], "strides": [1, 1], "padding": "same", "activation": "relu" },
          "inbound_nodes": [[["input_1", 0, 0, {}]]]
        },
        {
          "class_name": "LeakyReLU",
          "name": "leaky_re_lu_1",
          "config": { "name": "leaky_re_lu_1", "alpha": 0.2 },
          "inbound_nodes": [[["conv2d_1", 0, 0, {}]]]
        }
      ]
    }
  },
  "weights": [
    { "shape": [1, 1, 3, 4], "kernelweight": [[[[1, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12]]]] },
    { "shape": [4], "arrayweight": [0.5, 0.5, 0.5, 0.5] }
  ]
}
"#;

    #[test]
    fn test_parse_description() {
        let description = ModelDescription::from_json(DESCRIPTION).unwrap();
        assert_eq!(description.model.config.name.as_deref(), Some("terrain"));
        assert_eq!(description.model.config.layers.len(), 3);
        assert_eq!(description.weights.len(), 2);

        let conv = &description.model.config.layers[1];
        assert_eq!(conv.class_name, "Conv2D");
        assert_eq!(conv.config.filters, Some(4));
        assert_eq!(conv.config.kernel_size, Some([2, 2]));
        assert_eq!(conv.config.activation.as_deref(), Some("relu"));

        let leaky = &description.model.config.layers[2];
        assert_eq!(leaky.config.alpha, Some(0.2));
    }

    #[test]
    fn test_inbound_layers() {
        let description = ModelDescription::from_json(DESCRIPTION).unwrap();
        let layers = &description.model.config.layers;
        assert!(layers[0].inbound_layers(0).unwrap().is_empty());
        assert_eq!(layers[1].inbound_layers(1).unwrap(), vec!["input_1".to_string()]);
        assert_eq!(layers[2].inbound_layers(2).unwrap(), vec!["conv2d_1".to_string()]);
    }

    #[test]
    fn test_malformed_inbound_nodes() {
        let layer: LayerSpec = serde_json::from_str(r#"{ "class_name": "ReLU", "name": "r", "inbound_nodes": [[42]] }"#).unwrap();
        assert!(matches!(layer.inbound_layers(0), Err(ModelError::InvalidInboundNodes { .. })));
    }

    #[test]
    fn test_display_name_fallback() {
        let layer: LayerSpec = serde_json::from_str(r#"{ "class_name": "ReLU", "config": {} }"#).unwrap();
        assert_eq!(layer.display_name(3), "relu_3");

        let layer: LayerSpec = serde_json::from_str(r#"{ "class_name": "ReLU", "config": { "name": "act" } }"#).unwrap();
        assert_eq!(layer.display_name(3), "act");
    }

    #[test]
    fn test_negative_slope_alias() {
        let config: LayerConfig = serde_json::from_str(r#"{ "negative_slope": 0.1 }"#).unwrap();
        assert_eq!(config.alpha, Some(0.1));
    }

    #[test]
    fn test_missing_file() {
        let error = ModelDescription::from_file("/nonexistent/model.json").unwrap_err();
        assert!(matches!(error, ModelError::Io { .. }));
    }
}
