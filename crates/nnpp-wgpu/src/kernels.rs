//! Kernel registry
//!
//! Every layer kernel is an entry point of one WGSL program. The registry compiles the program
//! once per device and resolves all entry points up front, so a missing kernel is reported when
//! the engine is created rather than in the middle of a frame.

use crate::device::ComputeDevice;
use crate::error::{EngineError, EngineResult};
use nnpp_wgpu_model::Operator;
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Validated and minified layer kernel program
pub const NN_LAYERS_WGSL: &str = include_str!(concat!(env!("OUT_DIR"), "/nn_layers.wgsl"));

/// The layer kernels of the program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    InputLayer,
    Conv2D,
    BatchNormalization,
    ReLU,
    LeakyReLU,
    Tanh,
    UpSampling2D,
    OutputLayer,
}

impl KernelKind {
    pub const ALL: [Self; 8] = [
        Self::InputLayer,
        Self::Conv2D,
        Self::BatchNormalization,
        Self::ReLU,
        Self::LeakyReLU,
        Self::Tanh,
        Self::UpSampling2D,
        Self::OutputLayer,
    ];

    /// Entry point name in the kernel program
    pub fn entry_point(self) -> &'static str {
        match self {
            Self::InputLayer => "InputLayer",
            Self::Conv2D => "Conv2D",
            Self::BatchNormalization => "BatchNormalization",
            Self::ReLU => "ReLU",
            Self::LeakyReLU => "LeakyReLU",
            Self::Tanh => "Tanh",
            Self::UpSampling2D => "UpSampling2D",
            Self::OutputLayer => "OutputLayer",
        }
    }

    /// Kernel executing an operator
    pub fn for_operator(operator: &Operator) -> Self {
        match operator {
            Operator::Input => Self::InputLayer,
            Operator::Conv2D(_) => Self::Conv2D,
            Operator::BatchNorm(_) => Self::BatchNormalization,
            Operator::ReLU => Self::ReLU,
            Operator::LeakyReLU { .. } => Self::LeakyReLU,
            Operator::Tanh => Self::Tanh,
            Operator::UpSampling2D { .. } => Self::UpSampling2D,
            Operator::Output => Self::OutputLayer,
        }
    }
}

impl fmt::Display for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

impl FromStr for KernelKind {
    type Err = EngineError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.entry_point() == name)
            .ok_or_else(|| EngineError::UnknownKernel { name: name.to_string() })
    }
}

/// Kernels of one program, resolved on one device
pub struct KernelRegistry<D: ComputeDevice> {
    /// Indexed by `KernelKind as usize`
    kernels: Vec<D::Kernel>,
}

impl<D: ComputeDevice> KernelRegistry<D> {
    /// Loads the built-in kernel program
    pub fn new(device: &D) -> EngineResult<Self> {
        Self::with_program(device, "nn_layers", NN_LAYERS_WGSL)
    }

    /// Loads a custom kernel program, which must provide every [`KernelKind`] entry point
    ///
    /// # Errors
    /// Returns [`EngineError::MissingKernel`] for the first entry point the program lacks.
    pub fn with_program(device: &D, label: &str, source: &str) -> EngineResult<Self> {
        let program = device.load_program(label, source)?;
        let kernels = KernelKind::ALL
            .into_iter()
            .map(|kind| {
                device.find_kernel(&program, kind.entry_point()).ok_or_else(|| EngineError::MissingKernel {
                    name: kind.entry_point().to_string(),
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;
        info!(program = label, kernels = kernels.len(), "Resolved layer kernels");
        Ok(Self { kernels })
    }

    pub fn kernel(&self, kind: KernelKind) -> &D::Kernel {
        &self.kernels[kind as usize]
    }

    /// Looks a kernel up by its entry point name
    pub fn kernel_by_name(&self, name: &str) -> EngineResult<&D::Kernel> {
        Ok(self.kernel(name.parse()?))
    }
}
