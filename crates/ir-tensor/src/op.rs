use std::fmt;

/// Operator kinds understood by the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Convolution,
    ConvolutionDepthwise,
    Deconvolution,
    DeconvolutionDepthwise,
    Pooling,
    ReLU,
    Softmax,
    MatMul,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpType::Convolution => "Convolution",
            OpType::ConvolutionDepthwise => "ConvolutionDepthwise",
            OpType::Deconvolution => "Deconvolution",
            OpType::DeconvolutionDepthwise => "DeconvolutionDepthwise",
            OpType::Pooling => "Pooling",
            OpType::ReLU => "ReLU",
            OpType::Softmax => "Softmax",
            OpType::MatMul => "MatMul",
        };
        f.write_str(s)
    }
}

/// Padding policy of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadMode {
    /// Explicit `pad_x` / `pad_y` amounts.
    #[default]
    Caffe,
    Valid,
    Same,
}

/// Geometry shared by all convolution flavours.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dCommon {
    pub kernel_x: usize,
    pub kernel_y: usize,
    pub stride_x: usize,
    pub stride_y: usize,
    pub dilate_x: usize,
    pub dilate_y: usize,
    pub pad_x: usize,
    pub pad_y: usize,
    pub pad_mode: PadMode,
    pub group: usize,
    /// Input channels; zero means "derive from the weight length".
    pub input_count: usize,
    pub output_count: usize,
    pub relu: bool,
    pub relu6: bool,
}

impl Default for Conv2dCommon {
    fn default() -> Self {
        Self {
            kernel_x: 1,
            kernel_y: 1,
            stride_x: 1,
            stride_y: 1,
            dilate_x: 1,
            dilate_y: 1,
            pad_x: 0,
            pad_y: 0,
            pad_mode: PadMode::Caffe,
            group: 1,
            input_count: 0,
            output_count: 1,
            relu: false,
            relu6: false,
        }
    }
}

/// Convolution parameter block with its constant data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Conv2dParams {
    pub common: Conv2dCommon,
    pub weight: Vec<f32>,
    pub bias: Option<Vec<f32>>,
    /// Set when weights are stored in a quantized encoding.
    pub quantized: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum OpParams {
    #[default]
    None,
    Conv2d(Conv2dParams),
}

/// One operator node of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    pub name: String,
    pub op_type: OpType,
    pub params: OpParams,
}

impl Op {
    pub fn new(name: impl Into<String>, op_type: OpType, params: OpParams) -> Self {
        Op {
            name: name.into(),
            op_type,
            params,
        }
    }

    pub fn conv2d(name: impl Into<String>, op_type: OpType, params: Conv2dParams) -> Self {
        Op::new(name, op_type, OpParams::Conv2d(params))
    }

    pub fn as_conv2d(&self) -> Option<&Conv2dParams> {
        match &self.params {
            OpParams::Conv2d(p) => Some(p),
            OpParams::None => None,
        }
    }
}
