use ir_tensor::{Conv2dCommon, Conv2dParams, Op, OpType, PadMode, Tensor, TensorError};

use crate::error::{AccelError, Result};
use crate::execution::{ExecutorSlot, SopContext, SopExecution};
use crate::foreign::{
    ActivationType, ConvDescriptor, ConvMode, ConvRequest, DataType, Driver, Executor,
    ForeignTensor, Format, OpDescriptor, Options, SopPadMode, SupportStatus, TensorDesc,
    TensorDescHandle,
};
use crate::memory::{create_tensor_desc, TensorManager};
use crate::registry::AdapterFactory;

fn conv_mode(op_type: OpType) -> ConvMode {
    match op_type {
        OpType::ConvolutionDepthwise => ConvMode::Depthwise,
        OpType::Deconvolution | OpType::DeconvolutionDepthwise => ConvMode::Transposed,
        _ => ConvMode::Common,
    }
}

fn pad_mode(mode: PadMode) -> SopPadMode {
    match mode {
        PadMode::Caffe => SopPadMode::Specific,
        PadMode::Valid => SopPadMode::Valid,
        PadMode::Same => SopPadMode::Same,
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

/// Build a float NCHW constant tensor; the descriptor is released once the
/// driver has its own copy.
fn const_tensor(driver: &Driver, dims: &[i64], values: &[f32]) -> Result<ForeignTensor> {
    let desc = TensorDesc::create(driver, dims, DataType::Float, Format::Nchw, false)?;
    ForeignTensor::from_const(driver, &desc, &f32_bytes(values))
}

/// Uploaded constants and geometry: everything an executor is built from.
#[derive(Debug)]
struct ConvKernel {
    driver: Driver,
    mode: ConvMode,
    common: Conv2dCommon,
    weight: ForeignTensor,
    bias: Option<ForeignTensor>,
}

/// Convolution in all four flavours (plain, depthwise, transposed, transposed depthwise).
#[derive(Debug)]
pub struct SopConvolution {
    name: String,
    kernel: ConvKernel,
    executor: ExecutorSlot,
}

impl SopConvolution {
    /// Upload the weight and bias as driver constants.
    ///
    /// # Errors
    /// Returns an error if the weight does not fit the kernel geometry or the
    /// driver refuses a constant tensor.
    pub fn new(driver: &Driver, op: &Op, params: &Conv2dParams) -> Result<Self> {
        let common = params.common.clone();
        let mode = conv_mode(op.op_type);
        let (oc, kh, kw) = (common.output_count, common.kernel_y, common.kernel_x);
        let per_input = oc * kh * kw;
        if per_input == 0 {
            return Err(TensorError::Other(format!("{}: empty kernel geometry", op.name)).into());
        }
        let ic = if common.input_count == 0 {
            params.weight.len() / per_input
        } else {
            common.input_count
        };
        if ic * per_input != params.weight.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![oc, ic, kh, kw],
                got: vec![params.weight.len()],
            }
            .into());
        }
        let weight_dims = match mode {
            ConvMode::Transposed => [ic, oc, kh, kw],
            _ => [oc, ic, kh, kw],
        }
        .map(|d| d as i64);
        let weight = const_tensor(driver, &weight_dims, &params.weight)?;
        let bias = match &params.bias {
            Some(b) => Some(const_tensor(driver, &[oc as i64], b)?),
            None => None,
        };
        log::debug!("{}: weight {:?} uploaded, mode {:?}", op.name, weight_dims, mode);
        Ok(SopConvolution {
            name: op.name.clone(),
            kernel: ConvKernel {
                driver: driver.clone(),
                mode,
                common,
                weight,
                bias,
            },
            executor: ExecutorSlot::new(),
        })
    }

    pub fn mode(&self) -> ConvMode {
        self.kernel.mode
    }

    pub fn conv_descriptor(&self) -> ConvDescriptor {
        self.kernel.conv_descriptor()
    }

    /// Fused activation, if any.
    pub fn activation(&self) -> Option<ActivationType> {
        self.kernel.activation()
    }

    fn check_arity(&self, inputs: usize, outputs: usize) -> Result<()> {
        if inputs == 1 && outputs == 1 {
            return Ok(());
        }
        log::error!("{}: invalid input/output count {}/{}", self.name, inputs, outputs);
        Err(AccelError::ArityMismatch {
            op: self.name.clone(),
            expected_inputs: 1,
            expected_outputs: 1,
            inputs,
            outputs,
        })
    }
}

impl ConvKernel {
    fn conv_descriptor(&self) -> ConvDescriptor {
        let c = &self.common;
        let (pad_y, pad_x) = (c.pad_y as i64, c.pad_x as i64);
        ConvDescriptor {
            mode: self.mode,
            strides: [c.stride_y as i64, c.stride_x as i64],
            dilations: [c.dilate_y as i64, c.dilate_x as i64],
            pads: [pad_y, pad_y, pad_x, pad_x],
            groups: c.group as i64,
            pad_mode: pad_mode(c.pad_mode),
        }
    }

    fn activation(&self) -> Option<ActivationType> {
        if self.common.relu {
            Some(ActivationType::Relu)
        } else if self.common.relu6 {
            Some(ActivationType::Relu6)
        } else {
            None
        }
    }

    fn request(
        &self,
        options: &Options,
        conv: &OpDescriptor,
        input: TensorDescHandle,
        output: TensorDescHandle,
    ) -> ConvRequest {
        ConvRequest {
            options: options.handle(),
            conv: conv.handle(),
            input,
            output,
            filter: self.weight.handle(),
            bias: self.bias.as_ref().map(ForeignTensor::handle),
        }
    }

    fn try_precheck(&self, input: &Tensor, output: &Tensor) -> Result<SupportStatus> {
        let input_desc = create_tensor_desc(&self.driver, input, false)?;
        let output_desc = create_tensor_desc(&self.driver, output, false)?;
        let options = Options::create(&self.driver)?;
        let conv = OpDescriptor::convolution(&self.driver, &self.conv_descriptor())?;
        let request = self.request(&options, &conv, input_desc.handle(), output_desc.handle());
        let status = match self.activation() {
            Some(act) => {
                let act = OpDescriptor::activation(&self.driver, act, 0.0)?;
                self.driver
                    .precheck_fused_convolution_activation(&request, act.handle())
            }
            None => self.driver.precheck_convolution(&request),
        };
        Ok(status)
    }

    fn create_executor(
        &self,
        input: TensorDescHandle,
        output: TensorDescHandle,
    ) -> Result<Executor> {
        let options = Options::create(&self.driver)?;
        let conv = OpDescriptor::convolution(&self.driver, &self.conv_descriptor())?;
        let request = self.request(&options, &conv, input, output);
        let handle = match self.activation() {
            Some(act) => {
                let act = OpDescriptor::activation(&self.driver, act, 0.0)?;
                self.driver
                    .executor_create_fused_convolution_activation(&request, act.handle())
                    .ok_or(AccelError::ForeignCall(
                        "SingleOpExecutor_CreateFusedConvolutionActivation",
                    ))?
            }
            None => self
                .driver
                .executor_create_convolution(&request)
                .ok_or(AccelError::ForeignCall("SingleOpExecutor_CreateConvolution"))?,
        };
        Ok(Executor::from_handle(&self.driver, handle))
    }
}

impl SopExecution for SopConvolution {
    fn name(&self) -> &str {
        &self.name
    }

    fn precheck(&self, inputs: &[&Tensor], outputs: &[&Tensor]) -> SupportStatus {
        if inputs.len() != 1 || outputs.len() != 1 {
            return SupportStatus::Unsupported;
        }
        match self.kernel.try_precheck(inputs[0], outputs[0]) {
            Ok(status) => status,
            Err(e) => {
                log::debug!("{}: precheck could not be run: {}", self.name, e);
                SupportStatus::Unsupported
            }
        }
    }

    fn resize(
        &mut self,
        ctx: &mut SopContext<'_>,
        inputs: &[&Tensor],
        outputs: &mut [&mut Tensor],
    ) -> Result<()> {
        self.check_arity(inputs.len(), outputs.len())?;
        let input_desc = ctx.tensor_desc(inputs[0])?;
        let output_desc = ctx.tensor_desc(outputs[0])?;

        let kernel = &self.kernel;
        let exec = self
            .executor
            .replace_with(|| kernel.create_executor(input_desc, output_desc))
            .map_err(|e| {
                log::error!("{}: creating executor failed: {}", self.name, e);
                e
            })?;

        if ctx.driver().tensor_desc_format(output_desc) == Format::Reserved {
            exec.update_output_desc(0, output_desc)?;
            ctx.reallocate(&mut *outputs[0]).map_err(|e| {
                log::error!("{}: updating output failed: {}", self.name, e);
                e
            })?;
        }
        ctx.update_workspace_size(exec.workspace_size());
        Ok(())
    }

    fn executor(&self) -> Option<&Executor> {
        self.executor.get()
    }

    fn execute(
        &mut self,
        tensors: &TensorManager,
        inputs: &[&Tensor],
        outputs: &[&Tensor],
    ) -> Result<()> {
        self.check_arity(inputs.len(), outputs.len())?;
        let exec = self
            .executor
            .get()
            .ok_or_else(|| AccelError::ExecutorMissing(self.name.clone()))?;
        let sop_inputs = [tensors.foreign_tensor(inputs[0].id())?];
        let sop_outputs = [tensors.foreign_tensor(outputs[0].id())?];
        exec.execute(&sop_inputs, &sop_outputs).map_err(|e| {
            log::error!("execute [{}] failed: {}", self.name, e);
            e
        })
    }
}

/// Creates [`SopConvolution`] for the convolution op types.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvolutionFactory;

impl AdapterFactory for ConvolutionFactory {
    fn name(&self) -> &str {
        "convolution"
    }

    fn create(
        &self,
        driver: &Driver,
        op: &Op,
        inputs: &[&Tensor],
        outputs: &[&Tensor],
    ) -> Option<Box<dyn SopExecution>> {
        if inputs.len() != 1 || outputs.len() != 1 {
            log::info!("[{}]: multiple inputs or outputs are not supported", op.name);
            return None;
        }
        let params = op.as_conv2d()?;
        if params.quantized {
            log::info!("[{}]: quantized convolution is not supported", op.name);
            return None;
        }
        if params.weight.is_empty() {
            log::error!("[{}] has no weight", op.name);
            return None;
        }
        match SopConvolution::new(driver, op, params) {
            Ok(conv) => Some(Box::new(conv)),
            Err(e) => {
                log::warn!("[{}]: {}", op.name, e);
                None
            }
        }
    }
}
