//! Value types exchanged with the single-op driver.
//!
//! Enumerations travel across the boundary as plain `i32`; anything the
//! driver reports outside the known range decodes to the undefined/reserved
//! variant instead of being transmuted.

use ir_tensor::{DType, DataFormat};

use crate::error::{AccelError, Result};

/// Status code returned by driver calls; zero means success.
pub type Status = i32;

pub const STATUS_SUCCESS: Status = 0;

/// Convert a driver status into a `Result`.
pub fn check(status: Status, call: &'static str) -> Result<()> {
    if status == STATUS_SUCCESS {
        Ok(())
    } else {
        Err(AccelError::ForeignStatus { call, status })
    }
}

macro_rules! foreign_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(usize);

        impl $name {
            /// Wrap a driver address; null yields `None`.
            pub fn from_raw(addr: usize) -> Option<Self> {
                if addr == 0 {
                    None
                } else {
                    Some(Self(addr))
                }
            }

            pub fn addr(self) -> usize {
                self.0
            }
        }
    };
}

// Handles are stored as usize so owners can satisfy Send/Sync.
foreign_handle!(
    /// Tensor descriptor: dims, element type, layout.
    TensorDescHandle
);
foreign_handle!(
    /// Raw driver-allocated buffer.
    BufferHandle
);
foreign_handle!(
    /// Driver tensor: descriptor plus backing buffer.
    TensorHandle
);
foreign_handle!(OptionsHandle);
foreign_handle!(
    /// Operator descriptor (convolution, activation).
    OpDescHandle
);
foreign_handle!(ExecutorHandle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float,
    Float16,
    Undefined,
}

impl DataType {
    pub const RAW_FLOAT: i32 = 0;
    pub const RAW_FLOAT16: i32 = 1;
    pub const RAW_UNDEFINED: i32 = 255;

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            Self::RAW_FLOAT => DataType::Float,
            Self::RAW_FLOAT16 => DataType::Float16,
            _ => DataType::Undefined,
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            DataType::Float => Self::RAW_FLOAT,
            DataType::Float16 => Self::RAW_FLOAT16,
            DataType::Undefined => Self::RAW_UNDEFINED,
        }
    }

    /// Driver element type for a graph dtype, `Undefined` when there is none.
    pub fn from_dtype(dtype: DType) -> Self {
        match dtype {
            DType::F32 => DataType::Float,
            DType::F16 => DataType::Float16,
            DType::I32 | DType::U8 => DataType::Undefined,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::Float => 4,
            DataType::Float16 => 2,
            DataType::Undefined => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Nchw,
    Nhwc,
    Nc4hw4,
    /// Not concrete yet; resolved by the driver during executor creation.
    Reserved,
}

impl Format {
    pub const RAW_NCHW: i32 = 0;
    pub const RAW_NHWC: i32 = 1;
    pub const RAW_NC4HW4: i32 = 2;
    pub const RAW_RESERVED: i32 = 255;

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            Self::RAW_NCHW => Format::Nchw,
            Self::RAW_NHWC => Format::Nhwc,
            Self::RAW_NC4HW4 => Format::Nc4hw4,
            _ => Format::Reserved,
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            Format::Nchw => Self::RAW_NCHW,
            Format::Nhwc => Self::RAW_NHWC,
            Format::Nc4hw4 => Self::RAW_NC4HW4,
            Format::Reserved => Self::RAW_RESERVED,
        }
    }

    pub fn from_data_format(format: DataFormat) -> Self {
        match format {
            DataFormat::Nchw => Format::Nchw,
            DataFormat::Nhwc => Format::Nhwc,
            DataFormat::Nc4hw4 => Format::Nc4hw4,
            DataFormat::Nhwc4 | DataFormat::Unknown => Format::Reserved,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvMode {
    Common,
    Depthwise,
    Transposed,
}

impl ConvMode {
    pub fn to_raw(self) -> i32 {
        match self {
            ConvMode::Common => 0,
            ConvMode::Depthwise => 1,
            ConvMode::Transposed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SopPadMode {
    Specific,
    Same,
    Valid,
}

impl SopPadMode {
    pub fn to_raw(self) -> i32 {
        match self {
            SopPadMode::Specific => 0,
            SopPadMode::Same => 1,
            SopPadMode::Valid => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationType {
    Relu,
    Relu6,
}

impl ActivationType {
    pub fn to_raw(self) -> i32 {
        match self {
            ActivationType::Relu => 1,
            ActivationType::Relu6 => 14,
        }
    }
}

/// Answer of a precheck query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportStatus {
    Unsupported,
    /// Runs on the accelerator but without an optimized kernel.
    Supported,
    Optimized,
}

impl SupportStatus {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => SupportStatus::Supported,
            2 => SupportStatus::Optimized,
            _ => SupportStatus::Unsupported,
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            SupportStatus::Unsupported => 0,
            SupportStatus::Supported => 1,
            SupportStatus::Optimized => 2,
        }
    }
}

/// Parameters of a convolution operator descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvDescriptor {
    pub mode: ConvMode,
    /// `[y, x]`
    pub strides: [i64; 2],
    /// `[y, x]`
    pub dilations: [i64; 2],
    /// `[top, bottom, left, right]`
    pub pads: [i64; 4],
    pub groups: i64,
    pub pad_mode: SopPadMode,
}

/// Operands of a convolution precheck or executor creation.
#[derive(Debug, Clone, Copy)]
pub struct ConvRequest {
    pub options: OptionsHandle,
    pub conv: OpDescHandle,
    pub input: TensorDescHandle,
    pub output: TensorDescHandle,
    pub filter: TensorHandle,
    pub bias: Option<TensorHandle>,
}
