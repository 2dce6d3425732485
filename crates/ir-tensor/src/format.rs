use std::fmt;

/// Memory layout tag attached to a tensor by the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataFormat {
    #[default]
    Nchw,
    Nhwc,
    /// Channel-blocked layout, channels packed in groups of four.
    Nc4hw4,
    Nhwc4,
    /// Layout not determined yet.
    Unknown,
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataFormat::Nchw => "NCHW",
            DataFormat::Nhwc => "NHWC",
            DataFormat::Nc4hw4 => "NC4HW4",
            DataFormat::Nhwc4 => "NHWC4",
            DataFormat::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
