/// Errors produced while opening and validating a script image.
///
/// None of these abort the host: a script whose image fails to validate is
/// simply not debuggable.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("bad header: {0}")]
    BadHeader(&'static str),
    #[error("unsupported container version {0:#06x}")]
    UnsupportedVersion(u16),
    #[error("could not decode compressed region")]
    BadCompression,
    #[error("invalid {0} section")]
    InvalidSection(&'static str),
    #[error("invalid rtti table {table}: {reason}")]
    InvalidRtti {
        table: &'static str,
        reason: &'static str,
    },
    #[error("image buffer allocation failed")]
    OutOfMemory,
}
