use crate::error::Error;

/// Result type alias used throughout hhj.
///
/// Shorthand for `std::result::Result<T, Error>`. Every hhj operation that can
/// fail returns this type.
pub type Result<T> = std::result::Result<T, Error>;
