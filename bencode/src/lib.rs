// Canonical bencoding, exposed two ways:
// - a serde data format (`decode_bytes`/`encode_to_raw`) for typed documents
//   like metainfo files and tracker responses;
// - a tagged `Value` tree for documents whose keys are only known at runtime
//   (scrape responses index their entries by raw 20-byte info-hashes).
mod de;
mod error;
mod ser;
mod value;

pub use de::{decode_bytes, Decoder};
pub use error::{Error, Result};
pub use ser::{encode_to_raw, Encoder};
pub use value::Value;
