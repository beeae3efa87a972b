#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use half::{bf16, f16};
use sb_core::{ArrayError, DType, DenseArray, Element};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RECORD_SCHEMA_VERSION: u32 = 1;
const MAX_RECORD_PAYLOAD_BYTES: usize = 1_048_576;

/// Canonical tensor payload: numeric elements packed little-endian into
/// `tensor_content`, text elements in `string_val`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncodedTensor {
    pub dtype: DType,
    pub shape: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tensor_content: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub string_val: Vec<String>,
}

impl EncodedTensor {
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// Reads back a rank-0 float32 payload.
    pub fn scalar_f32(&self) -> Result<f32, SerializeError> {
        if self.dtype != DType::F32 || !self.is_scalar() {
            return Err(SerializeError::IncompatiblePayload {
                reason: format!(
                    "expected rank-0 float32 tensor, got {} with shape {:?}",
                    self.dtype, self.shape
                ),
            });
        }
        let bytes: [u8; 4] = self.tensor_content.as_slice().try_into().map_err(|_| {
            SerializeError::IncompatiblePayload {
                reason: format!(
                    "float32 scalar needs 4 content bytes, got {}",
                    self.tensor_content.len()
                ),
            }
        })?;
        Ok(f32::from_le_bytes(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginData {
    pub plugin_name: String,
    #[serde(default)]
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummaryMetadata {
    pub plugin_data: PluginData,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub summary_description: String,
}

impl SummaryMetadata {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializeError> {
        to_bytes(self, "summary metadata")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializeError> {
        from_bytes(bytes)
    }
}

/// Metadata as carried by legacy records. Field-for-field compatible with
/// [`SummaryMetadata`] on the wire, so one converts to the other through
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacySummaryMetadata {
    pub plugin_data: PluginData,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub summary_description: String,
}

impl LegacySummaryMetadata {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializeError> {
        to_bytes(self, "legacy summary metadata")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializeError> {
        from_bytes(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummaryValue {
    pub tag: String,
    pub metadata: SummaryMetadata,
    pub tensor: EncodedTensor,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Summary {
    pub value: Vec<SummaryValue>,
}

impl Summary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tag: impl Into<String>, metadata: SummaryMetadata, tensor: EncodedTensor) {
        self.value.push(SummaryValue {
            tag: tag.into(),
            metadata,
            tensor,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacySummaryValue {
    pub tag: String,
    pub metadata: LegacySummaryMetadata,
    pub tensor: EncodedTensor,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacySummary {
    pub value: Vec<LegacySummaryValue>,
}

impl LegacySummary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        tag: impl Into<String>,
        metadata: LegacySummaryMetadata,
        tensor: EncodedTensor,
    ) {
        self.value.push(LegacySummaryValue {
            tag: tag.into(),
            metadata,
            tensor,
        });
    }

    /// Appends every value of `other`, keeping order.
    pub fn merge(&mut self, other: LegacySummary) {
        self.value.extend(other.value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Summary,
    LegacySummary,
}

/// A record type that can travel inside a [`RecordEnvelope`].
pub trait Record: Serialize + DeserializeOwned {
    const KIND: RecordKind;
}

impl Record for Summary {
    const KIND: RecordKind = RecordKind::Summary;
}

impl Record for LegacySummary {
    const KIND: RecordKind = RecordKind::LegacySummary;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordEnvelope<R> {
    pub schema_version: u32,
    pub mode: EnvelopeMode,
    pub kind: RecordKind,
    pub record: R,
    pub source_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    InvalidJson { diagnostic: String },
    UnknownField { field: String },
    VersionMismatch { expected: u32, found: u32 },
    ChecksumMismatch { expected: String, found: String },
    IncompatiblePayload { reason: String },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "schema version mismatch: expected={expected} found={found}"
                )
            }
            Self::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected={expected} found={found}")
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
        }
    }
}

impl std::error::Error for SerializeError {}

impl From<ArrayError> for SerializeError {
    fn from(value: ArrayError) -> Self {
        Self::IncompatiblePayload {
            reason: value.to_string(),
        }
    }
}

pub fn encode_tensor(array: &DenseArray) -> Result<EncodedTensor, SerializeError> {
    let shape = array.shape().iter().map(|dim| *dim as u64).collect();
    let dtype = array.dtype();

    let Some(width) = dtype.byte_width() else {
        let string_val = array
            .elements()
            .iter()
            .map(|element| match element {
                Element::Text(text) => Ok(text.clone()),
                other => Err(element_mismatch(dtype, other)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(EncodedTensor {
            dtype,
            shape,
            tensor_content: Vec::new(),
            string_val,
        });
    };

    let mut tensor_content = Vec::with_capacity(width * array.elements().len());
    for element in array.elements() {
        pack_element(dtype, element, &mut tensor_content)?;
    }

    Ok(EncodedTensor {
        dtype,
        shape,
        tensor_content,
        string_val: Vec::new(),
    })
}

pub fn decode_tensor(tensor: &EncodedTensor) -> Result<DenseArray, SerializeError> {
    let shape = tensor
        .shape
        .iter()
        .map(|dim| {
            usize::try_from(*dim).map_err(|_| SerializeError::IncompatiblePayload {
                reason: format!("dimension {dim} does not fit in usize"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let count = shape
        .iter()
        .try_fold(1usize, |count, dim| count.checked_mul(*dim))
        .ok_or_else(|| SerializeError::IncompatiblePayload {
            reason: format!("shape {shape:?} element count overflows"),
        })?;

    let Some(width) = tensor.dtype.byte_width() else {
        if !tensor.tensor_content.is_empty() {
            return Err(SerializeError::IncompatiblePayload {
                reason: "text tensor must not carry packed content".to_string(),
            });
        }
        if tensor.string_val.len() != count {
            return Err(SerializeError::IncompatiblePayload {
                reason: format!(
                    "shape {shape:?} needs {count} strings, got {}",
                    tensor.string_val.len()
                ),
            });
        }
        let elements = tensor.string_val.iter().cloned().map(Element::Text).collect();
        return Ok(DenseArray::new(shape, tensor.dtype, elements)?);
    };

    if !tensor.string_val.is_empty() {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!("{} tensor must not carry string values", tensor.dtype),
        });
    }
    if count.checked_mul(width) != Some(tensor.tensor_content.len()) {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!(
                "shape {shape:?} of {} needs {count} elements of width {width}, got {} bytes",
                tensor.dtype,
                tensor.tensor_content.len()
            ),
        });
    }

    let elements = tensor
        .tensor_content
        .chunks_exact(width)
        .map(|chunk| unpack_element(tensor.dtype, chunk))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(DenseArray::new(shape, tensor.dtype, elements)?)
}

pub fn encode_record<R: Record>(record: &R, mode: EnvelopeMode) -> Result<String, SerializeError> {
    let source_hash = record_hash(RECORD_SCHEMA_VERSION, mode, R::KIND, record)?;
    let envelope = RecordEnvelope {
        schema_version: RECORD_SCHEMA_VERSION,
        mode,
        kind: R::KIND,
        record,
        source_hash,
    };

    serde_json::to_string(&envelope).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("record encoding failed: {error}"),
    })
}

pub fn decode_record<R: Record>(
    input: &str,
    mode: DecodeMode,
) -> Result<RecordEnvelope<R>, SerializeError> {
    validate_payload_size(input)?;
    let envelope = match mode {
        DecodeMode::Strict => decode_record_strict(input)?,
        DecodeMode::Hardened => decode_record_hardened(input)?,
    };
    validate_record(&envelope)?;
    Ok(envelope)
}

pub fn encode_summary(summary: &Summary, mode: EnvelopeMode) -> Result<String, SerializeError> {
    encode_record(summary, mode)
}

pub fn decode_summary(input: &str, mode: DecodeMode) -> Result<Summary, SerializeError> {
    Ok(decode_record::<Summary>(input, mode)?.record)
}

pub fn encode_legacy_summary(
    summary: &LegacySummary,
    mode: EnvelopeMode,
) -> Result<String, SerializeError> {
    encode_record(summary, mode)
}

pub fn decode_legacy_summary(input: &str, mode: DecodeMode) -> Result<LegacySummary, SerializeError> {
    Ok(decode_record::<LegacySummary>(input, mode)?.record)
}

fn decode_record_strict<R: Record>(input: &str) -> Result<RecordEnvelope<R>, SerializeError> {
    serde_json::from_str(input).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            SerializeError::UnknownField { field }
        } else {
            SerializeError::InvalidJson {
                diagnostic: bounded(error.to_string().as_str(), 200),
            }
        }
    })
}

fn decode_record_hardened<R: Record>(input: &str) -> Result<RecordEnvelope<R>, SerializeError> {
    let raw: Value = serde_json::from_str(input).map_err(|error| SerializeError::InvalidJson {
        diagnostic: bounded(
            format!(
                "{error}; payload_prefix={} ",
                bounded(input.replace('\n', " ").as_str(), 96)
            )
            .as_str(),
            220,
        ),
    })?;

    let obj = raw
        .as_object()
        .ok_or_else(|| SerializeError::IncompatiblePayload {
            reason: "top-level record payload must be a JSON object".to_string(),
        })?;

    let allowed: BTreeSet<&str> = BTreeSet::from([
        "schema_version",
        "mode",
        "kind",
        "record",
        "source_hash",
    ]);
    for key in obj.keys() {
        if !allowed.contains(key.as_str()) {
            return Err(SerializeError::UnknownField { field: key.clone() });
        }
    }

    serde_json::from_value(raw).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            SerializeError::UnknownField { field }
        } else {
            SerializeError::IncompatiblePayload {
                reason: bounded(error.to_string().as_str(), 200),
            }
        }
    })
}

fn validate_payload_size(input: &str) -> Result<(), SerializeError> {
    let actual = input.len();
    if actual > MAX_RECORD_PAYLOAD_BYTES {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!(
                "record payload exceeds max bytes: actual={actual} max={MAX_RECORD_PAYLOAD_BYTES}"
            ),
        });
    }
    Ok(())
}

fn validate_record<R: Record>(envelope: &RecordEnvelope<R>) -> Result<(), SerializeError> {
    if envelope.schema_version != RECORD_SCHEMA_VERSION {
        return Err(SerializeError::VersionMismatch {
            expected: RECORD_SCHEMA_VERSION,
            found: envelope.schema_version,
        });
    }

    if envelope.kind != R::KIND {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!(
                "record kind mismatch: expected={:?} found={:?}",
                R::KIND,
                envelope.kind
            ),
        });
    }

    let expected = record_hash(
        envelope.schema_version,
        envelope.mode,
        envelope.kind,
        &envelope.record,
    )?;
    if envelope.source_hash != expected {
        return Err(SerializeError::ChecksumMismatch {
            expected,
            found: envelope.source_hash.clone(),
        });
    }

    Ok(())
}

fn record_hash<R: Serialize>(
    schema_version: u32,
    mode: EnvelopeMode,
    kind: RecordKind,
    record: &R,
) -> Result<String, SerializeError> {
    let body = serde_json::to_vec(record).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("record hashing failed: {error}"),
    })?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(&schema_version.to_le_bytes());
    hasher.update(&[match mode {
        EnvelopeMode::Strict => 1,
        EnvelopeMode::Hardened => 2,
    }]);
    hasher.update(&[match kind {
        RecordKind::Summary => 1,
        RecordKind::LegacySummary => 2,
    }]);
    hasher.update(&body);
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

fn pack_element(dtype: DType, element: &Element, out: &mut Vec<u8>) -> Result<(), SerializeError> {
    let out_of_range = || SerializeError::IncompatiblePayload {
        reason: format!("element does not fit dtype {dtype}"),
    };

    match (dtype, element) {
        (DType::Bool, Element::Bool(value)) => out.push(u8::from(*value)),
        (DType::I8, Element::Int(value)) => {
            out.extend_from_slice(&i8::try_from(*value).map_err(|_| out_of_range())?.to_le_bytes());
        }
        (DType::I16, Element::Int(value)) => {
            out.extend_from_slice(&i16::try_from(*value).map_err(|_| out_of_range())?.to_le_bytes());
        }
        (DType::I32, Element::Int(value)) => {
            out.extend_from_slice(&i32::try_from(*value).map_err(|_| out_of_range())?.to_le_bytes());
        }
        (DType::I64, Element::Int(value)) => out.extend_from_slice(&value.to_le_bytes()),
        (DType::U8, Element::UInt(value)) => {
            out.push(u8::try_from(*value).map_err(|_| out_of_range())?);
        }
        (DType::U16, Element::UInt(value)) => {
            out.extend_from_slice(&u16::try_from(*value).map_err(|_| out_of_range())?.to_le_bytes());
        }
        (DType::U32, Element::UInt(value)) => {
            out.extend_from_slice(&u32::try_from(*value).map_err(|_| out_of_range())?.to_le_bytes());
        }
        (DType::U64, Element::UInt(value)) => out.extend_from_slice(&value.to_le_bytes()),
        (DType::F16, Element::Float(value)) => {
            out.extend_from_slice(&f16::from_f64(*value).to_le_bytes());
        }
        (DType::Bf16, Element::Float(value)) => {
            out.extend_from_slice(&bf16::from_f64(*value).to_le_bytes());
        }
        (DType::F32, Element::Float(value)) => {
            out.extend_from_slice(&(*value as f32).to_le_bytes());
        }
        (DType::F64, Element::Float(value)) => out.extend_from_slice(&value.to_le_bytes()),
        (_, other) => return Err(element_mismatch(dtype, other)),
    }
    Ok(())
}

fn unpack_element(dtype: DType, chunk: &[u8]) -> Result<Element, SerializeError> {
    let width_error = || SerializeError::IncompatiblePayload {
        reason: format!("bad element width {} for dtype {dtype}", chunk.len()),
    };

    let element = match dtype {
        DType::Bool => match chunk {
            [0] => Element::Bool(false),
            [1] => Element::Bool(true),
            _ => {
                return Err(SerializeError::IncompatiblePayload {
                    reason: format!("invalid bool byte {chunk:?}"),
                });
            }
        },
        DType::I8 => Element::Int(i64::from(i8::from_le_bytes(
            chunk.try_into().map_err(|_| width_error())?,
        ))),
        DType::I16 => Element::Int(i64::from(i16::from_le_bytes(
            chunk.try_into().map_err(|_| width_error())?,
        ))),
        DType::I32 => Element::Int(i64::from(i32::from_le_bytes(
            chunk.try_into().map_err(|_| width_error())?,
        ))),
        DType::I64 => Element::Int(i64::from_le_bytes(
            chunk.try_into().map_err(|_| width_error())?,
        )),
        DType::U8 => Element::UInt(u64::from(u8::from_le_bytes(
            chunk.try_into().map_err(|_| width_error())?,
        ))),
        DType::U16 => Element::UInt(u64::from(u16::from_le_bytes(
            chunk.try_into().map_err(|_| width_error())?,
        ))),
        DType::U32 => Element::UInt(u64::from(u32::from_le_bytes(
            chunk.try_into().map_err(|_| width_error())?,
        ))),
        DType::U64 => Element::UInt(u64::from_le_bytes(
            chunk.try_into().map_err(|_| width_error())?,
        )),
        DType::F16 => Element::Float(
            f16::from_le_bytes(chunk.try_into().map_err(|_| width_error())?).to_f64(),
        ),
        DType::Bf16 => Element::Float(
            bf16::from_le_bytes(chunk.try_into().map_err(|_| width_error())?).to_f64(),
        ),
        DType::F32 => Element::Float(f64::from(f32::from_le_bytes(
            chunk.try_into().map_err(|_| width_error())?,
        ))),
        DType::F64 => Element::Float(f64::from_le_bytes(
            chunk.try_into().map_err(|_| width_error())?,
        )),
        DType::Str => return Err(width_error()),
    };
    Ok(element)
}

fn element_mismatch(dtype: DType, element: &Element) -> SerializeError {
    SerializeError::IncompatiblePayload {
        reason: format!(
            "element kind {:?} does not match dtype {dtype}",
            element.kind()
        ),
    }
}

fn to_bytes<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>, SerializeError> {
    serde_json::to_vec(value).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("{what} encoding failed: {error}"),
    })
}

fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializeError> {
    serde_json::from_slice(bytes).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            SerializeError::UnknownField { field }
        } else {
            SerializeError::InvalidJson {
                diagnostic: bounded(error.to_string().as_str(), 200),
            }
        }
    })
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut boundary = max_len.min(input.len());
        while boundary > 0 && !input.is_char_boundary(boundary) {
            boundary -= 1;
        }
        format!("{}...", &input[..boundary])
    }
}
