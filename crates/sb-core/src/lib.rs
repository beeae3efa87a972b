#![forbid(unsafe_code)]

use std::fmt;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    Bf16,
    F32,
    F64,
    Str,
}

/// Coarse element category, used to decide whether a value can be cast to a
/// real number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Bool,
    SignedInt,
    UnsignedInt,
    Float,
    Text,
}

impl ElementKind {
    #[must_use]
    pub const fn is_real(self) -> bool {
        !matches!(self, Self::Text)
    }
}

impl DType {
    #[must_use]
    pub const fn kind(self) -> ElementKind {
        match self {
            Self::Bool => ElementKind::Bool,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 => ElementKind::SignedInt,
            Self::U8 | Self::U16 | Self::U32 | Self::U64 => ElementKind::UnsignedInt,
            Self::F16 | Self::Bf16 | Self::F32 | Self::F64 => ElementKind::Float,
            Self::Str => ElementKind::Text,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::U32 => "uint32",
            Self::U64 => "uint64",
            Self::F16 => "float16",
            Self::Bf16 => "bfloat16",
            Self::F32 => "float32",
            Self::F64 => "float64",
            Self::Str => "str",
        }
    }

    /// Width of one packed element in bytes. Text has no fixed width.
    #[must_use]
    pub const fn byte_width(self) -> Option<usize> {
        match self {
            Self::Bool | Self::I8 | Self::U8 => Some(1),
            Self::I16 | Self::U16 | Self::F16 | Self::Bf16 => Some(2),
            Self::I32 | Self::U32 | Self::F32 => Some(4),
            Self::I64 | Self::U64 | Self::F64 => Some(8),
            Self::Str => None,
        }
    }

}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Strict,
    Hardened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    shape: Vec<usize>,
    dtype: DType,
}

impl TensorMeta {
    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self {
            shape: Vec::new(),
            dtype,
        }
    }

    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType) -> Self {
        Self { shape, dtype }
    }

    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// Element count, or `None` when the dimensions multiply past `usize`.
    #[must_use]
    pub fn numel(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |count, dim| count.checked_mul(*dim))
    }
}

/// A single stored element. Floats of every width are held as `f64` after
/// rounding to their declared dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl Element {
    #[must_use]
    pub fn kind(&self) -> ElementKind {
        match self {
            Self::Bool(_) => ElementKind::Bool,
            Self::Int(_) => ElementKind::SignedInt,
            Self::UInt(_) => ElementKind::UnsignedInt,
            Self::Float(_) => ElementKind::Float,
            Self::Text(_) => ElementKind::Text,
        }
    }

    #[must_use]
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            Self::Int(value) => Some(*value as f64),
            Self::UInt(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayError {
    ElementCountMismatch {
        expected: usize,
        actual: usize,
    },
    ElementKindMismatch {
        dtype: DType,
        index: usize,
        actual: ElementKind,
    },
    OutOfRange {
        dtype: DType,
        index: usize,
    },
    ShapeOverflow {
        shape: Vec<usize>,
    },
}

impl fmt::Display for ArrayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ElementCountMismatch { expected, actual } => write!(
                f,
                "element count mismatch: shape requires {expected}, got {actual}"
            ),
            Self::ElementKindMismatch {
                dtype,
                index,
                actual,
            } => write!(
                f,
                "element {index} has kind {actual:?} which does not fit dtype {dtype}"
            ),
            Self::OutOfRange { dtype, index } => {
                write!(f, "element {index} is out of range for dtype {dtype}")
            }
            Self::ShapeOverflow { shape } => {
                write!(f, "shape {shape:?} has more elements than fit in memory")
            }
        }
    }
}

impl std::error::Error for ArrayError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastError {
    UnsupportedSource { dtype: DType },
    UnsupportedTarget { dtype: DType },
}

impl fmt::Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedSource { dtype } => {
                write!(f, "cast {dtype} to float is not supported")
            }
            Self::UnsupportedTarget { dtype } => {
                write!(f, "cast target {dtype} is not a floating point dtype")
            }
        }
    }
}

impl std::error::Error for CastError {}

/// A dense, contiguous, typed multi-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseArray {
    meta: TensorMeta,
    elements: Vec<Element>,
}

impl DenseArray {
    pub fn new(shape: Vec<usize>, dtype: DType, elements: Vec<Element>) -> Result<Self, ArrayError> {
        let meta = TensorMeta::from_shape(shape, dtype);
        let expected = meta.numel().ok_or_else(|| ArrayError::ShapeOverflow {
            shape: meta.shape().to_vec(),
        })?;
        if expected != elements.len() {
            return Err(ArrayError::ElementCountMismatch {
                expected,
                actual: elements.len(),
            });
        }
        for (index, element) in elements.iter().enumerate() {
            check_element(dtype, index, element)?;
        }
        Ok(Self { meta, elements })
    }

    pub fn scalar(dtype: DType, element: Element) -> Result<Self, ArrayError> {
        Self::new(Vec::new(), dtype, vec![element])
    }

    #[must_use]
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            meta: TensorMeta::scalar(DType::F32),
            elements: vec![Element::Float(f64::from(value))],
        }
    }

    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.meta.shape()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    #[must_use]
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.meta.is_scalar()
    }

    /// The single element of a rank-0 array.
    #[must_use]
    pub fn scalar_element(&self) -> Option<&Element> {
        if self.is_scalar() {
            self.elements.first()
        } else {
            None
        }
    }

    #[must_use]
    pub fn scalar_f64(&self) -> Option<f64> {
        self.scalar_element().and_then(Element::to_f64)
    }

    /// Casts every element to the floating point dtype `target`, rounding to
    /// its precision.
    pub fn cast(&self, target: DType) -> Result<Self, CastError> {
        if target.kind() != ElementKind::Float {
            return Err(CastError::UnsupportedTarget { dtype: target });
        }
        if !self.dtype().kind().is_real() {
            return Err(CastError::UnsupportedSource {
                dtype: self.dtype(),
            });
        }

        let mut elements = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            let value = cast_element(target, element).ok_or(CastError::UnsupportedSource {
                dtype: self.dtype(),
            })?;
            elements.push(Element::Float(value));
        }

        Ok(Self {
            meta: self.meta.clone().with_dtype(target),
            elements,
        })
    }
}

/// Converts one element to the precision of `target`. Float32 is reached
/// straight from the source type so wide integers round once.
fn cast_element(target: DType, element: &Element) -> Option<f64> {
    if target == DType::F32 {
        let value = match element {
            Element::Bool(value) => f32::from(u8::from(*value)),
            Element::Int(value) => *value as f32,
            Element::UInt(value) => *value as f32,
            Element::Float(value) => *value as f32,
            Element::Text(_) => return None,
        };
        return Some(f64::from(value));
    }

    let value = element.to_f64()?;
    Some(match target {
        DType::F16 => f16::from_f64(value).to_f64(),
        DType::Bf16 => bf16::from_f64(value).to_f64(),
        _ => value,
    })
}

fn check_element(dtype: DType, index: usize, element: &Element) -> Result<(), ArrayError> {
    if element.kind() != dtype.kind() {
        return Err(ArrayError::ElementKindMismatch {
            dtype,
            index,
            actual: element.kind(),
        });
    }

    let in_range = match (dtype, element) {
        (DType::I8, Element::Int(value)) => i8::try_from(*value).is_ok(),
        (DType::I16, Element::Int(value)) => i16::try_from(*value).is_ok(),
        (DType::I32, Element::Int(value)) => i32::try_from(*value).is_ok(),
        (DType::U8, Element::UInt(value)) => u8::try_from(*value).is_ok(),
        (DType::U16, Element::UInt(value)) => u16::try_from(*value).is_ok(),
        (DType::U32, Element::UInt(value)) => u32::try_from(*value).is_ok(),
        _ => true,
    };
    if !in_range {
        return Err(ArrayError::OutOfRange { dtype, index });
    }
    Ok(())
}

/// A Rust value with a fixed array dtype.
pub trait ScalarElement {
    const DTYPE: DType;

    fn into_element(self) -> Element;
}

macro_rules! scalar_element {
    ($ty:ty, $dtype:expr, |$value:ident| $convert:expr) => {
        impl ScalarElement for $ty {
            const DTYPE: DType = $dtype;

            fn into_element(self) -> Element {
                let $value = self;
                $convert
            }
        }

        impl IntoArray for $ty {
            fn into_array(self) -> Result<DenseArray, ArrayError> {
                DenseArray::scalar(<$ty as ScalarElement>::DTYPE, self.into_element())
            }
        }
    };
}

/// Conversion of loosely typed input ("anything array-like") into a
/// [`DenseArray`].
pub trait IntoArray {
    fn into_array(self) -> Result<DenseArray, ArrayError>;
}

scalar_element!(bool, DType::Bool, |value| Element::Bool(value));
scalar_element!(i8, DType::I8, |value| Element::Int(i64::from(value)));
scalar_element!(i16, DType::I16, |value| Element::Int(i64::from(value)));
scalar_element!(i32, DType::I32, |value| Element::Int(i64::from(value)));
scalar_element!(i64, DType::I64, |value| Element::Int(value));
scalar_element!(u8, DType::U8, |value| Element::UInt(u64::from(value)));
scalar_element!(u16, DType::U16, |value| Element::UInt(u64::from(value)));
scalar_element!(u32, DType::U32, |value| Element::UInt(u64::from(value)));
scalar_element!(u64, DType::U64, |value| Element::UInt(value));
scalar_element!(f16, DType::F16, |value| Element::Float(value.to_f64()));
scalar_element!(bf16, DType::Bf16, |value| Element::Float(value.to_f64()));
scalar_element!(f32, DType::F32, |value| Element::Float(f64::from(value)));
scalar_element!(f64, DType::F64, |value| Element::Float(value));
scalar_element!(String, DType::Str, |value| Element::Text(value));
scalar_element!(&str, DType::Str, |value| Element::Text(value.to_string()));

impl<T: ScalarElement> IntoArray for Vec<T> {
    fn into_array(self) -> Result<DenseArray, ArrayError> {
        let shape = vec![self.len()];
        let elements = self.into_iter().map(ScalarElement::into_element).collect();
        DenseArray::new(shape, T::DTYPE, elements)
    }
}

impl<T: ScalarElement, const N: usize> IntoArray for [T; N] {
    fn into_array(self) -> Result<DenseArray, ArrayError> {
        Vec::from(self).into_array()
    }
}

impl<T: ScalarElement + Clone> IntoArray for &[T] {
    fn into_array(self) -> Result<DenseArray, ArrayError> {
        self.to_vec().into_array()
    }
}

impl IntoArray for DenseArray {
    fn into_array(self) -> Result<DenseArray, ArrayError> {
        Ok(self)
    }
}

impl IntoArray for &DenseArray {
    fn into_array(self) -> Result<DenseArray, ArrayError> {
        Ok(self.clone())
    }
}
