use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{Function, NodeId};
use crate::tensor::{HostTensor, TensorRef};

/// Enumerates scalar element types understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum DType {
    I1,
    Si32,
    Si64,
    F32,
    F64,
}

impl DType {
    /// Returns `true` when the dtype is a signed integer.
    pub fn is_integer(self) -> bool {
        matches!(self, DType::Si32 | DType::Si64)
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Storage size of one element. Booleans occupy a full byte.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Si32 | DType::F32 => 4,
            DType::Si64 | DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::I1 => "i1",
            DType::Si32 => "si32",
            DType::Si64 => "si64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Logical tensor shape as an ordered list of static extents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn into_dims(self) -> Vec<usize> {
        self.dims
    }

    /// Returns the element count, or `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("[]");
        }
        let dims = self
            .dims
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>();
        f.write_str(&dims.join("x"))
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: impl Into<Shape>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    /// Returns total byte length, or `None` when the shape overflows.
    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?
            .checked_mul(self.dtype.size_in_bytes())
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{} x {}>", self.dtype, self.shape)
    }
}

/// Dense literal tensor payload, little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Elementwise unary ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Tanh,
    Relu,
}

/// Elementwise binary ops. Operands must share dtype and shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

/// Target shape for `reshape`. The element count must be preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub shape: Shape,
}

/// Permutation payload for `transpose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

/// Splits one operand into consecutive chunks along `axis`; one output per entry in `sizes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSpec {
    pub axis: usize,
    pub sizes: Vec<usize>,
}

/// Attribute payload for `concat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Attribute payload for `cast`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

/// Operation carried by a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Function input. Has no operands and exactly one output.
    Parameter,
    /// Function output. Has exactly one operand and no outputs of its own.
    Result,
    Constant(TensorLiteral),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    Reshape(ReshapeSpec),
    Transpose(TransposeSpec),
    /// Rank-2 matrix product `[m, k] x [k, n] -> [m, n]`.
    MatMul,
    Split(SplitSpec),
    Concat(ConcatSpec),
    Cast(CastSpec),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Parameter => OperationKind::Parameter,
            Operation::Result => OperationKind::Result,
            Operation::Constant(_) => OperationKind::Constant,
            Operation::ElementwiseUnary(_) => OperationKind::ElementwiseUnary,
            Operation::ElementwiseBinary(_) => OperationKind::ElementwiseBinary,
            Operation::Reshape(_) => OperationKind::Reshape,
            Operation::Transpose(_) => OperationKind::Transpose,
            Operation::MatMul => OperationKind::MatMul,
            Operation::Split(_) => OperationKind::Split,
            Operation::Concat(_) => OperationKind::Concat,
            Operation::Cast(_) => OperationKind::Cast,
        }
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self, Operation::Parameter)
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Operation::Result)
    }
}

/// Attribute-free discriminant of [`Operation`], used for capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    Parameter,
    Result,
    Constant,
    ElementwiseUnary,
    ElementwiseBinary,
    Reshape,
    Transpose,
    MatMul,
    Split,
    Concat,
    Cast,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Parameter => "parameter",
            OperationKind::Result => "result",
            OperationKind::Constant => "constant",
            OperationKind::ElementwiseUnary => "elementwise_unary",
            OperationKind::ElementwiseBinary => "elementwise_binary",
            OperationKind::Reshape => "reshape",
            OperationKind::Transpose => "transpose",
            OperationKind::MatMul => "matmul",
            OperationKind::Split => "split",
            OperationKind::Concat => "concat",
            OperationKind::Cast => "cast",
        }
    }

    /// Graph boundary kinds every backend must accept.
    pub fn is_structural(self) -> bool {
        matches!(self, OperationKind::Parameter | OperationKind::Result)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid placement for node {node}: {detail}")]
    InvalidPlacement { node: NodeId, detail: String },
    #[error("result {result} is disconnected from its producer")]
    DisconnectedOutput { result: NodeId },
    #[error("shape mismatch for {slot}: expected {expected}, found {found}")]
    ShapeMismatch {
        slot: String,
        expected: String,
        found: String,
    },
    #[error("type mismatch for {slot}: expected {expected}, found {found}")]
    TypeMismatch {
        slot: String,
        expected: DType,
        found: DType,
    },
    #[error("backend `{backend}` does not support operation `{op}`")]
    UnsupportedOperation { backend: String, op: OperationKind },
    #[error("malformed graph: {message}")]
    Graph { message: String },
    #[error("invalid configuration: {message}")]
    Config { message: String },
    #[error("backend library error: {message}")]
    Library { message: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn invalid_placement(node: NodeId, detail: impl Into<String>) -> Self {
        BackendError::InvalidPlacement {
            node,
            detail: detail.into(),
        }
    }

    pub fn unsupported(backend: impl Into<String>, op: OperationKind) -> Self {
        BackendError::UnsupportedOperation {
            backend: backend.into(),
            op,
        }
    }

    pub fn graph(message: impl Into<String>) -> Self {
        BackendError::Graph {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        BackendError::Config {
            message: message.into(),
        }
    }

    pub fn library(message: impl Into<String>) -> Self {
        BackendError::Library {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Uniform capability contract implemented by every execution backend.
///
/// The hybrid backend implements this trait too, composing other backends
/// underneath it. Tensors are shared host buffers, so a tensor produced by one
/// backend can be read by another.
pub trait Backend: Send + Sync {
    /// Returns a human-readable backend identifier (e.g. `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Allocates a zero-initialised tensor owned by this backend.
    fn create_tensor(&self, spec: TensorSpec) -> BackendResult<TensorRef> {
        Ok(Arc::new(HostTensor::zeroed(spec)?))
    }

    /// Wraps caller-owned memory without copying.
    ///
    /// # Safety
    /// `memory` must point to at least `spec.byte_len()` bytes that stay valid, and are not
    /// accessed through any other path, for as long as the returned tensor is alive.
    unsafe fn create_tensor_with_memory(
        &self,
        spec: TensorSpec,
        memory: NonNull<u8>,
    ) -> BackendResult<TensorRef> {
        Ok(Arc::new(HostTensor::from_external(spec, memory)?))
    }

    /// Reports whether this backend can execute `op`. Used by capability-based placement.
    fn supports(&self, _op: &Operation) -> bool {
        true
    }

    /// Prepares `function` for execution. Must be idempotent per function identity.
    fn compile(&self, function: &Function) -> BackendResult<()>;

    /// Runs `function`, reading `inputs` and writing every tensor in `outputs`.
    fn call(
        &self,
        function: &Function,
        outputs: &[TensorRef],
        inputs: &[TensorRef],
    ) -> BackendResult<()>;
}
