use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use hybrid_rs::backend::spec::{
    Backend, BackendError, BackendResult, CastSpec, ConcatSpec, DType, ElementwiseBinaryOp,
    ElementwiseUnaryOp, Operation, OperationKind, SplitSpec, TensorLiteral, TensorSpec,
    TransposeSpec,
};
use hybrid_rs::backend::validate_call;
use hybrid_rs::graph::{validate_function_topology, Function, FunctionId, Node, NodeId, ValueRef};
use hybrid_rs::tensor::storage::{decode, encode};
use hybrid_rs::tensor::{HostTensor, TensorRef};

/// Immutable interpreter value.
#[derive(Clone, Debug)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

#[derive(Clone, Debug)]
pub enum TensorData {
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
    Si32(Arc<[i32]>),
    Si64(Arc<[i64]>),
    Bool(Arc<[bool]>),
}

macro_rules! map_data {
    ($data:expr, |$values:ident| $body:expr) => {
        match $data {
            TensorData::F32($values) => TensorData::F32(Arc::from($body)),
            TensorData::F64($values) => TensorData::F64(Arc::from($body)),
            TensorData::Si32($values) => TensorData::Si32(Arc::from($body)),
            TensorData::Si64($values) => TensorData::Si64(Arc::from($body)),
            TensorData::Bool($values) => TensorData::Bool(Arc::from($body)),
        }
    };
}

impl CpuTensor {
    fn from_host(tensor: &HostTensor) -> Self {
        let spec = tensor.spec().clone();
        let data = tensor.with_bytes(|bytes| decode_data(spec.dtype, bytes));
        CpuTensor { spec, data }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match &self.data {
            TensorData::F32(values) => encode(values),
            TensorData::F64(values) => encode(values),
            TensorData::Si32(values) => encode(values),
            TensorData::Si64(values) => encode(values),
            TensorData::Bool(values) => encode(values),
        }
    }
}

fn decode_data(dtype: DType, bytes: &[u8]) -> TensorData {
    match dtype {
        DType::F32 => TensorData::F32(Arc::from(decode::<f32>(bytes))),
        DType::F64 => TensorData::F64(Arc::from(decode::<f64>(bytes))),
        DType::Si32 => TensorData::Si32(Arc::from(decode::<i32>(bytes))),
        DType::Si64 => TensorData::Si64(Arc::from(decode::<i64>(bytes))),
        DType::I1 => TensorData::Bool(Arc::from(decode::<bool>(bytes))),
    }
}

/// Reference interpreter backend over host tensors.
///
/// Several instances can coexist under different names, and an instance can be limited to
/// a subset of operation kinds so capability-based placement has something to route around.
#[derive(Debug)]
pub struct CpuBackend {
    name: String,
    supported: Option<HashSet<OperationKind>>,
    compiled: Mutex<HashSet<FunctionId>>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::named("cpu")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            supported: None,
            compiled: Mutex::new(HashSet::new()),
        }
    }

    /// Restricts the backend to `kinds`. Parameters and results are always accepted.
    pub fn with_supported_ops(
        name: impl Into<String>,
        kinds: impl IntoIterator<Item = OperationKind>,
    ) -> Self {
        Self {
            supported: Some(kinds.into_iter().collect()),
            ..Self::named(name)
        }
    }

    pub fn is_compiled(&self, id: FunctionId) -> bool {
        self.compiled
            .lock()
            .expect("cpu compile cache poisoned")
            .contains(&id)
    }

    fn supports_kind(&self, kind: OperationKind) -> bool {
        kind.is_structural()
            || self
                .supported
                .as_ref()
                .map_or(true, |kinds| kinds.contains(&kind))
    }

    fn run_function(
        &self,
        function: &Function,
        inputs: &[TensorRef],
    ) -> BackendResult<Vec<CpuTensor>> {
        let parameter_slots: HashMap<NodeId, usize> = function
            .parameters()
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position))
            .collect();

        let mut values: HashMap<ValueRef, CpuTensor> = HashMap::new();
        for node in function.nodes() {
            match node.op() {
                Operation::Parameter => {
                    let tensor = parameter_slots
                        .get(&node.id())
                        .and_then(|position| inputs.get(*position))
                        .ok_or_else(|| {
                            BackendError::execution(format!(
                                "parameter {} has no bound input",
                                node.id()
                            ))
                        })?;
                    values.insert(ValueRef::from(node.id()), CpuTensor::from_host(tensor));
                }
                Operation::Result => {}
                op => {
                    let operands = node
                        .inputs()
                        .iter()
                        .map(|value| {
                            values.get(value).cloned().ok_or_else(|| {
                                BackendError::execution(format!("operand {value} missing"))
                            })
                        })
                        .collect::<BackendResult<Vec<_>>>()?;
                    let outputs = execute_operation(op, &operands, node.outputs())
                        .map_err(|err| augment_backend_error(err, function, node, &operands))?;
                    for (output, tensor) in outputs.into_iter().enumerate() {
                        values.insert(ValueRef::new(node.id(), output as u32), tensor);
                    }
                }
            }
        }

        (0..function.results().len())
            .map(|position| {
                function
                    .result_value(position)
                    .and_then(|value| values.get(&value).cloned())
                    .ok_or_else(|| {
                        BackendError::execution(format!("result {position} was not computed"))
                    })
            })
            .collect()
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn backend_name(&self) -> &str {
        &self.name
    }

    fn supports(&self, op: &Operation) -> bool {
        self.supports_kind(op.kind())
    }

    fn compile(&self, function: &Function) -> BackendResult<()> {
        if self.is_compiled(function.id()) {
            return Ok(());
        }
        validate_function_topology(function).map_err(|err| {
            BackendError::graph(format!("{} is malformed: {err}", function.name()))
        })?;
        if let Some(node) = function
            .nodes()
            .iter()
            .find(|node| !self.supports_kind(node.op().kind()))
        {
            return Err(BackendError::unsupported(&self.name, node.op().kind()));
        }
        self.compiled
            .lock()
            .expect("cpu compile cache poisoned")
            .insert(function.id());
        log::debug!(
            "{} compiled {} ({} nodes)",
            self.name,
            function.name(),
            function.node_count()
        );
        Ok(())
    }

    fn call(
        &self,
        function: &Function,
        outputs: &[TensorRef],
        inputs: &[TensorRef],
    ) -> BackendResult<()> {
        validate_call(function, outputs, inputs)?;
        self.compile(function)?;
        let results = self.run_function(function, inputs)?;
        for (target, value) in outputs.iter().zip(&results) {
            target.write_bytes(&value.to_bytes())?;
        }
        Ok(())
    }
}

fn execute_operation(
    op: &Operation,
    inputs: &[CpuTensor],
    outputs: &[TensorSpec],
) -> BackendResult<Vec<CpuTensor>> {
    let single = |data: TensorData| -> BackendResult<Vec<CpuTensor>> {
        let spec = expect_single_spec(outputs)?.clone();
        Ok(vec![CpuTensor { spec, data }])
    };
    match op {
        Operation::Constant(literal) => single(literal_to_data(literal)?),
        Operation::ElementwiseUnary(unary) => single(op_elementwise_unary(inputs, *unary)?),
        Operation::ElementwiseBinary(binary) => single(op_elementwise_binary(inputs, *binary)?),
        Operation::Reshape(_) => single(expect_single(inputs)?.data.clone()),
        Operation::Transpose(spec) => single(op_transpose(inputs, spec)?),
        Operation::MatMul => single(op_matmul(inputs)?),
        Operation::Split(spec) => op_split(inputs, outputs, spec),
        Operation::Concat(spec) => single(op_concat(inputs, spec)?),
        Operation::Cast(spec) => single(op_cast(inputs, spec)?),
        Operation::Parameter | Operation::Result => Err(BackendError::execution(format!(
            "{} is not executable",
            op.kind()
        ))),
    }
}

fn augment_backend_error(
    error: BackendError,
    function: &Function,
    node: &Node,
    inputs: &[CpuTensor],
) -> BackendError {
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!(
                "{message} (at function `{}` node {}, {} operands [{}])",
                function.name(),
                node.id(),
                node.op().kind(),
                format_operands(inputs)
            ),
        },
        other => other,
    }
}

fn format_operands(inputs: &[CpuTensor]) -> String {
    if inputs.is_empty() {
        return String::from("<none>");
    }
    inputs
        .iter()
        .map(|tensor| tensor.spec.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn literal_to_data(literal: &TensorLiteral) -> BackendResult<TensorData> {
    let expected = literal.spec.byte_len();
    if expected != Some(literal.bytes.len()) {
        return Err(BackendError::execution(format!(
            "literal byte length {} mismatches {}",
            literal.bytes.len(),
            literal.spec
        )));
    }
    Ok(decode_data(literal.spec.dtype, &literal.bytes))
}

/// Arithmetic needed by the interpreter. Integer ops wrap; integer division checks zero.
trait Numeric: Copy + PartialOrd + Default {
    fn plus(self, rhs: Self) -> Self;
    fn minus(self, rhs: Self) -> Self;
    fn times(self, rhs: Self) -> Self;
    fn divide(self, rhs: Self) -> BackendResult<Self>;
    fn negate(self) -> Self;
    fn magnitude(self) -> Self;
    fn larger(self, rhs: Self) -> Self;
    fn smaller(self, rhs: Self) -> Self;
    fn transcendental(self, op: ElementwiseUnaryOp) -> BackendResult<Self>;
}

macro_rules! impl_float_numeric {
    ($ty:ty) => {
        impl Numeric for $ty {
            fn plus(self, rhs: Self) -> Self {
                self + rhs
            }
            fn minus(self, rhs: Self) -> Self {
                self - rhs
            }
            fn times(self, rhs: Self) -> Self {
                self * rhs
            }
            fn divide(self, rhs: Self) -> BackendResult<Self> {
                Ok(self / rhs)
            }
            fn negate(self) -> Self {
                -self
            }
            fn magnitude(self) -> Self {
                self.abs()
            }
            fn larger(self, rhs: Self) -> Self {
                self.max(rhs)
            }
            fn smaller(self, rhs: Self) -> Self {
                self.min(rhs)
            }
            fn transcendental(self, op: ElementwiseUnaryOp) -> BackendResult<Self> {
                match op {
                    ElementwiseUnaryOp::Exp => Ok(self.exp()),
                    ElementwiseUnaryOp::Log => Ok(self.ln()),
                    ElementwiseUnaryOp::Tanh => Ok(self.tanh()),
                    other => Err(BackendError::execution(format!(
                        "{other:?} is not transcendental"
                    ))),
                }
            }
        }
    };
}

macro_rules! impl_int_numeric {
    ($ty:ty) => {
        impl Numeric for $ty {
            fn plus(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            fn minus(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }
            fn times(self, rhs: Self) -> Self {
                self.wrapping_mul(rhs)
            }
            fn divide(self, rhs: Self) -> BackendResult<Self> {
                self.checked_div(rhs).ok_or_else(|| {
                    BackendError::execution(format!(
                        "integer division {self} / {rhs} is undefined"
                    ))
                })
            }
            fn negate(self) -> Self {
                self.wrapping_neg()
            }
            fn magnitude(self) -> Self {
                self.wrapping_abs()
            }
            fn larger(self, rhs: Self) -> Self {
                Ord::max(self, rhs)
            }
            fn smaller(self, rhs: Self) -> Self {
                Ord::min(self, rhs)
            }
            fn transcendental(self, op: ElementwiseUnaryOp) -> BackendResult<Self> {
                Err(BackendError::execution(format!(
                    "{op:?} requires a floating-point operand"
                )))
            }
        }
    };
}

impl_float_numeric!(f32);
impl_float_numeric!(f64);
impl_int_numeric!(i32);
impl_int_numeric!(i64);

fn unary_values<T: Numeric>(values: &[T], op: ElementwiseUnaryOp) -> BackendResult<Vec<T>> {
    values
        .iter()
        .map(|&x| match op {
            ElementwiseUnaryOp::Neg => Ok(x.negate()),
            ElementwiseUnaryOp::Abs => Ok(x.magnitude()),
            ElementwiseUnaryOp::Relu => Ok(x.larger(T::default())),
            ElementwiseUnaryOp::Exp | ElementwiseUnaryOp::Log | ElementwiseUnaryOp::Tanh => {
                x.transcendental(op)
            }
        })
        .collect()
}

fn binary_values<T: Numeric>(
    lhs: &[T],
    rhs: &[T],
    op: ElementwiseBinaryOp,
) -> BackendResult<Vec<T>> {
    if lhs.len() != rhs.len() {
        return Err(BackendError::execution("elementwise size mismatch"));
    }
    lhs.iter()
        .zip(rhs)
        .map(|(&x, &y)| match op {
            ElementwiseBinaryOp::Add => Ok(x.plus(y)),
            ElementwiseBinaryOp::Sub => Ok(x.minus(y)),
            ElementwiseBinaryOp::Mul => Ok(x.times(y)),
            ElementwiseBinaryOp::Div => x.divide(y),
            ElementwiseBinaryOp::Maximum => Ok(x.larger(y)),
            ElementwiseBinaryOp::Minimum => Ok(x.smaller(y)),
        })
        .collect()
}

fn op_elementwise_unary(
    inputs: &[CpuTensor],
    op: ElementwiseUnaryOp,
) -> BackendResult<TensorData> {
    let input = expect_single(inputs)?;
    Ok(match &input.data {
        TensorData::F32(values) => TensorData::F32(Arc::from(unary_values(values, op)?)),
        TensorData::F64(values) => TensorData::F64(Arc::from(unary_values(values, op)?)),
        TensorData::Si32(values) => TensorData::Si32(Arc::from(unary_values(values, op)?)),
        TensorData::Si64(values) => TensorData::Si64(Arc::from(unary_values(values, op)?)),
        TensorData::Bool(_) => {
            return Err(BackendError::execution(
                "elementwise unary does not support i1 tensors",
            ))
        }
    })
}

fn op_elementwise_binary(
    inputs: &[CpuTensor],
    op: ElementwiseBinaryOp,
) -> BackendResult<TensorData> {
    let [lhs, rhs] = inputs else {
        return Err(BackendError::execution(
            "elementwise binary expects 2 inputs",
        ));
    };
    Ok(match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            TensorData::F32(Arc::from(binary_values(a, b, op)?))
        }
        (TensorData::F64(a), TensorData::F64(b)) => {
            TensorData::F64(Arc::from(binary_values(a, b, op)?))
        }
        (TensorData::Si32(a), TensorData::Si32(b)) => {
            TensorData::Si32(Arc::from(binary_values(a, b, op)?))
        }
        (TensorData::Si64(a), TensorData::Si64(b)) => {
            TensorData::Si64(Arc::from(binary_values(a, b, op)?))
        }
        _ => {
            return Err(BackendError::execution(format!(
                "elementwise binary operands {} and {} are incompatible",
                lhs.spec, rhs.spec
            )))
        }
    })
}

fn matmul_values<T: Numeric>(lhs: &[T], rhs: &[T], m: usize, k: usize, n: usize) -> Vec<T> {
    let mut result = vec![T::default(); m * n];
    for i in 0..m {
        for p in 0..k {
            let a = lhs[i * k + p];
            for j in 0..n {
                let slot = &mut result[i * n + j];
                *slot = slot.plus(a.times(rhs[p * n + j]));
            }
        }
    }
    result
}

fn op_matmul(inputs: &[CpuTensor]) -> BackendResult<TensorData> {
    let [lhs, rhs] = inputs else {
        return Err(BackendError::execution("matmul expects 2 inputs"));
    };
    let (l, r) = (lhs.spec.shape.dims(), rhs.spec.shape.dims());
    if l.len() != 2 || r.len() != 2 || l[1] != r[0] {
        return Err(BackendError::execution(format!(
            "matmul shapes {} x {} are incompatible",
            lhs.spec.shape, rhs.spec.shape
        )));
    }
    let (m, k, n) = (l[0], l[1], r[1]);
    Ok(match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            TensorData::F32(Arc::from(matmul_values(a, b, m, k, n)))
        }
        (TensorData::F64(a), TensorData::F64(b)) => {
            TensorData::F64(Arc::from(matmul_values(a, b, m, k, n)))
        }
        (TensorData::Si32(a), TensorData::Si32(b)) => {
            TensorData::Si32(Arc::from(matmul_values(a, b, m, k, n)))
        }
        (TensorData::Si64(a), TensorData::Si64(b)) => {
            TensorData::Si64(Arc::from(matmul_values(a, b, m, k, n)))
        }
        _ => {
            return Err(BackendError::execution(
                "matmul operands must share a numeric dtype",
            ))
        }
    })
}

fn transpose_values<T: Copy>(values: &[T], dims: &[usize], perm: &[usize]) -> Vec<T> {
    let out_dims: Vec<usize> = perm.iter().map(|&axis| dims[axis]).collect();
    let input_strides = compute_strides(dims);
    (0..values.len())
        .map(|index| {
            let out_coord = unravel_index(index, &out_dims);
            let offset = out_coord
                .iter()
                .enumerate()
                .map(|(out_axis, &coord)| coord * input_strides[perm[out_axis]])
                .sum::<usize>();
            values[offset]
        })
        .collect()
}

fn op_transpose(inputs: &[CpuTensor], spec: &TransposeSpec) -> BackendResult<TensorData> {
    let input = expect_single(inputs)?;
    let dims = input.spec.shape.dims();
    if spec.perm.len() != dims.len() {
        return Err(BackendError::execution("transpose rank mismatch"));
    }
    Ok(map_data!(&input.data, |values| transpose_values(
        values, dims, &spec.perm
    )))
}

/// Splits `dims` around `axis` into (outer, axis length, inner) extents.
fn axis_extents(dims: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = dims[..axis].iter().product::<usize>();
    let inner = dims[axis + 1..].iter().product::<usize>();
    (outer, dims[axis], inner)
}

fn split_values<T: Copy>(
    values: &[T],
    dims: &[usize],
    axis: usize,
    sizes: &[usize],
) -> Vec<Vec<T>> {
    let (outer, length, inner) = axis_extents(dims, axis);
    let mut start = 0usize;
    sizes
        .iter()
        .map(|&size| {
            let mut chunk = Vec::with_capacity(outer * size * inner);
            for outer_idx in 0..outer {
                let base = (outer_idx * length + start) * inner;
                chunk.extend_from_slice(&values[base..base + size * inner]);
            }
            start += size;
            chunk
        })
        .collect()
}

fn op_split(
    inputs: &[CpuTensor],
    outputs: &[TensorSpec],
    spec: &SplitSpec,
) -> BackendResult<Vec<CpuTensor>> {
    let input = expect_single(inputs)?;
    let dims = input.spec.shape.dims();
    if spec.axis >= dims.len() || spec.sizes.iter().sum::<usize>() != dims[spec.axis] {
        return Err(BackendError::execution(format!(
            "split sizes {:?} do not cover axis {} of {}",
            spec.sizes, spec.axis, input.spec.shape
        )));
    }
    if outputs.len() != spec.sizes.len() {
        return Err(BackendError::execution("split output count mismatch"));
    }

    macro_rules! split_into {
        ($values:expr, $variant:ident) => {
            split_values($values, dims, spec.axis, &spec.sizes)
                .into_iter()
                .map(|chunk| TensorData::$variant(Arc::from(chunk)))
                .collect::<Vec<_>>()
        };
    }
    let chunks = match &input.data {
        TensorData::F32(values) => split_into!(values, F32),
        TensorData::F64(values) => split_into!(values, F64),
        TensorData::Si32(values) => split_into!(values, Si32),
        TensorData::Si64(values) => split_into!(values, Si64),
        TensorData::Bool(values) => split_into!(values, Bool),
    };
    Ok(outputs
        .iter()
        .cloned()
        .zip(chunks)
        .map(|(spec, data)| CpuTensor { spec, data })
        .collect())
}

fn concat_values<T: Copy>(parts: &[(&[T], usize)], out_dims: &[usize], axis: usize) -> Vec<T> {
    let (outer, _, inner) = axis_extents(out_dims, axis);
    let mut result = Vec::with_capacity(out_dims.iter().product());
    for outer_idx in 0..outer {
        for (values, axis_dim) in parts {
            let chunk = axis_dim * inner;
            let start = outer_idx * chunk;
            result.extend_from_slice(&values[start..start + chunk]);
        }
    }
    result
}

fn op_concat(inputs: &[CpuTensor], spec: &ConcatSpec) -> BackendResult<TensorData> {
    let first = inputs
        .first()
        .ok_or_else(|| BackendError::execution("concat expects at least one input"))?;
    let rank = first.spec.shape.rank();
    if spec.axis >= rank {
        return Err(BackendError::execution("concat axis out of range"));
    }
    let mut out_dims = first.spec.shape.dims().to_vec();
    out_dims[spec.axis] = inputs
        .iter()
        .map(|tensor| tensor.spec.shape.dims().get(spec.axis).copied().unwrap_or(0))
        .sum();

    macro_rules! concat_as {
        ($variant:ident) => {{
            let mut parts = Vec::with_capacity(inputs.len());
            for tensor in inputs {
                match &tensor.data {
                    TensorData::$variant(values) => {
                        parts.push((&values[..], tensor.spec.shape.dims()[spec.axis]))
                    }
                    _ => return Err(BackendError::execution("concat requires matching dtypes")),
                }
            }
            TensorData::$variant(Arc::from(concat_values(&parts, &out_dims, spec.axis)))
        }};
    }
    Ok(match &first.data {
        TensorData::F32(_) => concat_as!(F32),
        TensorData::F64(_) => concat_as!(F64),
        TensorData::Si32(_) => concat_as!(Si32),
        TensorData::Si64(_) => concat_as!(Si64),
        TensorData::Bool(_) => concat_as!(Bool),
    })
}

fn op_cast(inputs: &[CpuTensor], spec: &CastSpec) -> BackendResult<TensorData> {
    let input = expect_single(inputs)?;

    // Float to int conversions saturate and map NaN to zero, following `as`.
    macro_rules! cast_numeric {
        ($values:expr) => {
            match spec.dtype {
                DType::F32 => TensorData::F32($values.iter().map(|&v| v as f32).collect()),
                DType::F64 => TensorData::F64($values.iter().map(|&v| v as f64).collect()),
                DType::Si32 => TensorData::Si32($values.iter().map(|&v| v as i32).collect()),
                DType::Si64 => TensorData::Si64($values.iter().map(|&v| v as i64).collect()),
                DType::I1 => {
                    TensorData::Bool($values.iter().map(|&v| v as f64 != 0.0).collect())
                }
            }
        };
    }
    Ok(match &input.data {
        TensorData::F32(values) => cast_numeric!(values),
        TensorData::F64(values) => cast_numeric!(values),
        TensorData::Si32(values) => cast_numeric!(values),
        TensorData::Si64(values) => cast_numeric!(values),
        TensorData::Bool(values) => {
            let widened: Vec<u8> = values.iter().map(|&v| u8::from(v)).collect();
            cast_numeric!(widened)
        }
    })
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    if inputs.len() != 1 {
        Err(BackendError::execution("operation expects single input"))
    } else {
        Ok(&inputs[0])
    }
}

fn expect_single_spec(outputs: &[TensorSpec]) -> BackendResult<&TensorSpec> {
    match outputs {
        [spec] => Ok(spec),
        _ => Err(BackendError::execution("operation expects a single output")),
    }
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}
