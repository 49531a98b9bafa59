//! Static tables that map graph element types to ONNX type names.
//!
//! These are consumed by model exporters when selecting an operator overload
//! whose type constraints are compatible with the types of a node's inputs.
//! The graph optimizer itself does not use them.

use crate::dtype::DataType;

/// Kind of a scalar (non-tensor) argument value in a graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScalarKind {
    Bool,
    Int,
    Float,
    Str,
}

/// Kind of a symbolic scalar, ie. a scalar whose value is only known at
/// runtime.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SymbolicKind {
    Bool,
    Int,
    Float,
}

/// Type of an ONNX operator attribute.
///
/// See <https://onnx.ai/onnx/api/classes.html#attributeproto>.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttributeType {
    Float,
    Int,
    String,
    Floats,
    Ints,
    Strings,
}

/// Return the ONNX tensor types compatible with a tensor of type `dtype`.
///
/// Returns `None` for types which have no ONNX equivalent (complex types must
/// first be converted to their real component type, see [`complex_to_float`]).
pub fn onnx_type_strings(dtype: DataType) -> Option<&'static [&'static str]> {
    let types: &'static [&'static str] = match dtype {
        DataType::BFloat16 => &["tensor(bfloat16)"],
        DataType::Bool => &["tensor(bool)"],
        DataType::Float64 => &["tensor(double)"],
        DataType::Float32 => &["tensor(float)"],
        DataType::Float16 => &["tensor(float16)"],
        DataType::Int16 => &["tensor(int16)"],
        DataType::Int32 => &["tensor(int32)"],
        DataType::Int64 => &["tensor(int64)"],
        DataType::Int8 => &["tensor(int8)"],
        DataType::UInt8 => &["tensor(uint8)"],
        DataType::Complex32 | DataType::Complex64 | DataType::Complex128 => return None,
    };
    Some(types)
}

/// Return the ONNX tensor types that a scalar argument of kind `kind` can be
/// converted to.
pub fn scalar_onnx_type_strings(kind: ScalarKind) -> &'static [&'static str] {
    match kind {
        ScalarKind::Str => &["tensor(string)"],
        ScalarKind::Int => &["tensor(int16)", "tensor(int32)", "tensor(int64)"],
        ScalarKind::Float => &["tensor(float16)", "tensor(float)", "tensor(double)"],
        ScalarKind::Bool => &["tensor(int32)", "tensor(int64)", "tensor(bool)"],
    }
}

/// Return the real type used to represent the components of a complex type.
///
/// ONNX has no complex types, so complex tensors are exported as real
/// tensors with an extra trailing dimension of size 2.
pub fn complex_to_float(dtype: DataType) -> Option<DataType> {
    dtype.to_real()
}

/// Return the tensor type used to represent a symbolic scalar.
pub fn symbolic_to_dtype(kind: SymbolicKind) -> DataType {
    match kind {
        SymbolicKind::Int => DataType::Int64,
        SymbolicKind::Float => DataType::Float32,
        SymbolicKind::Bool => DataType::Bool,
    }
}

/// Return the ONNX attribute type used for an attribute whose value is a
/// scalar, or sequence of scalars, of kind `kind`.
///
/// Booleans are stored as integers since ONNX has no boolean attribute type.
pub fn attribute_type(kind: ScalarKind, is_sequence: bool) -> AttributeType {
    match (kind, is_sequence) {
        (ScalarKind::Float, false) => AttributeType::Float,
        (ScalarKind::Int | ScalarKind::Bool, false) => AttributeType::Int,
        (ScalarKind::Str, false) => AttributeType::String,
        (ScalarKind::Float, true) => AttributeType::Floats,
        (ScalarKind::Int | ScalarKind::Bool, true) => AttributeType::Ints,
        (ScalarKind::Str, true) => AttributeType::Strings,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        attribute_type, complex_to_float, onnx_type_strings, scalar_onnx_type_strings,
        symbolic_to_dtype, AttributeType, ScalarKind, SymbolicKind,
    };
    use crate::dtype::DataType;

    #[test]
    fn test_onnx_type_strings() {
        assert_eq!(
            onnx_type_strings(DataType::Float32),
            Some(["tensor(float)"].as_slice())
        );
        assert_eq!(
            onnx_type_strings(DataType::Float64),
            Some(["tensor(double)"].as_slice())
        );
        assert_eq!(onnx_type_strings(DataType::Complex64), None);

        let float_types = scalar_onnx_type_strings(ScalarKind::Float);
        assert!(float_types.contains(&"tensor(double)"));
        assert!(!float_types.contains(&"tensor(int32)"));
        assert!(scalar_onnx_type_strings(ScalarKind::Bool).contains(&"tensor(bool)"));
    }

    #[test]
    fn test_complex_and_symbolic_types() {
        assert_eq!(complex_to_float(DataType::Complex32), Some(DataType::Float16));
        assert_eq!(complex_to_float(DataType::Complex128), Some(DataType::Float64));
        assert_eq!(complex_to_float(DataType::Float32), None);

        assert_eq!(symbolic_to_dtype(SymbolicKind::Int), DataType::Int64);
        assert_eq!(symbolic_to_dtype(SymbolicKind::Float), DataType::Float32);
        assert_eq!(symbolic_to_dtype(SymbolicKind::Bool), DataType::Bool);
    }

    #[test]
    fn test_attribute_type() {
        assert_eq!(attribute_type(ScalarKind::Bool, false), AttributeType::Int);
        assert_eq!(attribute_type(ScalarKind::Float, true), AttributeType::Floats);
        assert_eq!(attribute_type(ScalarKind::Str, true), AttributeType::Strings);
    }
}
