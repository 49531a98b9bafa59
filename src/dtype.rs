use std::fmt;

/// Element type of a tensor value in a graph.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataType {
    Bool,
    UInt8,
    Int8,
    Int16,
    Int32,
    Int64,
    Float16,
    BFloat16,
    Float32,
    Float64,
    Complex32,
    Complex64,
    Complex128,
}

/// Broad category of a [`DataType`], ordered from least to most general.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
enum Category {
    Bool,
    Integer,
    Float,
    Complex,
}

impl DataType {
    /// Return the size of elements of this type in bytes.
    pub fn size(self) -> u8 {
        match self {
            DataType::Bool | DataType::UInt8 | DataType::Int8 => 1,
            DataType::Int16 | DataType::Float16 | DataType::BFloat16 => 2,
            DataType::Int32 | DataType::Float32 | DataType::Complex32 => 4,
            DataType::Int64 | DataType::Float64 | DataType::Complex64 => 8,
            DataType::Complex128 => 16,
        }
    }

    /// Return true if this is a real floating point type.
    pub fn is_float(self) -> bool {
        self.category() == Category::Float
    }

    pub fn is_complex(self) -> bool {
        self.category() == Category::Complex
    }

    /// Return true if this is a signed or unsigned integer type. `Bool` is
    /// not considered an integer.
    pub fn is_integer(self) -> bool {
        self.category() == Category::Integer
    }

    /// Return the type of the real and imaginary components of a complex type.
    pub fn to_real(self) -> Option<DataType> {
        match self {
            DataType::Complex32 => Some(DataType::Float16),
            DataType::Complex64 => Some(DataType::Float32),
            DataType::Complex128 => Some(DataType::Float64),
            _ => None,
        }
    }

    /// Return the complex type whose components have type `self`.
    pub fn to_complex(self) -> Option<DataType> {
        match self {
            DataType::Float16 => Some(DataType::Complex32),
            DataType::Float32 => Some(DataType::Complex64),
            DataType::Float64 => Some(DataType::Complex128),
            _ => None,
        }
    }

    fn category(self) -> Category {
        match self {
            DataType::Bool => Category::Bool,
            DataType::UInt8
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64 => Category::Integer,
            DataType::Float16 | DataType::BFloat16 | DataType::Float32 | DataType::Float64 => {
                Category::Float
            }
            DataType::Complex32 | DataType::Complex64 | DataType::Complex128 => Category::Complex,
        }
    }
}

impl fmt::Display for DataType {
    /// Format this type using the short names used by PyTorch and NumPy (eg.
    /// "float32").
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::UInt8 => "uint8",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float16 => "float16",
            DataType::BFloat16 => "bfloat16",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Complex32 => "complex32",
            DataType::Complex64 => "complex64",
            DataType::Complex128 => "complex128",
        };
        write!(f, "{}", name)
    }
}

/// Return the type that results from combining elements of types `a` and `b`
/// in an elementwise operation.
///
/// This follows PyTorch's `promote_types` rules: the result is the smallest
/// type in the more general category that can represent both inputs.
/// `uint8` and `int8` promote to `int16`, and `float16` and `bfloat16`
/// promote to `float32`.
pub fn promote_types(a: DataType, b: DataType) -> DataType {
    if a == b {
        return a;
    }

    let (lo, hi) = if a.category() <= b.category() {
        (a, b)
    } else {
        (b, a)
    };

    match (lo.category(), hi.category()) {
        (Category::Bool, _) => hi,
        (Category::Integer, Category::Integer) => promote_integers(lo, hi),
        (Category::Integer, _) => hi,
        (Category::Float, Category::Float) => promote_floats(lo, hi),
        (Category::Float, Category::Complex) => {
            // Both `to_real` and `to_complex` are defined for the types that
            // reach this branch.
            let component = hi.to_real().map(|re| promote_floats(lo, re));
            component.and_then(|c| c.to_complex()).unwrap_or(hi)
        }
        (Category::Complex, Category::Complex) => {
            if lo.size() >= hi.size() {
                lo
            } else {
                hi
            }
        }
        _ => hi,
    }
}

fn promote_integers(a: DataType, b: DataType) -> DataType {
    match (a, b) {
        (DataType::UInt8, DataType::Int8) | (DataType::Int8, DataType::UInt8) => DataType::Int16,
        (DataType::UInt8, other) | (other, DataType::UInt8) => other,
        _ if a.size() >= b.size() => a,
        _ => b,
    }
}

fn promote_floats(a: DataType, b: DataType) -> DataType {
    match (a, b) {
        (DataType::Float16, DataType::BFloat16) | (DataType::BFloat16, DataType::Float16) => {
            DataType::Float32
        }
        _ if a.size() >= b.size() => a,
        _ => b,
    }
}
