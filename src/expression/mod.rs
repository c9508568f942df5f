//! Join expressions and their evaluation against records.
//!
//! An expression is a small AST of field references, literals and operators.
//! Evaluation is pure; field references are checked against the schema when
//! the topology is built, so `evaluate` only fails on data that does not fit
//! (an optional field absent from a record, a type clash, an overflow).

use crate::core::{Scalar, ScalarType, StreamRecord, StreamType};
use std::fmt;
use thiserror::Error;

/// Reference to a field, optionally qualified by its stream name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub stream: Option<String>,
    pub field: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Concat => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Field(FieldRef),
    Literal(Scalar),
    Negate(Box<Expr>),
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
}

impl Expr {
    /// Unqualified field reference.
    pub fn field(name: &str) -> Self {
        Expr::Field(FieldRef { stream: None, field: name.to_string() })
    }

    /// Field reference qualified with a stream name, e.g. `Speed.time_from`.
    pub fn qualified(stream: &str, name: &str) -> Self {
        Expr::Field(FieldRef { stream: Some(stream.to_string()), field: name.to_string() })
    }

    pub fn literal<V: Into<Scalar>>(value: V) -> Self {
        Expr::Literal(value.into())
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn add(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Add, self, rhs)
    }

    pub fn sub(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Sub, self, rhs)
    }

    pub fn mul(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Mul, self, rhs)
    }

    pub fn div(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Div, self, rhs)
    }

    /// All field references in evaluation order.
    pub fn field_refs(&self) -> Vec<&FieldRef> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, refs: &mut Vec<&'a FieldRef>) {
        match self {
            Expr::Field(field_ref) => refs.push(field_ref),
            Expr::Literal(_) => {}
            Expr::Negate(inner) => inner.collect_refs(refs),
            Expr::Binary { left, right, .. } => {
                left.collect_refs(refs);
                right.collect_refs(refs);
            }
        }
    }

    /// Static result type of the expression against a schema.
    pub fn infer_type(&self, schema: &StreamType) -> Result<ScalarType, TypeCheckError> {
        match self {
            Expr::Field(field_ref) => schema
                .field_def(&field_ref.field)
                .map(|def| def.ty)
                .ok_or_else(|| TypeCheckError::UnknownField(field_ref.field.clone())),
            Expr::Literal(scalar) => Ok(scalar.scalar_type()),
            Expr::Negate(inner) => {
                let ty = inner.infer_type(schema)?;
                if matches!(ty, ScalarType::Int | ScalarType::Float) {
                    Ok(ty)
                } else {
                    Err(TypeCheckError::Mismatch(format!("cannot negate {}", ty)))
                }
            }
            Expr::Binary { op, left, right } => {
                let lt = left.infer_type(schema)?;
                let rt = right.infer_type(schema)?;
                binary_result_type(*op, lt, rt).ok_or_else(|| {
                    TypeCheckError::Mismatch(format!("{} {} {}", lt, op.symbol(), rt))
                })
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Field(FieldRef { stream: Some(stream), field }) => write!(f, "{}.{}", stream, field),
            Expr::Field(FieldRef { stream: None, field }) => write!(f, "{}", field),
            Expr::Literal(scalar) => write!(f, "{}", scalar),
            Expr::Negate(inner) => write!(f, "-({})", inner),
            Expr::Binary { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
        }
    }
}

/// Per-record evaluation failure. Recoverable: the engine skips the affected
/// pair for that record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Field '{field}' is absent from {stream} record")]
    MissingField { stream: String, field: String },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Integer overflow in {0}")]
    Overflow(String),
}

/// Static type errors, reported while the topology is built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeCheckError {
    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("invalid operands: {0}")]
    Mismatch(String),
}

fn binary_result_type(op: BinaryOp, lt: ScalarType, rt: ScalarType) -> Option<ScalarType> {
    use ScalarType::{Bool, Float, Int, Str, Timestamp};

    if op.is_comparison() {
        let comparable = (lt.is_numeric() && rt.is_numeric())
            || (lt == rt && matches!(lt, Str | Bool));
        return comparable.then_some(Bool);
    }

    match (op, lt, rt) {
        (BinaryOp::Concat, Str, Str) => Some(Str),
        (BinaryOp::Concat, _, _) => None,
        (BinaryOp::Add, Timestamp, Int) | (BinaryOp::Add, Int, Timestamp) => Some(Timestamp),
        (BinaryOp::Sub, Timestamp, Int) => Some(Timestamp),
        (BinaryOp::Sub, Timestamp, Timestamp) => Some(Int),
        (_, Timestamp, _) | (_, _, Timestamp) => None,
        (_, Int, Int) => Some(Int),
        (_, Int | Float, Int | Float) => Some(Float),
        _ => None,
    }
}

/// Evaluate `expr` against one record.
pub fn evaluate(expr: &Expr, record: &StreamRecord) -> Result<Scalar, EvaluationError> {
    match expr {
        Expr::Field(field_ref) => record.get(&field_ref.field).cloned().ok_or_else(|| {
            EvaluationError::MissingField {
                stream: record.stream.clone(),
                field: field_ref.field.clone(),
            }
        }),
        Expr::Literal(scalar) => Ok(scalar.clone()),
        Expr::Negate(inner) => match evaluate(inner, record)? {
            Scalar::Int(v) => {
                v.checked_neg().map(Scalar::Int).ok_or_else(|| EvaluationError::Overflow("-".into()))
            }
            Scalar::Float(v) => Ok(Scalar::Float(-v)),
            other => Err(EvaluationError::TypeMismatch(format!("cannot negate {}", other))),
        },
        Expr::Binary { op, left, right } => {
            let lv = evaluate(left, record)?;
            let rv = evaluate(right, record)?;
            apply_binary(*op, &lv, &rv)
        }
    }
}

fn apply_binary(op: BinaryOp, lv: &Scalar, rv: &Scalar) -> Result<Scalar, EvaluationError> {
    if op.is_comparison() {
        return compare(op, lv, rv).map(Scalar::Bool);
    }

    let mismatch =
        || EvaluationError::TypeMismatch(format!("{} {} {}", lv, op.symbol(), rv));

    match (lv, rv) {
        (Scalar::Str(a), Scalar::Str(b)) if op == BinaryOp::Concat => {
            Ok(Scalar::Str(format!("{}{}", a, b)))
        }
        _ if op == BinaryOp::Concat => Err(mismatch()),
        (Scalar::Int(a), Scalar::Int(b)) => integer_op(op, *a, *b).map(Scalar::Int),
        (Scalar::Timestamp(a), Scalar::Int(b)) if matches!(op, BinaryOp::Add | BinaryOp::Sub) => {
            integer_op(op, *a, *b).map(Scalar::Timestamp)
        }
        (Scalar::Int(a), Scalar::Timestamp(b)) if op == BinaryOp::Add => {
            integer_op(op, *a, *b).map(Scalar::Timestamp)
        }
        (Scalar::Timestamp(a), Scalar::Timestamp(b)) if op == BinaryOp::Sub => {
            integer_op(op, *a, *b).map(Scalar::Int)
        }
        (Scalar::Int(_) | Scalar::Float(_), Scalar::Int(_) | Scalar::Float(_)) => {
            let (a, b) = (lv.as_f64().ok_or_else(mismatch)?, rv.as_f64().ok_or_else(mismatch)?);
            Ok(Scalar::Float(float_op(op, a, b)))
        }
        _ => Err(mismatch()),
    }
}

fn integer_op(op: BinaryOp, a: i64, b: i64) -> Result<i64, EvaluationError> {
    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div | BinaryOp::Rem if b == 0 => return Err(EvaluationError::DivisionByZero),
        BinaryOp::Div => a.checked_div(b),
        BinaryOp::Rem => a.checked_rem(b),
        _ => None,
    };
    result.ok_or_else(|| EvaluationError::Overflow(format!("{} {} {}", a, op.symbol(), b)))
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => f64::NAN,
    }
}

fn compare(op: BinaryOp, lv: &Scalar, rv: &Scalar) -> Result<bool, EvaluationError> {
    use std::cmp::Ordering;

    let ordering = match (lv, rv) {
        (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
        (Scalar::Bool(a), Scalar::Bool(b)) => Some(a.cmp(b)),
        (Scalar::Int(a) | Scalar::Timestamp(a), Scalar::Int(b) | Scalar::Timestamp(b)) => {
            Some(a.cmp(b))
        }
        (Scalar::Int(a) | Scalar::Timestamp(a), Scalar::Float(b)) => cmp_int_float(*a, *b),
        (Scalar::Float(a), Scalar::Int(b) | Scalar::Timestamp(b)) => {
            cmp_int_float(*b, *a).map(Ordering::reverse)
        }
        // IEEE-754: any comparison involving NaN is unordered.
        (Scalar::Float(a), Scalar::Float(b)) => a.partial_cmp(b),
        _ => {
            return Err(EvaluationError::TypeMismatch(format!(
                "{} {} {}",
                lv,
                op.symbol(),
                rv
            )))
        }
    };

    Ok(match (op, ordering) {
        (BinaryOp::Ne, None) => true,
        (_, None) => false,
        (BinaryOp::Eq, Some(o)) => o == Ordering::Equal,
        (BinaryOp::Ne, Some(o)) => o != Ordering::Equal,
        (BinaryOp::Lt, Some(o)) => o == Ordering::Less,
        (BinaryOp::Le, Some(o)) => o != Ordering::Greater,
        (BinaryOp::Gt, Some(o)) => o == Ordering::Greater,
        (BinaryOp::Ge, Some(o)) => o != Ordering::Less,
        _ => false,
    })
}

/// Exact ordering of an integer against a float, without rounding the integer
/// to `f64`. Agrees with [`CorrelationKey`]: equal exactly when both produce
/// the same key.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn cmp_int_float(i: i64, f: f64) -> Option<std::cmp::Ordering> {
    use std::cmp::Ordering;

    if f.is_nan() {
        return None;
    }
    // i64::MIN as f64 is exactly -2^63; i64::MAX as f64 rounds up to 2^63.
    if f >= i64::MAX as f64 {
        return Some(Ordering::Less);
    }
    if f < i64::MIN as f64 {
        return Some(Ordering::Greater);
    }
    let whole = f.trunc();
    Some(i.cmp(&(whole as i64)).then_with(|| {
        let fraction = f - whole;
        if fraction > 0.0 {
            Ordering::Less
        } else if fraction < 0.0 {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }))
}

/// Hashable form of an evaluated scalar used to index buffered records.
///
/// Integral floats and timestamps collapse onto the integer key so that
/// `3`, `3.0` and a timestamp of `3` correlate. NaN has no key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CorrelationKey {
    Int(i64),
    Float(u64),
    Str(String),
    Bool(bool),
}

impl CorrelationKey {
    #[allow(clippy::cast_precision_loss)]
    pub fn from_scalar(scalar: &Scalar) -> Option<Self> {
        match scalar {
            Scalar::Int(v) | Scalar::Timestamp(v) => Some(CorrelationKey::Int(*v)),
            Scalar::Float(v) if v.is_nan() => None,
            Scalar::Float(v) => {
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64 {
                    Some(CorrelationKey::Int(*v as i64))
                } else {
                    Some(CorrelationKey::Float(v.to_bits()))
                }
            }
            Scalar::Str(v) => Some(CorrelationKey::Str(v.clone())),
            Scalar::Bool(v) => Some(CorrelationKey::Bool(*v)),
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Int(v) => write!(f, "{}", v),
            CorrelationKey::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            CorrelationKey::Str(v) => write!(f, "'{}'", v),
            CorrelationKey::Bool(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(time: i64, x: i64) -> StreamRecord {
        StreamRecord::new("Location").with("time", time).with("x", x).with("name", "r2")
    }

    #[test]
    fn test_field_and_arithmetic() {
        let expr = Expr::field("time").add(Expr::literal(5));
        assert_eq!(evaluate(&expr, &location(10, 0)).unwrap(), Scalar::Int(15));
    }

    #[test]
    fn test_int_float_promotion() {
        let expr = Expr::field("x").mul(Expr::literal(0.5));
        assert_eq!(evaluate(&expr, &location(0, 3)).unwrap(), Scalar::Float(1.5));
    }

    #[test]
    fn test_missing_field() {
        let err = evaluate(&Expr::field("speed"), &location(0, 0)).unwrap_err();
        assert_eq!(
            err,
            EvaluationError::MissingField { stream: "Location".to_string(), field: "speed".to_string() }
        );
    }

    #[test]
    fn test_division_by_zero_and_overflow() {
        let div = Expr::field("time").div(Expr::literal(0));
        assert_eq!(evaluate(&div, &location(1, 0)).unwrap_err(), EvaluationError::DivisionByZero);

        let overflow = Expr::literal(i64::MAX).add(Expr::literal(1));
        assert!(matches!(evaluate(&overflow, &location(1, 0)), Err(EvaluationError::Overflow(_))));
    }

    #[test]
    fn test_string_plus_int_is_mismatch() {
        let expr = Expr::field("name").add(Expr::literal(1));
        assert!(matches!(evaluate(&expr, &location(0, 0)), Err(EvaluationError::TypeMismatch(_))));
    }

    #[test]
    fn test_concat_requires_strings() {
        let ok = Expr::binary(BinaryOp::Concat, Expr::field("name"), Expr::literal("-a"));
        assert_eq!(evaluate(&ok, &location(0, 0)).unwrap(), Scalar::Str("r2-a".to_string()));
    }

    #[test]
    fn test_nan_never_equal() {
        let nan = Expr::literal(f64::NAN);
        let eq = Expr::binary(BinaryOp::Eq, nan.clone(), nan.clone());
        let ne = Expr::binary(BinaryOp::Ne, nan.clone(), nan);
        assert_eq!(evaluate(&eq, &location(0, 0)).unwrap(), Scalar::Bool(false));
        assert_eq!(evaluate(&ne, &location(0, 0)).unwrap(), Scalar::Bool(true));
        assert_eq!(CorrelationKey::from_scalar(&Scalar::Float(f64::NAN)), None);
    }

    #[test]
    fn test_cross_type_comparison() {
        let eq = Expr::binary(BinaryOp::Eq, Expr::literal(3), Expr::literal(3.0));
        assert_eq!(evaluate(&eq, &location(0, 0)).unwrap(), Scalar::Bool(true));
        assert_eq!(
            CorrelationKey::from_scalar(&Scalar::Float(3.0)),
            CorrelationKey::from_scalar(&Scalar::Int(3))
        );
        assert_ne!(
            CorrelationKey::from_scalar(&Scalar::Float(3.5)),
            CorrelationKey::from_scalar(&Scalar::Int(3))
        );
    }

    #[test]
    fn test_large_int_float_equality_matches_keys() {
        // 2^53 + 1 has no f64 representation; rounding it would make it equal
        // to 2^53 as a float.
        let big = 9_007_199_254_740_993_i64;
        let near = 9_007_199_254_740_992.0_f64;
        let record = location(0, 0);

        let eq = Expr::binary(BinaryOp::Eq, Expr::literal(big), Expr::literal(near));
        assert_eq!(evaluate(&eq, &record).unwrap(), Scalar::Bool(false));
        assert_ne!(
            CorrelationKey::from_scalar(&Scalar::Int(big)),
            CorrelationKey::from_scalar(&Scalar::Float(near))
        );

        let gt = Expr::binary(BinaryOp::Gt, Expr::literal(big), Expr::literal(near));
        assert_eq!(evaluate(&gt, &record).unwrap(), Scalar::Bool(true));
        let lt = Expr::binary(BinaryOp::Lt, Expr::literal(-2.5), Expr::literal(-2));
        assert_eq!(evaluate(&lt, &record).unwrap(), Scalar::Bool(true));

        let exact = Expr::binary(BinaryOp::Eq, Expr::literal(near), Expr::literal(big - 1));
        assert_eq!(evaluate(&exact, &record).unwrap(), Scalar::Bool(true));
        assert_eq!(
            CorrelationKey::from_scalar(&Scalar::Float(near)),
            CorrelationKey::from_scalar(&Scalar::Int(big - 1))
        );
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let record = StreamRecord::new("T").with("at", Scalar::Timestamp(1_000));
        let shifted = Expr::field("at").add(Expr::literal(500));
        assert_eq!(evaluate(&shifted, &record).unwrap(), Scalar::Timestamp(1_500));

        let span = Expr::field("at").sub(Expr::literal(Scalar::Timestamp(400)));
        assert_eq!(evaluate(&span, &record).unwrap(), Scalar::Int(600));
    }

    #[test]
    fn test_infer_type() {
        let schema = StreamType::new("Location")
            .field("time", ScalarType::Int)
            .field("name", ScalarType::Str);

        assert_eq!(Expr::field("time").add(Expr::literal(1.0)).infer_type(&schema), Ok(ScalarType::Float));
        assert!(matches!(
            Expr::field("name").add(Expr::literal(1)).infer_type(&schema),
            Err(TypeCheckError::Mismatch(_))
        ));
        assert_eq!(
            Expr::field("speed").infer_type(&schema),
            Err(TypeCheckError::UnknownField("speed".to_string()))
        );
    }
}
