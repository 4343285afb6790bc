//! Host-side stylesheet values and their wire mapping.
//!
//! Host values mirror the wire values bijectively. Encoding
//! ([`Value::to_wire`]) fails only for shapes the compiler would reject
//! outright (malformed calculations); decoding ([`Value::from_wire`])
//! validates everything arriving from the wire so malformed traffic
//! becomes a descriptive error instead of a panic deeper in host code.

// Mirror structs are constructed field-by-field by callback code, so
// they keep fully public, exhaustive shapes.
#![allow(clippy::exhaustive_structs)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cascade_proto as proto;
pub use cascade_proto::{Calculation, CalculationOperator, CalculationValue, ListSeparator};

/// A stylesheet value crossing the compiler boundary.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Value {
    /// A string, quoted or unquoted.
    String {
        /// Text content, without quotes.
        text: String,
        /// Whether the string is quoted.
        quoted: bool,
    },
    /// A number with optional units.
    Number(Number),
    /// A color in a named color space.
    Color(Color),
    /// `true` or `false`.
    Boolean(bool),
    /// `null`.
    Null,
    /// An ordered list.
    List(List),
    /// An ordered key → value mapping.
    Map(Vec<(Value, Value)>),
    /// Positional plus keyword arguments; distinguishable at runtime from
    /// a plain list.
    ArgumentList(ArgumentList),
    /// A first-class function defined during the compilation.
    Function {
        /// Compiler-assigned id.
        id: u32,
        /// Signature, when known.
        signature: Option<String>,
    },
    /// An unsimplified `calc()`-family expression.
    Calculation(Calculation),
}

impl Value {
    /// A quoted string value.
    pub fn quoted(text: impl Into<String>) -> Self {
        Self::String {
            text: text.into(),
            quoted: true,
        }
    }

    /// An unquoted string value.
    pub fn unquoted(text: impl Into<String>) -> Self {
        Self::String {
            text: text.into(),
            quoted: false,
        }
    }

    /// A unitless number.
    pub fn number(value: f64) -> Self {
        Self::Number(Number::new(value))
    }

    /// Encodes this value for the wire.
    ///
    /// Fails with a descriptive message when the value has a shape the
    /// compiler rejects (currently: malformed calculations).
    pub fn to_wire(&self) -> Result<proto::Value, String> {
        Ok(match self {
            Self::String { text, quoted } => proto::Value::String {
                text: text.clone(),
                quoted: *quoted,
            },
            Self::Number(number) => proto::Value::Number {
                value: number.value,
                numerators: number.numerators.clone(),
                denominators: number.denominators.clone(),
            },
            Self::Color(color) => proto::Value::Color {
                space: color.space.clone(),
                channel1: color.channel1,
                channel2: color.channel2,
                channel3: color.channel3,
                alpha: color.alpha,
            },
            Self::Boolean(value) => proto::Value::Boolean(*value),
            Self::Null => proto::Value::Null,
            Self::List(list) => proto::Value::List {
                separator: list.separator,
                brackets: list.brackets,
                contents: wire_contents(&list.contents)?,
            },
            Self::Map(entries) => proto::Value::Map(
                entries
                    .iter()
                    .map(|(key, value)| {
                        Ok(proto::MapEntry {
                            key: key.to_wire()?,
                            value: value.to_wire()?,
                        })
                    })
                    .collect::<Result<_, String>>()?,
            ),
            Self::ArgumentList(args) => proto::Value::ArgumentList {
                id: args.id,
                separator: args.separator,
                contents: wire_contents(&args.contents)?,
                keywords: args
                    .keywords
                    .iter()
                    .map(|(name, value)| Ok((name.clone(), value.to_wire()?)))
                    .collect::<Result<_, String>>()?,
            },
            Self::Function { id, signature } => proto::Value::Function {
                id: *id,
                signature: signature.clone(),
            },
            Self::Calculation(calculation) => {
                validate_calculation(calculation)?;
                proto::Value::Calculation(calculation.clone())
            }
        })
    }

    /// Decodes a wire value, validating its shape.
    pub fn from_wire(wire: proto::Value) -> Result<Self, String> {
        Ok(match wire {
            proto::Value::String { text, quoted } => Self::String { text, quoted },
            proto::Value::Number {
                value,
                numerators,
                denominators,
            } => {
                if value.is_nan() {
                    return Err("number value must not be NaN".into());
                }
                Self::Number(Number {
                    value,
                    numerators,
                    denominators,
                })
            }
            proto::Value::Color {
                space,
                channel1,
                channel2,
                channel3,
                alpha,
            } => {
                if !(0.0..=1.0).contains(&alpha) {
                    return Err(format!("color alpha {alpha} is outside [0, 1]"));
                }
                Self::Color(Color {
                    space,
                    channel1,
                    channel2,
                    channel3,
                    alpha,
                })
            }
            proto::Value::Boolean(value) => Self::Boolean(value),
            proto::Value::Null => Self::Null,
            proto::Value::List {
                separator,
                brackets,
                contents,
            } => Self::List(List {
                separator,
                brackets,
                contents: host_contents(contents)?,
            }),
            proto::Value::Map(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|entry| Ok((Self::from_wire(entry.key)?, Self::from_wire(entry.value)?)))
                    .collect::<Result<_, String>>()?,
            ),
            proto::Value::ArgumentList {
                id,
                separator,
                contents,
                keywords,
            } => Self::ArgumentList(ArgumentList {
                id,
                separator,
                contents: host_contents(contents)?,
                keywords: keywords
                    .into_iter()
                    .map(|(name, value)| Ok((name, Self::from_wire(value)?)))
                    .collect::<Result<_, String>>()?,
                keywords_accessed: Arc::new(AtomicBool::new(false)),
            }),
            proto::Value::Function { id, signature } => Self::Function { id, signature },
            proto::Value::Calculation(calculation) => {
                validate_calculation(&calculation)?;
                Self::Calculation(calculation)
            }
        })
    }
}

fn wire_contents(contents: &[Value]) -> Result<Vec<proto::Value>, String> {
    contents.iter().map(Value::to_wire).collect()
}

fn host_contents(contents: Vec<proto::Value>) -> Result<Vec<Value>, String> {
    contents.into_iter().map(Value::from_wire).collect()
}

/// A number with numerator and denominator units.
#[derive(Debug, Clone, PartialEq)]
pub struct Number {
    /// Numeric value.
    pub value: f64,
    /// Numerator units, in order.
    pub numerators: Vec<String>,
    /// Denominator units, in order.
    pub denominators: Vec<String>,
}

impl Number {
    /// A unitless number.
    pub fn new(value: f64) -> Self {
        Self {
            value,
            numerators: Vec::new(),
            denominators: Vec::new(),
        }
    }

    /// A number with a single numerator unit.
    pub fn with_unit(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            numerators: vec![unit.into()],
            denominators: Vec::new(),
        }
    }
}

/// A color in a named color space.
#[derive(Debug, Clone, PartialEq)]
pub struct Color {
    /// Color space name, e.g. `rgb`.
    pub space: String,
    /// First channel.
    pub channel1: f64,
    /// Second channel.
    pub channel2: f64,
    /// Third channel.
    pub channel3: f64,
    /// Alpha channel in `[0, 1]`.
    pub alpha: f64,
}

impl Color {
    /// An opaque `rgb` color.
    pub fn rgb(red: f64, green: f64, blue: f64) -> Self {
        Self {
            space: "rgb".into(),
            channel1: red,
            channel2: green,
            channel3: blue,
            alpha: 1.0,
        }
    }
}

/// An ordered list value.
#[derive(Debug, Clone)]
pub struct List {
    /// Separator between elements.
    pub separator: ListSeparator,
    /// Whether the list is bracketed.
    pub brackets: bool,
    /// Elements.
    pub contents: Vec<Value>,
}

/// Positional arguments plus keyword arguments.
///
/// Reading the keywords is observable: the compiler only reports an
/// unknown-keyword error for an argument list whose keywords the host
/// never looked at, so access is recorded and sent back with the
/// function-call response.
#[derive(Debug, Clone)]
pub struct ArgumentList {
    /// Wire id; `0` for host-constructed lists.
    id: u32,
    /// Separator between positional arguments.
    separator: ListSeparator,
    /// Positional arguments.
    contents: Vec<Value>,
    /// Keyword arguments.
    keywords: BTreeMap<String, Value>,
    /// Set when [`ArgumentList::keywords`] is called.
    keywords_accessed: Arc<AtomicBool>,
}

impl ArgumentList {
    /// A host-constructed argument list.
    pub fn new(
        contents: Vec<Value>,
        keywords: BTreeMap<String, Value>,
        separator: ListSeparator,
    ) -> Self {
        Self {
            id: 0,
            separator,
            contents,
            keywords,
            keywords_accessed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Positional arguments.
    pub fn positional(&self) -> &[Value] {
        &self.contents
    }

    /// Keyword arguments. Calling this marks the keywords as accessed.
    pub fn keywords(&self) -> &BTreeMap<String, Value> {
        self.keywords_accessed.store(true, Ordering::Relaxed);
        &self.keywords
    }

    /// Separator between positional arguments.
    pub fn separator(&self) -> ListSeparator {
        self.separator
    }

    pub(crate) fn wire_id(&self) -> u32 {
        self.id
    }

    pub(crate) fn keywords_were_accessed(&self) -> bool {
        self.keywords_accessed.load(Ordering::Relaxed)
    }
}

/// Checks the arity rules the compiler enforces for calculations.
fn validate_calculation(calculation: &Calculation) -> Result<(), String> {
    let arity_ok = match calculation.name.as_str() {
        "calc" => calculation.arguments.len() == 1,
        "clamp" => calculation.arguments.len() == 3,
        "min" | "max" => !calculation.arguments.is_empty(),
        other => return Err(format!("unknown calculation function \"{other}\"")),
    };
    if !arity_ok {
        return Err(format!(
            "invalid number of arguments for calculation \"{}\": {}",
            calculation.name,
            calculation.arguments.len()
        ));
    }
    for argument in &calculation.arguments {
        validate_calculation_value(argument)?;
    }
    Ok(())
}

fn validate_calculation_value(value: &CalculationValue) -> Result<(), String> {
    match value {
        CalculationValue::Number { value, .. } => {
            if value.is_nan() {
                Err("calculation numbers must not be NaN".into())
            } else {
                Ok(())
            }
        }
        CalculationValue::String(_) | CalculationValue::Interpolation(_) => Ok(()),
        CalculationValue::Operation { left, right, .. } => {
            validate_calculation_value(left)?;
            validate_calculation_value(right)
        }
        CalculationValue::Calculation(nested) => validate_calculation(nested),
    }
}
