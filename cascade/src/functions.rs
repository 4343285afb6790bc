//! Custom-function registration and invocation.
//!
//! Signatures are parsed once, at compile entry, into their canonical
//! form; invalid signatures are rejected before any compile work begins.
//! Lookup treats `_` and `-` as interchangeable in the function name,
//! while error messages keep the spelling the function was registered
//! under.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cascade_proto::{FunctionCallResult, Value as WireValue};
use tracing::debug;

use crate::error::{BoxError, Error, Result};
use crate::value::Value;

/// A host-registered stylesheet function.
pub type CustomFunction =
    dyn Fn(&[Value]) -> std::result::Result<Value, BoxError> + Send + Sync;

/// Replaces every `_` with `-`, the equivalence the compiler applies to
/// identifier lookup.
pub(crate) fn dash_normalize(name: &str) -> String {
    name.replace('_', "-")
}

/// One declared parameter of a registered signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Parameter {
    /// Name, without the `$`.
    pub(crate) name: String,
    /// Default value expression, verbatim, if declared.
    pub(crate) default: Option<String>,
}

/// A registered signature, parsed into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Signature {
    /// Original spelling of the whole signature.
    pub(crate) text: String,
    /// Function name as registered.
    pub(crate) name: String,
    /// Dash-normalized name used for lookup.
    pub(crate) canonical: String,
    /// Declared parameters, in order.
    pub(crate) parameters: Vec<Parameter>,
    /// Name of the trailing `$args...` rest parameter, if declared.
    pub(crate) rest: Option<String>,
}

/// Parses a `"name($params)"` signature string.
///
/// Rejected shapes: missing or unbalanced parentheses, whitespace around
/// the name or parentheses, a leading `$`, and parameters that do not
/// start with `$`.
pub(crate) fn parse_signature(text: &str) -> Result<Signature> {
    let invalid = || Error::Host(format!("invalid function signature \"{text}\""));

    let Some((name, rest)) = text.split_once('(') else {
        return Err(invalid());
    };
    let Some(params) = rest.strip_suffix(')') else {
        return Err(invalid());
    };
    if !is_identifier(name) {
        return Err(invalid());
    }

    let mut parameters = Vec::new();
    let mut rest_param = None;
    for raw in split_parameters(params) {
        let declaration = raw.trim();
        if declaration.is_empty() {
            return Err(invalid());
        }
        if rest_param.is_some() {
            // Nothing may follow the rest parameter.
            return Err(invalid());
        }
        if let Some(rest_declaration) = declaration.strip_suffix("...") {
            let rest_name = rest_declaration
                .strip_prefix('$')
                .filter(|n| is_identifier(n))
                .ok_or_else(invalid)?;
            rest_param = Some(rest_name.to_owned());
            continue;
        }
        let (declared_name, default) = match declaration.split_once(':') {
            Some((head, tail)) => (head.trim_end(), Some(tail.trim().to_owned())),
            None => (declaration, None),
        };
        let param_name = declared_name
            .strip_prefix('$')
            .filter(|n| is_identifier(n))
            .ok_or_else(invalid)?;
        parameters.push(Parameter {
            name: param_name.to_owned(),
            default,
        });
    }

    Ok(Signature {
        text: text.to_owned(),
        name: name.to_owned(),
        canonical: dash_normalize(name),
        parameters,
        rest: rest_param,
    })
}

/// `true` for a CSS-style identifier: starts with a letter, `_`, or `-`,
/// continues with letters, digits, `_`, or `-`.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_' || first == '-')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Splits a parameter list on top-level commas, leaving commas inside
/// parenthesized default values alone.
fn split_parameters(params: &str) -> Vec<&str> {
    if params.trim().is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (index, c) in params.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&params[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    out.push(&params[start..]);
    out
}

/// A parsed signature paired with its callback.
struct Registered {
    signature: Signature,
    callback: Arc<CustomFunction>,
}

/// Per-compilation table of custom functions, keyed by canonical name.
#[derive(Default)]
pub(crate) struct FunctionStore {
    by_name: HashMap<String, Registered>,
}

impl fmt::Debug for FunctionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionStore")
            .field("registered", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionStore {
    /// Parses and registers every `(signature, callback)` pair, rejecting
    /// invalid signatures and duplicate names eagerly.
    pub(crate) fn build(functions: &[(String, Arc<CustomFunction>)]) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(functions.len());
        for (text, callback) in functions {
            let signature = parse_signature(text)?;
            let canonical = signature.canonical.clone();
            if by_name
                .insert(
                    canonical,
                    Registered {
                        signature,
                        callback: Arc::clone(callback),
                    },
                )
                .is_some()
            {
                return Err(Error::Host(format!(
                    "function \"{text}\" conflicts with an existing registration"
                )));
            }
        }
        Ok(Self { by_name })
    }

    /// Signatures in their original spelling, for the compile request.
    pub(crate) fn wire_signatures(&self) -> Vec<String> {
        self.by_name
            .values()
            .map(|registered| registered.signature.text.clone())
            .collect()
    }

    /// Invokes the function registered under `name` with wire arguments.
    ///
    /// Returns the wire result plus the ids of argument lists whose
    /// keywords the callback accessed. Every failure mode (unknown name,
    /// undecodable argument, callback error, unencodable return value)
    /// is mapped to an error-string result for the compiler to attach to
    /// the call site.
    pub(crate) fn invoke(
        &self,
        name: &str,
        arguments: Vec<WireValue>,
    ) -> (FunctionCallResult, Vec<u32>) {
        let Some(registered) = self.by_name.get(&dash_normalize(name)) else {
            return (
                FunctionCallResult::Error(format!("no function registered named \"{name}\"")),
                Vec::new(),
            );
        };

        let mut decoded = Vec::with_capacity(arguments.len());
        for argument in arguments {
            match Value::from_wire(argument) {
                Ok(value) => decoded.push(value),
                Err(message) => return (FunctionCallResult::Error(message), Vec::new()),
            }
        }

        let outcome = (registered.callback)(&decoded);
        let accessed = accessed_argument_lists(&decoded);
        match outcome {
            Ok(value) => match value.to_wire() {
                Ok(wire) => (FunctionCallResult::Success(wire), accessed),
                Err(message) => {
                    debug!(
                        function = registered.signature.name,
                        "callback returned an unencodable value"
                    );
                    (FunctionCallResult::Error(message), accessed)
                }
            },
            Err(error) => (FunctionCallResult::Error(error.to_string()), accessed),
        }
    }
}

/// Ids of wire-originated argument lists whose keywords were read.
fn accessed_argument_lists(arguments: &[Value]) -> Vec<u32> {
    arguments
        .iter()
        .filter_map(|value| match value {
            Value::ArgumentList(args)
                if args.wire_id() != 0 && args.keywords_were_accessed() =>
            {
                Some(args.wire_id())
            }
            _ => None,
        })
        .collect()
}
