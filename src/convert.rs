//! Conversion of evalexpr parse trees into rate-constant expressions.
//!
//! A reaction rate such as `kf*__s0*__s1` is a mass-action product: the rate
//! constant multiplied by species placeholders. cupSODA only wants the rate
//! constant, so conversion happens in two steps:
//!
//! 1. `mass_action_factors` splits the top-level product into factors and
//!    drops the species placeholders (`__s0`, `__s1^2`, ...)
//! 2. `build_ast` converts each remaining factor into our `Expr`, resolving
//!    identifiers against the rate-parameter map
//!
//! A placeholder anywhere else (e.g. a Michaelis-Menten denominator) or an
//! identifier that is not a parameter makes the rate unusable and is an error.

use std::collections::{HashMap, HashSet};

use crate::{
    errors::ConvertError,
    expr::{Expr, VarRef},
};
use evalexpr::{Node, Operator, Value};

/// Whether an identifier names a species population placeholder.
///
/// Placeholders are any number of leading underscores, an `s`, and a species
/// index, e.g. `__s12`.
pub fn is_species_placeholder(identifier: &str) -> bool {
    let rest = identifier.trim_start_matches('_');
    match rest.strip_prefix('s') {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Collects every identifier read anywhere in `node`.
pub fn extract_identifiers(node: &Node, identifiers: &mut HashSet<String>) {
    match node.operator() {
        Operator::VariableIdentifierRead { identifier } => {
            identifiers.insert(identifier.to_string());
        }
        _ => {
            for child in node.children() {
                extract_identifiers(child, identifiers);
            }
        }
    }
}

/// Splits the top-level product of a rate law into the factors that make up
/// its rate constant.
///
/// Species placeholders and integer powers of placeholders are dropped; every
/// other factor is returned in source order.
pub fn mass_action_factors(node: &Node) -> Result<Vec<&Node>, ConvertError> {
    let mut factors = Vec::new();
    collect_factors(node, &mut factors)?;
    Ok(factors
        .into_iter()
        .filter(|factor| !is_placeholder_factor(factor))
        .collect())
}

fn collect_factors<'a>(node: &'a Node, out: &mut Vec<&'a Node>) -> Result<(), ConvertError> {
    match node.operator() {
        Operator::RootNode => match node.children() {
            [child] => collect_factors(child, out),
            children => Err(ConvertError::RootNode(format!("{children:?}"))),
        },
        Operator::Mul => {
            for child in node.children() {
                collect_factors(child, out)?;
            }
            Ok(())
        }
        _ => {
            out.push(node);
            Ok(())
        }
    }
}

fn is_placeholder_factor(node: &Node) -> bool {
    match node.operator() {
        Operator::VariableIdentifierRead { identifier } => is_species_placeholder(identifier),
        Operator::Exp => match node.children() {
            [base, exponent] => {
                is_placeholder_factor(base)
                    && matches!(exponent.operator(), Operator::Const { value: Value::Int(_) })
            }
            _ => false,
        },
        Operator::RootNode => match node.children() {
            [child] => is_placeholder_factor(child),
            _ => false,
        },
        _ => false,
    }
}

/// Converts an evalexpr AST node into our internal expression representation.
///
/// # Arguments
/// * `node` - The evalexpr AST node to convert
/// * `var_map` - A mapping of rate-parameter names to their slot in the parameter row
///
/// # Supported operations
/// * Basic arithmetic: +, -, *, /
/// * Parameters and numeric literals
/// * Functions: abs, exp, ln/log, sqrt
/// * Exponentiation by an integer or float constant
pub fn build_ast(node: &Node, var_map: &HashMap<String, u32>) -> Result<Expr, ConvertError> {
    let children = node.children();
    let binary = |make: fn(Box<Expr>, Box<Expr>) -> Expr| -> Result<Expr, ConvertError> {
        let mut iter = children.iter();
        let first = iter.next().ok_or_else(|| {
            ConvertError::UnsupportedOperator(format!("{:?} without operands", node.operator()))
        })?;
        iter.try_fold(build_ast(first, var_map)?, |acc, child| {
            Ok(make(Box::new(acc), Box::new(build_ast(child, var_map)?)))
        })
    };

    match node.operator() {
        Operator::Add => binary(Expr::Add),
        Operator::Sub => binary(Expr::Sub),
        Operator::Mul => binary(Expr::Mul),
        Operator::Div => binary(Expr::Div),
        Operator::Neg => Ok(Expr::Neg(Box::new(single_child(node, var_map)?))),
        Operator::Const { value } => match value {
            Value::Float(f) => Ok(Expr::Const(*f)),
            Value::Int(i) => Ok(Expr::Const(*i as f64)),
            _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
        },
        Operator::VariableIdentifierRead { identifier } => {
            if is_species_placeholder(identifier) {
                return Err(ConvertError::NotMassAction(format!(
                    "species placeholder {identifier} outside the rate-constant product"
                )));
            }
            let index = var_map
                .get(identifier.as_str())
                .ok_or_else(|| ConvertError::UnresolvedToken(identifier.to_string()))?;
            Ok(Expr::Var(VarRef {
                name: identifier.to_string(),
                index: *index,
            }))
        }
        Operator::FunctionIdentifier { identifier } => {
            let arg = Box::new(single_child(node, var_map)?);
            match identifier.as_str() {
                "abs" => Ok(Expr::Abs(arg)),
                "ln" | "log" => Ok(Expr::Ln(arg)),
                "sqrt" => Ok(Expr::Sqrt(arg)),
                "exp" => Ok(Expr::Exp(arg)),
                _ => Err(ConvertError::UnsupportedFunction(identifier.to_string())),
            }
        }
        Operator::RootNode => match children {
            [child] => build_ast(child, var_map),
            _ => Err(ConvertError::RootNode(format!("{children:?}"))),
        },
        Operator::Exp => {
            let [base, exponent] = children else {
                return Err(ConvertError::ExpOperator(format!(
                    "expected 2 operands, got {}",
                    children.len()
                )));
            };
            let base = Box::new(build_ast(base, var_map)?);
            match exponent.operator() {
                Operator::Const {
                    value: Value::Int(exp),
                } => Ok(Expr::Pow(base, *exp)),
                Operator::Const {
                    value: Value::Float(exp),
                } => Ok(Expr::PowFloat(base, *exp)),
                other => Err(ConvertError::ExpOperator(format!(
                    "exponent must be a numeric constant, got {other:?}"
                ))),
            }
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}

fn single_child(node: &Node, var_map: &HashMap<String, u32>) -> Result<Expr, ConvertError> {
    match node.children() {
        [child] => build_ast(child, var_map),
        children => Err(ConvertError::UnsupportedOperator(format!(
            "{:?} expects one operand, got {}",
            node.operator(),
            children.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalexpr::{build_operator_tree, DefaultNumericTypes};

    fn parse(s: &str) -> Node {
        build_operator_tree::<DefaultNumericTypes>(s).unwrap()
    }

    fn params(names: &[&str]) -> HashMap<String, u32> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_string(), i as u32))
            .collect()
    }

    #[test]
    fn test_species_placeholder_convention() {
        assert!(is_species_placeholder("__s0"));
        assert!(is_species_placeholder("s12"));
        assert!(is_species_placeholder("_s3"));
        assert!(!is_species_placeholder("__s"));
        assert!(!is_species_placeholder("scale"));
        assert!(!is_species_placeholder("kf"));
        assert!(!is_species_placeholder("__s1x"));
    }

    #[test]
    fn test_extract_identifiers() {
        let mut found = HashSet::new();
        extract_identifiers(&parse("kf*__s0 + exp(kr)/2"), &mut found);
        let mut found: Vec<_> = found.into_iter().collect();
        found.sort();
        assert_eq!(found, vec!["__s0", "kf", "kr"]);
    }

    #[test]
    fn test_mass_action_factors() {
        let node = parse("kf*__s0*__s1^2*2");
        let factors = mass_action_factors(&node).unwrap();
        assert_eq!(factors.len(), 2);
        let expr = Expr::product(
            factors
                .into_iter()
                .map(|f| build_ast(f, &params(&["kf"])))
                .collect::<Result<Vec<_>, _>>()
                .unwrap(),
        );
        assert_eq!(expr.flatten().eval(&[3.0]), 6.0);
    }

    #[test]
    fn test_pure_placeholder_product() {
        let node = parse("__s0*__s1");
        assert!(mass_action_factors(&node).unwrap().is_empty());
    }

    #[test]
    fn test_build_ast_arithmetic() {
        let map = params(&["kf", "vol"]);
        let expr = build_ast(&parse("(kf + 1) / vol - abs(-2) + sqrt(4) + ln(1)"), &map)
            .unwrap();
        assert_eq!(expr.flatten().eval(&[3.0, 2.0]), 2.0);
    }

    #[test]
    fn test_build_ast_float_exponent() {
        let expr = build_ast(&parse("kf^0.5"), &params(&["kf"])).unwrap();
        assert_eq!(expr.flatten().eval(&[9.0]), 3.0);
    }

    #[test]
    fn test_unresolved_token() {
        let err = build_ast(&parse("kf*unknown"), &params(&["kf"])).unwrap_err();
        assert!(matches!(err, ConvertError::UnresolvedToken(ref t) if t == "unknown"));
    }

    #[test]
    fn test_nested_placeholder_is_not_mass_action() {
        let node = parse("vmax*__s0/(km + __s0)");
        let factors = mass_action_factors(&node).unwrap();
        let map = params(&["vmax", "km"]);
        let result: Result<Vec<_>, _> = factors.into_iter().map(|f| build_ast(f, &map)).collect();
        assert!(matches!(result, Err(ConvertError::NotMassAction(_))));
    }

    #[test]
    fn test_unsupported_function() {
        let err = build_ast(&parse("sin(kf)"), &params(&["kf"])).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedFunction(_)));
    }
}
