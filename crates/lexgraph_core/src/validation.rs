//! Attribute constraint checks.
//!
//! Checks return failure values instead of erroring, so callers decide
//! whether and how to record them.

use crate::graph::ObjectGraph;
use crate::model::id::Handle;
use crate::model::meta::FieldId;
use crate::model::value::{FieldValue, ScalarValue};
use crate::session::SessionResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintFailure {
    pub object: Handle,
    pub field: FieldId,
    pub message: String,
    /// Character offset of the problem, when it has one.
    pub position: Option<usize>,
}

impl ConstraintFailure {
    /// Text stored on the object while the failure stands.
    pub fn summary(&self) -> String {
        match self.position {
            Some(position) => format!("{} (at {})", self.message, position),
            None => self.message.clone(),
        }
    }
}

/// Runs every constraint that applies to the object's class.
pub fn check_constraints(graph: &ObjectGraph, handle: Handle) -> SessionResult<Vec<ConstraintFailure>> {
    let catalog = graph.catalog();
    let class = graph.class_of(handle)?;
    let mut failures = Vec::new();
    if Some(class) == catalog.class_id("PhEnvironment") {
        let field = catalog.resolve("PhEnvironment", "StringRepresentation")?;
        if let Some(FieldValue::Scalar(ScalarValue::Unicode(pattern))) = graph.field(handle, field)? {
            if let Err((message, position)) = check_environment_pattern(&pattern) {
                failures.push(ConstraintFailure {
                    object: handle,
                    field,
                    message,
                    position: Some(position),
                });
            }
        }
    }
    Ok(failures)
}

/// Structural well-formedness of a phonological environment such as
/// `/ [C] _ #`: leading slash, one environment bar, balanced non-empty
/// brackets.
pub fn check_environment_pattern(pattern: &str) -> Result<(), (String, usize)> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut bar: Option<usize> = None;
    let mut first_significant = None;
    let mut previous: Option<char> = None;

    for (position, ch) in pattern.chars().enumerate() {
        if !ch.is_whitespace() && first_significant.is_none() {
            first_significant = Some((position, ch));
        }
        match ch {
            '[' | '(' | '{' => stack.push((ch, position)),
            ']' | ')' | '}' => {
                let expected = match ch {
                    ']' => '[',
                    ')' => '(',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {
                        if previous == Some(open) {
                            return Err((format!("empty `{open}{ch}` group"), position));
                        }
                    }
                    Some((open, _)) => {
                        return Err((format!("`{ch}` closes `{open}`"), position));
                    }
                    None => return Err((format!("unmatched `{ch}`"), position)),
                }
            }
            '_' => {
                if bar.is_some() {
                    return Err(("more than one `_`".to_string(), position));
                }
                bar = Some(position);
            }
            _ => {}
        }
        if !ch.is_whitespace() {
            previous = Some(ch);
        }
    }

    match first_significant {
        Some((_, '/')) => {}
        Some((position, _)) => return Err(("environment must start with `/`".to_string(), position)),
        None => return Err(("environment is empty".to_string(), 0)),
    }
    if let Some((open, position)) = stack.pop() {
        return Err((format!("unclosed `{open}`"), position));
    }
    if bar.is_none() {
        return Err(("missing `_`".to_string(), pattern.chars().count()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::check_environment_pattern;

    #[test]
    fn accepts_well_formed_environments() {
        assert!(check_environment_pattern("/ _ #").is_ok());
        assert!(check_environment_pattern("/ [C] _ ([V])").is_ok());
        assert!(check_environment_pattern("  /_{a}").is_ok());
    }

    #[test]
    fn reports_bracket_problems_with_positions() {
        assert_eq!(
            check_environment_pattern("/ [C _").unwrap_err(),
            ("unclosed `[`".to_string(), 2)
        );
        assert_eq!(
            check_environment_pattern("/ C] _").unwrap_err().1,
            3
        );
        assert!(check_environment_pattern("/ [C) _").is_err());
        assert!(check_environment_pattern("/ [ ] _").is_err());
    }

    #[test]
    fn requires_slash_and_single_bar() {
        assert!(check_environment_pattern("[C] _").is_err());
        assert!(check_environment_pattern("/ [C]").is_err());
        assert!(check_environment_pattern("/ _ _").is_err());
        assert!(check_environment_pattern("").is_err());
    }
}
