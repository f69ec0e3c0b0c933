//! Row filters.
//!
//! A filter decides per row whether discovery applies. Conditions test one
//! discovery macro each; the combinator joins them. Four combinators exist:
//! plain And / Or, AndOr (grouped by macro: Or within a group, And across
//! groups) and a custom expression over condition ids.
//!
//! Negative operators do not invert individual elements of an AndOr group.
//! The first condition of a group seeds the group's truth value; every
//! following condition folds into it, positive operators with Or, negative
//! operators with And. The construction-time macro sort is what makes the
//! grouping well defined.

use serde::{Deserialize, Serialize};

use crate::entry::{is_discovery_macro, Entry};
use crate::error::ConfigError;
use crate::expression::ExpressionEvaluator;
use crate::regexp::{pattern_matches, NamedExpressionProvider};

/// Condition operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    /// Pattern (literal regexp or `@name`) matches the macro value.
    Matches,
    /// Pattern does not match the macro value.
    NotMatches,
    /// Macro value equals the pattern text.
    Equals,
    /// Macro value differs from the pattern text.
    NotEquals,
    /// The macro has a value in the row.
    Exists,
    /// The macro has no value in the row.
    NotExists,
}

impl ConditionOperator {
    /// Negative operators fold into an AndOr group with And instead of Or.
    #[must_use]
    pub const fn is_negative(self) -> bool {
        matches!(self, Self::NotMatches | Self::NotEquals | Self::NotExists)
    }
}

/// One filter condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Condition id referenced by custom expressions.
    pub id: String,
    /// Discovery macro the condition tests.
    pub macro_name: String,
    /// Pattern text; meaning depends on the operator.
    pub pattern: String,
    /// Operator.
    pub operator: ConditionOperator,
}

impl FilterCondition {
    /// Creates a condition, validating the macro name syntax.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMacroName`] for a malformed macro.
    pub fn new(
        id: impl Into<String>,
        macro_name: impl Into<String>,
        pattern: impl Into<String>,
        operator: ConditionOperator,
    ) -> Result<Self, ConfigError> {
        let macro_name = macro_name.into();
        if !is_discovery_macro(&macro_name) {
            return Err(ConfigError::InvalidMacroName { name: macro_name });
        }
        Ok(Self {
            id: id.into(),
            macro_name,
            pattern: pattern.into(),
            operator,
        })
    }

    /// Evaluates the condition against an entry.
    ///
    /// The returned value already accounts for the operator's negation. A
    /// missing macro yields a non-fatal warning and counts as non-match
    /// unless the operator is an existence test.
    fn matches(
        &self,
        entry: &Entry,
        provider: &dyn NamedExpressionProvider,
        warnings: &mut Vec<String>,
    ) -> Result<bool, ConfigError> {
        match entry.get(&self.macro_name) {
            Some(value) => match self.operator {
                ConditionOperator::Matches => pattern_matches(value, &self.pattern, provider),
                ConditionOperator::NotMatches => {
                    pattern_matches(value, &self.pattern, provider).map(|m| !m)
                }
                ConditionOperator::Equals => Ok(value == self.pattern),
                ConditionOperator::NotEquals => Ok(value != self.pattern),
                ConditionOperator::Exists => Ok(true),
                ConditionOperator::NotExists => Ok(false),
            },
            None => match self.operator {
                ConditionOperator::Exists => Ok(false),
                ConditionOperator::NotExists => Ok(true),
                _ => {
                    warnings.push(format!(
                        "cannot accurately apply filter: no value received for macro \"{}\"",
                        self.macro_name
                    ));
                    Ok(false)
                }
            },
        }
    }
}

/// How conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterLogic {
    /// Grouped by macro: Or within a group, And across groups.
    #[default]
    AndOr,
    /// All conditions must match.
    And,
    /// Any condition may match.
    Or,
    /// Custom expression over condition ids.
    CustomExpression,
}

/// Serialized filter shape; [`Filter`] construction restores invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FilterConfig {
    #[serde(default)]
    logic: FilterLogic,
    #[serde(default)]
    conditions: Vec<FilterCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    formula: Option<String>,
}

/// A row filter: conditions plus a combinator.
///
/// For [`FilterLogic::AndOr`] the conditions are kept sorted by macro name;
/// the sort happens at construction so evaluation can rely on groups being
/// contiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FilterConfig", into = "FilterConfig")]
pub struct Filter {
    logic: FilterLogic,
    conditions: Vec<FilterCondition>,
    formula: Option<String>,
}

impl Filter {
    /// Creates a filter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IncompleteFilter`] when a custom-expression
    /// filter has no formula, and [`ConfigError::InvalidMacroName`] when a
    /// condition carries a malformed macro (possible on deserialized
    /// input).
    pub fn new(
        logic: FilterLogic,
        mut conditions: Vec<FilterCondition>,
        formula: Option<String>,
    ) -> Result<Self, ConfigError> {
        for condition in &conditions {
            if !is_discovery_macro(&condition.macro_name) {
                return Err(ConfigError::InvalidMacroName {
                    name: condition.macro_name.clone(),
                });
            }
        }

        if logic == FilterLogic::CustomExpression && formula.is_none() {
            return Err(ConfigError::IncompleteFilter {
                combinator: "custom_expression",
                requirement: "a formula",
            });
        }

        if logic == FilterLogic::AndOr {
            conditions.sort_by(|a, b| a.macro_name.cmp(&b.macro_name));
        }

        Ok(Self {
            logic,
            conditions,
            formula,
        })
    }

    /// A filter that matches every row.
    #[must_use]
    pub fn pass_all() -> Self {
        Self {
            logic: FilterLogic::And,
            conditions: Vec::new(),
            formula: None,
        }
    }

    /// The combinator in use.
    #[must_use]
    pub const fn logic(&self) -> FilterLogic {
        self.logic
    }

    /// The conditions, in evaluation order.
    #[must_use]
    pub fn conditions(&self) -> &[FilterCondition] {
        &self.conditions
    }

    /// The custom formula, when the combinator uses one.
    #[must_use]
    pub fn formula(&self) -> Option<&str> {
        self.formula.as_deref()
    }

    /// Evaluates the filter against an entry.
    ///
    /// Missing-macro notices are appended to `warnings`; they never fail
    /// the evaluation.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unresolvable named expressions, bad
    /// patterns or an unevaluable custom formula. These abort the rule run.
    pub fn evaluate(
        &self,
        entry: &Entry,
        provider: &dyn NamedExpressionProvider,
        evaluator: &dyn ExpressionEvaluator,
        warnings: &mut Vec<String>,
    ) -> Result<bool, ConfigError> {
        match self.logic {
            FilterLogic::AndOr => self.evaluate_and_or(entry, provider, warnings),
            FilterLogic::And => self.evaluate_and(entry, provider, warnings),
            FilterLogic::Or => self.evaluate_or(entry, provider, warnings),
            FilterLogic::CustomExpression => {
                self.evaluate_custom(entry, provider, evaluator, warnings)
            }
        }
    }

    fn evaluate_and_or(
        &self,
        entry: &Entry,
        provider: &dyn NamedExpressionProvider,
        warnings: &mut Vec<String>,
    ) -> Result<bool, ConfigError> {
        let mut total = true;
        let mut group_result = false;
        let mut group_macro: Option<&str> = None;

        for condition in &self.conditions {
            let rc = condition.matches(entry, provider, warnings)?;

            if group_macro == Some(condition.macro_name.as_str()) {
                // Fold into the open group: positive Or, negative And.
                if condition.operator.is_negative() {
                    group_result = group_result && rc;
                } else {
                    group_result = group_result || rc;
                }
            } else {
                if group_macro.is_some() {
                    total = total && group_result;
                }
                group_macro = Some(condition.macro_name.as_str());
                group_result = rc;
            }
        }

        if group_macro.is_some() {
            total = total && group_result;
        }
        Ok(total)
    }

    fn evaluate_and(
        &self,
        entry: &Entry,
        provider: &dyn NamedExpressionProvider,
        warnings: &mut Vec<String>,
    ) -> Result<bool, ConfigError> {
        for condition in &self.conditions {
            if !condition.matches(entry, provider, warnings)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn evaluate_or(
        &self,
        entry: &Entry,
        provider: &dyn NamedExpressionProvider,
        warnings: &mut Vec<String>,
    ) -> Result<bool, ConfigError> {
        for condition in &self.conditions {
            if condition.matches(entry, provider, warnings)? {
                return Ok(true);
            }
        }
        Ok(self.conditions.is_empty())
    }

    fn evaluate_custom(
        &self,
        entry: &Entry,
        provider: &dyn NamedExpressionProvider,
        evaluator: &dyn ExpressionEvaluator,
        warnings: &mut Vec<String>,
    ) -> Result<bool, ConfigError> {
        let Some(formula) = self.formula.as_deref() else {
            return Err(ConfigError::IncompleteFilter {
                combinator: "custom_expression",
                requirement: "a formula",
            });
        };

        let mut results = std::collections::HashMap::with_capacity(self.conditions.len());
        for condition in &self.conditions {
            let rc = condition.matches(entry, provider, warnings)?;
            results.insert(condition.id.as_str(), rc);
        }

        let substituted = substitute_condition_ids(formula, &results)?;
        Ok(evaluator.evaluate(&substituted)? != 0.0)
    }
}

impl TryFrom<FilterConfig> for Filter {
    type Error = ConfigError;

    fn try_from(config: FilterConfig) -> Result<Self, Self::Error> {
        Self::new(config.logic, config.conditions, config.formula)
    }
}

impl From<Filter> for FilterConfig {
    fn from(filter: Filter) -> Self {
        Self {
            logic: filter.logic,
            conditions: filter.conditions,
            formula: filter.formula,
        }
    }
}

/// Replaces every condition-id token (maximal uppercase-letter run) in the
/// formula with `1` or `0`.
fn substitute_condition_ids(
    formula: &str,
    results: &std::collections::HashMap<&str, bool>,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(formula.len());
    let mut rest = formula;

    while let Some(start) = rest.find(|c: char| c.is_ascii_uppercase()) {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let end = tail
            .find(|c: char| !c.is_ascii_uppercase())
            .unwrap_or(tail.len());
        let id = &tail[..end];
        match results.get(id) {
            Some(true) => out.push('1'),
            Some(false) => out.push('0'),
            None => {
                return Err(ConfigError::UnknownFormulaCondition { id: id.to_string() });
            }
        }
        rest = &tail[end..];
    }
    out.push_str(rest);
    Ok(out)
}
