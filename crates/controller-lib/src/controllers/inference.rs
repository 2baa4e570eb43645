//! Fuzzy rule inference
//!
//! A small Mamdani-style engine with Larsen implication:
//! - conjunction: minimum
//! - implication: product
//! - accumulation: algebraic sum over the implied set of every fired rule,
//!   so rules sharing a consequent are not merged first
//! - defuzzification: centroid over the output range
//!
//! An output with zero area (no rule fired) defuzzifies to `None`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of samples used to integrate the output for the centroid
const CENTROID_RESOLUTION: usize = 200;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    #[error("unknown variable {0}")]
    UnknownVariable(String),

    #[error("unknown term {term} for variable {variable}")]
    UnknownTerm { variable: String, term: String },

    #[error("expected {expected} inputs, got {actual}")]
    InputCount { expected: usize, actual: usize },
}

/// Membership function of a linguistic term
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Membership {
    /// Zero at `start`, one at `end`, linear in between; flat beyond
    Ramp { start: f64, end: f64 },
    /// Zero outside `[a, c]`, one at `b`
    Triangle { a: f64, b: f64, c: f64 },
}

impl Membership {
    pub fn degree(&self, x: f64) -> f64 {
        if !x.is_finite() {
            return 0.0;
        }
        match *self {
            Membership::Ramp { start, end } => {
                if start == end {
                    return 0.0;
                }
                if start < end {
                    if x <= start {
                        0.0
                    } else if x >= end {
                        1.0
                    } else {
                        (x - start) / (end - start)
                    }
                } else if x >= start {
                    0.0
                } else if x <= end {
                    1.0
                } else {
                    (start - x) / (start - end)
                }
            }
            Membership::Triangle { a, b, c } => {
                if x < a || x > c {
                    0.0
                } else if x == b {
                    1.0
                } else if x < b {
                    if b == a {
                        1.0
                    } else {
                        (x - a) / (b - a)
                    }
                } else if c == b {
                    1.0
                } else {
                    (c - x) / (c - b)
                }
            }
        }
    }
}

/// A named fuzzy set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub name: String,
    pub membership: Membership,
}

/// A named variable with its terms and range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinguisticVariable {
    pub name: String,
    pub range: (f64, f64),
    pub terms: Vec<Term>,
}

impl LinguisticVariable {
    pub fn new(name: impl Into<String>, range: (f64, f64)) -> Self {
        Self {
            name: name.into(),
            range,
            terms: Vec::new(),
        }
    }

    pub fn term(mut self, name: impl Into<String>, membership: Membership) -> Self {
        self.terms.push(Term {
            name: name.into(),
            membership,
        });
        self
    }

    fn term_index(&self, name: &str) -> Result<usize, InferenceError> {
        self.terms
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| InferenceError::UnknownTerm {
                variable: self.name.clone(),
                term: name.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Rule {
    /// `(input index, term index)` pairs joined by AND
    antecedent: Vec<(usize, usize)>,
    consequent: usize,
    weight: f64,
}

/// Evaluates a fuzzy rule base for crisp inputs
pub trait InferenceEngine: Send + Sync {
    /// Input variable names, in the order `infer` expects them
    fn inputs(&self) -> Vec<&str>;

    /// Crisp output, `None` when no rule fired
    fn infer(&self, inputs: &[f64]) -> Result<Option<f64>, InferenceError>;
}

/// Rule base with Larsen implication and centroid defuzzification
#[derive(Debug, Clone, PartialEq)]
pub struct RuleBase {
    inputs: Vec<LinguisticVariable>,
    output: LinguisticVariable,
    rules: Vec<Rule>,
}

impl RuleBase {
    pub fn new(inputs: Vec<LinguisticVariable>, output: LinguisticVariable) -> Self {
        Self {
            inputs,
            output,
            rules: Vec::new(),
        }
    }

    /// Add `if a is X and b is Y then output is Z`
    pub fn rule(mut self, antecedent: &[(&str, &str)], consequent: &str) -> Result<Self, InferenceError> {
        let mut clauses = Vec::with_capacity(antecedent.len());
        for (variable, term) in antecedent {
            let idx = self
                .inputs
                .iter()
                .position(|v| v.name == *variable)
                .ok_or_else(|| InferenceError::UnknownVariable(variable.to_string()))?;
            clauses.push((idx, self.inputs[idx].term_index(term)?));
        }
        let consequent = self.output.term_index(consequent)?;
        self.rules.push(Rule {
            antecedent: clauses,
            consequent,
            weight: 1.0,
        });
        Ok(self)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Firing degree and consequent term of every rule that fired
    fn firings(&self, inputs: &[f64]) -> Vec<(usize, f64)> {
        self.rules
            .iter()
            .map(|rule| {
                let firing = rule
                    .antecedent
                    .iter()
                    .map(|&(var, term)| self.inputs[var].terms[term].membership.degree(inputs[var]))
                    .fold(1.0, f64::min)
                    * rule.weight;
                (rule.consequent, firing)
            })
            .filter(|(_, firing)| *firing > 0.0)
            .collect()
    }
}

impl InferenceEngine for RuleBase {
    fn inputs(&self) -> Vec<&str> {
        self.inputs.iter().map(|v| v.name.as_str()).collect()
    }

    fn infer(&self, inputs: &[f64]) -> Result<Option<f64>, InferenceError> {
        if inputs.len() != self.inputs.len() {
            return Err(InferenceError::InputCount {
                expected: self.inputs.len(),
                actual: inputs.len(),
            });
        }
        let firings = self.firings(inputs);
        if firings.is_empty() {
            return Ok(None);
        }

        let (lo, hi) = self.output.range;
        let dx = (hi - lo) / CENTROID_RESOLUTION as f64;
        let mut area = 0.0;
        let mut moment = 0.0;
        for i in 0..CENTROID_RESOLUTION {
            let x = lo + (i as f64 + 0.5) * dx;
            // each rule's implied set joins the output on its own
            let mu = firings
                .iter()
                .map(|&(term, firing)| firing * self.output.terms[term].membership.degree(x))
                .fold(0.0, |acc, m| acc + m - acc * m);
            area += mu * dx;
            moment += mu * x * dx;
        }

        if area <= 0.0 || !moment.is_finite() {
            return Ok(None);
        }
        Ok(Some(moment / area))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_base() -> RuleBase {
        let input = LinguisticVariable::new("x", (0.0, 1.0))
            .term("LOW", Membership::Ramp { start: 0.5, end: 0.0 })
            .term("HIGH", Membership::Ramp { start: 0.5, end: 1.0 });
        let output = LinguisticVariable::new("y", (-1.0, 1.0))
            .term("DOWN", Membership::Triangle { a: -1.0, b: -0.5, c: 0.0 })
            .term("UP", Membership::Triangle { a: 0.0, b: 0.5, c: 1.0 });
        RuleBase::new(vec![input], output)
            .rule(&[("x", "LOW")], "UP")
            .unwrap()
            .rule(&[("x", "HIGH")], "DOWN")
            .unwrap()
    }

    #[test]
    fn test_ramp_and_triangle() {
        let falling = Membership::Ramp { start: 0.2, end: 0.0 };
        assert_eq!(falling.degree(0.3), 0.0);
        assert_eq!(falling.degree(-0.1), 1.0);
        assert!((falling.degree(0.1) - 0.5).abs() < 1e-12);

        let tri = Membership::Triangle { a: 0.1, b: 0.2, c: 0.3 };
        assert_eq!(tri.degree(0.2), 1.0);
        assert!((tri.degree(0.15) - 0.5).abs() < 1e-9);
        assert_eq!(tri.degree(0.35), 0.0);
    }

    #[test]
    fn test_symmetric_centroid() {
        let base = simple_base();
        let up = base.infer(&[0.0]).unwrap().unwrap();
        assert!((up - 0.5).abs() < 1e-6, "centroid was {}", up);
        let down = base.infer(&[1.0]).unwrap().unwrap();
        assert!((down + 0.5).abs() < 1e-6, "centroid was {}", down);
    }

    #[test]
    fn test_rules_sharing_consequent_accumulate_separately() {
        let input = LinguisticVariable::new("x", (0.0, 1.0))
            .term("A", Membership::Ramp { start: -1.0, end: 0.0 })
            .term("B", Membership::Ramp { start: -2.0, end: -1.0 });
        let output = LinguisticVariable::new("y", (0.0, 1.0))
            .term("UP", Membership::Ramp { start: 0.0, end: 1.0 });
        let single = RuleBase::new(vec![input.clone()], output.clone())
            .rule(&[("x", "A")], "UP")
            .unwrap();
        let shared = single.clone().rule(&[("x", "B")], "UP").unwrap();

        // mu(y) = y alone, 2y - y^2 once both rules fire fully
        let c = single.infer(&[0.5]).unwrap().unwrap();
        assert!((c - 2.0 / 3.0).abs() < 1e-3, "centroid was {}", c);
        let c = shared.infer(&[0.5]).unwrap().unwrap();
        assert!((c - 0.625).abs() < 1e-3, "centroid was {}", c);
    }

    #[test]
    fn test_no_rule_fired() {
        // x = 0.5 has zero membership in both terms
        assert_eq!(simple_base().infer(&[0.5]).unwrap(), None);
    }

    #[test]
    fn test_unknown_names_rejected() {
        let base = simple_base();
        assert!(matches!(
            base.clone().rule(&[("z", "LOW")], "UP"),
            Err(InferenceError::UnknownVariable(_))
        ));
        assert!(matches!(
            base.rule(&[("x", "MID")], "UP"),
            Err(InferenceError::UnknownTerm { .. })
        ));
    }

    #[test]
    fn test_input_count_checked() {
        assert!(matches!(
            simple_base().infer(&[0.1, 0.2]),
            Err(InferenceError::InputCount { .. })
        ));
    }
}
