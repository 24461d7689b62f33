//! Linear expressions and constraints over numeric variables.

use std::collections::BTreeMap;
use std::ops::{Add, Mul, Neg, Sub};

use crate::number::Number;
use crate::variable::{Variable, VariableFactory};

/// `c + Σ aᵢ·xᵢ`, with no zero coefficients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LinearExpression {
    terms: BTreeMap<Variable, Number>,
    constant: Number,
}

impl LinearExpression {
    pub fn constant(n: impl Into<Number>) -> Self {
        LinearExpression {
            terms: BTreeMap::new(),
            constant: n.into(),
        }
    }

    pub fn variable(v: Variable) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(v, Number::one());
        LinearExpression {
            terms,
            constant: Number::zero(),
        }
    }

    pub fn terms(&self) -> impl Iterator<Item = (Variable, &Number)> {
        self.terms.iter().map(|(v, c)| (*v, c))
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn constant_term(&self) -> &Number {
        &self.constant
    }

    pub fn coefficient_of(&self, v: Variable) -> Number {
        self.terms.get(&v).cloned().unwrap_or_default()
    }

    pub fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }

    /// The single variable of `1·x + 0`, if that is the shape.
    pub fn as_variable(&self) -> Option<Variable> {
        if self.terms.len() == 1 && self.constant.is_zero() {
            let (v, c) = self.terms.iter().next()?;
            if *c == 1 {
                return Some(*v);
            }
        }
        None
    }

    pub fn add_term(mut self, v: Variable, coefficient: impl Into<Number>) -> Self {
        let coefficient = coefficient.into();
        let sum = self.coefficient_of(v) + coefficient;
        if sum.is_zero() {
            self.terms.remove(&v);
        } else {
            self.terms.insert(v, sum);
        }
        self
    }

    pub fn variables(&self) -> Vec<Variable> {
        self.terms.keys().copied().collect()
    }

    pub fn render(&self, vars: &VariableFactory) -> String {
        let mut out = String::new();
        for (v, c) in &self.terms {
            let name = vars.display(*v);
            if out.is_empty() {
                if *c == 1 {
                    out.push_str(&name);
                } else if *c == -1 {
                    out.push_str(&format!("-{}", name));
                } else {
                    out.push_str(&format!("{}*{}", c, name));
                }
            } else if *c == 1 {
                out.push_str(&format!(" + {}", name));
            } else if *c == -1 {
                out.push_str(&format!(" - {}", name));
            } else if c.is_negative() {
                out.push_str(&format!(" - {}*{}", -c, name));
            } else {
                out.push_str(&format!(" + {}*{}", c, name));
            }
        }
        if out.is_empty() {
            return self.constant.to_string();
        }
        if self.constant.is_negative() {
            out.push_str(&format!(" - {}", -&self.constant));
        } else if !self.constant.is_zero() {
            out.push_str(&format!(" + {}", self.constant));
        }
        out
    }
}

impl From<Variable> for LinearExpression {
    fn from(v: Variable) -> Self {
        LinearExpression::variable(v)
    }
}

impl From<Number> for LinearExpression {
    fn from(n: Number) -> Self {
        LinearExpression::constant(n)
    }
}

impl From<i64> for LinearExpression {
    fn from(n: i64) -> Self {
        LinearExpression::constant(n)
    }
}

impl From<&Number> for LinearExpression {
    fn from(n: &Number) -> Self {
        LinearExpression::constant(n.clone())
    }
}

impl<T: Into<LinearExpression>> Add<T> for LinearExpression {
    type Output = LinearExpression;

    fn add(self, rhs: T) -> LinearExpression {
        let rhs = rhs.into();
        let mut out = self;
        out.constant = out.constant + rhs.constant;
        for (v, c) in rhs.terms {
            out = out.add_term(v, c);
        }
        out
    }
}

impl Neg for LinearExpression {
    type Output = LinearExpression;

    fn neg(self) -> LinearExpression {
        LinearExpression {
            terms: self.terms.into_iter().map(|(v, c)| (v, -c)).collect(),
            constant: -self.constant,
        }
    }
}

impl<T: Into<LinearExpression>> Sub<T> for LinearExpression {
    type Output = LinearExpression;

    fn sub(self, rhs: T) -> LinearExpression {
        self + (-rhs.into())
    }
}

impl Mul<&Number> for LinearExpression {
    type Output = LinearExpression;

    fn mul(self, rhs: &Number) -> LinearExpression {
        if rhs.is_zero() {
            return LinearExpression::default();
        }
        LinearExpression {
            terms: self.terms.into_iter().map(|(v, c)| (v, c * rhs)).collect(),
            constant: self.constant * rhs,
        }
    }
}

impl Add<i64> for Variable {
    type Output = LinearExpression;

    fn add(self, rhs: i64) -> LinearExpression {
        LinearExpression::variable(self) + rhs
    }
}

impl Add<Variable> for Variable {
    type Output = LinearExpression;

    fn add(self, rhs: Variable) -> LinearExpression {
        LinearExpression::variable(self) + rhs
    }
}

impl Sub<i64> for Variable {
    type Output = LinearExpression;

    fn sub(self, rhs: i64) -> LinearExpression {
        LinearExpression::variable(self) - rhs
    }
}

impl Sub<Variable> for Variable {
    type Output = LinearExpression;

    fn sub(self, rhs: Variable) -> LinearExpression {
        LinearExpression::variable(self) - rhs
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    /// `e <= 0`
    LessOrEqualsZero,
    /// `e < 0`
    LessThanZero,
    /// `e == 0`
    EqualsZero,
    /// `e != 0`
    NotZero,
}

/// `expression kind 0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinearConstraint {
    pub expression: LinearExpression,
    pub kind: ConstraintKind,
}

impl LinearConstraint {
    pub fn new(expression: LinearExpression, kind: ConstraintKind) -> Self {
        LinearConstraint { expression, kind }
    }

    pub fn true_const() -> Self {
        LinearConstraint::new(LinearExpression::constant(0), ConstraintKind::EqualsZero)
    }

    pub fn false_const() -> Self {
        LinearConstraint::new(LinearExpression::constant(0), ConstraintKind::NotZero)
    }

    fn constant_holds(&self) -> Option<bool> {
        if !self.expression.is_constant() {
            return None;
        }
        let c = self.expression.constant_term();
        Some(match self.kind {
            ConstraintKind::LessOrEqualsZero => *c <= 0,
            ConstraintKind::LessThanZero => *c < 0,
            ConstraintKind::EqualsZero => c.is_zero(),
            ConstraintKind::NotZero => !c.is_zero(),
        })
    }

    pub fn is_tautology(&self) -> bool {
        self.constant_holds() == Some(true)
    }

    pub fn is_contradiction(&self) -> bool {
        self.constant_holds() == Some(false)
    }

    /// The constraint that holds exactly when this one does not.
    pub fn negate(&self) -> LinearConstraint {
        let e = self.expression.clone();
        match self.kind {
            ConstraintKind::LessOrEqualsZero => LinearConstraint::new(-e, ConstraintKind::LessThanZero),
            ConstraintKind::LessThanZero => LinearConstraint::new(-e, ConstraintKind::LessOrEqualsZero),
            ConstraintKind::EqualsZero => LinearConstraint::new(e, ConstraintKind::NotZero),
            ConstraintKind::NotZero => LinearConstraint::new(e, ConstraintKind::EqualsZero),
        }
    }

    pub fn render(&self, vars: &VariableFactory) -> String {
        let op = match self.kind {
            ConstraintKind::LessOrEqualsZero => "<=",
            ConstraintKind::LessThanZero => "<",
            ConstraintKind::EqualsZero => "==",
            ConstraintKind::NotZero => "!=",
        };
        format!("{} {} 0", self.expression.render(vars), op)
    }
}

fn diff(a: impl Into<LinearExpression>, b: impl Into<LinearExpression>) -> LinearExpression {
    a.into() - b.into()
}

/// `a <= b`
pub fn le(a: impl Into<LinearExpression>, b: impl Into<LinearExpression>) -> LinearConstraint {
    LinearConstraint::new(diff(a, b), ConstraintKind::LessOrEqualsZero)
}

/// `a < b`
pub fn lt(a: impl Into<LinearExpression>, b: impl Into<LinearExpression>) -> LinearConstraint {
    LinearConstraint::new(diff(a, b), ConstraintKind::LessThanZero)
}

/// `a >= b`
pub fn ge(a: impl Into<LinearExpression>, b: impl Into<LinearExpression>) -> LinearConstraint {
    LinearConstraint::new(diff(b, a), ConstraintKind::LessOrEqualsZero)
}

/// `a > b`
pub fn gt(a: impl Into<LinearExpression>, b: impl Into<LinearExpression>) -> LinearConstraint {
    LinearConstraint::new(diff(b, a), ConstraintKind::LessThanZero)
}

/// `a == b`
pub fn eq(a: impl Into<LinearExpression>, b: impl Into<LinearExpression>) -> LinearConstraint {
    LinearConstraint::new(diff(a, b), ConstraintKind::EqualsZero)
}

/// `a != b`
pub fn neq(a: impl Into<LinearExpression>, b: impl Into<LinearExpression>) -> LinearConstraint {
    LinearConstraint::new(diff(a, b), ConstraintKind::NotZero)
}
