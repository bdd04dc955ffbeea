//! Formula evaluation.
//!
//! Expression formulas are parsed into a small arithmetic AST over decimal
//! numbers and named variables. Only `+ - * / ( )`, unary minus and decimal
//! literals are accepted; identifiers must be known ahead of time and nothing
//! resembling a function call parses.

use super::BillingEngine;
use crate::engine::money::round_money;
use crate::error::BillingError;
use crate::models::{FormulaKind, Period, QuotaFormula, Unit};
use crate::services::metrics::record_error;
use crate::services::store::{BillingStore, CurrencyDirectory, StoreTransaction, UnitDirectory};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::retry::retry_with_backoff;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use tracing::{info, instrument};
use uuid::Uuid;

/// Variables supplied by the unit and period being charged.
pub const RESERVED_VARIABLES: [&str; 8] = [
    "area_m2",
    "aliquot_percentage",
    "floor",
    "bedrooms",
    "bathrooms",
    "parking_spaces",
    "period_month",
    "period_year",
];

/// Longest expression source accepted by [`Expr::parse`].
pub const MAX_EXPRESSION_LEN: usize = 1024;

/// Deepest nesting of parentheses and unary minus accepted by [`Expr::parse`].
pub const MAX_NESTING_DEPTH: usize = 64;

pub fn is_reserved_variable(name: &str) -> bool {
    RESERVED_VARIABLES.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(Decimal),
    Variable(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Decimal),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, BillingError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = Decimal::from_str(&literal).map_err(|_| {
                    BillingError::EvaluationError(format!("invalid number '{}'", literal))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(BillingError::EvaluationError(format!(
                    "unexpected character '{}' at position {}",
                    other, i
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a, F> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    is_known: F,
}

impl<F: Fn(&str) -> bool> Parser<'_, F> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn descend(&mut self) -> Result<(), BillingError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(BillingError::EvaluationError(
                "expression nested too deeply".to_string(),
            ));
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, BillingError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, BillingError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, BillingError> {
        if let Some(Token::Minus) = self.peek() {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, BillingError> {
        match self.next().cloned() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    return Err(BillingError::EvaluationError(format!(
                        "function calls are not allowed: '{}('",
                        name
                    )));
                }
                if !(self.is_known)(&name) {
                    return Err(BillingError::EvaluationError(format!(
                        "unknown variable '{}'",
                        name
                    )));
                }
                Ok(Expr::Variable(name))
            }
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.expr()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(BillingError::EvaluationError(
                        "missing closing parenthesis".to_string(),
                    )),
                }
            }
            Some(token) => Err(BillingError::EvaluationError(format!(
                "unexpected token {:?}",
                token
            ))),
            None => Err(BillingError::EvaluationError(
                "unexpected end of expression".to_string(),
            )),
        }
    }
}

impl Expr {
    /// Parse `input`, accepting only identifiers for which `is_known` holds.
    pub fn parse(input: &str, is_known: impl Fn(&str) -> bool) -> Result<Expr, BillingError> {
        if input.len() > MAX_EXPRESSION_LEN {
            return Err(BillingError::EvaluationError(format!(
                "expression longer than {} characters",
                MAX_EXPRESSION_LEN
            )));
        }
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(BillingError::EvaluationError(
                "expression is empty".to_string(),
            ));
        }

        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            depth: 0,
            is_known,
        };
        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(BillingError::EvaluationError(format!(
                "unexpected trailing token {:?}",
                token
            )));
        }
        Ok(expr)
    }

    /// Names of every variable referenced.
    pub fn variables(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables<'a>(&'a self, names: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                names.insert(name.as_str());
            }
            Expr::Neg(inner) => inner.collect_variables(names),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(names);
                rhs.collect_variables(names);
            }
        }
    }

    /// Evaluate with checked arithmetic.
    pub fn eval(&self, bindings: &BTreeMap<String, Decimal>) -> Result<Decimal, BillingError> {
        let overflow = || BillingError::EvaluationError("arithmetic overflow".to_string());

        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Variable(name) => bindings.get(name).copied().ok_or_else(|| {
                BillingError::EvaluationError(format!("variable '{}' is not bound", name))
            }),
            Expr::Neg(inner) => Ok(-inner.eval(bindings)?),
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.eval(bindings)?;
                let r = rhs.eval(bindings)?;
                match op {
                    BinaryOp::Add => l.checked_add(r).ok_or_else(overflow),
                    BinaryOp::Sub => l.checked_sub(r).ok_or_else(overflow),
                    BinaryOp::Mul => l.checked_mul(r).ok_or_else(overflow),
                    BinaryOp::Div => {
                        if r.is_zero() {
                            return Err(BillingError::EvaluationError(
                                "division by zero".to_string(),
                            ));
                        }
                        l.checked_div(r).ok_or_else(overflow)
                    }
                }
            }
        }
    }
}

/// How an amount was obtained, kept in generation log snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaBreakdown {
    pub formula_id: Uuid,
    pub formula_name: String,
    pub formula_kind: String,
    pub expression: Option<String>,
    pub variables: BTreeMap<String, Decimal>,
    pub raw_result: Decimal,
    pub amount: Decimal,
}

fn bind_variables(
    expr: &Expr,
    formula_vars: &BTreeMap<String, Decimal>,
    unit: &Unit,
    period: Period,
) -> Result<BTreeMap<String, Decimal>, BillingError> {
    let mut bindings = BTreeMap::new();
    for name in expr.variables() {
        let value = match name {
            "period_month" => Decimal::from(period.month),
            "period_year" => Decimal::from(period.year),
            n if is_reserved_variable(n) => unit.attribute(n).ok_or_else(|| {
                BillingError::ConfigurationError(format!(
                    "unit {} has no value for '{}'",
                    unit.unit_number, n
                ))
            })?,
            n => *formula_vars.get(n).ok_or_else(|| {
                BillingError::EvaluationError(format!("unknown variable '{}'", n))
            })?,
        };
        bindings.insert(name.to_string(), value);
    }
    Ok(bindings)
}

/// Base amount of `formula` for `unit` in `period`, rounded to `decimal_places`.
pub fn evaluate(
    formula: &QuotaFormula,
    unit: &Unit,
    period: Period,
    decimal_places: u32,
) -> Result<FormulaBreakdown, BillingError> {
    let (expression, variables, raw_result) = match &formula.kind {
        FormulaKind::Fixed { amount } => (None, BTreeMap::new(), *amount),
        FormulaKind::UnitAmounts { amounts } => {
            let amount = amounts.get(&unit.id).copied().ok_or_else(|| {
                BillingError::ConfigurationError(format!(
                    "formula '{}' defines no amount for unit {}",
                    formula.name, unit.unit_number
                ))
            })?;
            (None, BTreeMap::new(), amount)
        }
        FormulaKind::Expression {
            expression,
            variables,
        } => {
            let expr = Expr::parse(expression, |name| {
                is_reserved_variable(name) || variables.contains_key(name)
            })?;
            let bindings = bind_variables(&expr, variables, unit, period)?;
            let raw = expr.eval(&bindings)?;
            (Some(expression.clone()), bindings, raw)
        }
    };

    if raw_result < Decimal::ZERO {
        return Err(BillingError::EvaluationError(format!(
            "formula '{}' produced a negative amount {}",
            formula.name, raw_result
        )));
    }

    Ok(FormulaBreakdown {
        formula_id: formula.id,
        formula_name: formula.name.clone(),
        formula_kind: formula.kind.as_str().to_string(),
        expression,
        variables,
        raw_result,
        amount: round_money(raw_result, decimal_places),
    })
}

impl<S, U, C> BillingEngine<S, U, C>
where
    S: BillingStore,
    U: UnitDirectory,
    C: CurrencyDirectory,
{
    /// Replace the body of a formula, recording who changed it and why.
    /// Quotas already generated keep their amounts.
    #[instrument(skip(self, kind, reason), fields(formula_id = %formula_id, actor = %actor))]
    pub async fn revise_formula(
        &self,
        formula_id: Uuid,
        kind: FormulaKind,
        reason: &str,
        actor: Uuid,
    ) -> Result<QuotaFormula, BillingError> {
        let result = retry_with_backoff(&self.settings.retry, "revise_formula", || {
            self.try_revise_formula(formula_id, kind.clone(), reason, actor)
        })
        .await
        .map_err(BillingError::from);

        if let Err(e) = &result {
            record_error(e.kind(), "revise_formula");
        }
        result
    }

    async fn try_revise_formula(
        &self,
        formula_id: Uuid,
        kind: FormulaKind,
        reason: &str,
        actor: Uuid,
    ) -> Result<QuotaFormula, BillingError> {
        let mut tx = self.store.begin().await?;
        let outcome = async {
            let mut formula = tx.lock_formula(formula_id).await?.ok_or_else(|| {
                BillingError::NotFound(anyhow::anyhow!("Formula {} not found", formula_id))
            })?;
            formula.revise(kind, actor, reason)?;
            tx.update_formula(&formula).await
        }
        .await;

        let revised = match outcome {
            Ok(revised) => revised,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };
        tx.commit().await?;

        info!(
            version = revised.version,
            formula_type = revised.kind.as_str(),
            "Formula revised"
        );
        Ok(revised)
    }
}
