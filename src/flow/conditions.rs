use serde_json::Value;
use std::str::FromStr;

use crate::error::ConvoFlowError;

/// 条件表达式：`<variable> <operator> <value>`
///
/// 只支持单个子句，不支持 `and` / `or` 组合。

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Exists,
    NotExists,
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Contains,
    NotContains,
}

impl Operator {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Operator::GreaterThan
                | Operator::LessThan
                | Operator::GreaterOrEqual
                | Operator::LessOrEqual
        )
    }

    fn takes_operand(&self) -> bool {
        !matches!(self, Operator::Exists | Operator::NotExists)
    }
}

impl FromStr for Operator {
    type Err = ConvoFlowError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let op = match token {
            "exists" => Operator::Exists,
            "not_exists" => Operator::NotExists,
            "==" | "equals" => Operator::Equals,
            "!=" | "not_equals" => Operator::NotEquals,
            ">" => Operator::GreaterThan,
            "<" => Operator::LessThan,
            ">=" => Operator::GreaterOrEqual,
            "<=" => Operator::LessOrEqual,
            "contains" => Operator::Contains,
            "not_contains" => Operator::NotContains,
            other => return Err(ConvoFlowError::UnknownOperator(other.to_string())),
        };
        Ok(op)
    }
}

/// 解析后的条件
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub variable: String,
    pub operator: Operator,
    pub operand: String,
}

impl Condition {
    pub fn parse(expression: &str) -> Result<Self, ConvoFlowError> {
        let expression = expression.trim();
        let (variable, rest) = split_token(expression);
        let (op_token, operand) = split_token(rest);
        if op_token.is_empty() {
            return Err(ConvoFlowError::UnknownOperator(String::new()));
        }
        let operator = op_token.parse::<Operator>()?;
        let operand = if operator.takes_operand() {
            unquote(operand.trim()).to_string()
        } else {
            String::new()
        };
        Ok(Self {
            variable: variable.to_string(),
            operator,
            operand,
        })
    }

    /// 变量缺失或为 null 时数值比较一律为 false
    pub fn evaluate(&self, value: Option<&Value>) -> bool {
        match self.operator {
            Operator::Exists => is_present(value),
            Operator::NotExists => !is_present(value),
            Operator::GreaterThan => compare_numbers(value, &self.operand, |l, r| l > r),
            Operator::LessThan => compare_numbers(value, &self.operand, |l, r| l < r),
            Operator::GreaterOrEqual => compare_numbers(value, &self.operand, |l, r| l >= r),
            Operator::LessOrEqual => compare_numbers(value, &self.operand, |l, r| l <= r),
            Operator::Equals => stringify(value) == self.operand,
            Operator::NotEquals => stringify(value) != self.operand,
            Operator::Contains => stringify(value).contains(self.operand.as_str()),
            Operator::NotContains => !stringify(value).contains(self.operand.as_str()),
        }
    }
}

fn split_token(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(pos) => (&input[..pos], &input[pos..]),
        None => (input, ""),
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn is_present(value: Option<&Value>) -> bool {
    matches!(value, Some(v) if !v.is_null())
}

fn compare_numbers(value: Option<&Value>, operand: &str, cmp: impl Fn(f64, f64) -> bool) -> bool {
    let left = to_number(value);
    let right = parse_number(operand);
    // NaN 参与的比较全部为 false
    cmp(left, right)
}

fn to_number(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => parse_number(s),
        Some(Value::Bool(b)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => f64::NAN,
    }
}

fn parse_number(raw: &str) -> f64 {
    raw.trim().parse::<f64>().unwrap_or(f64::NAN)
}

/// 字符串比较时的取值；缺失的变量按空串处理
pub fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expression: &str, value: Option<Value>) -> bool {
        Condition::parse(expression).unwrap().evaluate(value.as_ref())
    }

    #[test]
    fn numeric_comparisons_coerce_both_sides() {
        assert!(eval("score > 10", Some(json!(15))));
        assert!(!eval("score > 10", Some(json!(5))));
        assert!(eval("score >= 10", Some(json!("10"))));
        assert!(eval("score <= 2.5", Some(json!(2.5))));
    }

    #[test]
    fn absent_values_fail_numeric_checks() {
        assert!(!eval("score > 10", None));
        assert!(!eval("score < 10", None));
        assert!(!eval("score < 10", Some(json!("abc"))));
    }

    #[test]
    fn string_operators() {
        assert!(eval("plan == pro", Some(json!("pro"))));
        assert!(eval("plan equals \"pro plan\"", Some(json!("pro plan"))));
        assert!(eval("plan != pro", Some(json!("free"))));
        assert!(eval("answer contains yes", Some(json!("oh yes please"))));
        assert!(eval("answer not_contains no", Some(json!("yes"))));
        assert!(eval("count == 3", Some(json!(3))));
    }

    #[test]
    fn existence_ignores_null() {
        assert!(eval("email exists", Some(json!("a@b.c"))));
        assert!(!eval("email exists", Some(Value::Null)));
        assert!(eval("email not_exists", None));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = Condition::parse("score ~= 10").unwrap_err();
        assert!(matches!(err, ConvoFlowError::UnknownOperator(op) if op == "~="));
        assert!(Condition::parse("score").is_err());
    }
}
