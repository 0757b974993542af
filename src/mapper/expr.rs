//! `test` 表达式求值：分词 → 调度场算法转后缀(RPN) → 栈求值。
//!
//! 运算符优先级从低到高：`|| &&`，比较运算，`+ -`，`* / %`，`| & ~`。
//! 同级左结合，`~` 是唯一的一元运算符。

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unbalanced parentheses")]
    UnbalancedParens,

    #[error("operator `{0}` is missing an operand")]
    StackUnderflow(&'static str),

    #[error("malformed expression, {0} values left after evaluation")]
    Dangling(usize),

    #[error("operator `{op}` cannot be applied to {operands}")]
    Type { op: &'static str, operands: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("expression produced {0}, expected a boolean")]
    NotBoolean(&'static str),

    #[error("cannot resolve variable `{name}`: {message}")]
    Variable { name: String, message: String },
}

/// 求值期的操作数
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Number(f64),
    Str(String),
    Bool(bool),
    Nil,
    /// 数组或对象，只参与 `==`/`!=`
    Composite(Value),
}

impl Operand {
    pub fn type_name(&self) -> &'static str {
        match self {
            Operand::Number(_) => "number",
            Operand::Str(_) => "string",
            Operand::Bool(_) => "bool",
            Operand::Nil => "nil",
            Operand::Composite(Value::Array(_)) => "array",
            Operand::Composite(_) => "object",
        }
    }
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Operand::Nil,
            Value::Bool(b) => Operand::Bool(b),
            Value::Number(n) => n.as_f64().map(Operand::Number).unwrap_or(Operand::Nil),
            Value::String(s) => Operand::Str(s),
            other => Operand::Composite(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitNot,
}

impl Operator {
    fn precedence(self) -> u8 {
        match self {
            Operator::Or | Operator::And => 1,
            Operator::Eq
            | Operator::Ne
            | Operator::Lt
            | Operator::Le
            | Operator::Gt
            | Operator::Ge => 2,
            Operator::Add | Operator::Sub => 3,
            Operator::Mul | Operator::Div | Operator::Rem => 4,
            Operator::BitAnd | Operator::BitOr | Operator::BitNot => 5,
        }
    }

    fn is_unary(self) -> bool {
        self == Operator::BitNot
    }

    fn symbol(self) -> &'static str {
        match self {
            Operator::Or => "||",
            Operator::And => "&&",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Rem => "%",
            Operator::BitAnd => "&",
            Operator::BitOr => "|",
            Operator::BitNot => "~",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Op(Operator),
    Number(f64),
    Str(String),
    Bool(bool),
    Nil,
    Ident(String),
}

impl Token {
    fn is_operand(&self) -> bool {
        matches!(
            self,
            Token::Number(_) | Token::Str(_) | Token::Bool(_) | Token::Nil | Token::Ident(_)
        )
    }
}

/// 求值不含变量的表达式，出现裸标识符即为解析错误
pub fn evaluate(expr: &str) -> Result<bool, ExprError> {
    evaluate_with(expr, |name| {
        Err(ExprError::Parse(format!("unexpected word `{name}`")))
    })
}

/// 求值表达式，裸标识符通过 `lookup` 解析，`None` 视为 `nil`
pub fn evaluate_with<F>(expr: &str, mut lookup: F) -> Result<bool, ExprError>
where
    F: FnMut(&str) -> Result<Option<Value>, ExprError>,
{
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err(ExprError::Empty);
    }
    let rpn = to_rpn(tokens)?;
    match eval_rpn(&rpn, &mut lookup)? {
        Operand::Bool(b) => Ok(b),
        other => Err(ExprError::NotBoolean(other.type_name())),
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let (token, width) = match c {
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            '&' if next == Some('&') => (Token::Op(Operator::And), 2),
            '&' => (Token::Op(Operator::BitAnd), 1),
            '|' if next == Some('|') => (Token::Op(Operator::Or), 2),
            '|' => (Token::Op(Operator::BitOr), 1),
            '=' if next == Some('=') => (Token::Op(Operator::Eq), 2),
            '!' if next == Some('=') => (Token::Op(Operator::Ne), 2),
            '<' if next == Some('=') => (Token::Op(Operator::Le), 2),
            '<' => (Token::Op(Operator::Lt), 1),
            '>' if next == Some('=') => (Token::Op(Operator::Ge), 2),
            '>' => (Token::Op(Operator::Gt), 1),
            '+' => (Token::Op(Operator::Add), 1),
            '*' => (Token::Op(Operator::Mul), 1),
            '/' => (Token::Op(Operator::Div), 1),
            '%' => (Token::Op(Operator::Rem), 1),
            '~' => (Token::Op(Operator::BitNot), 1),
            '.' if next.is_some_and(|n| n.is_ascii_digit()) => {
                let (number, width) = scan_number(&chars[i..])?;
                (Token::Number(number), width)
            }
            '-' if expects_operand(&tokens)
                && next.is_some_and(|n| n.is_ascii_digit() || n == '.') =>
            {
                let (number, width) = scan_number(&chars[i + 1..])?;
                (Token::Number(-number), width + 1)
            }
            '-' => (Token::Op(Operator::Sub), 1),
            '"' | '\'' => scan_string(&chars[i..])?,
            c if c.is_ascii_digit() => {
                let (number, width) = scan_number(&chars[i..])?;
                (Token::Number(number), width)
            }
            c if c.is_alphabetic() || c == '_' => scan_word(&chars[i..]),
            other => {
                return Err(ExprError::Parse(format!(
                    "unexpected `{other}` at offset {i} in `{expr}`"
                )))
            }
        };
        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

fn expects_operand(tokens: &[Token]) -> bool {
    matches!(tokens.last(), None | Some(Token::Op(_)) | Some(Token::LParen))
}

/// 十进制数字，可带小数点与 `e`/`E` 指数：`3`、`.5`、`1.5e-3`
fn scan_number(chars: &[char]) -> Result<(f64, usize), ExprError> {
    let mut width = chars
        .iter()
        .take_while(|c| c.is_ascii_digit() || **c == '.')
        .count();
    if matches!(chars.get(width), Some('e' | 'E')) {
        let sign = usize::from(matches!(chars.get(width + 1), Some('+' | '-')));
        let digits = chars[width + 1 + sign..]
            .iter()
            .take_while(|c| c.is_ascii_digit())
            .count();
        width += 1 + sign + digits;
    }
    // 紧跟字母或下划线的数字不是合法字面量，如 `1abc`
    width += chars[width..]
        .iter()
        .take_while(|c| c.is_alphanumeric() || **c == '_')
        .count();
    let text: String = chars[..width].iter().collect();
    text.parse::<f64>()
        .map(|n| (n, width))
        .map_err(|_| ExprError::Parse(format!("invalid number `{text}`")))
}

fn scan_string(chars: &[char]) -> Result<(Token, usize), ExprError> {
    let quote = chars[0];
    let mut literal = String::new();
    let mut i = 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                literal.push(chars[i + 1]);
                i += 2;
            }
            c if c == quote => return Ok((Token::Str(literal), i + 1)),
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    Err(ExprError::Parse(format!(
        "unterminated string literal starting with {quote}{literal}"
    )))
}

/// 标识符允许带路径：`user.name`、`list[idx]`、`list.size()`
fn scan_word(chars: &[char]) -> (Token, usize) {
    let mut width = 0;
    while width < chars.len() {
        let c = chars[width];
        if c.is_alphanumeric() || matches!(c, '_' | '.' | '[' | ']') {
            width += 1;
        } else if c == '(' && chars.get(width + 1) == Some(&')') {
            width += 2;
        } else {
            break;
        }
    }
    let word: String = chars[..width].iter().collect();
    let token = match word.as_str() {
        "nil" | "null" => Token::Nil,
        "true" => Token::Bool(true),
        "false" => Token::Bool(false),
        "and" => Token::Op(Operator::And),
        "or" => Token::Op(Operator::Or),
        _ => Token::Ident(word),
    };
    (token, width)
}

fn to_rpn(tokens: Vec<Token>) -> Result<Vec<Token>, ExprError> {
    let mut output = Vec::with_capacity(tokens.len());
    let mut stack: Vec<Token> = Vec::new();

    for token in tokens {
        match token {
            Token::LParen => stack.push(token),
            Token::RParen => loop {
                match stack.pop() {
                    Some(Token::LParen) => break,
                    Some(op) => output.push(op),
                    None => return Err(ExprError::UnbalancedParens),
                }
            },
            Token::Op(op) => {
                while let Some(Token::Op(top)) = stack.last() {
                    if op.is_unary() || top.precedence() < op.precedence() {
                        break;
                    }
                    output.extend(stack.pop());
                }
                stack.push(Token::Op(op));
            }
            operand => {
                debug_assert!(operand.is_operand());
                output.push(operand);
            }
        }
    }

    while let Some(token) = stack.pop() {
        if token == Token::LParen {
            return Err(ExprError::UnbalancedParens);
        }
        output.push(token);
    }
    Ok(output)
}

fn eval_rpn<F>(rpn: &[Token], lookup: &mut F) -> Result<Operand, ExprError>
where
    F: FnMut(&str) -> Result<Option<Value>, ExprError>,
{
    let mut stack: Vec<Operand> = Vec::new();
    for token in rpn {
        let value = match token {
            Token::Number(n) => Operand::Number(*n),
            Token::Str(s) => Operand::Str(s.clone()),
            Token::Bool(b) => Operand::Bool(*b),
            Token::Nil => Operand::Nil,
            Token::Ident(name) => lookup(name)?.map(Operand::from).unwrap_or(Operand::Nil),
            Token::Op(op) if op.is_unary() => {
                let operand = stack.pop().ok_or(ExprError::StackUnderflow(op.symbol()))?;
                apply_unary(*op, operand)?
            }
            Token::Op(op) => {
                let right = stack.pop().ok_or(ExprError::StackUnderflow(op.symbol()))?;
                let left = stack.pop().ok_or(ExprError::StackUnderflow(op.symbol()))?;
                apply_binary(*op, left, right)?
            }
            Token::LParen | Token::RParen => return Err(ExprError::UnbalancedParens),
        };
        stack.push(value);
    }

    match stack.len() {
        1 => Ok(stack.remove(0)),
        0 => Err(ExprError::Empty),
        n => Err(ExprError::Dangling(n)),
    }
}

fn type_error(op: Operator, operands: &[&Operand]) -> ExprError {
    let names: Vec<&str> = operands.iter().map(|o| o.type_name()).collect();
    ExprError::Type {
        op: op.symbol(),
        operands: names.join(" and "),
    }
}

fn apply_unary(op: Operator, operand: Operand) -> Result<Operand, ExprError> {
    match operand {
        Operand::Number(n) => Ok(Operand::Number(!(n as i64) as f64)),
        other => Err(type_error(op, &[&other])),
    }
}

fn apply_binary(op: Operator, left: Operand, right: Operand) -> Result<Operand, ExprError> {
    match op {
        Operator::And | Operator::Or => match (&left, &right) {
            (Operand::Bool(l), Operand::Bool(r)) => Ok(Operand::Bool(if op == Operator::And {
                *l && *r
            } else {
                *l || *r
            })),
            _ => Err(type_error(op, &[&left, &right])),
        },
        Operator::Eq => Ok(Operand::Bool(left == right)),
        Operator::Ne => Ok(Operand::Bool(left != right)),
        Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => {
            let ordering = match (&left, &right) {
                (Operand::Nil, _) | (_, Operand::Nil) => return Ok(Operand::Bool(false)),
                (Operand::Number(l), Operand::Number(r)) => l.partial_cmp(r),
                (Operand::Str(l), Operand::Str(r)) => Some(l.cmp(r)),
                _ => return Err(type_error(op, &[&left, &right])),
            };
            let Some(ordering) = ordering else {
                return Ok(Operand::Bool(false));
            };
            Ok(Operand::Bool(match op {
                Operator::Lt => ordering == Ordering::Less,
                Operator::Le => ordering != Ordering::Greater,
                Operator::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        _ => {
            let (Operand::Number(l), Operand::Number(r)) = (&left, &right) else {
                return Err(type_error(op, &[&left, &right]));
            };
            let (l, r) = (*l, *r);
            let n = match op {
                Operator::Add => l + r,
                Operator::Sub => l - r,
                Operator::Mul => l * r,
                Operator::Div if r == 0.0 => return Err(ExprError::DivisionByZero),
                Operator::Div => l / r,
                Operator::Rem if r as i64 == 0 => return Err(ExprError::DivisionByZero),
                Operator::Rem => ((l as i64) % (r as i64)) as f64,
                Operator::BitAnd => ((l as i64) & (r as i64)) as f64,
                _ => ((l as i64) | (r as i64)) as f64,
            };
            Ok(Operand::Number(n))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn eval_in(expr: &str, vars: &HashMap<&str, Value>) -> Result<bool, ExprError> {
        evaluate_with(expr, |name| Ok(vars.get(name).cloned()))
    }

    #[test]
    fn grouped_comparisons() {
        assert_eq!(evaluate("(1 < 3) && (2 == 2)"), Ok(true));
        assert_eq!(evaluate("1 >= 3 || 'a' == \"a\""), Ok(true));
    }

    #[test]
    fn dangling_operator_is_an_error() {
        assert_eq!(evaluate("1 +"), Err(ExprError::StackUnderflow("+")));
        assert!(evaluate("").is_err());
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(evaluate("1 + 2 * 3 == 7"), Ok(true));
        assert_eq!(evaluate("(1 + 2) * 3 == 9"), Ok(true));
        assert_eq!(evaluate("7 % 4 == 3"), Ok(true));
        assert_eq!(evaluate("10 - 4 - 3 == 3"), Ok(true));
        assert_eq!(evaluate("6 / 4 == 1.5"), Ok(true));
    }

    #[test]
    fn number_literal_forms() {
        assert_eq!(evaluate("1e3 > 1"), Ok(true));
        assert_eq!(evaluate("2.5E-1 == 0.25"), Ok(true));
        assert_eq!(evaluate("1e+2 == 100"), Ok(true));
        assert_eq!(evaluate(".5 == 0.5"), Ok(true));
        assert_eq!(evaluate("-.5 < 0"), Ok(true));
        assert_eq!(
            evaluate("1e > 1"),
            Err(ExprError::Parse("invalid number `1e`".to_string()))
        );
        assert_eq!(
            evaluate("12abc == 1"),
            Err(ExprError::Parse("invalid number `12abc`".to_string()))
        );
    }

    #[test]
    fn bitwise_operators() {
        assert_eq!(evaluate("6 & 3 == 2"), Ok(true));
        assert_eq!(evaluate("~0 == -1"), Ok(true));
        assert_eq!(evaluate("4 | 1 == 5"), Ok(true));
    }

    #[test]
    fn nil_ordering_is_false() {
        assert_eq!(evaluate("nil > 1"), Ok(false));
        assert_eq!(evaluate("1 <= nil"), Ok(false));
        assert_eq!(evaluate("nil == nil"), Ok(true));
    }

    #[test]
    fn equality_is_type_sensitive() {
        assert_eq!(evaluate("10 == '10'"), Ok(false));
        assert_eq!(evaluate("10 != '10'"), Ok(true));
    }

    #[test]
    fn unknown_token_is_parse_error() {
        assert!(matches!(evaluate("1 @ 2"), Err(ExprError::Parse(_))));
        assert!(matches!(evaluate("a == 1"), Err(ExprError::Parse(_))));
        assert!(matches!(evaluate("1 = 1"), Err(ExprError::Parse(_))));
        assert!(matches!(evaluate("'open == 1"), Err(ExprError::Parse(_))));
    }

    #[test]
    fn parentheses_must_balance() {
        assert_eq!(evaluate("(1 == 1"), Err(ExprError::UnbalancedParens));
        assert_eq!(evaluate("1 == 1)"), Err(ExprError::UnbalancedParens));
    }

    #[test]
    fn arithmetic_on_strings_is_type_error() {
        assert!(matches!(evaluate("'a' + 1 == 2"), Err(ExprError::Type { op: "+", .. })));
        assert!(matches!(evaluate("1 && true"), Err(ExprError::Type { .. })));
        assert_eq!(evaluate("1 % 0 == 0"), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn result_must_be_boolean() {
        assert_eq!(evaluate("1 + 1"), Err(ExprError::NotBoolean("number")));
    }

    #[test]
    fn variables_resolve_through_lookup() {
        let mut vars = HashMap::new();
        vars.insert("age", json!(30));
        vars.insert("name", json!("tom"));
        vars.insert("user.id", json!(7));

        assert_eq!(eval_in("age >= 18 && name == 'tom'", &vars), Ok(true));
        assert_eq!(eval_in("user.id == 7", &vars), Ok(true));
        assert_eq!(eval_in("name != null and name != ''", &vars), Ok(true));
        assert_eq!(eval_in("age > -1", &vars), Ok(true));
    }

    #[test]
    fn unbound_variable_is_nil() {
        let vars = HashMap::new();
        assert_eq!(eval_in("missing > 3", &vars), Ok(false));
        assert_eq!(eval_in("missing == nil", &vars), Ok(true));
    }

    #[test]
    fn composite_values_compare_by_equality_only() {
        let mut vars = HashMap::new();
        vars.insert("ids", json!([1, 2]));
        assert_eq!(eval_in("ids != null", &vars), Ok(true));
        assert!(matches!(eval_in("ids > 1", &vars), Err(ExprError::Type { .. })));
    }

    #[test]
    fn logical_operators_share_precedence() {
        // (true || false) && false
        assert_eq!(evaluate("true || false && false"), Ok(false));
    }
}
