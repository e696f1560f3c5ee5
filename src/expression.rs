use anyhow::{anyhow, Context};
use serde::{de::Error, Deserialize, Serialize};
use std::{borrow::Cow, fmt, iter::Peekable, str::CharIndices};

/// Integer arithmetic over parameter names, used for derived launcher values such as
/// `ranks + pme_ranks` and for feasibility constraints such as
/// `(ranks + pme_ranks) * threads <= 44`.
///
/// Supports `+ - * / %`, the comparisons `< <= > >= == !=`, `&& || !` and parentheses.
/// Comparisons and logical operators yield 1 or 0.
#[derive(Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Num(i64),
    Var(String),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(Op, Box<Node>, Box<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
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
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(i64),
    Ident(String),
    Op(&'static str),
    Open,
    Close,
}

const OPERATORS: [&str; 16] = [
    "||", "&&", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!", "(", ")",
];

fn tokenize(source: &str) -> anyhow::Result<Vec<Token>> {
    let mut tokens = vec![];
    let mut chars: Peekable<CharIndices> = source.char_indices().peekable();

    while let Some(&(idx, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() {
            let mut end = idx;
            while let Some(&(i, d)) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                end = i + d.len_utf8();
                chars.next();
            }
            let num = source[idx..end]
                .parse::<i64>()
                .context(format!("'{}' is too large", &source[idx..end]))?;
            tokens.push(Token::Num(num));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let mut end = idx;
            while let Some(&(i, d)) = chars.peek() {
                if !(d.is_ascii_alphanumeric() || d == '_') {
                    break;
                }
                end = i + d.len_utf8();
                chars.next();
            }
            tokens.push(Token::Ident(source[idx..end].to_string()));
        } else {
            let op = OPERATORS
                .iter()
                .find(|op| source[idx..].starts_with(*op))
                .context(format!("Unexpected '{}' at position {}", c, idx))?;
            for _ in 0..op.len() {
                chars.next();
            }
            tokens.push(match *op {
                "(" => Token::Open,
                ")" => Token::Close,
                op => Token::Op(op),
            });
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}
impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    /// Parses one precedence level: operands from `operand`, joined by any of `ops`.
    fn level(
        &mut self,
        ops: &[(&str, Op)],
        operand: fn(&mut Parser) -> anyhow::Result<Node>,
    ) -> anyhow::Result<Node> {
        let mut lhs = operand(self)?;
        while let Some(op) = self
            .peek_op()
            .and_then(|tok| ops.iter().find(|(sym, _)| *sym == tok))
            .map(|(_, op)| *op)
        {
            self.pos += 1;
            let rhs = operand(self)?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn or(&mut self) -> anyhow::Result<Node> {
        self.level(&[("||", Op::Or)], Parser::and)
    }

    fn and(&mut self) -> anyhow::Result<Node> {
        self.level(&[("&&", Op::And)], Parser::comparison)
    }

    fn comparison(&mut self) -> anyhow::Result<Node> {
        self.level(
            &[
                ("==", Op::Eq),
                ("!=", Op::Ne),
                ("<=", Op::Le),
                (">=", Op::Ge),
                ("<", Op::Lt),
                (">", Op::Gt),
            ],
            Parser::sum,
        )
    }

    fn sum(&mut self) -> anyhow::Result<Node> {
        self.level(&[("+", Op::Add), ("-", Op::Sub)], Parser::product)
    }

    fn product(&mut self) -> anyhow::Result<Node> {
        self.level(
            &[("*", Op::Mul), ("/", Op::Div), ("%", Op::Rem)],
            Parser::unary,
        )
    }

    fn unary(&mut self) -> anyhow::Result<Node> {
        match self.next() {
            Some(Token::Op("-")) => Ok(Node::Neg(Box::new(self.unary()?))),
            Some(Token::Op("!")) => Ok(Node::Not(Box::new(self.unary()?))),
            Some(Token::Num(num)) => Ok(Node::Num(num)),
            Some(Token::Ident(name)) => Ok(Node::Var(name)),
            Some(Token::Open) => {
                let node = self.or()?;
                match self.next() {
                    Some(Token::Close) => Ok(node),
                    _ => Err(anyhow!("Unbalanced parenthesis")),
                }
            }
            Some(token) => Err(anyhow!("Unexpected {:?}", token)),
            None => Err(anyhow!("Unexpected end of expression")),
        }
    }
}

impl Node {
    fn variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Node::Num(_) => {}
            Node::Var(name) => out.push(name),
            Node::Neg(node) | Node::Not(node) => node.variables(out),
            Node::Binary(_, lhs, rhs) => {
                lhs.variables(out);
                rhs.variables(out);
            }
        }
    }

    fn eval(&self, lookup: &dyn Fn(&str) -> anyhow::Result<i64>) -> anyhow::Result<i64> {
        let overflow = || anyhow!("Integer overflow");
        match self {
            Node::Num(num) => Ok(*num),
            Node::Var(name) => lookup(name),
            Node::Neg(node) => node.eval(lookup)?.checked_neg().ok_or_else(overflow),
            Node::Not(node) => Ok((node.eval(lookup)? == 0) as i64),
            Node::Binary(op, lhs, rhs) => {
                let lhs = lhs.eval(lookup)?;
                // no short circuit, every name must resolve
                let rhs = rhs.eval(lookup)?;
                match op {
                    Op::Or => Ok((lhs != 0 || rhs != 0) as i64),
                    Op::And => Ok((lhs != 0 && rhs != 0) as i64),
                    Op::Eq => Ok((lhs == rhs) as i64),
                    Op::Ne => Ok((lhs != rhs) as i64),
                    Op::Lt => Ok((lhs < rhs) as i64),
                    Op::Le => Ok((lhs <= rhs) as i64),
                    Op::Gt => Ok((lhs > rhs) as i64),
                    Op::Ge => Ok((lhs >= rhs) as i64),
                    Op::Add => lhs.checked_add(rhs).ok_or_else(overflow),
                    Op::Sub => lhs.checked_sub(rhs).ok_or_else(overflow),
                    Op::Mul => lhs.checked_mul(rhs).ok_or_else(overflow),
                    Op::Div if rhs == 0 => Err(anyhow!("Division by zero")),
                    Op::Rem if rhs == 0 => Err(anyhow!("Division by zero")),
                    Op::Div => lhs.checked_div(rhs).ok_or_else(overflow),
                    Op::Rem => lhs.checked_rem(rhs).ok_or_else(overflow),
                }
            }
        }
    }
}

impl Expression {
    pub fn parse(source: &str) -> anyhow::Result<Expression> {
        let tokens = tokenize(source).context(format!("Invalid expression '{}'", source))?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser
            .or()
            .context(format!("Invalid expression '{}'", source))?;
        if let Some(token) = parser.next() {
            return Err(anyhow!(
                "Invalid expression '{}': unexpected {:?}",
                source,
                token
            ));
        }

        Ok(Expression {
            source: source.trim().to_string(),
            root,
        })
    }

    /// Names referenced by the expression, in order of appearance.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = vec![];
        self.root.variables(&mut out);
        out
    }

    pub fn eval(&self, lookup: &dyn Fn(&str) -> anyhow::Result<i64>) -> anyhow::Result<i64> {
        self.root
            .eval(lookup)
            .context(format!("Unable to evaluate '{}'", self.source))
    }

    pub fn holds(&self, lookup: &dyn Fn(&str) -> anyhow::Result<i64>) -> anyhow::Result<bool> {
        Ok(self.eval(lookup)? != 0)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expression({})", self.source)
    }
}

impl Serialize for Expression {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.source.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <Cow<'de, str>>::deserialize(deserializer)?;
        Self::parse(&s).map_err(|e| D::Error::custom(format!("{:#}", e)))
    }
}
