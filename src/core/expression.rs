//! Pixel-wise band math
//!
//! Expressions use `+ - * /`, unary minus, parentheses, numeric literals and
//! named operands, e.g. `(NIR - RED) / (NIR + RED)`. Every operand name is
//! bound to one band of one tile. Arithmetic runs in f32; no-data propagates,
//! division by zero yields no-data and so does any non-finite result.

use crate::types::{BandGrid, CompositeError, CompositeResult, Pixel, Tile, NO_DATA};
use indexmap::IndexMap;
use ndarray::{ArrayView2, Zip};
use std::collections::HashMap;
use std::iter::Peekable;
use std::str::CharIndices;

/// Default output band name for [`evaluate`]
pub const DEFAULT_OUTPUT_BAND: &str = "result";
/// Default output band name for [`normalized_difference`]
pub const NORMALIZED_DIFFERENCE_BAND: &str = "nd";

/// An operand binding: one band of one tile
#[derive(Debug, Clone, Copy)]
pub struct BandRef<'a> {
    pub tile: &'a Tile,
    pub band: &'a str,
}

impl<'a> BandRef<'a> {
    pub fn new(tile: &'a Tile, band: &'a str) -> Self {
        Self { tile, band }
    }
}

/// Operand name -> band reference
pub type Bindings<'a> = HashMap<String, BandRef<'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[inline]
    fn apply(self, a: Pixel, b: Pixel) -> Pixel {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => {
                if b == 0.0 {
                    NO_DATA
                } else {
                    a / b
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(Pixel),
    Operand(String),
    Negate(Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Pixel),
    Ident(String),
    Op(char),
    Open,
    Close,
}

fn tokenize(source: &str) -> CompositeResult<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let mut chars: Peekable<CharIndices> = source.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' | '-' | '*' | '/' => {
                chars.next();
                tokens.push((pos, Token::Op(c)));
            }
            '(' => {
                chars.next();
                tokens.push((pos, Token::Open));
            }
            ')' => {
                chars.next();
                tokens.push((pos, Token::Close));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = pos;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                // optional exponent: [eE][+-]?digits
                let mut lookahead = chars.clone();
                if let Some(&(_, 'e' | 'E')) = lookahead.peek() {
                    lookahead.next();
                    if let Some(&(_, '+' | '-')) = lookahead.peek() {
                        lookahead.next();
                    }
                    let mut exponent_end = None;
                    while let Some(&(i, d)) = lookahead.peek() {
                        if !d.is_ascii_digit() {
                            break;
                        }
                        exponent_end = Some(i + 1);
                        lookahead.next();
                    }
                    if let Some(exponent_end) = exponent_end {
                        end = exponent_end;
                        chars = lookahead;
                    }
                }
                let text = &source[pos..end];
                let value = text.parse::<f64>().map_err(|_| {
                    CompositeError::Parse(format!("invalid number '{}' at {}", text, pos))
                })?;
                tokens.push((pos, Token::Number(value as Pixel)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = pos;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((pos, Token::Ident(source[pos..end].to_string())));
            }
            other => {
                return Err(CompositeError::Parse(format!(
                    "unexpected character '{}' at {}",
                    other, pos
                )))
            }
        }
    }
    Ok(tokens)
}

/// Recursive descent over the token stream:
///
/// ```text
/// expr   := term (('+' | '-') term)*
/// term   := unary (('*' | '/') unary)*
/// unary  := ('-' | '+') unary | atom
/// atom   := number | name | '(' expr ')'
/// ```
struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

/// Nesting limit for parentheses and unary signs
const MAX_NESTING: usize = 256;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn descend(&mut self, pos: usize) -> CompositeResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(CompositeError::Parse(format!(
                "expression nested deeper than {} levels at {}",
                MAX_NESTING, pos
            )));
        }
        Ok(())
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(0)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> CompositeResult<Node> {
        let mut node = self.term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek() {
            let op = if *c == '+' { BinaryOp::Add } else { BinaryOp::Sub };
            self.pos += 1;
            node = Node::Binary(op, Box::new(node), Box::new(self.term()?));
        }
        Ok(node)
    }

    fn term(&mut self) -> CompositeResult<Node> {
        let mut node = self.unary()?;
        while let Some(Token::Op(c @ ('*' | '/'))) = self.peek() {
            let op = if *c == '*' { BinaryOp::Mul } else { BinaryOp::Div };
            self.pos += 1;
            node = Node::Binary(op, Box::new(node), Box::new(self.unary()?));
        }
        Ok(node)
    }

    fn unary(&mut self) -> CompositeResult<Node> {
        let node = match self.peek() {
            Some(Token::Op('-')) => {
                self.descend(self.position())?;
                self.pos += 1;
                Node::Negate(Box::new(self.unary()?))
            }
            Some(Token::Op('+')) => {
                self.descend(self.position())?;
                self.pos += 1;
                self.unary()?
            }
            _ => return self.atom(),
        };
        self.depth -= 1;
        Ok(node)
    }

    fn atom(&mut self) -> CompositeResult<Node> {
        match self.next() {
            Some((_, Token::Number(n))) => Ok(Node::Number(n)),
            Some((_, Token::Ident(name))) => Ok(Node::Operand(name)),
            Some((pos, Token::Open)) => {
                self.descend(pos)?;
                let inner = self.expr()?;
                self.depth -= 1;
                match self.next() {
                    Some((_, Token::Close)) => Ok(inner),
                    _ => Err(CompositeError::Parse(format!(
                        "unclosed parenthesis opened at {}",
                        pos
                    ))),
                }
            }
            Some((pos, token)) => Err(CompositeError::Parse(format!(
                "unexpected {:?} at {}",
                token, pos
            ))),
            None => Err(CompositeError::Parse("unexpected end of expression".to_string())),
        }
    }
}

/// A parsed band-math expression, reusable across tiles
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> CompositeResult<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.expr()?;
        if let Some((pos, token)) = parser.next() {
            return Err(CompositeError::Parse(format!(
                "unexpected {:?} at {} after end of expression",
                token, pos
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Operand names in order of first appearance
    pub fn variables(&self) -> Vec<&str> {
        fn walk<'n>(node: &'n Node, out: &mut Vec<&'n str>) {
            match node {
                Node::Operand(name) => {
                    if !out.contains(&name.as_str()) {
                        out.push(name);
                    }
                }
                Node::Negate(inner) => walk(inner, out),
                Node::Binary(_, l, r) => {
                    walk(l, out);
                    walk(r, out);
                }
                Node::Number(_) => {}
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out
    }

    /// Evaluate per pixel into a single-band tile named `output_band`.
    ///
    /// All operands are resolved before any arithmetic, so an unbound name, a
    /// missing band or mismatched shapes abort without partial output. The
    /// result inherits geometry, time and metadata from the tile of the first
    /// operand in the expression.
    pub fn evaluate(&self, bindings: &Bindings<'_>, output_band: &str) -> CompositeResult<Tile> {
        let variables = self.variables();
        let Some(first) = variables.first() else {
            return Err(CompositeError::Processing(format!(
                "expression '{}' references no bands",
                self.source
            )));
        };

        let mut grids: HashMap<&str, ArrayView2<Pixel>> = HashMap::with_capacity(variables.len());
        for name in &variables {
            let binding = bindings
                .get(*name)
                .ok_or_else(|| CompositeError::UnboundVariable(name.to_string()))?;
            grids.insert(*name, binding.tile.band(binding.band)?.view());
        }

        let template = bindings[*first].tile;
        let shape = grids[first].dim();
        if let Some((name, grid)) = grids.iter().find(|(_, g)| g.dim() != shape) {
            return Err(CompositeError::ShapeMismatch(format!(
                "operand '{}' is {:?}, operand '{}' is {:?}",
                name,
                grid.dim(),
                first,
                shape
            )));
        }

        log::debug!("Evaluating '{}' over {:?} pixels", self.source, shape);
        let mut result = eval(&self.root, &grids, shape);
        scrub_non_finite(&mut result);

        let mut bands = IndexMap::with_capacity(1);
        bands.insert(output_band.to_string(), result);
        template.replace_bands(bands)
    }
}

fn eval(node: &Node, grids: &HashMap<&str, ArrayView2<Pixel>>, shape: (usize, usize)) -> BandGrid {
    match node {
        Node::Number(n) => BandGrid::from_elem(shape, *n),
        // operands were resolved by the caller
        Node::Operand(name) => grids[name.as_str()].to_owned(),
        Node::Negate(inner) => eval(inner, grids, shape).mapv(|v| -v),
        Node::Binary(op, l, r) => {
            let l = eval(l, grids, shape);
            let r = eval(r, grids, shape);
            Zip::from(&l).and(&r).map_collect(|&a, &b| op.apply(a, b))
        }
    }
}

fn scrub_non_finite(grid: &mut BandGrid) {
    grid.mapv_inplace(|v| if v.is_finite() { v } else { NO_DATA });
}

/// Parse and evaluate `expression`, producing a `result` band
pub fn evaluate(expression: &str, bindings: &Bindings<'_>) -> CompositeResult<Tile> {
    Expression::parse(expression)?.evaluate(bindings, DEFAULT_OUTPUT_BAND)
}

/// `(a - b) / (a + b)` over two bands of `tile`, as an `nd` band.
///
/// Same f32 arithmetic and zero-division policy as [`evaluate`] on
/// `(A - B) / (A + B)`.
pub fn normalized_difference(tile: &Tile, band_a: &str, band_b: &str) -> CompositeResult<Tile> {
    let a = tile.band(band_a)?;
    let b = tile.band(band_b)?;

    let mut result = Zip::from(a)
        .and(b)
        .map_collect(|&a, &b| BinaryOp::Div.apply(a - b, a + b));
    scrub_non_finite(&mut result);

    let mut bands = IndexMap::with_capacity(1);
    bands.insert(NORMALIZED_DIFFERENCE_BAND.to_string(), result);
    tile.replace_bands(bands)
}

impl Tile {
    /// Evaluate `expression` with operands bound to bands of this tile,
    /// e.g. `tile.expression("(NIR - RED) / (NIR + RED)", &[("NIR", "B8"), ("RED", "B4")])`
    pub fn expression(&self, expression: &str, operands: &[(&str, &str)]) -> CompositeResult<Tile> {
        let bindings: Bindings = operands
            .iter()
            .map(|&(name, band)| (name.to_string(), BandRef::new(self, band)))
            .collect();
        evaluate(expression, &bindings)
    }

    pub fn normalized_difference(&self, band_a: &str, band_b: &str) -> CompositeResult<Tile> {
        normalized_difference(self, band_a, band_b)
    }
}
