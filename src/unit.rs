//! Physical units and quantities.
//!
//! Units are parsed from the generic string format used in ASDF files
//! (`DN / s`, `MJy / sr`, `m s-1`, `deg**2`) into a scale factor over a
//! product of base dimensions. Quantities can only be added or subtracted
//! when their dimensions match.

use std::{collections::BTreeMap, fmt, iter::Peekable, str::Chars};

use crate::{Error, NdArray, Result};

const DEG: f64 = std::f64::consts::PI / 180.0;

/// `(symbol, scale, [(base, power)])`
type Definition = (&'static str, f64, &'static [(&'static str, i32)]);

const UNITS: &[Definition] = &[
    ("m", 1.0, &[("m", 1)]),
    ("km", 1e3, &[("m", 1)]),
    ("cm", 1e-2, &[("m", 1)]),
    ("mm", 1e-3, &[("m", 1)]),
    ("um", 1e-6, &[("m", 1)]),
    ("micron", 1e-6, &[("m", 1)]),
    ("nm", 1e-9, &[("m", 1)]),
    ("Angstrom", 1e-10, &[("m", 1)]),
    ("AA", 1e-10, &[("m", 1)]),
    ("AU", 1.495_978_707e11, &[("m", 1)]),
    ("pc", 3.085_677_581_491_367e16, &[("m", 1)]),
    ("s", 1.0, &[("s", 1)]),
    ("ms", 1e-3, &[("s", 1)]),
    ("us", 1e-6, &[("s", 1)]),
    ("ns", 1e-9, &[("s", 1)]),
    ("min", 60.0, &[("s", 1)]),
    ("h", 3600.0, &[("s", 1)]),
    ("d", 86400.0, &[("s", 1)]),
    ("day", 86400.0, &[("s", 1)]),
    ("yr", 31_557_600.0, &[("s", 1)]),
    ("Hz", 1.0, &[("s", -1)]),
    ("kg", 1.0, &[("kg", 1)]),
    ("g", 1e-3, &[("kg", 1)]),
    ("J", 1.0, &[("kg", 1), ("m", 2), ("s", -2)]),
    ("erg", 1e-7, &[("kg", 1), ("m", 2), ("s", -2)]),
    ("W", 1.0, &[("kg", 1), ("m", 2), ("s", -3)]),
    ("K", 1.0, &[("K", 1)]),
    ("rad", 1.0, &[("rad", 1)]),
    ("deg", DEG, &[("rad", 1)]),
    ("arcmin", DEG / 60.0, &[("rad", 1)]),
    ("arcsec", DEG / 3600.0, &[("rad", 1)]),
    ("mas", DEG / 3.6e6, &[("rad", 1)]),
    ("sr", 1.0, &[("sr", 1)]),
    ("Jy", 1.0, &[("Jy", 1)]),
    ("mJy", 1e-3, &[("Jy", 1)]),
    ("uJy", 1e-6, &[("Jy", 1)]),
    ("nJy", 1e-9, &[("Jy", 1)]),
    ("MJy", 1e6, &[("Jy", 1)]),
    ("DN", 1.0, &[("DN", 1)]),
    ("electron", 1.0, &[("electron", 1)]),
    ("ct", 1.0, &[("count", 1)]),
    ("count", 1.0, &[("count", 1)]),
    ("ph", 1.0, &[("photon", 1)]),
    ("photon", 1.0, &[("photon", 1)]),
    ("pix", 1.0, &[("pix", 1)]),
    ("pixel", 1.0, &[("pix", 1)]),
    ("adu", 1.0, &[("adu", 1)]),
    ("", 1.0, &[]),
    ("dimensionless_unscaled", 1.0, &[]),
];

/// A physical unit: a scale factor times a product of base dimensions.
///
/// Equality compares the meaning, so `DN/s` equals `DN / s`.
#[derive(Debug, Clone)]
pub struct Unit {
    symbol: String,
    scale: f64,
    dims: BTreeMap<String, i32>,
}

impl Unit {
    pub fn parse(s: &str) -> Result<Self> {
        let symbol = s.trim();
        if symbol.is_empty() || symbol == "dimensionless_unscaled" {
            return Ok(Self::dimensionless());
        }
        let normalised = symbol.replace("**", "^");
        let mut parser = Parser {
            chars: normalised.chars().peekable(),
            source: symbol,
        };
        let (scale, dims) = parser.expression()?;
        if let Some(c) = parser.chars.next() {
            return Err(parser.error(&format!("unexpected {c:?}")));
        }
        Ok(Self {
            symbol: symbol.to_owned(),
            scale,
            dims,
        })
    }

    pub fn dimensionless() -> Self {
        Self {
            symbol: String::new(),
            scale: 1.0,
            dims: BTreeMap::new(),
        }
    }

    /// The unit as written.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn is_dimensionless(&self) -> bool {
        self.dims.is_empty()
    }

    /// Whether quantities in the two units can be added.
    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.dims == other.dims
    }

    /// Factor converting a value in `self` into `other`.
    pub fn conversion_factor(&self, other: &Unit) -> Result<f64> {
        if !self.is_compatible(other) {
            return Err(Error::IncompatibleUnits {
                left: self.symbol.clone(),
                right: other.symbol.clone(),
            });
        }
        Ok(self.scale / other.scale)
    }

    pub fn mul(&self, other: &Unit) -> Unit {
        self.combine(other, 1, " ")
    }

    pub fn div(&self, other: &Unit) -> Unit {
        self.combine(other, -1, " / ")
    }

    fn combine(&self, other: &Unit, sign: i32, op: &str) -> Unit {
        let mut dims = self.dims.clone();
        for (base, power) in &other.dims {
            *dims.entry(base.clone()).or_default() += sign * power;
        }
        dims.retain(|_, p| *p != 0);
        let symbol = match (self.symbol.is_empty(), other.symbol.is_empty()) {
            (_, true) => self.symbol.clone(),
            (true, false) if sign > 0 => other.symbol.clone(),
            (true, false) => format!("1{op}{}", wrap(&other.symbol)),
            (false, false) => format!("{}{op}{}", wrap(&self.symbol), wrap(&other.symbol)),
        };
        Unit {
            symbol,
            scale: self.scale * other.scale.powi(sign),
            dims,
        }
    }
}

fn wrap(symbol: &str) -> String {
    if symbol.contains(['/', ' ']) {
        format!("({symbol})")
    } else {
        symbol.to_owned()
    }
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.dims == other.dims && (self.scale - other.scale).abs() <= 1e-12 * self.scale.abs()
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}

impl std::str::FromStr for Unit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

type Dims = BTreeMap<String, i32>;

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
    source: &'a str,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> Error {
        Error::format(format!("cannot parse unit {:?}: {message}", self.source))
    }

    fn skip_ws(&mut self) {
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    /// product (('/' factor) | ('*' | '.' | ' ') factor)*
    fn expression(&mut self) -> Result<(f64, Dims)> {
        let (mut scale, mut dims) = self.factor()?;
        loop {
            self.skip_ws();
            let sign = match self.chars.peek().copied() {
                None | Some(')') => break,
                Some('/') => {
                    self.chars.next();
                    -1
                }
                Some('*') | Some('.') => {
                    self.chars.next();
                    1
                }
                Some(_) => 1,
            };
            let (s, d) = self.factor()?;
            scale *= s.powi(sign);
            for (base, power) in d {
                *dims.entry(base).or_default() += sign * power;
            }
        }
        dims.retain(|_, p| *p != 0);
        Ok((scale, dims))
    }

    fn factor(&mut self) -> Result<(f64, Dims)> {
        self.skip_ws();
        let (scale, dims) = match self.chars.peek().copied() {
            Some('(') => {
                self.chars.next();
                let inner = self.expression()?;
                if self.chars.next() != Some(')') {
                    return Err(self.error("unbalanced parentheses"));
                }
                inner
            }
            Some(c) if c.is_ascii_digit() => {
                let n = self.integer()?;
                if n != 1 {
                    return Err(self.error("numeric scale factors are not supported"));
                }
                (1.0, Dims::new())
            }
            Some(c) if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(c) = self.chars.next_if(|c| c.is_alphabetic() || *c == '_') {
                    word.push(c);
                }
                lookup(&word)
            }
            Some(c) => return Err(self.error(&format!("unexpected {c:?}"))),
            None => return Err(self.error("unexpected end")),
        };
        let power = self.exponent()?;
        let dims = dims.into_iter().map(|(b, p)| (b, p * power)).collect();
        Ok((scale.powi(power), dims))
    }

    /// `^2`, `2`, `-1`, `(-1)` or nothing.
    fn exponent(&mut self) -> Result<i32> {
        let caret = self.chars.next_if_eq(&'^').is_some();
        match self.chars.peek().copied() {
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' => self.integer(),
            Some('(') if caret => {
                self.chars.next();
                let n = self.integer()?;
                if self.chars.next() != Some(')') {
                    return Err(self.error("unbalanced exponent"));
                }
                Ok(n)
            }
            _ if caret => Err(self.error("missing exponent")),
            _ => Ok(1),
        }
    }

    fn integer(&mut self) -> Result<i32> {
        let mut digits = String::new();
        if let Some(sign) = self.chars.next_if(|c| *c == '-' || *c == '+') {
            digits.push(sign);
        }
        while let Some(c) = self.chars.next_if(char::is_ascii_digit) {
            digits.push(c);
        }
        digits
            .parse()
            .map_err(|_| self.error(&format!("invalid exponent {digits:?}")))
    }
}

fn lookup(word: &str) -> (f64, Dims) {
    match UNITS.iter().find(|(symbol, ..)| *symbol == word) {
        Some((_, scale, dims)) => (
            *scale,
            dims.iter().map(|(b, p)| (b.to_string(), *p)).collect(),
        ),
        None => {
            log::debug!("unknown unit {word:?}, treating it as its own dimension");
            (1.0, Dims::from([(word.to_owned(), 1)]))
        }
    }
}

/// The numeric part of a [Quantity].
#[derive(Debug, Clone, PartialEq)]
pub enum Magnitude {
    Scalar(f64),
    Array(NdArray),
}

impl Magnitude {
    fn map(&self, f: impl Fn(f64) -> f64) -> Result<Magnitude> {
        match self {
            Self::Scalar(v) => Ok(Self::Scalar(f(*v))),
            Self::Array(a) => {
                let values: Vec<f64> = a.to_f64_vec()?.into_iter().map(f).collect();
                Ok(Self::Array(NdArray::from_vec(a.shape().to_vec(), values)?))
            }
        }
    }

    fn zip(&self, other: &Magnitude, f: impl Fn(f64, f64) -> f64) -> Result<Magnitude> {
        match (self, other) {
            (Self::Scalar(a), Self::Scalar(b)) => Ok(Self::Scalar(f(*a, *b))),
            (Self::Array(_), Self::Scalar(b)) => self.map(|a| f(a, *b)),
            (Self::Scalar(a), Self::Array(_)) => other.map(|b| f(*a, b)),
            (Self::Array(a), Self::Array(b)) => {
                if a.shape() != b.shape() {
                    return Err(Error::general(format!(
                        "shape mismatch: {:?} and {:?}",
                        a.shape(),
                        b.shape()
                    )));
                }
                let values = a
                    .to_f64_vec()?
                    .into_iter()
                    .zip(b.to_f64_vec()?)
                    .map(|(x, y)| f(x, y))
                    .collect();
                Ok(Self::Array(NdArray::from_vec(a.shape().to_vec(), values)?))
            }
        }
    }
}

/// A value or array paired with a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    pub value: Magnitude,
    pub unit: Unit,
}

impl Quantity {
    pub fn new(value: Magnitude, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn scalar(value: f64, unit: Unit) -> Self {
        Self::new(Magnitude::Scalar(value), unit)
    }

    /// Express in another, compatible unit.
    pub fn to(&self, unit: &Unit) -> Result<Quantity> {
        let factor = self.unit.conversion_factor(unit)?;
        Ok(Self::new(self.value.map(|v| v * factor)?, unit.clone()))
    }

    /// Sum in the units of `self`.
    pub fn try_add(&self, other: &Quantity) -> Result<Quantity> {
        let other = other.to(&self.unit)?;
        Ok(Self::new(
            self.value.zip(&other.value, |a, b| a + b)?,
            self.unit.clone(),
        ))
    }

    /// Difference in the units of `self`.
    pub fn try_sub(&self, other: &Quantity) -> Result<Quantity> {
        let other = other.to(&self.unit)?;
        Ok(Self::new(
            self.value.zip(&other.value, |a, b| a - b)?,
            self.unit.clone(),
        ))
    }

    pub fn try_mul(&self, other: &Quantity) -> Result<Quantity> {
        Ok(Self::new(
            self.value.zip(&other.value, |a, b| a * b)?,
            self.unit.mul(&other.unit),
        ))
    }

    pub fn try_div(&self, other: &Quantity) -> Result<Quantity> {
        Ok(Self::new(
            self.value.zip(&other.value, |a, b| a / b)?,
            self.unit.div(&other.unit),
        ))
    }

    /// The scalar value, if this is not an array quantity.
    pub fn as_f64(&self) -> Option<f64> {
        match self.value {
            Magnitude::Scalar(v) => Some(v),
            Magnitude::Array(_) => None,
        }
    }
}
