//! ABI signature strings.
//!
//! A signature is one character per slot, return kind first:
//!
//! | char | kind                    | wasm type |
//! |------|-------------------------|-----------|
//! | `v`  | void (return only)      |           |
//! | `b`  | bool                    | i32       |
//! | `i`  | i32                     | i32       |
//! | `u`  | u32                     | i32       |
//! | `I`  | i64                     | i64       |
//! | `U`  | u64                     | i64       |
//! | `f`  | f32                     | f32       |
//! | `d`  | f64                     | f64       |
//! | `e`  | object handle           | i64       |
//! | `s`  | string pointer          | i32       |
//! | `x`  | opaque pointer-sized    | i64       |
//! | `*`  | pointer                 | i32       |
//! | `l`  | packed value list       | i32       |
//! | `c`  | callable hash pointer   | i32       |
//!
//! `"be"` takes a handle and returns a bool; `"vs*i"` returns nothing.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use wasmtime::{Engine, FuncType, ValType};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Empty signature")]
    Empty,

    #[error("Unknown kind '{kind}' at position {position}")]
    UnknownKind { kind: char, position: usize },

    #[error("Void is only valid as a return kind (position {0})")]
    VoidParameter(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Bool,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Handle,
    String,
    Opaque,
    Pointer,
    List,
    Callable,
}

impl Kind {
    pub fn from_code(code: char) -> Option<Kind> {
        Some(match code {
            'b' => Kind::Bool,
            'i' => Kind::I32,
            'u' => Kind::U32,
            'I' => Kind::I64,
            'U' => Kind::U64,
            'f' => Kind::F32,
            'd' => Kind::F64,
            'e' => Kind::Handle,
            's' => Kind::String,
            'x' => Kind::Opaque,
            '*' => Kind::Pointer,
            'l' => Kind::List,
            'c' => Kind::Callable,
            _ => return None,
        })
    }

    pub fn code(self) -> char {
        match self {
            Kind::Bool => 'b',
            Kind::I32 => 'i',
            Kind::U32 => 'u',
            Kind::I64 => 'I',
            Kind::U64 => 'U',
            Kind::F32 => 'f',
            Kind::F64 => 'd',
            Kind::Handle => 'e',
            Kind::String => 's',
            Kind::Opaque => 'x',
            Kind::Pointer => '*',
            Kind::List => 'l',
            Kind::Callable => 'c',
        }
    }

    pub fn val_type(self) -> ValType {
        match self {
            Kind::I64 | Kind::U64 | Kind::Handle | Kind::Opaque => ValType::I64,
            Kind::F32 => ValType::F32,
            Kind::F64 => ValType::F64,
            Kind::Bool
            | Kind::I32
            | Kind::U32
            | Kind::String
            | Kind::Pointer
            | Kind::List
            | Kind::Callable => ValType::I32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub ret: Option<Kind>,
    pub params: Vec<Kind>,
}

impl Signature {
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        let mut chars = text.chars().enumerate();
        let (_, first) = chars.next().ok_or(SignatureError::Empty)?;
        let ret = match first {
            'v' => None,
            code => Some(Kind::from_code(code).ok_or(SignatureError::UnknownKind {
                kind: code,
                position: 0,
            })?),
        };
        let params = chars
            .map(|(position, code)| match code {
                'v' => Err(SignatureError::VoidParameter(position)),
                code => Kind::from_code(code).ok_or(SignatureError::UnknownKind {
                    kind: code,
                    position,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ret, params })
    }

    pub fn func_type(&self, engine: &Engine) -> FuncType {
        FuncType::new(
            engine,
            self.params.iter().map(|kind| kind.val_type()),
            self.ret.map(Kind::val_type),
        )
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Signature::parse(s)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ret.map(Kind::code).unwrap_or('v'))?;
        for kind in &self.params {
            write!(f, "{}", kind.code())?;
        }
        Ok(())
    }
}
