//! The fixed set of pure functions callable from conditions.
//!
//! Names are resolved to a [`Builtin`] when a condition is compiled.
//! There is no way to register more at run time and no fallback to a
//! host evaluator, so a condition can only ever call what is listed here.

use crate::condition::Val;
use actionguard_core::EvaluationError;
use regex_lite::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Maximum nesting scanned by [`contains_pii`] inside JSON values.
const MAX_SCAN_DEPTH: usize = 5;

static PII_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // SSN
        r"\b\d{3}-\d{2}-\d{4}\b",
        // email
        r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
        // card number
        r"\b\d{16}\b",
        // phone
        r"\b\d{3}[-. ]\d{3}[-. ]\d{4}\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

const SENSITIVE_PATHS: &[&str] = &[
    "/etc",
    "/sys",
    "/proc",
    "/boot",
    "/root",
    "/var/log",
    "/usr/sbin",
];

const SENSITIVE_WINDOWS_PATHS: &[&str] = &["c:\\windows\\system32"];

/// Does `text` contain something shaped like personal data?
pub fn contains_pii(text: &str) -> bool {
    PII_PATTERNS.iter().any(|re| re.is_match(text))
}

/// Is `path` inside a system directory?
pub fn is_sensitive_path(path: &str) -> bool {
    let under = |prefix: &str, p: &str| {
        p == prefix
            || p.strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('\\'))
    };
    if SENSITIVE_PATHS.iter().any(|prefix| under(prefix, path)) {
        return true;
    }
    let lower = path.to_ascii_lowercase();
    SENSITIVE_WINDOWS_PATHS
        .iter()
        .any(|prefix| under(prefix, &lower))
}

fn json_contains_pii(value: &serde_json::Value, depth: usize) -> bool {
    if depth > MAX_SCAN_DEPTH {
        return false;
    }
    match value {
        serde_json::Value::String(s) => contains_pii(s),
        serde_json::Value::Number(n) => contains_pii(&n.to_string()),
        serde_json::Value::Array(items) => items.iter().any(|v| json_contains_pii(v, depth + 1)),
        serde_json::Value::Object(map) => map.values().any(|v| json_contains_pii(v, depth + 1)),
        _ => false,
    }
}

/// A registered condition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    ContainsPii,
    IsSensitivePath,
    StartsWith,
    EndsWith,
    Contains,
    Exists,
    Len,
    Lower,
    Upper,
}

pub const BUILTINS: &[Builtin] = &[
    Builtin::ContainsPii,
    Builtin::IsSensitivePath,
    Builtin::StartsWith,
    Builtin::EndsWith,
    Builtin::Contains,
    Builtin::Exists,
    Builtin::Len,
    Builtin::Lower,
    Builtin::Upper,
];

impl Builtin {
    pub fn lookup(name: &str) -> Option<Self> {
        BUILTINS.iter().copied().find(|b| b.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::ContainsPii => "contains_pii",
            Builtin::IsSensitivePath => "is_sensitive_path",
            Builtin::StartsWith => "startswith",
            Builtin::EndsWith => "endswith",
            Builtin::Contains => "contains",
            Builtin::Exists => "exists",
            Builtin::Len => "len",
            Builtin::Lower => "lower",
            Builtin::Upper => "upper",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::StartsWith | Builtin::EndsWith | Builtin::Contains => 2,
            _ => 1,
        }
    }

    pub(crate) fn call<'a>(self, args: Vec<Val<'a>>) -> Result<Val<'a>, EvaluationError> {
        if args.len() != self.arity() {
            return Err(EvaluationError::Arity {
                name: self.name().into(),
                expected: self.arity(),
                got: args.len(),
            });
        }
        let mut args = args.into_iter();
        let first = args.next().unwrap_or(Val::Absent);
        let second = args.next().unwrap_or(Val::Absent);

        match self {
            Builtin::Exists => Ok(Val::Bool(!matches!(first, Val::Absent))),
            Builtin::ContainsPii => Ok(Val::Bool(match &first {
                Val::Str(s) => contains_pii(s),
                Val::Num(n) => contains_pii(&n.to_string()),
                Val::Json(v) => json_contains_pii(v, 0),
                _ => false,
            })),
            Builtin::IsSensitivePath => Ok(Val::Bool(match &first {
                Val::Str(s) => is_sensitive_path(s),
                _ => false,
            })),
            Builtin::StartsWith | Builtin::EndsWith => {
                let (haystack, needle) = match (&first, &second) {
                    (Val::Absent | Val::Null, _) | (_, Val::Absent | Val::Null) => {
                        return Ok(Val::Bool(false));
                    }
                    (Val::Str(h), Val::Str(n)) => (h, n),
                    (l, r) => return Err(mismatch(self.name(), l, r)),
                };
                Ok(Val::Bool(if self == Builtin::StartsWith {
                    haystack.starts_with(&**needle)
                } else {
                    haystack.ends_with(&**needle)
                }))
            }
            Builtin::Contains => match (&first, &second) {
                (Val::Absent | Val::Null, _) | (_, Val::Absent) => Ok(Val::Bool(false)),
                (Val::Str(h), Val::Str(n)) => Ok(Val::Bool(h.contains(&**n))),
                (Val::Json(serde_json::Value::Array(items)), needle) => {
                    Ok(Val::Bool(items.iter().any(|item| Val::from(item).loose_eq(needle))))
                }
                (Val::Json(serde_json::Value::Object(map)), Val::Str(key)) => {
                    Ok(Val::Bool(map.contains_key(&**key)))
                }
                (l, r) => Err(mismatch(self.name(), l, r)),
            },
            Builtin::Len => match &first {
                Val::Absent | Val::Null => Ok(Val::Absent),
                Val::Str(s) => Ok(Val::Num(s.chars().count() as f64)),
                Val::Json(serde_json::Value::Array(items)) => Ok(Val::Num(items.len() as f64)),
                Val::Json(serde_json::Value::Object(map)) => Ok(Val::Num(map.len() as f64)),
                other => Err(mismatch(self.name(), other, &Val::Absent)),
            },
            Builtin::Lower | Builtin::Upper => match first {
                Val::Absent | Val::Null => Ok(Val::Absent),
                Val::Str(s) => Ok(Val::Str(Cow::Owned(if self == Builtin::Lower {
                    s.to_lowercase()
                } else {
                    s.to_uppercase()
                }))),
                other => Err(mismatch(self.name(), &other, &Val::Absent)),
            },
        }
    }
}

fn mismatch(name: &str, left: &Val<'_>, right: &Val<'_>) -> EvaluationError {
    EvaluationError::TypeMismatch {
        op: name.to_string(),
        left: left.type_name().into(),
        right: right.type_name().into(),
    }
}
