//! Sandboxed evaluation of parsed rule expressions.
//!
//! Evaluation only sees the variables bound in [`Scope`]. The single route out to
//! data is the `root` accessor (and `data` when the caller did not pass the value),
//! which reads through [`TreeReader`]. Every step draws from a fixed budget.
//! Any failure is returned as an [`EvalError`]; the rule engine turns it into a deny.

use std::borrow::Cow;

use serde_json::{Number, Value};
use thiserror::Error;

use super::expr::{BinaryOp, Expr, LogicalOp, UnaryOp};
use crate::paths::{split_path, Bindings};
use crate::storage::TreeReader;

/// Evaluation steps allowed per rule check.
pub const STEP_BUDGET: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("'{0}' is not defined")]
    Undefined(String),
    #[error("cannot read property '{0}' of null")]
    NullAccess(String),
    #[error("'{0}' is not a function")]
    UnknownMethod(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("evaluation budget exhausted")]
    Budget,
}

/// Variables visible to an expression.
pub struct Scope<'a> {
    /// `null` for anonymous requests, otherwise `{uid, ...claims}`.
    pub auth: &'a Value,
    /// Pre-mutation value at the path; `None` means "read lazily through `root`".
    pub data: Option<&'a Value>,
    pub new_data: &'a Value,
    pub root: Option<&'a dyn TreeReader>,
    pub path: &'a [String],
    pub now: i64,
    pub context: &'a Value,
    pub bindings: &'a Bindings,
}

#[derive(Debug, Clone)]
enum Val<'a> {
    Json(Cow<'a, Value>),
    /// Lazy reference to a tree node, resolved on first use as a value.
    Node(Vec<String>),
}

static NULL: Value = Value::Null;

fn owned<'a>(v: Value) -> Val<'a> { Val::Json(Cow::Owned(v)) }

fn num<'a>(n: f64) -> Result<Val<'a>, EvalError> {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Ok(owned(Value::Number(Number::from(n as i64))));
    }
    Number::from_f64(n).map(|n| owned(Value::Number(n))).ok_or_else(|| EvalError::Type("non-finite number".into()))
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "null".into(),
        other => other.to_string(),
    }
}

fn key_of(v: &Value) -> Result<String, EvalError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(match n.as_i64() { Some(i) => i.to_string(), None => n.to_string() }),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(EvalError::Type("property key must be a string or number".into())),
    }
}

struct Evaluator<'s, 'a> {
    scope: &'s Scope<'a>,
    steps: usize,
}

impl<'s, 'a> Evaluator<'s, 'a> {
    fn tick(&mut self) -> Result<(), EvalError> {
        if self.steps == 0 { return Err(EvalError::Budget); }
        self.steps -= 1;
        Ok(())
    }

    fn resolve(&mut self, v: Val<'a>) -> Result<Cow<'a, Value>, EvalError> {
        match v {
            Val::Json(j) => Ok(j),
            Val::Node(segs) => {
                self.tick()?;
                let reader = self.scope.root.ok_or_else(|| EvalError::Undefined("root".into()))?;
                Ok(Cow::Owned(reader.read(&segs)))
            }
        }
    }

    fn eval(&mut self, e: &Expr) -> Result<Val<'a>, EvalError> {
        self.tick()?;
        match e {
            Expr::Null => Ok(Val::Json(Cow::Borrowed(&NULL))),
            Expr::Bool(b) => Ok(owned(Value::Bool(*b))),
            Expr::Num(n) => num(*n),
            Expr::Str(s) => Ok(owned(Value::String(s.clone()))),
            Expr::Ident(name) => self.ident(name),
            Expr::Member(target, prop) => {
                let t = self.eval(target)?;
                self.member(t, prop)
            }
            Expr::Index(target, idx) => {
                let t = self.eval(target)?;
                let i = self.eval(idx)?;
                let key = key_of(&*self.resolve(i)?)?;
                self.member(t, &key)
            }
            Expr::Call { target, method, args } => {
                let t = self.eval(target)?;
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    let v = self.eval(a)?;
                    vals.push(self.resolve(v)?);
                }
                self.call(t, method, vals)
            }
            Expr::Unary(op, inner) => {
                let v = self.eval(inner)?;
                let v = self.resolve(v)?;
                match op {
                    UnaryOp::Not => Ok(owned(Value::Bool(!truthy(&v)))),
                    UnaryOp::Neg => match v.as_f64() {
                        Some(n) if v.is_number() => num(-n),
                        _ => Err(EvalError::Type("unary '-' expects a number".into())),
                    },
                }
            }
            Expr::Logical(op, l, r) => {
                let lv = self.eval(l)?;
                let lv = self.resolve(lv)?;
                let short = match op { LogicalOp::And => !truthy(&lv), LogicalOp::Or => truthy(&lv) };
                if short { return Ok(Val::Json(lv)); }
                self.eval(r)
            }
            Expr::Cond(c, a, b) => {
                let cv = self.eval(c)?;
                if truthy(&*self.resolve(cv)?) { self.eval(a) } else { self.eval(b) }
            }
            Expr::Binary(op, l, r) => {
                let lv = self.eval(l)?;
                let lv = self.resolve(lv)?;
                let rv = self.eval(r)?;
                let rv = self.resolve(rv)?;
                binary(*op, &lv, &rv)
            }
        }
    }

    fn ident(&mut self, name: &str) -> Result<Val<'a>, EvalError> {
        let s = self.scope;
        match name {
            "auth" => Ok(Val::Json(Cow::Borrowed(s.auth))),
            "newData" => Ok(Val::Json(Cow::Borrowed(s.new_data))),
            "context" => Ok(Val::Json(Cow::Borrowed(s.context))),
            "now" => Ok(owned(Value::Number(Number::from(s.now)))),
            "root" => match s.root {
                Some(_) => Ok(Val::Node(Vec::new())),
                None => Err(EvalError::Undefined("root".into())),
            },
            "data" => match (s.data, s.root) {
                (Some(v), _) => Ok(Val::Json(Cow::Borrowed(v))),
                (None, Some(_)) => Ok(Val::Node(s.path.to_vec())),
                (None, None) => Ok(Val::Json(Cow::Borrowed(&NULL))),
            },
            var if var.starts_with('$') => s
                .bindings
                .iter()
                .rev()
                .find(|(k, _)| k == var)
                .map(|(_, v)| owned(Value::String(v.clone())))
                .ok_or_else(|| EvalError::Undefined(var.to_string())),
            other => Err(EvalError::Undefined(other.to_string())),
        }
    }

    fn member(&mut self, target: Val<'a>, prop: &str) -> Result<Val<'a>, EvalError> {
        match target {
            Val::Node(mut segs) => {
                if prop == "length" {
                    let v = self.resolve(Val::Node(segs.clone()))?;
                    match &*v {
                        Value::String(s) => return num(s.chars().count() as f64),
                        Value::Array(a) => return num(a.len() as f64),
                        _ => {}
                    }
                }
                segs.push(prop.to_string());
                Ok(Val::Node(segs))
            }
            Val::Json(Cow::Borrowed(v)) => json_member(v, prop).map(|r| match r {
                Member::Child(c) => Val::Json(Cow::Borrowed(c)),
                Member::Computed(c) => owned(c),
            }),
            Val::Json(Cow::Owned(v)) => json_member(&v, prop).map(|r| match r {
                Member::Child(c) => owned(c.clone()),
                Member::Computed(c) => owned(c),
            }),
        }
    }

    fn call(&mut self, target: Val<'a>, method: &str, args: Vec<Cow<'a, Value>>) -> Result<Val<'a>, EvalError> {
        if let Val::Node(segs) = &target {
            match method {
                "child" => {
                    let Some(Value::String(p)) = args.first().map(|a| &**a) else {
                        return Err(EvalError::Type("child() expects a path string".into()));
                    };
                    let mut out = segs.clone();
                    out.extend(split_path(p));
                    return Ok(Val::Node(out));
                }
                "exists" => {
                    let v = self.resolve(target)?;
                    return Ok(owned(Value::Bool(!v.is_null())));
                }
                _ => {}
            }
        }
        let v = self.resolve(target)?;
        if method == "val" { return Ok(Val::Json(v)); }
        let arg = |i: usize| args.get(i).map(|a| &**a).unwrap_or(&NULL);
        let str_arg = |i: usize| match arg(i) {
            Value::String(s) => Ok(s.as_str()),
            _ => Err(EvalError::Type(format!("{}() expects a string argument", method))),
        };
        match (&*v, method) {
            (Value::Null, "exists") => Ok(owned(Value::Bool(false))),
            (_, "exists") => Ok(owned(Value::Bool(true))),
            (Value::Null, m) => Err(EvalError::NullAccess(m.to_string())),
            (Value::Object(_), "child") => {
                let mut cur: &Value = &v;
                for seg in split_path(str_arg(0)?) {
                    cur = match cur.get(seg.as_str()) { Some(c) => c, None => return Ok(owned(Value::Null)) };
                }
                Ok(owned(cur.clone()))
            }
            (Value::Object(m), "hasChild") => Ok(owned(Value::Bool(m.contains_key(str_arg(0)?)))),
            (Value::String(s), "includes") => Ok(owned(Value::Bool(s.contains(str_arg(0)?)))),
            (Value::Array(a), "includes") => Ok(owned(Value::Bool(a.iter().any(|x| json_eq(x, arg(0)))))),
            (Value::String(s), "startsWith") => Ok(owned(Value::Bool(s.starts_with(str_arg(0)?)))),
            (Value::String(s), "endsWith") => Ok(owned(Value::Bool(s.ends_with(str_arg(0)?)))),
            (Value::String(s), "toLowerCase") => Ok(owned(Value::String(s.to_lowercase()))),
            (Value::String(s), "toUpperCase") => Ok(owned(Value::String(s.to_uppercase()))),
            (_, m) => Err(EvalError::UnknownMethod(m.to_string())),
        }
    }
}

enum Member<'v> {
    Child(&'v Value),
    Computed(Value),
}

fn json_member<'v>(v: &'v Value, prop: &str) -> Result<Member<'v>, EvalError> {
    match v {
        Value::Null => Err(EvalError::NullAccess(prop.to_string())),
        Value::Object(m) => Ok(m.get(prop).map(Member::Child).unwrap_or(Member::Computed(Value::Null))),
        Value::Array(a) => {
            if prop == "length" { return Ok(Member::Computed(Value::Number(Number::from(a.len())))); }
            Ok(prop.parse::<usize>().ok().and_then(|i| a.get(i)).map(Member::Child).unwrap_or(Member::Computed(Value::Null)))
        }
        Value::String(s) if prop == "length" => Ok(Member::Computed(Value::Number(Number::from(s.chars().count())))),
        _ => Ok(Member::Computed(Value::Null)),
    }
}

fn binary<'a>(op: BinaryOp, l: &Value, r: &Value) -> Result<Val<'a>, EvalError> {
    let nums = || match (l, r) {
        (Value::Number(a), Value::Number(b)) => Some((a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN))),
        _ => None,
    };
    match op {
        BinaryOp::Eq => Ok(owned(Value::Bool(json_eq(l, r)))),
        BinaryOp::Ne => Ok(owned(Value::Bool(!json_eq(l, r)))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = match (l, r) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => nums().and_then(|(a, b)| a.partial_cmp(&b)),
            };
            let Some(ord) = ord else {
                return Err(EvalError::Type("comparison expects two numbers or two strings".into()));
            };
            let res = match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            Ok(owned(Value::Bool(res)))
        }
        BinaryOp::Add => {
            if l.is_string() || r.is_string() {
                return Ok(owned(Value::String(format!("{}{}", display(l), display(r)))));
            }
            let (a, b) = nums().ok_or_else(|| EvalError::Type("'+' expects numbers or strings".into()))?;
            num(a + b)
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (a, b) = nums().ok_or_else(|| EvalError::Type("arithmetic expects numbers".into()))?;
            num(match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            })
        }
    }
}

/// Evaluate `expr` and report whether the result is truthy.
pub fn evaluate_bool(expr: &Expr, scope: &Scope<'_>) -> Result<bool, EvalError> {
    evaluate_with_budget(expr, scope, STEP_BUDGET)
}

pub(crate) fn evaluate_with_budget(expr: &Expr, scope: &Scope<'_>, budget: usize) -> Result<bool, EvalError> {
    let mut ev = Evaluator { scope, steps: budget };
    let v = ev.eval(expr)?;
    let v = ev.resolve(v)?;
    Ok(truthy(&v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::expr::parse;
    use serde_json::json;

    struct FixedTree(Value);

    impl TreeReader for FixedTree {
        fn read(&self, segments: &[String]) -> Value {
            let mut cur = &self.0;
            for s in segments {
                match cur.get(s) { Some(c) => cur = c, None => return Value::Null }
            }
            cur.clone()
        }
    }

    fn run(src: &str, auth: Value, data: Option<&Value>, tree: Option<&FixedTree>) -> Result<bool, EvalError> {
        let expr = parse(src).unwrap();
        let bindings: Bindings = vec![("$uid".into(), "u1".into())];
        let path = vec!["users".to_string(), "u1".to_string()];
        let new_data = json!({"name": "ann"});
        let ctx = json!({"intent": "sync"});
        let scope = Scope {
            auth: &auth,
            data,
            new_data: &new_data,
            root: tree.map(|t| t as &dyn TreeReader),
            path: &path,
            now: 1_000,
            context: &ctx,
            bindings: &bindings,
        };
        evaluate_bool(&expr, &scope)
    }

    #[test]
    fn auth_and_bindings() {
        assert_eq!(run("auth !== null", json!({"uid": "u1"}), None, None), Ok(true));
        assert_eq!(run("auth !== null", Value::Null, None, None), Ok(false));
        assert_eq!(run("auth.uid === $uid", json!({"uid": "u1"}), None, None), Ok(true));
        assert_eq!(run("auth.uid === $uid", json!({"uid": "u2"}), None, None), Ok(false));
    }

    #[test]
    fn member_access_on_null_auth_fails() {
        assert_eq!(run("auth.uid === 'x'", Value::Null, None, None), Err(EvalError::NullAccess("uid".into())));
        // Guarded access short-circuits
        assert_eq!(run("auth !== null && auth.uid === 'x'", Value::Null, None, None), Ok(false));
    }

    #[test]
    fn undefined_variables_fail() {
        assert_eq!(run("process.exit", Value::Null, None, None), Err(EvalError::Undefined("process".into())));
        assert_eq!(run("$room === 'a'", Value::Null, None, None), Err(EvalError::Undefined("$room".into())));
        assert_eq!(run("root.x", Value::Null, None, None), Err(EvalError::Undefined("root".into())));
    }

    #[test]
    fn data_new_data_now_and_context() {
        let data = json!({"owner": "u1", "created": 400});
        assert_eq!(run("data.owner === 'u1' && newData.name.length === 3", Value::Null, Some(&data), None), Ok(true));
        assert_eq!(run("now - data.created >= 600", Value::Null, Some(&data), None), Ok(true));
        assert_eq!(run("context.intent === 'sync'", Value::Null, None, None), Ok(true));
        assert_eq!(run("data.missing === null", Value::Null, Some(&data), None), Ok(true));
    }

    #[test]
    fn root_reads_lazily() {
        let tree = FixedTree(json!({"admins": {"u1": true}, "users": {"u1": {"name": "ann"}}}));
        assert_eq!(run("root.admins[auth.uid] === true", json!({"uid": "u1"}), None, Some(&tree)), Ok(true));
        assert_eq!(run("root.admins[auth.uid] === true", json!({"uid": "u9"}), None, Some(&tree)), Ok(false));
        assert_eq!(run("root.child('users/u1/name').val() === 'ann'", Value::Null, None, Some(&tree)), Ok(true));
        assert_eq!(run("root.users.u2.exists()", Value::Null, None, Some(&tree)), Ok(false));
        // `data` falls back to the node at the path
        assert_eq!(run("data.name.length === 3", Value::Null, None, Some(&tree)), Ok(true));
    }

    #[test]
    fn methods_and_type_errors() {
        let data = json!({"tags": ["a", "b"], "title": "Hello"});
        assert_eq!(run("data.tags.includes('b')", Value::Null, Some(&data), None), Ok(true));
        assert_eq!(run("data.title.toLowerCase().startsWith('he')", Value::Null, Some(&data), None), Ok(true));
        assert_eq!(run("data.title.eval('x')", Value::Null, Some(&data), None), Err(EvalError::UnknownMethod("eval".into())));
        assert!(matches!(run("data.title < 3", Value::Null, Some(&data), None), Err(EvalError::Type(_))));
        assert!(matches!(run("1 / 0 > 1", Value::Null, None, None), Err(EvalError::Type(_))));
    }

    #[test]
    fn arithmetic_and_concat() {
        assert_eq!(run("1 + 2 * 3 === 7", Value::Null, None, None), Ok(true));
        assert_eq!(run("'a' + 1 === 'a1'", Value::Null, None, None), Ok(true));
        assert_eq!(run("7 % 4 === 3 && -2 < 0", Value::Null, None, None), Ok(true));
        assert_eq!(run("1 === 1.0", Value::Null, None, None), Ok(true));
    }

    #[test]
    fn ternary_and_computed_members() {
        let data = json!({"owner": "u1", "roles": {"u1": "editor"}});
        assert_eq!(run("data.owner === auth.uid ? true : false", json!({"uid": "u1"}), Some(&data), None), Ok(true));
        assert_eq!(run("auth === null ? true : data.roles[data.owner] === 'viewer'", json!({"uid": "u2"}), Some(&data), None), Ok(false));
        assert_eq!(run("data['owner'] === $uid", Value::Null, Some(&data), None), Ok(true));
    }

    #[test]
    fn truthiness_of_results() {
        assert_eq!(run("'x'", Value::Null, None, None), Ok(true));
        assert_eq!(run("''", Value::Null, None, None), Ok(false));
        assert_eq!(run("0", Value::Null, None, None), Ok(false));
        assert_eq!(run("auth", json!({"uid": "u"}), None, None), Ok(true));
    }

    #[test]
    fn budget_is_enforced() {
        let e = parse("1 + 2 + 3 === 6").unwrap();
        let auth = Value::Null;
        let bindings: Bindings = Vec::new();
        let scope = Scope { auth: &auth, data: None, new_data: &NULL, root: None, path: &[], now: 0, context: &NULL, bindings: &bindings };
        assert_eq!(evaluate_with_budget(&e, &scope, 3), Err(EvalError::Budget));
        assert_eq!(evaluate_bool(&e, &scope), Ok(true));
    }
}
